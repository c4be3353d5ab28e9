mod build;
mod config;

use crate::conf::{self, LogFormat};
use crate::object_store::{self, ObjectStore};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser, Clone)]
#[clap(name = "cos_gpu")]
#[clap(about = "Precompiles NVIDIA GPU drivers for Container-Optimized OS kernels.")]
#[clap(
    long_about = "Precompiles NVIDIA GPU drivers for Container-Optimized OS kernels.\n\n Build configs
    describing a kernel and driver pairing are generated into object storage. The builder later picks up
    recent configs, compiles a custom driver package for each one and publishes it next to the public
    driver packages."
)]
#[clap(version = env!("BUILD_SEMVER"))]
#[clap(long_version = concat!(env!("BUILD_SEMVER"), " (", env!("BUILD_COMMIT"), ")"))]
struct Args {
    /// Set configuration path; if empty default paths are used
    #[clap(long, value_name = "PATH")]
    config_path: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand, Clone)]
enum Commands {
    /// Generate, list and inspect build configs.
    Config(config::ConfigSubcommands),

    /// Build and publish drivers for recently generated configs.
    Build(build::BuildSubcommands),
}

#[derive(Debug)]
pub struct Cli {
    args: Args,
    conf: conf::Config,
}

impl Cli {
    pub fn new() -> Result<Self> {
        let args = Args::parse();
        let conf = conf::Config::parse(&args.config_path).context("Could not load configuration")?;

        Ok(Cli { args, conf })
    }

    pub async fn run(&mut self) -> Result<()> {
        init_logging(&self.conf.general)?;

        match self.args.command.clone() {
            Commands::Config(config) => self.handle_config_subcommands(config).await,
            Commands::Build(build) => self.handle_build_subcommands(build).await,
        }
    }

    fn object_store(&self) -> Result<Arc<dyn ObjectStore>> {
        object_store::new(&self.conf.object_store).context("Could not initialize object store")
    }
}

/// Logs go to stderr so command output on stdout stays clean. `RUST_LOG` overrides the configured
/// level.
fn init_logging(general: &conf::General) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&general.log_level)
            .with_context(|| format!("Invalid log level '{}'", general.log_level))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match general.log_format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow!("Could not initialize logging; {e}"))
}
