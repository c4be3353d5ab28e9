use crate::cli::Cli;
use crate::gpuconfig::generate::ConfigGenerator;
use crate::gpuconfig::store::ConfigStore;
use crate::gpuconfig::{ClassFilter, ConfigRecord};
use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use comfy_table::{presets::ASCII_MARKDOWN, Cell, CellAlignment, Color, ContentArrangement};
use polyfmt::{println, success};

#[derive(Debug, Args, Clone)]
pub struct ConfigSubcommands {
    #[clap(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum ConfigCommands {
    /// Generate build configs for a kernel CI build and upload them.
    Generate {
        /// Kernel version to build drivers for, example: 5.10.105-23.m97
        #[arg(long)]
        kernel_version: String,

        /// Driver versions to build, comma separated, example: 450.119.04,470.150.03
        #[arg(long, value_delimiter = ',', required = true)]
        driver_versions: Vec<String>,

        /// Bucket to upload configs to; defaults to the configured config bucket.
        #[arg(long)]
        bucket: Option<String>,

        /// Print the generated configs without uploading them.
        #[arg(long)]
        dry_run: bool,
    },

    /// List configs created within the lookback window.
    List {
        /// Bucket to list configs from; defaults to the configured build bucket.
        #[arg(long)]
        bucket: Option<String>,

        /// How many days back to look.
        #[arg(long)]
        lookback_days: Option<u32>,

        /// Only return configs of this kind: kernel, image or both.
        #[arg(long)]
        version_type: Option<ClassFilter>,
    },

    /// Print a single stored config.
    Get {
        /// Config location as a full uri, example: gs://cos-gpu-configs/2022-10-10T08:00:00-1a2b3c4d
        /// or as a bare prefix inside the bucket.
        location: String,

        /// Bucket holding a bare prefix; defaults to the configured build bucket.
        #[arg(long)]
        bucket: Option<String>,
    },
}

impl Cli {
    pub async fn handle_config_subcommands(&self, command: ConfigSubcommands) -> Result<()> {
        let cmds = command.command;
        match cmds {
            ConfigCommands::Generate {
                kernel_version,
                driver_versions,
                bucket,
                dry_run,
            } => {
                self.config_generate(&kernel_version, &driver_versions, bucket, dry_run)
                    .await
            }
            ConfigCommands::List {
                bucket,
                lookback_days,
                version_type,
            } => self.config_list(bucket, lookback_days, version_type).await,
            ConfigCommands::Get { location, bucket } => self.config_get(&location, bucket).await,
        }
    }
}

impl Cli {
    pub async fn config_generate(
        &self,
        kernel_version: &str,
        driver_versions: &[String],
        bucket: Option<String>,
        dry_run: bool,
    ) -> Result<()> {
        let store = self.object_store()?;
        let generator = ConfigGenerator::new(store.clone(), self.conf.generator.paths.clone());

        let records = generator
            .generate_kernel_ci_configs(kernel_version, driver_versions)
            .await
            .context("Could not generate gpu configs")?;

        if dry_run {
            for record in &records {
                print_record(record);
            }
            return Ok(());
        }

        let bucket = bucket.unwrap_or_else(|| self.conf.generator.config_bucket.clone());
        let prefixes = ConfigStore::new(store)
            .persist(&records, &bucket)
            .await
            .context("Could not upload gpu configs")?;

        for prefix in &prefixes {
            println!("{}", prefix);
        }

        success!(
            "Successfully uploaded {} gpu config(s) for kernel '{}'",
            prefixes.len(),
            kernel_version
        );
        Ok(())
    }

    pub async fn config_list(
        &self,
        bucket: Option<String>,
        lookback_days: Option<u32>,
        version_type: Option<ClassFilter>,
    ) -> Result<()> {
        let bucket = bucket.unwrap_or_else(|| self.conf.build.bucket.clone());
        let lookback_days = lookback_days.unwrap_or(self.conf.build.lookback_days);
        let version_type = version_type.unwrap_or(self.conf.build.version_type);

        let records = ConfigStore::new(self.object_store()?)
            .list(&bucket, lookback_days, version_type)
            .await
            .context("Could not list gpu configs")?;

        let mut table = comfy_table::Table::new();
        table
            .load_preset(ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("version")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("type")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("milestone")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("driver")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("output")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
            ]);

        for record in records {
            let output = record.output_driver_uri();
            table.add_row(vec![
                Cell::new(record.version).fg(Color::Green),
                Cell::new(record.version_type),
                Cell::new(record.milestone),
                Cell::new(record.driver_version),
                Cell::new(output),
            ]);
        }

        println!("{}", &table.to_string());
        Ok(())
    }

    pub async fn config_get(&self, location: &str, bucket: Option<String>) -> Result<()> {
        let store = ConfigStore::new(self.object_store()?);

        let record = if location.contains("://") {
            if bucket.is_some() {
                bail!("--bucket can only be used with a bare config prefix");
            }
            store.read_uri(location).await
        } else {
            let bucket = bucket.unwrap_or_else(|| self.conf.build.bucket.clone());
            store.read(&bucket, location).await
        }
        .context("Could not read gpu config")?;

        print_record(&record);
        Ok(())
    }
}

fn print_record(record: &ConfigRecord) {
    let request = &record.build_request;

    println!(
        "[{}] {} driver {} (milestone {})",
        record.version_type, record.version, record.driver_version, record.milestone
    );
    println!("  kernel source:  {}", request.kernel_src_tarball_gcs);
    println!("  kernel headers: {}", request.kernel_headers_tarball_gcs);
    println!("  nvidia runfile: {}", request.nvidia_runfile_address);
    println!("  toolchain:      {}", request.toolchain_tarball_gcs);
    println!("  toolchain env:  {}", request.toolchain_env_gcs);
    println!("  output:         {}", record.output_driver_uri());
}
