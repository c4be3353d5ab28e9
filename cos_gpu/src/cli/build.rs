use crate::builder::installer::NvidiaInstaller;
use crate::builder::{self, BatchReport, Builder, Outcome};
use crate::cli::Cli;
use crate::download::HttpDownloader;
use crate::gpuconfig::artifacts::{ArtifactError, ArtifactResolver, ArtifactsDownloader};
use crate::gpuconfig::store::ConfigStore;
use crate::gpuconfig::ClassFilter;
use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use comfy_table::{presets::ASCII_MARKDOWN, Cell, CellAlignment, Color, ContentArrangement};
use polyfmt::{println, success};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Args, Clone)]
pub struct BuildSubcommands {
    #[clap(subcommand)]
    pub command: BuildCommands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum BuildCommands {
    /// Build and publish drivers for every config created within the lookback window.
    ///
    /// Configs whose driver package is already published are skipped, so running this
    /// repeatedly is safe.
    Process {
        /// Bucket to read configs from; defaults to the configured build bucket.
        #[arg(long)]
        bucket: Option<String>,

        /// How many days back to look for configs.
        #[arg(long)]
        lookback_days: Option<u32>,

        /// Only build configs of this kind: kernel, image or both.
        #[arg(long)]
        version_type: Option<ClassFilter>,

        /// Compile everything but do not upload the driver packages.
        #[arg(long)]
        dry_run: bool,
    },

    /// Download every artifact a single config names into a local directory.
    ///
    /// Useful for reproducing a failed build by hand.
    Fetch {
        /// Config location as a full uri, example: gs://cos-gpu-configs/2022-10-10T08:00:00-1a2b3c4d
        /// or as a bare prefix inside the bucket.
        location: String,

        /// Bucket holding a bare prefix; defaults to the configured build bucket.
        #[arg(long)]
        bucket: Option<String>,

        /// Directory to download into; created if missing.
        #[arg(long)]
        dest: PathBuf,
    },
}

impl Cli {
    pub async fn handle_build_subcommands(&self, command: BuildSubcommands) -> Result<()> {
        let cmds = command.command;
        match cmds {
            BuildCommands::Process {
                bucket,
                lookback_days,
                version_type,
                dry_run,
            } => {
                self.build_process(bucket, lookback_days, version_type, dry_run)
                    .await
            }
            BuildCommands::Fetch {
                location,
                bucket,
                dest,
            } => self.build_fetch(&location, bucket, dest).await,
        }
    }
}

impl Cli {
    pub async fn build_process(
        &self,
        bucket: Option<String>,
        lookback_days: Option<u32>,
        version_type: Option<ClassFilter>,
        dry_run: bool,
    ) -> Result<()> {
        let build_conf = &self.conf.build;
        let bucket = bucket.unwrap_or_else(|| build_conf.bucket.clone());
        let lookback_days = lookback_days.unwrap_or(build_conf.lookback_days);
        let version_type = version_type.unwrap_or(build_conf.version_type);

        let store = self.object_store()?;

        let records = ConfigStore::new(store.clone())
            .list(&bucket, lookback_days, version_type)
            .await
            .context("Could not list gpu configs to build")?;

        if records.is_empty() {
            success!(
                "No gpu configs found in '{}' within the last {} day(s)",
                bucket,
                lookback_days
            );
            return Ok(());
        }

        let resolver = ArtifactResolver::new(
            store.clone(),
            Arc::new(HttpDownloader::new(build_conf.download_retries)),
        );

        let builder = Builder::new(
            store,
            resolver,
            Arc::new(NvidiaInstaller::new()),
            builder::Config {
                work_root: build_conf.work_root.clone(),
                parallelism: build_conf.parallelism,
            },
        );

        let cancel = CancellationToken::new();
        watch_for_cancellation(cancel.clone(), build_conf.timeout_secs);

        let report = builder.process(records, dry_run, cancel.clone()).await;
        cancel.cancel();

        print_report(&report);

        if report.interrupted() > 0 {
            bail!(
                "Build was cancelled; {} gpu config(s) were not attempted",
                report.interrupted()
            );
        }

        if report.failed() > 0 {
            bail!("{} gpu driver build(s) failed", report.failed());
        }

        success!(
            "Successfully processed {} gpu config(s); {} built, {} already published",
            report.records.len(),
            report.succeeded(),
            report.skipped()
        );
        Ok(())
    }

    pub async fn build_fetch(
        &self,
        location: &str,
        bucket: Option<String>,
        dest: PathBuf,
    ) -> Result<()> {
        let store = self.object_store()?;
        let configs = ConfigStore::new(store.clone());

        let record = if location.contains("://") {
            if bucket.is_some() {
                bail!("--bucket can only be used with a bare config prefix");
            }
            configs.read_uri(location).await
        } else {
            let bucket = bucket.unwrap_or_else(|| self.conf.build.bucket.clone());
            configs.read(&bucket, location).await
        }
        .context("Could not read gpu config")?;

        tokio::fs::create_dir_all(&dest)
            .await
            .with_context(|| format!("Could not create directory '{}'", dest.display()))?;

        let resolver = ArtifactResolver::new(
            store,
            Arc::new(HttpDownloader::new(self.conf.build.download_retries)),
        );

        let cancel = CancellationToken::new();
        watch_for_cancellation(cancel.clone(), 0);

        let downloader = ArtifactsDownloader::new(&resolver, &record.build_request, &cancel);
        let result = async {
            let kernel_src = downloader.kernel_src(&dest).await?;
            let kernel_headers = downloader.kernel_headers(&dest).await?;
            let toolchain = downloader.toolchain(&dest).await?;
            let toolchain_env = downloader.toolchain_env(&dest).await?;
            let runfile = dest.join(downloader.nvidia_runfile(&dest).await?);
            Ok::<_, ArtifactError>(vec![
                kernel_src,
                kernel_headers,
                toolchain,
                toolchain_env,
                runfile,
            ])
        }
        .await;
        cancel.cancel();

        let paths = result.context("Could not download build artifacts")?;
        for path in &paths {
            println!("{}", path.display());
        }

        success!(
            "Downloaded {} artifact(s) for {} driver {}",
            paths.len(),
            record.version,
            record.driver_version
        );
        Ok(())
    }
}

/// Cancels `cancel` on ctrl-c, or once `timeout_secs` have passed when it is non-zero. The watcher
/// exits when `cancel` is cancelled by anyone else.
fn watch_for_cancellation(cancel: CancellationToken, timeout_secs: u64) {
    tokio::spawn(async move {
        let deadline = async {
            if timeout_secs == 0 {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(Duration::from_secs(timeout_secs)).await
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Received interrupt; cancelling remaining builds");
                cancel.cancel();
            }
            _ = deadline => {
                warn!(timeout_secs, "Build deadline reached; cancelling remaining builds");
                cancel.cancel();
            }
        }
    });
}

fn print_report(report: &BatchReport) {
    let mut table = comfy_table::Table::new();
    table
        .load_preset(ASCII_MARKDOWN)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("version")
                .set_alignment(CellAlignment::Center)
                .fg(Color::Blue),
            Cell::new("driver")
                .set_alignment(CellAlignment::Center)
                .fg(Color::Blue),
            Cell::new("outcome")
                .set_alignment(CellAlignment::Center)
                .fg(Color::Blue),
            Cell::new("detail")
                .set_alignment(CellAlignment::Center)
                .fg(Color::Blue),
        ]);

    for record in &report.records {
        let (color, detail) = match &record.outcome {
            Outcome::Succeeded => (Color::Green, record.output_uri.clone()),
            Outcome::Skipped => (Color::Grey, record.output_uri.clone()),
            Outcome::Failed(reason) => (Color::Red, reason.clone()),
            Outcome::Interrupted => (Color::Yellow, String::new()),
        };

        table.add_row(vec![
            Cell::new(&record.version),
            Cell::new(&record.driver_version),
            Cell::new(&record.outcome).fg(color),
            Cell::new(detail),
        ]);
    }

    println!("{}", &table.to_string());
}
