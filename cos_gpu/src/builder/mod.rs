//! Turning configs into published custom driver packages.
//!
//! Every record goes through the same steps: check whether its package was already published, fetch
//! its artifacts into a fresh work directory, compile, and upload. A record that fails at any step is
//! reported and the batch moves on; nothing in here returns an error to the caller of
//! [`Builder::process`].

mod command;
pub mod installer;
pub mod toolchain;

#[cfg(test)]
mod tests;

use crate::gpuconfig::artifacts::{ArtifactError, ArtifactResolver, ArtifactsDownloader};
use crate::gpuconfig::ConfigRecord;
use crate::object_store::{ObjectStore, ObjectStoreError, UploadStream};
use async_trait::async_trait;
use futures::StreamExt;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum::Display;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("could not acquire build artifacts; {0}")]
    Acquire(ArtifactError),

    #[error("could not prepare toolchain; {0}")]
    Toolchain(String),

    #[error("could not compile driver; {0}")]
    Compile(String),

    #[error("could not upload driver to '{uri}'; {source}")]
    Publish {
        uri: String,
        #[source]
        source: ObjectStoreError,
    },

    #[error("io error at '{}'; {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("build was cancelled")]
    Cancelled,
}

impl From<ArtifactError> for BuildError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::Cancelled(_) => BuildError::Cancelled,
            err => BuildError::Acquire(err),
        }
    }
}

/// Local paths of a record's fetched artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    /// File name of the NVIDIA run-file inside the work directory.
    pub runfile: String,
    pub toolchain: PathBuf,
    pub kernel_headers: PathBuf,
    pub toolchain_env: PathBuf,
}

/// Produces the custom driver package from a work directory holding a record's artifacts.
#[async_trait]
pub trait DriverCompiler: Debug + Send + Sync + 'static {
    /// Returns the path of the built package, which must be inside `work_dir`.
    async fn compile(
        &self,
        work_dir: &Path,
        artifacts: &Artifacts,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, BuildError>;
}

/// Terminal state of one record in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Outcome {
    Succeeded,
    /// The package was already published.
    Skipped,
    Failed(String),
    /// The batch was cancelled before this record started.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordReport {
    pub version: String,
    pub driver_version: String,
    pub output_uri: String,
    pub outcome: Outcome,
}

/// Per record results of a batch, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub records: Vec<RecordReport>,
}

impl BatchReport {
    fn count(&self, predicate: impl Fn(&Outcome) -> bool) -> usize {
        self.records.iter().filter(|r| predicate(&r.outcome)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| *o == Outcome::Succeeded)
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| *o == Outcome::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed(_)))
    }

    pub fn interrupted(&self) -> usize {
        self.count(|o| *o == Outcome::Interrupted)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Record work directories are created under this directory.
    pub work_root: PathBuf,
    /// How many records are built at the same time.
    pub parallelism: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir(),
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Builder {
    store: Arc<dyn ObjectStore>,
    resolver: ArtifactResolver,
    compiler: Arc<dyn DriverCompiler>,
    config: Config,
}

impl Builder {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        resolver: ArtifactResolver,
        compiler: Arc<dyn DriverCompiler>,
        config: Config,
    ) -> Self {
        Self {
            store,
            resolver,
            compiler,
            config,
        }
    }

    /// Builds every record and reports how each one ended.
    ///
    /// Records already running when `cancel` fires end as failed; records not yet started are
    /// reported as interrupted.
    pub async fn process(
        &self,
        records: Vec<ConfigRecord>,
        dry_run: bool,
        cancel: CancellationToken,
    ) -> BatchReport {
        let parallelism = self.config.parallelism.max(1);
        info!(
            count = records.len(),
            dry_run, parallelism, "Processing gpu driver builds"
        );

        let reports = futures::stream::iter(records.into_iter().map(|record| {
            let builder = self.clone();
            let cancel = cancel.clone();

            async move {
                let mut report = RecordReport {
                    version: record.version.clone(),
                    driver_version: record.driver_version.clone(),
                    output_uri: record.output_driver_uri(),
                    outcome: Outcome::Interrupted,
                };

                if cancel.is_cancelled() {
                    return report;
                }

                // Run on its own task so a panic while building one record is contained.
                let handle = tokio::spawn(async move {
                    builder.process_record(&record, dry_run, &cancel).await
                });

                report.outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(
                            version = report.version,
                            driver_version = report.driver_version,
                            err = %e,
                            "Build task did not complete"
                        );
                        Outcome::Failed(format!("build task did not complete; {e}"))
                    }
                };

                report
            }
        }))
        .buffered(parallelism)
        .collect::<Vec<_>>()
        .await;

        let report = BatchReport { records: reports };

        info!(
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            interrupted = report.interrupted(),
            "Finished processing gpu driver builds"
        );

        report
    }

    #[instrument(
        skip_all,
        fields(version = %record.version, driver_version = %record.driver_version)
    )]
    async fn process_record(
        &self,
        record: &ConfigRecord,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Outcome {
        let output_uri = record.output_driver_uri();

        // A failed check must never stop a build, so errors count as "not built yet".
        match self.store.exists(&output_uri).await {
            Ok(true) => {
                info!(uri = output_uri, "Driver package already exists; skipping");
                return Outcome::Skipped;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(uri = output_uri, err = %e, "Could not check for existing driver package; building anyway");
            }
        }

        match self.build(record, &output_uri, dry_run, cancel).await {
            Ok(()) => Outcome::Succeeded,
            Err(e) => {
                error!(err = %e, "Could not build precompiled driver");
                Outcome::Failed(e.to_string())
            }
        }
    }

    async fn build(
        &self,
        record: &ConfigRecord,
        output_uri: &str,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        std::fs::create_dir_all(&self.config.work_root).map_err(|source| BuildError::Io {
            path: self.config.work_root.clone(),
            source,
        })?;

        // Removed when dropped, which covers every way out of this function.
        let work_dir = tempfile::Builder::new()
            .prefix("cos-gpu-")
            .tempdir_in(&self.config.work_root)
            .map_err(|source| BuildError::Io {
                path: self.config.work_root.clone(),
                source,
            })?;

        debug!(work_dir = %work_dir.path().display(), "Created work directory");

        let downloader = ArtifactsDownloader::new(&self.resolver, &record.build_request, cancel);

        let artifacts = Artifacts {
            runfile: downloader.nvidia_runfile(work_dir.path()).await?,
            toolchain: downloader.toolchain(work_dir.path()).await?,
            kernel_headers: downloader.kernel_headers(work_dir.path()).await?,
            toolchain_env: downloader.toolchain_env(work_dir.path()).await?,
        };

        let package = self
            .compiler
            .compile(work_dir.path(), &artifacts, cancel)
            .await?;

        if dry_run {
            info!(package = %package.display(), "Dry run; not uploading driver package");
            return Ok(());
        }

        self.publish(&package, output_uri).await?;

        info!(uri = output_uri, "Published precompiled driver");
        Ok(())
    }

    async fn publish(&self, package: &Path, output_uri: &str) -> Result<(), BuildError> {
        let file = tokio::fs::File::open(package)
            .await
            .map_err(|source| BuildError::Io {
                path: package.to_path_buf(),
                source,
            })?;

        let content: UploadStream = Box::pin(ReaderStream::new(file));

        self.store
            .put_stream(output_uri, content)
            .await
            .map_err(|source| BuildError::Publish {
                uri: output_uri.into(),
                source,
            })
    }
}
