use super::{BuildRequest, ConfigError, ConfigRecord, VersionType};
use crate::object_store::ObjectStore;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Where generated configs point their artifact paths.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bucket the kernel CI publishes kernel sources, headers and toolchain metadata to.
    pub kernel_artifacts_bucket: String,
    /// Base url NVIDIA serves datacenter driver run-files from.
    pub nvidia_download_base: String,
    /// Directory uri that per-kernel output directories are created under.
    pub driver_output_base: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            kernel_artifacts_bucket: "cos-kernel-artifacts".into(),
            nvidia_download_base: "https://us.download.nvidia.com/tesla".into(),
            driver_output_base: "gs://nvidia-drivers-us-public/nvidia-cos-project".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigGenerator {
    store: Arc<dyn ObjectStore>,
    config: Config,
}

impl ConfigGenerator {
    pub fn new(store: Arc<dyn ObjectStore>, config: Config) -> Self {
        Self { store, config }
    }

    fn kernel_build_dir(&self, kernel_version: &str) -> String {
        format!(
            "gs://{}/builds/{kernel_version}",
            self.config.kernel_artifacts_bucket
        )
    }

    /// Builds one kernel CI config per driver version, in the order given.
    ///
    /// The toolchain tarball location is the only path that cannot be templated; it is looked up
    /// once for the kernel version and a failed lookup fails the whole batch.
    pub async fn generate_kernel_ci_configs(
        &self,
        kernel_version: &str,
        driver_versions: &[String],
    ) -> Result<Vec<ConfigRecord>, ConfigError> {
        let kernel_version = kernel_version.trim();

        if kernel_version.is_empty() {
            return Err(ConfigError::Validation("kernel version is empty".into()));
        }

        if driver_versions.is_empty() {
            return Err(ConfigError::Validation("no driver versions given".into()));
        }

        if driver_versions.iter().any(|v| v.trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "empty driver version in {driver_versions:?}"
            )));
        }

        let toolchain_tarball = self.fetch_toolchain_tarball_path(kernel_version).await?;
        let build_dir = self.kernel_build_dir(kernel_version);

        let configs = driver_versions
            .iter()
            .map(|driver_version| {
                let driver_version = driver_version.trim();

                let build_request = BuildRequest {
                    kernel_src_tarball_gcs: format!(
                        "{build_dir}/cos-kernel-src-{kernel_version}.tgz"
                    ),
                    kernel_headers_tarball_gcs: format!(
                        "{build_dir}/cos-kernel-headers-{kernel_version}-x86_64.tgz"
                    ),
                    nvidia_runfile_address: format!(
                        "{}/{driver_version}/NVIDIA-Linux-x86_64-{driver_version}.run",
                        self.config.nvidia_download_base.trim_end_matches('/')
                    ),
                    toolchain_tarball_gcs: toolchain_tarball.clone(),
                    toolchain_env_gcs: format!("{build_dir}/toolchain_env.x86_64"),
                    driver_output_gcs_dir: format!(
                        "{}/{kernel_version}/",
                        self.config.driver_output_base.trim_end_matches('/')
                    ),
                };

                ConfigRecord::new(
                    kernel_version,
                    VersionType::Kernel,
                    driver_version,
                    build_request,
                )
            })
            .collect::<Vec<_>>();

        info!(
            kernel_version,
            count = configs.len(),
            "Generated gpu precompilation configs"
        );

        Ok(configs)
    }

    /// Reads the indirection object the kernel CI writes next to its build artifacts; its content
    /// is the authoritative toolchain tarball uri.
    pub async fn fetch_toolchain_tarball_path(
        &self,
        kernel_version: &str,
    ) -> Result<String, ConfigError> {
        let uri = format!(
            "{}/toolchain_url.x86_64",
            self.kernel_build_dir(kernel_version)
        );

        let content = self
            .store
            .get(&uri)
            .await
            .map_err(|e| ConfigError::Lookup {
                uri: uri.clone(),
                reason: e.to_string(),
            })?;

        let path = std::str::from_utf8(&content)
            .map_err(|e| ConfigError::Lookup {
                uri: uri.clone(),
                reason: format!("content is not valid utf-8; {e}"),
            })?
            .trim()
            .to_string();

        if path.is_empty() {
            return Err(ConfigError::Lookup {
                uri,
                reason: "toolchain url file is empty".into(),
            });
        }

        debug!(kernel_version, toolchain = path, "Found toolchain tarball path");
        Ok(path)
    }
}
