//! GPU driver precompilation configs.
//!
//! A [`ConfigRecord`] describes one (kernel/image version, driver version) build task. Records are
//! generated at CI time, persisted to object storage and later picked up by the driver builder.

pub mod artifacts;
pub mod codec;
pub mod generate;
pub mod store;

use crate::object_store::{join_uri, ObjectStoreError};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The builder writes the custom run-file under this name in the config's output directory.
pub fn output_driver_file_name(driver_version: &str) -> String {
    format!("NVIDIA-Linux-x86_64-{driver_version}-custom.run")
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid gpu config input; {0}")]
    Validation(String),

    #[error("could not look up '{uri}'; {reason}")]
    Lookup { uri: String, reason: String },

    #[error("could not upload gpu config object '{uri}'; {source}")]
    Upload {
        uri: String,
        #[source]
        source: ObjectStoreError,
    },

    #[error("could not read gpu config '{uri}'; {reason}")]
    Read { uri: String, reason: String },
}

/// Classification of the build request: built for a kernel CI build or for an OS image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(try_from = "String")]
#[strum(ascii_case_insensitive)]
pub enum VersionType {
    Kernel,
    Image,
}

impl TryFrom<String> for VersionType {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Selects which records a listing returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ClassFilter {
    Kernel,
    Image,
    #[default]
    Both,
}

impl ClassFilter {
    pub fn matches(&self, version_type: VersionType) -> bool {
        match self {
            ClassFilter::Both => true,
            ClassFilter::Kernel => version_type == VersionType::Kernel,
            ClassFilter::Image => version_type == VersionType::Image,
        }
    }
}

/// Paths to everything needed to build one custom driver package. Every value is a fully resolved
/// `gs://` or `https://` uri by the time the record is persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRequest {
    pub kernel_src_tarball_gcs: String,
    pub kernel_headers_tarball_gcs: String,
    pub nvidia_runfile_address: String,
    pub toolchain_tarball_gcs: String,
    pub toolchain_env_gcs: String,
    pub driver_output_gcs_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    /// Persisted separately from the metadata object; see [`codec`].
    #[serde(skip)]
    pub build_request: BuildRequest,
    pub driver_version: String,
    pub milestone: String,
    pub version: String,
    pub version_type: VersionType,
}

impl ConfigRecord {
    pub fn new(
        version: &str,
        version_type: VersionType,
        driver_version: &str,
        build_request: BuildRequest,
    ) -> Self {
        ConfigRecord {
            build_request,
            driver_version: driver_version.into(),
            milestone: kernel_version_to_milestone(version),
            version: version.into(),
            version_type,
        }
    }

    /// A record has to name what it builds before it can be persisted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version.trim().is_empty() {
            return Err(ConfigError::Validation("config version is empty".into()));
        }

        if self.driver_version.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "driver version is empty for config version '{}'",
                self.version
            )));
        }

        Ok(())
    }

    /// Where the builder publishes this record's package; also the dedup key for rebuilds.
    pub fn output_driver_uri(&self) -> String {
        join_uri(
            &self.build_request.driver_output_gcs_dir,
            &output_driver_file_name(&self.driver_version),
        )
    }
}

/// Extracts the release milestone from a COS kernel version: "5.10.100-14.m97" is built from the
/// main branch at milestone 97 and "5.10.107-10.r97" from the R97 release branch.
pub fn kernel_version_to_milestone(version: &str) -> String {
    for separator in ['m', 'r'] {
        let parts: Vec<&str> = version.split(separator).collect();
        if parts.len() == 2 {
            return parts[1].to_string();
        }
    }

    String::new()
}
