use crate::gpuconfig::{generate, ClassFilter};
use crate::object_store;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use rust_embed::RustEmbed;
use serde::Deserialize;
use std::borrow::Cow;
use std::path::PathBuf;
use strum::{Display, EnumString};

const ENV_PREFIX: &str = "COS_GPU_";

#[derive(RustEmbed)]
#[folder = "src/conf/"]
#[include = "*.toml"]
struct EmbeddedConfigFS;

#[derive(thiserror::Error, Debug)]
pub enum ConfError {
    #[error("embedded default configuration is missing")]
    MissingDefaults,

    #[error("could not parse configuration; {0}")]
    Parse(#[from] Box<figment::Error>),
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub general: General,
    pub object_store: object_store::Config,
    pub generator: Generator,
    pub build: Build,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct General {
    /// Default tracing filter; `RUST_LOG` takes precedence when set.
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Generator {
    /// Bucket generated configs are written to.
    pub config_bucket: String,
    #[serde(flatten)]
    pub paths: generate::Config,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Build {
    /// Bucket scanned for configs to build.
    pub bucket: String,
    pub work_root: PathBuf,
    pub lookback_days: u32,
    pub version_type: ClassFilter,
    pub parallelism: usize,
    /// Overall deadline for a batch in seconds; zero means none.
    pub timeout_secs: u64,
    pub download_retries: u32,
}

impl Config {
    /// returns an embedded default configuration file in bytes.
    fn default_config() -> Result<Cow<'static, [u8]>, ConfError> {
        EmbeddedConfigFS::get("default_config.toml")
            .map(|file| file.data)
            .ok_or(ConfError::MissingDefaults)
    }

    /// returns the default configuration paths that are searched in case user does not specify.
    fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/cos_gpu/cos_gpu.toml")];

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config/cos_gpu.toml"));
        }

        paths
    }

    /// returns a correctly deserialized config from the embedded defaults, the configuration files and
    /// the environment.
    ///
    /// Files are merged in order so later files override earlier ones. Environment variables prefixed
    /// with `COS_GPU_` override everything, with `__` separating nested keys
    /// (`COS_GPU_BUILD__PARALLELISM=4`).
    pub fn parse(path_override: &Option<String>) -> Result<Self, ConfError> {
        let default_config_raw = Self::default_config()?;
        let default_config = String::from_utf8_lossy(&default_config_raw);

        let mut figment = Figment::from(Toml::string(&default_config));

        match path_override {
            Some(path) => figment = figment.merge(Toml::file(path)),
            None => {
                for path in Self::config_paths() {
                    figment = figment.merge(Toml::file(path));
                }
            }
        }

        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfError::Parse(Box::new(e)))
    }
}
