//! Fetching build artifacts named by a config into a local directory.

use super::BuildRequest;
use crate::download::{DownloadError, Downloader};
use crate::object_store::{ObjectStore, ObjectStoreError, SCHEME_GCS};
use futures::StreamExt;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const KERNEL_SRC_FILE_NAME: &str = "kernel-src.tar.gz";
pub const KERNEL_HEADERS_FILE_NAME: &str = "kernel-headers.tgz";
pub const TOOLCHAIN_FILE_NAME: &str = "toolchain.tar.xz";
pub const TOOLCHAIN_ENV_FILE_NAME: &str = "toolchain_env";

const SCHEME_HTTPS: &str = "https";

#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    #[error("only https:// or gs:// urls supported: '{0}'")]
    UnsupportedScheme(String),

    #[error("invalid artifact uri '{uri}'; {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("could not fetch '{uri}' from object storage; {source}")]
    Storage {
        uri: String,
        #[source]
        source: ObjectStoreError,
    },

    #[error(transparent)]
    Http(#[from] DownloadError),

    #[error("could not write artifact to '{}'; {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fetch of '{0}' was cancelled")]
    Cancelled(String),
}

/// Dispatches an artifact uri to the matching download mechanism by scheme.
#[derive(Debug, Clone)]
pub struct ArtifactResolver {
    store: Arc<dyn ObjectStore>,
    http: Arc<dyn Downloader>,
}

impl ArtifactResolver {
    pub fn new(store: Arc<dyn ObjectStore>, http: Arc<dyn Downloader>) -> Self {
        Self { store, http }
    }

    /// Streams `source_uri` into `dest_dir/file_name` and returns the written path.
    ///
    /// On failure or cancellation the partially written file is removed.
    pub async fn fetch(
        &self,
        source_uri: &str,
        dest_dir: &Path,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ArtifactError> {
        let source_uri = source_uri.trim();
        let url = Url::parse(source_uri)
            .map_err(|_| ArtifactError::UnsupportedScheme(source_uri.into()))?;

        if url.scheme() != SCHEME_GCS && url.scheme() != SCHEME_HTTPS {
            return Err(ArtifactError::UnsupportedScheme(source_uri.into()));
        }

        let destination = dest_dir.join(file_name);
        info!(uri = source_uri, destination = %destination.display(), "Downloading artifact");

        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(ArtifactError::Cancelled(source_uri.into())),
            result = self.fetch_by_scheme(url.scheme(), source_uri, &destination) => result,
        };

        if let Err(e) = result {
            // Nothing may have been created yet; a missing file is fine.
            let _ = tokio::fs::remove_file(&destination).await;
            return Err(e);
        }

        debug!(uri = source_uri, "Artifact downloaded");
        Ok(destination)
    }

    async fn fetch_by_scheme(
        &self,
        scheme: &str,
        uri: &str,
        destination: &Path,
    ) -> Result<(), ArtifactError> {
        match scheme {
            SCHEME_GCS => self.fetch_object(uri, destination).await,
            SCHEME_HTTPS => Ok(self.http.download(uri, destination).await?),
            _ => Err(ArtifactError::UnsupportedScheme(uri.into())),
        }
    }

    async fn fetch_object(&self, uri: &str, destination: &Path) -> Result<(), ArtifactError> {
        let storage_err = |source: ObjectStoreError| ArtifactError::Storage {
            uri: uri.into(),
            source,
        };
        let io_err = |source: std::io::Error| ArtifactError::Io {
            path: destination.to_path_buf(),
            source,
        };

        let mut object = self.store.get_stream(uri).await.map_err(storage_err)?;
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(io_err)?;

        while let Some(chunk) = object.next().await {
            let chunk = chunk.map_err(storage_err)?;
            file.write_all(&chunk).await.map_err(io_err)?;
        }

        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

/// Downloads the artifacts of a single build request under their well-known local names.
#[derive(Debug)]
pub struct ArtifactsDownloader<'a> {
    resolver: &'a ArtifactResolver,
    request: &'a BuildRequest,
    cancel: &'a CancellationToken,
}

impl<'a> ArtifactsDownloader<'a> {
    pub fn new(
        resolver: &'a ArtifactResolver,
        request: &'a BuildRequest,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            resolver,
            request,
            cancel,
        }
    }

    pub async fn kernel_src(&self, dest_dir: &Path) -> Result<PathBuf, ArtifactError> {
        self.fetch(&self.request.kernel_src_tarball_gcs, dest_dir, KERNEL_SRC_FILE_NAME)
            .await
    }

    pub async fn kernel_headers(&self, dest_dir: &Path) -> Result<PathBuf, ArtifactError> {
        self.fetch(
            &self.request.kernel_headers_tarball_gcs,
            dest_dir,
            KERNEL_HEADERS_FILE_NAME,
        )
        .await
    }

    pub async fn toolchain(&self, dest_dir: &Path) -> Result<PathBuf, ArtifactError> {
        self.fetch(&self.request.toolchain_tarball_gcs, dest_dir, TOOLCHAIN_FILE_NAME)
            .await
    }

    pub async fn toolchain_env(&self, dest_dir: &Path) -> Result<PathBuf, ArtifactError> {
        self.fetch(&self.request.toolchain_env_gcs, dest_dir, TOOLCHAIN_ENV_FILE_NAME)
            .await
    }

    /// Fetches the installer and returns the file name it was saved under, which is the last path
    /// segment of its url.
    pub async fn nvidia_runfile(&self, dest_dir: &Path) -> Result<String, ArtifactError> {
        let address = &self.request.nvidia_runfile_address;
        let file_name = runfile_name(address)?;

        self.fetch(address, dest_dir, &file_name).await?;
        Ok(file_name)
    }

    async fn fetch(
        &self,
        uri: &str,
        dest_dir: &Path,
        file_name: &str,
    ) -> Result<PathBuf, ArtifactError> {
        self.resolver
            .fetch(uri, dest_dir, file_name, self.cancel)
            .await
    }
}

fn runfile_name(address: &str) -> Result<String, ArtifactError> {
    let invalid = |reason: &str| ArtifactError::InvalidUri {
        uri: address.into(),
        reason: reason.into(),
    };

    let url = Url::parse(address.trim()).map_err(|e| invalid(&e.to_string()))?;

    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(|name| name.to_string())
        .ok_or_else(|| invalid("url has no file name"))
}
