use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("could not download '{url}'; {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("could not download '{url}'; status: {status}")]
    Status { url: String, status: StatusCode },

    #[error("could not write download to '{}'; {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fetches artifacts that live behind plain urls rather than in object storage.
#[async_trait]
pub trait Downloader: Debug + Send + Sync + 'static {
    /// Streams the body of `url` into a newly created file at `destination`.
    async fn download(&self, url: &str, destination: &Path) -> Result<(), DownloadError>;
}

/// Plain HTTPS downloader for artifacts that are not in object storage (the NVIDIA run-file).
///
/// Transport errors are retried a bounded number of times; an unexpected status code is not.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    attempts: u32,
    retry_interval: Duration,
}

impl HttpDownloader {
    pub fn new(attempts: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            attempts: attempts.max(1),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    async fn send_with_retries(&self, url: &str) -> Result<reqwest::Response, DownloadError> {
        let mut attempt = 1;

        loop {
            match self.client.get(url).send().await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.attempts => {
                    warn!(url, attempt, err = %e, "Download attempt failed; retrying");
                    attempt += 1;
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(source) => {
                    return Err(DownloadError::Request {
                        url: url.into(),
                        source,
                    })
                }
            }
        }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str, destination: &Path) -> Result<(), DownloadError> {
        let url = url.trim();
        info!(url, destination = %destination.display(), "Downloading");

        let response = self.send_with_retries(url).await?;

        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url: url.into(),
                status: response.status(),
            });
        }

        let io_err = |source: std::io::Error| DownloadError::Io {
            path: destination.to_path_buf(),
            source,
        };

        let mut file = tokio::fs::File::create(destination).await.map_err(io_err)?;
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|source| DownloadError::Request {
                url: url.into(),
                source,
            })?;
            file.write_all(&chunk).await.map_err(io_err)?;
        }

        file.flush().await.map_err(io_err)?;

        debug!(url, "Successfully downloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves a single canned response on a random local port and returns its base url.
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        format!("http://{addr}")
    }

    #[tokio::test]
    async fn download_writes_body() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world",
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("NVIDIA-Linux-x86_64-470.82.01.run");

        HttpDownloader::new(1)
            .download(&format!("{base}/NVIDIA-Linux-x86_64-470.82.01.run"), &destination)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(destination).unwrap(), "hello world");
    }

    #[tokio::test]
    async fn download_rejects_error_status() {
        let base = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("missing.run");

        let err = HttpDownloader::new(3)
            .download(&format!("{base}/missing.run"), &destination)
            .await
            .unwrap_err();

        let DownloadError::Status { status, .. } = &err else {
            panic!("expected status error, got {err:?}");
        };
        assert_eq!(*status, StatusCode::NOT_FOUND);
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn download_gives_up_after_attempts() {
        // Bind then drop to get a port with nothing listening on it.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let dir = tempfile::tempdir().unwrap();

        let mut downloader = HttpDownloader::new(2);
        downloader.retry_interval = Duration::from_millis(10);

        let err = downloader
            .download(&format!("http://{addr}/file.run"), &dir.path().join("file.run"))
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Request { .. }));
    }
}
