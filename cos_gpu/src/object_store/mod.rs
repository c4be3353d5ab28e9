pub mod filesystem;
pub mod gcs;
#[cfg(test)]
pub mod memory;


use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use object_store::{path::Path, ObjectStore as ObjStore, WriteMultipart};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::{fmt, fmt::Debug, pin::Pin, sync::Arc};
use strum::{Display, EnumString};

pub const SCHEME_GCS: &str = "gs";

/// Stream of object content as it is read from the store.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ObjectStoreError>> + Send>>;

/// Stream of content to be written into the store. Usually backed by a local file.
pub type UploadStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Represents different object store failure possibilities.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("could not parse object uri '{0}'; must be in form gs://<bucket>/<path>")]
    InvalidUri(String),

    #[error("could not establish connection to object store; {0}")]
    Connection(String),

    #[error("requested object not found")]
    NotFound,

    /// Failed to start due to misconfigured settings, usually from a misconfigured settings file.
    #[error("could not init object store; {0}")]
    FailedPrecondition(String),

    #[error("unexpected object store error occurred; {0}")]
    Internal(String),
}

impl From<object_store::Error> for ObjectStoreError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => ObjectStoreError::NotFound,
            _ => ObjectStoreError::Internal(err.to_string()),
        }
    }
}

/// A parsed `gs://<bucket>/<path>` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUri {
    pub bucket: String,
    pub path: String,
}

impl ObjectUri {
    pub fn parse(uri: &str) -> Result<Self, ObjectStoreError> {
        let rest = uri
            .trim()
            .strip_prefix("gs://")
            .ok_or_else(|| ObjectStoreError::InvalidUri(uri.into()))?;

        let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ObjectStoreError::InvalidUri(uri.into()));
        }

        Ok(ObjectUri {
            bucket: bucket.into(),
            path: path.trim_start_matches('/').into(),
        })
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.path)
    }
}

/// Joins an object name onto a directory-like uri with exactly one separating slash.
pub fn join_uri(dir: &str, name: &str) -> String {
    format!(
        "{}/{}",
        dir.trim_end_matches('/'),
        name.trim_start_matches('/')
    )
}

/// The storage collaborator. Every object is addressed by its full `gs://` uri so that a single
/// client can reach any bucket a config refers to.
#[async_trait]
pub trait ObjectStore: Debug + Send + Sync + 'static {
    async fn exists(&self, uri: &str) -> Result<bool, ObjectStoreError>;
    async fn get(&self, uri: &str) -> Result<Bytes, ObjectStoreError>;
    async fn get_stream(&self, uri: &str) -> Result<ByteStream, ObjectStoreError>;
    async fn put(&self, uri: &str, content: Bytes) -> Result<(), ObjectStoreError>;
    async fn put_stream(&self, uri: &str, content: UploadStream) -> Result<(), ObjectStoreError>;
    async fn delete(&self, uri: &str) -> Result<(), ObjectStoreError>;

    /// Lists the directory-like prefixes directly under the bucket root whose names sort at or
    /// after `start_offset`. Results are ascending and formatted as `gs://<bucket>/<prefix>/`.
    async fn list_prefixes(
        &self,
        bucket: &str,
        start_offset: &str,
    ) -> Result<Vec<String>, ObjectStoreError>;
}

/// Maps a `gs://` uri onto a concrete `object_store` backend and the path inside it.
///
/// Engines only have to describe where objects live; the [`ObjectStore`] operations are shared.
pub trait Locate: Debug + Send + Sync + 'static {
    fn locate(&self, uri: &ObjectUri) -> Result<(Arc<dyn ObjStore>, Path), ObjectStoreError>;

    /// Returns the backend holding the bucket and the path the bucket root maps to, if any.
    fn bucket_root(&self, bucket: &str)
        -> Result<(Arc<dyn ObjStore>, Option<Path>), ObjectStoreError>;
}

#[async_trait]
impl<T: Locate> ObjectStore for T {
    async fn exists(&self, uri: &str) -> Result<bool, ObjectStoreError> {
        let (store, path) = self.locate(&ObjectUri::parse(uri)?)?;

        match store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(ObjectStoreError::from(e)),
        }
    }

    async fn get(&self, uri: &str) -> Result<Bytes, ObjectStoreError> {
        let (store, path) = self.locate(&ObjectUri::parse(uri)?)?;

        let result = store.get(&path).await.map_err(ObjectStoreError::from)?;

        let object = result.bytes().await.map_err(ObjectStoreError::from)?;

        Ok(object)
    }

    async fn get_stream(&self, uri: &str) -> Result<ByteStream, ObjectStoreError> {
        let (store, path) = self.locate(&ObjectUri::parse(uri)?)?;

        let object_stream = store
            .get(&path)
            .await
            .map_err(ObjectStoreError::from)?
            .into_stream();

        let object_stream = object_stream.map(|item| item.map_err(ObjectStoreError::from));

        Ok(Box::pin(object_stream))
    }

    async fn put(&self, uri: &str, content: Bytes) -> Result<(), ObjectStoreError> {
        let (store, path) = self.locate(&ObjectUri::parse(uri)?)?;

        let payload = object_store::PutPayload::from_bytes(content);

        store
            .put(&path, payload)
            .await
            .map_err(ObjectStoreError::from)?;

        Ok(())
    }

    // The multipart upload is only committed by `finish`, so an aborted or failed stream never
    // leaves a partial object behind at the destination.
    async fn put_stream(
        &self,
        uri: &str,
        mut content: UploadStream,
    ) -> Result<(), ObjectStoreError> {
        let (store, path) = self.locate(&ObjectUri::parse(uri)?)?;

        let upload = store
            .put_multipart(&path)
            .await
            .map_err(ObjectStoreError::from)?;

        let mut writer = WriteMultipart::new(upload);

        while let Some(chunk) = content.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(ObjectStoreError::Internal(format!(
                        "could not read upload content; {e}"
                    )));
                }
            };

            writer
                .wait_for_capacity(8)
                .await
                .map_err(ObjectStoreError::from)?;
            writer.write(&chunk);
        }

        writer.finish().await.map_err(ObjectStoreError::from)?;

        Ok(())
    }

    async fn delete(&self, uri: &str) -> Result<(), ObjectStoreError> {
        let (store, path) = self.locate(&ObjectUri::parse(uri)?)?;

        store.delete(&path).await.map_err(ObjectStoreError::from)?;

        Ok(())
    }

    // The offset is handed to the backend so a listing only walks objects written after it. Keys
    // are compared as a whole there, so prefix names are still checked against the offset here.
    async fn list_prefixes(
        &self,
        bucket: &str,
        start_offset: &str,
    ) -> Result<Vec<String>, ObjectStoreError> {
        let (store, root) = self.bucket_root(bucket)?;

        let mut listing = if start_offset.is_empty() {
            store.list(root.as_ref())
        } else {
            let offset = match &root {
                Some(root) => root.child(start_offset),
                None => Path::from(start_offset),
            };
            store.list_with_offset(root.as_ref(), &offset)
        };

        let mut prefixes = BTreeSet::new();

        loop {
            let meta = match listing.try_next().await {
                Ok(Some(meta)) => meta,
                Ok(None) | Err(object_store::Error::NotFound { .. }) => break,
                Err(e) => return Err(ObjectStoreError::from(e)),
            };

            let parts: Vec<String> = match &root {
                Some(root) => match meta.location.prefix_match(root) {
                    Some(parts) => parts.map(|part| part.as_ref().to_string()).collect(),
                    None => continue,
                },
                None => meta
                    .location
                    .parts()
                    .map(|part| part.as_ref().to_string())
                    .collect(),
            };

            // Objects directly under the bucket root are not prefixes.
            if parts.len() < 2 || parts[0].as_str() < start_offset {
                continue;
            }

            prefixes.insert(parts[0].clone());
        }

        Ok(prefixes
            .into_iter()
            .map(|name| format!("gs://{bucket}/{name}/"))
            .collect())
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Engine {
    #[default]
    Gcs,
    Filesystem,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub engine: Engine,
    pub filesystem: Option<filesystem::Config>,
}

pub fn new(config: &Config) -> Result<Arc<dyn ObjectStore>, ObjectStoreError> {
    match config.engine {
        Engine::Gcs => Ok(Arc::new(gcs::Engine::new())),
        Engine::Filesystem => {
            let Some(fs_config) = &config.filesystem else {
                return Err(ObjectStoreError::FailedPrecondition(
                    "filesystem engine settings not found in config".into(),
                ));
            };

            let engine = filesystem::Engine::new(fs_config)?;
            Ok(Arc::new(engine))
        }
    }
}
