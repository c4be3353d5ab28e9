use super::{Locate, ObjectStoreError, ObjectUri};
use object_store::{local::LocalFileSystem, path::Path, ObjectStore as ObjStore};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The path of the directory that should contain the object files. Each bucket is a
    /// subdirectory of it, so `gs://my-bucket/a/b` lives at `<path>/my-bucket/a/b`.
    pub path: String,
}

/// Local stand-in for object storage; useful for running the whole pipeline on a workstation.
#[derive(Debug)]
pub struct Engine(Arc<LocalFileSystem>);

impl Engine {
    pub fn new(config: &Config) -> Result<Self, ObjectStoreError> {
        std::fs::create_dir_all(&config.path).map_err(|e| {
            ObjectStoreError::FailedPrecondition(format!(
                "could not create object store directory '{}'; {e}",
                config.path
            ))
        })?;

        let store = LocalFileSystem::new_with_prefix(&config.path)
            .map_err(|e| ObjectStoreError::FailedPrecondition(e.to_string()))?;

        Ok(Engine(Arc::new(store)))
    }
}

impl Locate for Engine {
    fn locate(&self, uri: &ObjectUri) -> Result<(Arc<dyn ObjStore>, Path), ObjectStoreError> {
        if uri.path.is_empty() {
            return Err(ObjectStoreError::InvalidUri(uri.to_string()));
        }

        let store: Arc<dyn ObjStore> = self.0.clone();
        Ok((store, Path::from(format!("{}/{}", uri.bucket, uri.path))))
    }

    fn bucket_root(
        &self,
        bucket: &str,
    ) -> Result<(Arc<dyn ObjStore>, Option<Path>), ObjectStoreError> {
        let store: Arc<dyn ObjStore> = self.0.clone();
        Ok((store, Some(Path::from(bucket))))
    }
}
