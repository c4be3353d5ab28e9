use super::{Locate, ObjectStoreError, ObjectUri};
use object_store::{memory::InMemory, path::Path, ObjectStore as ObjStore};
use std::sync::Arc;

/// Volatile engine used by tests; buckets are the first path segment like the filesystem engine.
#[derive(Debug)]
pub struct Engine(Arc<InMemory>);

impl Engine {
    pub fn new() -> Self {
        Engine(Arc::new(InMemory::new()))
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
