use super::{Locate, ObjectStoreError, ObjectUri};
use dashmap::DashMap;
use object_store::{gcp::GoogleCloudStorageBuilder, path::Path, ObjectStore as ObjStore};
use std::sync::Arc;
use tracing::debug;

/// Google Cloud Storage engine. Credentials are discovered from the environment the same way the
/// gcloud tooling does (service account file, application default credentials or the metadata
/// server).
///
/// A config batch references objects in several buckets, so one client is built per bucket on first
/// use and reused afterwards.
#[derive(Debug, Default)]
pub struct Engine {
    clients: DashMap<String, Arc<dyn ObjStore>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, bucket: &str) -> Result<Arc<dyn ObjStore>, ObjectStoreError> {
        if let Some(client) = self.clients.get(bucket) {
            return Ok(client.clone());
        }

        let client = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| ObjectStoreError::Connection(format!("bucket '{bucket}'; {e}")))?;
        let client: Arc<dyn ObjStore> = Arc::new(client);

        debug!(bucket, "Created storage client for bucket");

        self.clients.insert(bucket.to_string(), client.clone());
        Ok(client)
    }
}

impl Locate for Engine {
    fn locate(&self, uri: &ObjectUri) -> Result<(Arc<dyn ObjStore>, Path), ObjectStoreError> {
        if uri.path.is_empty() {
            return Err(ObjectStoreError::InvalidUri(uri.to_string()));
        }

        Ok((self.client(&uri.bucket)?, Path::from(uri.path.as_str())))
    }

    fn bucket_root(
        &self,
        bucket: &str,
    ) -> Result<(Arc<dyn ObjStore>, Option<Path>), ObjectStoreError> {
        Ok((self.client(bucket)?, None))
    }
}
