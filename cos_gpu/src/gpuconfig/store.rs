//! Durable storage of configs in a bucket.
//!
//! Every record lives under its own `<timestamp>-<random>/` prefix, holding a `metadata` JSON object
//! and the encoded build request. Timestamps are UTC with no zone suffix so that listing a bucket
//! from a start offset returns exactly the records created after that point.

use super::codec::{PayloadCodec, TextProto};
use super::{ClassFilter, ConfigError, ConfigRecord};
use crate::object_store::{join_uri, ObjectStore, ObjectUri};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const METADATA_FILE_NAME: &str = "metadata";
const PREFIX_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone)]
pub struct ConfigStore {
    store: Arc<dyn ObjectStore>,
    codec: Arc<dyn PayloadCodec>,
    clock: fn() -> DateTime<Utc>,
}

impl ConfigStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            codec: Arc::new(TextProto),
            clock: Utc::now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// A fresh `gs://<bucket>/<timestamp>-<8 hex chars>` location. The random suffix separates
    /// records written within the same second.
    fn dest_prefix(&self, bucket: &str) -> String {
        let timestamp = (self.clock)().format(PREFIX_TIMESTAMP_FORMAT);
        let suffix: u32 = rand::random();

        format!("gs://{bucket}/{timestamp}-{suffix:08x}")
    }

    /// Writes each record under a new prefix. Every record is validated before the first write.
    /// Writes stop at the first upload failure; records already written stay in place and the
    /// failing record never leaves a lone payload behind.
    ///
    /// Returns the prefixes written, in record order.
    pub async fn persist(
        &self,
        records: &[ConfigRecord],
        bucket: &str,
    ) -> Result<Vec<String>, ConfigError> {
        // An invalid record rejects the whole batch before anything is written.
        for record in records {
            record.validate()?;
        }

        let mut written = Vec::with_capacity(records.len());

        for record in records {
            let prefix = self.dest_prefix(bucket);
            info!(
                version = record.version,
                driver_version = record.driver_version,
                prefix,
                "Uploading gpu precompilation config"
            );

            let payload_uri = join_uri(&prefix, self.codec.file_name());
            let payload = self.codec.encode(&record.build_request);

            self.store
                .put(&payload_uri, Bytes::from(payload))
                .await
                .map_err(|source| ConfigError::Upload {
                    uri: payload_uri.clone(),
                    source,
                })?;

            let metadata_uri = join_uri(&prefix, METADATA_FILE_NAME);
            let metadata = encode_metadata(record)?;

            if let Err(source) = self.store.put(&metadata_uri, Bytes::from(metadata)).await {
                if let Err(e) = self.store.delete(&payload_uri).await {
                    warn!(uri = payload_uri, err = %e, "Could not clean up config payload");
                }

                return Err(ConfigError::Upload {
                    uri: metadata_uri,
                    source,
                });
            }

            written.push(prefix);
        }

        Ok(written)
    }

    /// Reconstructs the record stored under `prefix` in `bucket`.
    pub async fn read(&self, bucket: &str, prefix: &str) -> Result<ConfigRecord, ConfigError> {
        self.read_uri(&format!("gs://{bucket}/{}", prefix.trim_start_matches('/')))
            .await
    }

    /// Reconstructs the record stored under a `gs://<bucket>/<prefix>` uri; a trailing slash is
    /// optional.
    pub async fn read_uri(&self, dir_uri: &str) -> Result<ConfigRecord, ConfigError> {
        let read_err = |uri: &str, reason: String| ConfigError::Read {
            uri: uri.to_string(),
            reason,
        };

        let parsed = ObjectUri::parse(dir_uri).map_err(|e| read_err(dir_uri, e.to_string()))?;
        if parsed.path.trim_matches('/').is_empty() {
            return Err(read_err(dir_uri, "uri does not name a config prefix".into()));
        }

        let metadata_uri = join_uri(dir_uri, METADATA_FILE_NAME);
        let metadata = self
            .store
            .get(&metadata_uri)
            .await
            .map_err(|e| read_err(&metadata_uri, e.to_string()))?;

        let mut record: ConfigRecord = serde_json::from_slice(&metadata)
            .map_err(|e| read_err(&metadata_uri, format!("malformed metadata; {e}")))?;

        let payload_uri = join_uri(dir_uri, self.codec.file_name());
        let payload = self
            .store
            .get(&payload_uri)
            .await
            .map_err(|e| read_err(&payload_uri, e.to_string()))?;

        let payload = std::str::from_utf8(&payload)
            .map_err(|e| read_err(&payload_uri, format!("payload is not valid utf-8; {e}")))?;

        record.build_request = self
            .codec
            .decode(payload)
            .map_err(|e| read_err(&payload_uri, e.to_string()))?;

        Ok(record)
    }

    /// Returns the records created within the last `lookback_days` days whose classification
    /// matches `filter`, oldest first. Any unreadable record fails the whole listing.
    pub async fn list(
        &self,
        bucket: &str,
        lookback_days: u32,
        filter: ClassFilter,
    ) -> Result<Vec<ConfigRecord>, ConfigError> {
        // A window reaching past the earliest representable time covers every record.
        let cutoff = (self.clock)()
            .checked_sub_signed(Duration::days(i64::from(lookback_days)))
            .map(|cutoff| cutoff.format(PREFIX_TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default();

        let prefixes = self
            .store
            .list_prefixes(bucket, &cutoff)
            .await
            .map_err(|e| ConfigError::Read {
                uri: format!("gs://{bucket}"),
                reason: format!("could not list config prefixes; {e}"),
            })?;

        debug!(bucket, cutoff, count = prefixes.len(), "Listed config prefixes");

        let mut records = vec![];

        for prefix in prefixes {
            let record = self.read_uri(&prefix).await?;

            if filter.matches(record.version_type) {
                records.push(record);
            }
        }

        Ok(records)
    }
}

/// Scalar fields of the record as JSON with four-space indentation.
fn encode_metadata(record: &ConfigRecord) -> Result<Vec<u8>, ConfigError> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);

    record
        .serialize(&mut serializer)
        .map_err(|e| ConfigError::Validation(format!("could not serialize metadata; {e}")))?;

    Ok(buf)
}
