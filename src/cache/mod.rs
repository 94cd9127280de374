//! Persistent dataset cache.
//!
//! Each logical key is stored as two physical records in a flat
//! [`Storage`]:
//!
//! - `{namespace}.Metadata.{key}`: `{ type, length, created }`
//! - `{namespace}.Data.{key}`: `{ content, created }`
//!
//! Both go through the [`codec`] pipeline (JSON, compression, hex).
//!
//! The two records exist together or not at all. A read that finds one
//! without the other purges what is left and reports a miss, so a
//! half-written or hand-edited entry heals itself into a refetch. Writes put
//! the data record first (the large one, most likely to hit a storage quota)
//! and roll back both records on any failure.
//!
//! Expiry is lazy: entries older than the TTL read as absent but stay in
//! storage until overwritten or removed.

pub mod codec;
pub mod storage;

pub use codec::{Codec, DeflateCodec};
pub use storage::{FileStorage, MemoryStorage, Storage};

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::telemetry;
use crate::Result;
use codec::{decode_record, encode_record};

/// Map keys ending with this suffix hold back-references and are not stored.
pub const REFERENCE_SUFFIX: &str = "Ref";

/// Configuration for the data cache.
///
/// ```rust
/// # use orgcheck::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .namespace("Audit")
///     .ttl(Duration::from_secs(3600));
/// assert_eq!(config.ttl, Duration::from_secs(3600));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Prefix of every physical key. Default: `OrgCheck`.
    pub namespace: String,
    /// Time-to-live of an entry. Default: 24 hours.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "OrgCheck".to_string(),
            ttl: Duration::from_secs(24 * 3600),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// A cached dataset: keyed rows or a plain sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Map(Map<String, Value>),
    Sequence(Vec<Value>),
}

impl CacheValue {
    pub fn len(&self) -> usize {
        match self {
            CacheValue::Map(map) => map.len(),
            CacheValue::Sequence(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_map(&self) -> bool {
        matches!(self, CacheValue::Map(_))
    }

    pub fn as_map(&self) -> Option<&Map<String, Value>> {
        match self {
            CacheValue::Map(map) => Some(map),
            CacheValue::Sequence(_) => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            CacheValue::Sequence(items) => Some(items),
            CacheValue::Map(_) => None,
        }
    }
}

/// Shape recorded in the metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    Map,
    Array,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataRecord {
    #[serde(rename = "type")]
    kind: EntryKind,
    length: usize,
    created: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DataRecord {
    content: Value,
    created: u64,
}

/// Descriptor of one cached entry, as listed by [`DataCache::details`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryDetails {
    pub name: String,
    pub is_empty: bool,
    pub is_map: bool,
    pub length: usize,
    /// Milliseconds since the Unix epoch; 0 when unreadable.
    pub created: u64,
}

/// Dual-record persistent cache.
pub struct DataCache {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    config: CacheConfig,
}

impl DataCache {
    pub fn new(storage: Arc<dyn Storage>, config: CacheConfig) -> Self {
        Self::with_codec(storage, Arc::new(DeflateCodec::new()), config)
    }

    pub fn with_codec(
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        config: CacheConfig,
    ) -> Self {
        Self {
            storage,
            codec,
            config,
        }
    }

    /// In-memory cache with default settings.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()), CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a value; `None` on absent, expired or unreadable entries.
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let value = self.load(key);
        if value.is_some() {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
        } else {
            metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
        }
        value
    }

    /// Store a value, or delete the entry when `value` is `None`.
    ///
    /// On failure no record of `key` is left behind.
    pub fn set(&self, key: &str, value: Option<&CacheValue>) -> Result<()> {
        let Some(value) = value else {
            self.remove(key);
            return Ok(());
        };

        let created = now_millis();
        let (kind, content) = match value {
            CacheValue::Map(map) => {
                let pairs: Vec<Value> = map
                    .iter()
                    .filter(|(k, _)| !k.ends_with(REFERENCE_SUFFIX))
                    .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                    .collect();
                (EntryKind::Map, pairs)
            }
            CacheValue::Sequence(items) => (EntryKind::Array, items.clone()),
        };
        let metadata = MetadataRecord {
            kind,
            length: content.len(),
            created,
        };
        let data = DataRecord {
            content: Value::Array(content),
            created,
        };

        let result = self.write_records(key, &data, &metadata);
        if let Err(e) = &result {
            warn!(key, error = %e, "cache write failed, rolling back entry");
            self.remove(key);
        } else {
            debug!(key, length = metadata.length, "cache entry written");
        }
        result
    }

    /// Describe every entry in the namespace.
    pub fn details(&self) -> Vec<CacheEntryDetails> {
        let prefix = self.metadata_prefix();
        let mut details: Vec<_> = self
            .storage
            .keys()
            .into_iter()
            .filter_map(|physical| {
                let name = physical.strip_prefix(&prefix)?.to_string();
                let decoded = self
                    .storage
                    .get_item(&physical)
                    .ok_or_else(|| crate::OrgCheckError::CacheCorruption("vanished".into()))
                    .and_then(|stored| {
                        decode_record::<MetadataRecord>(self.codec.as_ref(), &stored)
                    });
                Some(match decoded {
                    Ok(metadata) => CacheEntryDetails {
                        name,
                        is_empty: metadata.length == 0,
                        is_map: metadata.kind == EntryKind::Map,
                        length: metadata.length,
                        created: metadata.created,
                    },
                    Err(_) => CacheEntryDetails {
                        name,
                        is_empty: true,
                        is_map: false,
                        length: 0,
                        created: 0,
                    },
                })
            })
            .collect();
        details.sort_by(|a, b| a.name.cmp(&b.name));
        details
    }

    /// Delete both records of one key.
    pub fn remove(&self, key: &str) {
        self.storage.remove_item(&self.data_key(key));
        self.storage.remove_item(&self.metadata_key(key));
    }

    /// Delete every record in the namespace.
    pub fn clear(&self) {
        let prefix = format!("{}.", self.config.namespace);
        for key in self.storage.keys() {
            if key.starts_with(&prefix) {
                self.storage.remove_item(&key);
            }
        }
    }

    fn load(&self, key: &str) -> Option<CacheValue> {
        let metadata_key = self.metadata_key(key);
        let data_key = self.data_key(key);

        let Some(metadata) = self.read::<MetadataRecord>(&metadata_key) else {
            // An unreadable metadata record or stray data is unreachable
            let stored = |k: &str| self.storage.get_item(k).is_some();
            if stored(&metadata_key) || stored(&data_key) {
                self.purge(key, "missing_metadata");
            }
            return None;
        };
        let Some(data) = self.read::<DataRecord>(&data_key) else {
            self.purge(key, "missing_data");
            return None;
        };

        if self.is_expired(metadata.created) {
            debug!(key, created = metadata.created, "cache entry expired");
            return None;
        }

        let value = match (metadata.kind, data.content) {
            (EntryKind::Map, Value::Array(pairs)) => pairs_to_map(pairs).map(CacheValue::Map),
            (EntryKind::Array, Value::Array(items)) => Some(CacheValue::Sequence(items)),
            _ => None,
        };
        let Some(value) = value else {
            self.purge(key, "undecodable");
            return None;
        };

        if value.len() != metadata.length {
            debug!(
                key,
                stored = metadata.length,
                actual = value.len(),
                "fixing cache entry length"
            );
        }
        let refreshed = MetadataRecord {
            length: value.len(),
            ..metadata
        };
        if let Err(e) = encode_record(self.codec.as_ref(), &refreshed)
            .and_then(|stored| self.storage.set_item(&metadata_key, &stored))
        {
            warn!(key, error = %e, "failed to refresh cache metadata");
        }
        Some(value)
    }

    /// Decode one physical record; unreadable records count as absent.
    fn read<T: serde::de::DeserializeOwned>(&self, physical: &str) -> Option<T> {
        let stored = self.storage.get_item(physical)?;
        match decode_record(self.codec.as_ref(), &stored) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key = physical, error = %e, "unreadable cache record");
                None
            }
        }
    }

    fn write_records(&self, key: &str, data: &DataRecord, metadata: &MetadataRecord) -> Result<()> {
        let codec = self.codec.as_ref();
        let data = encode_record(codec, data)?;
        let metadata = encode_record(codec, metadata)?;
        self.storage.set_item(&self.data_key(key), &data)?;
        self.storage.set_item(&self.metadata_key(key), &metadata)
    }

    fn purge(&self, key: &str, reason: &'static str) {
        warn!(key, reason, "inconsistent cache entry, purging");
        metrics::counter!(telemetry::CACHE_PURGES_TOTAL, "reason" => reason).increment(1);
        self.remove(key);
    }

    fn is_expired(&self, created: u64) -> bool {
        let ttl = u64::try_from(self.config.ttl.as_millis()).unwrap_or(u64::MAX);
        now_millis().saturating_sub(created) > ttl
    }

    fn metadata_prefix(&self) -> String {
        format!("{}.Metadata.", self.config.namespace)
    }

    fn metadata_key(&self, key: &str) -> String {
        format!("{}{key}", self.metadata_prefix())
    }

    fn data_key(&self, key: &str) -> String {
        format!("{}.Data.{key}", self.config.namespace)
    }
}

/// Rebuild a map from `[key, value]` pairs; `None` on any malformed pair.
fn pairs_to_map(pairs: Vec<Value>) -> Option<Map<String, Value>> {
    pairs
        .into_iter()
        .map(|pair| match pair {
            Value::Array(mut kv) if kv.len() == 2 => {
                let value = kv.pop()?;
                match kv.pop()? {
                    Value::String(k) => Some((k, value)),
                    _ => None,
                }
            }
            _ => None,
        })
        .collect()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
