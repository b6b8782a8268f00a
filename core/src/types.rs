//! Request and response DTOs for the media-storage API.
//!
//! # Design
//! These mirror the server's JSON shapes. Timestamps stay as the server sends
//! them, fractional UNIX seconds. Free-form metadata is a JSON object so every
//! scalar type the server accepts round-trips untouched.

use std::io::Read;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::compression::CompressionFormat;

/// Access keys for a record. `None` grants anonymous access to that facet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keys {
    #[serde(default)]
    pub read: Option<String>,
    #[serde(default)]
    pub write: Option<String>,
}

/// Returned by `put`: where the record lives and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Storage {
    pub uid: String,
    pub keys: Keys,
}

/// When a record is removed. Both limits are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletionPolicy {
    /// Seconds to retain the record after upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed: Option<f64>,
    /// Seconds that must pass after the last download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale: Option<f64>,
    /// Absolute stale deadline, only ever reported by the server.
    #[serde(default, rename = "staleTime", skip_serializing)]
    pub stale_time: Option<f64>,
}

/// When, and into what, a record is recompressed on the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale: Option<f64>,
    #[serde(default, rename = "staleTime", skip_serializing)]
    pub stale_time: Option<f64>,
    #[serde(default, skip_serializing_if = "is_none_format")]
    pub comp: CompressionFormat,
}

fn is_none_format(format: &CompressionFormat) -> bool {
    *format == CompressionFormat::None
}

/// Policy block shared by `put` and `update` requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub delete: Option<DeletionPolicy>,
    #[serde(default)]
    pub compress: Option<CompressionPolicy>,
}

/// A stored record, as returned by `describe` and `query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Description {
    pub uid: String,
    #[serde(default)]
    pub keys: Option<Keys>,
    pub physical: Physical,
    #[serde(default)]
    pub policy: Policy,
    pub stats: Stats,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Physical {
    pub ctime: f64,
    pub atime: f64,
    #[serde(default)]
    pub family: Option<String>,
    pub format: Format,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Format {
    pub mime: String,
    #[serde(default)]
    pub comp: CompressionFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub accesses: u64,
}

/// Server load report returned by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub process: ProcessStatus,
    pub system: SystemStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub cpu: CpuStatus,
    pub memory: MemoryStatus,
    pub threads: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuStatus {
    pub percent: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStatus {
    pub percent: f32,
    pub rss: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub load: LoadStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadStatus {
    pub t1: f32,
    pub t5: f32,
    pub t15: f32,
}

/// Inclusive bounds; an unset bound is sent as null and not checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Range<T> {
    pub min: Option<T>,
    pub max: Option<T>,
}

/// Record search. Metadata values may use the server's filter syntax
/// (`:range:`, `:re:`, `:like:` and so on), which is passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub ctime: Range<f64>,
    pub atime: Range<f64>,
    pub accesses: Range<u64>,
    pub family: Option<String>,
    /// A full MIME type, or just its super-type (`image`).
    pub mime: Option<String>,
    pub meta: Map<String, Value>,
}

/// Body of a `query` response.
#[derive(Debug, Deserialize)]
pub(crate) struct QueryResults {
    pub records: Vec<Description>,
}

/// Body of a `list/families` response.
#[derive(Debug, Deserialize)]
pub(crate) struct Families {
    pub families: Vec<String>,
}

/// Options for `put`. `Default` stores uncompressed content in the generic
/// family with server-generated keys and no policies.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub family: Option<String>,
    pub extension: Option<String>,
    pub compression: CompressionFormat,
    /// Ask the server to compress instead of trying locally first.
    pub compress_on_server: bool,
    pub deletion_policy: Option<DeletionPolicy>,
    pub compression_policy: Option<CompressionPolicy>,
    pub meta: Option<Map<String, Value>>,
    /// Leave unset unless implementing a proxy.
    pub uid: Option<String>,
    pub keys: Option<Keys>,
}

/// Changes applied by `update`. Unset policies are left as they are.
#[derive(Debug, Clone, Default)]
pub struct Update {
    pub new_meta: Map<String, Value>,
    pub removed_meta: Vec<String>,
    pub deletion_policy: Option<DeletionPolicy>,
    pub compression_policy: Option<CompressionPolicy>,
}

/// Upper bound on the buffer reserved up front by [`Content::into_bytes`].
const MAX_PREALLOCATION: usize = 16 * 1024 * 1024;

/// Retrieved content: MIME type, decompressed length, and the data rewound to
/// offset 0.
#[derive(Debug)]
pub struct Content<B> {
    pub mime: Option<String>,
    pub length: u64,
    pub data: B,
}

impl<B: Read> Content<B> {
    pub fn into_bytes(mut self) -> std::io::Result<Vec<u8>> {
        let hint = usize::try_from(self.length).map_or(0, |n| n.min(MAX_PREALLOCATION));
        let mut out = Vec::with_capacity(hint);
        self.data.read_to_end(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn description_parses_server_shape() {
        let raw = json!({
            "uid": "0f1e",
            "keys": {"read": "r", "write": null},
            "physical": {
                "ctime": 1_330_000_000.5,
                "atime": 1_330_000_100.0,
                "family": null,
                "format": {"mime": "image/png", "comp": "gz"}
            },
            "policy": {"delete": {"stale": 60.0, "staleTime": 1_330_000_160.0}, "compress": null},
            "stats": {"accesses": 3},
            "meta": {"author": "x", "pages": 4}
        });
        let description: Description = serde_json::from_value(raw).unwrap();
        assert_eq!(description.uid, "0f1e");
        assert_eq!(description.keys.unwrap().write, None);
        assert_eq!(description.physical.format.comp, CompressionFormat::Gz);
        assert!(description.physical.family.is_none());
        let delete = description.policy.delete.unwrap();
        assert_eq!(delete.stale, Some(60.0));
        assert_eq!(delete.stale_time, Some(1_330_000_160.0));
        assert!(description.policy.compress.is_none());
        assert_eq!(description.stats.accesses, 3);
        assert_eq!(description.meta["pages"], 4);
    }

    #[test]
    fn description_without_keys_or_comp() {
        let raw = json!({
            "uid": "u",
            "physical": {"ctime": 1.0, "atime": 2.0, "family": "docs", "format": {"mime": "text/plain"}},
            "policy": {},
            "stats": {"accesses": 0},
            "meta": {}
        });
        let description: Description = serde_json::from_value(raw).unwrap();
        assert!(description.keys.is_none());
        assert_eq!(description.physical.format.comp, CompressionFormat::None);
        assert_eq!(description.physical.family.as_deref(), Some("docs"));
    }

    #[test]
    fn compression_policy_omits_unset_fields() {
        let policy = CompressionPolicy {
            stale: Some(3600.0),
            comp: CompressionFormat::Bz2,
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&policy).unwrap(), json!({"stale": 3600.0, "comp": "bz2"}));
        assert_eq!(serde_json::to_value(CompressionPolicy::default()).unwrap(), json!({}));
    }

    #[test]
    fn query_serializes_nested_ranges() {
        let mut query = Query {
            family: Some("docs".to_string()),
            mime: Some("image".to_string()),
            ..Default::default()
        };
        query.accesses.min = Some(2);
        query.meta.insert("title".to_string(), json!(":like:%report%"));
        assert_eq!(
            serde_json::to_value(&query).unwrap(),
            json!({
                "ctime": {"min": null, "max": null},
                "atime": {"min": null, "max": null},
                "accesses": {"min": 2, "max": null},
                "family": "docs",
                "mime": "image",
                "meta": {"title": ":like:%report%"}
            })
        );
    }

    #[test]
    fn status_parses() {
        let raw = json!({
            "process": {"cpu": {"percent": 1.5}, "memory": {"percent": 2.0, "rss": 1024}, "threads": 4},
            "system": {"load": {"t1": 0.1, "t5": 0.2, "t15": 0.3}}
        });
        let status: Status = serde_json::from_value(raw).unwrap();
        assert_eq!(status.process.threads, 4);
        assert_eq!(status.process.memory.rss, 1024);
        assert_eq!(status.system.load.t15, 0.3);
    }

    #[test]
    fn oversized_length_does_not_drive_allocation() {
        let content = Content {
            mime: None,
            length: u64::MAX,
            data: std::io::Cursor::new(b"abc".to_vec()),
        };
        assert_eq!(content.into_bytes().unwrap(), b"abc");
    }
}
