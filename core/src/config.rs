//! Per-operation deadlines.
//!
//! Defaults match what the server's reference clients have always used. The
//! struct deserializes with every field optional, so a host application can
//! embed it in its own configuration and override only what it needs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deadlines, in seconds on the wire and as `Duration` in code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(with = "secs")]
    pub probe: Duration,
    #[serde(with = "secs")]
    pub ping: Duration,
    #[serde(with = "secs")]
    pub status: Duration,
    #[serde(with = "secs")]
    pub list_families: Duration,
    #[serde(with = "secs")]
    pub put: Duration,
    #[serde(with = "secs")]
    pub get: Duration,
    #[serde(with = "secs")]
    pub describe: Duration,
    #[serde(with = "secs")]
    pub unlink: Duration,
    #[serde(with = "secs")]
    pub update: Duration,
    #[serde(with = "secs")]
    pub query: Duration,
    /// Handing a file to a local storage proxy.
    #[serde(with = "secs")]
    pub proxy_put: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(1),
            ping: Duration::from_secs(1),
            status: Duration::from_millis(2500),
            list_families: Duration::from_millis(2500),
            put: Duration::from_secs(10),
            get: Duration::from_secs(5),
            describe: Duration::from_millis(2500),
            unlink: Duration::from_millis(2500),
            update: Duration::from_millis(2500),
            query: Duration::from_secs(5),
            proxy_put: Duration::from_secs(3),
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
