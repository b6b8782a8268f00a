//! Compression registry.
//!
//! # Design
//! The server understands four formats but only gzip has a local codec; bz2 and
//! lzma are recognized so they can be named in requests and read back from
//! response headers, and asking for their transforms fails with
//! `UnsupportedFormat`. Callers use that failure to fall back to server-side
//! compression on upload.
//!
//! Every transform, including the identity for `None`, fully materializes its
//! output into a fresh scratch sink positioned at offset 0.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use flate2::read::{GzDecoder, GzEncoder};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tempfile::SpooledTempFile;
use tracing::debug;

use crate::error::Error;
use crate::transfer::{scratch, transfer};

/// A compression format the server may apply to stored content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionFormat {
    #[default]
    None,
    Gz,
    Bz2,
    Lzma,
}

/// A (de)compression step: consumes the input stream and returns the output
/// in a caller-owned scratch sink.
pub type Transform = fn(&mut dyn Read) -> Result<SpooledTempFile, Error>;

impl CompressionFormat {
    /// Formats with a local codec, advertised to the server on retrieval.
    pub const LOCAL: &'static [CompressionFormat] = &[CompressionFormat::Gz];

    /// Wire name; `None` has no wire representation.
    pub fn wire_name(self) -> Option<&'static str> {
        match self {
            CompressionFormat::None => None,
            CompressionFormat::Gz => Some("gz"),
            CompressionFormat::Bz2 => Some("bz2"),
            CompressionFormat::Lzma => Some("lzma"),
        }
    }

    pub fn is_local(self) -> bool {
        self == CompressionFormat::None || Self::LOCAL.contains(&self)
    }

    /// Parse an optional header value; absence means no compression.
    pub fn from_header(value: Option<&str>) -> Result<Self, Error> {
        match value.map(str::trim) {
            None | Some("") => Ok(CompressionFormat::None),
            Some(value) => value.parse(),
        }
    }

    /// Value of the `Media-Storage-Supported-Compression` header.
    pub fn local_formats_header() -> String {
        Self::LOCAL
            .iter()
            .filter_map(|format| format.wire_name())
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl FromStr for CompressionFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionFormat::None),
            "gz" => Ok(CompressionFormat::Gz),
            "bz2" => Ok(CompressionFormat::Bz2),
            "lzma" => Ok(CompressionFormat::Lzma),
            _ => Err(Error::UnsupportedFormat(s.to_string())),
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name().unwrap_or("none"))
    }
}

// On the wire `None` is JSON null; the other formats are lower-case strings.
impl Serialize for CompressionFormat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.wire_name() {
            Some(name) => serializer.serialize_str(name),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for CompressionFormat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<String>::deserialize(deserializer)?;
        CompressionFormat::from_header(value.as_deref()).map_err(serde::de::Error::custom)
    }
}

/// Look up the compressor for `format`.
pub fn compressor(format: CompressionFormat) -> Result<Transform, Error> {
    match format {
        CompressionFormat::None => Ok(identity),
        CompressionFormat::Gz => Ok(compress_gz),
        other => Err(Error::UnsupportedFormat(other.to_string())),
    }
}

/// Look up the decompressor for `format`.
pub fn decompressor(format: CompressionFormat) -> Result<Transform, Error> {
    match format {
        CompressionFormat::None => Ok(identity),
        CompressionFormat::Gz => Ok(decompress_gz),
        other => Err(Error::UnsupportedFormat(other.to_string())),
    }
}

fn identity(data: &mut dyn Read) -> Result<SpooledTempFile, Error> {
    let mut output = scratch();
    transfer(data, &mut output)?;
    Ok(output)
}

fn compress_gz(data: &mut dyn Read) -> Result<SpooledTempFile, Error> {
    let mut output = scratch();
    let mut encoder = GzEncoder::new(data, flate2::Compression::default());
    let size = transfer(&mut encoder, &mut output)?;
    debug!(size, "compressed payload with gz");
    Ok(output)
}

fn decompress_gz(data: &mut dyn Read) -> Result<SpooledTempFile, Error> {
    let mut output = scratch();
    let mut decoder = GzDecoder::new(data);
    let size = transfer(&mut decoder, &mut output)?;
    debug!(size, "decompressed payload with gz");
    Ok(output)
}
