//! Direct client for a media-storage server.
//!
//! # Design
//! `Client` holds only a `ServerDescriptor`, deadlines and an HTTP agent; it
//! carries no state between calls. Every operation resolves the endpoint
//! afresh (a no-op for fixed descriptors), builds the operation's JSON
//! envelope, and hands it to the transport engine. Compression policy lives
//! here, not in the engine: uploads are compressed locally when a codec
//! exists, and downloads are decompressed according to the server's
//! applied-compression header.

use std::io::{Read, Seek};

use serde_json::{json, Value};
use tempfile::SpooledTempFile;
use tracing::{debug, warn};

use crate::compression::{compressor, decompressor, CompressionFormat};
use crate::config::Timeouts;
use crate::error::Error;
use crate::http::{
    RequestEnvelope, ResponseEnvelope, Transport, COMPRESS_ON_SERVER_FALSE, COMPRESS_ON_SERVER_TRUE,
    HEADER_COMPRESS_ON_SERVER, HEADER_SUPPORTED_COMPRESSION, PATH_DESCRIBE, PATH_GET,
    PATH_LIST_FAMILIES, PATH_PING, PATH_PUT, PATH_QUERY, PATH_STATUS, PATH_UNLINK, PATH_UPDATE,
};
use crate::resolver::{DnsSrvLookup, Endpoint, Resolver, ServerDescriptor, SrvLookup};
use crate::transfer::{scratch, transfer, Sink};
use crate::types::{
    Content, Description, Families, PutOptions, Query, QueryResults, Status, Storage, Update,
};

/// Read access shared by the direct client and the caching proxy.
pub trait Retrieve {
    /// Fetch content into `sink`, which is truncated first and returned
    /// rewound. Set `decompress_on_server` to make the server undo its own
    /// compression instead of advertising the local codecs.
    fn get_into<S: Sink>(
        &self,
        uid: &str,
        read_key: Option<&str>,
        decompress_on_server: bool,
        sink: S,
    ) -> Result<Content<S>, Error>;

    /// Fetch a record's metadata.
    fn describe(&self, uid: &str, read_key: Option<&str>) -> Result<Description, Error>;

    /// Fetch content into a scratch sink owned by the caller.
    fn get(
        &self,
        uid: &str,
        read_key: Option<&str>,
        decompress_on_server: bool,
    ) -> Result<Content<SpooledTempFile>, Error> {
        self.get_into(uid, read_key, decompress_on_server, scratch())
    }
}

/// Synchronous client talking straight to the server.
pub struct Client<L = DnsSrvLookup> {
    server: ServerDescriptor,
    resolver: Resolver<L, Transport>,
    transport: Transport,
    timeouts: Timeouts,
}

impl Client<DnsSrvLookup> {
    pub fn new(server: ServerDescriptor) -> Self {
        Self::with_lookup(server, DnsSrvLookup::default())
    }
}

impl<L: SrvLookup> Client<L> {
    /// Use `lookup` for SRV answers instead of the system resolver.
    pub fn with_lookup(server: ServerDescriptor, lookup: L) -> Self {
        let timeouts = Timeouts::default();
        let transport = Transport::new();
        Self {
            server,
            resolver: Resolver::new(lookup, transport.clone(), timeouts.probe),
            transport,
            timeouts,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.resolver.set_probe_timeout(timeouts.probe);
        self.timeouts = timeouts;
        self
    }

    pub fn server(&self) -> &ServerDescriptor {
        &self.server
    }

    fn endpoint(&self) -> Result<Endpoint, Error> {
        self.resolver.resolve(&self.server)
    }

    fn call(
        &self,
        path: &str,
        envelope: RequestEnvelope<'_>,
        deadline: std::time::Duration,
    ) -> Result<ResponseEnvelope<SpooledTempFile>, Error> {
        let endpoint = self.endpoint()?;
        self.transport.send(&endpoint, path, envelope, deadline)
    }

    /// Check that the server answers.
    pub fn ping(&self) -> Result<(), Error> {
        self.call(PATH_PING, RequestEnvelope::new(json!({})), self.timeouts.ping)?
            .json::<Value>()
            .map(drop)
    }

    pub fn status(&self) -> Result<Status, Error> {
        self.call(PATH_STATUS, RequestEnvelope::new(json!({})), self.timeouts.status)?
            .json()
    }

    /// All known families, in the server's order.
    pub fn list_families(&self) -> Result<Vec<String>, Error> {
        let families: Families = self
            .call(PATH_LIST_FAMILIES, RequestEnvelope::new(json!({})), self.timeouts.list_families)?
            .json()?;
        Ok(families.families)
    }

    /// Store `data` with MIME type `mime`.
    ///
    /// Unless `compress_on_server` is set, the requested compression is tried
    /// locally first. A format without a local codec is sent raw, flagged for
    /// the server to compress.
    pub fn put(&self, data: &mut dyn Read, mime: &str, options: PutOptions) -> Result<Storage, Error> {
        let mut upload = prepare_upload(data, &options)?;
        let length = upload.content.size()?;
        upload.content.rewind()?;
        let envelope = RequestEnvelope::new(put_header(mime, &options))
            .with_header(HEADER_COMPRESS_ON_SERVER, upload.compress_on_server)
            .with_payload(&mut upload.content, length);
        let storage: Storage = self.call(PATH_PUT, envelope, self.timeouts.put)?.json()?;
        debug!(uid = %storage.uid, "stored record");
        Ok(storage)
    }

    /// Unlink a record; its content is removed by the server.
    pub fn unlink(&self, uid: &str, write_key: Option<&str>) -> Result<(), Error> {
        let envelope = RequestEnvelope::new(json!({"uid": uid, "keys": {"write": write_key}}));
        self.call(PATH_UNLINK, envelope, self.timeouts.unlink).map(drop)
    }

    /// Merge `update.new_meta`, drop `update.removed_meta`, and replace any
    /// policy that is set.
    pub fn update(&self, uid: &str, write_key: Option<&str>, update: Update) -> Result<(), Error> {
        let envelope = RequestEnvelope::new(json!({
            "uid": uid,
            "keys": {"write": write_key},
            "policy": {
                "delete": update.deletion_policy,
                "compress": update.compression_policy,
            },
            "meta": {
                "new": update.new_meta,
                "removed": update.removed_meta,
            },
        }));
        self.call(PATH_UPDATE, envelope, self.timeouts.update).map(drop)
    }

    /// Matching records, up to the server's limit. To page, rerun with
    /// `ctime.min` set past the newest record received.
    pub fn query(&self, query: &Query) -> Result<Vec<Description>, Error> {
        let envelope = RequestEnvelope::from_serialize(query)?;
        let results: QueryResults = self.call(PATH_QUERY, envelope, self.timeouts.query)?.json()?;
        Ok(results.records)
    }
}

impl<L: SrvLookup> Retrieve for Client<L> {
    fn get_into<S: Sink>(
        &self,
        uid: &str,
        read_key: Option<&str>,
        decompress_on_server: bool,
        sink: S,
    ) -> Result<Content<S>, Error> {
        let mut envelope = RequestEnvelope::new(read_header(uid, read_key));
        if !decompress_on_server {
            envelope = envelope.with_header(
                HEADER_SUPPORTED_COMPRESSION,
                CompressionFormat::local_formats_header(),
            );
        }
        let endpoint = self.endpoint()?;
        let response = self
            .transport
            .send_into(&endpoint, PATH_GET, envelope, self.timeouts.get, sink)?;
        into_content(response)
    }

    fn describe(&self, uid: &str, read_key: Option<&str>) -> Result<Description, Error> {
        let envelope = RequestEnvelope::new(read_header(uid, read_key));
        self.call(PATH_DESCRIBE, envelope, self.timeouts.describe)?.json()
    }
}

/// Upload content staged in a scratch sink, and the compress-on-server flag
/// that goes with it.
pub(crate) struct Upload {
    pub content: SpooledTempFile,
    pub compress_on_server: &'static str,
}

/// Compress `data` locally when a codec exists and the caller did not ask
/// for server-side compression; otherwise stage it raw and flag the server.
pub(crate) fn prepare_upload(data: &mut dyn Read, options: &PutOptions) -> Result<Upload, Error> {
    if !options.compress_on_server {
        match compressor(options.compression) {
            Ok(compress) => {
                return Ok(Upload {
                    content: compress(data)?,
                    compress_on_server: COMPRESS_ON_SERVER_FALSE,
                });
            }
            Err(e) => warn!(error = %e, "compressing locally failed; deferring to the server"),
        }
    }
    let mut content = scratch();
    transfer(data, &mut content)?;
    Ok(Upload {
        content,
        compress_on_server: COMPRESS_ON_SERVER_TRUE,
    })
}

pub(crate) fn read_header(uid: &str, read_key: Option<&str>) -> Value {
    json!({"uid": uid, "keys": {"read": read_key}})
}

pub(crate) fn put_header(mime: &str, options: &PutOptions) -> Value {
    json!({
        "uid": options.uid,
        "keys": options.keys,
        "meta": options.meta,
        "physical": {
            "family": options.family,
            "format": {
                "mime": mime,
                "ext": options.extension,
                "comp": options.compression,
            },
        },
        "policy": {
            "delete": options.deletion_policy,
            "compress": options.compression_policy,
        },
    })
}

/// Undo the server's applied compression in place: the decompressed bytes
/// replace the raw ones in the same sink, rewound to offset 0.
pub(crate) fn into_content<S: Sink>(response: ResponseEnvelope<S>) -> Result<Content<S>, Error> {
    let ResponseEnvelope {
        properties,
        body: mut data,
    } = response;
    let mut length = properties.content_length;

    if properties.applied_compression != CompressionFormat::None {
        let decompress = decompressor(properties.applied_compression)?;
        let mut decompressed = decompress(&mut data)?;
        data.truncate()?;
        length = transfer(&mut decompressed, &mut data)?;
        debug!(
            format = %properties.applied_compression,
            raw = properties.content_length,
            length,
            "decompressed response body"
        );
    }

    Ok(Content {
        mime: properties.content_type,
        length,
        data,
    })
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use flate2::write::GzEncoder;

    use super::*;
    use crate::http::Properties;
    use crate::types::{CompressionPolicy, DeletionPolicy, Keys};

    #[test]
    fn put_header_shape() {
        let options = PutOptions {
            family: Some("scans".to_string()),
            extension: Some("png".to_string()),
            compression: CompressionFormat::Gz,
            deletion_policy: Some(DeletionPolicy {
                fixed: Some(60.0),
                ..Default::default()
            }),
            compression_policy: Some(CompressionPolicy {
                stale: Some(10.0),
                comp: CompressionFormat::Lzma,
                ..Default::default()
            }),
            keys: Some(Keys {
                read: None,
                write: Some("w".to_string()),
            }),
            ..Default::default()
        };
        let header = put_header("image/png", &options);
        assert_eq!(
            header,
            json!({
                "uid": null,
                "keys": {"read": null, "write": "w"},
                "meta": null,
                "physical": {"family": "scans", "format": {"mime": "image/png", "ext": "png", "comp": "gz"}},
                "policy": {"delete": {"fixed": 60.0}, "compress": {"stale": 10.0, "comp": "lzma"}}
            })
        );
    }

    #[test]
    fn uncompressed_put_sends_null_comp() {
        let header = put_header("text/plain", &PutOptions::default());
        assert_eq!(header["physical"]["format"]["comp"], Value::Null);
        assert_eq!(header["policy"], json!({"delete": null, "compress": null}));
    }

    fn stage(data: &[u8], options: PutOptions) -> (Vec<u8>, &'static str) {
        let mut upload = prepare_upload(&mut &data[..], &options).unwrap();
        let mut staged = Vec::new();
        upload.content.read_to_end(&mut staged).unwrap();
        (staged, upload.compress_on_server)
    }

    #[test]
    fn local_codec_compresses_and_tells_server_not_to() {
        let data = b"squeeze this ".repeat(100);
        let (staged, flag) = stage(
            &data,
            PutOptions {
                compression: CompressionFormat::Gz,
                ..Default::default()
            },
        );
        assert_eq!(flag, COMPRESS_ON_SERVER_FALSE);
        let mut restored = Vec::new();
        flate2::read::GzDecoder::new(&staged[..])
            .read_to_end(&mut restored)
            .unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn uncompressed_upload_is_sent_as_is() {
        let (staged, flag) = stage(b"plain", PutOptions::default());
        assert_eq!(flag, COMPRESS_ON_SERVER_FALSE);
        assert_eq!(staged, b"plain");
    }

    #[test]
    fn server_only_format_falls_back_to_raw_upload() {
        for compression in [CompressionFormat::Bz2, CompressionFormat::Lzma] {
            let (staged, flag) = stage(
                b"raw bytes",
                PutOptions {
                    compression,
                    ..Default::default()
                },
            );
            assert_eq!(flag, COMPRESS_ON_SERVER_TRUE, "{compression}");
            assert_eq!(staged, b"raw bytes");
        }
    }

    #[test]
    fn compress_on_server_skips_the_local_codec() {
        let (staged, flag) = stage(
            b"leave me be",
            PutOptions {
                compression: CompressionFormat::Gz,
                compress_on_server: true,
                ..Default::default()
            },
        );
        assert_eq!(flag, COMPRESS_ON_SERVER_TRUE);
        assert_eq!(staged, b"leave me be");
    }

    #[test]
    fn read_header_shape() {
        assert_eq!(read_header("u1", None), json!({"uid": "u1", "keys": {"read": null}}));
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn gz_response_is_decompressed_into_the_callers_sink() {
        let original = b"a body that was compressed by the server".repeat(20);
        let raw = gzip(&original);
        let mut sink = Cursor::new(Vec::new());
        sink.get_mut().extend_from_slice(&raw);

        let response = ResponseEnvelope {
            properties: Properties {
                content_type: Some("text/plain".to_string()),
                content_length: raw.len() as u64,
                applied_compression: CompressionFormat::Gz,
            },
            body: &mut sink,
        };
        let content = into_content(response).unwrap();
        assert_eq!(content.length, original.len() as u64);
        assert_eq!(content.mime.as_deref(), Some("text/plain"));
        drop(content);
        assert_eq!(sink.position(), 0);
        assert_eq!(sink.get_ref(), &original);
    }

    #[test]
    fn uncompressed_response_passes_through() {
        let response = ResponseEnvelope {
            properties: Properties {
                content_type: None,
                content_length: 3,
                applied_compression: CompressionFormat::None,
            },
            body: Cursor::new(b"abc".to_vec()),
        };
        let content = into_content(response).unwrap();
        assert_eq!(content.length, 3);
        assert_eq!(content.into_bytes().unwrap(), b"abc");
    }

    #[test]
    fn server_only_format_in_response_is_an_error() {
        let response = ResponseEnvelope {
            properties: Properties {
                content_type: None,
                content_length: 3,
                applied_compression: CompressionFormat::Bz2,
            },
            body: Cursor::new(b"abc".to_vec()),
        };
        assert!(matches!(into_content(response), Err(Error::UnsupportedFormat(_))));
    }
}
