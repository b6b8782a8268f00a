//! Transport engine: one POST per call, JSON or multipart in, sink out.
//!
//! # Design
//! Assembly and execution are split. [`RequestEnvelope::assemble`] turns a JSON
//! header, optional extra headers and an optional binary payload into an
//! [`HttpRequest`] without touching the network, so the framing can be checked
//! byte for byte. The payload itself is only read when [`Transport::execute`]
//! streams it between the multipart preamble and trailer under an explicit
//! `Content-Length`. `execute` also applies the deadline, maps non-2xx
//! statuses and connection failures onto [`Error`] (including a deadline hit
//! mid-body), and drains the body into a [`Sink`] rewound to offset 0.
//!
//! The engine never decompresses. It reports the server's
//! `Media-Storage-Applied-Compression` header and leaves the raw bytes to the
//! caller. It never retries either.

use std::io::{self, Read};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tempfile::SpooledTempFile;
use tracing::debug;
use ureq::SendBody;

use crate::compression::CompressionFormat;
use crate::error::Error;
use crate::resolver::{Endpoint, Probe};
use crate::transfer::{scratch, transfer, Sink};

pub const PATH_PING: &str = "ping";
pub const PATH_STATUS: &str = "status";
pub const PATH_LIST_FAMILIES: &str = "list/families";
pub const PATH_PUT: &str = "put";
pub const PATH_GET: &str = "get";
pub const PATH_DESCRIBE: &str = "describe";
pub const PATH_UNLINK: &str = "unlink";
pub const PATH_UPDATE: &str = "update";
pub const PATH_QUERY: &str = "query";

pub const HEADER_COMPRESS_ON_SERVER: &str = "Media-Storage-Compress-On-Server";
pub const HEADER_SUPPORTED_COMPRESSION: &str = "Media-Storage-Supported-Compression";
pub const HEADER_APPLIED_COMPRESSION: &str = "Media-Storage-Applied-Compression";
pub const COMPRESS_ON_SERVER_TRUE: &str = "yes";
pub const COMPRESS_ON_SERVER_FALSE: &str = "no";

/// Fixed multipart boundary expected by the server.
pub const FORM_BOUNDARY: &str = "---...???,,,$$$RFC-1867-kOmPl1aNt-bOuNdArY$$$,,,???...---";

const CONTENT_TYPE: &str = "Content-Type";
const CONTENT_LENGTH: &str = "Content-Length";
const JSON_CONTENT_TYPE: &str = "application/json";

fn form_content_type() -> String {
    format!("multipart/form-data; boundary={FORM_BOUNDARY}")
}

fn form_header() -> String {
    format!("--{FORM_BOUNDARY}\r\nContent-Disposition: form-data; name=\"header\"\r\n\r\n")
}

fn form_pre_content() -> String {
    format!(
        "\r\n--{FORM_BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"content\"; filename=\"payload\"\r\n\
         Content-Type: application/octet-stream\r\n\
         Content-Transfer-Encoding: binary\r\n\r\n"
    )
}

fn form_footer() -> String {
    format!("\r\n--{FORM_BOUNDARY}--\r\n")
}

/// Binary content streamed between the multipart preamble and trailer.
pub struct Payload<'a> {
    pub content: &'a mut dyn Read,
    /// Exact number of bytes `content` yields.
    pub length: u64,
}

/// An HTTP POST described as data: fixed framing around an optional
/// streamed payload.
pub struct HttpRequest<'a> {
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// The whole body without a payload, else everything before it.
    pub body: Vec<u8>,
    pub payload: Option<Payload<'a>>,
    /// Closing multipart delimiter; empty without a payload.
    pub trailer: Vec<u8>,
}

impl HttpRequest<'_> {
    /// Value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> u64 {
        self.body.len() as u64
            + self.payload.as_ref().map_or(0, |p| p.length)
            + self.trailer.len() as u64
    }
}

/// What a caller wants sent: the JSON header, extra HTTP headers, and an
/// optional binary payload.
pub struct RequestEnvelope<'a> {
    header: Value,
    headers: Vec<(String, String)>,
    payload: Option<Payload<'a>>,
}

impl<'a> RequestEnvelope<'a> {
    pub fn new(header: Value) -> Self {
        Self {
            header,
            headers: Vec::new(),
            payload: None,
        }
    }

    /// Serialize any `Serialize` value as the JSON header.
    pub fn from_serialize<T: serde::Serialize>(header: &T) -> Result<Self, Error> {
        Ok(Self::new(serde_json::to_value(header).map_err(Error::Serialization)?))
    }

    /// Add an HTTP header. It replaces any default of the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach `length` bytes of `content`, streamed when the request is sent.
    pub fn with_payload(mut self, content: &'a mut dyn Read, length: u64) -> Self {
        self.payload = Some(Payload { content, length });
        self
    }

    /// Build the POST to `endpoint` + `path`.
    ///
    /// Without a payload the body is the JSON header. With one, the body is a
    /// two-part `multipart/form-data` envelope: `header` carries the JSON and
    /// `content` carries the payload verbatim. The payload is not read here.
    pub fn assemble(self, endpoint: &Endpoint, path: &str) -> Result<HttpRequest<'a>, Error> {
        let json = serde_json::to_vec(&self.header).map_err(Error::Serialization)?;

        let mut content_type = JSON_CONTENT_TYPE.to_string();
        let (body, trailer) = match self.payload {
            None => (json, Vec::new()),
            Some(_) => {
                let mut preamble = form_header().into_bytes();
                preamble.extend_from_slice(&json);
                preamble.extend_from_slice(form_pre_content().as_bytes());
                content_type = form_content_type();
                (preamble, form_footer().into_bytes())
            }
        };

        let mut request = HttpRequest {
            url: endpoint.url_for(path),
            headers: vec![(CONTENT_TYPE.to_string(), content_type)],
            body,
            payload: self.payload,
            trailer,
        };
        let length = request.content_length();
        request.headers.push((CONTENT_LENGTH.to_string(), length.to_string()));

        for (name, value) in self.headers {
            match request.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
                Some(existing) => existing.1 = value,
                None => request.headers.push((name, value)),
            }
        }
        Ok(request)
    }
}

/// Properties read from a successful response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Properties {
    pub content_type: Option<String>,
    /// Number of body bytes drained into the sink.
    pub content_length: u64,
    pub applied_compression: CompressionFormat,
}

/// A successful response: its properties and the body, rewound to offset 0.
#[derive(Debug)]
pub struct ResponseEnvelope<B> {
    pub properties: Properties,
    pub body: B,
}

impl<B: Read> ResponseEnvelope<B> {
    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(mut self) -> Result<T, Error> {
        let mut raw = String::new();
        self.body.read_to_string(&mut raw)?;
        if raw.trim().is_empty() {
            raw = "{}".to_string();
        }
        serde_json::from_str(&raw).map_err(|source| Error::InvalidJson { raw, source })
    }
}

/// Blocking HTTP transport.
#[derive(Debug, Clone)]
pub struct Transport {
    agent: ureq::Agent,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .new_agent();
        Self { agent }
    }

    /// Assemble and send, draining the body into a fresh scratch sink.
    pub fn send(
        &self,
        endpoint: &Endpoint,
        path: &str,
        envelope: RequestEnvelope<'_>,
        deadline: Duration,
    ) -> Result<ResponseEnvelope<SpooledTempFile>, Error> {
        let request = envelope.assemble(endpoint, path)?;
        self.execute(request, deadline, scratch())
    }

    /// Assemble and send, draining the body into `sink`.
    pub fn send_into<S: Sink>(
        &self,
        endpoint: &Endpoint,
        path: &str,
        envelope: RequestEnvelope<'_>,
        deadline: Duration,
        sink: S,
    ) -> Result<ResponseEnvelope<S>, Error> {
        let request = envelope.assemble(endpoint, path)?;
        self.execute(request, deadline, sink)
    }

    /// Perform one exchange. `deadline` bounds the whole round trip.
    pub fn execute<S: Sink>(
        &self,
        request: HttpRequest<'_>,
        deadline: Duration,
        mut sink: S,
    ) -> Result<ResponseEnvelope<S>, Error> {
        let length = request.content_length();
        let HttpRequest {
            url,
            headers,
            body,
            payload,
            trailer,
        } = request;
        debug!(%url, bytes = length, "sending request");

        let mut builder = self
            .agent
            .post(&url)
            .config()
            .timeout_global(Some(deadline))
            .build();
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let mut nothing = io::empty();
        let content: &mut dyn Read = match payload {
            Some(payload) => payload.content,
            None => &mut nothing,
        };
        let mut wire = body.as_slice().chain(content).chain(trailer.as_slice());
        let mut response = builder.send(SendBody::from_reader(&mut wire))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            debug!(%url, status, "server rejected request");
            return Err(Error::from_status(status));
        }

        let headers = response.headers();
        let content_type = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let applied_compression = CompressionFormat::from_header(
            headers
                .get(HEADER_APPLIED_COMPRESSION)
                .and_then(|v| v.to_str().ok()),
        )?;

        sink.truncate()?;
        let content_length = transfer(&mut response.body_mut().as_reader(), &mut sink)
            .map_err(Error::from_body_read)?;
        debug!(%url, status, content_length, %applied_compression, "received response");

        Ok(ResponseEnvelope {
            properties: Properties {
                content_type,
                content_length,
                applied_compression,
            },
            body: sink,
        })
    }
}

impl Probe for Transport {
    /// Send the minimal `ping` exchange; any failure marks the endpoint dead.
    fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> Result<(), Error> {
        let envelope = RequestEnvelope::new(Value::Object(Default::default()));
        self.send(endpoint, PATH_PING, envelope, timeout).map(drop)
    }
}
