//! Clients for the local caching and storage proxies.
//!
//! Both proxies run next to the caller and forward to the real server, which
//! is named in every request as `"proxy": {"server": <descriptor>}`. The
//! proxy endpoint itself is fixed, so no resolution happens here.

use std::path::Path;

use serde_json::{json, Value};
use tracing::debug;

use crate::client::{into_content, put_header, read_header, Retrieve};
use crate::config::Timeouts;
use crate::error::Error;
use crate::http::{RequestEnvelope, Transport, PATH_DESCRIBE, PATH_GET, PATH_PING, PATH_PUT};
use crate::resolver::{Endpoint, ServerDescriptor};
use crate::transfer::Sink;
use crate::types::{Content, Description, PutOptions, Storage};

fn local_proxy(port: u16) -> Endpoint {
    Endpoint::new("localhost", port, false)
}

/// Attach the proxy block to an operation's header.
fn with_proxy(mut header: Value, proxy: Value) -> Value {
    if let Value::Object(map) = &mut header {
        map.insert("proxy".to_string(), proxy);
    }
    header
}

fn ping(transport: &Transport, endpoint: &Endpoint, timeouts: &Timeouts) -> Result<(), Error> {
    transport
        .send(endpoint, PATH_PING, RequestEnvelope::new(json!({})), timeouts.ping)?
        .json::<Value>()
        .map(drop)
}

/// Read-through cache in front of a server. The proxy always decompresses,
/// so `decompress_on_server` has no effect.
pub struct CachingProxy {
    server: ServerDescriptor,
    proxy: Endpoint,
    transport: Transport,
    timeouts: Timeouts,
}

impl CachingProxy {
    /// Proxy listening on `localhost:<proxy_port>`.
    pub fn new(server: ServerDescriptor, proxy_port: u16) -> Self {
        Self::with_endpoint(server, local_proxy(proxy_port))
    }

    pub fn with_endpoint(server: ServerDescriptor, proxy: Endpoint) -> Self {
        Self {
            server,
            proxy,
            transport: Transport::new(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn ping(&self) -> Result<(), Error> {
        ping(&self.transport, &self.proxy, &self.timeouts)
    }

    fn header(&self, uid: &str, read_key: Option<&str>) -> Value {
        with_proxy(read_header(uid, read_key), json!({"server": self.server}))
    }
}

impl Retrieve for CachingProxy {
    fn get_into<S: Sink>(
        &self,
        uid: &str,
        read_key: Option<&str>,
        _decompress_on_server: bool,
        sink: S,
    ) -> Result<Content<S>, Error> {
        let envelope = RequestEnvelope::new(self.header(uid, read_key));
        let response = self
            .transport
            .send_into(&self.proxy, PATH_GET, envelope, self.timeouts.get, sink)?;
        into_content(response)
    }

    fn describe(&self, uid: &str, read_key: Option<&str>) -> Result<Description, Error> {
        let envelope = RequestEnvelope::new(self.header(uid, read_key));
        self.transport
            .send(&self.proxy, PATH_DESCRIBE, envelope, self.timeouts.describe)?
            .json()
    }
}

/// Deferred-upload proxy: it is handed a local file path and delivers the
/// file to the server on its own schedule.
pub struct StorageProxy {
    server: ServerDescriptor,
    proxy: Endpoint,
    transport: Transport,
    timeouts: Timeouts,
}

impl StorageProxy {
    /// Proxy listening on `localhost:<proxy_port>`.
    pub fn new(server: ServerDescriptor, proxy_port: u16) -> Self {
        Self::with_endpoint(server, local_proxy(proxy_port))
    }

    pub fn with_endpoint(server: ServerDescriptor, proxy: Endpoint) -> Self {
        Self {
            server,
            proxy,
            transport: Transport::new(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn ping(&self) -> Result<(), Error> {
        ping(&self.transport, &self.proxy, &self.timeouts)
    }

    /// Queue the file at `path` for storage. The proxy applies compression,
    /// so `options.compress_on_server` is not consulted. The returned keys are
    /// valid once the proxy has delivered the file.
    pub fn put(&self, path: &Path, mime: &str, options: PutOptions) -> Result<Storage, Error> {
        let header = with_proxy(
            put_header(mime, &options),
            json!({"server": self.server, "data": path.to_string_lossy()}),
        );
        let storage: Storage = self
            .transport
            .send(&self.proxy, PATH_PUT, RequestEnvelope::new(header), self.timeouts.proxy_put)?
            .json()?;
        debug!(uid = %storage.uid, path = %path.display(), "queued record with storage proxy");
        Ok(storage)
    }
}
