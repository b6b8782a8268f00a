//! Blocking client for a media-storage server.
//!
//! # Overview
//! Stores, retrieves, describes, updates, unlinks and queries binary records
//! identified by opaque UIDs, either directly or through a local caching or
//! storage proxy.
//!
//! # Design
//! - `resolver` turns a `ServerDescriptor` into a live base URL, either
//!   directly or by walking DNS SRV records with liveness probes.
//! - `http` is the transport engine: it assembles JSON or fixed-boundary
//!   multipart POSTs, runs them with a deadline, and drains bodies into sinks.
//! - `error` is the closed error taxonomy, including the HTTP status table.
//! - `compression` and `transfer` are the byte-stream helpers both of the
//!   above lean on.
//! - `client` and `proxy` are thin facades that shape per-operation JSON.
//!
//! Everything is synchronous and runs on the calling thread. No state is
//! shared between calls beyond the immutable descriptor.

pub mod client;
pub mod compression;
pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod resolver;
pub mod transfer;
pub mod types;

pub use client::{Client, Retrieve};
pub use compression::CompressionFormat;
pub use config::Timeouts;
pub use error::{Error, ErrorKind};
pub use http::{HttpRequest, Properties, RequestEnvelope, ResponseEnvelope, Transport};
pub use proxy::{CachingProxy, StorageProxy};
pub use resolver::{DnsSrvLookup, Endpoint, Probe, Resolver, ServerDescriptor, SrvCandidate, SrvLookup};
pub use transfer::Sink;
pub use types::{
    CompressionPolicy, Content, DeletionPolicy, Description, Keys, PutOptions, Query, Status,
    Storage, Update,
};
