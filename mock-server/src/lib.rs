//! In-memory media-storage server for exercising the client over real HTTP.
//!
//! # Design
//! Every route is a POST carrying a JSON header, either as the whole body or
//! as the `header` field of a multipart form whose `content` field holds the
//! record's bytes. Records live in a map behind a lock. Only `gz` is
//! implemented; a record stored compressed is sent back raw to clients that
//! advertise `gz`, and inflated for everyone else.
//!
//! Requests that name a `proxy.data` path have their content read from that
//! file, so the same server stands in for the storage proxy in tests.

use std::{
    collections::{BTreeSet, HashMap},
    io::{Read, Write},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

pub const FORM_BOUNDARY: &str = "---...???,,,$$$RFC-1867-kOmPl1aNt-bOuNdArY$$$,,,???...---";
pub const HEADER_COMPRESS_ON_SERVER: &str = "media-storage-compress-on-server";
pub const HEADER_SUPPORTED_COMPRESSION: &str = "media-storage-supported-compression";
pub const HEADER_APPLIED_COMPRESSION: &str = "media-storage-applied-compression";

const GZ: &str = "gz";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Keys {
    #[serde(default)]
    pub read: Option<String>,
    #[serde(default)]
    pub write: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Record {
    pub uid: String,
    pub keys: Keys,
    pub family: Option<String>,
    pub mime: String,
    /// Compression the stored bytes are in, if any.
    pub comp: Option<String>,
    pub data: Vec<u8>,
    pub meta: Map<String, Value>,
    pub delete: Value,
    pub compress: Value,
    pub ctime: f64,
    pub atime: f64,
    pub accesses: u64,
}

impl Record {
    fn describe(&self) -> Value {
        json!({
            "uid": self.uid,
            "physical": {
                "ctime": self.ctime,
                "atime": self.atime,
                "family": self.family,
                "format": {"mime": self.mime, "comp": self.comp},
            },
            "policy": {"delete": self.delete, "compress": self.compress},
            "stats": {"accesses": self.accesses},
            "meta": self.meta,
        })
    }
}

#[derive(Deserialize)]
struct PutHeader {
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    keys: Option<Keys>,
    #[serde(default)]
    meta: Option<Map<String, Value>>,
    #[serde(default)]
    physical: Option<PutPhysical>,
    #[serde(default)]
    policy: Option<PolicyHeader>,
    #[serde(default)]
    proxy: Option<ProxyHeader>,
}

#[derive(Deserialize)]
struct PutPhysical {
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    format: Option<PutFormat>,
}

#[derive(Deserialize)]
struct PutFormat {
    #[serde(default)]
    mime: Option<String>,
    #[serde(default)]
    comp: Option<String>,
}

#[derive(Default, Deserialize)]
struct PolicyHeader {
    #[serde(default)]
    delete: Value,
    #[serde(default)]
    compress: Value,
}

#[derive(Deserialize)]
struct ProxyHeader {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Deserialize)]
struct RecordHeader {
    uid: String,
    #[serde(default)]
    keys: Keys,
}

#[derive(Deserialize)]
struct UpdateHeader {
    uid: String,
    #[serde(default)]
    keys: Keys,
    #[serde(default)]
    policy: PolicyHeader,
    #[serde(default)]
    meta: MetaChanges,
}

#[derive(Default, Deserialize)]
struct MetaChanges {
    #[serde(default)]
    new: Map<String, Value>,
    #[serde(default)]
    removed: Vec<String>,
}

#[derive(Default, Deserialize)]
struct Bounds {
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
}

impl Bounds {
    fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

#[derive(Default, Deserialize)]
struct QueryHeader {
    #[serde(default)]
    ctime: Bounds,
    #[serde(default)]
    atime: Bounds,
    #[serde(default)]
    accesses: Bounds,
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    mime: Option<String>,
    #[serde(default)]
    meta: Map<String, Value>,
}

impl QueryHeader {
    fn matches(&self, record: &Record) -> bool {
        let mime = match self.mime.as_deref() {
            None => true,
            Some(wanted) if wanted.contains('/') => record.mime == wanted,
            Some(wanted) => record.mime.split('/').next() == Some(wanted),
        };
        mime && self.ctime.contains(record.ctime)
            && self.atime.contains(record.atime)
            && self.accesses.contains(record.accesses as f64)
            && self.family.as_ref().map_or(true, |f| record.family.as_ref() == Some(f))
            && self.meta.iter().all(|(k, v)| record.meta.get(k) == Some(v))
    }
}

pub type Db = Arc<RwLock<HashMap<String, Record>>>;

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(HashMap::new()));
    Router::new()
        .route("/ping", post(ping))
        .route("/status", post(status))
        .route("/list/families", post(list_families))
        .route("/put", post(put))
        .route("/get", post(get))
        .route("/describe", post(describe))
        .route("/unlink", post(unlink))
        .route("/update", post(update))
        .route("/query", post(query))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"))
}

/// Split a body into its JSON header and optional content.
///
/// The boundary contains characters most form parsers refuse, so the parts
/// are cut out by hand.
pub fn split_form(body: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let delimiter = format!("--{FORM_BOUNDARY}");
    let mut header = None;
    let mut content = None;
    let mut rest = body;
    while let Some(start) = find(rest, delimiter.as_bytes()) {
        rest = &rest[start + delimiter.len()..];
        if rest.starts_with(b"--") {
            break;
        }
        let end = find(rest, delimiter.as_bytes()).unwrap_or(rest.len());
        let part = &rest[..end];
        let split = find(part, b"\r\n\r\n")?;
        let disposition = String::from_utf8_lossy(&part[..split]);
        let value = part[split + 4..].strip_suffix(b"\r\n").unwrap_or(&part[split + 4..]);
        if disposition.contains("name=\"header\"") {
            header = Some(value.to_vec());
        } else if disposition.contains("name=\"content\"") {
            content = Some(value.to_vec());
        }
    }
    Some((header?, content.unwrap_or_default()))
}

fn parse_header<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StatusCode> {
    let bytes = if bytes.iter().all(u8::is_ascii_whitespace) {
        &b"{}"[..]
    } else {
        bytes
    };
    serde_json::from_slice(bytes).map_err(|e| {
        warn!(error = %e, "rejecting malformed header");
        StatusCode::BAD_REQUEST
    })
}

fn key_matches(expected: &Option<String>, given: &Option<String>) -> bool {
    expected.is_none() || expected == given
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn internal(e: std::io::Error) -> StatusCode {
    warn!(error = %e, "codec failure");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn ping() -> Json<Value> {
    Json(json!({}))
}

async fn status() -> Json<Value> {
    Json(json!({
        "process": {"cpu": {"percent": 0.5}, "memory": {"percent": 1.5, "rss": 4096}, "threads": 4},
        "system": {"load": {"t1": 0.1, "t5": 0.2, "t15": 0.3}},
    }))
}

async fn list_families(State(db): State<Db>) -> Json<Value> {
    let records = db.read().await;
    let families: BTreeSet<&str> = records.values().filter_map(|r| r.family.as_deref()).collect();
    Json(json!({ "families": families }))
}

async fn put(
    State(db): State<Db>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    let (raw_header, mut data) = if is_multipart(&headers) {
        split_form(&body).ok_or(StatusCode::BAD_REQUEST)?
    } else {
        (body.to_vec(), Vec::new())
    };
    let input: PutHeader = parse_header(&raw_header)?;

    if let Some(path) = input.proxy.as_ref().and_then(|p| p.data.as_deref()) {
        data = tokio::fs::read(path).await.map_err(|e| {
            warn!(path, error = %e, "proxied content unreadable");
            StatusCode::CONFLICT
        })?;
    }

    let physical = input.physical.ok_or(StatusCode::CONFLICT)?;
    let format = physical.format.ok_or(StatusCode::CONFLICT)?;
    let mime = format.mime.ok_or(StatusCode::CONFLICT)?;

    let compress_on_server = headers
        .get(HEADER_COMPRESS_ON_SERVER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("yes"));
    let comp = match format.comp.as_deref() {
        Some(GZ) if compress_on_server => {
            data = gzip(&data).map_err(internal)?;
            Some(GZ.to_string())
        }
        Some(GZ) => Some(GZ.to_string()),
        // Other formats are accepted but stored as sent.
        _ => None,
    };

    let uid = input.uid.unwrap_or_else(|| Uuid::new_v4().to_string());
    let keys = input.keys.unwrap_or_else(|| Keys {
        read: Some(Uuid::new_v4().to_string()),
        write: Some(Uuid::new_v4().to_string()),
    });
    let policy = input.policy.unwrap_or_default();

    let mut records = db.write().await;
    if records.contains_key(&uid) {
        return Err(StatusCode::CONFLICT);
    }
    let ctime = now();
    debug!(%uid, %mime, bytes = data.len(), ?comp, "stored record");
    records.insert(
        uid.clone(),
        Record {
            uid: uid.clone(),
            keys: keys.clone(),
            family: physical.family,
            mime,
            comp,
            data,
            meta: input.meta.unwrap_or_default(),
            delete: policy.delete,
            compress: policy.compress,
            ctime,
            atime: ctime,
            accesses: 0,
        },
    );
    Ok(Json(json!({ "uid": uid, "keys": keys })))
}

async fn get(State(db): State<Db>, headers: HeaderMap, body: Bytes) -> Result<Response, StatusCode> {
    let input: RecordHeader = parse_header(&body)?;
    let mut records = db.write().await;
    let record = records.get_mut(&input.uid).ok_or(StatusCode::NOT_FOUND)?;
    if !key_matches(&record.keys.read, &input.keys.read) {
        return Err(StatusCode::FORBIDDEN);
    }
    record.accesses += 1;
    record.atime = now();

    let accepts_gz = headers
        .get(HEADER_SUPPORTED_COMPRESSION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split([';', ',']).any(|f| f.trim().eq_ignore_ascii_case(GZ)));

    let mut response_headers = HeaderMap::new();
    if let Ok(mime) = HeaderValue::from_str(&record.mime) {
        response_headers.insert(header::CONTENT_TYPE, mime);
    }
    let data = match record.comp.as_deref() {
        Some(GZ) if accepts_gz => {
            response_headers.insert(HEADER_APPLIED_COMPRESSION, HeaderValue::from_static(GZ));
            record.data.clone()
        }
        Some(GZ) => gunzip(&record.data).map_err(internal)?,
        _ => record.data.clone(),
    };
    debug!(uid = %record.uid, bytes = data.len(), accepts_gz, "serving record");
    Ok((response_headers, data).into_response())
}

async fn describe(State(db): State<Db>, body: Bytes) -> Result<Json<Value>, StatusCode> {
    let input: RecordHeader = parse_header(&body)?;
    let records = db.read().await;
    let record = records.get(&input.uid).ok_or(StatusCode::NOT_FOUND)?;
    if !key_matches(&record.keys.read, &input.keys.read) {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(Json(record.describe()))
}

async fn unlink(State(db): State<Db>, body: Bytes) -> Result<Json<Value>, StatusCode> {
    let input: RecordHeader = parse_header(&body)?;
    let mut records = db.write().await;
    let record = records.get(&input.uid).ok_or(StatusCode::NOT_FOUND)?;
    if !key_matches(&record.keys.write, &input.keys.write) {
        return Err(StatusCode::FORBIDDEN);
    }
    records.remove(&input.uid);
    debug!(uid = %input.uid, "unlinked record");
    Ok(Json(json!({})))
}

async fn update(State(db): State<Db>, body: Bytes) -> Result<Json<Value>, StatusCode> {
    let input: UpdateHeader = parse_header(&body)?;
    let mut records = db.write().await;
    let record = records.get_mut(&input.uid).ok_or(StatusCode::NOT_FOUND)?;
    if !key_matches(&record.keys.write, &input.keys.write) {
        return Err(StatusCode::FORBIDDEN);
    }
    record.meta.extend(input.meta.new);
    for key in &input.meta.removed {
        record.meta.remove(key);
    }
    if !input.policy.delete.is_null() {
        record.delete = input.policy.delete;
    }
    if !input.policy.compress.is_null() {
        record.compress = input.policy.compress;
    }
    Ok(Json(json!({})))
}

async fn query(State(db): State<Db>, body: Bytes) -> Result<Json<Value>, StatusCode> {
    let input: QueryHeader = parse_header(&body)?;
    let records = db.read().await;
    let mut matched: Vec<&Record> = records.values().filter(|r| input.matches(r)).collect();
    matched.sort_by(|a, b| a.ctime.total_cmp(&b.ctime));
    let records: Vec<Value> = matched.into_iter().map(Record::describe).collect();
    Ok(Json(json!({ "records": records })))
}
