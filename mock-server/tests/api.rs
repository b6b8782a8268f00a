use std::io::Write;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use flate2::{write::GzEncoder, Compression};
use http_body_util::BodyExt;
use mock_server::{app, FORM_BOUNDARY, HEADER_APPLIED_COMPRESSION, HEADER_COMPRESS_ON_SERVER, HEADER_SUPPORTED_COMPRESSION};
use serde_json::{json, Value};
use tower::{Service, ServiceExt};

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn json_request(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn form_request(header: Value, content: &[u8], compress_on_server: bool) -> Request<Body> {
    let mut body = format!(
        "--{FORM_BOUNDARY}\r\nContent-Disposition: form-data; name=\"header\"\r\n\r\n{header}\
         \r\n--{FORM_BOUNDARY}\r\nContent-Disposition: form-data; name=\"content\"; filename=\"payload\"\r\n\
         Content-Type: application/octet-stream\r\nContent-Transfer-Encoding: binary\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{FORM_BOUNDARY}--\r\n").as_bytes());
    Request::builder()
        .method("POST")
        .uri("/put")
        .header("content-type", format!("multipart/form-data; boundary={FORM_BOUNDARY}"))
        .header(HEADER_COMPRESS_ON_SERVER, if compress_on_server { "yes" } else { "no" })
        .body(Body::from(body))
        .unwrap()
}

fn put_header(mime: &str, comp: Option<&str>) -> Value {
    json!({
        "uid": null,
        "keys": null,
        "meta": {"owner": "tests"},
        "physical": {"family": "scans", "format": {"mime": mime, "ext": null, "comp": comp}},
        "policy": {"delete": null, "compress": null}
    })
}

// --- ping / status ---

#[tokio::test]
async fn ping_returns_empty_object() {
    let resp = app().oneshot(json_request("/ping", json!({}))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({}));
}

#[tokio::test]
async fn status_reports_load() {
    let resp = app().oneshot(json_request("/status", json!({}))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let status = body_json(resp).await;
    assert!(status["system"]["load"]["t1"].is_number());
}

// --- errors ---

#[tokio::test]
async fn get_unknown_uid_returns_404() {
    let resp = app()
        .oneshot(json_request("/get", json!({"uid": "missing", "keys": {"read": null}})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn put_without_mime_returns_409() {
    let resp = app()
        .oneshot(form_request(json!({"physical": {"format": {}}}), b"x", false))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn malformed_header_returns_400() {
    let req = Request::builder()
        .method("POST")
        .uri("/describe")
        .body("{not json".to_string())
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// --- compression ---

#[tokio::test]
async fn server_compresses_and_honours_supported_formats() {
    let mut app = app().into_service();
    let original = b"compress me please ".repeat(50);

    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(form_request(put_header("text/plain", Some("gz")), &original, true))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let storage = body_json(resp).await;
    let uid = storage["uid"].as_str().unwrap().to_string();
    let read = storage["keys"]["read"].clone();

    // A client that cannot inflate gets plain bytes.
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(json_request("/get", json!({"uid": uid, "keys": {"read": read}})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get(HEADER_APPLIED_COMPRESSION).is_none());
    assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
    assert_eq!(body_bytes(resp).await.as_ref(), original.as_slice());

    // One that advertises gz gets the stored form.
    let mut req = json_request("/get", json!({"uid": uid, "keys": {"read": read}}));
    req.headers_mut()
        .insert(HEADER_SUPPORTED_COMPRESSION, "gz".parse().unwrap());
    let resp = ServiceExt::ready(&mut app).await.unwrap().call(req).await.unwrap();
    assert_eq!(resp.headers().get(HEADER_APPLIED_COMPRESSION).unwrap(), "gz");
    let raw = body_bytes(resp).await;
    assert!(raw.len() < original.len());
    assert_eq!(&raw[..2], &[0x1f, 0x8b]);
}

#[tokio::test]
async fn client_compressed_content_is_stored_as_sent() {
    let mut app = app().into_service();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"already small").unwrap();
    let gz = encoder.finish().unwrap();

    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(form_request(put_header("text/plain", Some("gz")), &gz, false))
        .await
        .unwrap();
    let storage = body_json(resp).await;

    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(json_request("/get", json!({"uid": storage["uid"], "keys": {"read": storage["keys"]["read"]}})))
        .await
        .unwrap();
    assert_eq!(body_bytes(resp).await.as_ref(), b"already small");
}

// --- full lifecycle ---

#[tokio::test]
async fn record_lifecycle() {
    let mut app = app().into_service();

    // put
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(form_request(put_header("image/png", None), b"\x89PNG", false))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let storage = body_json(resp).await;
    let uid = storage["uid"].clone();
    let read = storage["keys"]["read"].clone();
    let write = storage["keys"]["write"].clone();
    assert!(read.is_string() && write.is_string());

    // wrong read key
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(json_request("/describe", json!({"uid": uid, "keys": {"read": "nope"}})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // update
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(json_request(
            "/update",
            json!({
                "uid": uid,
                "keys": {"write": write},
                "policy": {"delete": {"fixed": 60.0}, "compress": null},
                "meta": {"new": {"size": 4}, "removed": ["owner"]}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // describe
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(json_request("/describe", json!({"uid": uid, "keys": {"read": read}})))
        .await
        .unwrap();
    let description = body_json(resp).await;
    assert_eq!(description["physical"]["format"]["mime"], "image/png");
    assert_eq!(description["physical"]["family"], "scans");
    assert_eq!(description["meta"], json!({"size": 4}));
    assert_eq!(description["policy"]["delete"], json!({"fixed": 60.0}));

    // families
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(json_request("/list/families", json!({})))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await, json!({"families": ["scans"]}));

    // query by super-type
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(json_request("/query", json!({"mime": "image", "meta": {"size": 4}})))
        .await
        .unwrap();
    let results = body_json(resp).await;
    assert_eq!(results["records"].as_array().unwrap().len(), 1);

    // unlink with the wrong key
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(json_request("/unlink", json!({"uid": uid, "keys": {"write": read}})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // unlink
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(json_request("/unlink", json!({"uid": uid, "keys": {"write": write}})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // gone
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(json_request("/get", json!({"uid": uid, "keys": {"read": read}})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
