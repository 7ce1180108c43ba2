//! HTTP API tests driving the router directly


use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use base64::Engine as _;
use facial_emotion_api::{
    analysis::FacialAnalyzer, constants::DEFAULT_MAX_UPLOAD_BYTES, server::router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use test_helpers::{
    estimator_with, frontal_mesh, png_bytes, sample_analyzer, sample_attributes, FailingFaces, FixedAttributes,
    FixedFaces,
};
use tower::ServiceExt;

const BOUNDARY: &str = "test-boundary-7MA4YWxkTrZu0gW";

fn app() -> Router {
    router(Arc::new(sample_analyzer()), DEFAULT_MAX_UPLOAD_BYTES)
}

fn app_with(analyzer: FacialAnalyzer) -> Router {
    router(Arc::new(analyzer), DEFAULT_MAX_UPLOAD_BYTES)
}

/// Multipart body from `(field, filename, contents)` parts
fn multipart_body(parts: &[(&str, &str, Vec<u8>)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, filename, contents) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n").as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(contents);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn multipart_request(uri: &str, parts: &[(&str, &str, Vec<u8>)]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

fn json_request(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_health() {
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "status": "healthy",
            "message": "Facial Emotion Detection API is running",
            "version": "1.0.0"
        })
    );
}

#[tokio::test]
async fn test_unknown_route() {
    let request = Request::builder().uri("/nope").body(Body::empty()).unwrap();
    let (status, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Endpoint not found");
}

#[tokio::test]
async fn test_analyze_multipart_upload() {
    let request = multipart_request("/analyze", &[("image", "face.png", png_bytes(64, 48))]);
    let (status, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["age"], "31 years");
    assert_eq!(body["gender"], "woman");
    assert_eq!(body["emotion"], "happy (0.87)");
    assert_eq!(body["detailed_emotions"]["happy"], 0.873);
    for axis in ["pitch", "yaw", "roll"] {
        let degrees = body["angle"][axis].as_f64().unwrap();
        assert!(degrees.abs() <= 1.5, "{axis} was {degrees}");
    }
    assert!(body.get("error").is_none());
}

#[tokio::test]
async fn test_analyze_base64_data_url() {
    let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes(64, 48));
    let payload = json!({ "image_data": format!("data:image/png;base64,{encoded}") });
    let (status, body) = send(app(), json_request("/analyze", &payload)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["emotion"], "happy (0.87)");
}

#[tokio::test]
async fn test_analyze_without_image() {
    let (status, body) = send(app(), json_request("/analyze", &json!({ "other": 1 }))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        "No image provided. Send either 'image' file or 'image_data' base64 string"
    );

    let request = multipart_request("/analyze", &[("photo", "face.png", png_bytes(8, 8))]);
    let (status, _) = send(app(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_analyze_empty_filename() {
    let request = multipart_request("/analyze", &[("image", "", png_bytes(8, 8))]);
    let (status, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_analyze_undecodable_image() {
    let request = multipart_request("/analyze", &[("image", "face.png", b"not an image".to_vec())]);
    let (status, body) = send(app(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Failed to decode image");

    let (status, body) = send(app(), json_request("/analyze", &json!({ "image_data": "%%%" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Failed to decode image");
}

#[tokio::test]
async fn test_analyze_no_face() {
    let analyzer = FacialAnalyzer::new(
        Arc::new(FixedFaces(Vec::new())),
        estimator_with(Some(frontal_mesh())),
        Arc::new(FixedAttributes(sample_attributes())),
    );
    let request = multipart_request("/analyze", &[("image", "face.png", png_bytes(32, 32))]);
    let (status, body) = send(app_with(analyzer), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "error": "No face detected in the image",
            "age": "unknown",
            "gender": "unknown",
            "emotion": "unknown",
            "angle": { "pitch": 0.0, "yaw": 0.0, "roll": 0.0 }
        })
    );
}

#[tokio::test]
async fn test_analyze_internal_error() {
    let analyzer = FacialAnalyzer::new(
        Arc::new(FailingFaces),
        estimator_with(None),
        Arc::new(FixedAttributes(sample_attributes())),
    );
    let request = multipart_request("/analyze", &[("image", "face.png", png_bytes(32, 32))]);
    let (status, body) = send(app_with(analyzer), request).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Internal server error: Model error: face model unavailable");
    assert_eq!(body["age"], "unknown");
    assert_eq!(body["angle"]["roll"], 0.0);
}

#[tokio::test]
async fn test_batch_analyze() {
    let request = multipart_request(
        "/batch_analyze",
        &[
            ("images", "a.png", png_bytes(32, 32)),
            ("images", "broken.png", b"nope".to_vec()),
            ("images", "b.png", png_bytes(20, 10)),
        ],
    );
    let (status, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_images"], 3);
    assert_eq!(body["processed_images"], 2);
    assert_eq!(body["results"][0]["image_index"], 0);
    assert_eq!(body["results"][0]["filename"], "a.png");
    assert_eq!(body["results"][1]["image_index"], 2);
    assert_eq!(body["results"][1]["gender"], "woman");
}

#[tokio::test]
async fn test_batch_analyze_without_images() {
    let request = multipart_request("/batch_analyze", &[("image", "a.png", png_bytes(8, 8))]);
    let (status, body) = send(app(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No images provided");

    let (status, body) = send(app(), json_request("/batch_analyze", &json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No images provided");
}

#[tokio::test]
async fn test_payload_too_large() {
    let app = router(Arc::new(sample_analyzer()), 1024 * 1024);
    let payload = json!({ "image_data": "A".repeat(2 * 1024 * 1024) });
    let (status, body) = send(app, json_request("/analyze", &payload)).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], "File too large. Maximum size is 1MB");
}

#[tokio::test]
async fn test_cors_allows_any_origin() {
    let request = Request::builder()
        .uri("/health")
        .header(header::ORIGIN, "http://example.com")
        .body(Body::empty())
        .unwrap();
    let response = app().oneshot(request).await.unwrap();

    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "*"
    );
}
