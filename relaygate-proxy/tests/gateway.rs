//! Inbound service tests: the axum router driven with `oneshot` against
//! mock backends.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::matchers::{body_string, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relaygate_core::config::{RelaygateDefaults, parse_config};
use relaygate_proxy::service::{Gateway, REQUEST_ID_HEADER};

const SOAP_REQUEST: &str = "<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\">\
    <soap:Body><getOrder><id>42</id></getOrder></soap:Body></soap:Envelope>";

fn gateway(yaml: &str) -> (Router, CancellationToken) {
    let config = parse_config(yaml).unwrap();
    let shutdown = CancellationToken::new();
    let gateway = Gateway::build(config, RelaygateDefaults::default(), shutdown.clone()).unwrap();
    (Arc::new(gateway).router(), shutdown)
}

fn routed_to(backend: &str) -> String {
    format!(
        r#"
schema: 1
limits:
  max_request_bytes: 1024
services:
  - name: orders
    path: /orders
    policy:
      kind: http_route
      urls: ["{backend}/backend"]
  - name: dead
    path: /dead
    policy:
      kind: http_route
      urls: ["http://127.0.0.1:9/backend"]
      connect_timeout: 200ms
      retries: 0
  - name: streamed
    path: /streamed
    stream_requests: true
    policy:
      kind: http_route
      urls: ["{backend}/backend"]
"#
    )
}

fn post(uri: &str, content_type: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn health_answers_ok() {
    let (router, _) = gateway(&routed_to("http://127.0.0.1:9"));
    let response = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let (router, _) = gateway(&routed_to("http://127.0.0.1:9"));
    let response = router.oneshot(post("/nowhere", "text/plain", "x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(json["error"]["type"], "no_service");
    assert_eq!(json["error"]["details"]["path"], "/nowhere");
}

#[tokio::test]
async fn backend_response_is_relayed() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/backend"))
        .and(body_string(SOAP_REQUEST))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-backend", "primary")
                .set_body_raw("<order id=\"42\"/>", "text/xml"),
        )
        .expect(1)
        .mount(&backend)
        .await;
    let (router, _) = gateway(&routed_to(&backend.uri()));

    let response = router
        .oneshot(post("/orders/42", "text/xml", SOAP_REQUEST))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    assert_eq!(response.headers().get("x-backend").unwrap(), "primary");
    assert_eq!(body_text(response).await, "<order id=\"42\"/>");
}

#[tokio::test]
async fn streamed_request_reaches_backend() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/backend"))
        .and(body_string("{\"id\":42}"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
        .expect(1)
        .mount(&backend)
        .await;
    let (router, _) = gateway(&routed_to(&backend.uri()));

    let response = router
        .oneshot(post("/streamed", "application/json", "{\"id\":42}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn soap_caller_gets_soap_fault() {
    let (router, _) = gateway(&routed_to("http://127.0.0.1:9"));
    let response = router
        .oneshot(post("/dead", "text/xml", SOAP_REQUEST))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/xml; charset=utf-8"
    );
    let body = body_text(response).await;
    assert!(body.contains("<faultcode>soap:Server</faultcode>"));
    assert!(!body.contains("127.0.0.1"));
}

#[tokio::test]
async fn other_callers_get_json_error() {
    let (router, _) = gateway(&routed_to("http://127.0.0.1:9"));
    let response = router
        .oneshot(post("/dead", "application/json", "{}"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let request_id = response
        .headers()
        .get(REQUEST_ID_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(json["error"]["status"], 503);
    assert_eq!(json["error"]["details"]["outcome"], "failed");
    assert_eq!(json["error"]["request_id"], request_id.as_str());
}

#[tokio::test]
async fn oversized_request_is_rejected() {
    let (router, _) = gateway(&routed_to("http://127.0.0.1:9"));
    let body = "x".repeat(2048);

    let declared = Request::builder()
        .method("POST")
        .uri("/orders")
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body.clone()))
        .unwrap();
    let response = router.clone().oneshot(declared).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let undeclared = post("/orders", "text/plain", &body);
    let response = router.oneshot(undeclared).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn draining_gateway_refuses_new_exchanges() {
    let (router, shutdown) = gateway(&routed_to("http://127.0.0.1:9"));
    shutdown.cancel();
    let response = router.oneshot(post("/orders", "text/plain", "x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
