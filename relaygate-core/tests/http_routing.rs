//! HTTP routing against mock backends.
//!
//! Covers single-endpoint timeouts, failover across candidates, response
//! ceilings, SOAP fault passthrough, header and credential forwarding, and
//! gzip in both directions.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relaygate_core::context::{ExecutionContext, RoutingPhase, Value};
use relaygate_core::message::{ContentType, HttpRequestFacet, HttpResponseFacet, Message};
use relaygate_core::policy::Outcome;
use relaygate_core::routing::http::client::HttpClientSettings;
use relaygate_core::routing::http::{
    BLACKLIST_VARIABLE, FAILURE_REASON_VARIABLE, HttpRoutingConfig, HttpRoutingNode,
    REASON_CODE_VARIABLE, URL_VARIABLE,
};
use relaygate_core::routing::{ForwardingMode, ForwardingRule, RoutingResultListener, RoutingServices};

const SOAP_FAULT: &str = "<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\">\
    <soap:Body><soap:Fault><faultcode>soap:Server</faultcode>\
    <faultstring>backend exploded</faultstring></soap:Fault></soap:Body></soap:Envelope>";

fn inbound(method: Method, body: Option<(&str, &str)>, headers: &[(&str, &str)]) -> ExecutionContext {
    let mut request = match body {
        Some((content_type, text)) => {
            Message::with_body(ContentType::parse(content_type), text.to_string())
        }
        None => Message::new(),
    };
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    request
        .attach(HttpRequestFacet::new(method, Uri::from_static("/inbound"), map))
        .unwrap();
    ExecutionContext::new(request, Message::new())
}

fn config(urls: Vec<String>) -> HttpRoutingConfig {
    HttpRoutingConfig {
        urls,
        client: HttpClientSettings {
            read_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            ..HttpClientSettings::default()
        },
        ..HttpRoutingConfig::default()
    }
}

fn node(config: HttpRoutingConfig) -> HttpRoutingNode {
    HttpRoutingNode::new("backend", config, RoutingServices::default()).unwrap()
}

fn variable(ctx: &ExecutionContext, name: &str) -> String {
    ctx.variable(name).unwrap().to_string()
}

// ============================================================================
// Failure semantics
// ============================================================================

#[tokio::test]
async fn single_endpoint_read_timeout_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
        .mount(&server)
        .await;

    let mut cfg = config(vec![server.uri()]);
    cfg.client.read_timeout = Duration::from_millis(150);
    let node = node(cfg);
    let mut ctx = inbound(Method::GET, None, &[]);

    let outcome = node.route(&mut ctx).await;

    assert_eq!(outcome, Outcome::Failed);
    assert_eq!(variable(&ctx, FAILURE_REASON_VARIABLE), "read-timeout");
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(ctx.routing_phase(), RoutingPhase::Attempted);
    assert_eq!(ctx.routing_stats().in_flight(), 0);
}

#[tokio::test]
async fn failover_blacklists_failed_candidates_until_one_succeeds() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let c = MockServer::start().await;
    for failing in [&a, &b] {
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(failing)
            .await;
    }
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("ok", "text/plain"))
        .expect(1)
        .mount(&c)
        .await;

    let mut cfg = config(vec![a.uri(), b.uri(), c.uri()]);
    cfg.failover_strategy = Some("sticky".to_string());
    let node = node(cfg);
    let mut ctx = inbound(Method::GET, None, &[]);

    let outcome = node.route(&mut ctx).await;

    assert_eq!(outcome, Outcome::Continue);
    assert_eq!(
        ctx.variable(BLACKLIST_VARIABLE).unwrap(),
        Value::List(vec![a.uri(), b.uri()])
    );
    assert_eq!(ctx.response().body_text().unwrap(), "ok");
    assert_eq!(ctx.routing_phase(), RoutingPhase::Routed);
    assert_eq!(variable(&ctx, REASON_CODE_VARIABLE), "200");
}

#[tokio::test]
async fn oversized_response_exposes_no_partial_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("x".repeat(100), "text/plain"))
        .mount(&server)
        .await;

    let mut cfg = config(vec![server.uri()]);
    cfg.max_response_bytes = Some("16".to_string());
    let node = node(cfg);
    let mut ctx = inbound(Method::GET, None, &[]);

    assert_eq!(node.route(&mut ctx).await, Outcome::SizeExceeded);
    assert!(!ctx.response().is_initialized());
    assert_ne!(ctx.routing_phase(), RoutingPhase::Routed);
}

#[tokio::test]
async fn oversized_streamed_response_is_refused_by_content_length() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("y".repeat(64), "text/plain"))
        .mount(&server)
        .await;

    let mut cfg = config(vec![server.uri()]);
    cfg.stream_response = true;
    cfg.max_response_bytes = Some("${limit}".to_string());
    let node = node(cfg);
    let mut ctx = inbound(Method::GET, None, &[]);
    ctx.set_variable("limit", "10").unwrap();

    assert_eq!(node.route(&mut ctx).await, Outcome::SizeExceeded);
    assert!(!ctx.response().is_initialized());
}

#[tokio::test]
async fn soap_fault_passes_through_when_enabled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_raw(SOAP_FAULT, "text/xml"))
        .mount(&server)
        .await;

    let mut cfg = config(vec![server.uri()]);
    cfg.pass_through_soap_faults = true;
    let node = node(cfg);
    let mut ctx = inbound(Method::POST, Some(("text/xml", "<ping/>")), &[]);

    assert_eq!(node.route(&mut ctx).await, Outcome::Continue);
    let facet = ctx.response().facet::<HttpResponseFacet>().unwrap();
    assert_eq!(facet.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(ctx.response_mut().xml().unwrap().is_fault());
}

#[tokio::test]
async fn soap_fault_is_a_failure_by_default() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_raw(SOAP_FAULT, "text/xml"))
        .mount(&server)
        .await;

    let node = node(config(vec![server.uri()]));
    let mut ctx = inbound(Method::POST, Some(("text/xml", "<ping/>")), &[]);

    assert_eq!(node.route(&mut ctx).await, Outcome::Falsified);
    assert!(!ctx.response().is_initialized());
    assert_eq!(variable(&ctx, REASON_CODE_VARIABLE), "500");
}

#[tokio::test]
async fn missing_content_type_on_ok_response_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"untyped".to_vec()))
        .mount(&server)
        .await;

    let node = node(config(vec![server.uri()]));
    let mut ctx = inbound(Method::GET, None, &[]);

    assert_eq!(node.route(&mut ctx).await, Outcome::Falsified);
}

// ============================================================================
// Request shaping
// ============================================================================

#[tokio::test]
async fn header_rules_filter_both_directions() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("x-tenant", "acme"))
        .and(header_exists("x-gateway"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("ok", "text/plain")
                .insert_header("x-backend", "node-7")
                .insert_header("x-internal", "secret"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut cfg = config(vec![server.uri()]);
    cfg.request_headers = ForwardingMode::Subset(vec![
        ForwardingRule::original("X-Tenant"),
        ForwardingRule::custom("X-Gateway", "relay-${request.id}"),
    ]);
    cfg.response_headers = ForwardingMode::Subset(vec![ForwardingRule::original("X-Backend")]);
    let node = node(cfg);
    let mut ctx = inbound(
        Method::GET,
        None,
        &[("x-tenant", "acme"), ("x-secret", "do-not-forward")],
    );

    assert_eq!(node.route(&mut ctx).await, Outcome::Continue);

    let received = &server.received_requests().await.unwrap()[0];
    assert!(!received.headers.contains_key("x-secret"));
    let gateway = received.headers.get("x-gateway").unwrap().to_str().unwrap();
    assert_eq!(gateway, format!("relay-{}", ctx.request_id()));

    let facet = ctx.response().facet::<HttpResponseFacet>().unwrap();
    assert_eq!(facet.headers.get("x-backend").unwrap(), "node-7");
    assert!(facet.headers.get("x-internal").is_none());
}

#[tokio::test]
async fn templated_url_and_basic_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders/42"))
        .and(header("authorization", "Basic c3ZjOnB3"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{\"ok\":true}", "application/json"))
        .expect(1)
        .mount(&server)
        .await;

    let mut cfg = config(vec![format!("{}/orders/${{order}}", server.uri())]);
    cfg.login = Some("svc".to_string());
    cfg.password = Some("${secret}".to_string());
    let node = node(cfg);
    let mut ctx = inbound(
        Method::POST,
        Some(("application/json", "{\"qty\":1}")),
        &[("authorization", "Basic aW5ib3VuZDp4")],
    );
    ctx.set_variable("order", "42").unwrap();
    ctx.set_variable("secret", "pw").unwrap();

    assert_eq!(node.route(&mut ctx).await, Outcome::Continue);
    assert_eq!(variable(&ctx, URL_VARIABLE), format!("{}/orders/42", server.uri()));
    assert_eq!(variable(&ctx, "httpRouting.url.path"), "/orders/42");
    assert_eq!(variable(&ctx, "httpRouting.url.protocol"), "http");
    assert_eq!(ctx.response_mut().json().unwrap()["ok"], true);
}

#[tokio::test]
async fn response_lands_in_message_variable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("side", "text/plain"))
        .mount(&server)
        .await;

    let mut cfg = config(vec![server.uri()]);
    cfg.response_destination = Some("lookup".to_string());
    let node = node(cfg);
    let mut ctx = inbound(Method::GET, None, &[]);

    assert_eq!(node.route(&mut ctx).await, Outcome::Continue);
    assert_eq!(ctx.message_variable("lookup").unwrap().body_text().unwrap(), "side");
    assert!(!ctx.response().is_initialized());
}

// ============================================================================
// Compression
// ============================================================================

#[tokio::test]
async fn gzip_request_body_is_compressed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("content-encoding", "gzip"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("ok", "text/plain"))
        .expect(1)
        .mount(&server)
        .await;

    let mut cfg = config(vec![server.uri()]);
    cfg.gzip_request = true;
    let node = node(cfg);
    let payload = "<order><id>42</id></order>".repeat(20);
    let mut ctx = inbound(Method::POST, Some(("text/xml", payload.as_str())), &[]);

    assert_eq!(node.route(&mut ctx).await, Outcome::Continue);

    let received = &server.received_requests().await.unwrap()[0];
    let mut decoded = String::new();
    GzDecoder::new(received.body.as_slice())
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded, payload);
}

#[tokio::test]
async fn gzip_response_is_decompressed() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"compressed reply").unwrap();
    let packed = encoder.finish().unwrap();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(packed, "text/plain")
                .insert_header("content-encoding", "gzip"),
        )
        .mount(&server)
        .await;

    let node = node(config(vec![server.uri()]));
    let mut ctx = inbound(Method::GET, None, &[]);

    assert_eq!(node.route(&mut ctx).await, Outcome::Continue);
    assert_eq!(ctx.response().body_text().unwrap(), "compressed reply");
}

// ============================================================================
// Listener
// ============================================================================

#[derive(Default)]
struct RerouteOnce {
    asked: AtomicUsize,
    routed: AtomicUsize,
}

impl RoutingResultListener for RerouteOnce {
    fn routed(&self, _url: &str, _status: StatusCode, _headers: &HeaderMap, _ctx: &ExecutionContext) {
        self.routed.fetch_add(1, Ordering::SeqCst);
    }

    fn reroute(&self, _url: &str, status: StatusCode, _headers: &HeaderMap, _ctx: &ExecutionContext) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        status == StatusCode::SERVICE_UNAVAILABLE
    }
}

#[tokio::test]
async fn listener_reroute_retries_same_url_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("late", "text/plain"))
        .with_priority(2)
        .mount(&server)
        .await;

    let listener = Arc::new(RerouteOnce::default());
    let services = RoutingServices::default().with_listener(listener.clone());
    let node = HttpRoutingNode::new("backend", config(vec![server.uri()]), services).unwrap();
    let mut ctx = inbound(Method::GET, None, &[]);

    let outcome = node.route(&mut ctx).await;

    // Two 503s: the first is rerouted, the second is accepted as is.
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    assert_eq!(listener.asked.load(Ordering::SeqCst), 1);
    assert_eq!(listener.routed.load(Ordering::SeqCst), 2);
    assert_eq!(outcome, Outcome::Falsified);
}
