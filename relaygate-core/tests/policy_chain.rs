//! Configuration-built policy trees, end to end.

use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Method, Uri};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relaygate_core::config::parse_config;
use relaygate_core::context::{ExecutionContext, Value};
use relaygate_core::message::{ContentType, HttpRequestFacet, Message};
use relaygate_core::policy::Outcome;
use relaygate_core::policy::PolicyTree;
use relaygate_core::policy::build::{PolicyBuilder, broker_for, services_for};
use relaygate_core::routing::queue::InMemoryBroker;
use relaygate_core::routing::queue::provider::QueueMessage;

fn trees(yaml: &str) -> (Vec<PolicyTree>, InMemoryBroker) {
    let config = parse_config(yaml).unwrap();
    let broker = broker_for(&config);
    let trees = PolicyBuilder::new(&config, services_for(&config), Arc::new(broker.clone()))
        .build()
        .unwrap();
    (trees, broker)
}

fn http_request(body: &str) -> ExecutionContext {
    let mut request = Message::with_body(ContentType::xml(), body.to_string());
    request
        .attach(HttpRequestFacet::new(Method::POST, Uri::from_static("/svc"), HeaderMap::new()))
        .unwrap();
    ExecutionContext::new(request, Message::new())
}

#[tokio::test]
async fn one_of_falls_back_to_second_route() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fallback"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<ok/>", "text/xml"))
        .expect(1)
        .mount(&backend)
        .await;

    let yaml = format!(
        r#"
schema: 1
services:
  - name: resilient
    path: /svc
    policy:
      kind: one_of
      children:
        - kind: http_route
          urls: ["http://127.0.0.1:9/dead"]
          connect_timeout: 200ms
          retries: 0
        - kind: http_route
          urls: ["{}/fallback"]
"#,
        backend.uri()
    );
    let (trees, _) = trees(&yaml);
    let mut ctx = http_request("<order/>");

    assert_eq!(trees[0].run(&mut ctx).await, Outcome::Continue);
    assert_eq!(ctx.response().body_text().unwrap(), "<ok/>");
    trees[0].release();
}

#[tokio::test]
async fn queue_route_uses_configured_broker_queues() {
    let (trees, broker) = trees(
        r#"
schema: 1
broker:
  queues: [orders.eu]
services:
  - name: orders
    path: /orders
    policy:
      kind: all
      children:
        - { kind: set_variable, variable: region, value: eu }
        - kind: queue_route
          destinations: ["orders.${region}"]
          reply: { mode: temporary }
          response_timeout: 5s
"#,
    );
    let responder = {
        let broker = broker.clone();
        tokio::spawn(async move {
            let request = broker
                .wait_for("orders.eu", None, Duration::from_secs(5))
                .await
                .unwrap();
            let reply_to = request.reply_to.unwrap();
            broker.publish(&reply_to, QueueMessage::text("<accepted/>")).unwrap();
        })
    };

    let mut ctx = ExecutionContext::new(
        Message::with_body(ContentType::xml(), "<order/>"),
        Message::new(),
    );
    assert_eq!(trees[0].run(&mut ctx).await, Outcome::Continue);
    responder.await.unwrap();
    assert_eq!(ctx.response().body_text().unwrap(), "<accepted/>");
    trees[0].release();
}

#[tokio::test]
async fn fragments_only_see_imported_variables() {
    let (trees, _) = trees(
        r#"
schema: 1
fragments:
  audit:
    kind: all
    children:
      - { kind: require_variable, variable: tenant }
      - { kind: set_variable, variable: audited, value: "${tenant}" }
services:
  - name: imported
    path: /imported
    policy:
      kind: all
      children:
        - { kind: set_variable, variable: tenant, value: acme }
        - { kind: include, fragment: audit, imports: [tenant], exports: [audited] }
  - name: sealed
    path: /sealed
    policy:
      kind: all
      children:
        - { kind: set_variable, variable: tenant, value: acme }
        - { kind: include, fragment: audit }
"#,
    );

    let mut ctx = ExecutionContext::new(Message::new(), Message::new());
    assert_eq!(trees[0].run(&mut ctx).await, Outcome::Continue);
    assert_eq!(ctx.variable("audited").unwrap(), Value::from("acme"));

    let mut ctx = ExecutionContext::new(Message::new(), Message::new());
    assert_eq!(trees[1].run(&mut ctx).await, Outcome::Falsified);
    assert!(ctx.variable("audited").is_err());

    for tree in &trees {
        tree.release();
    }
}

#[tokio::test]
async fn size_limit_stops_chain_before_routing() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&backend)
        .await;

    let yaml = format!(
        r#"
schema: 1
services:
  - name: capped
    path: /svc
    policy:
      kind: all
      children:
        - {{ kind: size_limit, limit: 8 }}
        - kind: http_route
          urls: ["{}/never"]
"#,
        backend.uri()
    );
    let (trees, _) = trees(&yaml);
    let mut ctx = http_request("<far-too-long-for-the-limit/>");

    assert_eq!(trees[0].run(&mut ctx).await, Outcome::SizeExceeded);
    assert!(!ctx.response().is_initialized());
}
