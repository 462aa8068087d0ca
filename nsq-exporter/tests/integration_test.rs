//! Integration tests for the NSQ exporter.
//!
//! These tests stand up a stub nsqd on an ephemeral port and verify the full
//! flow from fetching `/stats` to exposing metrics via the HTTP endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;

use nsq_exporter::config::ResetPolicy;
use nsq_exporter::{Executor, ExporterConfig, HttpServer, MetricSink, ScrapeOutcome};

/// What the stub daemon answers with.
#[derive(Clone)]
enum Reply {
    Json(String),
    Status(StatusCode),
}

type SharedReply = Arc<RwLock<Reply>>;

async fn stats_handler(State(reply): State<SharedReply>) -> Response {
    let current = reply.read().clone();
    match current {
        Reply::Json(body) => ([("content-type", "application/json")], body).into_response(),
        Reply::Status(status) => (status, "stub failure").into_response(),
    }
}

/// Start a stub nsqd serving `initial` on `/stats`.
async fn stub_nsqd(initial: &str) -> (SocketAddr, SharedReply) {
    let reply = Arc::new(RwLock::new(Reply::Json(initial.to_string())));
    let app = Router::new()
        .route("/stats", get(stats_handler))
        .with_state(reply.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (addr, reply)
}

fn set_reply(reply: &SharedReply, next: Reply) {
    *reply.write() = next;
}

/// Build an executor against `addr` with every collector enabled.
fn executor_for(
    addr: SocketAddr,
    configure: impl FnOnce(&mut ExporterConfig),
) -> (Executor, Registry) {
    let mut config = ExporterConfig::default();
    config.nsqd.url = addr.to_string();
    config.nsqd.timeout_ms = 2000;
    config.collectors = vec![
        "queues".to_string(),
        "sub_queues".to_string(),
        "consumers".to_string(),
    ];
    configure(&mut config);
    config.validate().unwrap();

    let mut registry = Registry::with_prefix(config.prometheus.naming().namespace());
    let executor = Executor::from_config(&config, &mut registry).unwrap();
    (executor, registry)
}

async fn scrape(executor: &Executor) -> (ScrapeOutcome, MetricSink) {
    let mut sink = MetricSink::new();
    let outcome = executor.scrape(&mut sink).await;
    (outcome, sink)
}

fn encode_registry(registry: &Registry) -> String {
    let mut out = String::new();
    encode(&mut out, registry).unwrap();
    out
}

fn queue_doc(queues: &[(&str, i64)]) -> String {
    let topics: Vec<String> = queues
        .iter()
        .map(|(name, depth)| {
            format!(
                r#"{{"topic_name": "{}", "depth": {}, "paused": false, "channels": []}}"#,
                name, depth
            )
        })
        .collect();
    format!(
        r#"{{"version": "1.2.1", "health": "OK", "start_time": 1700000000, "topics": [{}]}}"#,
        topics.join(",")
    )
}

const FULL_DOC: &str = r#"{
    "version": "1.2.1",
    "health": "OK",
    "start_time": 1700000000,
    "topics": [
        {
            "topic_name": "orders",
            "depth": 12,
            "backend_depth": 3,
            "message_count": 900,
            "paused": false,
            "e2e_processing_latency": {
                "count": 10,
                "percentiles": [
                    {"quantile": 0.99, "value": 2500000},
                    {"quantile": 0.95, "value": 1500000}
                ]
            },
            "channels": [
                {
                    "channel_name": "billing",
                    "depth": 4,
                    "in_flight_count": 2,
                    "requeue_count": 1,
                    "paused": true,
                    "clients": [
                        {
                            "client_id": "worker-1",
                            "hostname": "worker-1.local",
                            "version": "V2",
                            "remote_address": "10.0.0.11:50412",
                            "state": 3,
                            "ready_count": 10,
                            "in_flight_count": 1,
                            "message_count": 450,
                            "finish_count": 449,
                            "requeue_count": 0,
                            "connect_ts": 1700000100,
                            "sample_rate": 0,
                            "deflate": false,
                            "snappy": true,
                            "tls": true
                        },
                        {
                            "client_id": "worker-1",
                            "hostname": "worker-1.local",
                            "version": "V2",
                            "remote_address": "10.0.0.11:50413",
                            "state": 3,
                            "tls": false
                        }
                    ]
                },
                {
                    "channel_name": "audit",
                    "depth": 0,
                    "paused": false,
                    "clients": null
                }
            ]
        },
        {
            "topic_name": "events",
            "depth": 0,
            "paused": false,
            "e2e_processing_latency": null,
            "channels": [{"channel_name": "replay", "depth": 1, "clients": []}]
        }
    ]
}"#;

#[tokio::test]
async fn test_scenario_single_queue() {
    let doc = r#"{"topics": [{"topic_name": "q1", "depth": 5, "paused": false,
        "channels": [{"channel_name": "c1", "depth": 2, "clients": []}]}]}"#;
    let (addr, _reply) = stub_nsqd(doc).await;
    let (executor, _registry) = executor_for(addr, |_| {});

    let (outcome, sink) = scrape(&executor).await;
    assert_eq!(outcome, ScrapeOutcome::Success);

    let output = sink.render();
    assert!(output.contains("nsq_queue_depth{queue=\"q1\",paused=\"false\"} 5\n"));
    assert!(
        output.contains("nsq_sub_queue_depth{queue=\"q1\",sub_queue=\"c1\",paused=\"false\"} 2\n")
    );
    assert!(!output.contains("nsq_consumer_"));
}

#[tokio::test]
async fn test_full_document_table_sizes() {
    let (addr, _reply) = stub_nsqd(FULL_DOC).await;
    let (executor, registry) = executor_for(addr, |_| {});

    let (outcome, sink) = scrape(&executor).await;
    assert_eq!(outcome, ScrapeOutcome::Success);

    // 2 queues, 3 sub-queues, 2 consumers
    assert_eq!(sink.samples("nsq_queue_depth").len(), 2);
    assert_eq!(sink.samples("nsq_sub_queue_depth").len(), 3);
    assert_eq!(sink.samples("nsq_consumer_state").len(), 2);

    let orders = [("queue", "orders"), ("paused", "false")];
    assert_eq!(sink.value("nsq_queue_e2e_latency_p99", &orders), Some(2_500_000.0));
    assert_eq!(sink.value("nsq_queue_e2e_latency_p95", &orders), Some(1_500_000.0));

    let events = [("queue", "events"), ("paused", "false")];
    assert_eq!(sink.value("nsq_queue_e2e_latency_p99", &events), Some(0.0));

    let billing = [("queue", "orders"), ("sub_queue", "billing"), ("paused", "true")];
    assert_eq!(sink.value("nsq_sub_queue_consumer_count", &billing), Some(2.0));
    assert_eq!(sink.value("nsq_sub_queue_in_flight_count", &billing), Some(2.0));

    let worker = [
        ("queue", "orders"),
        ("sub_queue", "billing"),
        ("deflate", "false"),
        ("snappy", "true"),
        ("tls", "true"),
        ("client_id", "worker-1"),
        ("hostname", "worker-1.local"),
        ("version", "V2"),
        ("remote_address", "10.0.0.11:50412"),
    ];
    assert_eq!(sink.value("nsq_consumer_finish_count", &worker), Some(449.0));
    assert_eq!(sink.value("nsq_consumer_connect_ts", &worker), Some(1_700_000_100.0));

    assert_eq!(sink.value("nsq_queues_total", &[]), Some(2.0));
    assert_eq!(
        sink.value("nsq_info", &[("version", "1.2.1"), ("health", "OK")]),
        Some(1.0)
    );

    let exposition = encode_registry(&registry);
    assert!(exposition.contains("nsq_exporter_scrape_duration_seconds_count{result=\"success\"} 1"));
    assert!(exposition.contains(&format!("nsq_exporter_series {}", sink.series_count())));
}

async fn assert_no_stale_entities(reset: ResetPolicy) {
    let (addr, reply) = stub_nsqd(&queue_doc(&[("gone", 1), ("kept", 2)])).await;
    let (executor, _registry) = executor_for(addr, |config| config.scrape.reset = reset);

    let (_, first) = scrape(&executor).await;
    assert!(first.render().contains("queue=\"gone\""));

    set_reply(&reply, Reply::Json(queue_doc(&[("kept", 3)])));
    let (outcome, second) = scrape(&executor).await;
    assert_eq!(outcome, ScrapeOutcome::Success);

    let output = second.render();
    assert!(!output.contains("queue=\"gone\""), "{:?}: {}", reset, output);
    assert!(output.contains("nsq_queue_depth{queue=\"kept\",paused=\"false\"} 3\n"));
}

#[tokio::test]
async fn test_staleness_reset_before_fetch() {
    assert_no_stale_entities(ResetPolicy::BeforeFetch).await;
}

#[tokio::test]
async fn test_staleness_reset_after_fetch() {
    assert_no_stale_entities(ResetPolicy::AfterFetch).await;
}

#[tokio::test]
async fn test_failed_fetch_before_fetch_policy_exposes_nothing() {
    let (addr, reply) = stub_nsqd(&queue_doc(&[("orders", 4)])).await;
    let (executor, registry) = executor_for(addr, |_| {});

    scrape(&executor).await;
    set_reply(&reply, Reply::Status(StatusCode::INTERNAL_SERVER_ERROR));

    let (outcome, sink) = scrape(&executor).await;
    assert_eq!(outcome, ScrapeOutcome::Error);
    assert!(sink.is_empty());

    let exposition = encode_registry(&registry);
    assert!(exposition.contains("nsq_exporter_scrape_duration_seconds_count{result=\"success\"} 1"));
    assert!(exposition.contains("nsq_exporter_scrape_duration_seconds_count{result=\"error\"} 1"));
}

#[tokio::test]
async fn test_failed_fetch_after_fetch_policy_keeps_previous_tables() {
    let (addr, reply) = stub_nsqd(&queue_doc(&[("orders", 4)])).await;
    let (executor, _registry) = executor_for(addr, |config| {
        config.scrape.reset = ResetPolicy::AfterFetch;
    });

    scrape(&executor).await;
    set_reply(&reply, Reply::Status(StatusCode::SERVICE_UNAVAILABLE));

    let (outcome, sink) = scrape(&executor).await;
    assert_eq!(outcome, ScrapeOutcome::Error);
    assert_eq!(
        sink.value("nsq_queue_depth", &[("queue", "orders"), ("paused", "false")]),
        Some(4.0)
    );
    // Snapshot-level families are only emitted on success.
    assert_eq!(sink.value("nsq_queues_total", &[]), None);
    assert_eq!(executor.last_outcome(), Some(ScrapeOutcome::Error));
}

#[tokio::test]
async fn test_malformed_document_is_error() {
    let (addr, _reply) = stub_nsqd("{\"topics\": [").await;
    let (executor, _registry) = executor_for(addr, |_| {});

    let (outcome, sink) = scrape(&executor).await;
    assert_eq!(outcome, ScrapeOutcome::Error);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn test_enveloped_document() {
    let wrapped = format!(
        r#"{{"status_code": 200, "status_text": "OK", "data": {}}}"#,
        queue_doc(&[("orders", 7)])
    );
    let (addr, _reply) = stub_nsqd(&wrapped).await;
    let (executor, _registry) = executor_for(addr, |_| {});

    let (outcome, sink) = scrape(&executor).await;
    assert_eq!(outcome, ScrapeOutcome::Success);
    assert_eq!(
        sink.value("nsq_queue_depth", &[("queue", "orders"), ("paused", "false")]),
        Some(7.0)
    );
}

#[tokio::test]
async fn test_serial_and_concurrent_ingest_agree() {
    let (addr, _reply) = stub_nsqd(FULL_DOC).await;
    let (concurrent, _) = executor_for(addr, |config| config.scrape.concurrent = true);
    let (serial, _) = executor_for(addr, |config| config.scrape.concurrent = false);

    let (_, a) = scrape(&concurrent).await;
    let (_, b) = scrape(&serial).await;
    assert_eq!(a.render(), b.render());
}

#[tokio::test]
async fn test_type_label_mode() {
    let (addr, _reply) = stub_nsqd(FULL_DOC).await;
    let (executor, _registry) = executor_for(addr, |config| {
        config.prometheus.type_label = true;
        config.prometheus.namespace = "broker".to_string();
    });

    let (_, sink) = scrape(&executor).await;

    // 2 queues + 3 sub-queues share one family.
    assert_eq!(sink.samples("broker_depth").len(), 5);
    assert_eq!(
        sink.value(
            "broker_depth",
            &[
                ("type", "sub_queue"),
                ("queue", "orders"),
                ("sub_queue", "billing"),
                ("paused", "true"),
            ]
        ),
        Some(4.0)
    );
    assert!(sink.samples("broker_queue_depth").is_empty());
}

#[tokio::test]
async fn test_silent_daemon_times_out() {
    // Accepts connections but never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let (executor, registry) = executor_for(addr, |config| config.nsqd.timeout_ms = 1);

    let start = Instant::now();
    let (outcome, sink) = scrape(&executor).await;
    assert_eq!(outcome, ScrapeOutcome::Error);
    assert!(sink.is_empty());
    assert!(start.elapsed() < Duration::from_secs(2));

    let exposition = encode_registry(&registry);
    assert!(exposition.contains("nsq_exporter_scrape_duration_seconds_count{result=\"error\"} 1"));

    server.abort();
}

#[tokio::test]
async fn test_overlapping_scrapes_are_serialized() {
    let (addr, _reply) = stub_nsqd(FULL_DOC).await;
    let (executor, _registry) = executor_for(addr, |_| {});
    let executor = Arc::new(executor);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                let mut sink = MetricSink::new();
                executor.scrape(&mut sink).await;
                sink.render()
            })
        })
        .collect();

    let mut outputs = Vec::new();
    for handle in handles {
        outputs.push(handle.await.unwrap());
    }
    assert!(outputs.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn test_cancelled_scrapes_leave_no_stale_entities() {
    let (addr, reply) = stub_nsqd(&queue_doc(&[("gone", 1)])).await;
    let (executor, registry) = executor_for(addr, |_| {});

    // Drop scrapes at increasing points of their fetch and ingest.
    for micros in [0, 50, 100, 200, 400, 800, 1600, 3200, 6400] {
        let mut sink = MetricSink::new();
        let _ = tokio::time::timeout(Duration::from_micros(micros), executor.scrape(&mut sink))
            .await;
    }

    set_reply(&reply, Reply::Json(queue_doc(&[("live", 2)])));
    let (outcome, sink) = scrape(&executor).await;
    assert_eq!(outcome, ScrapeOutcome::Success);

    let output = sink.render();
    assert!(!output.contains("queue=\"gone\""), "{}", output);
    assert!(output.contains("nsq_queue_depth{queue=\"live\",paused=\"false\"} 2\n"));
    assert!(output.contains("nsq_queues_total 1\n"));

    let exposition = encode_registry(&registry);
    assert!(exposition.contains("nsq_exporter_scrape_duration_seconds_count{result=\"success\"}"));
}

#[tokio::test]
async fn test_http_server_metrics_endpoint() {
    let (addr, _reply) = stub_nsqd(FULL_DOC).await;
    let (executor, registry) = executor_for(addr, |_| {});

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = HttpServer::new(
        Arc::new(executor),
        Arc::new(registry),
        server_addr,
        "/metrics".to_string(),
    );
    let server_handle = tokio::spawn(async move {
        let _ = server.serve(listener, shutdown_rx).await;
    });

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/metrics", server_addr))
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(
        response.headers()["content-type"],
        "application/openmetrics-text; version=1.0.0; charset=utf-8"
    );
    let body = response.text().await.unwrap();
    assert!(body.contains("# TYPE nsq_queue_depth gauge"));
    assert!(body.contains("nsq_queue_depth{queue=\"orders\",paused=\"false\"} 12"));
    assert!(body.contains("nsq_exporter_scrape_duration_seconds"));
    assert!(body.ends_with("# EOF\n"));

    let ready = client
        .get(format!("http://{}/ready", server_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), reqwest::StatusCode::OK);

    // Shutdown server
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), server_handle).await;
}
