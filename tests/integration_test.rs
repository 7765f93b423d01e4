// Integration tests for pubsub-latency
//
// These tests run the full benchmark stack (runner, driver, TCP client and
// RESP codec) against the in-process mock broker.

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use pubsub_latency::{
    broker::{
        resp::{encode_command, read_frame, Frame},
        MockBroker,
    },
    config::{BenchConfig, MockBrokerConfig},
    driver::Phase,
    report::BenchmarkReport,
    runner::BenchmarkRunner,
};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

/// Start a mock broker with the given PUBLISH error rate
async fn start_broker(error_rate: f64) -> MockBroker {
    let mut broker = MockBroker::new(MockBrokerConfig {
        port: 0,
        error_rate,
    });
    broker.start().await.expect("Failed to start mock broker");
    broker
}

/// A small workload pointed at the given local port
fn workload(port: u16, subscribers: usize, publishers: usize, iterations: u64) -> BenchConfig {
    BenchConfig {
        subscribers,
        publishers,
        iterations: Some(iterations),
        connect_timeout_secs: 5,
        stall_timeout_secs: 10,
        ..Default::default()
    }
    .with_local_port(port)
}

/// Run to completion, collecting the latency lines
async fn run(config: BenchConfig) -> (BenchmarkReport, Vec<String>) {
    let mut lines = Vec::new();
    let report = BenchmarkRunner::new(config)
        .run_until(std::future::pending(), |summary| {
            lines.push(summary.latency_line())
        })
        .await
        .expect("benchmark setup failed");
    (report, lines)
}

// ==================================================================================================
// Fan-out
// ==================================================================================================

#[tokio::test]
async fn test_every_burst_delivers_full_fan_out() {
    let broker = start_broker(0.0).await;
    let (report, lines) = run(workload(broker.port(), 8, 3, 4)).await;

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.phase, Phase::Ready);
    assert_eq!(report.deliveries_per_burst, 24);
    assert_eq!(report.latency.bursts, 4);
    assert_eq!(report.deliveries, 4 * 24);
    assert_eq!(report.lost_deliveries, 0);
    assert_eq!(report.stray_deliveries, 0);
    assert_eq!(report.publish_errors, 0);
    assert!((report.delivery_rate() - 100.0).abs() < f64::EPSILON);

    assert_eq!(lines.len(), 4);
    for line in &lines {
        let value = line
            .strip_prefix("Latency: ")
            .and_then(|rest| rest.strip_suffix(" ms"))
            .unwrap_or_else(|| panic!("malformed latency line {:?}", line));
        let (_, decimals) = value.split_once('.').expect("latency has decimals");
        assert_eq!(decimals.len(), 3, "latency line {:?}", line);
        assert!(value.parse::<f64>().unwrap() >= 0.0);
    }
}

#[tokio::test]
async fn test_parallel_connect_reaches_ready() {
    let broker = start_broker(0.0).await;
    let config = BenchConfig {
        connect_concurrency: 16,
        ..workload(broker.port(), 50, 10, 2)
    };
    let (report, _) = run(config).await;

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.latency.bursts, 2);
    assert_eq!(report.deliveries, 2 * 500);
}

#[tokio::test]
async fn test_all_subscribers_registered_before_first_burst() {
    let broker = start_broker(0.0).await;
    let (report, _) = run(workload(broker.port(), 6, 2, 1)).await;

    assert!(report.error.is_none());
    assert_eq!(broker.subscriber_count("eventName"), 6);
}

#[tokio::test]
async fn test_custom_channel_and_payload_reach_outside_subscriber() {
    let broker = start_broker(0.0).await;

    // An extra subscriber that is not part of the benchmark
    let mut watcher = TcpStream::connect(broker.addr()).await.unwrap();
    let mut out = BytesMut::new();
    encode_command(&[b"SUBSCRIBE", b"bench-channel"], &mut out);
    watcher.write_all(&out).await.unwrap();
    let mut buf = BytesMut::new();
    let ack = read_frame(&mut watcher, &mut buf).await.unwrap().unwrap();
    assert!(matches!(ack, Frame::Array(_)));

    let config = BenchConfig {
        channel: "bench-channel".to_string(),
        payload: "hello".to_string(),
        ..workload(broker.port(), 3, 2, 1)
    };
    let (report, _) = run(config).await;

    // Extra receivers never count as a shortfall
    assert!(report.error.is_none());
    assert_eq!(report.deliveries, 6);
    assert_eq!(report.lost_deliveries, 0);

    for _ in 0..2 {
        let frame = read_frame(&mut watcher, &mut buf).await.unwrap().unwrap();
        let Frame::Array(items) = frame else {
            panic!("expected message push, got {:?}", frame);
        };
        assert_eq!(items[0].as_bytes(), Some(&b"message"[..]));
        assert_eq!(items[1].as_bytes(), Some(&b"bench-channel"[..]));
        assert_eq!(items[2], Frame::Bulk(Bytes::from("hello")));
    }
}

#[tokio::test]
async fn test_iteration_limit_publishes_no_extra_burst() {
    let broker = start_broker(0.0).await;

    let mut watcher = TcpStream::connect(broker.addr()).await.unwrap();
    let mut out = BytesMut::new();
    encode_command(&[b"SUBSCRIBE", b"eventName"], &mut out);
    watcher.write_all(&out).await.unwrap();
    let mut buf = BytesMut::new();
    read_frame(&mut watcher, &mut buf).await.unwrap().unwrap();

    let (report, _) = run(workload(broker.port(), 2, 3, 1)).await;
    assert!(report.error.is_none());
    assert_eq!(report.latency.bursts, 1);

    // One burst of three publishes, nothing after it
    for _ in 0..3 {
        read_frame(&mut watcher, &mut buf).await.unwrap().unwrap();
    }
    let extra = tokio::time::timeout(
        std::time::Duration::from_millis(300),
        read_frame(&mut watcher, &mut buf),
    )
    .await;
    assert!(extra.is_err(), "unexpected message after the last burst: {:?}", extra);
}

// ==================================================================================================
// Publish failures
// ==================================================================================================

#[tokio::test]
async fn test_failed_publishes_count_as_lost() {
    let broker = start_broker(1.0).await;
    let (report, lines) = run(workload(broker.port(), 4, 3, 3)).await;

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.latency.bursts, 3);
    assert_eq!(lines.len(), 3);
    assert_eq!(report.deliveries, 0);
    assert_eq!(report.lost_deliveries, 3 * 12);
    assert_eq!(report.publish_errors, 3 * 3);
    assert_eq!(report.delivery_rate(), 0.0);
}

#[tokio::test]
async fn test_partial_failures_still_terminate_every_burst() {
    let broker = start_broker(0.5).await;
    let (report, _) = run(workload(broker.port(), 5, 4, 10)).await;

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.latency.bursts, 10);
    assert_eq!(report.deliveries + report.lost_deliveries, 10 * 20);
    assert_eq!(report.lost_deliveries, report.publish_errors * 5);
}

// ==================================================================================================
// Fatal failures
// ==================================================================================================

#[tokio::test]
async fn test_refused_connection_aborts_run() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (report, lines) = run(workload(port, 3, 1, 1)).await;

    let error = report.error.expect("run should fail");
    assert!(error.starts_with("Failed to connect subscriber #0"), "{}", error);
    assert_eq!(report.phase, Phase::ConnectingSubscribers);
    assert!(lines.is_empty());
}

#[tokio::test]
async fn test_broker_shutdown_mid_run_is_fatal() {
    let mut broker = start_broker(0.0).await;
    let config = BenchConfig {
        iterations: None,
        ..workload(broker.port(), 4, 2, 1)
    };

    let report = BenchmarkRunner::new(config)
        .run_until(std::future::pending(), |_| broker.stop())
        .await
        .unwrap();

    let error = report.error.expect("run should fail after shutdown");
    assert!(error.starts_with("Connection lost on"), "{}", error);
    assert_eq!(report.phase, Phase::Ready);
    assert!(report.latency.bursts >= 1);
}

// ==================================================================================================
// Report
// ==================================================================================================

#[tokio::test]
async fn test_json_report_from_real_run() {
    let broker = start_broker(0.0).await;
    let (report, _) = run(workload(broker.port(), 2, 2, 2)).await;

    let value: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
    assert_eq!(value["phase"], "ready");
    assert_eq!(value["subscribers"], 2);
    assert_eq!(value["publishers"], 2);
    assert_eq!(value["deliveries"], 8);
    assert_eq!(value["latency"]["bursts"], 2);
    assert!(value["error"].is_null());
    assert_eq!(value["server"], broker.addr());
}
