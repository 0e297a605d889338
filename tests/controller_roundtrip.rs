use std::collections::BTreeMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use flowsched::config::{ControllerConfig, PublisherConfig};
use flowsched::error::TransportError;
use flowsched::fabric::SwitchId;
use flowsched::gateway::{Client, StatsGateway};
use flowsched::publish::{HttpPublisher, PathPublisher, PublishOutcome};
use flowsched::sched::{GroupKey, PathAssignment};

const LEAF: &str = "00:00:00:00:00:00:00:0a";
const SPINE: &str = "00:00:00:00:00:00:00:5a";

// --- Fake controller ---

#[derive(Default)]
struct Controller {
    /// Respond 500 to every request when set.
    broken: Mutex<bool>,
    /// Decoded bodies POSTed to the forwarding endpoint.
    received: Mutex<Vec<Value>>,
    encodings: Mutex<Vec<Option<String>>>,
}

type Shared = Arc<Controller>;

fn flow_reply(bytes: u64) -> Value {
    json!({"flows": [
        {
            "table_id": "0xc8",
            "packet_count": "10",
            "byte_count": bytes.to_string(),
            "match": {
                "eth_type": "0x800",
                "ipv4_src": "10.10.1.1",
                "ipv4_dst": "10.10.2.1",
                "ip_proto": "0x6",
                "tcp_src": "5001",
                "tcp_dst": "5002"
            }
        },
        {
            // Forwarding table entry, not a statistics entry.
            "table_id": "0x0",
            "packet_count": "99",
            "byte_count": "9999",
            "match": {"in_port": "1"}
        }
    ]})
}

fn port_reply() -> Value {
    json!({"port_reply": [{
        "version": "OF_13",
        "port": [
            {
                "port_number": "local",
                "receive_packets": "0",
                "receive_bytes": "0",
                "transmit_packets": "0",
                "transmit_bytes": "0"
            },
            {
                "port_number": "1",
                "receive_packets": "5",
                "receive_bytes": "500",
                "transmit_packets": "7",
                "transmit_bytes": "7000"
            }
        ]
    }]})
}

fn unavailable() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "controller unavailable").into_response()
}

async fn switches(State(ctl): State<Shared>) -> Response {
    if *ctl.broken.lock() {
        return unavailable();
    }
    Json(json!([
        {"switchDPID": LEAF, "inetAddress": "/127.0.0.1:50001"},
        {"switchDPID": SPINE, "inetAddress": "/127.0.0.1:50002"},
        {"inetAddress": "/127.0.0.1:50003"}
    ]))
    .into_response()
}

async fn flows(State(ctl): State<Shared>, Path(dpid): Path<String>) -> Response {
    if *ctl.broken.lock() {
        return unavailable();
    }
    if dpid == "all" {
        return Json(json!({LEAF: flow_reply(1_000), SPINE: flow_reply(2_000)})).into_response();
    }
    // Single-switch replies come wrapped under the dpid.
    Json(json!({ dpid: flow_reply(1_000) })).into_response()
}

async fn ports(State(ctl): State<Shared>, Path(dpid): Path<String>) -> Response {
    if *ctl.broken.lock() {
        return unavailable();
    }
    if dpid == "all" {
        return Json(json!({LEAF: port_reply(), SPINE: port_reply()})).into_response();
    }
    Json(port_reply()).into_response()
}

async fn forward(State(ctl): State<Shared>, headers: HeaderMap, body: Bytes) -> StatusCode {
    if *ctl.broken.lock() {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    let encoding = headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let raw = match encoding.as_deref() {
        Some("gzip") => {
            let mut out = Vec::new();
            if flate2::read::GzDecoder::new(&body[..])
                .read_to_end(&mut out)
                .is_err()
            {
                return StatusCode::BAD_REQUEST;
            }
            out
        }
        _ => body.to_vec(),
    };

    let Ok(value) = serde_json::from_slice::<Value>(&raw) else {
        return StatusCode::BAD_REQUEST;
    };

    ctl.received.lock().push(value);
    ctl.encodings.lock().push(encoding);
    StatusCode::NO_CONTENT
}

async fn start_controller() -> (SocketAddr, Shared) {
    let ctl: Shared = Arc::new(Controller::default());

    let app = Router::new()
        .route("/wm/core/controller/switches/json", get(switches))
        .route("/wm/core/switch/:dpid/flow/json", get(flows))
        .route("/wm/core/switch/:dpid/port/json", get(ports))
        .route("/wm/forwarding/json", post(forward))
        .with_state(Arc::clone(&ctl));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake controller");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fake controller");
    });

    (addr, ctl)
}

fn controller_cfg(addr: SocketAddr) -> ControllerConfig {
    ControllerConfig {
        endpoint: addr.to_string(),
        timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn assignment() -> PathAssignment {
    let mut a = PathAssignment::new();
    a.insert(
        GroupKey::Switch(SwitchId::from(LEAF)),
        BTreeMap::from([(0, 1), (1, 5)]),
    );
    a
}

// --- Tests ---

#[tokio::test]
async fn client_reads_switches_flows_and_ports() {
    let (addr, _ctl) = start_controller().await;
    let client = Client::new(&controller_cfg(addr), 0xc8).expect("client");

    let switches = client.fetch_switches().await.expect("switch list");
    assert_eq!(switches, vec![SwitchId::from(LEAF), SwitchId::from(SPINE)]);

    let leaf = SwitchId::from(LEAF);
    let flows = client.fetch_flows(&leaf).await.expect("flows");
    assert_eq!(flows.records.len(), 1);
    assert_eq!(flows.skipped, 1);
    assert!(flows.errors.is_empty());
    assert_eq!(flows.records[0].key.src_port, 5001);
    assert_eq!(flows.records[0].sample.byte_count, 1_000);

    let ports = client.fetch_ports(&leaf).await.expect("ports");
    assert_eq!(ports.records.len(), 1);
    assert_eq!(ports.errors.len(), 1);
    assert_eq!(ports.records[0].port, 1);
    assert_eq!(ports.records[0].sample.tx_bytes, 7_000);
}

#[tokio::test]
async fn client_bulk_replies_split_per_switch() {
    let (addr, _ctl) = start_controller().await;
    let client = Client::new(&controller_cfg(addr), 0xc8).expect("client");

    let flows = client.fetch_all_flows().await.expect("bulk flows");
    assert_eq!(flows.len(), 2);
    assert_eq!(
        flows[&SwitchId::from(SPINE)].records[0].sample.byte_count,
        2_000
    );

    let ports = client.fetch_all_ports().await.expect("bulk ports");
    assert_eq!(ports.len(), 2);
    assert!(ports.contains_key(&SwitchId::from(LEAF)));
}

#[tokio::test]
async fn client_reports_error_status() {
    let (addr, ctl) = start_controller().await;
    *ctl.broken.lock() = true;

    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&calls);
    let client = Client::new(&controller_cfg(addr), 0xc8)
        .expect("client")
        .with_metrics(Box::new(move |endpoint, status, _| {
            recorded
                .lock()
                .push((endpoint.to_string(), status.to_string()));
        }));

    let err = client.fetch_switches().await.unwrap_err();
    assert!(matches!(err, TransportError::Status { status: 500, .. }));
    assert_eq!(err.kind(), "status");
    assert_eq!(
        calls.lock().as_slice(),
        &[("switches".to_string(), "error".to_string())]
    );
}

#[tokio::test]
async fn client_unreachable_controller_is_request_error() {
    let cfg = ControllerConfig {
        endpoint: "127.0.0.1:1".to_string(),
        timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let client = Client::new(&cfg, 0xc8).expect("client");

    let err = client.fetch_switches().await.unwrap_err();
    assert!(matches!(err, TransportError::Request { .. }));
}

#[tokio::test]
async fn publisher_posts_assignment() {
    let (addr, ctl) = start_controller().await;
    let publisher =
        HttpPublisher::new(&PublisherConfig::default(), &controller_cfg(addr)).expect("publisher");

    let outcome = publisher.publish(&assignment()).await.expect("accepted");
    assert_eq!(outcome, PublishOutcome::Accepted);

    let received = ctl.received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], json!({ LEAF: {"0": 1, "1": 5} }));
    assert_eq!(ctl.encodings.lock()[0], None);
}

#[tokio::test]
async fn publisher_gzip_body_decodes() {
    let (addr, ctl) = start_controller().await;
    let cfg = PublisherConfig {
        compression: "gzip".to_string(),
        ..Default::default()
    };
    let publisher = HttpPublisher::new(&cfg, &controller_cfg(addr)).expect("publisher");

    publisher.publish(&assignment()).await.expect("accepted");

    assert_eq!(ctl.encodings.lock()[0].as_deref(), Some("gzip"));
    assert_eq!(ctl.received.lock()[0][LEAF]["1"], json!(5));
}

#[tokio::test]
async fn publisher_rejected_by_controller() {
    let (addr, ctl) = start_controller().await;
    *ctl.broken.lock() = true;
    let publisher =
        HttpPublisher::new(&PublisherConfig::default(), &controller_cfg(addr)).expect("publisher");

    let err = publisher.publish(&assignment()).await.unwrap_err();
    assert!(matches!(err, TransportError::Status { status: 500, .. }));
    assert!(ctl.received.lock().is_empty());
}
