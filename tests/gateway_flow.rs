//! End-to-end gateway flows over real sockets
//!
//! Each test boots a gateway on an ephemeral port with emulated devices
//! behind backend `a` and drives it with a plain WebSocket client.

use futures_util::{SinkExt, StreamExt};
use scanbridge::backend::AlphaBackend;
use scanbridge::driver::emulated::{EmulatedPort, EmulatedProfile};
use scanbridge::driver::DriverPort;
use scanbridge::gateway::Gateway;
use scanbridge::prefs::PreferencesStore;
use scanbridge::recompress::Recompressor;
use scanbridge::router::ScannerRouter;
use scanbridge::session_store::SessionStore;
use scanbridge::state::{AppConfig, AppState};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config(data_dir: std::path::PathBuf) -> AppConfig {
    AppConfig {
        bind_host: "127.0.0.1".to_string(),
        ws_port: 0,
        wss_port: 0,
        cert_path: data_dir.join("certificate.pem"),
        cert_password: String::new(),
        cert_validity_days: 365,
        auto_install_cert: false,
        token_ttl_minutes: 30,
        max_sessions: 8,
        data_dir,
        escl_hosts: Vec::new(),
        emulated_devices: 0,
        recompress_threshold: 5 * 1024 * 1024,
        jpeg_quality: 85,
    }
}

/// Boot a gateway whose backend `a` exposes the given emulated devices
async fn start_gateway(
    profiles: Vec<EmulatedProfile>,
    session_ttl: chrono::Duration,
) -> SocketAddr {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path().to_path_buf());
    // Keep the preferences directory alive for the test duration
    std::mem::forget(dir);

    let router = Arc::new(ScannerRouter::new());
    let (tx, rx) = mpsc::channel(64);
    let port: Arc<dyn DriverPort> = Arc::new(EmulatedPort::new(profiles));
    router
        .register(Arc::new(AlphaBackend::new(Some(port), tx)), rx)
        .await;
    router.initialize().await;

    let prefs = Arc::new(PreferencesStore::load(&config.data_dir).await);
    let sessions = Arc::new(SessionStore::new(session_ttl, config.max_sessions));
    let recompressor = Arc::new(Recompressor::new(
        config.recompress_threshold,
        config.jpeg_quality,
    ));
    let (ui_tx, _ui_rx) = mpsc::unbounded_channel();

    let state = AppState {
        config,
        sessions,
        router,
        prefs,
        recompressor,
        ui_events: ui_tx,
    };

    let gateway = Gateway::new(state);
    let (plain, _tls) = gateway.start(None).await.unwrap();
    plain.expect("plaintext listener")
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("connect");
    client
}

async fn send(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .expect("send");
}

/// Next JSON frame, skipping transport frames
async fn next_frame(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame timeout")
            .expect("stream open")
            .expect("frame");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

async fn authenticate(client: &mut Client) -> String {
    send(client, json!({"action": "authenticate", "requestId": "auth"})).await;
    let frame = next_frame(client).await;
    assert_eq!(frame["status"], "success");
    assert_eq!(frame["action"], "authenticate");
    assert!(frame["expiresAt"].is_string());
    frame["token"].as_str().expect("token").to_string()
}

fn quick(name: &str) -> EmulatedProfile {
    EmulatedProfile::new(name).page_delay(Duration::from_millis(5))
}

#[tokio::test]
async fn authenticate_and_ping() {
    let addr = start_gateway(vec![quick("ACME ADF")], chrono::Duration::minutes(30)).await;
    let mut client = connect(addr).await;

    let token = authenticate(&mut client).await;

    send(
        &mut client,
        json!({"action": "ping", "requestId": "r2", "token": token}),
    )
    .await;
    let frame = next_frame(&mut client).await;
    assert_eq!(frame["status"], "success");
    assert_eq!(frame["action"], "pong");
    assert_eq!(frame["requestId"], "r2");
    assert_eq!(frame["message"], "pong");
}

#[tokio::test]
async fn two_page_adf_scan() {
    let addr = start_gateway(vec![quick("ACME ADF").sheets(5)], chrono::Duration::minutes(30)).await;
    let mut client = connect(addr).await;
    let token = authenticate(&mut client).await;

    send(
        &mut client,
        json!({"action": "list_scanners", "requestId": "r2", "token": token}),
    )
    .await;
    let frame = next_frame(&mut client).await;
    assert_eq!(frame["status"], "success");
    let scanners = frame["scanners"].as_array().unwrap();
    assert_eq!(scanners.len(), 1);
    assert_eq!(scanners[0]["id"], "a:ACME ADF");
    assert_eq!(scanners[0]["protocol"], "a");
    assert_eq!(scanners[0]["isDefault"], true);

    send(
        &mut client,
        json!({
            "action": "select_scanner", "requestId": "r3", "token": token,
            "settings": {"source": "a:ACME ADF"}
        }),
    )
    .await;
    assert_eq!(next_frame(&mut client).await["status"], "success");

    send(
        &mut client,
        json!({
            "action": "scan", "requestId": "job1", "token": token,
            "settings": {"dpi": 300, "pixelType": "Gray8", "useAdf": true, "maxPages": 2}
        }),
    )
    .await;

    let mut pages = Vec::new();
    loop {
        let frame = next_frame(&mut client).await;
        assert_eq!(frame["requestId"], "job1");
        match frame["status"].as_str().unwrap() {
            "scanning" => {
                let page = frame["pageNumber"].as_u64().unwrap();
                assert!(frame["data"].as_str().unwrap().len() > 16);
                assert_eq!(frame["metadata"]["dpi"], 300);
                pages.push(page);
            }
            "completed" => {
                assert_eq!(frame["totalPages"], 2);
                break;
            }
            other => panic!("unexpected status {other}: {frame}"),
        }
    }
    assert_eq!(pages, vec![1, 2]);
}

#[tokio::test]
async fn busy_rejection_keeps_first_scan_alive() {
    let addr = start_gateway(
        vec![quick("ACME ADF").sheets(4).page_delay(Duration::from_millis(30))],
        chrono::Duration::minutes(30),
    )
    .await;
    let mut client = connect(addr).await;
    let token = authenticate(&mut client).await;

    send(
        &mut client,
        json!({
            "action": "scan", "requestId": "job1", "token": token,
            "settings": {"source": "a:ACME ADF", "maxPages": 2}
        }),
    )
    .await;
    send(
        &mut client,
        json!({"action": "scan", "requestId": "job2", "token": token}),
    )
    .await;

    let mut saw_busy = false;
    let mut completed = false;
    while !(saw_busy && completed) {
        let frame = next_frame(&mut client).await;
        match (
            frame["requestId"].as_str().unwrap(),
            frame["status"].as_str().unwrap(),
        ) {
            ("job2", "error") => {
                assert_eq!(frame["errorCode"], "SCANNER_BUSY");
                saw_busy = true;
            }
            ("job1", "completed") => {
                assert_eq!(frame["totalPages"], 2);
                completed = true;
            }
            ("job1", "scanning") => {}
            other => panic!("unexpected frame {other:?}: {frame}"),
        }
    }
}

#[tokio::test]
async fn cancellation_suppresses_terminal_frames() {
    let addr = start_gateway(
        vec![quick("ACME ADF").sheets(50).page_delay(Duration::from_millis(25))],
        chrono::Duration::minutes(30),
    )
    .await;
    let mut client = connect(addr).await;
    let token = authenticate(&mut client).await;

    send(
        &mut client,
        json!({
            "action": "scan", "requestId": "job1", "token": token,
            "settings": {"source": "a:ACME ADF"}
        }),
    )
    .await;

    // Let a few pages through
    let mut seen = 0;
    while seen < 3 {
        let frame = next_frame(&mut client).await;
        assert_eq!(frame["status"], "scanning");
        seen += 1;
    }

    send(
        &mut client,
        json!({"action": "stop_scan", "requestId": "r9", "token": token}),
    )
    .await;

    // The cancelled ack arrives; stray in-flight pages may precede it
    loop {
        let frame = next_frame(&mut client).await;
        if frame["status"] == "cancelled" {
            assert_eq!(frame["requestId"], "r9");
            break;
        }
        assert_eq!(frame["status"], "scanning");
    }

    // And job1 never reaches a terminal state
    let quiet = tokio::time::timeout(Duration::from_millis(400), async {
        loop {
            let frame = next_frame(&mut client).await;
            let status = frame["status"].as_str().unwrap();
            if frame["requestId"] == "job1" && (status == "completed" || status == "error") {
                return frame;
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "terminal frame leaked: {quiet:?}");
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let addr = start_gateway(
        vec![quick("ACME ADF")],
        chrono::Duration::milliseconds(80),
    )
    .await;
    let mut client = connect(addr).await;
    let token = authenticate(&mut client).await;

    tokio::time::sleep(Duration::from_millis(250)).await;

    send(
        &mut client,
        json!({"action": "list_scanners", "requestId": "r2", "token": token}),
    )
    .await;
    let frame = next_frame(&mut client).await;
    assert_eq!(frame["status"], "error");
    assert_eq!(frame["errorCode"], "INVALID_TOKEN");
}

#[tokio::test]
async fn headless_refusal_hints_at_show_ui() {
    let addr = start_gateway(
        vec![quick("Vendor Window Scanner").refuse_headless()],
        chrono::Duration::minutes(30),
    )
    .await;
    let mut client = connect(addr).await;
    let token = authenticate(&mut client).await;

    send(
        &mut client,
        json!({
            "action": "scan", "requestId": "job1", "token": token,
            "settings": {"source": "a:Vendor Window Scanner", "showUI": false}
        }),
    )
    .await;
    let frame = next_frame(&mut client).await;
    assert_eq!(frame["status"], "error");
    assert_eq!(frame["errorCode"], "SCAN_FAILED");
    assert!(frame["message"].as_str().unwrap().contains("showUI"));
}

#[tokio::test]
async fn page_cap_is_enforced_in_ui_mode() {
    // The vendor window owns the driver-side cap; the session still caps
    let addr = start_gateway(
        vec![quick("ACME ADF").sheets(5)],
        chrono::Duration::minutes(30),
    )
    .await;
    let mut client = connect(addr).await;
    let token = authenticate(&mut client).await;

    send(
        &mut client,
        json!({
            "action": "scan", "requestId": "job1", "token": token,
            "settings": {"source": "a:ACME ADF", "showUI": true, "maxPages": 1}
        }),
    )
    .await;

    let page = next_frame(&mut client).await;
    assert_eq!(page["status"], "scanning");
    assert_eq!(page["pageNumber"], 1);

    let terminal = next_frame(&mut client).await;
    assert_eq!(terminal["status"], "completed");
    assert_eq!(terminal["totalPages"], 1);
}

#[tokio::test]
async fn invalid_frames_keep_the_connection_open() {
    let addr = start_gateway(vec![quick("ACME ADF")], chrono::Duration::minutes(30)).await;
    let mut client = connect(addr).await;

    // Unknown action, request id echoed
    send(&mut client, json!({"action": "explode", "requestId": "r1"})).await;
    let frame = next_frame(&mut client).await;
    assert_eq!(frame["status"], "error");
    assert_eq!(frame["errorCode"], "INVALID_REQUEST");
    assert_eq!(frame["requestId"], "r1");

    // Non-JSON garbage
    client
        .send(Message::Text("{definitely not json".to_string()))
        .await
        .unwrap();
    let frame = next_frame(&mut client).await;
    assert_eq!(frame["errorCode"], "INVALID_REQUEST");

    // The connection still serves requests
    send(&mut client, json!({"action": "ping", "requestId": "r3"})).await;
    assert_eq!(next_frame(&mut client).await["action"], "pong");
}

#[tokio::test]
async fn legacy_wakeup_is_swallowed() {
    let addr = start_gateway(vec![quick("ACME ADF")], chrono::Duration::minutes(30)).await;
    let mut client = connect(addr).await;

    client
        .send(Message::Text("1100".to_string()))
        .await
        .unwrap();

    // No response to the wake-up; the next frame answers the ping
    send(&mut client, json!({"action": "ping", "requestId": "r1"})).await;
    let frame = next_frame(&mut client).await;
    assert_eq!(frame["action"], "pong");
    assert_eq!(frame["requestId"], "r1");
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let addr = start_gateway(vec![quick("ACME ADF")], chrono::Duration::minutes(30)).await;
    let mut client = connect(addr).await;

    send(&mut client, json!({"action": "list_scanners", "requestId": "r1"})).await;
    let frame = next_frame(&mut client).await;
    assert_eq!(frame["status"], "error");
    assert_eq!(frame["errorCode"], "UNAUTHORIZED");
}

#[tokio::test]
async fn stop_scan_without_job_is_idempotent() {
    let addr = start_gateway(vec![quick("ACME ADF")], chrono::Duration::minutes(30)).await;
    let mut client = connect(addr).await;
    let token = authenticate(&mut client).await;

    send(
        &mut client,
        json!({"action": "stop_scan", "requestId": "r2", "token": token}),
    )
    .await;
    let frame = next_frame(&mut client).await;
    assert_eq!(frame["status"], "cancelled");
    assert_eq!(frame["requestId"], "r2");
}

#[tokio::test]
async fn capabilities_roundtrip_after_patch() {
    let addr = start_gateway(vec![quick("ACME ADF")], chrono::Duration::minutes(30)).await;
    let mut client = connect(addr).await;
    let token = authenticate(&mut client).await;

    send(
        &mut client,
        json!({
            "action": "select_scanner", "requestId": "r2", "token": token,
            "settings": {"source": "a:ACME ADF"}
        }),
    )
    .await;
    next_frame(&mut client).await;

    send(
        &mut client,
        json!({
            "action": "apply_device_settings", "requestId": "r3", "token": token,
            "patch": {"dpi": 300, "pixelType": "gray8"}
        }),
    )
    .await;
    let frame = next_frame(&mut client).await;
    assert_eq!(frame["status"], "success");
    let results = frame["results"].as_array().unwrap();
    assert!(results
        .iter()
        .all(|r| r["status"] == "applied"));

    send(
        &mut client,
        json!({"action": "get_device_capabilities", "requestId": "r4", "token": token}),
    )
    .await;
    let frame = next_frame(&mut client).await;
    assert_eq!(frame["scannerId"], "a:ACME ADF");
    assert_eq!(frame["protocol"], "a");
    let capabilities = frame["capabilities"].as_array().unwrap();
    let dpi = capabilities.iter().find(|c| c["key"] == "dpi").unwrap();
    assert_eq!(dpi["currentValue"], 300);
    let pixel = capabilities
        .iter()
        .find(|c| c["key"] == "pixelType")
        .unwrap();
    assert_eq!(pixel["currentValue"], "GRAY8");
}

#[tokio::test]
async fn disconnect_sweeps_the_session() {
    let addr = start_gateway(vec![quick("ACME ADF")], chrono::Duration::minutes(30)).await;

    let mut first = connect(addr).await;
    let token = authenticate(&mut first).await;
    drop(first);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut second = connect(addr).await;
    send(
        &mut second,
        json!({"action": "list_scanners", "requestId": "r1", "token": token}),
    )
    .await;
    let frame = next_frame(&mut second).await;
    // The token died with the connection
    assert_eq!(frame["errorCode"], "INVALID_TOKEN");
}
