// End-to-end scenario: front door handshake promotes a Waiting Exec
// session, the client receives the title/preferences frames and then the
// command's Output, all over a real TCP + WebSocket connection (spec
// scenario "exec a command, attach, see its output").

use std::sync::Arc;
use std::time::Duration;

use sharetty::cidr::NetFilter;
use sharetty::session::{Method, Policy, Session, SessionKey};
use sharetty::ws::{self, WsMessage};
use sharetty::{frontdoor, DaemonConfig, Registry};

fn test_config(addr: &str, rec_dir: &std::path::Path) -> Arc<DaemonConfig> {
    Arc::new(DaemonConfig {
        addr: addr.to_string(),
        control_socket: rec_dir.join("unused.sock"),
        rec_dir: rec_dir.to_path_buf(),
        waiting_conn_time: 30,
        credential: String::new(),
        title_format: "{{ .Command }}@{{ .Hostname }}".to_string(),
        permit_write: true,
        permit_share: false,
        close_signal: libc::SIGHUP,
        reconnect_seconds: 0,
    })
}

#[tokio::test]
async fn test_exec_session_delivers_command_output() {
    let rec_dir = tempfile::tempdir().unwrap();
    let config = test_config("127.0.0.1:28712", rec_dir.path());
    let registry = Registry::new();

    let session = Arc::new(Session::new(
        SessionKey::new("echoer", "0.0.0.0/0"),
        None,
        Method::Exec,
        Policy {
            permit_write: true,
            ..Policy::default()
        },
        vec!["/bin/echo".to_string(), "hello-sharetty".to_string()],
        NetFilter::parse("0.0.0.0/0"),
    ));
    assert!(registry.insert(session));

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let _server = tokio::spawn(frontdoor::serve(config.clone(), registry.clone(), shutdown_rx));
    wait_for_port(&config.addr).await;

    let (mut writer, mut reader) = ws::connect(&format!("ws://{}", config.addr), &[])
        .await
        .expect("websocket connect");
    writer
        .send_text(r#"{"Arguments":"name=echoer&addr=0.0.0.0%2F0","AuthToken":""}"#)
        .await
        .unwrap();

    let mut saw_title = false;
    let mut saw_output = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    while tokio::time::Instant::now() < deadline && !(saw_title && saw_output) {
        let Some(message) = tokio::time::timeout(Duration::from_millis(500), reader.recv())
            .await
            .ok()
            .flatten()
        else {
            continue;
        };
        match message.unwrap() {
            WsMessage::Binary(data) => {
                if data.is_empty() {
                    continue;
                }
                match data[0] {
                    b'2' => saw_title = true, // SERVER_SET_WINDOW_TITLE
                    b'0' => {
                        // SERVER_OUTPUT: base64-encoded PTY bytes.
                        use base64::Engine;
                        let decoded = base64::engine::general_purpose::STANDARD
                            .decode(&data[1..])
                            .unwrap();
                        if String::from_utf8_lossy(&decoded).contains("hello-sharetty") {
                            saw_output = true;
                        }
                    }
                    _ => {}
                }
            }
            WsMessage::Text(_) => {}
            WsMessage::Close { .. } => break,
            _ => {}
        }
    }

    assert!(saw_title, "never received SetWindowTitle");
    assert!(saw_output, "never received the command's output");
}

async fn wait_for_port(addr: &str) {
    for _ in 0..50 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("front door never started listening on {addr}");
}
