// Exercises the control-plane RPC (component G) over a real Unix socket:
// Exec allocates a Waiting session, Ps lists it, Close removes it. Mirrors
// spec scenario "exec a session, list it, close it" end to end.

use std::sync::Arc;
use std::time::Duration;

use sharetty::control::{self, ControlReply, ControlRequest};
use sharetty::session::{Policy, Status};
use sharetty::{DaemonConfig, Registry};

fn test_config(rec_dir: &std::path::Path, control_socket: &std::path::Path) -> Arc<DaemonConfig> {
    Arc::new(DaemonConfig {
        addr: "127.0.0.1:0".to_string(),
        control_socket: control_socket.to_path_buf(),
        rec_dir: rec_dir.to_path_buf(),
        waiting_conn_time: 30,
        credential: String::new(),
        title_format: "{{ .Command }}@{{ .Hostname }}".to_string(),
        permit_write: false,
        permit_share: false,
        close_signal: libc::SIGHUP,
        reconnect_seconds: 0,
    })
}

#[tokio::test]
async fn test_exec_ps_close_round_trip() {
    let rec_dir = tempfile::tempdir().unwrap();
    let sock_dir = tempfile::tempdir().unwrap();
    let socket_path = sock_dir.path().join("control.sock");
    let config = test_config(rec_dir.path(), &socket_path);
    let registry = Registry::new();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let server = tokio::spawn(control::serve(config.clone(), registry.clone(), shutdown_rx));
    wait_for_socket(&socket_path).await;

    let reply = control::call(
        &socket_path,
        &ControlRequest::Exec {
            name: "demo".to_string(),
            addr: "0.0.0.0/0".to_string(),
            command: vec!["/bin/echo".to_string(), "hello".to_string()],
            policy: Policy::default(),
        },
    )
    .await
    .unwrap();
    let info = match reply {
        ControlReply::Session(info) => info,
        other => panic!("expected Session reply, got {other:?}"),
    };
    assert_eq!(info.key.name, "demo");
    assert_eq!(info.status, Status::Waiting);

    let reply = control::call(&socket_path, &ControlRequest::Ps { all: false })
        .await
        .unwrap();
    match reply {
        ControlReply::Sessions(sessions) => {
            assert!(sessions.iter().any(|s| s.key.name == "demo"));
        }
        other => panic!("expected Sessions reply, got {other:?}"),
    }

    let reply = control::call(
        &socket_path,
        &ControlRequest::Close {
            name: "demo".to_string(),
            addr: "0.0.0.0/0".to_string(),
            all: true,
        },
    )
    .await
    .unwrap();
    assert!(matches!(reply, ControlReply::Ok));
    assert_eq!(registry.len(), 0);

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
}

#[tokio::test]
async fn test_duplicate_explicit_name_is_rejected_over_the_wire() {
    let rec_dir = tempfile::tempdir().unwrap();
    let sock_dir = tempfile::tempdir().unwrap();
    let socket_path = sock_dir.path().join("control.sock");
    let config = test_config(rec_dir.path(), &socket_path);
    let registry = Registry::new();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let server = tokio::spawn(control::serve(config.clone(), registry.clone(), shutdown_rx));
    wait_for_socket(&socket_path).await;

    let request = || ControlRequest::Exec {
        name: "fixed".to_string(),
        addr: "0.0.0.0/0".to_string(),
        command: vec!["/bin/true".to_string()],
        policy: Policy::default(),
    };
    let first = control::call(&socket_path, &request()).await.unwrap();
    assert!(matches!(first, ControlReply::Session(_)));

    let second = control::call(&socket_path, &request()).await.unwrap();
    match second {
        ControlReply::Error { exit_code, .. } => assert_eq!(exit_code, 4),
        other => panic!("expected Error reply, got {other:?}"),
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
}

#[tokio::test]
async fn test_exec_with_record_returns_rec_id_before_any_client_connects() {
    let rec_dir = tempfile::tempdir().unwrap();
    let sock_dir = tempfile::tempdir().unwrap();
    let socket_path = sock_dir.path().join("control.sock");
    let config = test_config(rec_dir.path(), &socket_path);
    let registry = Registry::new();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let server = tokio::spawn(control::serve(config.clone(), registry.clone(), shutdown_rx));
    wait_for_socket(&socket_path).await;

    let policy = Policy {
        record: true,
        ..Policy::default()
    };
    let reply = control::call(
        &socket_path,
        &ControlRequest::Exec {
            name: "recorded".to_string(),
            addr: "0.0.0.0/0".to_string(),
            command: vec!["/bin/true".to_string()],
            policy,
        },
    )
    .await
    .unwrap();
    let info = match reply {
        ControlReply::Session(info) => info,
        other => panic!("expected Session reply, got {other:?}"),
    };
    assert_eq!(info.status, Status::Waiting);
    let rec_id = info.rec_id.expect("Exec with record=true must return a RecId immediately");
    assert!(rec_dir.path().join(&rec_id).exists());

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
}

async fn wait_for_socket(path: &std::path::Path) {
    for _ in 0..50 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("control socket {} never appeared", path.display());
}
