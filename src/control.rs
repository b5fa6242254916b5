//! Control-plane RPC (component G).
//!
//! A local Unix-domain socket the `sharetty` CLI talks to: `Ps`/`Exec`/
//! `Attach`/`Play`/`Close` verbs that register or mutate sessions in the
//! registry. Wire format is one length-prefixed JSON value per request and
//! per reply — the socket carries exactly one request/reply pair, then the
//! client disconnects. Grounded on the teacher's `socket::server` accept
//! loop (stale-socket removal, 0600 perms, backoff on accept errors), with
//! a plain length-prefixed JSON body in place of its multi-frame protocol
//! since every control-plane exchange here is a single call and reply.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::cidr::NetFilter;
use crate::config::DaemonConfig;
use crate::error::{Result, ShareTtyError};
use crate::names;
use crate::registry::Registry;
use crate::session::{Method, Policy, Session, SessionInfo, SessionKey, Status};

/// Maximum single control message, well above any real request/reply.
const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlRequest {
    Ps {
        all: bool,
    },
    Exec {
        name: String,
        addr: String,
        command: Vec<String>,
        policy: Policy,
    },
    Attach {
        /// Target session to attach to.
        name: String,
        addr: String,
        /// The attaching connection's own key.
        sname: String,
        saddr: String,
        permit_write: bool,
    },
    Play {
        name: String,
        addr: String,
        rec_id: String,
        policy: Policy,
    },
    Close {
        name: String,
        addr: String,
        all: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlReply {
    Sessions(Vec<SessionInfo>),
    Session(SessionInfo),
    Ok,
    Error { message: String, exit_code: i32 },
}

async fn read_message(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(ShareTtyError::Protocol(format!(
            "control message of {len} bytes exceeds cap {MAX_MESSAGE_BYTES}"
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

async fn write_message(stream: &mut UnixStream, body: &[u8]) -> Result<()> {
    stream.write_all(&(body.len() as u32).to_le_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}

/// Client side: send one request, read back one reply, then disconnect.
pub async fn call(socket_path: &Path, request: &ControlRequest) -> Result<ControlReply> {
    let mut stream = UnixStream::connect(socket_path).await?;
    let body = serde_json::to_vec(request)
        .map_err(|e| ShareTtyError::Protocol(format!("encoding control request: {e}")))?;
    write_message(&mut stream, &body).await?;
    let reply_bytes = read_message(&mut stream).await?;
    serde_json::from_slice(&reply_bytes)
        .map_err(|e| ShareTtyError::Protocol(format!("decoding control reply: {e}")))
}

/// Server side: bind the socket (removing any stale one) and run the accept
/// loop until `shutdown` fires.
pub async fn serve(
    config: Arc<DaemonConfig>,
    registry: Arc<Registry>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let socket_path = config.control_socket.clone();

    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
    }

    log::info!("control socket listening on {}", socket_path.display());

    let mut backoff = std::time::Duration::from_millis(5);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        backoff = std::time::Duration::from_millis(5);
                        let config = config.clone();
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, config, registry).await {
                                log::debug!("control connection error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("control socket accept error: {e}");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(std::time::Duration::from_secs(1));
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

async fn handle_connection(
    mut stream: UnixStream,
    config: Arc<DaemonConfig>,
    registry: Arc<Registry>,
) -> Result<()> {
    let body = read_message(&mut stream).await?;
    let request: ControlRequest = serde_json::from_slice(&body)
        .map_err(|e| ShareTtyError::Protocol(format!("decoding control request: {e}")))?;

    let reply = match dispatch(request, &config, &registry).await {
        Ok(reply) => reply,
        Err(e) => ControlReply::Error {
            message: e.to_string(),
            exit_code: e.exit_code(),
        },
    };

    let reply_bytes = serde_json::to_vec(&reply)
        .map_err(|e| ShareTtyError::Protocol(format!("encoding control reply: {e}")))?;
    write_message(&mut stream, &reply_bytes).await
}

async fn dispatch(
    request: ControlRequest,
    config: &DaemonConfig,
    registry: &Arc<Registry>,
) -> Result<ControlReply> {
    match request {
        ControlRequest::Ps { all } => Ok(ControlReply::Sessions(registry.list(all))),

        ControlRequest::Exec { name, addr, command, policy } => {
            if command.is_empty() {
                return Err(ShareTtyError::Protocol("exec requires a command".to_string()));
            }
            let addr = if addr.is_empty() { "0.0.0.0/0".to_string() } else { addr };
            let key = allocate_key(registry, name, addr.clone())?;
            let session = Session::new(
                key,
                None,
                Method::Exec,
                policy.clone(),
                command.clone(),
                NetFilter::parse(&addr),
            );
            if policy.record {
                let term = std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string());
                let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
                let rec = crate::recorder::Recorder::create(&config.rec_dir, &term, &shell, &command.join(" "))?;
                session.set_rec_id(rec.rec_id().to_string());
                session.set_pending_recorder(rec);
            }
            let session = Arc::new(session);
            registry.insert(session.clone());
            Ok(ControlReply::Session(session.to_info()))
        }

        ControlRequest::Play { name, addr, rec_id, policy } => {
            let rec_path = rec_path_for(config, &rec_id)?;
            let addr = if addr.is_empty() { "0.0.0.0/0".to_string() } else { addr };
            let key = allocate_key(registry, name, addr.clone())?;
            let mut session = Session::new(
                key,
                None,
                Method::Play,
                policy,
                vec![rec_path.display().to_string()],
                NetFilter::parse(&addr),
            );
            session.set_rec_id(rec_id);
            let session = Arc::new(session);
            registry.insert(session.clone());
            Ok(ControlReply::Session(session.to_info()))
        }

        ControlRequest::Attach { name, addr, sname, saddr, permit_write } => {
            let parent = registry
                .find(&name, &addr)
                .ok_or_else(|| ShareTtyError::missing_session(&name, &addr))?;
            if parent.status() != Status::Connected {
                return Err(ShareTtyError::Policy(format!(
                    "session {} is not connected",
                    parent.key
                )));
            }
            let saddr = if saddr.is_empty() { "0.0.0.0/0".to_string() } else { saddr };
            let key = allocate_key(registry, sname, saddr.clone())?;
            let mut policy = Policy {
                permit_write,
                ..Policy::default()
            };
            policy.record = false;
            let child = Arc::new(Session::new(
                key,
                Some(parent.key.clone()),
                Method::Attach,
                policy,
                parent.command.clone(),
                NetFilter::parse(&saddr),
            ));
            parent.link_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            registry.insert(child.clone());
            Ok(ControlReply::Session(child.to_info()))
        }

        ControlRequest::Close { name, addr, all } => {
            if name.is_empty() && all {
                for info in registry.list(true) {
                    if info.parent_key.is_none() {
                        close_session(registry, &info.key).await;
                    }
                }
                return Ok(ControlReply::Ok);
            }
            let session = registry
                .find(&name, &addr)
                .ok_or_else(|| ShareTtyError::missing_session(&name, &addr))?;
            if all {
                close_session(registry, &session.key).await;
            } else if let Some(ctx) = session.context_handle() {
                ctx.close_one(&session.key).await;
            } else {
                session.set_status(Status::Closed);
                registry.remove(&session.key);
            }
            Ok(ControlReply::Ok)
        }
    }
}

async fn close_session(registry: &Arc<Registry>, key: &SessionKey) {
    if let Some(session) = registry.get(key) {
        if let Some(ctx) = session.context_handle() {
            ctx.close_all().await;
        } else {
            session.set_status(Status::Closed);
            registry.remove(key);
        }
    }
}

/// Resolve a key for a new session: use `name` verbatim if given (must be
/// free), otherwise retry up to 10 generated candidates (§4.F "Name
/// generation").
fn allocate_key(registry: &Arc<Registry>, name: String, addr: String) -> Result<SessionKey> {
    if !name.is_empty() {
        let key = SessionKey::new(name, addr);
        if registry.get(&key).is_some() {
            return Err(ShareTtyError::Protocol(format!("session {key} already exists")));
        }
        return Ok(key);
    }
    for attempt in 0..10 {
        let candidate = SessionKey::new(names::candidate(attempt), addr.clone());
        if registry.get(&candidate).is_none() {
            return Ok(candidate);
        }
    }
    Err(ShareTtyError::Protocol(
        "failed to allocate a unique session name after 10 attempts".to_string(),
    ))
}

fn rec_path_for(config: &DaemonConfig, rec_id: &str) -> Result<PathBuf> {
    let path = config.rec_dir.join(rec_id);
    if !path.exists() {
        return Err(ShareTtyError::missing_recording(&path));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<DaemonConfig> {
        Arc::new(DaemonConfig::default())
    }

    #[tokio::test]
    async fn test_exec_allocates_waiting_session() {
        let registry = Registry::new();
        let config = test_config();
        let reply = dispatch(
            ControlRequest::Exec {
                name: String::new(),
                addr: String::new(),
                command: vec!["/bin/true".to_string()],
                policy: Policy::default(),
            },
            &config,
            &registry,
        )
        .await
        .unwrap();
        match reply {
            ControlReply::Session(info) => assert_eq!(info.status, Status::Waiting),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_exec_rejects_empty_command() {
        let registry = Registry::new();
        let config = test_config();
        let result = dispatch(
            ControlRequest::Exec {
                name: String::new(),
                addr: String::new(),
                command: vec![],
                policy: Policy::default(),
            },
            &config,
            &registry,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_exec_rejects_duplicate_explicit_name() {
        let registry = Registry::new();
        let config = test_config();
        let req = || ControlRequest::Exec {
            name: "fixed".to_string(),
            addr: "0.0.0.0/0".to_string(),
            command: vec!["/bin/true".to_string()],
            policy: Policy::default(),
        };
        dispatch(req(), &config, &registry).await.unwrap();
        assert!(dispatch(req(), &config, &registry).await.is_err());
    }

    #[tokio::test]
    async fn test_play_rejects_missing_recording() {
        let registry = Registry::new();
        let config = test_config();
        let result = dispatch(
            ControlRequest::Play {
                name: String::new(),
                addr: String::new(),
                rec_id: "does-not-exist".to_string(),
                policy: Policy::default(),
            },
            &config,
            &registry,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_attach_requires_existing_target() {
        let registry = Registry::new();
        let config = test_config();
        let result = dispatch(
            ControlRequest::Attach {
                name: "missing".to_string(),
                addr: "0.0.0.0/0".to_string(),
                sname: String::new(),
                saddr: String::new(),
                permit_write: false,
            },
            &config,
            &registry,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_attach_rejects_unconnected_parent() {
        let registry = Registry::new();
        let config = test_config();
        let parent = dispatch(
            ControlRequest::Exec {
                name: "waiting-parent".to_string(),
                addr: "0.0.0.0/0".to_string(),
                command: vec!["/bin/true".to_string()],
                policy: Policy::default(),
            },
            &config,
            &registry,
        )
        .await
        .unwrap();
        match parent {
            ControlReply::Session(info) => assert_eq!(info.status, Status::Waiting),
            other => panic!("unexpected reply: {other:?}"),
        }

        let result = dispatch(
            ControlRequest::Attach {
                name: "waiting-parent".to_string(),
                addr: "0.0.0.0/0".to_string(),
                sname: String::new(),
                saddr: String::new(),
                permit_write: false,
            },
            &config,
            &registry,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_waiting_session_removes_it() {
        let registry = Registry::new();
        let config = test_config();
        dispatch(
            ControlRequest::Exec {
                name: "closeme".to_string(),
                addr: "0.0.0.0/0".to_string(),
                command: vec!["/bin/true".to_string()],
                policy: Policy::default(),
            },
            &config,
            &registry,
        )
        .await
        .unwrap();
        assert_eq!(registry.len(), 1);
        dispatch(
            ControlRequest::Close {
                name: "closeme".to_string(),
                addr: "0.0.0.0/0".to_string(),
                all: false,
            },
            &config,
            &registry,
        )
        .await
        .unwrap();
        assert_eq!(registry.len(), 0);
    }
}
