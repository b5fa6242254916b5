//! Front door (component H): the WebSocket upgrade handshake and the
//! promote/clone/attach dispatch that seats a new transport against a
//! session (§4.H, §4.F's state-machine table).

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::{Method, StatusCode};
use tokio_tungstenite::tungstenite::Message;

use crate::config::DaemonConfig;
use crate::error::{Result, ShareTtyError};
use crate::multiplexer;
use crate::names;
use crate::registry::Registry;
use crate::session::{Method as SessionMethod, Policy, Session, SessionKey, Status};
use crate::transport::ClientTransport;
use crate::frame;

#[derive(Debug, Deserialize)]
struct InitFrame {
    #[serde(rename = "Arguments")]
    arguments: String,
    #[serde(rename = "AuthToken")]
    auth_token: String,
}

/// Listen on `config.addr` and serve upgrade requests until `shutdown` fires.
pub async fn serve(
    config: Arc<DaemonConfig>,
    registry: Arc<Registry>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(&config.addr).await?;
    log::info!("front door listening on {}", config.addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let config = config.clone();
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_upgrade(stream, peer_addr, config, registry).await {
                                log::debug!("front door connection from {peer_addr}: {e}");
                            }
                        });
                    }
                    Err(e) => log::warn!("front door accept error: {e}"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn handle_upgrade(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<DaemonConfig>,
    registry: Arc<Registry>,
) -> Result<()> {
    let callback = |req: &Request, mut response: Response| -> std::result::Result<Response, ErrorResponse> {
        if req.method() != Method::GET {
            let mut error = ErrorResponse::new(Some("GET required".to_string()));
            *error.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
            return Err(error);
        }
        response.headers_mut().insert(
            tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL,
            tokio_tungstenite::tungstenite::http::HeaderValue::from_static("gotty"),
        );
        Ok(response)
    };

    let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| ShareTtyError::Protocol(format!("upgrade handshake failed: {e}")))?;

    let init = match ws.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<InitFrame>(&text)
            .map_err(|e| ShareTtyError::Auth(format!("malformed init frame: {e}")))?,
        Some(Ok(Message::Binary(bytes))) => serde_json::from_slice::<InitFrame>(&bytes)
            .map_err(|e| ShareTtyError::Auth(format!("malformed init frame: {e}")))?,
        _ => return Err(ShareTtyError::Auth("connection closed before init frame".to_string())),
    };

    if !config.credential.is_empty() && !constant_time_eq(init.auth_token.as_bytes(), config.credential.as_bytes()) {
        return Err(ShareTtyError::Auth("credential mismatch".to_string()));
    }

    let (name, addr, args) = parse_arguments(&init.arguments, peer_addr.ip().to_string());

    let key = SessionKey::new(name, addr);
    let session = registry
        .get(&key)
        .ok_or_else(|| ShareTtyError::missing_session(&key.name, &key.addr))?;

    if !session.nets.allows(peer_addr.ip()) {
        return Err(ShareTtyError::address_rejected(&peer_addr.ip().to_string()));
    }

    seat_connection(&session, ws, peer_addr, &config, &registry, args).await
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Parse `Arguments` as a URL query string: `name`, `addr`, repeated `arg`.
fn parse_arguments(raw: &str, remote_ip: String) -> (String, String, Vec<String>) {
    let mut name = String::new();
    let mut addr = String::new();
    let mut args = Vec::new();
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        match key.as_ref() {
            "name" => name = value.into_owned(),
            "addr" => addr = value.into_owned(),
            "arg" => args.push(value.into_owned()),
            _ => {}
        }
    }
    if addr.is_empty() {
        addr = remote_ip;
    }
    (name, addr, args)
}

async fn seat_connection(
    session: &Arc<Session>,
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    peer_addr: SocketAddr,
    config: &Arc<DaemonConfig>,
    registry: &Arc<Registry>,
    extra_args: Vec<String>,
) -> Result<()> {
    let remote = peer_addr.ip().to_string();

    match session.status() {
        Status::Waiting => match session.method {
            SessionMethod::Exec => {
                let mut argv = session.command.clone();
                argv.extend(extra_args);
                let ctx = multiplexer::promote_exec(
                    session,
                    &argv,
                    &config.rec_dir,
                    registry.clone(),
                    config.close_signal,
                )
                .await?;
                session.mark_connected(Some(remote));
                attach_transport(session, &ctx, ws, session.policy.permit_write, config).await
            }
            SessionMethod::Play => {
                let rec_path = config.rec_dir.join(
                    session
                        .rec_id()
                        .ok_or_else(|| ShareTtyError::Lookup("play session missing a RecId".to_string()))?,
                );
                if !rec_path.exists() {
                    return Err(ShareTtyError::missing_recording(&rec_path));
                }
                let ctx = multiplexer::promote_play(session, &rec_path, registry.clone()).await?;
                session.mark_connected(Some(remote));
                attach_transport(session, &ctx, ws, false, config).await
            }
            SessionMethod::Attach => {
                let parent_key = session
                    .parent
                    .clone()
                    .ok_or_else(|| ShareTtyError::Lookup("attach session has no parent".to_string()))?;
                let parent = registry
                    .get(&parent_key)
                    .ok_or_else(|| ShareTtyError::missing_session(&parent_key.name, &parent_key.addr))?;
                if parent.status() != Status::Connected {
                    return Err(ShareTtyError::Policy(format!(
                        "parent session {parent_key} is not connected"
                    )));
                }
                let parent_ctx = parent
                    .context_handle()
                    .ok_or_else(|| ShareTtyError::Lookup("connected parent has no context".to_string()))?;
                multiplexer::clone_into_parent(session, parent_ctx.clone());
                session.mark_connected(Some(remote));
                attach_transport(session, &parent_ctx, ws, session.policy.permit_write, config).await
            }
            SessionMethod::Share => {
                Err(ShareTtyError::Protocol("share sessions are never Waiting".to_string()))
            }
        },
        Status::Connected => {
            if session.method == SessionMethod::Share {
                return Err(ShareTtyError::Protocol(format!(
                    "session {} already connected",
                    session.key
                )));
            }
            if !session.policy.permit_share {
                return Err(ShareTtyError::Policy(format!(
                    "session {} does not permit sharing",
                    session.key
                )));
            }
            let ctx = session
                .context_handle()
                .ok_or_else(|| ShareTtyError::Lookup("connected session has no context".to_string()))?;
            let child_key = allocate_share_key(registry, &session.key.addr)?;
            let permit_write =
                session.policy.permit_write && session.policy.permit_share && session.policy.permit_share_write;
            let policy = Policy {
                permit_write,
                record: false,
                ..session.policy.clone()
            };
            let child = Arc::new(Session::new(
                child_key,
                Some(session.key.clone()),
                SessionMethod::Share,
                policy,
                session.command.clone(),
                crate::cidr::NetFilter::parse(&session.key.addr),
            ));
            session.link_count.fetch_add(1, Ordering::SeqCst);
            registry.insert(child.clone());
            multiplexer::clone_into_parent(&child, ctx.clone());
            child.mark_connected(Some(remote));
            attach_transport(&child, &ctx, ws, permit_write, config).await
        }
        Status::Closed => Err(ShareTtyError::Lookup(format!("session {} is closed", session.key))),
    }
}

fn allocate_share_key(registry: &Arc<Registry>, addr: &str) -> Result<SessionKey> {
    for attempt in 0..10 {
        let candidate = SessionKey::new(names::candidate(attempt), addr.to_string());
        if registry.get(&candidate).is_none() {
            return Ok(candidate);
        }
    }
    Err(ShareTtyError::Protocol(
        "failed to allocate a unique share session name after 10 attempts".to_string(),
    ))
}

/// Register `ws` as `session`'s transport against `ctx`, then send the
/// initial SetWindowTitle/SetPreferences sequence (§6).
async fn attach_transport(
    session: &Arc<Session>,
    ctx: &Arc<multiplexer::SharedContext>,
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    permit_write: bool,
    config: &Arc<DaemonConfig>,
) -> Result<()> {
    let transport: Arc<ClientTransport> = ClientTransport::spawn(session.key.clone(), ws, ctx.inbound_sender());
    ctx.register_connection(session.key.clone(), transport.clone(), permit_write);

    let title = render_title(&config.title_format, &session.command);
    transport
        .send_frame(frame::build(frame::SERVER_SET_WINDOW_TITLE, title.as_bytes()))
        .await?;
    transport
        .send_frame(frame::build(frame::SERVER_SET_PREFERENCES, b"{}"))
        .await?;
    let (rows, cols) = ctx.dimensions();
    if rows > 0 && cols > 0 {
        let args = frame::ResizeArgs {
            columns: f64::from(cols),
            rows: f64::from(rows),
        };
        if let Ok(payload) = serde_json::to_vec(&args) {
            transport
                .send_frame(frame::build(frame::SERVER_RESIZE_TERMINAL, &payload))
                .await?;
        }
    }
    if config.reconnect_seconds > 0 {
        transport
            .send_frame(frame::build(
                frame::SERVER_SET_RECONNECT,
                config.reconnect_seconds.to_string().as_bytes(),
            ))
            .await?;
    }
    Ok(())
}

/// Minimal Go-template-style renderer for the two tokens the title format
/// actually supports: `{{ .Command }}` and `{{ .Hostname }}`.
fn render_title(format: &str, command: &[String]) -> String {
    let hostname = hostname();
    format
        .replace("{{ .Command }}", &command.join(" "))
        .replace("{{ .Hostname }}", &hostname)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
        assert!(!constant_time_eq(b"secret", b"wrongg"));
    }

    #[test]
    fn test_parse_arguments_defaults_addr_to_remote_ip() {
        let (name, addr, args) = parse_arguments("name=demo&arg=-x&arg=1", "203.0.113.9".to_string());
        assert_eq!(name, "demo");
        assert_eq!(addr, "203.0.113.9");
        assert_eq!(args, vec!["-x", "1"]);
    }

    #[test]
    fn test_parse_arguments_explicit_addr_overrides_remote_ip() {
        let (_, addr, _) = parse_arguments("addr=10.0.0.0%2F8", "203.0.113.9".to_string());
        assert_eq!(addr, "10.0.0.0/8");
    }

    #[test]
    fn test_render_title_substitutes_known_tokens() {
        let title = render_title("{{ .Command }}@{{ .Hostname }}", &["/bin/sh".to_string()]);
        assert!(title.starts_with("/bin/sh@"));
    }
}
