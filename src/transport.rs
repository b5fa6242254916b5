//! Client transport (component E).
//!
//! One browser connection: a framed read loop forwarding into the
//! multiplexer's inbound channel, plus a write half serialized behind a
//! lock so fan-out writes from the output pump never interleave.
//!
//! Frames are carried as WebSocket binary messages rather than text —
//! `Input` payloads are arbitrary PTY bytes that need not be valid UTF-8,
//! and `tokio-tungstenite`'s `Message::Text` requires that. Binary framing
//! keeps one frame per message, which is the property §4.E actually needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Result, ShareTtyError};
use crate::session::SessionKey;

/// Maximum single-frame size accepted from a client (§4.E).
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

pub(crate) type ServerWs = WebSocketStream<TcpStream>;
type WriteHalf = futures_util::stream::SplitSink<ServerWs, Message>;
type ReadHalf = futures_util::stream::SplitStream<ServerWs>;

/// One event handed from a transport's read loop to the owning session's
/// input pump — the single consumer of this channel (§9).
#[derive(Debug)]
pub enum InboundEvent {
    Frame { key: SessionKey, data: Vec<u8> },
    Closed { key: SessionKey },
}

/// A single browser connection attached to a session.
pub struct ClientTransport {
    key: SessionKey,
    writer: Mutex<WriteHalf>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTransport")
            .field("key", &self.key)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ClientTransport {
    /// Split `stream` and spawn its read loop, forwarding frames onto
    /// `inbound_tx` tagged with `key`. Returns the writable half.
    pub fn spawn(
        key: SessionKey,
        stream: ServerWs,
        inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    ) -> Arc<Self> {
        let (writer, reader) = stream.split();
        let transport = Arc::new(Self {
            key: key.clone(),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(read_loop(key, reader, inbound_tx));
        transport
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Write a single framed message atomically.
    ///
    /// # Errors
    ///
    /// Returns `IOError` if the underlying connection write fails.
    pub async fn send_frame(&self, data: Vec<u8>) -> Result<()> {
        if data.len() > MAX_FRAME_BYTES {
            return Err(ShareTtyError::Protocol(format!(
                "outbound frame of {} bytes exceeds cap {MAX_FRAME_BYTES}",
                data.len()
            )));
        }
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Binary(data.into()))
            .await
            .map_err(|e| ShareTtyError::Io(std::io::Error::other(e.to_string())))
    }

    /// Idempotent close: best-effort close frame, then drop the sink.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

async fn read_loop(
    key: SessionKey,
    mut reader: ReadHalf,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
) {
    loop {
        match reader.next().await {
            Some(Ok(Message::Binary(data))) => {
                if data.len() > MAX_FRAME_BYTES {
                    log::debug!("transport {key}: oversize frame ({} bytes), closing", data.len());
                    break;
                }
                if inbound_tx
                    .send(InboundEvent::Frame {
                        key: key.clone(),
                        data: data.into(),
                    })
                    .is_err()
                {
                    break;
                }
            }
            Some(Ok(Message::Text(text))) => {
                if inbound_tx
                    .send(InboundEvent::Frame {
                        key: key.clone(),
                        data: text.as_bytes().to_vec(),
                    })
                    .is_err()
                {
                    break;
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                log::debug!("transport {key}: connection closed");
                break;
            }
            Some(Err(e)) => {
                log::debug!("transport {key}: read error: {e}");
                break;
            }
        }
    }
    let _ = inbound_tx.send(InboundEvent::Closed { key });
}
