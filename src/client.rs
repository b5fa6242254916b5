//! Interactive terminal client used by the `exec`/`attach`/`play` CLI verbs.
//!
//! Puts the calling terminal into raw mode, then bridges stdin/stdout over
//! an already-established websocket connection to a daemon's front door
//! using the wire opcodes in [`crate::frame`]. There is no TUI here — the
//! daemon already owns terminal emulation via the PTY; this is a thin pipe.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::mpsc;

use crate::frame;
use crate::ws::{WsMessage, WsReader, WsWriter};

/// RAII guard restoring the terminal's original termios on drop.
///
/// Grounded on the same raw-mode-toggle-then-restore shape this crate's
/// teacher uses around its own terminal setup, expressed with `libc`
/// termios calls directly since this binary carries no TUI crate.
pub struct RawModeGuard {
    original: libc::termios,
}

impl RawModeGuard {
    /// Put stdin into raw (cbreak, no-echo) mode.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` if the underlying `tcgetattr`/`tcsetattr`
    /// calls fail (e.g. stdin is not a TTY).
    pub fn enable() -> std::io::Result<Self> {
        unsafe {
            let mut original: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut original) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let mut raw = original;
            libc::cfmakeraw(&mut raw);
            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(Self { original })
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
        }
    }
}

/// Current terminal size in (rows, cols), defaulting to 24x80 if it cannot
/// be determined (e.g. stdin is not a TTY).
pub fn terminal_size() -> (u16, u16) {
    unsafe {
        let mut ws: libc::winsize = std::mem::zeroed();
        if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) == 0 && ws.ws_row > 0 {
            (ws.ws_row, ws.ws_col)
        } else {
            (24, 80)
        }
    }
}

/// Drive one interactive session to completion: forward stdin as `Input`
/// frames, render `Output` frames to stdout, and log (without surfacing to
/// the remote terminal) title/preference/reconnect frames.
///
/// Returns once the websocket closes, in either direction.
pub async fn run_interactive(mut writer: WsWriter, mut reader: WsReader) -> anyhow::Result<()> {
    let (rows, cols) = terminal_size();
    let resize = crate::frame::ResizeArgs {
        columns: f64::from(cols),
        rows: f64::from(rows),
    };
    if let Ok(payload) = serde_json::to_vec(&resize) {
        let _ = writer
            .send_binary(frame::build(frame::CLIENT_RESIZE_TERMINAL, &payload))
            .await;
    }

    let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    // Blocking stdin reads happen on a dedicated OS thread, same bridge
    // pattern the daemon core uses for the blocking PTY master (see
    // `multiplexer::ExecPty::spawn`).
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdin_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    loop {
        tokio::select! {
            input = stdin_rx.recv() => {
                match input {
                    Some(bytes) => {
                        let frame = frame::build(frame::CLIENT_INPUT, &bytes);
                        if writer.send_binary(frame).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                }
            }
            message = reader.recv() => {
                match message {
                    Some(Ok(WsMessage::Binary(data))) => {
                        if !handle_server_frame(&data)? {
                            return Ok(());
                        }
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        if !handle_server_frame(text.as_bytes())? {
                            return Ok(());
                        }
                    }
                    Some(Ok(WsMessage::Close { .. })) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e),
                }
            }
        }
    }
}

/// Interpret one daemon→client frame. Returns `false` if the caller should
/// stop the session.
fn handle_server_frame(data: &[u8]) -> anyhow::Result<bool> {
    if data.is_empty() {
        return Ok(true);
    }
    match data[0] {
        frame::SERVER_OUTPUT => {
            let decoded = BASE64
                .decode(&data[1..])
                .map_err(|e| anyhow::anyhow!("malformed base64 Output frame: {e}"))?;
            std::io::stdout().write_all(&decoded)?;
            std::io::stdout().flush()?;
        }
        frame::SERVER_PONG => {}
        frame::SERVER_SET_WINDOW_TITLE => {
            log::debug!("server set title: {}", String::from_utf8_lossy(&data[1..]));
        }
        frame::SERVER_SET_PREFERENCES => {
            log::debug!("server set preferences: {}", String::from_utf8_lossy(&data[1..]));
        }
        frame::SERVER_SET_RECONNECT => {
            log::debug!("server set reconnect: {}", String::from_utf8_lossy(&data[1..]));
        }
        frame::SERVER_RESIZE_TERMINAL => {
            log::debug!("server resize: {}", String::from_utf8_lossy(&data[1..]));
        }
        other => {
            log::warn!("unknown server opcode {other}");
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_server_frame_decodes_valid_output() {
        let frame = frame::build(frame::SERVER_OUTPUT, b"aGVsbG8=");
        assert!(handle_server_frame(&frame).unwrap());
    }

    #[test]
    fn test_handle_server_frame_rejects_malformed_base64() {
        let frame = frame::build(frame::SERVER_OUTPUT, b"not base64!!");
        assert!(handle_server_frame(&frame).is_err());
    }

    #[test]
    fn test_handle_server_frame_ignores_empty_payload() {
        assert!(handle_server_frame(&[]).unwrap());
    }

    #[test]
    fn test_handle_server_frame_logs_unknown_opcode_without_error() {
        let frame = frame::build(b'z', b"whatever");
        assert!(handle_server_frame(&frame).unwrap());
    }

    #[test]
    fn test_terminal_size_falls_back_when_not_a_tty() {
        // In test harnesses stdout is usually not a TTY; either branch
        // must return a sane nonzero size.
        let (rows, cols) = terminal_size();
        assert!(rows > 0 && cols > 0);
    }
}
