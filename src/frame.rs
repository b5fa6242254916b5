//! Wire frame opcodes and small payload structs (§6).
//!
//! A frame is a byte buffer whose first byte is a single-character opcode;
//! the remainder is opcode-specific. The same opcode space is reused, with
//! a different meaning per direction, by the on-disk recording format
//! (§4.A) — `Output` and `Input` share byte `'0'`, `Ping`/`Pong` share `'1'`,
//! and so on, exactly as the original daemon overlays its client and daemon
//! opcode enums. The original further overlays `SysEnv` onto the same byte
//! as `SetPreferences` (`'3'`), disambiguated only by record position (the
//! first record is always `SysEnv`); this crate gives `SysEnv` its own byte
//! (`REC_SYS_ENV`) instead, since nothing here forces position-based
//! decoding when an unused byte is available.

use serde::{Deserialize, Serialize};

/// Client → daemon: raw bytes to write to the PTY.
pub const CLIENT_INPUT: u8 = b'0';
/// Client → daemon: keepalive, empty payload.
pub const CLIENT_PING: u8 = b'1';
/// Client → daemon: `{"Columns":f64,"Rows":f64}`.
pub const CLIENT_RESIZE_TERMINAL: u8 = b'2';

/// Daemon → client: base64-encoded PTY bytes.
pub const SERVER_OUTPUT: u8 = b'0';
/// Daemon → client: keepalive reply, empty payload.
pub const SERVER_PONG: u8 = b'1';
/// Daemon → client: rendered title string.
pub const SERVER_SET_WINDOW_TITLE: u8 = b'2';
/// Daemon → client: JSON preference bag.
pub const SERVER_SET_PREFERENCES: u8 = b'3';
/// Daemon → client: JSON number, reconnect delay in seconds.
pub const SERVER_SET_RECONNECT: u8 = b'4';
/// Daemon → client: current PTY geometry, same `{Columns,Rows}` shape as
/// `CLIENT_RESIZE_TERMINAL`. Sent to a newly joining client so its terminal
/// emulator matches the session's actual size, and on every subsequent
/// resize so already-attached clients stay in sync.
pub const SERVER_RESIZE_TERMINAL: u8 = b'5';

/// Recorder-only opcode: the first record of every recording, carrying
/// `TERM`/`SHELL`/command for later replay and convert. Shares no byte
/// with the client/daemon opcode space because it never crosses the wire.
pub const REC_SYS_ENV: u8 = b'9';

/// Build a frame: opcode byte followed by `payload`.
#[must_use]
pub fn build(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(opcode);
    buf.extend_from_slice(payload);
    buf
}

/// `ResizeTerminal` payload, decoded from client JSON.
///
/// Columns/rows arrive as JSON numbers (floats in the original daemon)
/// and are truncated to `u16` for the ioctl call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResizeArgs {
    pub columns: f64,
    pub rows: f64,
}

/// Recorder-only SysEnv payload: the very first record of a recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SysEnvArgs {
    pub term: String,
    pub shell: String,
    pub command: String,
}
