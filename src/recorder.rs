//! Recorder (component A, write side).
//!
//! Append-only encoder writing a stream of `(timestamp, bytes)` records to a
//! temp file in the configured recording directory (§4.A). Each record is
//! `[u32 LE length][bincode-encoded RecordEvent]` — a Rust-native stand-in
//! for the original's `encoding/gob` stream, chosen because `bincode` is the
//! closest idiomatic analogue to a compact self-describing Rust struct
//! stream.
//!
//! Writes are not buffered across frames: one `write_all` per record, so a
//! crash loses at most the in-flight frame.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShareTtyError};
use crate::frame::{self, SysEnvArgs};

/// A single recorded event: a monotonic-nanosecond timestamp plus the
/// frame bytes (opcode + payload) as emitted on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEvent {
    pub time_ns: i64,
    pub data: Vec<u8>,
}

/// Nanoseconds since an arbitrary but fixed epoch, used as the recording's
/// time axis. Backed by `std::time::Instant`, which is monotonic on every
/// target this crate supports.
pub trait MonotonicClock: Send + Sync {
    fn now_ns(&self) -> i64;
}

/// Default clock: nanoseconds elapsed since process start.
#[derive(Debug, Clone, Copy)]
pub struct InstantClock {
    epoch: Instant,
}

impl Default for InstantClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl MonotonicClock for InstantClock {
    fn now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }
}

fn encode_record(event: &RecordEvent) -> Result<Vec<u8>> {
    let body = bincode::serialize(event)
        .map_err(|e| ShareTtyError::Io(std::io::Error::other(e.to_string())))?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_record(body: &[u8]) -> Result<RecordEvent> {
    bincode::deserialize(body).map_err(|e| ShareTtyError::Io(std::io::Error::other(e.to_string())))
}

/// Append-only recording sink, one per recorded session.
pub struct Recorder {
    path: PathBuf,
    file: Mutex<File>,
    clock: Box<dyn MonotonicClock>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Open a new temp file under `dir` and write the initial SysEnv record.
    pub fn create(dir: &Path, term: &str, shell: &str, command: &str) -> Result<Self> {
        Self::with_clock(dir, term, shell, command, Box::new(InstantClock::default()))
    }

    /// Same as [`Self::create`], substituting a caller-supplied clock —
    /// used by tests that need deterministic timestamps instead of
    /// `InstantClock`'s real elapsed time.
    #[cfg(test)]
    pub fn with_clock(
        dir: &Path,
        term: &str,
        shell: &str,
        command: &str,
        clock: Box<dyn MonotonicClock>,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = tempfile_in(dir)?;
        let path = file.1;
        let recorder = Self {
            path,
            file: Mutex::new(file.0),
            clock,
        };
        let sys_env = SysEnvArgs {
            term: term.to_string(),
            shell: shell.to_string(),
            command: command.to_string(),
        };
        let payload = serde_json::to_vec(&sys_env)
            .map_err(|e| ShareTtyError::Io(std::io::Error::other(e.to_string())))?;
        recorder.write_frame(frame::REC_SYS_ENV, &payload)?;
        Ok(recorder)
    }

    /// Append one frame (opcode + payload) as a timestamped record.
    pub fn write_frame(&self, opcode: u8, payload: &[u8]) -> Result<()> {
        let data = frame::build(opcode, payload);
        let event = RecordEvent {
            time_ns: self.clock.now_ns(),
            data,
        };
        let encoded = encode_record(&event)?;
        let mut file = self.file.lock().expect("recorder lock poisoned");
        file.write_all(&encoded)?;
        Ok(())
    }

    /// Basename of the recording file — the public RecId.
    pub fn rec_id(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Full path of the recording file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close, keeping the file on disk as a replay artifact.
    pub fn close(&self) -> Result<()> {
        let mut file = self.file.lock().expect("recorder lock poisoned");
        file.flush()?;
        Ok(())
    }

    /// Delete the file without closing cleanly — used by the reaper when a
    /// Waiting session is closed before ever producing a frame.
    pub fn discard(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::debug!("discard recording {}: {e}", self.path.display());
        }
    }
}

fn tempfile_in(dir: &Path) -> Result<(File, PathBuf)> {
    use rand::Rng;
    let mut rng = rand::rng();
    for _ in 0..10 {
        let suffix: u64 = rng.random();
        let path = dir.join(format!("sharetty-rec-{suffix:016x}"));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(ShareTtyError::Io(e)),
        }
    }
    Err(ShareTtyError::Io(std::io::Error::other(
        "failed to allocate a unique recording file name",
    )))
}

/// Read the raw length-prefixed record stream back out, for the Player and
/// Convert utility.
pub fn read_records(path: &Path) -> Result<Vec<RecordEvent>> {
    let bytes = std::fs::read(path)?;
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + len > bytes.len() {
            break;
        }
        out.push(decode_record(&bytes[pos..pos + len])?);
        pos += len;
    }
    Ok(out)
}
