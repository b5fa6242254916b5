//! Player (component A, read side).
//!
//! Decodes a recording back into a timed sequence of events, standing in
//! for a live PTY source (§4.A, §9 "synthetic child-process handle").

use std::path::Path;
use std::time::Instant;

use tokio::time::Duration;

use crate::error::Result;
use crate::frame::{self, ResizeArgs};
use crate::recorder::{self, RecordEvent};

/// One decoded event a Play session's output pump reacts to.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// Raw PTY bytes (already stripped of the recorder opcode byte).
    Output(Vec<u8>),
    /// A resize recorded mid-session; propagated to newly joining clients.
    Resize { rows: u16, cols: u16 },
}

/// Replays a recording, pacing `Output` events against wall-clock time.
pub struct Player {
    records: Vec<RecordEvent>,
    idx: usize,
    speed: f64,
    repeat: bool,
    max_wait_ns: i64,
    file_start_ns: Option<i64>,
    wall_start: Option<Instant>,
    idle_offset_ns: i64,
    window: (u16, u16),
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("idx", &self.idx)
            .field("len", &self.records.len())
            .field("repeat", &self.repeat)
            .finish()
    }
}

impl Player {
    /// Open `path` for replay at the given `speed` multiplier, optionally
    /// looping forever, with `max_wait_secs` capping any single inter-frame
    /// gap (0 disables the cap).
    pub fn open(path: &Path, speed: f64, repeat: bool, max_wait_secs: u64) -> Result<Self> {
        let records = recorder::read_records(path)?;
        Ok(Self {
            records,
            idx: 0,
            speed: if speed > 0.0 { speed } else { 1.0 },
            repeat,
            max_wait_ns: max_wait_secs as i64 * 1_000_000_000,
            file_start_ns: None,
            wall_start: None,
            idle_offset_ns: 0,
            window: (0, 0),
        })
    }

    /// Current known terminal size, updated by any `ResizeTerminal` record
    /// seen so far.
    pub fn window(&self) -> (u16, u16) {
        self.window
    }

    /// Produce the next event, sleeping as needed to reproduce the
    /// recording's original pacing. Returns `Ok(None)` at end of stream
    /// (only when `repeat` is false).
    pub async fn next_event(&mut self) -> Result<Option<PlayerEvent>> {
        loop {
            if self.idx >= self.records.len() {
                if self.repeat && self.file_start_ns.is_some() {
                    log::debug!("player reached EOF, repeat=true, rewinding");
                    self.idx = 0;
                    self.file_start_ns = None;
                    self.wall_start = None;
                    self.idle_offset_ns = 0;
                    continue;
                }
                return Ok(None);
            }

            let record = self.records[self.idx].clone();
            self.idx += 1;
            if record.data.is_empty() {
                continue;
            }

            match record.data[0] {
                frame::CLIENT_RESIZE_TERMINAL => {
                    match serde_json::from_slice::<ResizeArgs>(&record.data[1..]) {
                        Ok(args) => self.window = (args.rows as u16, args.columns as u16),
                        Err(e) => log::warn!("malformed ResizeTerminal in recording: {e}"),
                    }
                    return Ok(Some(PlayerEvent::Resize {
                        rows: self.window.0,
                        cols: self.window.1,
                    }));
                }
                frame::SERVER_OUTPUT => {
                    if self.file_start_ns.is_none() {
                        self.file_start_ns = Some(record.time_ns);
                        self.wall_start = Some(Instant::now());
                    }
                    self.sleep_for(record.time_ns).await;
                    return Ok(Some(PlayerEvent::Output(record.data[1..].to_vec())));
                }
                frame::REC_SYS_ENV => continue,
                other => {
                    log::warn!("unknown record opcode {other} during playback, skipping");
                    continue;
                }
            }
        }
    }

    async fn sleep_for(&mut self, record_time_ns: i64) {
        let file_start = self.file_start_ns.expect("anchored before first Output");
        let wall_start = self.wall_start.expect("anchored before first Output");

        let target_ns = (record_time_ns - file_start) as f64 / self.speed;
        let elapsed_ns = wall_start.elapsed().as_nanos() as f64;
        let delta = target_ns - elapsed_ns - self.idle_offset_ns as f64;

        if self.max_wait_ns > 0 && delta > self.max_wait_ns as f64 {
            self.idle_offset_ns += (delta - self.max_wait_ns as f64) as i64;
            tokio::time::sleep(Duration::from_nanos(self.max_wait_ns as u64)).await;
        } else if delta > 0.0 {
            tokio::time::sleep(Duration::from_nanos(delta as u64)).await;
        }
    }
}
