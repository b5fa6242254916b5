//! Convert: one-shot recording → asciicast v1 JSON export (§4.A, §6).

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShareTtyError};
use crate::frame::{self, ResizeArgs, SysEnvArgs};
use crate::recorder;

/// An asciicast v1 output frame: `[delaySeconds, payload]`. `payload` is
/// base64-encoded, matching the original's plain `[]byte` struct field,
/// which Go's `encoding/json` marshals as base64 by default — terminal
/// output is not guaranteed to be valid UTF-8, so this is the only lossless
/// encoding available inside a JSON string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsciicastFrame(pub f64, pub String);

/// asciicast v1 environment block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AsciicastEnv {
    #[serde(rename = "TERM")]
    pub term: String,
    #[serde(rename = "SHELL")]
    pub shell: String,
}

/// asciicast v1 document (`github.com/asciinema/asciinema` schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asciicast {
    pub version: u32,
    pub width: u32,
    pub height: u32,
    pub duration: f64,
    pub command: String,
    pub title: String,
    pub env: AsciicastEnv,
    pub stdout: Vec<AsciicastFrame>,
}

/// Convert the recording at `src` into an asciicast v1 document, capping
/// any single inter-frame delay at `max_wait_secs` (0 disables the cap).
///
/// Fails with `EmptyInput` (surfaced as `LookupError`) if the recording has
/// no records at all.
pub fn convert(src: &Path, max_wait_secs: u64) -> Result<Asciicast> {
    let records = recorder::read_records(src)?;
    if records.is_empty() {
        return Err(ShareTtyError::Lookup(format!(
            "recording {} is empty",
            src.display()
        )));
    }

    let max_wait_ns = max_wait_secs as i64 * 1_000_000_000;
    let mut asciicast = Asciicast {
        version: 1,
        width: 0,
        height: 0,
        duration: 0.0,
        command: String::new(),
        title: String::new(),
        env: AsciicastEnv::default(),
        stdout: Vec::new(),
    };

    let mut last_time_ns = records[0].time_ns;
    let mut elapsed_ns: i64 = 0;
    let mut first_output_seen = false;

    for record in &records {
        if record.data.is_empty() {
            continue;
        }
        match record.data[0] {
            frame::CLIENT_RESIZE_TERMINAL => {
                // Only the last resize *before* the first Output sets the
                // header's dimensions (P2); later resizes are mid-session
                // and have no header field to land in.
                if first_output_seen {
                    continue;
                }
                if let Ok(args) = serde_json::from_slice::<ResizeArgs>(&record.data[1..]) {
                    asciicast.height = args.rows as u32;
                    asciicast.width = args.columns as u32;
                } else {
                    log::warn!("malformed ResizeTerminal in recording {}", src.display());
                }
            }
            frame::REC_SYS_ENV => {
                if let Ok(args) = serde_json::from_slice::<SysEnvArgs>(&record.data[1..]) {
                    asciicast.env.term = args.term;
                    asciicast.env.shell = args.shell;
                    asciicast.command = args.command;
                } else {
                    log::warn!("malformed SysEnv in recording {}", src.display());
                }
            }
            frame::SERVER_OUTPUT => {
                first_output_seen = true;
                let mut delta = record.time_ns - last_time_ns;
                if max_wait_ns > 0 && delta > max_wait_ns {
                    delta = max_wait_ns;
                }
                elapsed_ns += delta;
                last_time_ns = record.time_ns;

                let payload = BASE64.encode(&record.data[1..]);
                asciicast
                    .stdout
                    .push(AsciicastFrame(nanos_to_secs(delta), payload));
            }
            other => {
                log::warn!("unknown record opcode {other} in {}", src.display());
            }
        }
    }

    asciicast.duration = nanos_to_secs(elapsed_ns);
    Ok(asciicast)
}

fn nanos_to_secs(ns: i64) -> f64 {
    // Six decimal places of precision, matching the original's `%.6f`.
    ((ns as f64) / 1e9 * 1_000_000.0).round() / 1_000_000.0
}

/// Write `asciicast` as pretty-printed JSON to `dst`.
pub fn save(asciicast: &Asciicast, dst: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(asciicast)
        .map_err(|e| ShareTtyError::Io(std::io::Error::other(e.to_string())))?;
    std::fs::write(dst, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::Recorder;

    #[test]
    fn test_empty_recording_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, []).unwrap();
        assert!(convert(&path, 0).is_err());
    }

    #[test]
    fn test_convert_concatenates_output_and_sums_duration() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Recorder::create(dir.path(), "xterm", "/bin/sh", "/bin/sh -c hi").unwrap();
        rec.write_frame(frame::SERVER_OUTPUT, b"hi").unwrap();
        rec.write_frame(frame::SERVER_OUTPUT, b" there").unwrap();
        rec.close().unwrap();

        let cast = convert(rec.path(), 0).unwrap();
        assert_eq!(cast.version, 1);
        assert_eq!(cast.stdout.len(), 2);
        assert_eq!(BASE64.decode(&cast.stdout[0].1).unwrap(), b"hi");
        assert_eq!(BASE64.decode(&cast.stdout[1].1).unwrap(), b" there");
        let summed: f64 = cast.stdout.iter().map(|f| f.0).sum();
        assert!((summed - cast.duration).abs() < 1e-6);
        assert_eq!(cast.env.term, "xterm");
        assert_eq!(cast.command, "/bin/sh -c hi");
    }

    #[test]
    fn test_resize_before_output_sets_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Recorder::create(dir.path(), "xterm", "/bin/sh", "/bin/sh").unwrap();
        let args = ResizeArgs {
            columns: 100.0,
            rows: 40.0,
        };
        rec.write_frame(
            frame::CLIENT_RESIZE_TERMINAL,
            &serde_json::to_vec(&args).unwrap(),
        )
        .unwrap();
        rec.write_frame(frame::SERVER_OUTPUT, b"x").unwrap();
        rec.close().unwrap();

        let cast = convert(rec.path(), 0).unwrap();
        assert_eq!(cast.width, 100);
        assert_eq!(cast.height, 40);
    }
}
