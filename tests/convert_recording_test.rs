// Round-trips a hand-built recording through Recorder -> convert -> disk,
// checking the asciicast v1 document it produces (spec §6 "Convert").

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sharetty::convert::{self, Asciicast};
use sharetty::frame::{self, ResizeArgs};
use sharetty::recorder::Recorder;

#[test]
fn test_convert_writes_valid_asciicast_json() {
    let rec_dir = tempfile::tempdir().unwrap();
    let rec = Recorder::create(rec_dir.path(), "xterm-256color", "/bin/bash", "/bin/bash -lc 'echo hi'").unwrap();

    let resize = ResizeArgs {
        columns: 120.0,
        rows: 30.0,
    };
    rec.write_frame(
        frame::CLIENT_RESIZE_TERMINAL,
        &serde_json::to_vec(&resize).unwrap(),
    )
    .unwrap();
    rec.write_frame(frame::SERVER_OUTPUT, b"hi\r\n").unwrap();
    rec.close().unwrap();

    let out_dir = tempfile::tempdir().unwrap();
    let out_path = out_dir.path().join("session.cast");

    let cast = convert::convert(rec.path(), 0).unwrap();
    convert::save(&cast, &out_path).unwrap();

    assert!(out_path.exists());
    let loaded: Asciicast = serde_json::from_str(&std::fs::read_to_string(&out_path).unwrap()).unwrap();
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.width, 120);
    assert_eq!(loaded.height, 30);
    assert_eq!(loaded.env.term, "xterm-256color");
    assert_eq!(loaded.command, "/bin/bash -lc 'echo hi'");
    assert_eq!(loaded.stdout.len(), 1);
    assert_eq!(BASE64.decode(&loaded.stdout[0].1).unwrap(), b"hi\r\n");
}

#[test]
fn test_convert_caps_idle_gaps_with_max_wait() {
    let rec_dir = tempfile::tempdir().unwrap();
    let rec = Recorder::create(rec_dir.path(), "xterm", "/bin/sh", "/bin/sh").unwrap();
    rec.write_frame(frame::SERVER_OUTPUT, b"a").unwrap();
    // A gap comfortably longer than the 1-second cap below.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    rec.write_frame(frame::SERVER_OUTPUT, b"b").unwrap();
    rec.close().unwrap();

    let uncapped = convert::convert(rec.path(), 0).unwrap();
    let capped = convert::convert(rec.path(), 1).unwrap();

    assert!(uncapped.duration > 1.0);
    assert!(capped.duration <= 1.000001);
}
