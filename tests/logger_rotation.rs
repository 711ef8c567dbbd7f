mod common;

use std::io::Read;

use mongotrap::logger::EventLog;
use serde_json::{Value, json};

fn gunzip(path: &str) -> String {
    let file = std::fs::File::open(path).unwrap();
    let mut out = String::new();
    flate2::read::GzDecoder::new(file)
        .read_to_string(&mut out)
        .unwrap();
    out
}

#[test]
fn entries_carry_timestamp_type_event_and_fields() {
    let (path, log) = common::temp_log("entry_shape");
    log.log("connection", "established", json!({"address": "10.1.2.3", "port": 4444}))
        .unwrap();

    let entries = common::read_entries(&path);
    assert_eq!(entries.len(), 1);
    let e = &entries[0];
    assert_eq!(e["type"], "connection");
    assert_eq!(e["event"], "established");
    assert_eq!(e["address"], "10.1.2.3");
    assert_eq!(e["port"], 4444);
    let ts = e["timestamp"].as_str().unwrap();
    assert!(ts.ends_with('Z'), "timestamp should be UTC with Z suffix: {ts}");
    assert!(ts.contains('T'));
}

/// Property: N concurrent log calls produce exactly N whole lines, each
/// independently parseable.
#[test]
fn concurrent_entries_stay_whole() {
    let (path, log) = common::temp_log("concurrent");
    let mut handles = Vec::new();
    for thread in 0..8 {
        let log = log.clone();
        handles.push(std::thread::spawn(move || {
            for seq in 0..25 {
                log.log("test", "entry", json!({"thread": thread, "seq": seq}))
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let entries = common::read_entries(&path);
    assert_eq!(entries.len(), 200);
    for e in &entries {
        assert_eq!(e["type"], "test");
    }
}

/// S6: growing past the threshold rotates on the next call; the old
/// entries land gzipped in the first segment, the active file holds only
/// the new entry.
#[test]
fn rotation_archives_previous_entries() {
    let dir = common::temp_dir("rotation");
    let path = dir.join("events.log");
    let log = EventLog::open(&path, 16).unwrap();

    log.log("system", "one", json!({"n": 1})).unwrap();
    log.log("system", "two", json!({"n": 2})).unwrap();

    let segment = format!("{}.000.gz", path.display());
    let archived = gunzip(&segment);
    let archived_entries: Vec<Value> = archived
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(archived_entries.len(), 1);
    assert_eq!(archived_entries[0]["event"], "one");

    let active = common::read_entries(&path);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["event"], "two");
}

/// Property: K rotations produce segments .000 through .{K-1}, in order.
#[test]
fn rotation_numbering_is_monotonic() {
    let dir = common::temp_dir("numbering");
    let path = dir.join("events.log");
    let log = EventLog::open(&path, 8).unwrap();

    for i in 0..4 {
        log.log("system", "tick", json!({"i": i})).unwrap();
    }
    for n in 0..3 {
        let segment = format!("{}.{n:03}.gz", path.display());
        assert!(
            std::path::Path::new(&segment).exists(),
            "missing segment {segment}"
        );
        let content = gunzip(&segment);
        let entry: Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(entry["i"], n);
    }
}

#[test]
fn rotation_resumes_after_existing_segments() {
    let dir = common::temp_dir("resume");
    let path = dir.join("events.log");
    std::fs::write(format!("{}.003.gz", path.display()), b"placeholder").unwrap();

    let log = EventLog::open(&path, 8).unwrap();
    log.log("system", "one", json!({})).unwrap();
    log.log("system", "two", json!({})).unwrap();

    assert!(std::path::Path::new(&format!("{}.004.gz", path.display())).exists());
}

#[test]
fn below_threshold_never_rotates() {
    let dir = common::temp_dir("no_rotation");
    let path = dir.join("events.log");
    let log = EventLog::open(&path, 1024 * 1024).unwrap();

    for _ in 0..10 {
        log.log("system", "tick", json!({})).unwrap();
    }
    assert_eq!(common::read_entries(&path).len(), 10);
    assert!(!std::path::Path::new(&format!("{}.000.gz", path.display())).exists());
}
