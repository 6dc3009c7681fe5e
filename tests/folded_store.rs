use std::fs;
use std::sync::{Arc, Mutex};

use filebus::codec::{is_folded, DEFAULT_FOLD_WIDTH};
use filebus::{BusConfig, BusRuntime, Delivery, ManualClock, ProcessId, SharedStore};
use serde_json::json;

#[test]
fn folded_and_plain_writers_share_a_store() -> filebus::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("notification.ipc");
    let clock = ManualClock::new(5_000);

    let mut folded_config = BusConfig::manual(&path);
    folded_config.fold_width = Some(DEFAULT_FOLD_WIDTH);
    let folded = BusRuntime::with_clock(
        folded_config,
        ProcessId::new("[folded]"),
        Arc::new(clock.clone()),
    )?;
    let plain = BusRuntime::with_clock(
        BusConfig::manual(&path),
        ProcessId::new("[plain]"),
        Arc::new(clock.clone()),
    )?;

    let folded_bus = folded.bus();
    let plain_bus = plain.bus();
    let at_plain = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&at_plain);
    plain_bus.on("msg", move |message| sink.lock().unwrap().push(message.clone()))?;
    let at_folded = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&at_folded);
    folded_bus.on("msg", move |message| sink.lock().unwrap().push(message.clone()))?;

    folded.flush()?;
    plain.flush()?;

    let long = "x".repeat(500);
    folded_bus.notify("msg", &json!({ "body": long }), Delivery::PeersOnly)?;
    folded.flush()?;
    let raw = fs::read_to_string(&path)?;
    assert!(is_folded(&raw));
    assert!(raw.lines().all(|line| line.len() <= DEFAULT_FOLD_WIDTH));

    plain_bus.notify("msg", &"short", Delivery::PeersOnly)?;
    plain.flush()?;
    assert!(!is_folded(&fs::read_to_string(&path)?));
    folded.flush()?;

    assert_eq!(at_plain.lock().unwrap().as_slice(), &[json!({ "body": long })]);
    assert_eq!(at_folded.lock().unwrap().as_slice(), &[json!("short")]);

    let (_, snapshot) = SharedStore::new(&path, None).read()?;
    assert!(snapshot.records.is_empty());
    Ok(())
}
