use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use filebus::{BusConfig, BusRuntime, Delivery, ProcessId, SystemClock};
use serde_json::{json, Value};

fn config(path: &std::path::Path, watch_changes: bool) -> BusConfig {
    let mut config = BusConfig::new(path);
    config.debounce = Duration::from_millis(10);
    config.retry_min = Duration::from_millis(10);
    config.retry_max = Duration::from_millis(30);
    config.poll_interval = Some(Duration::from_millis(50));
    config.watch_changes = watch_changes;
    config
}

fn exchange(watch_changes: bool) -> filebus::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("notification.ipc");
    let sender = BusRuntime::with_clock(
        config(&path, watch_changes),
        ProcessId::new("[sender]"),
        Arc::new(SystemClock),
    )?;
    let receiver = BusRuntime::with_clock(
        config(&path, watch_changes),
        ProcessId::new("[receiver]"),
        Arc::new(SystemClock),
    )?;

    let (tx, rx) = mpsc::channel::<Value>();
    let tx = std::sync::Mutex::new(tx);
    let listener = receiver.bus();
    listener.on("greeting", move |message| {
        let _ = tx.lock().unwrap().send(message.clone());
    })?;

    // Let both processes register before anything is sent.
    std::thread::sleep(Duration::from_millis(300));
    let bus = sender.bus();
    for n in 0..3 {
        bus.notify("greeting", &json!({ "n": n }), Delivery::PeersOnly)?;
    }

    for n in 0..3 {
        let message = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(message, json!({ "n": n }));
    }
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    Ok(())
}

#[test]
fn polling_alone_delivers_without_change_hints() -> filebus::Result<()> {
    exchange(false)
}

#[cfg(target_os = "linux")]
#[test]
fn change_hints_deliver() -> filebus::Result<()> {
    exchange(true)
}

#[test]
fn manual_flushes_racing_the_worker_keep_delivery_order() -> filebus::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("notification.ipc");
    let sender = BusRuntime::with_clock(
        BusConfig::manual(&path),
        ProcessId::new("[sender]"),
        Arc::new(SystemClock),
    )?;
    let mut receiver_config = config(&path, false);
    receiver_config.poll_interval = Some(Duration::from_millis(2));
    receiver_config.debounce = Duration::from_millis(1);
    let receiver = BusRuntime::with_clock(
        receiver_config,
        ProcessId::new("[receiver]"),
        Arc::new(SystemClock),
    )?;

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener = receiver.bus();
    listener.on("seq", move |message| {
        // Widen the window in which a second delivery batch could overtake.
        std::thread::sleep(Duration::from_micros(200));
        sink.lock().unwrap().push(message.as_u64().unwrap());
    })?;

    sender.flush()?;
    std::thread::sleep(Duration::from_millis(200));

    let bus = sender.bus();
    let total = 200u64;
    for n in 0..total {
        bus.notify("seq", &n, Delivery::PeersOnly)?;
        if n % 5 == 4 {
            sender.flush()?;
            receiver.flush()?;
        }
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while seen.lock().unwrap().len() < total as usize && std::time::Instant::now() < deadline {
        // Either side may find the store lock taken; pending records carry over.
        sender.flush()?;
        receiver.flush()?;
        std::thread::sleep(Duration::from_millis(5));
    }
    let seen = seen.lock().unwrap();
    assert_eq!(*seen, (0..total).collect::<Vec<_>>());
    Ok(())
}
