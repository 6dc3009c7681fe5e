use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use filebus::{BusConfig, BusRuntime, Cache, CacheConfig, ManualClock, ProcessId};

fn node(path: &Path, id: &str, clock: &ManualClock) -> filebus::Result<(BusRuntime, Cache)> {
    let runtime = BusRuntime::with_clock(
        BusConfig::manual(path),
        ProcessId::new(id),
        Arc::new(clock.clone()),
    )?;
    let cache = Cache::new(&runtime, CacheConfig::manual())?;
    Ok((runtime, cache))
}

#[test]
fn updates_and_deletes_replicate() -> filebus::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cache.ipc");
    let clock = ManualClock::new(10_000);
    let (ra, a) = node(&path, "[a]", &clock)?;
    let (rb, b) = node(&path, "[b]", &clock)?;
    ra.flush()?;
    rb.flush()?;

    a.set("user:1", &"ada", Some(30))?;
    a.set_local("scratch", &true, None)?;
    ra.flush()?;
    rb.flush()?;
    assert_eq!(b.get::<String>("user:1").as_deref(), Some("ada"));
    assert!(!b.has("scratch"));
    assert_eq!(b.snapshot()["user:1"].ttl_secs, 30);

    clock.advance(Duration::from_millis(100));
    b.delete("user:1")?;
    rb.flush()?;
    ra.flush()?;
    assert!(!a.has("user:1"));
    assert!(a.has("scratch"));
    Ok(())
}

#[test]
fn sync_request_converges_both_maps() -> filebus::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cache.ipc");
    let clock = ManualClock::new(10_000);
    let (ra, a) = node(&path, "[a]", &clock)?;
    let (rb, b) = node(&path, "[b]", &clock)?;
    ra.flush()?;
    rb.flush()?;

    a.set_local("only-a", &1, None)?;
    clock.advance(Duration::from_millis(5));
    b.set_local("only-b", &2, None)?;
    b.set_local("both", &"from b", None)?;
    clock.advance(Duration::from_millis(5));
    a.set_local("both", &"from a", None)?;

    a.request_sync()?;
    ra.flush()?;
    // B merges A's map and queues its answer.
    rb.flush()?;
    assert_eq!(rb.pending_len(), 1);
    rb.flush()?;
    ra.flush()?;

    let left = a.snapshot();
    let right = b.snapshot();
    assert_eq!(left.len(), 3);
    assert_eq!(left, right);
    assert_eq!(a.get::<String>("both").as_deref(), Some("from a"));
    assert_eq!(b.get::<i64>("only-a"), Some(1));
    assert_eq!(a.get::<i64>("only-b"), Some(2));
    Ok(())
}

#[test]
fn replicated_entry_expires_everywhere() -> filebus::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cache.ipc");
    let clock = ManualClock::new(10_000);
    let (ra, a) = node(&path, "[a]", &clock)?;
    let (rb, b) = node(&path, "[b]", &clock)?;
    ra.flush()?;
    rb.flush()?;

    a.set("session", &"token", Some(2))?;
    ra.flush()?;
    rb.flush()?;
    assert!(b.has("session"));

    clock.advance(Duration::from_secs(3));
    assert!(!a.has("session"));
    assert!(!b.has("session"));
    assert_eq!(b.clean_up(), 1);
    Ok(())
}

#[test]
fn concurrent_writes_settle_on_the_later_one() -> filebus::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cache.ipc");
    let clock = ManualClock::new(10_000);
    let (ra, a) = node(&path, "[a]", &clock)?;
    let (rb, b) = node(&path, "[b]", &clock)?;
    ra.flush()?;
    rb.flush()?;

    a.set("k", &"from a (older)", None)?;
    clock.advance(Duration::from_millis(100));
    b.set("k", &"from b (newer)", None)?;

    for _ in 0..4 {
        ra.flush()?;
        rb.flush()?;
    }
    let left = a.get::<String>("k");
    let right = b.get::<String>("k");
    assert_eq!(left, right);
    assert_eq!(right.as_deref(), Some("from b (newer)"));
    Ok(())
}

#[test]
fn caches_in_one_process_see_each_other_and_remote_writes() -> filebus::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cache.ipc");
    let clock = ManualClock::new(10_000);
    let (ra, a) = node(&path, "[a]", &clock)?;
    let (rb, b1) = node(&path, "[b]", &clock)?;
    let b2 = Cache::new(&rb, CacheConfig::manual())?;
    ra.flush()?;
    rb.flush()?;

    b1.set("local", &1, None)?;
    assert_eq!(b2.get::<i64>("local"), Some(1));

    a.set("remote", &2, None)?;
    for _ in 0..3 {
        ra.flush()?;
        rb.flush()?;
    }
    assert_eq!(b1.get::<i64>("remote"), Some(2));
    assert_eq!(b2.get::<i64>("remote"), Some(2));
    assert_eq!(a.get::<i64>("local"), Some(1));

    b2.request_sync()?;
    for _ in 0..3 {
        rb.flush()?;
        ra.flush()?;
    }
    assert_eq!(a.snapshot().len(), 2);
    assert_eq!(b1.snapshot(), b2.snapshot());
    Ok(())
}
