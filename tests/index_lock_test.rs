//! Tests for index serialization across independent handles
//!
//! Each thread opens its own Notebook on the same repository, the way two
//! cmdnote processes would, so only the on-disk lock keeps them apart.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

use cmdnote::index_lock::{IndexLock, LockMode};
use cmdnote::{Config, Error, Notebook};

const WRITER_THREADS: usize = 4;
const NOTES_PER_THREAD: usize = 8;

fn config_for(repo: &Path) -> Config {
    Config::new(repo)
        .with_programs("true", "true")
        .with_lock_timeout_ms(60_000)
}

#[test]
fn test_concurrent_writers_keep_index_consistent() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Arc::new(temp_dir.path().join("notes"));

    // Create the index up front so the threads only contend on mutations
    drop(Notebook::open(config_for(&repo)).unwrap());

    let handles: Vec<_> = (0..WRITER_THREADS)
        .map(|t| {
            let repo = Arc::clone(&repo);
            thread::spawn(move || {
                let notebook = Notebook::open(config_for(&repo)).expect("Failed to open notebook");
                for i in 0..NOTES_PER_THREAD {
                    let title = format!("thread{}/note{:02}.txt", t, i);
                    let body = format!("common thread{} item{}", t, i);
                    notebook.write(&title, body.as_bytes()).expect("Write failed");
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Writer thread panicked");
    }

    let notebook = Notebook::open(config_for(&repo)).unwrap();
    assert_eq!(notebook.search("common").unwrap().len(), WRITER_THREADS * NOTES_PER_THREAD);
    assert_eq!(notebook.search("thread2").unwrap().len(), NOTES_PER_THREAD);
    assert!(notebook.check().unwrap().is_consistent());
    println!("✅ {} concurrent writes indexed", WRITER_THREADS * NOTES_PER_THREAD);
}

#[test]
fn test_readers_run_alongside_serialized_writers() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Arc::new(temp_dir.path().join("notes"));
    {
        let notebook = Notebook::open(config_for(&repo)).unwrap();
        notebook.write("seed.txt", b"searchable seed").unwrap();
    }

    let writer = {
        let repo = Arc::clone(&repo);
        thread::spawn(move || {
            let notebook = Notebook::open(config_for(&repo)).unwrap();
            for i in 0..10 {
                notebook
                    .write(&format!("w{}.txt", i), b"searchable addition")
                    .unwrap();
            }
        })
    };

    let reader = {
        let repo = Arc::clone(&repo);
        thread::spawn(move || {
            let notebook = Notebook::open(config_for(&repo)).unwrap();
            let mut last = 0;
            for _ in 0..20 {
                let hits = notebook.search("searchable").expect("Search failed during writes");
                assert!(hits.contains(&"seed.txt".to_string()));
                assert!(hits.len() >= last, "Committed notes must not disappear");
                last = hits.len();
            }
        })
    };

    writer.join().expect("Writer thread panicked");
    reader.join().expect("Reader thread panicked");
}

#[test]
fn test_held_lock_blocks_notebook_until_timeout() {
    let temp_dir = TempDir::new().unwrap();
    let repo = temp_dir.path().join("notes");
    let notebook = Notebook::open(config_for(&repo).with_lock_timeout_ms(200)).unwrap();

    let lock = IndexLock::new(notebook.config().index_dir().join("locks"), Duration::from_secs(1));
    let guard = lock.acquire_exclusive().unwrap();
    assert_eq!(guard.mode(), LockMode::Exclusive);

    match notebook.search("anything") {
        Err(Error::LockTimeout { holder, .. }) => {
            println!("Search correctly blocked by: {}", holder);
        }
        other => panic!("Expected LockTimeout, got: {:?}", other),
    }

    // A blocked write must not touch the index either
    notebook.store().write("late.txt", b"late").unwrap();
    assert!(matches!(
        notebook.index().add_document("late.txt", b"late"),
        Err(Error::LockTimeout { .. })
    ));

    drop(guard);
    notebook.index().add_document("late.txt", b"late").unwrap();
    assert_eq!(notebook.search("late").unwrap(), vec!["late.txt".to_string()]);
}

#[test]
fn test_stale_lock_from_crashed_process_is_reclaimed() {
    let temp_dir = TempDir::new().unwrap();
    let lock_dir = temp_dir.path().join("locks");
    fs::create_dir_all(&lock_dir).unwrap();

    let fake_lock = serde_json::json!({
        "hostname": "OTHER-DEVICE",
        "pid": 99999,
        "mode": "exclusive",
        "app_version": "0.1.0",
        "locked_at": chrono::Utc::now().to_rfc3339()
    });
    fs::write(
        lock_dir.join("writer.lock"),
        serde_json::to_string_pretty(&fake_lock).unwrap(),
    )
    .unwrap();

    let lock = IndexLock::new(&lock_dir, Duration::from_millis(100));
    let holder = lock.writer_holder().expect("Fake lock should parse");
    assert_eq!(holder.hostname, "OTHER-DEVICE");

    // Fresh lock from another process: denied
    assert!(matches!(lock.acquire_exclusive(), Err(Error::LockTimeout { .. })));

    // Once it is old enough it counts as abandoned
    thread::sleep(Duration::from_millis(150));
    let lock = IndexLock::new(&lock_dir, Duration::from_millis(500))
        .with_stale_after(Duration::from_millis(100));
    let guard = lock.acquire_exclusive().expect("Stale lock should be reclaimed");
    assert_eq!(lock.writer_holder().unwrap().pid, std::process::id());
    drop(guard);
}
