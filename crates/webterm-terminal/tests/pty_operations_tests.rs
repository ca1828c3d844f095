//! PTY and pipe operations against real processes

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use webterm_terminal::{
    FifoRead, FifoReader, FifoWriter, PipeManager, PtyHandle, PtyRead, SpawnRequest, SpawnedPty,
};

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn read_until(spawned: &SpawnedPty, needle: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut output = Vec::new();
    let mut buf = [0u8; 1024];
    while Instant::now() < deadline {
        match spawned.pty.try_read(&mut buf, 50).unwrap() {
            PtyRead::Data(n) => output.extend_from_slice(&buf[..n]),
            PtyRead::Idle => {}
            PtyRead::Closed => break,
        }
        if String::from_utf8_lossy(&output).contains(needle) {
            break;
        }
    }
    String::from_utf8_lossy(&output).into_owned()
}

fn reap(mut spawned: SpawnedPty) {
    let _ = spawned.child.kill();
    let _ = spawned.child.wait();
    spawned.pty.close();
}

// =============================================================================
// PTY
// =============================================================================

#[test]
fn test_written_input_is_echoed_by_cat() {
    let spawned = PtyHandle::spawn(&SpawnRequest {
        command: strings(&["/bin/cat"]),
        ..Default::default()
    })
    .unwrap();

    spawned.pty.write(b"round-trip\n").unwrap();
    assert!(read_until(&spawned, "round-trip").contains("round-trip"));
    reap(spawned);
}

#[test]
fn test_resize_is_visible_to_the_child() {
    let spawned = PtyHandle::spawn(&SpawnRequest {
        command: strings(&["/bin/sh", "-c", "sleep 0.3; stty size"]),
        ..Default::default()
    })
    .unwrap();

    spawned.pty.resize(40, 120).unwrap();
    assert!(read_until(&spawned, "40 120").contains("40 120"));
    reap(spawned);
}

#[test]
fn test_environment_and_working_dir_reach_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let mut env = HashMap::new();
    env.insert("WEBTERM_MARKER".to_string(), "marker-value".to_string());

    let spawned = PtyHandle::spawn(&SpawnRequest {
        command: strings(&["/bin/sh", "-c", "echo $WEBTERM_MARKER; pwd"]),
        working_dir: Some(dir.path().to_path_buf()),
        env,
        ..Default::default()
    })
    .unwrap();

    let dir_name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
    let output = read_until(&spawned, &dir_name);
    assert!(output.contains("marker-value"));
    assert!(output.contains(&dir_name));
    assert_eq!(spawned.working_dir, dir.path());
    reap(spawned);
}

#[test]
fn test_missing_program_fails_to_spawn() {
    let result = PtyHandle::spawn(&SpawnRequest {
        command: strings(&["/nonexistent/webterm-binary"]),
        ..Default::default()
    });
    assert!(result.is_err());
}

// =============================================================================
// Pipes
// =============================================================================

#[test]
fn test_fifo_delivers_writes_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let manager = PipeManager::new(dir.path().join("pipes"));
    let pipes = manager.create("ordered").unwrap();

    let mut reader = FifoReader::open(&pipes.input).unwrap();
    let mut writer = FifoWriter::open(&pipes.input).unwrap();
    writer.write_all(b"one ").unwrap();
    writer.write_all(b"two").unwrap();
    drop(writer);

    let mut received = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        match reader.read_timeout(&mut buf, 500).unwrap() {
            FifoRead::Data(n) => received.extend_from_slice(&buf[..n]),
            FifoRead::Idle => {}
            FifoRead::WriterClosed => break,
        }
    }
    assert_eq!(received, b"one two");

    manager.remove(&pipes).unwrap();
    assert!(!Path::new(&pipes.input).exists());
    assert!(!Path::new(&pipes.output).exists());
}

#[test]
fn test_sessions_get_distinct_paths() {
    let dir = tempfile::tempdir().unwrap();
    let manager = PipeManager::new(dir.path());
    let a = manager.create("a").unwrap();
    let b = manager.create("b").unwrap();
    assert_ne!(a.input, b.input);
    assert_ne!(a.output, b.output);
    assert_eq!(manager.sweep_orphans().unwrap(), 4);
}
