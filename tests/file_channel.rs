use std::fs;
use std::path::PathBuf;

use junction::{Junction, Kcall, Param, Resource};

fn scratch_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("junction-{}-{}", name, std::process::id()));
    path
}

#[test]
fn file_read_channel_transfers_without_subscription() {
    let path = scratch_path("read");
    fs::write(&path, b"content").expect("seed file");

    let junction = Junction::new().expect("junction");
    let reader = Junction::rallocate(&["octets", "file", "read"], Param::Path(path.clone()))
        .expect("allocate")
        .into_input()
        .expect("input channel");

    junction.acquire(&reader).expect("attach");
    reader.acquire(Resource::Octets(vec![0u8; 64])).expect("buffer");

    // Files report no readiness; the transfer happens on the first cycle
    // and end-of-file terminates in the same attempt.
    junction.enter().expect("enter");
    let mut bytes = None;
    let mut terminated = false;
    for chan in junction.transfer() {
        if let Some(transfer) = chan.transfer() {
            bytes = Some(transfer.octets().expect("octets"));
        }
        terminated |= chan.event_terminate();
    }
    junction.exit();

    assert_eq!(bytes.expect("file transfer"), b"content");
    assert!(terminated);
    assert_eq!(reader.port().call(), Kcall::Eof);

    fs::remove_file(&path).ok();
}

#[test]
fn file_append_channel_writes_the_acquired_buffer() {
    let path = scratch_path("append");
    fs::write(&path, b"head,").expect("seed file");

    let junction = Junction::new().expect("junction");
    let writer = Junction::rallocate(&["octets", "file", "append"], Param::Path(path.clone()))
        .expect("allocate")
        .into_output()
        .expect("output channel");

    junction.acquire(&writer).expect("attach");
    writer.acquire(Resource::Octets(b"tail".to_vec())).expect("buffer");

    junction.enter().expect("enter");
    let mut written = None;
    for chan in junction.transfer() {
        if chan.event_transfer() {
            written = chan.slice();
        }
    }
    junction.exit();

    assert_eq!(written, Some(0..4));
    assert!(writer.exhausted());

    // Attached channels terminate through the cycle engine.
    writer.terminate();
    junction.enter().expect("termination cycle");
    junction.exit();

    assert!(writer.terminated());
    assert!(!writer.port().latched());
    assert_eq!(fs::read(&path).expect("read back"), b"head,tail");

    fs::remove_file(&path).ok();
}
