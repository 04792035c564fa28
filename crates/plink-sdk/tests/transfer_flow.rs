//! Transfer manager scenarios over a real temp directory and a scripted
//! byte stream.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use plink_files::{Filesystem, LocalStorage};
use plink_protocol::{Event, EventKind, StorageType, TransferKind};
use plink_sdk::{TransferManager, TransferRequest};
use support::{MockTransport, StreamStep};
use tokio_util::sync::CancellationToken;

type EventLog = Arc<Mutex<Vec<Event>>>;

struct Rig {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    fs: Arc<Filesystem>,
    transfers: TransferManager,
    events: EventLog,
    shutdown: CancellationToken,
}

fn rig(transport: Arc<MockTransport>) -> Rig {
    // One short idle timeout for the whole process; tests in this file run
    // in parallel and the variable is global.
    std::env::set_var("PLINK_INACTIVITY_TIMEOUT_SECS", "1");
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let fs = Arc::new(Filesystem::new(Arc::new(LocalStorage)));
    fs.mount("usb", StorageType::Usb, &root, false).unwrap();
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let sink: plink_files::EventSink = Arc::new(move |event| {
        sink_events.lock().unwrap().push(event);
    });
    fs.set_event_sink(sink.clone());
    let shutdown = CancellationToken::new();
    let transfers = TransferManager::new(fs.clone(), transport, shutdown.clone());
    transfers.set_event_sink(sink);
    Rig {
        _dir: dir,
        root,
        fs,
        transfers,
        events,
        shutdown,
    }
}

fn kinds(events: &EventLog) -> Vec<EventKind> {
    events.lock().unwrap().iter().map(|e| e.kind).collect()
}

async fn wait_until<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let until = tokio::time::Instant::now() + deadline;
    while !check() {
        assert!(
            tokio::time::Instant::now() < until,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn download_request(command_id: u32) -> TransferRequest {
    TransferRequest {
        kind: TransferKind::DownloadFromUrl,
        url: Some("http://files.example/model.gcode".to_string()),
        path: "/usb/model.gcode".to_string(),
        to_print: false,
        to_select: true,
        command_id: Some(command_id),
        throttle_bytes_per_second: None,
    }
}

#[tokio::test]
async fn download_lands_in_tree_and_on_disk() {
    let transport = MockTransport::new();
    transport.set_stream(
        200,
        vec![
            ("content-type".into(), "application/gcode".into()),
            ("content-length".into(), "11".into()),
        ],
        vec![
            StreamStep::Chunk(b"hello ".to_vec()),
            StreamStep::Chunk(b"gcode".to_vec()),
        ],
    );
    let rig = rig(transport);
    let runner = rig.transfers.clone();
    let scheduler = tokio::spawn(async move { runner.run().await });

    let id = rig.transfers.start(download_request(7)).unwrap();
    wait_until("transfer finished", Duration::from_secs(5), || {
        kinds(&rig.events).contains(&EventKind::TransferFinished)
    })
    .await;

    // Bytes are on disk under the final name; the part file is gone.
    let written = std::fs::read(rig.root.join("model.gcode")).unwrap();
    assert_eq!(written, b"hello gcode");
    assert!(!rig.root.join(".model.gcode.part").exists());

    // The tree saw the file before the finish event went out.
    let order = kinds(&rig.events);
    let changed = order.iter().position(|k| *k == EventKind::FileChanged).unwrap();
    let finished = order.iter().position(|k| *k == EventKind::TransferFinished).unwrap();
    assert!(changed < finished, "FILE_CHANGED must precede TRANSFER_FINISHED");

    let info = rig.fs.get_info();
    let entry = info.files.get("/usb/model.gcode").expect("file in listing");
    assert_eq!(entry.size, 11);

    // The command that started the transfer is echoed on the finish event.
    let finish = rig.events.lock().unwrap()[finished].clone();
    assert_eq!(finish.command_id, Some(7));
    assert_eq!(finish.transfer_id, Some(id));

    rig.shutdown.cancel();
    scheduler.await.unwrap();
}

#[tokio::test]
async fn stalled_download_times_out_without_partial_listing() {
    let transport = MockTransport::new();
    transport.set_stream(
        200,
        vec![("content-type".into(), "application/octet-stream".into())],
        vec![StreamStep::Chunk(vec![0u8; 100]), StreamStep::Stall],
    );
    let rig = rig(transport);
    let runner = rig.transfers.clone();
    let scheduler = tokio::spawn(async move { runner.run().await });

    rig.transfers.start(download_request(9)).unwrap();
    wait_until("timeout abort", Duration::from_secs(10), || {
        kinds(&rig.events).contains(&EventKind::TransferAborted)
    })
    .await;

    let aborted = rig
        .events
        .lock()
        .unwrap()
        .iter()
        .find(|e| e.kind == EventKind::TransferAborted)
        .cloned()
        .unwrap();
    assert_eq!(aborted.reason.as_deref(), Some("read_timeout"));

    // No partial file on disk, in the tree, or in the listing.
    assert!(!rig.root.join("model.gcode").exists());
    assert!(!rig.root.join(".model.gcode.part").exists());
    assert!(rig.fs.get_info().files.is_empty());

    rig.shutdown.cancel();
    scheduler.await.unwrap();
}

#[tokio::test]
async fn stop_aborts_with_reason_and_frees_the_storage() {
    let transport = MockTransport::new();
    transport.set_stream(
        200,
        vec![("content-type".into(), "text/plain".into())],
        vec![StreamStep::Chunk(b"abc".to_vec()), StreamStep::Stall],
    );
    let rig = rig(transport);
    let runner = rig.transfers.clone();
    let scheduler = tokio::spawn(async move { runner.run().await });

    let id = rig.transfers.start(download_request(1)).unwrap();
    wait_until("bytes flowing", Duration::from_secs(5), || {
        rig.transfers
            .snapshots()
            .first()
            .is_some_and(|s| s.transferred > 0)
    })
    .await;

    assert!(rig.transfers.stop(id, "stopped"));
    wait_until("abort event", Duration::from_secs(5), || {
        kinds(&rig.events).contains(&EventKind::TransferAborted)
    })
    .await;
    let aborted = rig
        .events
        .lock()
        .unwrap()
        .iter()
        .find(|e| e.kind == EventKind::TransferAborted)
        .cloned()
        .unwrap();
    assert_eq!(aborted.reason.as_deref(), Some("stopped"));
    assert_eq!(aborted.transfer_id, Some(id));

    wait_until("slot freed", Duration::from_secs(5), || {
        rig.transfers.snapshots().is_empty()
    })
    .await;

    rig.shutdown.cancel();
    scheduler.await.unwrap();
}

#[tokio::test]
async fn one_transfer_per_storage_with_queueing() {
    let transport = MockTransport::new();
    transport.set_stream(
        200,
        vec![("content-type".into(), "text/plain".into())],
        vec![StreamStep::Chunk(b"abc".to_vec()), StreamStep::Stall],
    );
    let rig = rig(transport);
    let runner = rig.transfers.clone();
    let scheduler = tokio::spawn(async move { runner.run().await });

    let first = rig.transfers.start(download_request(1)).unwrap();
    let mut second_req = download_request(2);
    second_req.path = "/usb/other.gcode".to_string();
    let second = rig.transfers.start(second_req).unwrap();
    assert_ne!(first, second);

    wait_until("first running", Duration::from_secs(5), || {
        rig.transfers
            .snapshots()
            .first()
            .is_some_and(|s| s.transferred > 0)
    })
    .await;

    // Only one transfer owns the storage; the other stays enqueued.
    let snapshots = rig.transfers.snapshots();
    assert_eq!(snapshots.len(), 2);
    let running = snapshots.iter().filter(|s| !s.state.is_terminal() && s.transferred > 0).count();
    assert_eq!(running, 1);

    rig.shutdown.cancel();
    scheduler.await.unwrap();
}

#[tokio::test]
async fn invalid_content_type_fails_the_transfer() {
    let transport = MockTransport::new();
    transport.set_stream(
        200,
        vec![("content-type".into(), "text/html".into())],
        vec![StreamStep::Chunk(b"<html>".to_vec())],
    );
    let rig = rig(transport);
    let runner = rig.transfers.clone();
    let scheduler = tokio::spawn(async move { runner.run().await });

    rig.transfers.start(download_request(3)).unwrap();
    wait_until("abort", Duration::from_secs(5), || {
        kinds(&rig.events).contains(&EventKind::TransferAborted)
    })
    .await;
    let aborted = rig
        .events
        .lock()
        .unwrap()
        .iter()
        .find(|e| e.kind == EventKind::TransferAborted)
        .cloned()
        .unwrap();
    assert!(aborted
        .reason
        .as_deref()
        .unwrap()
        .contains("invalid content type"));

    rig.shutdown.cancel();
    scheduler.await.unwrap();
}
