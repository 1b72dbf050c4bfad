//! Manager-level tests: two managers on loopback exchanging files through
//! the queue, with events observed the way a front-end would.

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;

use lantransfer_core::{
    AppEvent, ManagerConfig, Peer, TransferManager, TransferStatus,
};

struct Node {
    manager: TransferManager,
    events: UnboundedReceiver<AppEvent>,
    _downloads: tempfile::TempDir,
    _data: tempfile::TempDir,
}

impl Node {
    async fn start() -> Self {
        let downloads = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let (tx, events) = mpsc::unbounded_channel();
        let mut manager = TransferManager::new(
            ManagerConfig {
                port: 0,
                download_dir: downloads.path().to_path_buf(),
                data_dir: data.path().to_path_buf(),
            },
            tx,
        )
        .unwrap();
        manager.start().await.unwrap();
        Node {
            manager,
            events,
            _downloads: downloads,
            _data: data,
        }
    }

    fn as_peer(&self, name: &str) -> Peer {
        Peer {
            name: name.into(),
            address: "127.0.0.1".parse().unwrap(),
            port: self.manager.port().unwrap(),
            device_id: format!("{name}._lantransfer._tcp.local."),
        }
    }

    async fn wait_for_completed(&mut self) -> lantransfer_core::QueuedTransfer {
        loop {
            let event = timeout(Duration::from_secs(30), self.events.recv())
                .await
                .expect("timed out waiting for transfer completion")
                .expect("event channel closed");
            match event {
                AppEvent::TransferCompleted(transfer) => return transfer,
                AppEvent::TransferFailed(transfer) => {
                    panic!("transfer failed: {:?}", transfer.error)
                }
                _ => {}
            }
        }
    }

    async fn wait_for_failed(&mut self) -> lantransfer_core::QueuedTransfer {
        loop {
            let event = timeout(Duration::from_secs(60), self.events.recv())
                .await
                .expect("timed out waiting for transfer failure")
                .expect("event channel closed");
            match event {
                AppEvent::TransferFailed(transfer) => return transfer,
                AppEvent::TransferCompleted(transfer) => {
                    panic!("transfer unexpectedly completed: {}", transfer.filename)
                }
                _ => {}
            }
        }
    }
}

#[tokio::test]
async fn file_flows_between_two_managers() {
    let mut sender = Node::start().await;
    let mut receiver = Node::start().await;

    let source = tempfile::tempdir().unwrap();
    let file = source.path().join("report.pdf");
    let payload: Vec<u8> = (0..300_000usize).map(|i| (i % 251) as u8).collect();
    std::fs::write(&file, &payload).unwrap();

    let peer = receiver.as_peer("receiver");
    let queue_id = sender.manager.queue_send(&file, &peer).unwrap();

    let sent = sender.wait_for_completed().await;
    assert_eq!(sent.id, queue_id);
    assert_eq!(sent.status, TransferStatus::Completed);
    assert_eq!(sent.transferred_bytes, payload.len() as u64);
    assert_eq!(sent.peer_name, "receiver");

    let received = receiver.wait_for_completed().await;
    assert_eq!(received.filename, "report.pdf");
    assert_eq!(received.transferred_bytes, payload.len() as u64);
    // for incoming transfers the queue-id is the receiver's transfer-id
    assert_eq!(received.id.len(), 8);

    assert_eq!(
        std::fs::read(receiver.manager.download_dir().join("report.pdf")).unwrap(),
        payload
    );

    // terminal entries stay until cleared
    assert_eq!(sender.manager.completed_transfers().len(), 1);
    sender.manager.clear_completed();
    receiver.manager.clear_completed();
    assert!(sender.manager.queue().is_empty());
    assert!(receiver.manager.queue().is_empty());

    sender.manager.stop().await;
    receiver.manager.stop().await;
}

#[tokio::test]
async fn folder_send_surfaces_folder_name_in_queue() {
    let mut sender = Node::start().await;
    let mut receiver = Node::start().await;

    let source = tempfile::tempdir().unwrap();
    let folder = source.path().join("photos");
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join("one.jpg"), vec![0xFF; 50_000]).unwrap();
    std::fs::write(folder.join("two.jpg"), vec![0xEE; 70_000]).unwrap();

    let peer = receiver.as_peer("receiver");
    let queue_id = sender.manager.queue_send(&folder, &peer).unwrap();
    assert_eq!(sender.manager.get(&queue_id).unwrap().filename, "photos/");

    let sent = sender.wait_for_completed().await;
    assert_eq!(sent.status, TransferStatus::Completed);
    assert_eq!(sent.transferred_bytes, sent.total_size);

    receiver.wait_for_completed().await;
    let extracted = receiver.manager.download_dir().join("photos");
    assert_eq!(
        std::fs::read(extracted.join("one.jpg")).unwrap(),
        vec![0xFF; 50_000]
    );
    assert!(!receiver.manager.download_dir().join("photos.tar.gz").exists());

    sender.manager.stop().await;
    receiver.manager.stop().await;
}

#[tokio::test]
async fn cancel_before_start_skips_the_send() {
    let downloads = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    let file = source.path().join("never-sent.bin");
    std::fs::write(&file, vec![0u8; 10_000]).unwrap();

    let (tx, mut events) = mpsc::unbounded_channel();
    let mut manager = TransferManager::new(
        ManagerConfig {
            port: 0,
            download_dir: downloads.path().to_path_buf(),
            data_dir: data.path().to_path_buf(),
        },
        tx,
    )
    .unwrap();

    // queue and cancel before the worker ever runs
    let peer = Peer {
        name: "ghost".into(),
        address: "127.0.0.1".parse().unwrap(),
        port: 1,
        device_id: "ghost._lantransfer._tcp.local.".into(),
    };
    let queue_id = manager.queue_send(&file, &peer).unwrap();
    assert!(manager.cancel_transfer(&queue_id));

    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        manager.get(&queue_id).unwrap().status,
        TransferStatus::Cancelled
    );
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, AppEvent::TransferCompleted(_) | AppEvent::TransferFailed(_)),
            "cancelled job must not produce a terminal transfer event"
        );
    }

    manager.stop().await;
}

#[tokio::test]
async fn unreachable_peer_fails_the_queued_transfer() {
    let mut sender = Node::start().await;

    let source = tempfile::tempdir().unwrap();
    let file = source.path().join("lost.bin");
    std::fs::write(&file, vec![7u8; 5_000]).unwrap();

    // nothing listens on this port
    let peer = Peer {
        name: "offline".into(),
        address: "127.0.0.1".parse().unwrap(),
        port: 9,
        device_id: "offline._lantransfer._tcp.local.".into(),
    };
    let queue_id = sender.manager.queue_send(&file, &peer).unwrap();

    let failed = sender.wait_for_failed().await;
    assert_eq!(failed.id, queue_id);
    assert_eq!(failed.status, TransferStatus::Failed);
    assert!(failed.error.is_some());

    sender.manager.stop().await;
}

#[tokio::test]
async fn queue_send_rejects_missing_path() {
    let node = Node::start().await;
    let peer = node.as_peer("self");
    assert!(node
        .manager
        .queue_send(Path::new("/nonexistent/file.bin"), &peer)
        .is_err());
    let mut node = node;
    node.manager.stop().await;
}
