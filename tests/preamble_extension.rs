//! Integration tests for the v1.4 preamble/bandwidth extension.
//!
//! A mesh peer announces a large in-flight message; the manager suppresses
//! redundant IWANTs while the transfer runs, penalizes a sender that never
//! delivers, retries from an alternate announcer, and finally surfaces a
//! retrieval failure once every avenue is exhausted.

#![cfg(feature = "preamble")]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use meshsub::{
    Codec, ControlMessage, EmptyRecordBook, MeshConfig, MeshEvent, MeshManager, MeshRpc, MessageId,
    NodeSalt, PeerId,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Default)]
struct RecordingRpc {
    sent: Mutex<Vec<(PeerId, ControlMessage)>>,
}

#[async_trait::async_trait]
impl MeshRpc for RecordingRpc {
    async fn send_control(
        &self,
        to: &PeerId,
        msg: ControlMessage,
        _high_priority: bool,
    ) -> anyhow::Result<()> {
        self.sent.lock().expect("send log lock").push((*to, msg));
        Ok(())
    }
}

impl RecordingRpc {
    fn take(&self) -> Vec<(PeerId, ControlMessage)> {
        std::mem::take(&mut *self.sent.lock().expect("send log lock"))
    }
}

fn peer_id(b: u8) -> PeerId {
    PeerId::from_bytes([b; 32])
}

#[tokio::test]
async fn expired_preamble_retries_then_surfaces_failure() {
    let config = MeshConfig {
        // keep the mesh heartbeat out of the way; the expiry sweep drives
        heartbeat_interval: Duration::from_secs(60),
        preamble_heartbeat_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let rpc = Arc::new(RecordingRpc::default());
    let seen = Arc::new(NodeSalt::new([5u8; 32]));
    let (manager, mut events): (MeshManager, mpsc::Receiver<MeshEvent>) =
        MeshManager::spawn(rpc.clone(), seen, Arc::new(EmptyRecordBook), config)
            .expect("spawn mesh manager");

    manager.subscribe("blobs").await.expect("subscribe");

    let sender = peer_id(1);
    let alt = peer_id(2);
    manager.peer_connected(sender, false, Codec::V14).await;
    manager.set_score(sender, 5.0).await;
    manager.peer_subscribed(sender, "blobs").await;
    manager.peer_connected(alt, false, Codec::V14).await;
    manager.set_score(alt, 5.0).await;
    manager.peer_subscribed(alt, "blobs").await;

    // the sender grafts itself into our mesh
    manager
        .handle_control(
            sender,
            vec![ControlMessage::Graft {
                topic: "blobs".to_string(),
            }],
        )
        .await
        .expect("graft");

    // 125 kB at the initial 125 kB/s estimate: ~2 s transfer window
    let id: MessageId = [0xC4; 32];
    manager
        .handle_control(
            sender,
            vec![ControlMessage::Preamble {
                message_id: id,
                topic: "blobs".to_string(),
                message_length: 125_000,
            }],
        )
        .await
        .expect("preamble");

    // an IHAVE for the in-flight message does not trigger an IWANT; the
    // advertiser is remembered as an alternate source instead
    manager
        .handle_control(
            alt,
            vec![ControlMessage::IHave {
                topic: "blobs".to_string(),
                message_ids: vec![id],
            }],
        )
        .await
        .expect("ihave");
    assert!(
        rpc.take()
            .iter()
            .all(|(_, msg)| !matches!(msg, ControlMessage::IWant { .. })),
        "no IWANT while the transfer is announced"
    );
    let telemetry = manager.telemetry().await;
    assert_eq!(telemetry.preamble_saved_iwants, 1);

    // the transfer never completes: the sweep penalizes the sender and pulls
    // from the alternate announcer
    let retried = timeout(TEST_TIMEOUT, async {
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let iwant = rpc.take().into_iter().find_map(|(to, msg)| match msg {
                ControlMessage::IWant { message_ids } => Some((to, message_ids)),
                _ => None,
            });
            if let Some(found) = iwant {
                break found;
            }
        }
    })
    .await
    .expect("retry IWANT timeout");
    assert_eq!(retried.0, alt);
    assert_eq!(retried.1, vec![id]);
    let penalty = manager.behaviour_penalty(sender).await;
    assert!((penalty - 0.1).abs() < 1e-9, "silent sender penalized");

    // the retry times out as well: terminal failure is surfaced
    let failed = timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await {
                Some(MeshEvent::RetrievalFailed { topic, message_id }) => break (topic, message_id),
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("failure event timeout");
    assert_eq!(failed.0, "blobs");
    assert_eq!(failed.1, id);

    let telemetry = manager.telemetry().await;
    assert_eq!(telemetry.retrieval_failures, 1);
}

#[tokio::test]
async fn arriving_message_cancels_preamble_tracking() {
    let config = MeshConfig {
        heartbeat_interval: Duration::from_secs(60),
        preamble_heartbeat_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let rpc = Arc::new(RecordingRpc::default());
    let seen = Arc::new(NodeSalt::new([5u8; 32]));
    let (manager, mut events) =
        MeshManager::spawn(rpc.clone(), seen, Arc::new(EmptyRecordBook), config)
            .expect("spawn mesh manager");

    manager.subscribe("blobs").await.expect("subscribe");
    let sender = peer_id(1);
    manager.peer_connected(sender, false, Codec::V14).await;
    manager.set_score(sender, 5.0).await;
    manager.peer_subscribed(sender, "blobs").await;
    manager
        .handle_control(
            sender,
            vec![ControlMessage::Graft {
                topic: "blobs".to_string(),
            }],
        )
        .await
        .expect("graft");

    let id: MessageId = [0xC5; 32];
    manager
        .handle_control(
            sender,
            vec![ControlMessage::Preamble {
                message_id: id,
                topic: "blobs".to_string(),
                message_length: 125_000,
            }],
        )
        .await
        .expect("preamble");

    // the payload lands inside the window
    manager
        .message_received("blobs", id, vec![0u8; 16], Some(sender))
        .await;
    manager.record_download(sender, 125_000, Duration::from_millis(400)).await;

    // no penalty, no retry, no failure event after the window passes
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(manager.behaviour_penalty(sender).await, 0.0);
    assert!(rpc
        .take()
        .iter()
        .all(|(_, msg)| !matches!(msg, ControlMessage::IWant { .. })));
    assert!(
        events.try_recv().is_err(),
        "no events expected after a completed transfer"
    );

    let telemetry = manager.telemetry().await;
    assert_eq!(telemetry.retrieval_failures, 0);
}
