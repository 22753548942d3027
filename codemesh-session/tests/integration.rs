//! Integration tests for full sessions over the in-process mesh.
//!
//! Each test starts real `Session`s on a shared `MemoryNetwork` and drives
//! them to quiescence, checking registries, delivered edits, call state and
//! status text.

use std::sync::Arc;

use codemesh_session::broadcast::Editor;
use codemesh_session::call::CallState;
use codemesh_session::config::SessionConfig;
use codemesh_session::error::EditorError;
use codemesh_session::media::{HeadlessDevices, Modality};
use codemesh_session::protocol::{ChangeEvent, PeerId, Position, Provenance};
use codemesh_session::session::{LocalAction, Session, SessionEvent, SessionNotice};
use codemesh_session::supervisor::ConnectionStatus;
use codemesh_session::transport::MemoryNetwork;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Records every applied edit.
#[derive(Clone, Default)]
struct RecordingEditor {
    applied: Arc<Mutex<Vec<ChangeEvent>>>,
}

impl Editor for RecordingEditor {
    fn apply_edit(&mut self, from: Position, to: Position, text: &[String], provenance: Provenance) -> Result<(), EditorError> {
        self.applied.lock().push(ChangeEvent {
            from,
            to,
            text: text.to_vec(),
            provenance,
        });
        Ok(())
    }
}

struct Client {
    session: Session,
    notices: mpsc::Receiver<SessionNotice>,
    applied: Arc<Mutex<Vec<ChangeEvent>>>,
    devices: Arc<HeadlessDevices>,
}

impl Client {
    fn act(&mut self, action: LocalAction) {
        self.session.dispatch(SessionEvent::Local(action));
    }

    fn id(&self) -> PeerId {
        self.session.identity().clone()
    }

    fn drain_notices(&mut self) -> Vec<SessionNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }
}

async fn client_with(network: &MemoryNetwork, id: &str, devices: HeadlessDevices) -> Client {
    let (transport, events) = network.transport();
    let editor = RecordingEditor::default();
    let applied = editor.applied.clone();
    let devices = Arc::new(devices);
    let config = SessionConfig {
        id_hint: Some(id.to_string()),
        ..SessionConfig::default()
    };

    let (session, notices) = Session::start(config, Box::new(transport), events, Box::new(editor), devices.clone())
        .await
        .unwrap();
    Client {
        session,
        notices,
        applied,
        devices,
    }
}

async fn client(network: &MemoryNetwork, id: &str) -> Client {
    client_with(network, id, HeadlessDevices::granting()).await
}

/// Let every session and spawned task run until nothing is left to do.
async fn settle(clients: &mut [Client]) {
    for _ in 0..16 {
        for c in clients.iter_mut() {
            c.session.poll_pending();
        }
        tokio::task::yield_now().await;
    }
}

/// p1 creates "alpha", the rest join it one by one.
async fn room(network: &MemoryNetwork, ids: &[&str]) -> Vec<Client> {
    let mut clients = Vec::new();
    for id in ids {
        clients.push(client(network, id).await);
    }
    clients[0].act(LocalAction::CreateRoom("alpha".into()));
    for i in 1..clients.len() {
        clients[i].act(LocalAction::JoinRoom("alpha".into()));
        settle(&mut clients).await;
    }
    clients
}

fn edit(text: &str) -> ChangeEvent {
    ChangeEvent::local(Position::new(0, 0), Position::new(0, 0), text)
}

fn peers(ids: &[&str]) -> Vec<PeerId> {
    ids.iter().map(|id| PeerId::from(*id)).collect()
}

#[tokio::test]
async fn test_join_room_connects_both_sides() {
    let network = MemoryNetwork::new();
    let mut clients = vec![client(&network, "p1").await, client(&network, "p2").await];

    clients[0].act(LocalAction::CreateRoom("alpha".into()));
    assert_eq!(clients[0].session.status().detail, "Created room: alpha");

    clients[1].act(LocalAction::JoinRoom("alpha".into()));
    assert_eq!(clients[1].session.status().detail, "Joined room: alpha");
    settle(&mut clients).await;

    assert_eq!(clients[1].session.registry().list_peers(), peers(&["p1"]));
    assert_eq!(clients[0].session.registry().list_peers(), peers(&["p2"]));
    assert_eq!(network.open_links(), 1);

    let notices = clients[0].drain_notices();
    assert!(notices.contains(&SessionNotice::PeerList(peers(&["p2"]))));
}

#[tokio::test]
async fn test_edit_reaches_peer_without_echo() {
    let network = MemoryNetwork::new();
    let mut clients = room(&network, &["p1", "p2"]).await;

    clients[0].act(LocalAction::Edit(edit("fn main() {\n}")));
    settle(&mut clients).await;

    let received = clients[1].applied.lock().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].text, vec!["fn main() {".to_string(), "}".to_string()]);
    assert_eq!(received[0].provenance, Provenance::Remote);

    // The widget reports the applied change back as an edit; it must not
    // travel anywhere.
    for change in received {
        clients[1].act(LocalAction::Edit(change));
    }
    settle(&mut clients).await;

    assert_eq!(network.stats().messages_delivered, 1);
    assert!(clients[0].applied.lock().is_empty());
    assert_eq!(clients[1].session.broadcast_stats().echoes_suppressed, 1);
}

#[tokio::test]
async fn test_failing_peer_does_not_block_others() {
    let network = MemoryNetwork::new();
    let mut clients = room(&network, &["p1", "p2", "p3"]).await;
    assert_eq!(clients[0].session.registry().list_peers(), peers(&["p2", "p3"]));

    network.fail_sends_to("p2");
    clients[0].act(LocalAction::Edit(edit("x")));
    settle(&mut clients).await;

    assert_eq!(clients[2].applied.lock().len(), 1);
    assert!(clients[1].applied.lock().is_empty());
    assert_eq!(clients[0].session.registry().list_peers(), peers(&["p3"]));
    assert!(clients[0]
        .drain_notices()
        .contains(&SessionNotice::PeerList(peers(&["p3"]))));

    // The dropped channel is closed on both ends.
    assert_eq!(network.open_links(), 2);
    assert_eq!(clients[1].session.registry().list_peers(), peers(&["p3"]));

    clients[1].act(LocalAction::Edit(edit("y")));
    settle(&mut clients).await;
    assert_eq!(clients[2].applied.lock().len(), 2);
    assert!(clients[0].applied.lock().is_empty());
}

#[tokio::test]
async fn test_registry_tracks_churn() {
    let network = MemoryNetwork::new();
    let mut clients = room(&network, &["p1", "p2", "p3", "p4"]).await;
    assert_eq!(clients[0].session.registry().len(), 3);
    assert_eq!(network.open_links(), 6);

    clients[2].session.teardown();
    settle(&mut clients).await;

    for i in [0, 1, 3] {
        assert_eq!(clients[i].session.registry().len(), 2, "client {i}");
        assert!(!clients[i].session.registry().contains(&PeerId::from("p3")));
    }
    assert_eq!(clients[0].session.status().detail, "Peer disconnected");

    // A newcomer takes the free slot; order follows connection order.
    clients.push(client(&network, "p5").await);
    clients[4].act(LocalAction::JoinRoom("alpha".into()));
    settle(&mut clients).await;
    assert_eq!(clients[0].session.registry().list_peers(), peers(&["p2", "p4", "p5"]));
    assert_eq!(clients[4].session.registry().len(), 3);
}

#[tokio::test]
async fn test_join_when_discovery_down_keeps_room() {
    let network = MemoryNetwork::new();
    let mut clients = vec![client(&network, "p1").await, client(&network, "p2").await];
    network.set_discovery_down(true);

    clients[1].act(LocalAction::JoinRoom("alpha".into()));
    settle(&mut clients).await;

    assert_eq!(clients[1].session.room(), Some("alpha"));
    assert!(clients[1].session.registry().is_empty());
    assert_eq!(clients[1].session.status().status, ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_unreachable_peer_reports_failure() {
    let network = MemoryNetwork::new();
    let mut clients = vec![client(&network, "p1").await, client(&network, "p2").await];
    network.set_unreachable("p1");

    clients[1].act(LocalAction::ConnectPeer(PeerId::from("p1")));
    settle(&mut clients).await;

    assert!(clients[1].session.registry().is_empty());
    assert!(matches!(clients[1].session.status().status, ConnectionStatus::Error(_)));
}

#[tokio::test]
async fn test_voice_call_between_two_peers() {
    let network = MemoryNetwork::new();
    let mut clients = room(&network, &["p1", "p2"]).await;
    let (p1, p2) = (clients[0].id(), clients[1].id());

    clients[0].act(LocalAction::ToggleVoice);
    settle(&mut clients).await;

    assert_eq!(clients[0].session.call_state(&p2, Modality::Voice), CallState::Active);
    assert_eq!(clients[1].session.call_state(&p1, Modality::Voice), CallState::Active);
    assert_eq!(clients[0].session.status().detail, "Voice chat active");
    // The callee had no capture and turned voice on to answer.
    assert!(clients[1].session.is_modality_active(Modality::Voice));
    assert_eq!(clients[1].devices.live_count(), 1);

    let notices = clients[0].drain_notices();
    assert!(notices
        .iter()
        .any(|n| matches!(n, SessionNotice::RemoteStream { peer, modality: Modality::Voice, .. } if *peer == p2)));

    // Callee hangs up; the caller's session returns to Idle but keeps its capture.
    clients[1].act(LocalAction::ToggleVoice);
    settle(&mut clients).await;

    assert_eq!(clients[0].session.call_state(&p2, Modality::Voice), CallState::Idle);
    assert_eq!(clients[1].devices.live_count(), 0);
    assert_eq!(clients[0].devices.live_count(), 1);
    assert!(clients[0]
        .drain_notices()
        .contains(&SessionNotice::CallEnded { peer: p2, modality: Modality::Voice }));

    clients[0].act(LocalAction::ToggleVoice);
    settle(&mut clients).await;
    assert_eq!(clients[0].devices.live_count(), 0);
    assert_eq!(network.active_calls(), 0);
}

#[tokio::test]
async fn test_toggle_off_before_capture_completes() {
    let network = MemoryNetwork::new();
    let mut clients = room(&network, &["p1", "p2"]).await;
    let p2 = clients[1].id();

    // Both toggles are handled before the acquisition task gets to run.
    clients[0].act(LocalAction::ToggleVoice);
    clients[0].act(LocalAction::ToggleVoice);
    settle(&mut clients).await;

    assert_eq!(clients[0].session.call_state(&p2, Modality::Voice), CallState::Idle);
    assert!(!clients[0].session.is_modality_active(Modality::Voice));
    assert_eq!(clients[0].devices.acquired_count(), 1);
    assert_eq!(clients[0].devices.live_count(), 0);
    assert_eq!(network.active_calls(), 0);
}

#[tokio::test]
async fn test_camera_denied_stays_idle() {
    let network = MemoryNetwork::new();
    let mut clients = vec![
        client_with(&network, "p1", HeadlessDevices::denying()).await,
        client(&network, "p2").await,
    ];
    clients[0].act(LocalAction::CreateRoom("alpha".into()));
    clients[1].act(LocalAction::JoinRoom("alpha".into()));
    settle(&mut clients).await;

    clients[0].act(LocalAction::ToggleVideo);
    settle(&mut clients).await;

    let p2 = clients[1].id();
    assert_eq!(clients[0].session.call_state(&p2, Modality::Video), CallState::Idle);
    assert!(!clients[0].session.is_modality_active(Modality::Video));
    assert_eq!(
        clients[0].session.status().status,
        ConnectionStatus::Error("Camera access denied".into())
    );
    assert_eq!(network.active_calls(), 0);
}

#[tokio::test]
async fn test_incoming_call_denied_hangs_up() {
    let network = MemoryNetwork::new();
    let mut clients = vec![
        client(&network, "p1").await,
        client_with(&network, "p2", HeadlessDevices::denying()).await,
    ];
    clients[0].act(LocalAction::CreateRoom("alpha".into()));
    clients[1].act(LocalAction::JoinRoom("alpha".into()));
    settle(&mut clients).await;
    let (p1, p2) = (clients[0].id(), clients[1].id());

    clients[0].act(LocalAction::CallPeer(p2.clone(), Modality::Video));
    settle(&mut clients).await;

    assert_eq!(clients[1].session.call_state(&p1, Modality::Video), CallState::Idle);
    assert_eq!(clients[0].session.call_state(&p2, Modality::Video), CallState::Idle);
    assert_eq!(
        clients[1].session.status().status,
        ConnectionStatus::Error("Camera access denied".into())
    );
}

#[tokio::test]
async fn test_peer_leaving_ends_its_calls() {
    let network = MemoryNetwork::new();
    let mut clients = room(&network, &["p1", "p2", "p3"]).await;
    let (p2, p3) = (clients[1].id(), clients[2].id());

    clients[0].act(LocalAction::ToggleVideo);
    settle(&mut clients).await;
    assert_eq!(clients[0].session.call_state(&p2, Modality::Video), CallState::Active);
    assert_eq!(clients[0].session.call_state(&p3, Modality::Video), CallState::Active);

    clients[1].session.teardown();
    settle(&mut clients).await;

    assert_eq!(clients[0].session.call_state(&p2, Modality::Video), CallState::Idle);
    assert_eq!(clients[0].session.call_state(&p3, Modality::Video), CallState::Active);
    assert_eq!(clients[1].devices.live_count(), 0);
    assert_eq!(network.active_calls(), 1);
}

#[tokio::test]
async fn test_run_loop_with_handle() {
    let network = MemoryNetwork::new();
    let c = client(&network, "p1").await;
    let handle = c.session.handle();
    let mut notices = c.notices;
    let runner = tokio::spawn(c.session.run());

    handle.create_room("alpha").unwrap();
    let mut created = false;
    while let Ok(Some(notice)) = timeout(Duration::from_secs(2), notices.recv()).await {
        if let SessionNotice::Status(snapshot) = notice {
            if snapshot.detail == "Created room: alpha" {
                created = true;
                break;
            }
        }
    }
    assert!(created, "Should report the created room");

    handle.teardown().unwrap();
    assert!(timeout(Duration::from_secs(2), runner).await.is_ok());
    assert!(handle.create_room("beta").is_err());
}
