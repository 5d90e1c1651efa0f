//! Broadcast registry behavior over the in-memory transport

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tilecast_core::{Frame, MemoryConnector, MemoryEndpoint, MemoryListener};
use tilecast_media::{CapturedTrack, TrackKind};
use tilecast_signaling::testing::{MockPeerFactory, PeerCall};
use tilecast_signaling::{BroadcastRegistry, RegistryConfig, SessionState, SignalingState};
use tokio::time::{sleep, timeout, Instant};

const PORT: u16 = 4455;

struct Harness {
    registry: BroadcastRegistry,
    peers: Arc<MockPeerFactory>,
    connector: MemoryConnector,
    listener: MemoryListener,
}

fn harness() -> Harness {
    let (connector, listener) = MemoryConnector::new();
    let peers = Arc::new(MockPeerFactory::new());
    let registry = BroadcastRegistry::new(
        peers.clone(),
        Arc::new(connector.clone()),
        RegistryConfig::default(),
    )
    .unwrap();
    Harness {
        registry,
        peers,
        connector,
        listener,
    }
}

async fn accept(listener: &mut MemoryListener) -> MemoryEndpoint {
    timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("no connection")
        .expect("listener closed")
}

async fn next_frame(endpoint: &mut MemoryEndpoint) -> Option<Frame> {
    timeout(Duration::from_secs(2), endpoint.recv())
        .await
        .expect("no frame")
}

async fn next_json(endpoint: &mut MemoryEndpoint) -> Value {
    match next_frame(endpoint).await {
        Some(Frame::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {:?}", other),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached");
        sleep(Duration::from_millis(5)).await;
    }
}

fn answer() -> String {
    json!({"sdp": {"type": "answer", "sdp": "v=0\r\nanswer"}}).to_string()
}

/// Open `stream_id` and return its endpoint after the offer arrived
async fn open_negotiating(h: &mut Harness, track: &CapturedTrack, stream_id: &str) -> MemoryEndpoint {
    h.registry.open(track.clone(), stream_id, PORT).await.unwrap();
    let mut endpoint = accept(&mut h.listener).await;
    let offer = next_json(&mut endpoint).await;
    assert_eq!(offer["sdp"]["type"], "offer");
    endpoint
}

#[tokio::test]
async fn test_open_dials_sender_url_and_offers() {
    let mut h = harness();
    let track = CapturedTrack::new(TrackKind::Video);

    h.registry.open(track.clone(), "alice_video", PORT).await.unwrap();
    assert!(h.registry.is_active("alice_video"));

    let mut endpoint = accept(&mut h.listener).await;
    assert_eq!(endpoint.url(), "ws://127.0.0.1:4455/alice_video?mode=sender");

    let offer = next_json(&mut endpoint).await;
    let peer = h.peers.peer(0).unwrap();
    assert_eq!(offer, json!({"sdp": {"type": "offer", "sdp": peer.offer_sdp()}}));
    assert_eq!(h.registry.state("alice_video"), Some(SessionState::Negotiating));

    let calls = peer.calls();
    match &calls[0] {
        PeerCall::AddTrack { track_id, .. } => assert_eq!(track_id, track.id()),
        other => panic!("unexpected first call {:?}", other),
    }
    assert!(calls.contains(&PeerCall::CreateOffer));
    assert!(peer.has_candidate_handler());
}

#[tokio::test]
async fn test_answer_opens_session() {
    let mut h = harness();
    let track = CapturedTrack::new(TrackKind::Audio);
    let endpoint = open_negotiating(&mut h, &track, "bob_audio").await;

    endpoint.send_text(answer()).unwrap();
    wait_until(|| h.registry.state("bob_audio") == Some(SessionState::Open)).await;

    let peer = h.peers.peer(0).unwrap();
    let remotes = peer.remote_descriptions();
    assert_eq!(remotes.len(), 1);
    assert_eq!(remotes[0].sdp, "v=0\r\nanswer");
    assert!(peer.remote_candidates().is_empty());
}

#[tokio::test]
async fn test_remote_candidates_are_added() {
    let mut h = harness();
    let track = CapturedTrack::new(TrackKind::Video);
    let endpoint = open_negotiating(&mut h, &track, "carol_video").await;

    endpoint
        .send_text(json!({"candidate": {"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}}).to_string())
        .unwrap();

    let peer = h.peers.peer(0).unwrap();
    wait_until(|| peer.remote_candidates().len() == 1).await;
    assert_eq!(peer.remote_candidates()[0].sdp_mid.as_deref(), Some("0"));
}

#[tokio::test]
async fn test_local_candidates_are_forwarded() {
    let mut h = harness();
    let track = CapturedTrack::new(TrackKind::Video);
    let mut endpoint = open_negotiating(&mut h, &track, "dave_video").await;

    let peer = h.peers.peer(0).unwrap();
    peer.emit_candidate(None);
    peer.emit_candidate(Some(tilecast_signaling::IceCandidate {
        candidate: "candidate:2 1 udp 1 10.0.0.1 5000 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }));

    // End-of-candidates is not sent, so the next frame is the real candidate
    let message = next_json(&mut endpoint).await;
    assert_eq!(
        message["candidate"]["candidate"],
        "candidate:2 1 udp 1 10.0.0.1 5000 typ host"
    );
    assert_eq!(message["candidate"]["sdpMLineIndex"], 0);
}

#[tokio::test]
async fn test_malformed_message_keeps_session() {
    let mut h = harness();
    let track = CapturedTrack::new(TrackKind::Video);
    let endpoint = open_negotiating(&mut h, &track, "erin_video").await;

    endpoint.send_text("{not json").unwrap();
    endpoint.send_text(r#"{"hello":"world"}"#).unwrap();
    endpoint.send_text(answer()).unwrap();

    wait_until(|| h.registry.state("erin_video") == Some(SessionState::Open)).await;
    assert!(h.registry.is_active("erin_video"));
    assert_eq!(h.peers.peer(0).unwrap().remote_descriptions().len(), 1);
}

#[tokio::test]
async fn test_rejected_answer_keeps_session() {
    let mut h = harness();
    let track = CapturedTrack::new(TrackKind::Video);
    let endpoint = open_negotiating(&mut h, &track, "faye_video").await;

    let peer = h.peers.peer(0).unwrap();
    peer.reject_remote_descriptions(true);
    endpoint.send_text(answer()).unwrap();

    wait_until(|| peer.remote_descriptions().len() == 1).await;
    assert_eq!(h.registry.state("faye_video"), Some(SessionState::Negotiating));
}

#[tokio::test]
async fn test_reopen_evicts_previous_session_once() {
    let mut h = harness();
    let first = CapturedTrack::new(TrackKind::Video);
    let mut old_endpoint = open_negotiating(&mut h, &first, "gina_video").await;

    let second = CapturedTrack::new(TrackKind::Video);
    h.registry.open(second.clone(), "gina_video", PORT).await.unwrap();

    // The previous session is fully torn down before open returns
    let old_peer = h.peers.peer(0).unwrap();
    assert_eq!(old_peer.close_count(), 1);
    assert_eq!(next_frame(&mut old_endpoint).await, Some(Frame::normal_close()));
    assert_eq!(next_frame(&mut old_endpoint).await, None);

    let mut new_endpoint = accept(&mut h.listener).await;
    let offer = next_json(&mut new_endpoint).await;
    assert_eq!(offer["sdp"]["sdp"], h.peers.peer(1).unwrap().offer_sdp());

    assert_eq!(h.registry.len(), 1);
    assert_eq!(h.peers.created_count(), 2);
    let info = h.registry.session_info("gina_video").unwrap();
    assert_eq!(info.track_id, second.id());
}

#[tokio::test]
async fn test_stale_track_end_keeps_replacement() {
    let mut h = harness();
    let first = CapturedTrack::new(TrackKind::Video);
    let _old_endpoint = open_negotiating(&mut h, &first, "hank_video").await;

    let second = CapturedTrack::new(TrackKind::Video);
    h.registry.open(second, "hank_video", PORT).await.unwrap();
    let _new_endpoint = accept(&mut h.listener).await;

    first.stop();
    sleep(Duration::from_millis(50)).await;

    assert!(h.registry.is_active("hank_video"));
    assert_eq!(h.peers.peer(1).unwrap().close_count(), 0);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let mut h = harness();
    let track = CapturedTrack::new(TrackKind::Video);
    let mut endpoint = open_negotiating(&mut h, &track, "ivan_video").await;

    let state = h.registry.subscribe_state("ivan_video").unwrap();
    h.registry.close("ivan_video").await;

    assert!(!h.registry.is_active("ivan_video"));
    assert_eq!(*state.borrow(), SessionState::Closed);
    assert_eq!(next_frame(&mut endpoint).await, Some(Frame::normal_close()));

    h.registry.close("ivan_video").await;
    assert_eq!(h.peers.peer(0).unwrap().close_count(), 1);
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn test_track_end_removes_session() {
    let mut h = harness();
    let track = CapturedTrack::new(TrackKind::Audio);
    let mut endpoint = open_negotiating(&mut h, &track, "jane_audio").await;

    track.stop();
    wait_until(|| !h.registry.is_active("jane_audio")).await;

    assert_eq!(next_frame(&mut endpoint).await, Some(Frame::normal_close()));
    assert_eq!(h.peers.peer(0).unwrap().close_count(), 1);
}

#[tokio::test]
async fn test_server_close_removes_session() {
    let mut h = harness();
    let track = CapturedTrack::new(TrackKind::Video);
    let mut endpoint = open_negotiating(&mut h, &track, "kyle_video").await;

    endpoint.close(1000).unwrap();
    wait_until(|| !h.registry.is_active("kyle_video")).await;

    // The transport is already closed, so no close frame is echoed
    assert_eq!(next_frame(&mut endpoint).await, None);
    assert_eq!(h.peers.peer(0).unwrap().close_count(), 1);
}

#[tokio::test]
async fn test_transport_error_removes_session() {
    let mut h = harness();
    let track = CapturedTrack::new(TrackKind::Video);
    let endpoint = open_negotiating(&mut h, &track, "lena_video").await;

    endpoint.fail("connection reset").unwrap();
    wait_until(|| !h.registry.is_active("lena_video")).await;
    let peer = h.peers.peer(0).unwrap();
    wait_until(|| peer.close_count() == 1).await;
}

#[tokio::test]
async fn test_dial_failure_removes_session() {
    let h = harness();
    h.connector.set_refusing(true);
    let track = CapturedTrack::new(TrackKind::Video);

    h.registry.open(track, "mona_video", PORT).await.unwrap();
    wait_until(|| !h.registry.is_active("mona_video")).await;
    let peer = h.peers.peer(0).unwrap();
    wait_until(|| peer.close_count() == 1).await;
}

#[tokio::test]
async fn test_ended_track_never_dials() {
    let mut h = harness();
    let track = CapturedTrack::new(TrackKind::Video);
    track.stop();

    h.registry.open(track, "nate_video", PORT).await.unwrap();
    wait_until(|| !h.registry.is_active("nate_video")).await;
    assert!(h.listener.try_accept().is_none());
}

#[tokio::test]
async fn test_close_during_offer_sends_no_offer() {
    let mut h = harness();
    h.peers.set_offer_delay(Some(Duration::from_millis(200)));
    let track = CapturedTrack::new(TrackKind::Video);

    h.registry.open(track, "olga_video", PORT).await.unwrap();
    let mut endpoint = accept(&mut h.listener).await;
    h.registry.close("olga_video").await;

    assert_eq!(next_frame(&mut endpoint).await, Some(Frame::normal_close()));
    assert_eq!(next_frame(&mut endpoint).await, None);
}

#[tokio::test]
async fn test_server_close_during_offer_sends_no_offer() {
    let mut h = harness();
    h.peers.set_offer_delay(Some(Duration::from_millis(200)));
    let track = CapturedTrack::new(TrackKind::Video);

    h.registry.open(track, "quinn_video", PORT).await.unwrap();
    let mut endpoint = accept(&mut h.listener).await;
    endpoint.close(1000).unwrap();

    // Removed well before the delayed offer would have been created
    timeout(Duration::from_millis(150), async {
        while h.registry.is_active("quinn_video") {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session still registered");

    assert_eq!(next_frame(&mut endpoint).await, None);
    let peer = h.peers.peer(0).unwrap();
    wait_until(|| peer.close_count() == 1).await;
    assert!(!peer
        .calls()
        .iter()
        .any(|call| matches!(call, PeerCall::SetLocalDescription(_))));
}

#[tokio::test]
async fn test_closed_peer_skips_offer() {
    let mut h = harness();
    let track = CapturedTrack::new(TrackKind::Video);

    h.registry.open(track, "rosa_video", PORT).await.unwrap();
    let peer = h.peers.peer(0).unwrap();
    peer.set_signaling_state(SignalingState::Closed);

    let mut endpoint = accept(&mut h.listener).await;
    let frame = timeout(Duration::from_millis(150), endpoint.recv()).await;
    assert!(frame.is_err(), "unexpected frame {:?}", frame);

    assert!(!peer.calls().contains(&PeerCall::CreateOffer));
    assert!(h.registry.is_active("rosa_video"));
}

#[tokio::test]
async fn test_candidate_after_close_is_not_sent() {
    let mut h = harness();
    let track = CapturedTrack::new(TrackKind::Video);
    let mut endpoint = open_negotiating(&mut h, &track, "paul_video").await;

    h.registry.close("paul_video").await;
    h.peers
        .peer(0)
        .unwrap()
        .emit_candidate(Some(tilecast_signaling::IceCandidate {
            candidate: "candidate:late".to_string(),
            ..Default::default()
        }));

    assert_eq!(next_frame(&mut endpoint).await, Some(Frame::normal_close()));
    assert_eq!(next_frame(&mut endpoint).await, None);
}

#[tokio::test]
async fn test_peer_creation_failure_is_reported() {
    let h = harness();
    h.peers.fail_next(1);
    let track = CapturedTrack::new(TrackKind::Video);

    let err = h.registry.open(track.clone(), "quin_video", PORT).await.unwrap_err();
    assert_eq!(err.error_code(), "PEER_CONNECTION_ERROR");
    assert!(!h.registry.is_active("quin_video"));

    h.registry.open(track, "quin_video", PORT).await.unwrap();
    assert!(h.registry.is_active("quin_video"));
}

#[tokio::test]
async fn test_close_all_and_queries() {
    let mut h = harness();
    let video = CapturedTrack::new(TrackKind::Video);
    let audio = CapturedTrack::new(TrackKind::Audio);
    let mut video_endpoint = open_negotiating(&mut h, &video, "rita_video").await;
    let mut audio_endpoint = open_negotiating(&mut h, &audio, "rita_audio").await;

    assert_eq!(h.registry.active_streams(), vec!["rita_audio", "rita_video"]);
    assert_eq!(h.registry.session_info("rita_audio").unwrap().kind, TrackKind::Audio);

    h.registry.close_all().await;
    assert!(h.registry.is_empty());
    assert_eq!(next_frame(&mut video_endpoint).await, Some(Frame::normal_close()));
    assert_eq!(next_frame(&mut audio_endpoint).await, Some(Frame::normal_close()));
}
