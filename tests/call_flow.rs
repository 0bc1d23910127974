use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use lumicore::signaling::{
    self, IceCandidateInit, SdpKind, SessionDescription, SignalingCandidate, SignalingDocument,
};
use lumini::calls::{
    CallError, CallManager, CallManagerConfig, CallSession, LinkOp, SimulatedPeerLinkFactory,
};
use lumini::config::CallConfig;
use lumini::media::SimulatedMediaDevices;
use lumini::relay::{DocumentRelay, InMemoryRelay};
use lumini::{CallRole, CallStatus, ConversationId, EndCallReason, MediaKind, PeerId, SessionId};
use tokio::sync::broadcast::error::TryRecvError;

const CONVERSATION: &str = "c1";

struct Peer {
    session: Arc<CallSession>,
    media: SimulatedMediaDevices,
    links: SimulatedPeerLinkFactory,
}

fn quiet_config() -> CallConfig {
    CallConfig {
        ring_timeout_secs: None,
        ..Default::default()
    }
}

async fn peer(relay: &InMemoryRelay, id: &str) -> Peer {
    peer_with(relay, id, quiet_config(), SimulatedPeerLinkFactory::new(id)).await
}

async fn peer_with(
    relay: &InMemoryRelay,
    id: &str,
    config: CallConfig,
    links: SimulatedPeerLinkFactory,
) -> Peer {
    let media = SimulatedMediaDevices::new();
    let session = CallSession::builder(CONVERSATION, id)
        .with_relay(Arc::new(relay.clone()))
        .with_media_devices(Arc::new(media.clone()))
        .with_peer_links(Arc::new(links.clone()))
        .with_config(config)
        .attach()
        .await
        .expect("session attaches");
    Peer {
        session,
        media,
        links,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn wait_status(peer: &Peer, status: CallStatus) {
    let session = peer.session.clone();
    eventually(&format!("{} to be {status}", session.local_peer()), || {
        let session = session.clone();
        async move { session.status().await == status }
    })
    .await;
}

fn doc_key() -> String {
    signaling::call_document_key(&ConversationId::from(CONVERSATION))
}

fn candidates_key() -> String {
    signaling::candidate_collection_key(&ConversationId::from(CONVERSATION))
}

async fn stored_document(relay: &InMemoryRelay) -> Option<SignalingDocument> {
    relay
        .get(&doc_key())
        .await
        .unwrap()
        .map(|raw| SignalingDocument::from_document(&raw).unwrap())
}

/// Ring `callee` from `caller` and answer, returning once both are connected.
async fn connect(caller: &Peer, callee: &Peer, kind: MediaKind) {
    caller.session.start_call(kind).await.unwrap();
    wait_status(callee, CallStatus::Incoming).await;
    callee.session.answer_call().await.unwrap();
    wait_status(caller, CallStatus::Connected).await;
    wait_status(callee, CallStatus::Connected).await;
}

#[tokio::test]
async fn test_full_call_returns_both_sides_to_idle() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    let bob = peer(&relay, "bob").await;
    let mut incoming = bob.session.events().incoming_call.subscribe();
    let mut bob_ended = bob.session.events().call_ended.subscribe();

    alice.session.start_call(MediaKind::Audio).await.unwrap();
    assert_eq!(alice.session.status().await, CallStatus::Calling);
    wait_status(&bob, CallStatus::Incoming).await;

    let ring = incoming.recv().await.unwrap();
    assert_eq!(ring.caller, PeerId::from("alice"));
    assert_eq!(ring.media_kind, MediaKind::Audio);
    // nothing is captured until the callee answers
    assert_eq!(bob.media.acquired_tracks(), 0);
    assert!(bob.links.links().is_empty());

    bob.session.answer_call().await.unwrap();
    wait_status(&alice, CallStatus::Connected).await;
    assert_eq!(bob.session.status().await, CallStatus::Connected);

    let stored = stored_document(&relay).await.unwrap();
    assert_eq!(stored.answered_by, Some(PeerId::from("bob")));
    assert_eq!(stored.answer.as_ref().map(|a| a.kind), Some(SdpKind::Answer));

    // each side ends up applying the other's two trickled candidates
    let alice_link = alice.links.last_link().unwrap();
    let bob_link = bob.links.last_link().unwrap();
    eventually("candidates exchanged", || {
        let (a, b) = (alice_link.clone(), bob_link.clone());
        async move { a.applied_candidates().len() == 2 && b.applied_candidates().len() == 2 }
    })
    .await;
    assert!(
        alice_link
            .applied_candidates()
            .iter()
            .all(|c| c.ends_with("ufrag bob"))
    );

    let snapshot = alice.session.snapshot().await;
    assert_eq!(snapshot.role, Some(CallRole::Caller));
    assert_eq!(snapshot.remote_peer, Some(PeerId::from("bob")));
    assert!(snapshot.remote_description_set);

    alice.session.hang_up().await;
    wait_status(&bob, CallStatus::Idle).await;
    assert_eq!(alice.session.status().await, CallStatus::Idle);

    let ended = bob_ended.recv().await.unwrap();
    assert_eq!(ended.reason, EndCallReason::RemoteHangup);
    assert_eq!(ended.role, Some(CallRole::Callee));
    assert!(ended.duration_secs.is_some());

    for peer in [&alice, &bob] {
        let snapshot = peer.session.snapshot().await;
        assert!(!snapshot.has_local_media);
        assert!(!snapshot.has_peer_link);
        assert_eq!(peer.media.live_tracks(), 0);
        assert!(peer.links.last_link().unwrap().is_closed());
    }
    assert!(stored_document(&relay).await.is_none());
    assert_eq!(relay.collection_len(&candidates_key()).await, 0);
}

#[tokio::test]
async fn test_video_call_attaches_camera_and_toggles() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    let bob = peer(&relay, "bob").await;
    let mut alice_ended = alice.session.events().call_ended.subscribe();

    connect(&alice, &bob, MediaKind::Video).await;

    let bob_link = bob.links.last_link().unwrap();
    assert_eq!(bob_link.ops()[0], LinkOp::AttachMedia { tracks: 2 });
    assert_eq!(bob.session.snapshot().await.media_kind, Some(MediaKind::Video));
    assert!(bob.session.snapshot().await.video_enabled);

    assert!(!bob.session.toggle_video().await.unwrap());
    assert!(!bob.session.snapshot().await.video_enabled);
    assert!(bob.session.toggle_video().await.unwrap());

    assert!(alice.session.toggle_mute().await.unwrap());
    assert!(alice.session.snapshot().await.muted);
    assert!(!alice.session.toggle_mute().await.unwrap());

    bob.session.hang_up().await;
    alice_ended.recv().await.unwrap();
    assert_eq!(alice.session.status().await, CallStatus::Idle);
    assert_eq!(alice.media.live_tracks(), 0);
    assert_eq!(bob.media.live_tracks(), 0);
}

#[tokio::test]
async fn test_toggles_without_media() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    let bob = peer(&relay, "bob").await;

    assert!(matches!(
        alice.session.toggle_mute().await,
        Err(CallError::NoLocalMedia)
    ));

    // an audio call has no camera to turn on
    connect(&alice, &bob, MediaKind::Audio).await;
    assert!(!alice.session.toggle_video().await.unwrap());
    assert!(!alice.session.toggle_video().await.unwrap());
}

#[tokio::test]
async fn test_caller_hang_up_stops_ringing() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    let bob = peer(&relay, "bob").await;
    let mut bob_ended = bob.session.events().call_ended.subscribe();

    alice.session.start_call(MediaKind::Audio).await.unwrap();
    wait_status(&bob, CallStatus::Incoming).await;

    alice.session.hang_up().await;
    wait_status(&bob, CallStatus::Idle).await;

    let ended = bob_ended.recv().await.unwrap();
    assert_eq!(ended.reason, EndCallReason::RemoteHangup);
    assert_eq!(ended.duration_secs, None);
    assert_eq!(bob.media.acquired_tracks(), 0);
    assert!(bob.links.links().is_empty());
    assert!(stored_document(&relay).await.is_none());
}

#[tokio::test]
async fn test_candidates_wait_for_remote_description() {
    let relay = InMemoryRelay::new();
    let alice = peer_with(
        &relay,
        "alice",
        quiet_config(),
        SimulatedPeerLinkFactory::new("alice").with_local_candidates(0),
    )
    .await;
    let bob = peer_with(
        &relay,
        "bob",
        quiet_config(),
        SimulatedPeerLinkFactory::new("bob").with_local_candidates(0),
    )
    .await;

    alice.session.start_call(MediaKind::Audio).await.unwrap();
    wait_status(&bob, CallStatus::Incoming).await;
    let session_id = alice.session.snapshot().await.session_id.unwrap();

    let append = |candidate: &str, from: &str, session: SessionId| {
        let relay = relay.clone();
        let item = SignalingCandidate::new(
            IceCandidateInit::new(candidate),
            PeerId::from(from),
            session,
        );
        async move {
            relay
                .append(&candidates_key(), item.to_document().unwrap())
                .await
                .unwrap();
        }
    };
    for c in ["c1", "c2", "c3"] {
        append(c, "alice", session_id.clone()).await;
    }
    // neither an echo of bob's own candidates nor a leftover from an older
    // attempt is applied
    append("own", "bob", session_id.clone()).await;
    append("stale", "alice", SessionId::new("previous")).await;

    let session = bob.session.clone();
    eventually("three queued candidates", || {
        let session = session.clone();
        async move { session.snapshot().await.pending_candidates == 3 }
    })
    .await;

    bob.session.answer_call().await.unwrap();
    let link = bob.links.last_link().unwrap();
    assert_eq!(
        link.ops(),
        vec![
            LinkOp::AttachMedia { tracks: 1 },
            LinkOp::RemoteDescription(SdpKind::Offer),
            LinkOp::Candidate("c1".into()),
            LinkOp::Candidate("c2".into()),
            LinkOp::Candidate("c3".into()),
            LinkOp::LocalDescription(SdpKind::Answer),
        ]
    );

    append("c4", "alice", session_id.clone()).await;
    eventually("late candidate applied", || {
        let link = link.clone();
        async move { link.applied_candidates().len() == 4 }
    })
    .await;
    assert_eq!(link.applied_candidates(), vec!["c1", "c2", "c3", "c4"]);
    assert_eq!(bob.session.snapshot().await.pending_candidates, 0);
}

#[tokio::test]
async fn test_repeated_deletion_ends_once() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    let bob = peer(&relay, "bob").await;
    let mut bob_ended = bob.session.events().call_ended.subscribe();
    let mut alice_ended = alice.session.events().call_ended.subscribe();

    connect(&alice, &bob, MediaKind::Audio).await;
    alice.session.hang_up().await;
    alice.session.hang_up().await;
    wait_status(&bob, CallStatus::Idle).await;

    relay.redeliver(&doc_key()).await;
    relay.delete(&doc_key()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(bob.session.status().await, CallStatus::Idle);
    assert!(bob_ended.try_recv().is_ok());
    assert!(matches!(bob_ended.try_recv(), Err(TryRecvError::Empty)));
    assert!(alice_ended.try_recv().is_ok());
    assert!(matches!(alice_ended.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_own_offer_echo_is_not_an_incoming_call() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    let mut incoming = alice.session.events().incoming_call.subscribe();

    alice.session.start_call(MediaKind::Audio).await.unwrap();
    relay.redeliver(&doc_key()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(alice.session.status().await, CallStatus::Calling);
    assert!(matches!(incoming.try_recv(), Err(TryRecvError::Empty)));
    assert!(stored_document(&relay).await.unwrap().is_authored_by(&PeerId::from("alice")));
}

#[tokio::test]
async fn test_caller_media_denied() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    let mut failed = alice.session.events().call_failed.subscribe();
    alice.media.deny_permission(true);

    let result = alice.session.start_call(MediaKind::Video).await;
    assert!(matches!(result, Err(CallError::MediaAccessDenied(_))));
    assert_eq!(alice.session.status().await, CallStatus::Idle);
    assert!(alice.links.links().is_empty());
    assert!(stored_document(&relay).await.is_none());
    assert_eq!(
        failed.recv().await.unwrap().reason,
        EndCallReason::MediaAccessDenied
    );

    alice.media.deny_permission(false);
    alice.session.start_call(MediaKind::Audio).await.unwrap();
    assert_eq!(alice.session.status().await, CallStatus::Calling);
}

#[tokio::test]
async fn test_callee_media_denied_withdraws_call() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    let bob = peer(&relay, "bob").await;
    let mut alice_ended = alice.session.events().call_ended.subscribe();

    alice.session.start_call(MediaKind::Audio).await.unwrap();
    wait_status(&bob, CallStatus::Incoming).await;
    bob.media.deny_permission(true);

    let result = bob.session.answer_call().await;
    assert!(matches!(result, Err(CallError::MediaAccessDenied(_))));
    assert_eq!(bob.session.status().await, CallStatus::Idle);

    wait_status(&alice, CallStatus::Idle).await;
    assert_eq!(
        alice_ended.recv().await.unwrap().reason,
        EndCallReason::RemoteHangup
    );
    assert!(stored_document(&relay).await.is_none());
}

#[tokio::test]
async fn test_relay_unavailable_releases_everything() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    relay.set_unavailable(true);

    let result = alice.session.start_call(MediaKind::Audio).await;
    assert!(matches!(result, Err(CallError::SignalingUnavailable(_))));
    assert_eq!(alice.session.status().await, CallStatus::Idle);
    assert_eq!(alice.media.live_tracks(), 0);
    assert!(alice.links.last_link().unwrap().is_closed());
    assert!(!alice.session.snapshot().await.has_peer_link);
}

#[tokio::test]
async fn test_answer_after_someone_else_answered_is_stale() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    let bob = peer(&relay, "bob").await;

    alice.session.start_call(MediaKind::Audio).await.unwrap();
    wait_status(&bob, CallStatus::Incoming).await;

    let patch = SignalingDocument::answer_patch(
        &SessionDescription::answer("v=0\r\n"),
        &PeerId::from("carol"),
    )
    .unwrap();
    relay.update(&doc_key(), patch).await.unwrap();

    let result = bob.session.answer_call().await;
    assert!(matches!(result, Err(CallError::StaleOffer)));
    assert_eq!(bob.session.status().await, CallStatus::Idle);
    assert_eq!(bob.media.live_tracks(), 0);
    // the offer is not ours to withdraw
    assert!(stored_document(&relay).await.is_some());

    assert!(matches!(
        bob.session.answer_call().await,
        Err(CallError::NotRinging(CallStatus::Idle))
    ));
}

#[tokio::test]
async fn test_replaced_offer_rings_again() {
    let relay = InMemoryRelay::new();
    let bob = peer(&relay, "bob").await;
    let mut bob_ended = bob.session.events().call_ended.subscribe();

    let original = SignalingDocument::offer(
        SessionId::new("alice-1"),
        SessionDescription::offer("v=0\r\n"),
        MediaKind::Audio,
        PeerId::from("alice"),
    );
    relay
        .put(&doc_key(), original.to_document().unwrap())
        .await
        .unwrap();
    wait_status(&bob, CallStatus::Incoming).await;

    let replacement = SignalingDocument::offer(
        SessionId::new("carol-1"),
        SessionDescription::offer("v=0\r\n"),
        MediaKind::Video,
        PeerId::from("carol"),
    );
    relay
        .put(&doc_key(), replacement.to_document().unwrap())
        .await
        .unwrap();

    assert_eq!(
        bob_ended.recv().await.unwrap().reason,
        EndCallReason::StaleOffer
    );
    let session = bob.session.clone();
    eventually("the replacement to ring", || {
        let session = session.clone();
        async move { session.snapshot().await.remote_peer == Some(PeerId::from("carol")) }
    })
    .await;
    let snapshot = bob.session.snapshot().await;
    assert_eq!(snapshot.status, CallStatus::Incoming);
    assert_eq!(snapshot.session_id, Some(SessionId::new("carol-1")));
    assert_eq!(snapshot.media_kind, Some(MediaKind::Video));
}

#[tokio::test]
async fn test_calling_into_a_ringing_conversation_is_refused() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    let bob = peer(&relay, "bob").await;

    alice.session.start_call(MediaKind::Audio).await.unwrap();
    wait_status(&bob, CallStatus::Incoming).await;

    assert!(matches!(
        bob.session.start_call(MediaKind::Audio).await,
        Err(CallError::Busy(CallStatus::Incoming))
    ));
    assert!(matches!(
        alice.session.start_call(MediaKind::Audio).await,
        Err(CallError::Busy(CallStatus::Calling))
    ));
}

#[tokio::test]
async fn test_glare_lower_id_keeps_calling() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    let bob = peer(&relay, "bob").await;

    let (from_alice, from_bob) = tokio::join!(
        alice.session.start_call(MediaKind::Audio),
        bob.session.start_call(MediaKind::Audio),
    );
    from_alice.unwrap();
    // depending on interleaving bob saw alice's offer before dialing,
    // yielded while dialing, or yielded after publishing
    assert!(matches!(
        from_bob,
        Ok(()) | Err(CallError::Cancelled) | Err(CallError::CallInProgress)
    ));

    wait_status(&bob, CallStatus::Incoming).await;
    let alice_session = alice.session.snapshot().await.session_id.unwrap();
    let relay_check = relay.clone();
    let expected = alice_session.clone();
    eventually("alice's offer to win the document", || {
        let relay = relay_check.clone();
        let expected = expected.clone();
        async move {
            stored_document(&relay)
                .await
                .is_some_and(|doc| doc.session_id == expected)
        }
    })
    .await;
    assert_eq!(alice.session.status().await, CallStatus::Calling);
    assert_eq!(
        bob.session.snapshot().await.session_id,
        Some(alice_session)
    );

    bob.session.answer_call().await.unwrap();
    wait_status(&alice, CallStatus::Connected).await;
}

#[tokio::test]
async fn test_unanswered_call_times_out() {
    let relay = InMemoryRelay::new();
    let config = CallConfig {
        ring_timeout_secs: Some(1),
        ..Default::default()
    };
    let alice = peer_with(&relay, "alice", config, SimulatedPeerLinkFactory::new("alice")).await;
    let bob = peer(&relay, "bob").await;
    let mut alice_ended = alice.session.events().call_ended.subscribe();

    alice.session.start_call(MediaKind::Audio).await.unwrap();
    wait_status(&bob, CallStatus::Incoming).await;

    let ended = tokio::time::timeout(Duration::from_secs(5), alice_ended.recv())
        .await
        .expect("ring timeout fires")
        .unwrap();
    assert_eq!(ended.reason, EndCallReason::Timeout);
    assert_eq!(alice.session.status().await, CallStatus::Idle);
    wait_status(&bob, CallStatus::Idle).await;
    assert!(stored_document(&relay).await.is_none());
}

#[tokio::test]
async fn test_link_failure_ends_call() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    let bob = peer(&relay, "bob").await;
    let mut failed = alice.session.events().call_failed.subscribe();
    let mut alice_ended = alice.session.events().call_ended.subscribe();
    let mut bob_ended = bob.session.events().call_ended.subscribe();

    connect(&alice, &bob, MediaKind::Audio).await;
    alice.links.last_link().unwrap().fail();

    assert_eq!(
        failed.recv().await.unwrap().reason,
        EndCallReason::NegotiationFailed
    );
    assert_eq!(
        alice_ended.recv().await.unwrap().reason,
        EndCallReason::NegotiationFailed
    );
    assert_eq!(
        bob_ended.recv().await.unwrap().reason,
        EndCallReason::RemoteHangup
    );
    assert_eq!(alice.session.status().await, CallStatus::Idle);
    assert_eq!(bob.session.status().await, CallStatus::Idle);
    assert_eq!(alice.media.live_tracks(), 0);
    assert_eq!(bob.media.live_tracks(), 0);
}

#[tokio::test]
async fn test_link_construction_failure() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    alice.links.fail_create(true);

    let result = alice.session.start_call(MediaKind::Audio).await;
    assert!(matches!(result, Err(CallError::NegotiationFailed(_))));
    assert_eq!(alice.session.status().await, CallStatus::Idle);
    assert_eq!(alice.media.live_tracks(), 0);
}

#[tokio::test]
async fn test_hang_up_during_media_prompt() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    alice.media.set_acquire_delay(Duration::from_millis(100));

    let session = alice.session.clone();
    let call = tokio::spawn(async move { session.start_call(MediaKind::Audio).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    alice.session.hang_up().await;

    assert!(matches!(call.await.unwrap(), Err(CallError::Cancelled)));
    assert_eq!(alice.session.status().await, CallStatus::Idle);
    assert_eq!(alice.media.live_tracks(), 0);
    let links = alice.links.clone();
    eventually("the abandoned link to close", || {
        let links = links.clone();
        async move { links.links().iter().all(|link| link.is_closed()) }
    })
    .await;
    assert!(stored_document(&relay).await.is_none());
}

#[tokio::test]
async fn test_manager_allows_one_call_at_a_time() {
    let relay = InMemoryRelay::new();
    let manager = CallManager::new(
        "alice",
        Arc::new(relay.clone()),
        Arc::new(SimulatedMediaDevices::new()),
        Arc::new(SimulatedPeerLinkFactory::new("alice")),
        CallManagerConfig {
            call: quiet_config(),
            ..Default::default()
        },
    );
    let first = ConversationId::from("c1");
    let second = ConversationId::from("c2");

    let session = manager.start_call(&first, MediaKind::Audio).await.unwrap();
    assert!(Arc::ptr_eq(&session, &manager.session(&first).await.unwrap()));
    assert!(matches!(
        manager.start_call(&second, MediaKind::Audio).await,
        Err(CallError::Busy(CallStatus::Calling))
    ));
    assert_eq!(manager.active_calls().await.len(), 1);

    manager.shutdown().await;
    assert_eq!(session.status().await, CallStatus::Idle);
    assert!(manager.get(&first).is_none());
    assert!(stored_document(&relay).await.is_none());
}

#[tokio::test]
async fn test_redelivered_candidates_apply_once() {
    let relay = InMemoryRelay::new();
    let alice = peer_with(
        &relay,
        "alice",
        quiet_config(),
        SimulatedPeerLinkFactory::new("alice").with_local_candidates(0),
    )
    .await;
    let bob = peer_with(
        &relay,
        "bob",
        quiet_config(),
        SimulatedPeerLinkFactory::new("bob").with_local_candidates(0),
    )
    .await;

    alice.session.start_call(MediaKind::Audio).await.unwrap();
    wait_status(&bob, CallStatus::Incoming).await;
    let session_id = alice.session.snapshot().await.session_id.unwrap();
    let append = |candidate: &str| {
        let relay = relay.clone();
        let item = SignalingCandidate::new(
            IceCandidateInit::new(candidate),
            PeerId::from("alice"),
            session_id.clone(),
        );
        async move {
            relay
                .append(&candidates_key(), item.to_document().unwrap())
                .await
                .unwrap();
        }
    };

    append("c1").await;
    append("c2").await;
    let session = bob.session.clone();
    eventually("two queued candidates", || {
        let session = session.clone();
        async move { session.snapshot().await.pending_candidates == 2 }
    })
    .await;
    relay.redeliver_collection(&candidates_key()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.session.snapshot().await.pending_candidates, 2);

    bob.session.answer_call().await.unwrap();
    let link = bob.links.last_link().unwrap();
    append("c3").await;
    eventually("the late candidate", || {
        let link = link.clone();
        async move { link.applied_candidates().len() == 3 }
    })
    .await;

    relay.redeliver_collection(&candidates_key()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(link.applied_candidates(), vec!["c1", "c2", "c3"]);
}

#[tokio::test]
async fn test_own_leftover_document_does_not_ring() {
    let relay = InMemoryRelay::new();
    let alice = peer(&relay, "alice").await;
    let mut incoming = alice.session.events().incoming_call.subscribe();

    // an offer alice published in an earlier run, never cleaned up
    let leftover = SignalingDocument::offer(
        SessionId::new("alice-old"),
        SessionDescription::offer("v=0\r\n"),
        MediaKind::Audio,
        PeerId::from("alice"),
    );
    relay
        .put(&doc_key(), leftover.to_document().unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(alice.session.status().await, CallStatus::Idle);
    assert!(matches!(incoming.try_recv(), Err(TryRecvError::Empty)));

    // and it does not block a new call either
    alice.session.start_call(MediaKind::Audio).await.unwrap();
    let stored = stored_document(&relay).await.unwrap();
    assert_ne!(stored.session_id, SessionId::new("alice-old"));
}

#[tokio::test]
async fn test_manager_with_no_call_capacity_refuses_calls() {
    let relay = InMemoryRelay::new();
    let manager = CallManager::new(
        "alice",
        Arc::new(relay.clone()),
        Arc::new(SimulatedMediaDevices::new()),
        Arc::new(SimulatedPeerLinkFactory::new("alice")),
        CallManagerConfig {
            call: quiet_config(),
            max_concurrent_calls: 0,
        },
    );

    let result = manager
        .start_call(&ConversationId::from(CONVERSATION), MediaKind::Audio)
        .await;
    assert!(matches!(result, Err(CallError::CallsDisabled)));
    assert!(manager.active_calls().await.is_empty());
    assert!(stored_document(&relay).await.is_none());
}
