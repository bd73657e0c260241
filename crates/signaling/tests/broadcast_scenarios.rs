//! End-to-end broadcast scenarios against the loopback media engine

use futures::future::join_all;
use one2many_signaling::coordinator::SignalingCoordinator;
use one2many_signaling::media::loopback::LoopbackEngine;
use one2many_signaling::media::IceCandidate;
use one2many_signaling::session::{PeerHandle, SessionState};
use one2many_signaling::signaling::{CandidateRole, ServerMessage};
use one2many_signaling::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("one2many_signaling=debug")
        .with_test_writer()
        .try_init();
}

fn setup() -> (Arc<SignalingCoordinator>, LoopbackEngine) {
    init_tracing();
    let engine = LoopbackEngine::new();
    let coordinator = SignalingCoordinator::new(Arc::new(engine.clone()), "loopback://");
    (Arc::new(coordinator), engine)
}

fn peer(id: &str) -> (PeerHandle, mpsc::UnboundedReceiver<ServerMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PeerHandle::new(id.to_string(), tx), rx)
}

fn stop_count(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> usize {
    let mut count = 0;
    while let Ok(message) = rx.try_recv() {
        if message == ServerMessage::StopCommunication {
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn presenter_viewer_then_presenter_stop() {
    let (coordinator, engine) = setup();
    let (p, _prx) = peer("presenter");
    let (v1, mut v1rx) = peer("viewer-1");

    let answer = coordinator
        .handle_presenter_request("room", p, "A")
        .await
        .unwrap();
    assert!(!answer.is_empty());
    assert_eq!(coordinator.session_state("room").await, SessionState::Live);
    let presenter_endpoint = coordinator.presenter_endpoint_id("room").await.unwrap();
    assert_eq!(engine.offers_of(&presenter_endpoint), vec!["A"]);

    coordinator
        .handle_viewer_request("room", v1, "B")
        .await
        .unwrap();
    let viewer_endpoint = coordinator
        .viewer_endpoint_id("room", "viewer-1")
        .await
        .unwrap();
    assert_eq!(engine.offers_of(&viewer_endpoint), vec!["B"]);
    assert_eq!(engine.sinks_of(&presenter_endpoint), vec![viewer_endpoint.clone()]);
    assert!(engine.sinks_of(&viewer_endpoint).is_empty());

    coordinator.handle_stop("room", "presenter").await;

    assert_eq!(v1rx.recv().await.unwrap(), ServerMessage::StopCommunication);
    assert!(!coordinator.registry().contains("room"));
    assert!(engine.is_released(&presenter_endpoint));
    assert!(engine.is_released(&viewer_endpoint));
    assert_eq!(engine.live_pipelines(), 0);
    assert!(!coordinator.engine().is_connected().await);
}

#[tokio::test]
async fn concurrent_presenters_yield_one_acceptance() {
    let (coordinator, engine) = setup();
    engine.set_delay(Duration::from_millis(10));

    let requests = (0..8).map(|i| {
        let coordinator = Arc::clone(&coordinator);
        let (p, rx) = peer(&format!("presenter-{}", i));
        async move {
            let _rx = rx;
            coordinator.handle_presenter_request("room", p, "offer").await
        }
    });
    let results = join_all(requests).await;

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(Error::PresenterAlreadyActive)))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(rejected, 7);
    assert_eq!(engine.stats().pipelines_created, 1);
}

#[tokio::test]
async fn early_viewer_candidate_is_flushed_first() {
    let (coordinator, engine) = setup();
    let (p, _prx) = peer("presenter");
    let (v, _vrx) = peer("viewer");

    coordinator
        .handle_presenter_request("room", p, "A")
        .await
        .unwrap();
    coordinator
        .handle_ice_candidate(CandidateRole::Subscriber, "room", "viewer", IceCandidate::new("early-1"))
        .await
        .unwrap();
    coordinator
        .handle_ice_candidate(CandidateRole::Subscriber, "room", "viewer", IceCandidate::new("early-2"))
        .await
        .unwrap();

    coordinator
        .handle_viewer_request("room", v, "B")
        .await
        .unwrap();
    coordinator
        .handle_ice_candidate(CandidateRole::Subscriber, "room", "viewer", IceCandidate::new("late"))
        .await
        .unwrap();

    let viewer_endpoint = coordinator
        .viewer_endpoint_id("room", "viewer")
        .await
        .unwrap();
    let delivered: Vec<String> = engine
        .candidates_of(&viewer_endpoint)
        .into_iter()
        .map(|c| c.candidate)
        .collect();
    assert_eq!(delivered, vec!["early-1", "early-2", "late"]);

    let presenter_endpoint = coordinator.presenter_endpoint_id("room").await.unwrap();
    assert!(engine.candidates_of(&presenter_endpoint).is_empty());
}

#[tokio::test]
async fn presenter_candidates_during_negotiation_are_flushed() {
    let (coordinator, engine) = setup();
    engine.set_delay(Duration::from_millis(20));
    let (p, _prx) = peer("presenter");

    let reservation = coordinator.reserve_presenter("room", p).await.unwrap();
    let negotiation = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.negotiate_presenter(reservation, "A").await })
    };
    coordinator
        .handle_ice_candidate(CandidateRole::Publisher, "room", "presenter", IceCandidate::new("c1"))
        .await
        .unwrap();

    negotiation.await.unwrap().unwrap();
    coordinator
        .handle_ice_candidate(CandidateRole::Publisher, "room", "presenter", IceCandidate::new("c2"))
        .await
        .unwrap();

    let endpoint = coordinator.presenter_endpoint_id("room").await.unwrap();
    let delivered: Vec<String> = engine
        .candidates_of(&endpoint)
        .into_iter()
        .map(|c| c.candidate)
        .collect();
    assert_eq!(delivered, vec!["c1", "c2"]);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (coordinator, engine) = setup();
    let (p, _prx) = peer("presenter");

    coordinator
        .handle_presenter_request("room", p, "A")
        .await
        .unwrap();

    coordinator.handle_stop("room", "presenter").await;
    let stats = engine.stats();
    coordinator.handle_stop("room", "presenter").await;
    coordinator.handle_stop("never-existed", "nobody").await;

    assert_eq!(engine.stats(), stats);
    assert!(coordinator.registry().is_empty());
    assert_eq!(coordinator.session_state("room").await, SessionState::Idle);
}

#[tokio::test]
async fn presenter_teardown_notifies_each_viewer_once() {
    let (coordinator, engine) = setup();
    let (p, _prx) = peer("presenter");
    coordinator
        .handle_presenter_request("room", p, "A")
        .await
        .unwrap();

    let mut receivers = Vec::new();
    for i in 0..3 {
        let (v, rx) = peer(&format!("viewer-{}", i));
        coordinator
            .handle_viewer_request("room", v, "B")
            .await
            .unwrap();
        receivers.push(rx);
    }
    assert_eq!(coordinator.viewer_count("room").await, 3);

    coordinator.handle_stop("room", "presenter").await;
    coordinator.handle_stop("room", "presenter").await;
    for i in 0..3 {
        coordinator.handle_stop("room", &format!("viewer-{}", i)).await;
    }

    for rx in receivers.iter_mut() {
        assert_eq!(stop_count(rx), 1);
    }
    assert_eq!(coordinator.viewer_count("room").await, 0);
    assert_eq!(engine.live_pipelines(), 0);
}

#[tokio::test]
async fn viewer_without_presenter_is_rejected() {
    let (coordinator, engine) = setup();
    let (v, _vrx) = peer("viewer");

    let err = coordinator
        .handle_viewer_request("room", v, "B")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoActivePresenter));
    assert_eq!(err.to_string(), "No active presenter. Try again later...");
    assert_eq!(coordinator.viewer_count("room").await, 0);
    assert!(coordinator.registry().is_empty());
    assert_eq!(engine.stats().endpoints_created, 0);
}

#[tokio::test]
async fn stop_during_presenter_request_cancels_it() {
    let (coordinator, engine) = setup();
    engine.set_delay(Duration::from_millis(20));
    let (p, _prx) = peer("presenter");

    let reservation = coordinator.reserve_presenter("room", p).await.unwrap();
    assert_eq!(coordinator.session_state("room").await, SessionState::Negotiating);
    let negotiation = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.negotiate_presenter(reservation, "A").await })
    };
    coordinator.handle_stop("room", "presenter").await;

    let err = negotiation.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::SessionInvalidated));
    assert!(coordinator.registry().is_empty());
    assert_eq!(engine.live_pipelines(), 0);
    assert!(!coordinator.engine().is_connected().await);
}

#[tokio::test]
async fn presenter_stop_during_viewer_request_cancels_viewer() {
    let (coordinator, engine) = setup();
    let (p, _prx) = peer("presenter");
    let (v, mut vrx) = peer("viewer");

    coordinator
        .handle_presenter_request("room", p, "A")
        .await
        .unwrap();
    engine.set_delay(Duration::from_millis(20));

    let reservation = coordinator.reserve_viewer("room", v).await.unwrap();
    let negotiation = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.negotiate_viewer(reservation, "B").await })
    };
    coordinator.handle_stop("room", "presenter").await;

    let err = negotiation.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::SessionInvalidated));
    assert_eq!(stop_count(&mut vrx), 1);
    assert!(coordinator.registry().is_empty());
    assert_eq!(engine.live_pipelines(), 0);
}

#[tokio::test]
async fn new_presenter_after_teardown_reconnects_engine() {
    let (coordinator, engine) = setup();
    let (p1, _rx1) = peer("p1");
    let (p2, _rx2) = peer("p2");

    coordinator
        .handle_presenter_request("room", p1, "A")
        .await
        .unwrap();
    coordinator.handle_stop("room", "p1").await;
    coordinator
        .handle_presenter_request("room", p2, "A")
        .await
        .unwrap();

    let stats = engine.stats();
    assert_eq!(stats.connects, 2);
    assert_eq!(stats.closes, 1);
    assert_eq!(coordinator.session_state("room").await, SessionState::Live);
}

#[tokio::test]
async fn sessions_are_isolated() {
    let (coordinator, engine) = setup();
    let (a, _arx) = peer("a");
    let (b, _brx) = peer("b");

    coordinator
        .handle_presenter_request("room-a", a, "A")
        .await
        .unwrap();
    coordinator
        .handle_presenter_request("room-b", b, "A")
        .await
        .unwrap();
    assert_eq!(coordinator.registry().len(), 2);

    coordinator.handle_stop("room-a", "a").await;

    assert_eq!(coordinator.session_state("room-b").await, SessionState::Live);
    assert!(coordinator.engine().is_connected().await);
    assert_eq!(engine.live_pipelines(), 1);
}

#[tokio::test]
async fn lost_engine_connection_is_replaced_for_next_presenter() {
    let (coordinator, engine) = setup();
    let (a, _arx) = peer("a");
    let (b, _brx) = peer("b");

    coordinator
        .handle_presenter_request("room-a", a, "A")
        .await
        .unwrap();
    engine.drop_connections();

    coordinator
        .handle_presenter_request("room-b", b, "A")
        .await
        .unwrap();

    assert_eq!(engine.stats().connects, 2);
    assert_eq!(coordinator.session_state("room-a").await, SessionState::Live);
    assert_eq!(coordinator.session_state("room-b").await, SessionState::Live);
}
