//! Roster reconciliation and the publish lifecycle through the full
//! session surface.

mod support;

use std::sync::Arc;
use std::time::Duration;

use roomlink::events::SessionEvent;
use roomlink::proto::{Envelope, TrackInfo, TrackKind};
use roomlink::session::Session;
use roomlink::signaling::stream::MemoryControlStream;
use roomlink::signaling::ControlStream;
use roomlink::track::LocalTrack;
use roomlink::SessionConfig;

use support::*;

async fn connected_session(
    others: Vec<roomlink::proto::ParticipantInfo>,
) -> (
    Session,
    tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
    MemoryControlStream,
) {
    let (dialer, mut server_rx) = ScriptedDialer::new(1);
    let (factory, _transports, _sent) = fake_transport_factory();
    let config = SessionConfig::default()
        .with_dialer(dialer)
        .with_transport_factory(factory)
        .with_join_timeout(Duration::from_secs(1));

    let server_task = tokio::spawn(async move {
        let server = server_rx.recv().await.unwrap();
        serve_join(&server, join_response(others)).await;
        server
    });
    let (session, mut events) = Session::connect("ws://test", "tok", config).await.unwrap();
    let server = server_task.await.unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    (session, events, server)
}

#[tokio::test]
async fn test_join_roster_raises_events_and_auto_subscribes() {
    let others = vec![participant("PA_x", vec![remote_track("PA_x", "TR_1")])];
    let (_session, mut events, server) = connected_session(others).await;

    match next_event(&mut events).await {
        SessionEvent::ParticipantJoined { sid, identity, .. } => {
            assert_eq!(sid, "PA_x");
            assert_eq!(identity, "pa_x");
        }
        other => panic!("unexpected event {}", other.name()),
    }
    match next_event(&mut events).await {
        SessionEvent::TrackPublished { track, .. } => assert_eq!(track.track_id, "TR_1"),
        other => panic!("unexpected event {}", other.name()),
    }

    // auto_subscribe turns the announcement into a subscription request
    match recv_matching(&server, |e| matches!(e, Envelope::SubscriptionUpdate { .. })).await {
        Envelope::SubscriptionUpdate {
            track_ids,
            subscribe,
        } => {
            assert_eq!(track_ids, vec!["TR_1".to_string()]);
            assert!(subscribe);
        }
        _ => unreachable!(),
    }
    assert!(matches!(
        wait_for_event(&mut events, |e| matches!(e, SessionEvent::TrackSubscribed { .. })).await,
        SessionEvent::TrackSubscribed { .. }
    ));
}

#[tokio::test]
async fn test_participant_departure_retires_tracks_in_order() {
    let others = vec![participant("PA_x", vec![remote_track("PA_x", "TR_1")])];
    let (_session, mut events, server) = connected_session(others).await;

    // Wait for the auto-subscription to land before the departure
    wait_for_event(&mut events, |e| matches!(e, SessionEvent::TrackSubscribed { .. })).await;

    server
        .send(Envelope::ParticipantUpdate(vec![departed("PA_x")]))
        .await
        .unwrap();

    // Unsubscribe strictly precedes unpublish, then the participant leaves
    match wait_for_event(&mut events, |e| {
        matches!(
            e,
            SessionEvent::TrackUnsubscribed { .. }
                | SessionEvent::TrackUnpublished { .. }
                | SessionEvent::ParticipantLeft { .. }
        )
    })
    .await
    {
        SessionEvent::TrackUnsubscribed { track_id } => assert_eq!(track_id, "TR_1"),
        other => panic!("expected unsubscribe first, got {}", other.name()),
    }
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::TrackUnpublished { .. }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ParticipantLeft { .. }
    ));
}

#[tokio::test]
async fn test_duplicate_roster_push_is_silent() {
    let others = vec![participant("PA_x", vec![remote_track("PA_x", "TR_1")])];
    let (_session, mut events, server) = connected_session(others).await;

    wait_for_event(&mut events, |e| matches!(e, SessionEvent::TrackSubscribed { .. })).await;

    // The same roster again, then a fresh track as an ordering fence
    server
        .send(Envelope::ParticipantUpdate(vec![participant(
            "PA_x",
            vec![remote_track("PA_x", "TR_1")],
        )]))
        .await
        .unwrap();
    server
        .send(Envelope::TrackPublished(remote_track("PA_x", "TR_2")))
        .await
        .unwrap();

    // Nothing from the duplicate push; the next event is the new track
    match next_event(&mut events).await {
        SessionEvent::TrackPublished { track, .. } => assert_eq!(track.track_id, "TR_2"),
        other => panic!("duplicate roster push leaked event {}", other.name()),
    }
}

#[tokio::test]
async fn test_mute_push_raises_event() {
    let others = vec![participant("PA_x", vec![remote_track("PA_x", "TR_1")])];
    let (_session, mut events, server) = connected_session(others).await;

    server
        .send(Envelope::Mute {
            track_id: "TR_1".to_string(),
            muted: true,
        })
        .await
        .unwrap();
    match wait_for_event(&mut events, |e| matches!(e, SessionEvent::TrackMuted { .. })).await {
        SessionEvent::TrackMuted { track_id } => assert_eq!(track_id, "TR_1"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_publish_unpublish_republish_lifecycle() {
    let (session, mut _events, server) = connected_session(vec![]).await;

    let publisher = session.clone();
    let publish =
        tokio::spawn(async move { publisher.publish(LocalTrack::new(TrackKind::Video, "cam")).await });
    let first_cid = match recv_matching(&server, |e| matches!(e, Envelope::AddTrack(_))).await {
        Envelope::AddTrack(req) => {
            assert_eq!(req.kind, TrackKind::Video);
            req.cid
        }
        _ => unreachable!(),
    };
    server
        .send(Envelope::TrackPublished(TrackInfo {
            track_id: "TR_srv1".to_string(),
            cid: first_cid.clone(),
            kind: TrackKind::Video,
            name: "cam".to_string(),
            muted: false,
            participant_sid: "PA_local".to_string(),
        }))
        .await
        .unwrap();
    assert_eq!(publish.await.unwrap().unwrap(), "TR_srv1");

    session.unpublish("TR_srv1");
    match recv_matching(&server, |e| matches!(e, Envelope::TrackUnpublished { .. })).await {
        Envelope::TrackUnpublished { track_id } => assert_eq!(track_id, "TR_srv1"),
        _ => unreachable!(),
    }

    // Republishing after the unpublish gets a fresh cid and a fresh ack
    let publisher = session.clone();
    let publish =
        tokio::spawn(async move { publisher.publish(LocalTrack::new(TrackKind::Video, "cam")).await });
    let second_cid = match recv_matching(&server, |e| matches!(e, Envelope::AddTrack(_))).await {
        Envelope::AddTrack(req) => req.cid,
        _ => unreachable!(),
    };
    assert_ne!(second_cid, first_cid);
    server
        .send(Envelope::TrackPublished(TrackInfo {
            track_id: "TR_srv2".to_string(),
            cid: second_cid,
            kind: TrackKind::Video,
            name: "cam".to_string(),
            muted: false,
            participant_sid: "PA_local".to_string(),
        }))
        .await
        .unwrap();
    assert_eq!(publish.await.unwrap().unwrap(), "TR_srv2");
}

#[tokio::test]
async fn test_publish_ack_timeout() {
    let (dialer, mut server_rx) = ScriptedDialer::new(1);
    let (factory, _transports, _sent) = fake_transport_factory();
    let config = SessionConfig::default()
        .with_dialer(dialer)
        .with_transport_factory(factory)
        .with_join_timeout(Duration::from_secs(1))
        .with_publish_timeout(Duration::from_millis(50));

    let server_task = tokio::spawn(async move {
        let server = server_rx.recv().await.unwrap();
        serve_join(&server, join_response(vec![])).await;
        server
    });
    let (session, _events) = Session::connect("ws://test", "tok", config).await.unwrap();
    let server = server_task.await.unwrap();

    // Server receives the request but never acknowledges it
    let err = session
        .publish(LocalTrack::new(TrackKind::Audio, "mic"))
        .await
        .unwrap_err();
    assert!(matches!(err, roomlink::PublishError::AckTimeout));
    drop(server);
}
