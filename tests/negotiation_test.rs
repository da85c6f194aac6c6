//! Negotiation serialization, candidate buffering, and data-channel
//! plumbing through the full session surface.

mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use roomlink::events::SessionEvent;
use roomlink::proto::{
    decode_packet, encode_packet, DataPacket, Envelope, IceCandidate, LegKind, SessionDescription,
    TrackInfo, TrackKind, TrickleCandidate,
};
use roomlink::session::Session;
use roomlink::signaling::stream::MemoryControlStream;
use roomlink::signaling::ControlStream;
use roomlink::track::LocalTrack;
use roomlink::SessionConfig;

use support::*;

async fn connected_session() -> (
    Session,
    tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
    MemoryControlStream,
    Arc<FakeTransport>,
    Arc<FakeTransport>,
    tokio::sync::mpsc::UnboundedReceiver<(String, Bytes)>,
) {
    let (dialer, mut server_rx) = ScriptedDialer::new(1);
    let (factory, mut transports, sent_rx) = fake_transport_factory();
    let config = SessionConfig::default()
        .with_dialer(dialer)
        .with_transport_factory(factory)
        .with_join_timeout(Duration::from_secs(1));

    let server_task = tokio::spawn(async move {
        let server = server_rx.recv().await.unwrap();
        serve_join(&server, join_response(vec![])).await;
        server
    });
    let (session, mut events) = Session::connect("ws://test", "tok", config).await.unwrap();
    let server = server_task.await.unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));

    // The engine builds the publish leg first
    let publish = transports.recv().await.unwrap();
    assert_eq!(publish.kind, LegKind::Publish);
    let subscribe = transports.recv().await.unwrap();
    assert_eq!(subscribe.kind, LegKind::Subscribe);

    (session, events, server, publish, subscribe, sent_rx)
}

fn ack(cid: String, track_id: &str) -> Envelope {
    Envelope::TrackPublished(TrackInfo {
        track_id: track_id.to_string(),
        cid,
        kind: TrackKind::Audio,
        name: "mic".to_string(),
        muted: false,
        participant_sid: "PA_local".to_string(),
    })
}

#[tokio::test]
async fn test_publish_triggers_coalesce_into_one_follow_up() {
    let (session, mut events, server, publish_leg, _sub, _sent) = connected_session().await;

    // The session opens the publish leg right after joining
    let initial = recv_matching(&server, |e| matches!(e, Envelope::Offer(_))).await;
    match initial {
        Envelope::Offer(SessionDescription { leg, .. }) => assert_eq!(leg, LegKind::Publish),
        _ => unreachable!(),
    }
    assert_eq!(publish_leg.offer_count(), 1);

    // Two publish acknowledgments land while that offer is unanswered;
    // both triggers coalesce
    for (n, track_id) in [("1", "TR_srv1"), ("2", "TR_srv2")] {
        let publisher = session.clone();
        let name = format!("mic{}", n);
        let publish =
            tokio::spawn(async move { publisher.publish(LocalTrack::new(TrackKind::Audio, name)).await });
        let cid = match recv_matching(&server, |e| matches!(e, Envelope::AddTrack(_))).await {
            Envelope::AddTrack(req) => req.cid,
            _ => unreachable!(),
        };
        server.send(ack(cid, track_id)).await.unwrap();
        publish.await.unwrap().unwrap();
    }
    assert_eq!(publish_leg.offer_count(), 1, "triggers must coalesce");

    // Completing the cycle releases exactly one follow-up offer
    server
        .send(Envelope::Answer(SessionDescription {
            leg: LegKind::Publish,
            sdp: "answer-1".to_string(),
        }))
        .await
        .unwrap();
    match recv_matching(&server, |e| matches!(e, Envelope::Offer(_))).await {
        Envelope::Offer(SessionDescription { leg, .. }) => assert_eq!(leg, LegKind::Publish),
        _ => unreachable!(),
    }
    assert_eq!(publish_leg.offer_count(), 2);

    // Answering the follow-up leaves nothing pending
    server
        .send(Envelope::Answer(SessionDescription {
            leg: LegKind::Publish,
            sdp: "answer-2".to_string(),
        }))
        .await
        .unwrap();
    // Fence: a further ack-free frame round-trip proves no extra offer ran
    server
        .send(Envelope::SpeakerUpdate(vec![]))
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::ActiveSpeakersChanged { .. })
    })
    .await;
    assert_eq!(publish_leg.offer_count(), 2);
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("c{}", n),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

#[tokio::test]
async fn test_early_candidates_buffer_until_remote_offer() {
    let (_session, mut events, server, _pub, subscribe_leg, _sent) = connected_session().await;

    // Candidates trickle in before the subscribe-leg offer
    for n in [1, 2] {
        server
            .send(Envelope::Trickle(TrickleCandidate {
                leg: LegKind::Subscribe,
                candidate: candidate(n),
            }))
            .await
            .unwrap();
    }
    server
        .send(Envelope::Offer(SessionDescription {
            leg: LegKind::Subscribe,
            sdp: "server-offer".to_string(),
        }))
        .await
        .unwrap();

    // The client answers on the subscribe leg
    match recv_matching(&server, |e| matches!(e, Envelope::Answer(_))).await {
        Envelope::Answer(SessionDescription { leg, .. }) => assert_eq!(leg, LegKind::Subscribe),
        _ => unreachable!(),
    }

    // A post-description candidate bypasses the buffer
    server
        .send(Envelope::Trickle(TrickleCandidate {
            leg: LegKind::Subscribe,
            candidate: candidate(3),
        }))
        .await
        .unwrap();
    server.send(Envelope::SpeakerUpdate(vec![])).await.unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::ActiveSpeakersChanged { .. })
    })
    .await;

    let calls = subscribe_leg.calls.lock().clone();
    let relevant: Vec<&String> = calls
        .iter()
        .filter(|c| c.starts_with("candidate:") || c.starts_with("set_remote:") || *c == "create_answer")
        .collect();
    assert_eq!(
        relevant,
        [
            "set_remote:Offer",
            "candidate:c1",
            "candidate:c2",
            "create_answer",
            "candidate:c3"
        ],
        "buffered candidates must drain in order after the remote description"
    );
}

#[tokio::test]
async fn test_data_send_and_receive() {
    let (session, mut events, _server, publish_leg, _sub, mut sent_rx) = connected_session().await;

    session.send_data(Bytes::from_static(b"hello"), false);
    let (label, frame) = tokio::time::timeout(Duration::from_secs(5), sent_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(label, "_reliable");
    match decode_packet(&frame).unwrap() {
        DataPacket::User { payload, .. } => assert_eq!(payload, b"hello"),
        _ => panic!("expected user packet"),
    }

    session.send_data(Bytes::from_static(b"fast"), true);
    let (label, _) = tokio::time::timeout(Duration::from_secs(5), sent_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(label, "_lossy");

    // Inbound path: an injected packet surfaces as a data event
    let inbound = encode_packet(&DataPacket::User {
        participant_sid: Some("PA_x".to_string()),
        payload: b"from-peer".to_vec(),
    })
    .unwrap();
    publish_leg.inject("_lossy", inbound);
    match wait_for_event(&mut events, |e| matches!(e, SessionEvent::DataReceived { .. })).await {
        SessionEvent::DataReceived {
            participant_sid,
            payload,
            lossy,
        } => {
            assert_eq!(participant_sid.as_deref(), Some("PA_x"));
            assert_eq!(&payload[..], b"from-peer");
            assert!(lossy);
        }
        _ => unreachable!(),
    }
}
