use common::{FakePipeline, audio_session, exchange, trickle};
use ezk_transport::{
    BUNDLE_CONNECTION_NAME, Component, LocalMedia, NegotiationState, ReceivedPacket, Session,
    SessionEvent, TransportConfig,
};
use sdp_types::{MediaType, Setup};
use std::time::Instant;

mod common;

const RTP_PACKET: [u8; 16] = [
    0x80, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0xA0, 0x12, 0x34, 0x56, 0x78, 0xDE, 0xAD, 0xBE, 0xEF,
];

fn data_session() -> (Session, FakePipeline) {
    let (mut session, pipeline) = audio_session(TransportConfig::webrtc());

    session
        .add_local_media(LocalMedia::new(MediaType::App, None::<String>))
        .unwrap();

    (session, pipeline)
}

fn gathering_done(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::IceGatheringDone))
        .count()
}

/// Negotiate two sessions and trickle their candidates, returns the events left after trickling
fn negotiate_and_gather(
    offerer: &mut Session,
    answerer: &mut Session,
) -> (Vec<SessionEvent>, Vec<SessionEvent>) {
    let offer = offerer.create_offer().unwrap();
    assert!(offerer.gather_candidates());
    offerer.poll(Instant::now());

    let answer = answerer.process_offer(&offer.to_string()).unwrap();
    assert!(answerer.gather_candidates());
    answerer.poll(Instant::now());

    assert_eq!(answer.media_descriptions[0].setup, Some(Setup::Active));

    offerer.process_answer(&answer.to_string()).unwrap();

    let offerer_events = trickle(offerer, answerer);
    let answerer_events = trickle(answerer, offerer);

    (offerer_events, answerer_events)
}

#[test]
fn offerer_controls_and_both_sides_connect() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut offerer, offerer_pipeline) = data_session();
    let (mut answerer, answerer_pipeline) = data_session();

    let (offerer_events, answerer_events) = negotiate_and_gather(&mut offerer, &mut answerer);

    assert_eq!(gathering_done(&offerer_events), 1);
    assert_eq!(gathering_done(&answerer_events), 1);

    assert_eq!(offerer.negotiation_state(), NegotiationState::Negotiated);
    assert!(offerer.agent().unwrap().is_controlling());
    assert!(!answerer.agent().unwrap().is_controlling());

    let mut connected = [0; 2];
    let mut ready = [0; 2];

    let finished = exchange(&mut offerer, &mut answerer, |index, event| {
        match event {
            SessionEvent::Connected { connection } => {
                assert_eq!(connection, BUNDLE_CONNECTION_NAME);
                connected[index] += 1;
            }
            SessionEvent::DataChannelReady { .. } => ready[index] += 1,
            _ => {}
        }

        connected == [1, 1] && ready == [1, 1]
    });

    assert!(finished, "connected={connected:?} ready={ready:?}");

    for session in [&offerer, &answerer] {
        let connection = session.connection(BUNDLE_CONNECTION_NAME).unwrap();
        assert!(connection.is_connected());
        assert!(connection.sctp().unwrap().is_wired());
    }

    for pipeline in [&offerer_pipeline, &answerer_pipeline] {
        let recorded = pipeline.0.lock();
        assert_eq!(recorded.count("dtlssrtpenc"), 1);
        assert_eq!(recorded.count("sctpenc"), 1);
        assert_eq!(recorded.count("sctpdec"), 1);
    }
}

#[test]
fn media_and_data_flow_once_connected() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut offerer, _) = data_session();
    let (mut answerer, _) = data_session();

    negotiate_and_gather(&mut offerer, &mut answerer);

    // Nothing is sent before the handshake completed
    assert!(!offerer.send_media(BUNDLE_CONNECTION_NAME, Component::Rtp, RTP_PACKET.to_vec()));

    let mut connected = 0;
    assert!(exchange(&mut offerer, &mut answerer, |_, event| {
        if matches!(event, SessionEvent::Connected { .. }) {
            connected += 1;
        }

        connected == 2
    }));

    assert!(offerer.send_media(BUNDLE_CONNECTION_NAME, Component::Rtp, RTP_PACKET.to_vec()));
    assert!(offerer.send_data(BUNDLE_CONNECTION_NAME, b"sctp"));

    let mut media = None;
    let mut data = None;

    assert!(exchange(&mut offerer, &mut answerer, |index, event| {
        match event {
            SessionEvent::MediaReceived {
                connection,
                component,
                data: payload,
            } if index == 1 => media = Some((connection.clone(), *component, payload.clone())),
            SessionEvent::DataReceived { data: received, .. } if index == 1 => {
                data = Some(received.clone())
            }
            _ => {}
        }

        media.is_some() && data.is_some()
    }));

    assert_eq!(
        media,
        Some((BUNDLE_CONNECTION_NAME.to_string(), Component::Rtp, RTP_PACKET.to_vec()))
    );
    assert_eq!(data.as_deref(), Some(&b"sctp"[..]));
}

#[test]
fn packets_on_unknown_sockets_are_dropped() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut session, _) = data_session();
    session.create_offer().unwrap();

    session.receive(
        Instant::now(),
        ReceivedPacket {
            socket: "127.0.0.1:9".parse().unwrap(),
            source: "127.0.0.1:10000".parse().unwrap(),
            destination: "127.0.0.1:9".parse().unwrap(),
            data: RTP_PACKET.to_vec(),
        },
    );

    assert!(
        std::iter::from_fn(|| session.pop_event())
            .all(|e| !matches!(e, SessionEvent::MediaReceived { .. }))
    );
}

#[test]
fn default_info_completes_the_local_description() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut offerer, _) = data_session();
    let (mut answerer, _) = data_session();

    negotiate_and_gather(&mut offerer, &mut answerer);

    assert!(offerer.local_sdp_add_default_info());

    let local = offerer.local_sdp().unwrap();
    assert!(local.connection.is_none());

    let connection = offerer.connection(BUNDLE_CONNECTION_NAME).unwrap();
    let port = connection.local_addr(Component::Rtp).unwrap().port();

    for desc in &local.media_descriptions {
        assert_eq!(desc.media.port, port);
        assert!(desc.ice_end_of_candidates);
        assert_eq!(desc.rtcp.as_ref().map(|rtcp| rtcp.port), Some(port));
    }
}
