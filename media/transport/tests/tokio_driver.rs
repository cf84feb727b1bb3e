#![cfg(feature = "tokio")]

use common::{audio_session, negotiate};
use ezk_transport::{Component, Session, SessionEvent, TransportConfig, tokio::TokioIo};
use std::time::Duration;
use tokio::time::timeout;

mod common;

const RTP_PACKET: [u8; 12] = [
    0x80, 0x00, 0x00, 0x07, 0x00, 0x00, 0x01, 0x40, 0x0B, 0xAD, 0xF0, 0x0D,
];

/// Events the session produces until it stays silent for a while
async fn drain(io: &mut TokioIo, session: &mut Session) -> Vec<SessionEvent> {
    let mut events = vec![];

    while let Ok(event) = timeout(Duration::from_millis(50), io.poll_session(session)).await {
        events.push(event.unwrap());
    }

    events
}

#[tokio::test]
async fn rtp_is_delivered_over_real_sockets() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut offerer, _) = audio_session(TransportConfig::rtp());
    let (mut answerer, _) = audio_session(TransportConfig::rtp());

    negotiate(&mut offerer, &mut answerer);

    let mut offerer_io = TokioIo::new(vec![]);
    let mut answerer_io = TokioIo::new(vec![]);

    offerer_io.handle_transport_changes(&mut offerer).unwrap();
    answerer_io.handle_transport_changes(&mut answerer).unwrap();

    // RTP & RTCP socket of the single connection
    assert_eq!(offerer_io.local_addrs().count(), 2);

    let events = drain(&mut offerer_io, &mut offerer).await;
    assert!(
        events
            .iter()
            .any(|e| matches!(e, SessionEvent::Connected { connection } if connection == "audio0"))
    );

    assert!(offerer.send_media("audio0", Component::Rtp, RTP_PACKET.to_vec()));
    drain(&mut offerer_io, &mut offerer).await;

    let received = timeout(Duration::from_secs(2), async {
        loop {
            match answerer_io.poll_session(&mut answerer).await.unwrap() {
                SessionEvent::MediaReceived {
                    connection,
                    component,
                    data,
                } => break (connection, component, data),
                _ => continue,
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(
        received,
        ("audio0".to_string(), Component::Rtp, RTP_PACKET.to_vec())
    );
}

#[tokio::test]
async fn closed_sockets_are_released() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut session, _) = audio_session(TransportConfig::rtp());
    session.create_offer().unwrap();

    let mut io = TokioIo::new(vec![]);
    io.handle_transport_changes(&mut session).unwrap();
    assert_eq!(io.local_addrs().count(), 2);

    session.close();
    io.handle_transport_changes(&mut session).unwrap();
    assert_eq!(io.local_addrs().count(), 0);
}
