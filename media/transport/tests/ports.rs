use common::make_session;
use ezk_transport::{
    Component, ConnectionError, LocalMedia, NegotiationError, TransportChange, TransportConfig,
    socket::SocketAllocError,
};
use sdp_types::MediaType;
use std::collections::HashSet;

mod common;

fn ranged(min_port: u16, max_port: u16) -> TransportConfig {
    TransportConfig {
        min_port,
        max_port,
        ..TransportConfig::rtp()
    }
}

#[test]
fn connections_use_disjoint_port_pairs() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut session, _pipeline) = make_session(ranged(47300, 47307));

    for fmt in ["0", "8", "9"] {
        session
            .add_local_media(LocalMedia::new(MediaType::Audio, [fmt]))
            .unwrap();
    }

    let offer = session.create_offer().unwrap();
    assert_eq!(offer.media_descriptions.len(), 3);

    let mut ports = HashSet::new();

    for (index, desc) in offer.media_descriptions.iter().enumerate() {
        let connection = session.connection_of_media(index).unwrap();

        let rtp = connection.local_addr(Component::Rtp).unwrap().port();
        let rtcp = connection.local_addr(Component::Rtcp).unwrap().port();

        assert_eq!(rtp % 2, 0);
        assert_eq!(rtcp, rtp + 1);
        assert!((47300..=47307).contains(&rtp));
        assert!((47300..=47307).contains(&rtcp));
        assert_eq!(desc.media.port, rtp);

        assert!(ports.insert(rtp));
        assert!(ports.insert(rtcp));
    }

    // Sockets are handed out exactly once, two per connection
    let mut bound = 0;
    while let Some(change) = session.pop_transport_change() {
        assert!(matches!(change, TransportChange::Bind(_)));
        bound += 1;
    }
    assert_eq!(bound, 6);
}

#[test]
fn exhausted_port_range_fails_the_offer() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut first, _pipeline) = make_session(ranged(47320, 47323));
    first
        .add_local_media(LocalMedia::new(MediaType::Audio, ["0"]))
        .unwrap();
    first
        .add_local_media(LocalMedia::new(MediaType::Video, ["96"]))
        .unwrap();
    first.create_offer().unwrap();

    let (mut second, _pipeline) = make_session(ranged(47320, 47323));
    second
        .add_local_media(LocalMedia::new(MediaType::Audio, ["0"]))
        .unwrap();

    let result = second.create_offer();
    assert!(
        matches!(
            result,
            Err(NegotiationError::Connection(ConnectionError::SocketAlloc(
                SocketAllocError::Exhausted { min: 47320, max: 47323 }
            )))
        ),
        "{result:?}"
    );

    // Closing the first session releases its ports
    first.close();
    drop(first);

    let (mut third, _pipeline) = make_session(ranged(47320, 47323));
    third
        .add_local_media(LocalMedia::new(MediaType::Audio, ["0"]))
        .unwrap();
    third.create_offer().unwrap();
}
