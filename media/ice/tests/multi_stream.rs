use ezk_ice::{
    Component, ComponentState, IceAgent, IceEvent, ReceivedPkt, StreamId,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// An agent together with the addresses of its sockets
struct Peer {
    agent: IceAgent,
    sockets: HashMap<(StreamId, Component), SocketAddr>,
    gathered: Vec<StreamId>,
    selected: Vec<(StreamId, Component)>,
}

impl Peer {
    fn new(is_controlling: bool, ip: &str, base_port: u16) -> Self {
        let mut agent = IceAgent::new(is_controlling);
        let mut sockets = HashMap::new();

        let audio = agent.add_stream("audio", false);
        let video = agent.add_stream("video", true);

        let layout = [
            (audio, Component::Rtp, base_port),
            (audio, Component::Rtcp, base_port + 1),
            (video, Component::Rtp, base_port + 2),
        ];

        for (stream, component, port) in layout {
            let addr: SocketAddr = format!("{ip}:{port}").parse().unwrap();
            agent.add_host_addr(stream, component, addr);
            sockets.insert((stream, component), addr);
        }

        Self {
            agent,
            sockets,
            gathered: vec![],
            selected: vec![],
        }
    }

    fn streams(&self) -> Vec<StreamId> {
        let mut streams: Vec<StreamId> = self.sockets.keys().map(|(s, _)| *s).collect();
        streams.sort();
        streams.dedup();
        streams
    }

    fn all_connected(&self) -> bool {
        self.sockets.keys().all(|(stream, component)| {
            self.agent.component_state(*stream, *component) == Some(ComponentState::Connected)
        })
    }

    /// Drain all events, returning packets that must be delivered to the peer
    fn drain(&mut self) -> Vec<(SocketAddr, SocketAddr, Vec<u8>)> {
        let mut packets = vec![];

        while let Some(event) = self.agent.pop_event() {
            match event {
                IceEvent::SendData {
                    stream,
                    component,
                    data,
                    target,
                    ..
                } => {
                    let source = self.sockets[&(stream, component)];
                    packets.push((source, target, data));
                }
                IceEvent::GatheringDone { stream } => self.gathered.push(stream),
                IceEvent::SelectedPair {
                    stream, component, ..
                } => self.selected.push((stream, component)),
                IceEvent::NewCandidate { .. } | IceEvent::ComponentStateChanged { .. } => {}
            }
        }

        packets
    }

    fn deliver(&mut self, now: Instant, source: SocketAddr, destination: SocketAddr, data: Vec<u8>) {
        let Some((stream, component)) = self
            .sockets
            .iter()
            .find(|(_, addr)| **addr == destination)
            .map(|(key, _)| *key)
        else {
            return;
        };

        self.agent.receive(
            now,
            stream,
            ReceivedPkt {
                data,
                source,
                destination,
                component,
            },
        );
    }
}

fn exchange_signaling(from: &Peer, to: &mut Peer) {
    for (from_stream, to_stream) in from.streams().into_iter().zip(to.streams()) {
        let credentials = from.agent.local_credentials(from_stream).unwrap().clone();
        assert!(to.agent.set_remote_credentials(to_stream, credentials));

        for candidate in from.agent.local_candidates(from_stream) {
            // Round trip through the SDP representation
            let candidate = candidate.to_string().parse().unwrap();
            assert!(to.agent.add_remote_candidate(to_stream, &candidate));
        }
    }
}

#[test]
fn two_agents_connect_all_streams() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut a = Peer::new(true, "127.0.0.1", 5000);
    let mut b = Peer::new(false, "127.0.0.1", 6000);

    for stream in a.streams() {
        assert!(a.agent.start_gathering(stream));
    }
    for stream in b.streams() {
        assert!(b.agent.start_gathering(stream));
    }

    exchange_signaling(&a, &mut b);
    exchange_signaling(&b, &mut a);

    let mut now = Instant::now();
    let deadline = now + Duration::from_secs(30);

    while !(a.all_connected() && b.all_connected()) {
        assert!(now < deadline, "agents did not connect in time");

        a.agent.poll(now);
        b.agent.poll(now);

        loop {
            let to_b = a.drain();
            let to_a = b.drain();

            if to_a.is_empty() && to_b.is_empty() {
                break;
            }

            for (source, target, data) in to_b {
                b.deliver(now, source, target, data);
            }

            for (source, target, data) in to_a {
                a.deliver(now, source, target, data);
            }
        }

        let timeout = match (a.agent.timeout(now), b.agent.timeout(now)) {
            (Some(x), Some(y)) => x.min(y),
            (x, y) => x.or(y).unwrap_or(Duration::from_millis(50)),
        };

        now += timeout.max(Duration::from_millis(1));
    }

    assert_eq!(a.gathered.len(), 2);
    assert_eq!(b.gathered.len(), 2);
    assert_eq!(a.selected.len(), 3);
    assert_eq!(b.selected.len(), 3);

    for (stream, component) in a.sockets.keys() {
        let (local, remote) = a.agent.selected_pair(*stream, *component).unwrap();
        assert_eq!(local, a.sockets[&(*stream, *component)]);
        assert_eq!(remote.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
    }

    assert!(a.agent.is_controlling());
    assert!(!b.agent.is_controlling());
}

#[test]
fn role_conflict_is_resolved() {
    let _ = env_logger::builder().is_test(true).try_init();

    // Both sides believe they are controlling
    let mut a = Peer::new(true, "127.0.0.1", 7000);
    let mut b = Peer::new(true, "127.0.0.1", 8000);

    exchange_signaling(&a, &mut b);
    exchange_signaling(&b, &mut a);

    let mut now = Instant::now();
    let deadline = now + Duration::from_secs(30);

    while !(a.all_connected() && b.all_connected()) {
        assert!(now < deadline, "agents did not connect in time");

        a.agent.poll(now);
        b.agent.poll(now);

        loop {
            let to_b = a.drain();
            let to_a = b.drain();

            if to_a.is_empty() && to_b.is_empty() {
                break;
            }

            for (source, target, data) in to_b {
                b.deliver(now, source, target, data);
            }

            for (source, target, data) in to_a {
                a.deliver(now, source, target, data);
            }
        }

        now += Duration::from_millis(10);
    }

    assert_ne!(a.agent.is_controlling(), b.agent.is_controlling());
}
