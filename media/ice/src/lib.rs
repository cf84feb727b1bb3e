#![warn(unreachable_pub)]

//! Sans-IO implementation of an ICE agent managing multiple streams
//!
//! Every stream has one or two components (RTP & RTCP) and its own credentials, the controlling
//! role and tie-breaker are shared by all streams of an agent. The agent never touches a socket,
//! received packets are passed to [`IceAgent::receive`] and all output is returned as
//! [`IceEvent`]s from [`IceAgent::pop_event`] after calling [`IceAgent::poll`].

use rand::distr::{Alphanumeric, SampleString};
use sdp_types::IceCandidate;
use slotmap::{SlotMap, new_key_type};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use stream::{IceStream, opt_min};

mod relay;
mod stream;
mod stun;

pub use relay::RelayServer;
pub use stun::StunConfig;

new_key_type! {
    /// Identifies a stream inside an [`IceAgent`]
    pub struct StreamId;
}

/// A packet received on one of the stream's sockets
pub struct ReceivedPkt<D = Vec<u8>> {
    /// The received data
    pub data: D,
    /// Source address of the packet
    pub source: SocketAddr,
    /// Local socket address the packet was received on
    pub destination: SocketAddr,
    /// Component the socket belongs to
    pub component: Component,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Component {
    Rtp = 1,
    Rtcp = 2,
}

/// Connectivity state of a single component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    /// Created, nothing happened yet
    Ready,
    /// Candidates are being gathered
    Gathering,
    /// Connectivity checks are running
    Connecting,
    /// A working pair has been nominated
    Connected,
    /// Every candidate pair failed
    Failed,
    /// The nominated pair got lost while other checks are still in progress
    Disconnected,
}

/// Gathering state of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

/// Events emitted by the [`IceAgent`]
#[derive(Debug)]
pub enum IceEvent {
    /// A local candidate has been discovered and should be signaled to the peer
    NewCandidate {
        stream: StreamId,
        candidate: IceCandidate,
    },
    /// All candidates of the stream have been gathered
    GatheringDone { stream: StreamId },
    ComponentStateChanged {
        stream: StreamId,
        component: Component,
        old: ComponentState,
        new: ComponentState,
    },
    /// The pair the component's media must be sent over from now on
    SelectedPair {
        stream: StreamId,
        component: Component,
        local: SocketAddr,
        remote: SocketAddr,
    },
    /// Send data over the component's socket
    SendData {
        stream: StreamId,
        component: Component,
        data: Vec<u8>,
        source: Option<IpAddr>,
        target: SocketAddr,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn random() -> Self {
        let mut rng = rand::rng();

        Self {
            ufrag: Alphanumeric.sample_string(&mut rng, 8),
            pwd: Alphanumeric.sample_string(&mut rng, 32),
        }
    }
}

/// State shared by all streams of an agent
pub(crate) struct Shared {
    stun_config: StunConfig,
    is_controlling: bool,
    tie_breaker: u64,
    /// Set by a stream resolving a role conflict
    role_changed: bool,
    events: VecDeque<IceEvent>,
}

pub struct IceAgent {
    shared: Shared,
    streams: SlotMap<StreamId, IceStream>,
    stun_servers: Vec<SocketAddr>,
    relay_server: Option<RelayServer>,
}

impl IceAgent {
    pub fn new(is_controlling: bool) -> Self {
        Self::with_config(is_controlling, StunConfig::default())
    }

    pub fn with_config(is_controlling: bool, stun_config: StunConfig) -> Self {
        Self {
            shared: Shared {
                stun_config,
                is_controlling,
                tie_breaker: rand::random(),
                role_changed: false,
                events: VecDeque::new(),
            },
            streams: SlotMap::with_key(),
            stun_servers: Vec::new(),
            relay_server: None,
        }
    }

    /// Add a stream, with a single component if `rtcp_mux` is set, RTP & RTCP components otherwise
    pub fn add_stream(&mut self, name: impl Into<String>, rtcp_mux: bool) -> StreamId {
        let stream = IceStream::new(name.into(), rtcp_mux);

        log::debug!("Adding stream {}", stream.name());

        self.streams.insert(stream)
    }

    /// Remove a stream, dropping everything still queued for it
    ///
    /// Relay allocations of the stream are not refreshed anymore and expire on the server.
    /// Returns false if the stream didn't exist.
    pub fn remove_stream(&mut self, id: StreamId) -> bool {
        let Some(stream) = self.streams.remove(id) else {
            return false;
        };

        log::debug!("Removing stream {}", stream.name());

        self.shared.events.retain(|event| event_stream(event) != id);

        true
    }

    pub fn has_stream(&self, id: StreamId) -> bool {
        self.streams.contains_key(id)
    }

    pub fn stream_name(&self, id: StreamId) -> Option<&str> {
        self.streams.get(id).map(IceStream::name)
    }

    pub fn components(&self, id: StreamId) -> Vec<Component> {
        self.streams
            .get(id)
            .map(|stream| stream.components().collect())
            .unwrap_or_default()
    }

    pub fn is_controlling(&self) -> bool {
        self.shared.is_controlling
    }

    pub fn set_controlling(&mut self, is_controlling: bool) {
        if self.shared.is_controlling == is_controlling {
            return;
        }

        log::debug!("Setting controlling mode to {is_controlling}");

        self.shared.is_controlling = is_controlling;
        self.recompute_pair_priorities();
    }

    pub fn stun_config(&self) -> &StunConfig {
        &self.shared.stun_config
    }

    /// Register a local address of the component's socket as host candidate
    pub fn add_host_addr(&mut self, id: StreamId, component: Component, addr: SocketAddr) {
        if let Some(stream) = self.streams.get_mut(id) {
            stream.add_host_addr(&mut self.shared, id, component, addr);
        }
    }

    /// Add a STUN server used by streams gathering after this call
    pub fn add_stun_server(&mut self, server: SocketAddr) {
        if !self.stun_servers.contains(&server) {
            self.stun_servers.push(server);
        }
    }

    /// Set or clear the TURN server used by streams gathering after this call
    pub fn set_relay_server(&mut self, relay_server: Option<RelayServer>) {
        self.relay_server = relay_server;
    }

    pub fn relay_server(&self) -> Option<&RelayServer> {
        self.relay_server.as_ref()
    }

    /// Start gathering server reflexive & relayed candidates of the stream
    ///
    /// Returns false if the stream doesn't exist or gathering was already started.
    pub fn start_gathering(&mut self, id: StreamId) -> bool {
        let Some(stream) = self.streams.get_mut(id) else {
            return false;
        };

        stream.start_gathering(
            &mut self.shared,
            id,
            &self.stun_servers,
            self.relay_server.as_ref(),
        )
    }

    pub fn gathering_state(&self, id: StreamId) -> Option<GatheringState> {
        self.streams.get(id).map(IceStream::gathering_state)
    }

    pub fn local_credentials(&self, id: StreamId) -> Option<&IceCredentials> {
        self.streams.get(id).map(IceStream::local_credentials)
    }

    pub fn remote_credentials(&self, id: StreamId) -> Option<&IceCredentials> {
        self.streams.get(id).and_then(IceStream::remote_credentials)
    }

    /// Set the peer's credentials, processing checks that were received before
    pub fn set_remote_credentials(&mut self, id: StreamId, credentials: IceCredentials) -> bool {
        let Some(stream) = self.streams.get_mut(id) else {
            return false;
        };

        stream.set_remote_credentials(&mut self.shared, id, credentials);
        self.handle_role_change();

        true
    }

    /// Add a candidate received from the peer
    ///
    /// Returns false if the candidate is not usable by the stream.
    pub fn add_remote_candidate(&mut self, id: StreamId, candidate: &IceCandidate) -> bool {
        match self.streams.get_mut(id) {
            Some(stream) => stream.add_remote_candidate(&mut self.shared, candidate),
            None => false,
        }
    }

    /// All local candidates of the stream that can be signaled to the peer
    pub fn local_candidates(&self, id: StreamId) -> Vec<IceCandidate> {
        self.streams
            .get(id)
            .map(IceStream::local_candidates)
            .unwrap_or_default()
    }

    pub fn remote_candidates(&self, id: StreamId) -> Vec<IceCandidate> {
        self.streams
            .get(id)
            .map(IceStream::remote_candidates)
            .unwrap_or_default()
    }

    /// Highest priority local candidate of the component
    pub fn default_local_candidate(
        &self,
        id: StreamId,
        component: Component,
    ) -> Option<IceCandidate> {
        self.streams.get(id)?.default_local_candidate(component)
    }

    pub fn component_state(&self, id: StreamId, component: Component) -> Option<ComponentState> {
        self.streams.get(id)?.component_state(component)
    }

    /// Local & remote address of the selected pair of the component
    pub fn selected_pair(
        &self,
        id: StreamId,
        component: Component,
    ) -> Option<(SocketAddr, SocketAddr)> {
        self.streams.get(id)?.selected_pair(component)
    }

    /// Receive a STUN message on one of the stream's sockets
    pub fn receive(&mut self, now: Instant, id: StreamId, pkt: ReceivedPkt) {
        let Some(stream) = self.streams.get_mut(id) else {
            log::debug!("Dropping STUN message for removed stream");
            return;
        };

        stream.receive(&mut self.shared, id, now, pkt);
        self.handle_role_change();
    }

    /// Drive timers, connectivity checks and nominations of all streams
    pub fn poll(&mut self, now: Instant) {
        for (id, stream) in &mut self.streams {
            stream.poll(&mut self.shared, id, now);
        }

        self.handle_role_change();
    }

    /// Duration until [`IceAgent::poll`] must be called again
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        if !self.shared.events.is_empty() {
            return Some(Duration::ZERO);
        }

        self.streams
            .values()
            .fold(None, |timeout, stream| {
                opt_min(timeout, stream.timeout(&self.shared, now))
            })
    }

    pub fn pop_event(&mut self) -> Option<IceEvent> {
        self.shared.events.pop_front()
    }

    fn handle_role_change(&mut self) {
        if std::mem::take(&mut self.shared.role_changed) {
            self.recompute_pair_priorities();
        }
    }

    fn recompute_pair_priorities(&mut self) {
        for stream in self.streams.values_mut() {
            stream.recompute_pair_priorities(self.shared.is_controlling);
        }
    }
}

fn event_stream(event: &IceEvent) -> StreamId {
    match event {
        IceEvent::NewCandidate { stream, .. }
        | IceEvent::GatheringDone { stream }
        | IceEvent::ComponentStateChanged { stream, .. }
        | IceEvent::SelectedPair { stream, .. }
        | IceEvent::SendData { stream, .. } => *stream,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn credentials_have_expected_length() {
        let credentials = IceCredentials::random();

        assert_eq!(credentials.ufrag.len(), 8);
        assert_eq!(credentials.pwd.len(), 32);
        assert!(credentials.pwd.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn streams_have_independent_credentials() {
        let mut agent = IceAgent::new(true);

        let audio = agent.add_stream("audio", false);
        let video = agent.add_stream("video", true);

        assert_eq!(agent.components(audio), [Component::Rtp, Component::Rtcp]);
        assert_eq!(agent.components(video), [Component::Rtp]);
        assert_ne!(agent.local_credentials(audio), agent.local_credentials(video));
    }

    #[test]
    fn host_candidates_are_announced_on_gathering() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut agent = IceAgent::new(false);
        let stream = agent.add_stream("audio", false);

        agent.add_host_addr(stream, Component::Rtp, "192.168.1.5:5000".parse().unwrap());
        agent.add_host_addr(stream, Component::Rtcp, "192.168.1.5:5001".parse().unwrap());
        agent.add_host_addr(stream, Component::Rtp, "0.0.0.0:5000".parse().unwrap());

        assert!(agent.pop_event().is_none());
        assert!(agent.start_gathering(stream));
        assert!(!agent.start_gathering(stream));

        let mut candidates = 0;
        let mut gathering_states = 0;

        while let Some(event) = agent.pop_event() {
            match event {
                IceEvent::NewCandidate { candidate, .. } => {
                    assert_eq!(candidate.typ, "host");
                    candidates += 1;
                }
                IceEvent::ComponentStateChanged { new, .. } => {
                    assert_eq!(new, ComponentState::Gathering);
                    gathering_states += 1;
                }
                event => panic!("unexpected event {event:?}"),
            }
        }

        assert_eq!(candidates, 2);
        assert_eq!(gathering_states, 2);

        // Without STUN or TURN servers gathering completes on the next poll
        agent.poll(Instant::now());

        assert!(matches!(
            agent.pop_event(),
            Some(IceEvent::GatheringDone { stream: s }) if s == stream
        ));
        assert_eq!(agent.gathering_state(stream), Some(GatheringState::Complete));

        let default = agent
            .default_local_candidate(stream, Component::Rtcp)
            .unwrap();
        assert_eq!(default.port, 5001);
    }

    #[test]
    fn remote_candidates_are_filtered() {
        let mut agent = IceAgent::new(true);
        let stream = agent.add_stream("audio", true);

        let host: IceCandidate = "candidate:1 1 UDP 2130706431 10.0.0.2 4000 typ host"
            .parse()
            .unwrap();
        let rtcp: IceCandidate = "candidate:1 2 UDP 2130706430 10.0.0.2 4001 typ host"
            .parse()
            .unwrap();
        let tcp: IceCandidate = "candidate:2 1 TCP 2130706431 10.0.0.2 9 typ host tcptype active"
            .parse()
            .unwrap();
        let mdns: IceCandidate = "candidate:3 1 UDP 2130706431 abc.local 4000 typ host"
            .parse()
            .unwrap();

        assert!(agent.add_remote_candidate(stream, &host));
        assert!(!agent.add_remote_candidate(stream, &rtcp));
        assert!(!agent.add_remote_candidate(stream, &tcp));
        assert!(!agent.add_remote_candidate(stream, &mdns));
    }

    #[test]
    fn removed_stream_is_forgotten() {
        let mut agent = IceAgent::new(true);
        let stream = agent.add_stream("audio", true);

        assert!(agent.remove_stream(stream));
        assert!(!agent.remove_stream(stream));
        assert!(!agent.has_stream(stream));
        assert!(!agent.start_gathering(stream));
        assert_eq!(agent.timeout(Instant::now()), None);
    }

    #[test]
    fn removed_stream_sends_nothing() {
        let mut agent = IceAgent::new(true);
        agent.add_stun_server("192.0.2.1:3478".parse().unwrap());
        agent.set_relay_server(Some(RelayServer {
            server: "192.0.2.10:3478".parse().unwrap(),
            username: "user".into(),
            password: "pass".into(),
        }));

        let audio = agent.add_stream("audio", true);
        let video = agent.add_stream("video", true);

        for stream in [audio, video] {
            agent.add_host_addr(stream, Component::Rtp, "127.0.0.1:40000".parse().unwrap());
            assert!(agent.start_gathering(stream));
        }

        agent.poll(Instant::now());
        assert!(agent.remove_stream(audio));

        let mut video_events = 0;

        while let Some(event) = agent.pop_event() {
            assert_eq!(event_stream(&event), video);
            video_events += 1;
        }

        assert!(video_events > 0);
    }
}
