//! ICE agent shared by all WebRTC connections of a session

use crate::config::{TurnTransport, TurnUrl};
use ice::{
    Component, ComponentState, IceAgent, IceCredentials, IceEvent, ReceivedPkt, RelayServer,
    StreamId, StunConfig,
};
use sdp_types::IceCandidate;
use std::{
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

pub struct Agent {
    ice: IceAgent,
    /// Addresses announced for sockets bound to the unspecified address
    host_ips: Vec<IpAddr>,
}

impl Agent {
    pub fn new(is_controlling: bool, stun_config: StunConfig) -> Self {
        Self {
            ice: IceAgent::with_config(is_controlling, stun_config),
            host_ips: vec![],
        }
    }

    pub fn is_controlling(&self) -> bool {
        self.ice.is_controlling()
    }

    pub fn set_controlling(&mut self, is_controlling: bool) {
        if self.ice.is_controlling() != is_controlling {
            log::debug!("ICE agent is now controlling={is_controlling}");
        }

        self.ice.set_controlling(is_controlling);
    }

    pub fn host_ips(&self) -> &[IpAddr] {
        &self.host_ips
    }

    pub fn set_host_ips(&mut self, ips: Vec<IpAddr>) {
        self.host_ips = ips;
    }

    pub fn add_stream(&mut self, name: &str, rtcp_mux: bool) -> StreamId {
        let id = self.ice.add_stream(name, rtcp_mux);
        log::debug!("Added ICE stream {name} (rtcp_mux={rtcp_mux})");
        id
    }

    pub fn remove_stream(&mut self, id: StreamId) -> bool {
        self.ice.remove_stream(id)
    }

    pub fn has_stream(&self, id: StreamId) -> bool {
        self.ice.has_stream(id)
    }

    /// Register the socket of a component as host candidate base
    ///
    /// Sockets bound to an unspecified address are announced with every host IP of the same family.
    pub fn add_host_addr(&mut self, id: StreamId, component: Component, addr: SocketAddr) {
        if !addr.ip().is_unspecified() {
            self.ice.add_host_addr(id, component, addr);
            return;
        }

        for ip in &self.host_ips {
            if ip.is_ipv6() == addr.is_ipv6() && !ip.is_loopback() {
                self.ice
                    .add_host_addr(id, component, SocketAddr::new(*ip, addr.port()));
            }
        }
    }

    pub fn set_stun_server(&mut self, server: SocketAddr) {
        log::debug!("Using STUN server {server}");
        self.ice.add_stun_server(server);
    }

    /// Use the TURN server for relayed candidates, only UDP allocations are supported
    pub fn add_relay_server(&mut self, url: &TurnUrl) -> bool {
        if url.transport != TurnTransport::Udp {
            log::warn!(
                "TURN transport {} not supported, not using relay server {}:{}",
                url.transport,
                url.address,
                url.port
            );
            return false;
        }

        self.ice.set_relay_server(Some(RelayServer {
            server: SocketAddr::new(url.address, url.port),
            username: url.username.clone(),
            password: url.password.clone(),
        }));

        true
    }

    pub fn clear_relay_server(&mut self) {
        self.ice.set_relay_server(None);
    }

    pub fn get_local_credentials(&self, id: StreamId) -> Option<&IceCredentials> {
        self.ice.local_credentials(id)
    }

    pub fn set_remote_credentials(&mut self, id: StreamId, ufrag: &str, pwd: &str) -> bool {
        self.ice.set_remote_credentials(
            id,
            IceCredentials {
                ufrag: ufrag.into(),
                pwd: pwd.into(),
            },
        )
    }

    pub fn start_gathering_candidates(&mut self, id: StreamId) -> bool {
        self.ice.start_gathering(id)
    }

    pub fn add_ice_candidate(&mut self, id: StreamId, candidate: &IceCandidate) -> bool {
        let added = self.ice.add_remote_candidate(id, candidate);

        if !added {
            log::debug!("Ignoring remote candidate {candidate}");
        }

        added
    }

    pub fn remote_candidates(&self, id: StreamId) -> Vec<IceCandidate> {
        self.ice.remote_candidates(id)
    }

    pub fn local_candidates(&self, id: StreamId) -> Vec<IceCandidate> {
        self.ice.local_candidates(id)
    }

    pub fn get_default_local_candidate(
        &self,
        id: StreamId,
        component: Component,
    ) -> Option<IceCandidate> {
        self.ice.default_local_candidate(id, component)
    }

    pub fn component_state(&self, id: StreamId, component: Component) -> Option<ComponentState> {
        self.ice.component_state(id, component)
    }

    pub fn receive(
        &mut self,
        now: Instant,
        id: StreamId,
        component: Component,
        source: SocketAddr,
        destination: SocketAddr,
        data: Vec<u8>,
    ) {
        self.ice.receive(
            now,
            id,
            ReceivedPkt {
                data,
                source,
                destination,
                component,
            },
        );
    }

    /// Drive the agent and collect everything it has to report
    pub fn run_agent(&mut self, now: Instant) -> Vec<IceEvent> {
        self.ice.poll(now);
        self.drain_events()
    }

    /// Events produced outside of [`Agent::run_agent`], e.g. by receiving or starting to gather
    pub fn drain_events(&mut self) -> Vec<IceEvent> {
        std::iter::from_fn(|| self.ice.pop_event()).collect()
    }

    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        self.ice.timeout(now)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    fn agent() -> Agent {
        Agent::new(true, StunConfig::default())
    }

    #[test]
    fn unspecified_host_addr_expands_to_host_ips() {
        let mut agent = agent();
        agent.set_host_ips(vec![
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "fe80::1".parse().unwrap(),
        ]);

        let id = agent.add_stream("audio0", false);
        agent.add_host_addr(id, Component::Rtp, "0.0.0.0:40000".parse().unwrap());

        assert!(agent.start_gathering_candidates(id));
        let _ = agent.run_agent(Instant::now());

        let candidates = agent.local_candidates(id);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].port, 40000);
        assert_eq!(candidates[0].address.to_string(), "10.0.0.1");
    }

    #[test]
    fn relay_requires_udp() {
        let mut agent = agent();

        let tcp: TurnUrl = "user:pass@10.0.0.1:3478?transport=tcp".parse().unwrap();
        assert!(!agent.add_relay_server(&tcp));

        let udp: TurnUrl = "user:pass@10.0.0.1:3478".parse().unwrap();
        assert!(agent.add_relay_server(&udp));
    }

    #[test]
    fn remote_credentials_require_stream() {
        let mut agent = agent();
        let id = agent.add_stream("video0", true);

        assert!(agent.set_remote_credentials(id, "ufrag", "passwordpasswordpassword"));
        assert!(agent.remove_stream(id));
        assert!(!agent.has_stream(id));
        assert!(!agent.set_remote_credentials(id, "ufrag", "passwordpasswordpassword"));
    }

    #[test]
    fn gathering_done_without_servers() {
        let mut agent = agent();
        let id = agent.add_stream("audio0", true);
        agent.add_host_addr(id, Component::Rtp, "127.0.0.1:40002".parse().unwrap());

        assert!(agent.start_gathering_candidates(id));

        let mut events = agent.drain_events();
        events.extend(agent.run_agent(Instant::now()));

        assert!(
            events
                .iter()
                .any(|e| matches!(e, IceEvent::GatheringDone { stream } if *stream == id))
        );
    }
}
