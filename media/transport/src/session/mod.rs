//! SDP offer/answer session owning the connections of a media endpoint
//!
//! A [`Session`] is sans-IO: sockets it creates are handed out as [`TransportChange`]s, received
//! datagrams are passed to [`Session::receive`] and everything it wants to send or report is
//! returned from [`Session::pop_event`]. Call [`Session::poll`] whenever [`Session::timeout`]
//! expired.

use crate::{
    agent::Agent,
    certificate::{Certificate, CertificateError},
    config::{TransportConfig, TransportMode, TurnUrl, TurnUrlError},
    connection::{Connection, ConnectionError, ConnectionKind, Transmit},
    opt_min,
    packet_kind::PacketKind,
    pipeline::Pipeline,
    registry::ConnectionRegistry,
    sdes::{SdesError, SdesKeyManager},
};
use ice::{Component, ComponentState, StunConfig};
use openssl::ssl::SslContext;
use sdp_types::{
    Fingerprint, IceCandidate, MediaDescription, MediaType, Origin, SessionDescription,
    TaggedAddress, Time, TransportProtocol,
};
use slotmap::SlotMap;
use std::{
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

mod activation;
mod negotiation;

pub use negotiation::{LocalMedia, MediaHandler, NegotiationError, NegotiationState};

slotmap::new_key_type! {
    pub struct LocalMediaId;
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error(transparent)]
    TurnUrl(#[from] TurnUrlError),
    #[error(transparent)]
    Sdes(#[from] SdesError),
}

/// Event returned by [`Session::pop_event`]
#[derive(Debug)]
pub enum SessionEvent {
    /// A local candidate was gathered and must be signaled to the peer (`on-ice-candidate`)
    IceCandidate {
        candidate: IceCandidate,
        mid: String,
        mline_index: usize,
    },
    /// Every connection of the session finished gathering, the local session description is complete
    IceGatheringDone,
    IceComponentStateChanged {
        connection: String,
        component: Component,
        state: ComponentState,
    },
    /// The connection's security handshake completed, or it has none
    Connected { connection: String },
    /// SCTP elements of the connection have been wired
    DataChannelReady {
        connection: String,
        association_id: u32,
    },
    /// RTP or RTCP packet received on a connection
    MediaReceived {
        connection: String,
        component: Component,
        data: Vec<u8>,
    },
    /// SCTP packet received over a connection's DTLS transport
    DataReceived { connection: String, data: Vec<u8> },
    /// Send `data` from the socket bound to `socket`
    SendData {
        socket: SocketAddr,
        data: Vec<u8>,
        /// Local IP to send from if the socket is bound to an unspecified address
        source: Option<IpAddr>,
        target: SocketAddr,
    },
}

/// Sockets the IO driver has to start or stop serving
#[derive(Debug)]
pub enum TransportChange {
    /// Receive on the socket and use it for [`SessionEvent::SendData`] with its local address
    Bind(UdpSocket),
    /// The socket bound to the address has been released
    Close(SocketAddr),
}

/// Datagram received by the IO driver
#[derive(Debug)]
pub struct ReceivedPacket {
    /// Local address of the socket the packet was received on
    pub socket: SocketAddr,
    pub source: SocketAddr,
    /// Destination address of the packet, differs from `socket` for sockets bound to an unspecified address
    pub destination: SocketAddr,
    pub data: Vec<u8>,
}

/// A `m=` line of the negotiation
#[derive(Debug, Clone)]
struct MediaSlot {
    mid: String,
    media_type: MediaType,
    /// Protocol of the local media description
    proto: TransportProtocol,
    connection: Option<String>,
    active: bool,
}

#[derive(Debug)]
struct PendingCandidate {
    candidate: IceCandidate,
    mid: Option<String>,
    mline_index: usize,
}

pub struct Session {
    id: u64,
    version: u64,
    config: TransportConfig,
    pipeline: Box<dyn Pipeline>,

    certificate: Option<Certificate>,
    ssl_context: Option<SslContext>,
    fingerprint: Option<Fingerprint>,

    agent: Option<Agent>,
    registry: ConnectionRegistry,
    sdes: Option<SdesKeyManager>,
    host_ips: Vec<IpAddr>,

    state: NegotiationState,
    is_offerer: bool,
    local_media: SlotMap<LocalMediaId, LocalMedia>,
    media: Vec<MediaSlot>,
    local_sdp: Option<SessionDescription>,
    remote_sdp: Option<SessionDescription>,

    /// Remote candidates added before the negotiation completed
    pending_candidates: Vec<PendingCandidate>,
    gathering_done: bool,

    events: VecDeque<SessionEvent>,
    transport_changes: VecDeque<TransportChange>,
}

impl Session {
    pub fn new(config: TransportConfig, pipeline: Box<dyn Pipeline>) -> Result<Self, SessionError> {
        let host_ips: Vec<IpAddr> = config.local_address.into_iter().collect();

        let mut session = Self {
            id: u64::from(rand::random::<u16>()),
            version: u64::from(rand::random::<u16>()),
            config,
            pipeline,
            certificate: None,
            ssl_context: None,
            fingerprint: None,
            agent: None,
            registry: ConnectionRegistry::default(),
            sdes: None,
            host_ips,
            state: NegotiationState::New,
            is_offerer: false,
            local_media: SlotMap::with_key(),
            media: vec![],
            local_sdp: None,
            remote_sdp: None,
            pending_candidates: vec![],
            gathering_done: false,
            events: VecDeque::new(),
            transport_changes: VecDeque::new(),
        };

        if session.config.mode == TransportMode::WebRtc {
            let certificate = match &session.config.certificate_pem_file {
                Some(path) => Certificate::from_pem_file(path)?,
                None => Certificate::generate()?,
            };

            session.install_certificate(certificate)?;

            let mut agent = Agent::new(false, StunConfig::default());
            agent.set_host_ips(session.host_ips.clone());

            if let Some(ip) = session.config.stun_server {
                agent.set_stun_server(SocketAddr::new(ip, session.config.stun_server_port));
            }

            if let Some(turn) = session.config.turn_server()? {
                agent.add_relay_server(&turn);
            }

            session.agent = Some(agent);
        }

        if session.config.use_sdes() {
            let mut sdes = SdesKeyManager::new(session.config.crypto_suite.clone());

            if let Some(master_key) = &session.config.master_key {
                sdes.set_master_key(master_key)?;
            }

            session.sdes = Some(sdes);
        }

        Ok(session)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.state
    }

    /// Local session description, completed with candidates and default addresses while gathering
    pub fn local_sdp(&self) -> Option<&SessionDescription> {
        self.local_sdp.as_ref()
    }

    pub fn remote_sdp(&self) -> Option<&SessionDescription> {
        self.remote_sdp.as_ref()
    }

    pub fn is_offerer(&self) -> bool {
        self.is_offerer
    }

    /// Connection named after a media id, or [`BUNDLE_CONNECTION_NAME`](crate::BUNDLE_CONNECTION_NAME)
    pub fn connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.registry.get_connection(name).cloned()
    }

    /// Connection carrying the media at `mline_index`
    pub fn connection_of_media(&self, mline_index: usize) -> Option<Arc<Connection>> {
        let name = self.media.get(mline_index)?.connection.as_deref()?;
        self.connection(name)
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.connections().cloned().collect()
    }

    pub fn agent(&self) -> Option<&Agent> {
        self.agent.as_ref()
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    /// SHA-256 fingerprint of the DTLS certificate announced in the local session description
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn pipeline_mut(&mut self) -> &mut dyn Pipeline {
        self.pipeline.as_mut()
    }

    /// Use the certificate of the PEM file for every current and future connection
    pub fn set_certificate_pem_file(&mut self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref();
        let certificate = Certificate::from_pem_file(path)?;

        self.install_certificate(certificate)?;
        self.config.certificate_pem_file = Some(path.into());

        Ok(())
    }

    pub fn set_stun_server(&mut self, ip: IpAddr, port: u16) {
        self.config.stun_server = Some(ip);
        self.config.stun_server_port = port;

        if let Some(agent) = &mut self.agent {
            agent.set_stun_server(SocketAddr::new(ip, port));
        }
    }

    /// Set the TURN server, an empty string removes it
    pub fn set_turn_url(&mut self, url: &str) -> Result<(), SessionError> {
        let turn = if url.is_empty() {
            None
        } else {
            Some(url.parse::<TurnUrl>()?)
        };

        self.config.turn_url = turn.is_some().then(|| url.into());

        if let Some(agent) = &mut self.agent {
            match &turn {
                Some(turn) => {
                    agent.add_relay_server(turn);
                }
                None => agent.clear_relay_server(),
            }
        }

        Ok(())
    }

    /// Addresses announced for sockets bound to an unspecified address, used by connections created afterwards
    pub fn set_host_addresses(&mut self, ips: Vec<IpAddr>) {
        if let Some(agent) = &mut self.agent {
            agent.set_host_ips(ips.clone());
        }

        self.host_ips = ips;
    }

    /// Handle a datagram received on one of the session's sockets
    pub fn receive(&mut self, now: Instant, pkt: ReceivedPacket) {
        let Some((connection, component)) = self.registry.by_socket(pkt.socket) else {
            log::debug!("Dropping packet received on unknown socket {}", pkt.socket);
            return;
        };

        let connection = connection.clone();

        match PacketKind::identify(&pkt.data) {
            PacketKind::Stun => {
                let (Some(agent), Some(stream)) = (&mut self.agent, connection.stream_id()) else {
                    log::debug!("Dropping STUN message on {}, no ICE agent", connection.name());
                    return;
                };

                agent.receive(now, stream, component, pkt.source, pkt.destination, pkt.data);
                self.handle_ice_events();
            }
            PacketKind::Dtls => {
                if connection.receive_dtls(self.pipeline.as_mut(), component, pkt.data) {
                    self.on_connection_connected(&connection);
                }

                self.flush_connection(&connection);
            }
            kind @ (PacketKind::Rtp | PacketKind::Rtcp) => {
                connection.media_received(component, now);

                let component = if kind == PacketKind::Rtcp {
                    Component::Rtcp
                } else {
                    component
                };

                self.events.push_back(SessionEvent::MediaReceived {
                    connection: connection.name().into(),
                    component,
                    data: pkt.data,
                });
            }
            PacketKind::Unknown => {
                log::trace!("Dropping unknown packet from {} on {}", pkt.source, connection.name());
            }
        }
    }

    /// Drive the ICE agent and the DTLS handshakes
    pub fn poll(&mut self, now: Instant) {
        let events = self
            .agent
            .as_mut()
            .map(|agent| agent.run_agent(now))
            .unwrap_or_default();

        for event in events {
            self.handle_ice_event(event);
        }

        for connection in self.connections() {
            if connection.poll_dtls(self.pipeline.as_mut()) {
                self.on_connection_connected(&connection);
            }
        }

        self.flush_connections();
    }

    /// Duration after which [`poll`](Self::poll) must be called
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        let mut timeout = self.agent.as_ref().and_then(|agent| agent.timeout(now));

        for connection in self.registry.connections() {
            timeout = opt_min(timeout, connection.dtls_timeout());
        }

        timeout
    }

    pub fn pop_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn pop_transport_change(&mut self) -> Option<TransportChange> {
        self.transport_changes.pop_front()
    }

    /// Send an RTP or RTCP packet to the connection's remote address
    ///
    /// WebRTC connections only send once their DTLS handshake completed.
    pub fn send_media(&mut self, connection: &str, component: Component, data: Vec<u8>) -> bool {
        let Some(connection) = self.registry.get_connection(connection) else {
            return false;
        };

        if connection.kind().is_webrtc() && !connection.is_connected() {
            log::debug!("Not sending media on {}, not connected", connection.name());
            return false;
        }

        let Some(Transmit {
            socket,
            source,
            target,
            data,
        }) = connection.media_transmit(component, data)
        else {
            return false;
        };

        self.events.push_back(SessionEvent::SendData {
            socket,
            data,
            source,
            target,
        });

        true
    }

    /// Send an SCTP packet over the connection's DTLS transport
    pub fn send_data(&mut self, connection: &str, data: &[u8]) -> bool {
        let Some(connection) = self.registry.get_connection(connection).cloned() else {
            return false;
        };

        if let Err(e) = connection.send_app_data(data) {
            log::warn!("Failed to send data on {}, {e}", connection.name());
            return false;
        }

        self.flush_connection(&connection);

        true
    }

    /// Release every connection of the session
    pub fn close(&mut self) {
        let addrs = self
            .registry
            .remove_all(self.agent.as_mut(), self.pipeline.as_mut());

        if let Some(sdes) = &mut self.sdes {
            for media in &self.media {
                sdes.remove_media(&media.mid);
            }
        }

        self.transport_changes
            .extend(addrs.into_iter().map(TransportChange::Close));
    }

    fn install_certificate(&mut self, certificate: Certificate) -> Result<(), CertificateError> {
        let ctx = certificate.ssl_context()?;
        let fingerprint = certificate.fingerprint()?;

        for connection in self.registry.connections() {
            connection.set_certificate(&ctx);
        }

        if let Some(local_sdp) = &mut self.local_sdp {
            for desc in &mut local_sdp.media_descriptions {
                if !desc.fingerprint.is_empty() {
                    desc.fingerprint = vec![fingerprint.clone()];
                }
            }
        }

        self.certificate = Some(certificate);
        self.ssl_context = Some(ctx);
        self.fingerprint = Some(fingerprint);

        Ok(())
    }

    fn create_connection(
        &mut self,
        name: &str,
        kind: ConnectionKind,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let connection = self.registry.create_connection(
            name,
            kind,
            &self.config,
            self.agent.as_mut(),
            self.ssl_context.as_ref(),
        )?;

        self.transport_changes.extend(
            connection
                .take_sockets()
                .into_iter()
                .map(TransportChange::Bind),
        );

        Ok(connection)
    }

    fn flush_connection(&mut self, connection: &Connection) {
        while let Some(Transmit {
            socket,
            source,
            target,
            data,
        }) = connection.pop_transmit()
        {
            self.events.push_back(SessionEvent::SendData {
                socket,
                data,
                source,
                target,
            });
        }

        while let Some(data) = connection.pop_app_data() {
            self.events.push_back(SessionEvent::DataReceived {
                connection: connection.name().into(),
                data,
            });
        }
    }

    fn flush_connections(&mut self) {
        for connection in self.connections() {
            self.flush_connection(&connection);
        }
    }

    fn session_description(&self, media_descriptions: Vec<MediaDescription>) -> SessionDescription {
        let address = TaggedAddress::from(self.local_ip());

        SessionDescription {
            origin: Origin {
                username: "-".into(),
                session_id: self.id,
                session_version: self.version,
                address: address.clone(),
            },
            name: "-".into(),
            connection: Some(sdp_types::Connection::new(address)),
            time: Time::default(),
            group: vec![],
            ice_lite: false,
            ice_ufrag: None,
            ice_pwd: None,
            fingerprint: vec![],
            setup: None,
            attributes: vec![],
            media_descriptions,
        }
    }

    /// Address announced in the session description
    fn local_ip(&self) -> IpAddr {
        if let Some(ip) = self.config.local_address {
            return ip;
        }

        self.host_ips
            .iter()
            .find(|ip| ip.is_ipv6() == self.config.use_ipv6 && !ip.is_loopback())
            .copied()
            .unwrap_or_else(|| self.unspecified_ip())
    }

    fn unspecified_ip(&self) -> IpAddr {
        if self.config.use_ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pipeline::RecordingPipeline;
    use ice::IceEvent;

    fn webrtc_session(bundle: bool) -> Session {
        let config = TransportConfig {
            local_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            bundle,
            ..TransportConfig::webrtc()
        };

        Session::new(config, Box::new(RecordingPipeline::default())).unwrap()
    }

    #[test]
    fn gathering_done_after_last_connection() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut session = webrtc_session(false);
        session.add_local_media(LocalMedia::new(MediaType::Audio, ["0"])).unwrap();
        session.add_local_media(LocalMedia::new(MediaType::Video, ["96"])).unwrap();
        session.add_local_media(LocalMedia::new(MediaType::Audio, ["8"])).unwrap();
        session.create_offer().unwrap();

        let streams: Vec<_> = (0..3)
            .map(|i| session.connection_of_media(i).unwrap().stream_id().unwrap())
            .collect();

        for (n, i) in [2, 0, 1].into_iter().enumerate() {
            while session.pop_event().is_some() {}

            session.handle_ice_event(IceEvent::GatheringDone { stream: streams[i] });

            let done = std::iter::from_fn(|| session.pop_event())
                .filter(|e| matches!(e, SessionEvent::IceGatheringDone))
                .count();

            assert_eq!(done, usize::from(n == 2), "after event {n}");
        }

        // Repeated gathering done is not reported again
        session.handle_ice_event(IceEvent::GatheringDone { stream: streams[1] });
        assert!(
            !std::iter::from_fn(|| session.pop_event())
                .any(|e| matches!(e, SessionEvent::IceGatheringDone))
        );
    }

    #[test]
    fn sockets_are_handed_out_once() {
        let mut session = webrtc_session(true);
        session.add_local_media(LocalMedia::new(MediaType::Audio, ["0"])).unwrap();
        session.add_local_media(LocalMedia::new(MediaType::Video, ["96"])).unwrap();
        session.create_offer().unwrap();

        let binds = std::iter::from_fn(|| session.pop_transport_change())
            .filter(|c| matches!(c, TransportChange::Bind(_)))
            .count();

        // One muxed component of the bundle
        assert_eq!(binds, 1);

        session.close();

        let closed: Vec<_> = std::iter::from_fn(|| session.pop_transport_change()).collect();
        assert!(matches!(closed.as_slice(), [TransportChange::Close(_)]));

        session.close();
        assert!(session.pop_transport_change().is_none());
    }

    #[test]
    fn turn_url_can_be_cleared() {
        let mut session = webrtc_session(true);

        assert!(session.set_turn_url("user:pass@10.0.0.1:3478").is_ok());
        assert_eq!(
            session.config().turn_url.as_deref(),
            Some("user:pass@10.0.0.1:3478")
        );

        assert!(session.set_turn_url("not a turn url").is_err());

        session.set_turn_url("").unwrap();
        assert_eq!(session.config().turn_url, None);
    }
}
