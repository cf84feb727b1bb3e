use crate::{
    agent::Agent,
    config::{TransportConfig, TransportMode},
    connection::{Connection, ConnectionError, ConnectionKind},
    pipeline::Pipeline,
    socket::SocketPairAllocator,
};
use ice::{Component, StreamId};
use openssl::ssl::SslContext;
use sdp_types::MediaDescription;
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

/// Name of the connection shared by all bundled media
pub const BUNDLE_CONNECTION_NAME: &str = "bundle0";

impl ConnectionKind {
    /// Connection kind carrying `media` with the given transport configuration
    pub fn for_media(config: &TransportConfig, media: &MediaDescription, bundled: bool) -> Self {
        match config.mode {
            TransportMode::Rtp if config.use_sdes() => ConnectionKind::Srtp,
            TransportMode::Rtp => ConnectionKind::Rtp,
            TransportMode::WebRtc if bundled => ConnectionKind::WebRtcBundle,
            TransportMode::WebRtc if media.media.proto.is_sctp() => ConnectionKind::WebRtcData,
            TransportMode::WebRtc if media.rtcp_mux => ConnectionKind::WebRtcRtcpMux,
            TransportMode::WebRtc => ConnectionKind::WebRtc,
        }
    }
}

/// All connections of a session, keyed by media id or bundle name
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    connections: HashMap<String, Arc<Connection>>,
    sockets: HashMap<SocketAddr, (String, Component)>,
    streams: HashMap<StreamId, String>,
}

impl ConnectionRegistry {
    /// Get the connection named `name` or create a new one of the given kind
    ///
    /// New connections get a socket pair from the configured port range and, for WebRTC, a stream
    /// in the session's ICE agent.
    pub(crate) fn create_connection(
        &mut self,
        name: &str,
        kind: ConnectionKind,
        config: &TransportConfig,
        mut agent: Option<&mut Agent>,
        ssl_context: Option<&SslContext>,
    ) -> Result<Arc<Connection>, ConnectionError> {
        if let Some(connection) = self.connections.get(name) {
            return Ok(connection.clone());
        }

        let allocator = SocketPairAllocator::new(bind_ip(config));
        let sockets = allocator.allocate(config.min_port, config.max_port)?;

        let stream = if kind.is_webrtc() {
            let agent = agent
                .as_deref_mut()
                .ok_or_else(|| ConnectionError::MissingIceAgent(name.into()))?;

            Some(agent.add_stream(name, kind.is_muxed()))
        } else {
            None
        };

        let connection = match Connection::new(
            name.into(),
            kind,
            stream,
            sockets,
            ssl_context.cloned(),
        ) {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                if let (Some(agent), Some(stream)) = (agent.as_deref_mut(), stream) {
                    agent.remove_stream(stream);
                }

                return Err(e);
            }
        };

        for (component, addr) in connection.local_addrs() {
            if let (Some(agent), Some(stream)) = (agent.as_deref_mut(), stream) {
                agent.add_host_addr(stream, component, addr);
            }

            self.sockets.insert(addr, (name.into(), component));
        }

        if let Some(stream) = stream {
            self.streams.insert(stream, name.into());
        }

        self.connections.insert(name.into(), connection.clone());

        Ok(connection)
    }

    pub(crate) fn get_connection(&self, name: &str) -> Option<&Arc<Connection>> {
        self.connections.get(name)
    }

    /// Connection & component owning the socket bound to `addr`
    pub(crate) fn by_socket(&self, addr: SocketAddr) -> Option<(&Arc<Connection>, Component)> {
        let (name, component) = self.sockets.get(&addr)?;

        Some((self.connections.get(name)?, *component))
    }

    pub(crate) fn by_stream(&self, stream: StreamId) -> Option<&Arc<Connection>> {
        self.connections.get(self.streams.get(&stream)?)
    }

    pub(crate) fn connections(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.connections.values()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Release a connection with its elements, ICE stream and sockets
    ///
    /// Returns the addresses of the released sockets, nothing if the connection is already gone.
    pub(crate) fn remove_connection(
        &mut self,
        name: &str,
        agent: Option<&mut Agent>,
        pipeline: &mut dyn Pipeline,
    ) -> Vec<SocketAddr> {
        let Some(connection) = self.connections.remove(name) else {
            return vec![];
        };

        connection.remove(pipeline);

        if let (Some(agent), Some(stream)) = (agent, connection.stream_id()) {
            agent.remove_stream(stream);
            self.streams.remove(&stream);
        }

        let addrs: Vec<SocketAddr> = connection
            .local_addrs()
            .into_iter()
            .map(|(_, addr)| addr)
            .collect();

        for addr in &addrs {
            self.sockets.remove(addr);
        }

        addrs
    }

    pub(crate) fn remove_all(
        &mut self,
        mut agent: Option<&mut Agent>,
        pipeline: &mut dyn Pipeline,
    ) -> Vec<SocketAddr> {
        let names: Vec<String> = self.connections.keys().cloned().collect();

        names
            .iter()
            .flat_map(|name| self.remove_connection(name, agent.as_deref_mut(), pipeline))
            .collect()
    }
}

/// Address sockets are bound to, the configured local address or the unspecified one
pub(crate) fn bind_ip(config: &TransportConfig) -> IpAddr {
    match config.local_address {
        Some(ip) => ip,
        None if config.use_ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sdp_types::{MediaType, TransportProtocol};

    fn localhost(config: TransportConfig) -> TransportConfig {
        TransportConfig {
            local_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..config
        }
    }

    #[test]
    fn kind_dispatch() {
        let mut media = MediaDescription::new(
            MediaType::Audio,
            9,
            TransportProtocol::UdpTlsRtpSavpf,
            vec!["0".into()],
        );

        let webrtc = TransportConfig::webrtc();
        assert_eq!(ConnectionKind::for_media(&webrtc, &media, true), ConnectionKind::WebRtcBundle);
        assert_eq!(ConnectionKind::for_media(&webrtc, &media, false), ConnectionKind::WebRtc);

        media.rtcp_mux = true;
        assert_eq!(ConnectionKind::for_media(&webrtc, &media, false), ConnectionKind::WebRtcRtcpMux);

        let data = MediaDescription::new(
            MediaType::App,
            9,
            TransportProtocol::UdpDtlsSctp,
            vec!["webrtc-datachannel".into()],
        );
        assert_eq!(ConnectionKind::for_media(&webrtc, &data, false), ConnectionKind::WebRtcData);

        let rtp = TransportConfig::rtp();
        assert_eq!(ConnectionKind::for_media(&rtp, &media, false), ConnectionKind::Rtp);

        let sdes = TransportConfig {
            crypto_suite: Some(sdp_types::SrtpSuite::AES_CM_128_HMAC_SHA1_80),
            ..TransportConfig::rtp()
        };
        assert_eq!(ConnectionKind::for_media(&sdes, &media, false), ConnectionKind::Srtp);
    }

    #[test]
    fn one_connection_per_name() {
        let config = localhost(TransportConfig::rtp());
        let mut registry = ConnectionRegistry::default();

        let a = registry
            .create_connection("audio0", ConnectionKind::Rtp, &config, None, None)
            .unwrap();
        let b = registry
            .create_connection("audio0", ConnectionKind::Rtp, &config, None, None)
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));

        let rtp = a.local_addr(Component::Rtp).unwrap();
        let (found, component) = registry.by_socket(rtp).unwrap();
        assert!(Arc::ptr_eq(found, &a));
        assert_eq!(component, Component::Rtp);
    }

    #[test]
    fn webrtc_requires_agent() {
        let config = localhost(TransportConfig::webrtc());
        let mut registry = ConnectionRegistry::default();

        assert!(matches!(
            registry.create_connection("audio0", ConnectionKind::WebRtc, &config, None, None),
            Err(ConnectionError::MissingIceAgent(_))
        ));
        assert!(registry.is_empty());
    }
}
