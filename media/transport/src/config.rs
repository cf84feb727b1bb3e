use sdp_types::SrtpSuite;
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

/// Default port of STUN servers
pub const DEFAULT_STUN_SERVER_PORT: u16 = 3478;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Kind of transport negotiated for every media of the session
    pub mode: TransportMode,
    /// Lower bound of the local port range, values up to 1024 are raised to 1025
    pub min_port: u16,
    /// Upper bound of the local port range, 0 means no upper bound
    pub max_port: u16,
    /// Announce IPv6 addresses instead of IPv4 ones
    pub use_ipv6: bool,
    /// Local address sockets are bound to and announced in the session description
    pub local_address: Option<IpAddr>,
    /// Offer and accept bundling all media over a single transport
    pub bundle: bool,
    /// Offer and accept RTCP multiplexed on the RTP port
    pub rtcp_mux: bool,
    /// Announce generic NACK RTCP feedback
    pub rtcp_nack: bool,
    /// Announce receiver estimated maximum bitrate RTCP feedback
    pub rtcp_remb: bool,
    /// SDES crypto suite, `None` disables SDES keyed SRTP
    pub crypto_suite: Option<SrtpSuite>,
    /// Fixed SDES master key (30 to 46 characters), a random one is generated if unset
    pub master_key: Option<String>,
    /// Address of the STUN server used to gather server reflexive candidates
    pub stun_server: Option<IpAddr>,
    pub stun_server_port: u16,
    /// TURN server in the format `user:password@address:port[?transport=udp|tcp|tls]`
    pub turn_url: Option<String>,
    /// PEM file containing the DTLS certificate and its private key
    pub certificate_pem_file: Option<PathBuf>,
}

impl TransportConfig {
    /// Configuration of a plain RTP endpoint, SDES is enabled by setting a crypto suite
    pub fn rtp() -> Self {
        Self {
            mode: TransportMode::Rtp,
            bundle: false,
            rtcp_mux: false,
            rtcp_nack: true,
            rtcp_remb: false,
            ..Self::default()
        }
    }

    /// Configuration of a WebRTC endpoint (ICE + DTLS-SRTP)
    pub fn webrtc() -> Self {
        Self {
            mode: TransportMode::WebRtc,
            bundle: true,
            rtcp_mux: true,
            rtcp_nack: true,
            rtcp_remb: true,
            ..Self::default()
        }
    }

    /// SDES keyed SRTP is used instead of plain RTP
    pub fn use_sdes(&self) -> bool {
        self.mode == TransportMode::Rtp && self.crypto_suite.is_some()
    }

    pub fn turn_server(&self) -> Result<Option<TurnUrl>, TurnUrlError> {
        match self.turn_url.as_deref() {
            None | Some("") => Ok(None),
            Some(url) => url.parse().map(Some),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            min_port: 0,
            max_port: 0,
            use_ipv6: false,
            local_address: None,
            bundle: false,
            rtcp_mux: false,
            rtcp_nack: true,
            rtcp_remb: false,
            crypto_suite: None,
            master_key: None,
            stun_server: None,
            stun_server_port: DEFAULT_STUN_SERVER_PORT,
            turn_url: None,
            certificate_pem_file: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// RTP over UDP socket pairs, optionally protected with SDES keyed SRTP
    #[default]
    Rtp,
    /// ICE + DTLS-SRTP, SCTP data channels over DTLS
    WebRtc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTransport {
    Udp,
    Tcp,
    Tls,
}

impl fmt::Display for TurnTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TurnTransport::Udp => "udp",
            TurnTransport::Tcp => "tcp",
            TurnTransport::Tls => "tls",
        })
    }
}

/// Parsed TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnUrl {
    pub username: String,
    pub password: String,
    pub address: IpAddr,
    pub port: u16,
    pub transport: TurnTransport,
}

#[derive(Debug, thiserror::Error)]
#[error("TURN URL '{0}' not allowed, it must have the format 'user:password@address:port(?transport=[udp|tcp|tls])'")]
pub struct TurnUrlError(String);

impl FromStr for TurnUrl {
    type Err = TurnUrlError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let err = || TurnUrlError(url.into());

        // Credentials may contain '@', the host part never does
        let (credentials, host) = url.rsplit_once('@').ok_or_else(err)?;
        let (username, password) = credentials.split_once(':').ok_or_else(err)?;

        if username.is_empty() || password.is_empty() {
            return Err(err());
        }

        let (host, transport) = match host.split_once('?') {
            Some((host, query)) => {
                let transport = match query.strip_prefix("transport=").ok_or_else(err)? {
                    "udp" => TurnTransport::Udp,
                    "tcp" => TurnTransport::Tcp,
                    "tls" => TurnTransport::Tls,
                    _ => return Err(err()),
                };

                (host, transport)
            }
            None => (host, TurnTransport::Udp),
        };

        // Literal addresses only, IPv6 in brackets
        let addr: SocketAddr = host.parse().map_err(|_| err())?;

        Ok(TurnUrl {
            username: username.into(),
            password: password.into(),
            address: addr.ip(),
            port: addr.port(),
            transport,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn turn_url_defaults_to_udp() {
        let url: TurnUrl = "user:pass@10.0.0.1:3478".parse().unwrap();

        assert_eq!(url.username, "user");
        assert_eq!(url.password, "pass");
        assert_eq!(url.address, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(url.port, 3478);
        assert_eq!(url.transport, TurnTransport::Udp);
    }

    #[test]
    fn turn_url_transport() {
        let url: TurnUrl = "user:p@ss@10.0.0.1:443?transport=tls".parse().unwrap();

        assert_eq!(url.password, "p@ss");
        assert_eq!(url.transport, TurnTransport::Tls);
    }

    #[test]
    fn turn_url_ipv6() {
        let url: TurnUrl = "user:pass@[::1]:3478?transport=tcp".parse().unwrap();

        assert_eq!(url.address, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(url.port, 3478);
        assert_eq!(url.transport, TurnTransport::Tcp);

        let url: TurnUrl = "user:pass@[2001:db8::7]:5349".parse().unwrap();
        assert_eq!(url.address, "2001:db8::7".parse::<IpAddr>().unwrap());
        assert_eq!(url.port, 5349);
    }

    #[test]
    fn turn_url_rejects_invalid() {
        for url in [
            "10.0.0.1:3478",
            "user@10.0.0.1:3478",
            "user:pass@turn.example.com:3478",
            "user:pass@10.0.0.1",
            "user:pass@10.0.0.1:3478?transport=sctp",
            "user:pass@::1:3478",
            "user:pass@[::1]",
            "user:pass@10.0.0.1:",
        ] {
            assert!(url.parse::<TurnUrl>().is_err(), "{url}");
        }
    }

    #[test]
    fn empty_turn_url_clears() {
        let config = TransportConfig {
            turn_url: Some(String::new()),
            ..TransportConfig::webrtc()
        };

        assert!(config.turn_server().unwrap().is_none());
    }

    #[test]
    fn endpoint_defaults() {
        let rtp = TransportConfig::rtp();
        assert!(!rtp.bundle && !rtp.rtcp_mux && rtp.rtcp_nack);
        assert!(!rtp.use_sdes());

        let webrtc = TransportConfig::webrtc();
        assert!(webrtc.bundle && webrtc.rtcp_mux && webrtc.rtcp_nack && webrtc.rtcp_remb);
        assert_eq!(webrtc.stun_server_port, 3478);
    }
}
