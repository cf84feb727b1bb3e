use crate::parser::Parser;
use crate::{
    Connection, Fingerprint, Group, MediaDescription, Origin, ParseSessionDescriptionError,
    Setup, Time, UnknownAttribute,
};
use std::fmt;
use std::str::FromStr;

/// The Session Description Protocol
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// Origin (o=)
    pub origin: Origin,

    /// Session name (s=)
    pub name: String,

    /// Optional connection (c=)
    pub connection: Option<Connection>,

    /// Time (t=)
    pub time: Time,

    /// Group attributes (a=group)
    pub group: Vec<Group>,

    /// ICE lite implementation (a=ice-lite)
    pub ice_lite: bool,

    /// Session level ICE username fragment
    pub ice_ufrag: Option<String>,

    /// Session level ICE password
    pub ice_pwd: Option<String>,

    /// Session level fingerprints
    pub fingerprint: Vec<Fingerprint>,

    /// Session level setup attribute
    pub setup: Option<Setup>,

    /// Additional attributes
    pub attributes: Vec<UnknownAttribute>,

    /// Media descriptions
    pub media_descriptions: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn parse(src: &str) -> Result<Self, ParseSessionDescriptionError> {
        let mut parser = Parser::default();

        for line in src.lines() {
            let line = line.trim();

            if line.is_empty() {
                continue;
            }

            parser.parse_line(line)?;
        }

        parser.finish()
    }

    /// Returns the bundle group the media with the given mid belongs to
    pub fn bundle_group_of(&self, mid: &str) -> Option<&Group> {
        self.group
            .iter()
            .find(|group| group.is_bundle() && group.mids.iter().any(|m| m == mid))
    }

    /// ICE username fragment of the media, falls back to the session level attribute
    pub fn ice_ufrag_of<'a>(&'a self, media: &'a MediaDescription) -> Option<&'a str> {
        media.ice_ufrag.as_deref().or(self.ice_ufrag.as_deref())
    }

    /// ICE password of the media, falls back to the session level attribute
    pub fn ice_pwd_of<'a>(&'a self, media: &'a MediaDescription) -> Option<&'a str> {
        media.ice_pwd.as_deref().or(self.ice_pwd.as_deref())
    }

    /// Fingerprints of the media, falls back to the session level attributes
    pub fn fingerprints_of<'a>(&'a self, media: &'a MediaDescription) -> &'a [Fingerprint] {
        if media.fingerprint.is_empty() {
            &self.fingerprint
        } else {
            &media.fingerprint
        }
    }

    /// Connection of the media, falls back to the session level connection
    pub fn connection_of<'a>(&'a self, media: &'a MediaDescription) -> Option<&'a Connection> {
        media.connection.as_ref().or(self.connection.as_ref())
    }
}

impl FromStr for SessionDescription {
    type Err = ParseSessionDescriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(f, "o={}\r\n", self.origin)?;
        write!(f, "s={}\r\n", self.name)?;

        if let Some(conn) = &self.connection {
            write!(f, "c={conn}\r\n")?;
        }

        write!(f, "t={}\r\n", self.time)?;

        for group in &self.group {
            write!(f, "a=group:{group}\r\n")?;
        }

        if self.ice_lite {
            write!(f, "a=ice-lite\r\n")?;
        }

        if let Some(ufrag) = &self.ice_ufrag {
            write!(f, "a=ice-ufrag:{ufrag}\r\n")?;
        }

        if let Some(pwd) = &self.ice_pwd {
            write!(f, "a=ice-pwd:{pwd}\r\n")?;
        }

        for fingerprint in &self.fingerprint {
            write!(f, "a=fingerprint:{fingerprint}\r\n")?;
        }

        if let Some(setup) = self.setup {
            write!(f, "a=setup:{setup}\r\n")?;
        }

        for attr in &self.attributes {
            write!(f, "{attr}\r\n")?;
        }

        for media_description in &self.media_descriptions {
            write!(f, "{media_description}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{FingerprintAlgorithm, MediaType, SrtpSuite, TaggedAddress, TransportProtocol};
    use std::net::Ipv4Addr;

    const WEBRTC_OFFER: &str = "v=0\r
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r
s=-\r
t=0 0\r
a=group:BUNDLE 0 1\r
a=fingerprint:sha-256 0A:1B:2C:3D\r
m=audio 9 UDP/TLS/RTP/SAVPF 111\r
c=IN IP4 0.0.0.0\r
a=rtcp:9 IN IP4 0.0.0.0\r
a=ice-ufrag:abcd\r
a=ice-pwd:abcdefghijklmnopqrstuvwx\r
a=setup:actpass\r
a=mid:0\r
a=sendrecv\r
a=rtcp-mux\r
a=rtpmap:111 opus/48000/2\r
a=candidate:1 1 udp 2122260223 192.168.1.2 54400 typ host\r
m=application 9 DTLS/SCTP 5000\r
c=IN IP4 0.0.0.0\r
a=mid:1\r
a=sctpmap:5000 webrtc-datachannel 1024\r
";

    #[test]
    fn parse_webrtc_offer() {
        let sdp = SessionDescription::parse(WEBRTC_OFFER).unwrap();

        assert_eq!(sdp.origin.session_version, 2);
        assert_eq!(sdp.group.len(), 1);
        assert_eq!(sdp.media_descriptions.len(), 2);

        let audio = &sdp.media_descriptions[0];
        assert_eq!(audio.media.media_type, MediaType::Audio);
        assert_eq!(audio.media.proto, TransportProtocol::UdpTlsRtpSavpf);
        assert!(audio.rtcp_mux);
        assert_eq!(audio.mid.as_deref(), Some("0"));
        assert_eq!(audio.setup, Some(Setup::ActPass));
        assert_eq!(audio.ice_candidates.len(), 1);
        assert_eq!(audio.attribute("rtpmap"), Some("111 opus/48000/2"));
        assert_eq!(sdp.ice_ufrag_of(audio), Some("abcd"));
        assert_eq!(
            sdp.fingerprints_of(audio)[0].algorithm,
            FingerprintAlgorithm::SHA256
        );

        let data = &sdp.media_descriptions[1];
        assert!(data.media.proto.is_sctp());
        assert_eq!(data.sctpmap[0].port, 5000);
        assert_eq!(sdp.bundle_group_of("1").map(|g| g.mids.len()), Some(2));
    }

    #[test]
    fn print_and_parse_again() {
        let sdp = SessionDescription::parse(WEBRTC_OFFER).unwrap();
        let printed = sdp.to_string();
        let reparsed = SessionDescription::parse(&printed).unwrap();

        assert_eq!(sdp, reparsed);
    }

    #[test]
    fn parse_sdes_offer() {
        let sdp = SessionDescription::parse(
            "v=0\r
o=- 1 1 IN IP4 10.0.0.1\r
s=call\r
c=IN IP4 10.0.0.1\r
t=0 0\r
m=audio 40000 RTP/SAVP 0\r
a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:WVNfX19zZW1jdGwgKCkgewkyMjA7fQp9CnVubGVz\r
",
        )
        .unwrap();

        let audio = &sdp.media_descriptions[0];
        assert_eq!(audio.crypto[0].suite, SrtpSuite::AES_CM_128_HMAC_SHA1_80);
        assert_eq!(
            sdp.connection_of(audio).map(|c| &c.address),
            Some(&TaggedAddress::IP4(Ipv4Addr::new(10, 0, 0, 1)))
        );
    }

    #[test]
    fn missing_origin() {
        let err = SessionDescription::parse("v=0\r\ns=-\r\nt=0 0\r\n").unwrap_err();

        assert!(matches!(err, ParseSessionDescriptionError::MissingOrigin));
    }
}
