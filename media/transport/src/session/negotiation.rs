use super::{LocalMediaId, MediaSlot, Session, TransportChange};
use crate::{
    config::TransportMode,
    connection::{Connection, ConnectionError, ConnectionKind, datachannel_port},
    registry::BUNDLE_CONNECTION_NAME,
    sdes::SdesError,
};
use ice::Component;
use sdp_types::{
    Group, MediaDescription, MediaType, ParseSessionDescriptionError, Rtcp, Sctpmap,
    SessionDescription, Setup, TaggedAddress, TransportProtocol, UnknownAttribute,
};
use std::{collections::HashMap, sync::Arc};

/// Local SCTP port offered for data channels
const SCTP_PORT: u16 = 5000;
const SCTP_MAX_STREAMS: u32 = 1024;

const DATACHANNEL_APP: &str = "webrtc-datachannel";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferCreated,
    AnswerApplied,
    Negotiated,
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("operation not possible in negotiation state {0:?}")]
    WrongState(NegotiationState),
    #[error("remote session description has not been set")]
    MissingRemoteSdp,
    #[error("media type {0} is not supported in this transport mode")]
    UnsupportedMedia(MediaType),
    #[error("no local media to offer")]
    NoLocalMedia,
    #[error(transparent)]
    Parse(#[from] ParseSessionDescriptionError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Sdes(#[from] SdesError),
}

/// Media the endpoint is able to send and receive
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub media_type: MediaType,
    /// Formats (payload types) in order of preference, empty accepts whatever the peer offers
    pub fmts: Vec<String>,
    /// Attributes added to every media description of this media, e.g. `rtpmap`
    pub attributes: Vec<UnknownAttribute>,
}

impl LocalMedia {
    pub fn new(media_type: MediaType, fmts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            media_type,
            fmts: fmts.into_iter().map(Into::into).collect(),
            attributes: vec![],
        }
    }

    pub fn with_attribute(mut self, name: &str, value: Option<&str>) -> Self {
        self.attributes.push(UnknownAttribute {
            name: name.into(),
            value: value.map(Into::into),
        });
        self
    }
}

/// Transport protocol & attributes used for a kind of media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandler {
    pub proto: TransportProtocol,
    pub attributes: Vec<UnknownAttribute>,
}

impl Session {
    /// Add media to offer or to accept from an offer, each local media is used by a single `m=` line
    pub fn add_local_media(&mut self, media: LocalMedia) -> Result<LocalMediaId, NegotiationError> {
        self.create_media_handler(media.media_type)?;

        Ok(self.local_media.insert(media))
    }

    /// Transport protocol & feedback attributes for `media_type` in the configured mode
    pub fn create_media_handler(&self, media_type: MediaType) -> Result<MediaHandler, NegotiationError> {
        let webrtc = self.config.mode == TransportMode::WebRtc;

        if media_type == MediaType::App {
            if !webrtc {
                return Err(NegotiationError::UnsupportedMedia(media_type));
            }

            return Ok(MediaHandler {
                proto: TransportProtocol::DtlsSctp,
                attributes: vec![],
            });
        }

        let feedback = self.config.rtcp_nack || self.config.rtcp_remb;

        let proto = match (webrtc, self.config.use_sdes(), feedback) {
            (true, _, _) => TransportProtocol::UdpTlsRtpSavpf,
            (false, true, true) => TransportProtocol::RtpSavpf,
            (false, true, false) => TransportProtocol::RtpSavp,
            (false, false, true) => TransportProtocol::RtpAvpf,
            (false, false, false) => TransportProtocol::RtpAvp,
        };

        let mut attributes = vec![];

        if self.config.rtcp_nack {
            attributes.push(rtcp_fb("* nack"));
            attributes.push(rtcp_fb("* nack pli"));
        }

        if self.config.rtcp_remb {
            attributes.push(rtcp_fb("* goog-remb"));
        }

        Ok(MediaHandler { proto, attributes })
    }

    /// Create an offer containing every local media
    pub fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        if self.state != NegotiationState::New {
            return Err(NegotiationError::WrongState(self.state));
        }

        if self.local_media.is_empty() {
            return Err(NegotiationError::NoLocalMedia);
        }

        self.undo_on_error(Self::build_offer)
    }

    fn build_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let bundle = self.bundle_enabled();
        let webrtc = self.config.mode == TransportMode::WebRtc;

        let mut type_counts: HashMap<MediaType, usize> = HashMap::new();
        let mut media_descriptions = vec![];
        let mut mids = vec![];

        let local_media: Vec<LocalMedia> = self.local_media.values().cloned().collect();

        for local in local_media {
            let handler = self.create_media_handler(local.media_type)?;

            let count = type_counts.entry(local.media_type).or_default();
            let mid = format!("{}{count}", local.media_type);
            *count += 1;

            let is_app = local.media_type == MediaType::App;

            let fmts = if is_app {
                vec![SCTP_PORT.to_string()]
            } else {
                local.fmts.clone()
            };

            let mut desc = MediaDescription::new(local.media_type, 9, handler.proto, fmts);
            desc.mid = Some(mid.clone());
            desc.attributes = handler.attributes;
            desc.attributes.extend(local.attributes);
            desc.rtcp_mux = webrtc && !is_app && (bundle || self.config.rtcp_mux);

            if is_app {
                desc.sctpmap.push(Sctpmap {
                    port: SCTP_PORT,
                    app: DATACHANNEL_APP.into(),
                    streams: Some(SCTP_MAX_STREAMS),
                });
            }

            if webrtc {
                desc.setup = Some(Setup::ActPass);
            }

            let name = if bundle {
                BUNDLE_CONNECTION_NAME.to_string()
            } else {
                mid.clone()
            };

            let kind = ConnectionKind::for_media(&self.config, &desc, bundle);
            let connection = self.create_connection(&name, kind)?;

            if let Some(sdes) = &mut self.sdes {
                sdes.add_media(&mid);
                desc.crypto = sdes.on_offer_keys(&mid)?;
            }

            self.configure_media(&mut desc, &connection);

            self.media.push(MediaSlot {
                mid: mid.clone(),
                media_type: local.media_type,
                proto: desc.media.proto.clone(),
                connection: Some(name),
                active: true,
            });

            mids.push(mid);
            media_descriptions.push(desc);
        }

        let mut offer = self.session_description(media_descriptions);

        if bundle {
            offer.group.push(Group {
                typ: "BUNDLE".into(),
                mids,
            });
        }

        self.local_sdp = Some(offer.clone());
        self.is_offerer = true;
        self.state = NegotiationState::OfferCreated;

        Ok(offer)
    }

    /// Answer a remote offer and start the transports of every accepted media
    ///
    /// Media which cannot be accepted is rejected in the answer. If the transports cannot be
    /// started, every connection is released and the session stays [`NegotiationState::New`].
    pub fn process_offer(&mut self, offer: &str) -> Result<SessionDescription, NegotiationError> {
        if self.state != NegotiationState::New {
            return Err(NegotiationError::WrongState(self.state));
        }

        let offer = SessionDescription::parse(offer)?;

        self.undo_on_error(|session| session.answer_offer(offer))
    }

    fn answer_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription, NegotiationError> {
        let mut used_local_media = vec![];
        let mut media_descriptions = vec![];
        let mut bundle_mids = vec![];

        for (index, remote) in offer.media_descriptions.iter().enumerate() {
            let mid = remote
                .mid
                .clone()
                .unwrap_or_else(|| format!("{}{index}", remote.media.media_type));

            let bundled = self.bundle_enabled()
                && remote
                    .mid
                    .as_deref()
                    .is_some_and(|mid| offer.bundle_group_of(mid).is_some());

            let accepted =
                self.answer_media(&offer, remote, &mid, bundled, &mut used_local_media)?;

            let Some((desc, connection)) = accepted else {
                media_descriptions.push(rejected_answer(remote));
                self.media.push(MediaSlot {
                    mid,
                    media_type: remote.media.media_type,
                    proto: remote.media.proto.clone(),
                    connection: None,
                    active: false,
                });
                continue;
            };

            if bundled {
                bundle_mids.push(mid.clone());
            }

            self.media.push(MediaSlot {
                mid,
                media_type: remote.media.media_type,
                proto: desc.media.proto.clone(),
                connection: Some(connection),
                active: true,
            });
            media_descriptions.push(desc);
        }

        let mut answer = self.session_description(media_descriptions);

        if !bundle_mids.is_empty() {
            answer.group.push(Group {
                typ: "BUNDLE".into(),
                mids: bundle_mids,
            });
        }

        self.remote_sdp = Some(offer);
        self.local_sdp = Some(answer.clone());
        self.is_offerer = false;
        self.state = NegotiationState::AnswerApplied;

        self.start_transport_send(false)?;

        Ok(answer)
    }

    /// Apply the peer's answer to the offer created with [`create_offer`](Self::create_offer)
    ///
    /// Media the answer rejected, answered with a different protocol or could not be keyed becomes
    /// inactive. If the transports cannot be started, every connection is released and the session
    /// returns to [`NegotiationState::New`].
    pub fn process_answer(&mut self, answer: &str) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::OfferCreated {
            return Err(NegotiationError::WrongState(self.state));
        }

        let answer = SessionDescription::parse(answer)?;

        self.undo_on_error(|session| session.apply_answer(answer))
    }

    fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.bundle_enabled() && !answer.group.iter().any(Group::is_bundle) {
            log::debug!("Answer does not bundle, keeping the shared transport");
        }

        for (index, slot) in self.media.iter_mut().enumerate() {
            let remote = answer
                .media_descriptions
                .get(index)
                .filter(|remote| !remote.is_rejected() && remote.media.media_type == slot.media_type);

            let Some(remote) = remote else {
                log::debug!("Media {} has been rejected by the answer", slot.mid);
                slot.active = false;
                continue;
            };

            if !protocols_compatible(&slot.proto, &remote.media.proto) {
                log::warn!(
                    "Disabling media {}, answered protocol {} does not match {}",
                    slot.mid,
                    remote.media.proto,
                    slot.proto
                );
                slot.active = false;
                continue;
            }

            let Some(sdes) = &mut self.sdes else {
                continue;
            };

            let result = match remote.crypto.first() {
                Some(selected) => sdes.on_selected_key(&slot.mid, selected, self.pipeline.as_mut()),
                None => Err(SdesError::NoKeysOffered),
            };

            if let Err(e) = result {
                log::warn!("Disabling media {}, {e}", slot.mid);
                slot.active = false;
            }
        }

        self.remote_sdp = Some(answer);
        self.state = NegotiationState::AnswerApplied;

        self.start_transport_send(true)
    }

    /// Fill the transport part of a local media description from its connection
    pub(super) fn configure_media(&mut self, desc: &mut MediaDescription, connection: &Arc<Connection>) {
        desc.connection = None;
        desc.rtcp = None;
        desc.ice_candidates.clear();
        desc.ice_end_of_candidates = false;

        if !connection.kind().is_webrtc() {
            if let Some(rtp) = connection.local_addr(Component::Rtp) {
                desc.media.port = rtp.port();
            }

            desc.connection = Some(sdp_types::Connection::new(self.local_ip().into()));

            let (Some(sdes), Some(mid)) = (&mut self.sdes, &desc.mid) else {
                return;
            };

            if let Err(e) = sdes.configure_connection_keys(mid, connection, self.pipeline.as_mut()) {
                log::warn!("Keys of media {mid} not installed, {e}");
            }

            return;
        }

        // Placeholders until gathering completed
        let unspecified = TaggedAddress::from(self.unspecified_ip());

        desc.media.port = 9;
        desc.connection = Some(sdp_types::Connection::new(unspecified.clone()));

        if !desc.rtcp_mux {
            desc.rtcp = Some(Rtcp {
                port: 9,
                address: Some(unspecified),
            });
        }

        if let (Some(agent), Some(stream)) = (&self.agent, connection.stream_id()) {
            if let Some(credentials) = agent.get_local_credentials(stream) {
                desc.ice_ufrag = Some(credentials.ufrag.clone());
                desc.ice_pwd = Some(credentials.pwd.clone());
            }

            desc.ice_candidates = agent.local_candidates(stream);
        }

        desc.fingerprint = self.fingerprint.iter().cloned().collect();
    }

    /// Run a negotiation step, on error everything it created is released and the session is `New` again
    fn undo_on_error<T>(
        &mut self,
        step: impl FnOnce(&mut Self) -> Result<T, NegotiationError>,
    ) -> Result<T, NegotiationError> {
        let result = step(self);

        if let Err(e) = &result {
            log::warn!("Negotiation failed, releasing its connections, {e}");
            self.abort_negotiation();
        }

        result
    }

    fn abort_negotiation(&mut self) {
        let addrs = self
            .registry
            .remove_all(self.agent.as_mut(), self.pipeline.as_mut());

        self.transport_changes
            .extend(addrs.into_iter().map(TransportChange::Close));

        if let Some(sdes) = &mut self.sdes {
            sdes.clear_media();
        }

        self.media.clear();
        self.local_sdp = None;
        self.remote_sdp = None;
        self.is_offerer = false;
        self.gathering_done = false;
        self.state = NegotiationState::New;
    }

    fn bundle_enabled(&self) -> bool {
        self.config.bundle && self.config.mode == TransportMode::WebRtc
    }

    /// Build the answer for a single remote media, `None` rejects it
    fn answer_media(
        &mut self,
        offer: &SessionDescription,
        remote: &MediaDescription,
        mid: &str,
        bundled: bool,
        used_local_media: &mut Vec<LocalMediaId>,
    ) -> Result<Option<(MediaDescription, String)>, NegotiationError> {
        if remote.is_rejected() {
            return Ok(None);
        }

        let media_type = remote.media.media_type;

        let local = self
            .local_media
            .iter()
            .find(|(id, local)| local.media_type == media_type && !used_local_media.contains(id));

        let Some((local_id, local)) = local else {
            log::debug!("Rejecting media {mid}, no local {media_type} media available");
            return Ok(None);
        };

        let local = local.clone();

        let handler = match self.create_media_handler(media_type) {
            Ok(handler) => handler,
            Err(e) => {
                log::warn!("Rejecting media {mid}, {e}");
                return Ok(None);
            }
        };

        if !protocols_compatible(&handler.proto, &remote.media.proto) {
            log::warn!(
                "Rejecting media {mid}, protocol {} does not match {}",
                remote.media.proto,
                handler.proto
            );
            return Ok(None);
        }

        let is_app = media_type == MediaType::App;

        let (fmts, sctpmap) = if is_app {
            if datachannel_port(remote).is_none() {
                log::warn!("Rejecting media {mid}, no {DATACHANNEL_APP} format offered");
                return Ok(None);
            }

            let sctpmap = Sctpmap {
                port: SCTP_PORT,
                app: DATACHANNEL_APP.into(),
                streams: Some(SCTP_MAX_STREAMS),
            };

            (vec![SCTP_PORT.to_string()], vec![sctpmap])
        } else {
            let fmts: Vec<String> = remote
                .media
                .fmts
                .iter()
                .filter(|fmt| local.fmts.is_empty() || local.fmts.contains(fmt))
                .cloned()
                .collect();

            if fmts.is_empty() {
                log::debug!("Rejecting media {mid}, no common format");
                return Ok(None);
            }

            (fmts, vec![])
        };

        let mut desc = MediaDescription::new(media_type, 9, remote.media.proto.clone(), fmts.clone());
        desc.mid = remote.mid.clone();
        desc.direction = remote.direction.flipped();
        desc.sctpmap = sctpmap;

        desc.attributes = remote
            .attributes
            .iter()
            .filter(|attr| format_attribute_matches(attr, &fmts))
            .cloned()
            .collect();

        if is_feedback_profile(&remote.media.proto) {
            for attr in handler.attributes {
                if !desc.attributes.contains(&attr) {
                    desc.attributes.push(attr);
                }
            }
        }

        desc.attributes.extend(local.attributes);

        let webrtc = self.config.mode == TransportMode::WebRtc;

        if webrtc {
            desc.rtcp_mux = !is_app && (bundled || (self.config.rtcp_mux && remote.rtcp_mux));

            let offered = remote.setup.or(offer.setup).unwrap_or(Setup::ActPass);
            desc.setup = Some(offered.answer());
        }

        if let Some(sdes) = &mut self.sdes {
            sdes.add_media(mid);

            match sdes.on_answer_keys(mid, &remote.crypto) {
                Ok(crypto) => desc.crypto = vec![crypto],
                Err(e) => {
                    log::warn!("Rejecting media {mid}, {e}");
                    sdes.remove_media(mid);
                    return Ok(None);
                }
            }
        }

        let name = if bundled {
            BUNDLE_CONNECTION_NAME.to_string()
        } else {
            mid.to_string()
        };

        let kind = ConnectionKind::for_media(&self.config, &desc, bundled);
        let connection = self.create_connection(&name, kind)?;

        // Keys are bound to the media id, which an answer without mid does not carry
        let keyed_mid = desc.mid.replace(mid.into());
        self.configure_media(&mut desc, &connection);
        desc.mid = keyed_mid;

        used_local_media.push(local_id);

        Ok(Some((desc, name)))
    }
}

fn rtcp_fb(value: &str) -> UnknownAttribute {
    UnknownAttribute {
        name: "rtcp-fb".into(),
        value: Some(value.into()),
    }
}

/// Both sides must agree on DTLS, SDES and SCTP usage
fn protocols_compatible(local: &TransportProtocol, remote: &TransportProtocol) -> bool {
    if matches!(remote, TransportProtocol::Other(_) | TransportProtocol::Unspecified) {
        return false;
    }

    local.is_dtls() == remote.is_dtls()
        && local.is_sdes() == remote.is_sdes()
        && local.is_sctp() == remote.is_sctp()
}

fn is_feedback_profile(proto: &TransportProtocol) -> bool {
    matches!(
        proto,
        TransportProtocol::RtpAvpf | TransportProtocol::RtpSavpf | TransportProtocol::UdpTlsRtpSavpf
    )
}

/// `rtpmap`, `fmtp` and `rtcp-fb` attributes of the accepted formats
fn format_attribute_matches(attr: &UnknownAttribute, fmts: &[String]) -> bool {
    if !matches!(attr.name.as_str(), "rtpmap" | "fmtp" | "rtcp-fb") {
        return false;
    }

    let Some(format) = attr.value.as_deref().and_then(|v| v.split_whitespace().next()) else {
        return false;
    };

    (attr.name == "rtcp-fb" && format == "*") || fmts.iter().any(|fmt| fmt == format)
}

fn rejected_answer(remote: &MediaDescription) -> MediaDescription {
    let mut desc = MediaDescription::rejected(remote.media.media_type, remote.media.proto.clone());
    desc.media.fmts = remote.media.fmts.clone();
    desc.mid = remote.mid.clone();
    desc
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::TransportConfig, pipeline::RecordingPipeline};
    use std::net::{IpAddr, Ipv4Addr};

    fn session(config: TransportConfig) -> Session {
        let config = TransportConfig {
            local_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..config
        };

        Session::new(config, Box::new(RecordingPipeline::default())).unwrap()
    }

    #[test]
    fn media_handlers() {
        let rtp = session(TransportConfig {
            rtcp_nack: false,
            ..TransportConfig::rtp()
        });
        assert_eq!(
            rtp.create_media_handler(MediaType::Audio).unwrap().proto,
            TransportProtocol::RtpAvp
        );
        assert!(matches!(
            rtp.create_media_handler(MediaType::App),
            Err(NegotiationError::UnsupportedMedia(MediaType::App))
        ));

        let webrtc = session(TransportConfig::webrtc());
        let video = webrtc.create_media_handler(MediaType::Video).unwrap();
        assert_eq!(video.proto, TransportProtocol::UdpTlsRtpSavpf);
        assert_eq!(
            video.attributes,
            vec![rtcp_fb("* nack"), rtcp_fb("* nack pli"), rtcp_fb("* goog-remb")]
        );
        assert_eq!(
            webrtc.create_media_handler(MediaType::App).unwrap().proto,
            TransportProtocol::DtlsSctp
        );
    }

    #[test]
    fn protocol_families() {
        use TransportProtocol::*;

        assert!(protocols_compatible(&RtpAvpf, &RtpAvp));
        assert!(protocols_compatible(&RtpSavp, &RtpSavpf));
        assert!(protocols_compatible(&UdpTlsRtpSavpf, &UdpTlsRtpSavp));
        assert!(protocols_compatible(&DtlsSctp, &UdpDtlsSctp));
        assert!(!protocols_compatible(&RtpAvp, &RtpSavp));
        assert!(!protocols_compatible(&UdpTlsRtpSavpf, &RtpSavpf));
        assert!(!protocols_compatible(&RtpAvp, &Other("TCP/RTP/AVP".into())));
    }

    #[test]
    fn offer_state_machine() {
        let mut session = session(TransportConfig::rtp());

        assert!(matches!(session.create_offer(), Err(NegotiationError::NoLocalMedia)));

        session.add_local_media(LocalMedia::new(MediaType::Audio, ["0", "8"])).unwrap();
        let offer = session.create_offer().unwrap();

        assert_eq!(session.negotiation_state(), NegotiationState::OfferCreated);
        assert!(session.is_offerer());
        assert!(matches!(
            session.create_offer(),
            Err(NegotiationError::WrongState(NegotiationState::OfferCreated))
        ));
        assert!(matches!(
            session.process_offer(&offer.to_string()),
            Err(NegotiationError::WrongState(_))
        ));

        let audio = &offer.media_descriptions[0];
        let connection = session.connection("audio0").unwrap();
        assert_eq!(audio.media.port, connection.local_addr(Component::Rtp).unwrap().port());
        assert_eq!(audio.media.proto, TransportProtocol::RtpAvpf);
        assert_eq!(audio.mid.as_deref(), Some("audio0"));
    }

    #[test]
    fn answer_rejects_unusable_media() {
        let mut session = session(TransportConfig::rtp());
        session.add_local_media(LocalMedia::new(MediaType::Audio, ["0"])).unwrap();

        let offer = "v=0\r\n\
            o=- 1 1 IN IP4 127.0.0.1\r\n\
            s=-\r\n\
            c=IN IP4 127.0.0.1\r\n\
            t=0 0\r\n\
            m=audio 40000 RTP/AVP 8 0\r\n\
            a=rtpmap:8 PCMA/8000\r\n\
            a=rtpmap:0 PCMU/8000\r\n\
            m=video 40002 RTP/AVP 96\r\n\
            m=audio 40004 RTP/SAVP 0\r\n";

        let answer = session.process_offer(offer).unwrap();

        assert_eq!(session.negotiation_state(), NegotiationState::Negotiated);
        assert!(!session.is_offerer());

        let audio = &answer.media_descriptions[0];
        assert!(!audio.is_rejected());
        assert_eq!(audio.media.fmts, vec!["0".to_string()]);
        assert_eq!(audio.attribute("rtpmap"), Some("0 PCMU/8000"));

        // No local video, and the single local audio is already in use
        assert!(answer.media_descriptions[1].is_rejected());
        assert!(answer.media_descriptions[2].is_rejected());

        let connection = session.connection_of_media(0).unwrap();
        assert_eq!(
            connection.remote_addr(Component::Rtp),
            Some("127.0.0.1:40000".parse().unwrap())
        );
        assert_eq!(
            connection.remote_addr(Component::Rtcp),
            Some("127.0.0.1:40001".parse().unwrap())
        );
        assert!(connection.is_connected());
    }
}
