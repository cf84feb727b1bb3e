use super::{
    NegotiationError, NegotiationState, PendingCandidate, Session, SessionEvent, TransportChange,
};
use crate::{
    agent::Agent,
    connection::{Connection, datachannel_port},
};
use ice::{Component, ComponentState, IceEvent, StreamId};
use sdp_types::{
    IceCandidate, MediaDescription, MediaType, Rtcp, SessionDescription, Setup, UntaggedAddress,
};
use std::{
    mem,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

impl Session {
    /// Start sending on every negotiated connection
    ///
    /// The offerer becomes the controlling ICE agent. Remote credentials, fingerprints and
    /// candidates of the remote description are handed to the transports, then all candidates
    /// buffered by [`add_ice_candidate`](Self::add_ice_candidate) are replayed.
    pub(super) fn start_transport_send(&mut self, offerer: bool) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::AnswerApplied {
            return Err(NegotiationError::WrongState(self.state));
        }

        let remote_sdp = self
            .remote_sdp
            .clone()
            .ok_or(NegotiationError::MissingRemoteSdp)?;
        let local_sdp = self
            .local_sdp
            .clone()
            .ok_or(NegotiationError::WrongState(self.state))?;

        if let Some(agent) = &mut self.agent {
            agent.set_controlling(offerer);
        }

        let mut activated: Vec<String> = vec![];

        for (index, slot) in self.media.clone().into_iter().enumerate() {
            if !slot.active {
                continue;
            }

            let Some(name) = slot.connection else {
                continue;
            };

            let (Some(remote), Some(local)) = (
                remote_sdp.media_descriptions.get(index),
                local_sdp.media_descriptions.get(index),
            ) else {
                continue;
            };

            let Some(connection) = self.registry.get_connection(&name).cloned() else {
                log::error!("Connection {name} of media {} does not exist", slot.mid);
                continue;
            };

            if let (Some(agent), Some(stream)) = (&mut self.agent, connection.stream_id()) {
                for candidate in &remote.ice_candidates {
                    agent.add_ice_candidate(stream, candidate);
                }
            }

            if activated.contains(&name) {
                continue;
            }

            activated.push(name);

            if connection.kind().is_webrtc() {
                self.set_remote_webrtc_info(&connection, &remote_sdp, remote);
            } else {
                set_remote_rtp_info(&connection, &remote_sdp, remote);
            }

            let active = dtls_active(local.setup, remote.setup.or(remote_sdp.setup));
            connection.add(self.pipeline.as_mut(), active)?;

            if !connection.kind().is_webrtc() {
                self.on_connection_connected(&connection);
            } else if connection.is_connected() {
                self.wire_sctp(&connection);
            }
        }

        self.state = NegotiationState::Negotiated;

        for pending in mem::take(&mut self.pending_candidates) {
            self.add_remote_candidate_now(
                pending.candidate,
                pending.mid.as_deref(),
                pending.mline_index,
            );
        }

        self.handle_ice_events();

        Ok(())
    }

    /// Start gathering local candidates of every connection
    ///
    /// Returns false in RTP mode, without connections or if gathering already started.
    pub fn gather_candidates(&mut self) -> bool {
        let Some(agent) = &mut self.agent else {
            return false;
        };

        if self.registry.is_empty() {
            log::debug!("No connections to gather candidates for");
            return false;
        }

        let mut started = true;

        for connection in self.registry.connections() {
            let Some(stream) = connection.stream_id() else {
                continue;
            };

            if !agent.start_gathering_candidates(stream) {
                log::warn!("Gathering of {} already started", connection.name());
                started = false;
            }
        }

        self.handle_ice_events();

        started
    }

    /// Add a remote candidate of the media identified by `mid` or, without mid, by `mline_index`
    ///
    /// Candidates received before the negotiation completed are kept and added once it did.
    pub fn add_ice_candidate(
        &mut self,
        candidate: IceCandidate,
        mid: Option<&str>,
        mline_index: usize,
    ) -> bool {
        if self.state == NegotiationState::Negotiated {
            return self.add_remote_candidate_now(candidate, mid, mline_index);
        }

        // Without a local description the media cannot be validated yet
        if self.local_sdp.is_some() && self.resolve_media(mid, mline_index).is_none() {
            log::debug!("Candidate for unknown media (mid={mid:?}, index={mline_index}) ignored");
            return false;
        }

        self.pending_candidates.push(PendingCandidate {
            candidate,
            mid: mid.map(Into::into),
            mline_index,
        });

        true
    }

    /// Complete the local description with the default candidate address of every media
    ///
    /// Media whose default candidate is not of the configured IP family is rejected in the local
    /// description and stops its transport. Returns false if any media has no usable default candidate.
    pub fn local_sdp_add_default_info(&mut self) -> bool {
        let (Some(agent), Some(local_sdp)) = (&self.agent, &mut self.local_sdp) else {
            return false;
        };

        let mut complete = true;
        let mut failed = vec![];

        for (index, slot) in self.media.iter().enumerate() {
            if !slot.active {
                continue;
            }

            let Some(connection) = slot
                .connection
                .as_deref()
                .and_then(|name| self.registry.get_connection(name))
            else {
                continue;
            };

            let (Some(stream), Some(desc)) =
                (connection.stream_id(), local_sdp.media_descriptions.get_mut(index))
            else {
                continue;
            };

            let Some((ip, port)) = default_address(agent, stream, Component::Rtp) else {
                log::warn!("Media {} has no default candidate", slot.mid);
                complete = false;
                continue;
            };

            if ip.is_ipv6() != self.config.use_ipv6 {
                log::warn!(
                    "Default candidate {ip} of media {} does not match the configured IP family",
                    slot.mid
                );
                desc.media.port = 0;
                desc.rtcp = None;
                desc.ice_end_of_candidates = true;
                failed.push(index);
                complete = false;
                continue;
            }

            desc.media.port = port;
            desc.connection = Some(sdp_types::Connection::new(ip.into()));

            desc.rtcp = if connection.kind().is_muxed() {
                Some(Rtcp {
                    port,
                    address: Some(ip.into()),
                })
            } else {
                default_address(agent, stream, Component::Rtcp).map(|(ip, port)| Rtcp {
                    port,
                    address: Some(ip.into()),
                })
            };

            desc.ice_end_of_candidates = true;
        }

        local_sdp.connection = None;

        for index in failed {
            self.fail_media(index);
        }

        complete
    }

    /// Deactivate a media, its connection is released once no other media uses it
    fn fail_media(&mut self, index: usize) {
        let Some(slot) = self.media.get_mut(index) else {
            return;
        };

        slot.active = false;

        let Some(name) = slot.connection.clone() else {
            return;
        };

        let in_use = self
            .media
            .iter()
            .any(|slot| slot.active && slot.connection.as_ref() == Some(&name));

        if in_use {
            return;
        }

        log::debug!("Releasing connection {name}, none of its media is active");

        let addrs = self
            .registry
            .remove_connection(&name, self.agent.as_mut(), self.pipeline.as_mut());

        self.transport_changes
            .extend(addrs.into_iter().map(TransportChange::Close));
    }

    pub(super) fn handle_ice_events(&mut self) {
        let events = self
            .agent
            .as_mut()
            .map(Agent::drain_events)
            .unwrap_or_default();

        for event in events {
            self.handle_ice_event(event);
        }

        self.flush_connections();
    }

    pub(super) fn handle_ice_event(&mut self, event: IceEvent) {
        let stream = match &event {
            IceEvent::NewCandidate { stream, .. }
            | IceEvent::GatheringDone { stream }
            | IceEvent::ComponentStateChanged { stream, .. }
            | IceEvent::SelectedPair { stream, .. }
            | IceEvent::SendData { stream, .. } => *stream,
        };

        // Late events of removed connections
        let Some(connection) = self.registry.by_stream(stream).cloned() else {
            log::debug!("Dropping ICE event of removed stream, {event:?}");
            return;
        };

        match event {
            IceEvent::NewCandidate { candidate, .. } => self.on_new_candidate(&connection, candidate),
            IceEvent::GatheringDone { .. } => {
                log::debug!("Gathering of {} done", connection.name());

                connection.set_gathered(true);
                self.check_gathering_done();
            }
            IceEvent::ComponentStateChanged {
                component, old, new, ..
            } => {
                log::debug!(
                    "ICE component {component:?} of {} changed {old:?} -> {new:?}",
                    connection.name()
                );

                self.events.push_back(SessionEvent::IceComponentStateChanged {
                    connection: connection.name().into(),
                    component,
                    state: new,
                });

                match new {
                    ComponentState::Connected => {
                        if connection.unlock_dtls(self.pipeline.as_mut(), component) {
                            self.on_connection_connected(&connection);
                        }
                    }
                    ComponentState::Failed => {
                        log::warn!("ICE component {component:?} of {} failed", connection.name());
                    }
                    _ => {}
                }
            }
            IceEvent::SelectedPair {
                component,
                local,
                remote,
                ..
            } => {
                log::debug!(
                    "Selected pair of {} {component:?} is {local} -> {remote}",
                    connection.name()
                );

                connection.set_selected_pair(component, local, remote);
            }
            IceEvent::SendData {
                component,
                data,
                source,
                target,
                ..
            } => {
                let Some(socket) = connection.local_addr(component) else {
                    return;
                };

                self.events.push_back(SessionEvent::SendData {
                    socket,
                    data,
                    source,
                    target,
                });
            }
        }
    }

    /// The connection's security handshake completed, emits `connected` once and wires SCTP
    pub(super) fn on_connection_connected(&mut self, connection: &Arc<Connection>) {
        if !connection.connected_signal().emit() {
            return;
        }

        log::debug!("Connection {} is connected", connection.name());

        self.events.push_back(SessionEvent::Connected {
            connection: connection.name().into(),
        });

        self.wire_sctp(connection);
    }

    /// Link the SCTP elements of the connection's data channel media, only ever done once
    pub(super) fn wire_sctp(&mut self, connection: &Arc<Connection>) -> bool {
        let Some(sctp) = connection.sctp() else {
            return false;
        };

        let index = self.media.iter().position(|slot| {
            slot.active
                && slot.media_type == MediaType::App
                && slot.connection.as_deref() == Some(connection.name())
        });

        let Some(index) = index else {
            return false;
        };

        let local = self
            .local_sdp
            .as_ref()
            .and_then(|sdp| sdp.media_descriptions.get(index));
        let remote = self
            .remote_sdp
            .as_ref()
            .and_then(|sdp| sdp.media_descriptions.get(index));

        let (Some(local_port), Some(remote_port)) =
            (local.and_then(datachannel_port), remote.and_then(datachannel_port))
        else {
            log::warn!("Data channel media of {} has no SCTP port", connection.name());
            return false;
        };

        let pads = match (connection.data_src_pad(), connection.data_sink_pad()) {
            (Ok(src), Ok(sink)) => (src, sink),
            (Err(e), _) | (_, Err(e)) => {
                log::error!("Cannot wire SCTP of {}, {e}", connection.name());
                return false;
            }
        };

        if !sctp.wire(self.pipeline.as_mut(), connection.name(), pads, local_port, remote_port) {
            return false;
        }

        self.events.push_back(SessionEvent::DataChannelReady {
            connection: connection.name().into(),
            association_id: sctp.association_id(),
        });

        true
    }

    fn set_remote_webrtc_info(
        &mut self,
        connection: &Connection,
        sdp: &SessionDescription,
        remote: &MediaDescription,
    ) {
        if let (Some(agent), Some(stream)) = (&mut self.agent, connection.stream_id()) {
            match (sdp.ice_ufrag_of(remote), sdp.ice_pwd_of(remote)) {
                (Some(ufrag), Some(pwd)) => {
                    agent.set_remote_credentials(stream, ufrag, pwd);
                }
                _ => log::warn!("Remote media of {} has no ICE credentials", connection.name()),
            }
        }

        connection.set_remote_fingerprints(sdp.fingerprints_of(remote).to_vec());
    }

    fn on_new_candidate(&mut self, connection: &Connection, candidate: IceCandidate) {
        log::debug!("New local candidate of {}: {candidate}", connection.name());

        for (index, slot) in self.media.iter().enumerate() {
            if !slot.active || slot.connection.as_deref() != Some(connection.name()) {
                continue;
            }

            if let Some(desc) = self
                .local_sdp
                .as_mut()
                .and_then(|sdp| sdp.media_descriptions.get_mut(index))
            {
                desc.ice_candidates.push(candidate.clone());
            }

            self.events.push_back(SessionEvent::IceCandidate {
                candidate: candidate.clone(),
                mid: slot.mid.clone(),
                mline_index: index,
            });
        }
    }

    /// Finish the local description once every connection gathered its candidates
    fn check_gathering_done(&mut self) {
        if self.gathering_done {
            return;
        }

        let all_gathered = self
            .registry
            .connections()
            .filter(|connection| connection.kind().is_webrtc())
            .all(|connection| connection.is_gathered());

        if !all_gathered {
            return;
        }

        self.gathering_done = true;

        if !self.local_sdp_add_default_info() {
            log::warn!("Local session description lacks default addresses");
        }

        self.events.push_back(SessionEvent::IceGatheringDone);
    }

    fn add_remote_candidate_now(
        &mut self,
        candidate: IceCandidate,
        mid: Option<&str>,
        mline_index: usize,
    ) -> bool {
        let Some(index) = self.resolve_media(mid, mline_index) else {
            log::debug!("Candidate for unknown media (mid={mid:?}, index={mline_index}) ignored");
            return false;
        };

        let slot = &self.media[index];

        if !slot.active {
            log::debug!("Ignoring candidate of inactive media {}", slot.mid);
            return true;
        }

        let Some(connection) = slot
            .connection
            .as_deref()
            .and_then(|name| self.registry.get_connection(name))
        else {
            log::error!("Media {} has no connection", slot.mid);
            return false;
        };

        let (Some(agent), Some(stream)) = (&mut self.agent, connection.stream_id()) else {
            return false;
        };

        if !agent.add_ice_candidate(stream, &candidate) {
            return false;
        }

        if let Some(desc) = self
            .remote_sdp
            .as_mut()
            .and_then(|sdp| sdp.media_descriptions.get_mut(index))
        {
            desc.ice_candidates.push(candidate);
        }

        true
    }

    /// Index of the media with the given mid, falls back to the m-line index
    fn resolve_media(&self, mid: Option<&str>, mline_index: usize) -> Option<usize> {
        if let Some(mid) = mid
            && let Some(index) = self.media.iter().position(|slot| slot.mid == mid)
        {
            return Some(index);
        }

        (mline_index < self.media.len()).then_some(mline_index)
    }
}

/// Use the remote media's `c=` address with its port, RTCP on `a=rtcp` or the next port
fn set_remote_rtp_info(connection: &Connection, sdp: &SessionDescription, remote: &MediaDescription) {
    let Some(ip) = sdp
        .connection_of(remote)
        .and_then(|connection| connection.address.ip())
    else {
        log::warn!("Remote media of {} has no usable connection address", connection.name());
        return;
    };

    let port = remote.media.port;
    connection.set_remote_addr(Component::Rtp, SocketAddr::new(ip, port));

    let rtcp = match &remote.rtcp {
        Some(rtcp) => SocketAddr::new(
            rtcp.address.as_ref().and_then(|address| address.ip()).unwrap_or(ip),
            rtcp.port,
        ),
        None => SocketAddr::new(ip, port.saturating_add(1)),
    };

    connection.set_remote_addr(Component::Rtcp, rtcp);
}

/// Whether the local side takes the DTLS client role
fn dtls_active(local: Option<Setup>, remote: Option<Setup>) -> bool {
    match local {
        Some(Setup::Active) => true,
        Some(Setup::Passive | Setup::HoldConn) => false,
        Some(Setup::ActPass) | None => remote == Some(Setup::Passive),
    }
}

fn default_address(agent: &Agent, stream: StreamId, component: Component) -> Option<(IpAddr, u16)> {
    let candidate = agent.get_default_local_candidate(stream, component)?;

    match candidate.address {
        UntaggedAddress::IpAddress(ip) => Some((ip, candidate.port)),
        UntaggedAddress::Fqdn(_) => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::TransportConfig,
        pipeline::{Caps, Element, Pad, Pipeline, PipelineError, PropertyValue, RecordingPipeline},
        session::LocalMedia,
    };
    use parking_lot::Mutex;
    use std::{net::Ipv4Addr, time::Instant};

    #[derive(Clone, Default)]
    struct SharedPipeline(Arc<Mutex<RecordingPipeline>>);

    impl Pipeline for SharedPipeline {
        fn make_element(&mut self, factory: &str, name: &str) -> Result<Element, PipelineError> {
            self.0.lock().make_element(factory, name)
        }

        fn remove_element(&mut self, element: &Element) {
            self.0.lock().remove_element(element)
        }

        fn set_property(&mut self, element: &Element, name: &str, value: PropertyValue) {
            self.0.lock().set_property(element, name, value)
        }

        fn request_pad(
            &mut self,
            element: &Element,
            name: &str,
            caps: Option<&Caps>,
        ) -> Result<Pad, PipelineError> {
            self.0.lock().request_pad(element, name, caps)
        }

        fn link_pads(&mut self, src: &Pad, sink: &Pad) -> Result<(), PipelineError> {
            self.0.lock().link_pads(src, sink)
        }

        fn sync_state_with_parent(&mut self, element: &Element) -> Result<(), PipelineError> {
            self.0.lock().sync_state_with_parent(element)
        }
    }

    fn webrtc_session(pipeline: Box<dyn Pipeline>) -> Session {
        let config = TransportConfig {
            local_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..TransportConfig::webrtc()
        };

        Session::new(config, pipeline).unwrap()
    }

    #[test]
    fn dtls_roles() {
        assert!(dtls_active(Some(Setup::Active), Some(Setup::Passive)));
        assert!(!dtls_active(Some(Setup::Passive), Some(Setup::Active)));
        assert!(!dtls_active(Some(Setup::ActPass), Some(Setup::Active)));
        assert!(dtls_active(Some(Setup::ActPass), Some(Setup::Passive)));
        assert!(!dtls_active(None, None));
    }

    #[test]
    fn sctp_wired_once() {
        let _ = env_logger::builder().is_test(true).try_init();

        let pipeline = SharedPipeline::default();

        let mut offerer = webrtc_session(Box::new(pipeline.clone()));
        offerer.add_local_media(LocalMedia::new(MediaType::Audio, ["111"])).unwrap();
        offerer.add_local_media(LocalMedia::new(MediaType::App, None::<String>)).unwrap();

        let mut answerer = webrtc_session(Box::new(RecordingPipeline::default()));
        answerer.add_local_media(LocalMedia::new(MediaType::Audio, ["111"])).unwrap();
        answerer.add_local_media(LocalMedia::new(MediaType::App, None::<String>)).unwrap();

        let offer = offerer.create_offer().unwrap();
        let answer = answerer.process_offer(&offer.to_string()).unwrap();
        offerer.process_answer(&answer.to_string()).unwrap();

        assert_eq!(offerer.negotiation_state(), NegotiationState::Negotiated);
        assert!(offerer.agent().unwrap().is_controlling());
        assert!(!answerer.agent().unwrap().is_controlling());

        let connection = offerer.connection(crate::BUNDLE_CONNECTION_NAME).unwrap();
        assert!(connection.is_added());

        // Connected signal raced by a direct wiring attempt
        assert!(offerer.wire_sctp(&connection));
        offerer.on_connection_connected(&connection);
        offerer.on_connection_connected(&connection);
        assert!(!offerer.wire_sctp(&connection));

        assert_eq!(pipeline.0.lock().count("sctpdec"), 1);
        assert_eq!(pipeline.0.lock().count("sctpenc"), 1);

        let events: Vec<_> = std::iter::from_fn(|| offerer.pop_event()).collect();
        let connected = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Connected { .. }))
            .count();
        let ready = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::DataChannelReady { .. }))
            .count();

        assert_eq!(connected, 1);
        assert_eq!(ready, 1);
    }

    #[test]
    fn candidates_before_negotiation_are_replayed() {
        let mut offerer = webrtc_session(Box::new(RecordingPipeline::default()));
        offerer.add_local_media(LocalMedia::new(MediaType::Audio, ["111"])).unwrap();

        let candidate: IceCandidate = "candidate:1 1 UDP 2130706431 127.0.0.1 50000 typ host"
            .parse()
            .unwrap();

        // Nothing to validate against yet
        assert!(offerer.add_ice_candidate(candidate.clone(), Some("audio0"), 0));

        offerer.create_offer().unwrap();

        let unknown_media: IceCandidate = "candidate:2 1 UDP 2130706431 127.0.0.1 50007 typ host"
            .parse()
            .unwrap();
        assert!(!offerer.add_ice_candidate(unknown_media, Some("video7"), 3));
        assert!(offerer.add_ice_candidate(candidate.clone(), None, 0));

        let stream = offerer.connection_of_media(0).unwrap().stream_id().unwrap();
        assert!(offerer.agent().unwrap().remote_candidates(stream).is_empty());

        let mut answerer = webrtc_session(Box::new(RecordingPipeline::default()));
        answerer.add_local_media(LocalMedia::new(MediaType::Audio, ["111"])).unwrap();

        let answer = answerer.process_offer(&offerer.local_sdp().unwrap().to_string()).unwrap();
        offerer.process_answer(&answer.to_string()).unwrap();

        let signaled: Vec<u16> = answer.media_descriptions[0]
            .ice_candidates
            .iter()
            .map(|c| c.port)
            .collect();

        let remote = offerer.agent().unwrap().remote_candidates(stream);
        assert!(remote.iter().any(|c| c.port == 50000));
        assert!(!remote.iter().any(|c| c.port == 50007));
        assert!(
            remote
                .iter()
                .all(|c| c.port == 50000 || signaled.contains(&c.port))
        );
    }

    #[test]
    fn default_candidate_of_other_family_rejects_media() {
        let _ = env_logger::builder().is_test(true).try_init();

        let pipeline = SharedPipeline::default();

        let config = TransportConfig {
            local_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            use_ipv6: true,
            ..TransportConfig::webrtc()
        };

        let mut offerer = Session::new(config, Box::new(pipeline.clone())).unwrap();
        offerer.add_local_media(LocalMedia::new(MediaType::Audio, ["111"])).unwrap();
        offerer.create_offer().unwrap();

        assert_eq!(offerer.registry.connections().count(), 1);

        assert!(offerer.gather_candidates());
        offerer.poll(Instant::now());

        let events: Vec<SessionEvent> = std::iter::from_fn(|| offerer.pop_event()).collect();
        assert!(events.iter().any(|e| matches!(e, SessionEvent::IceGatheringDone)));

        let local = offerer.local_sdp().unwrap();
        assert!(local.media_descriptions[0].is_rejected());
        assert!(!offerer.media[0].active);
        assert!(offerer.connection_of_media(0).is_none());
        assert_eq!(offerer.registry.connections().count(), 0);

        let closed = std::iter::from_fn(|| offerer.pop_transport_change())
            .filter(|change| matches!(change, TransportChange::Close(_)))
            .count();
        assert!(closed > 0);
    }
}
