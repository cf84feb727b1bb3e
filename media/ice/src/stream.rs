use crate::relay::{RelayAllocation, RelayServer};
use crate::stun::{
    BindingRequest, Outgoing, StunServerBinding, make_binding_request, make_role_error,
    make_success_response, verify_integrity,
};
use crate::{
    Component, ComponentState, GatheringState, IceCredentials, IceEvent, ReceivedPkt, Shared,
    StreamId,
};
use sdp_types::{IceCandidate, UntaggedAddress};
use slotmap::{SlotMap, new_key_type};
use std::cmp::{max, min};
use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use stun_types::attributes::{
    ErrorCode, IceControlled, IceControlling, Priority, UseCandidate, XorMappedAddress,
};
use stun_types::{Class, Message, Method, TransactionId};

new_key_type!(
    struct LocalCandidateId;
    struct RemoteCandidateId;
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CandidateKind {
    Host = 126,
    PeerReflexive = 110,
    ServerReflexive = 100,
    Relayed = 0,
}

impl CandidateKind {
    fn as_str(self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relayed => "relay",
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    addr: SocketAddr,
    kind: CandidateKind,
    priority: u32,
    foundation: String,
    component: Component,
    /// Local socket address the candidate is sending from,
    /// the relayed address for relayed candidates
    base: SocketAddr,
    related: Option<SocketAddr>,
}

impl Candidate {
    fn to_sdp(&self) -> IceCandidate {
        IceCandidate {
            foundation: self.foundation.clone(),
            component: self.component as u32,
            transport: "UDP".into(),
            priority: self.priority.into(),
            address: UntaggedAddress::IpAddress(self.addr.ip()),
            port: self.addr.port(),
            typ: self.kind.as_str().into(),
            rel_addr: self
                .related
                .map(|related| UntaggedAddress::IpAddress(related.ip())),
            rel_port: self.related.map(|related| related.port()),
            unknown: vec![],
        }
    }
}

struct CandidatePair {
    local: LocalCandidateId,
    remote: RemoteCandidateId,
    priority: u64,
    state: CandidatePairState,
    component: Component,
    /// The peer sent a USE-CANDIDATE check on this pair
    received_use_candidate: bool,
    /// A check with USE-CANDIDATE is scheduled or running on this pair
    nominating: bool,
    nominated: bool,
}

enum CandidatePairState {
    Waiting,
    InProgress {
        transaction_id: TransactionId,
        stun_request: Vec<u8>,
        retransmit_at: Instant,
        retransmits: u32,
        is_controlling: bool,
    },
    Succeeded,
    Failed,
}

struct ComponentEntry {
    component: Component,
    state: ComponentState,
    selected: Option<(LocalCandidateId, RemoteCandidateId)>,
}

/// One ICE stream with its components, candidates & checklist
pub(crate) struct IceStream {
    name: String,
    components: Vec<ComponentEntry>,

    local_credentials: IceCredentials,
    remote_credentials: Option<IceCredentials>,

    local_candidates: SlotMap<LocalCandidateId, Candidate>,
    remote_candidates: SlotMap<RemoteCandidateId, Candidate>,

    /// Checklist sorted by descending pair priority
    pairs: Vec<CandidatePair>,
    triggered_check_queue: VecDeque<(LocalCandidateId, RemoteCandidateId)>,

    stun_bindings: Vec<StunServerBinding>,
    relay_allocations: Vec<RelayAllocation>,
    gathering_state: GatheringState,

    last_ta_trigger: Option<Instant>,

    /// STUN requests received before the remote credentials were known
    backlog: Vec<ReceivedPkt<Message>>,
    prflx_counter: u32,
}

impl IceStream {
    pub(crate) fn new(name: String, rtcp_mux: bool) -> Self {
        let components = if rtcp_mux {
            vec![Component::Rtp]
        } else {
            vec![Component::Rtp, Component::Rtcp]
        };

        Self {
            name,
            components: components
                .into_iter()
                .map(|component| ComponentEntry {
                    component,
                    state: ComponentState::Ready,
                    selected: None,
                })
                .collect(),
            local_credentials: IceCredentials::random(),
            remote_credentials: None,
            local_candidates: SlotMap::with_key(),
            remote_candidates: SlotMap::with_key(),
            pairs: Vec::new(),
            triggered_check_queue: VecDeque::new(),
            stun_bindings: Vec::new(),
            relay_allocations: Vec::new(),
            gathering_state: GatheringState::New,
            last_ta_trigger: None,
            backlog: Vec::new(),
            prflx_counter: 0,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn components(&self) -> impl Iterator<Item = Component> + '_ {
        self.components.iter().map(|entry| entry.component)
    }

    fn has_component(&self, component: Component) -> bool {
        self.components.iter().any(|entry| entry.component == component)
    }

    pub(crate) fn component_state(&self, component: Component) -> Option<ComponentState> {
        self.components
            .iter()
            .find(|entry| entry.component == component)
            .map(|entry| entry.state)
    }

    pub(crate) fn gathering_state(&self) -> GatheringState {
        self.gathering_state
    }

    pub(crate) fn local_credentials(&self) -> &IceCredentials {
        &self.local_credentials
    }

    pub(crate) fn remote_credentials(&self) -> Option<&IceCredentials> {
        self.remote_credentials.as_ref()
    }

    pub(crate) fn add_host_addr(&mut self, shared: &mut Shared, id: StreamId, component: Component, addr: SocketAddr) {
        if !self.has_component(component) {
            log::warn!("Stream {} has no component {component:?}", self.name);
            return;
        }

        if addr.ip().is_unspecified() {
            return;
        }

        if let SocketAddr::V6(v6) = addr {
            let ip = v6.ip();
            if ip.to_ipv4_mapped().is_some() {
                return;
            }
        }

        self.add_local_candidate(shared, id, component, CandidateKind::Host, addr, addr, None);
    }

    pub(crate) fn start_gathering(
        &mut self,
        shared: &mut Shared,
        id: StreamId,
        stun_servers: &[SocketAddr],
        relay: Option<&RelayServer>,
    ) -> bool {
        if self.gathering_state != GatheringState::New {
            return false;
        }

        self.gathering_state = GatheringState::Gathering;

        let components: Vec<Component> = self.components().collect();

        for component in components {
            for server in stun_servers {
                self.stun_bindings
                    .push(StunServerBinding::new(*server, component));
            }

            if let Some(relay) = relay {
                self.relay_allocations
                    .push(RelayAllocation::new(relay.clone(), component));
            }

            self.set_component_state(shared, id, component, ComponentState::Gathering);
        }

        // Announce everything that was known before gathering started
        for candidate in self.local_candidates.values() {
            if candidate.kind != CandidateKind::PeerReflexive {
                shared.events.push_back(IceEvent::NewCandidate {
                    stream: id,
                    candidate: candidate.to_sdp(),
                });
            }
        }

        true
    }

    pub(crate) fn set_remote_credentials(
        &mut self,
        shared: &mut Shared,
        id: StreamId,
        credentials: IceCredentials,
    ) {
        if let Some(current) = &self.remote_credentials {
            if *current == credentials {
                return;
            }

            log::debug!("Stream {} remote credentials changed", self.name);
        }

        self.remote_credentials = Some(credentials);

        for pkt in std::mem::take(&mut self.backlog) {
            self.receive_stun(shared, id, pkt);
        }
    }

    /// Add a candidate signaled by the peer
    ///
    /// Only UDP host, server reflexive & relayed candidates with IP addresses are accepted.
    pub(crate) fn add_remote_candidate(&mut self, shared: &mut Shared, candidate: &IceCandidate) -> bool {
        let kind = match candidate.typ.as_str() {
            "host" => CandidateKind::Host,
            "srflx" => CandidateKind::ServerReflexive,
            "relay" => CandidateKind::Relayed,
            typ => {
                log::debug!("Ignoring remote candidate with unsupported type {typ}");
                return false;
            }
        };

        if !candidate.transport.eq_ignore_ascii_case("udp") {
            log::debug!("Ignoring remote candidate with transport {}", candidate.transport);
            return false;
        }

        let Ok(priority) = u32::try_from(candidate.priority) else {
            log::debug!("Ignoring remote candidate with invalid priority");
            return false;
        };

        let component = match candidate.component {
            1 => Component::Rtp,
            2 => Component::Rtcp,
            n => {
                log::debug!("Ignoring remote candidate for unknown component {n}");
                return false;
            }
        };

        if !self.has_component(component) {
            // RTCP candidates are irrelevant when RTCP is muxed
            log::debug!("Ignoring remote candidate for unused component {component:?}");
            return false;
        }

        let ip = match &candidate.address {
            UntaggedAddress::IpAddress(ip) => *ip,
            UntaggedAddress::Fqdn(fqdn) => {
                log::debug!("Ignoring remote candidate with FQDN address {fqdn}");
                return false;
            }
        };

        let addr = SocketAddr::new(ip, candidate.port);

        let known = self
            .remote_candidates
            .values()
            .any(|c| c.addr == addr && c.component == component);

        if known {
            return true;
        }

        self.remote_candidates.insert(Candidate {
            addr,
            kind,
            priority,
            foundation: candidate.foundation.clone(),
            component,
            base: addr,
            related: None,
        });

        self.form_pairs(shared);

        true
    }

    pub(crate) fn local_candidates(&self) -> Vec<IceCandidate> {
        self.local_candidates
            .values()
            .filter(|c| c.kind != CandidateKind::PeerReflexive)
            .map(Candidate::to_sdp)
            .collect()
    }

    /// Remote candidates learned from signaling or discovered as peer reflexive
    pub(crate) fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.values().map(Candidate::to_sdp).collect()
    }

    /// The candidate to put into the `m=`/`c=` lines of the session description
    pub(crate) fn default_local_candidate(&self, component: Component) -> Option<IceCandidate> {
        self.local_candidates
            .values()
            .filter(|c| c.component == component && c.kind != CandidateKind::PeerReflexive)
            .max_by_key(|c| c.priority)
            .map(Candidate::to_sdp)
    }

    pub(crate) fn selected_pair(&self, component: Component) -> Option<(SocketAddr, SocketAddr)> {
        let entry = self.components.iter().find(|e| e.component == component)?;
        let (local, remote) = entry.selected?;

        Some((
            self.local_candidates[local].base,
            self.remote_candidates[remote].addr,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn add_local_candidate(
        &mut self,
        shared: &mut Shared,
        id: StreamId,
        component: Component,
        kind: CandidateKind,
        base: SocketAddr,
        addr: SocketAddr,
        related: Option<SocketAddr>,
    ) {
        let already_exists = self
            .local_candidates
            .values()
            .any(|c| c.kind == kind && c.base == base && c.addr == addr);

        if already_exists {
            return;
        }

        log::debug!("Stream {} add local candidate {component:?} {kind:?} {addr}", self.name);

        // Offset by type plus the count of candidates of the same type
        let local_preference_offset = match kind {
            CandidateKind::Host => (65535 / 4) * 3,
            CandidateKind::PeerReflexive => (65535 / 4) * 2,
            CandidateKind::ServerReflexive => 65535 / 4,
            CandidateKind::Relayed => 0,
        };

        let local_preference = self
            .local_candidates
            .values()
            .filter(|c| c.kind == kind && c.component == component)
            .count() as u32
            + local_preference_offset;

        let priority = ((kind as u32) << 24) + (local_preference << 8) + (256 - component as u32);

        let candidate = Candidate {
            addr,
            kind,
            priority,
            foundation: compute_foundation(kind, base.ip(), related.map(|r| r.ip()), "udp")
                .to_string(),
            component,
            base,
            related,
        };

        if self.gathering_state != GatheringState::New && kind != CandidateKind::PeerReflexive {
            shared.events.push_back(IceEvent::NewCandidate {
                stream: id,
                candidate: candidate.to_sdp(),
            });
        }

        self.local_candidates.insert(candidate);
        self.form_pairs(shared);
    }

    fn form_pairs(&mut self, shared: &Shared) {
        for (local_id, local) in &self.local_candidates {
            // Reflexive & relayed candidates are checked through their host base
            if local.kind != CandidateKind::Host {
                continue;
            }

            for (remote_id, remote) in &self.remote_candidates {
                if local.component != remote.component {
                    continue;
                }

                let already_exists = self
                    .pairs
                    .iter()
                    .any(|p| p.local == local_id && p.remote == remote_id);

                if already_exists {
                    continue;
                }

                let compatible = match (local.addr.ip(), remote.addr.ip()) {
                    (IpAddr::V4(l), IpAddr::V4(r)) => l.is_link_local() == r.is_link_local(),
                    (IpAddr::V6(l), IpAddr::V6(r)) => {
                        l.is_unicast_link_local() == r.is_unicast_link_local()
                    }
                    _ => false,
                };

                if !compatible {
                    continue;
                }

                log::debug!(
                    "Stream {} add pair {}",
                    self.name,
                    DisplayPair(local, remote)
                );

                self.pairs.push(CandidatePair {
                    local: local_id,
                    remote: remote_id,
                    priority: pair_priority(local, remote, shared.is_controlling),
                    state: CandidatePairState::Waiting,
                    component: local.component,
                    received_use_candidate: false,
                    nominating: false,
                    nominated: false,
                });
            }
        }

        self.pairs.sort_unstable_by(|a, b| b.priority.cmp(&a.priority));
        self.prune_pairs(shared.stun_config.max_pairs);
    }

    pub(crate) fn recompute_pair_priorities(&mut self, is_controlling: bool) {
        for pair in &mut self.pairs {
            if !is_controlling {
                pair.nominating = false;
            }

            pair.priority = pair_priority(
                &self.local_candidates[pair.local],
                &self.remote_candidates[pair.remote],
                is_controlling,
            );
        }

        self.pairs.sort_unstable_by(|a, b| b.priority.cmp(&a.priority));
    }

    fn prune_pairs(&mut self, max_pairs: usize) {
        while self.pairs.len() > max_pairs {
            let Some(pair) = self.pairs.pop() else {
                return;
            };

            log::debug!(
                "Stream {} pruned pair {}",
                self.name,
                DisplayPair(
                    &self.local_candidates[pair.local],
                    &self.remote_candidates[pair.remote]
                )
            );
        }
    }

    pub(crate) fn receive(
        &mut self,
        shared: &mut Shared,
        id: StreamId,
        now: Instant,
        pkt: ReceivedPkt,
    ) {
        let msg = match Message::parse(pkt.data) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Failed to parse STUN message, {e}");
                return;
            }
        };

        let pkt = ReceivedPkt {
            data: msg,
            source: pkt.source,
            destination: pkt.destination,
            component: pkt.component,
        };

        if matches!(pkt.data.class(), Class::Success | Class::Error)
            && self.receive_server_response(shared, id, now, &pkt)
        {
            return;
        }

        if pkt.data.method() != Method::Binding {
            log::debug!("Ignoring STUN {:?} message", pkt.data.method());
            return;
        }

        if !pkt.data.verify_fingerprint() {
            log::debug!("Ignoring STUN message without valid FINGERPRINT");
            return;
        }

        if self.remote_credentials.is_none() {
            log::debug!("Stream {} received STUN message before remote credentials", self.name);
            self.backlog.push(pkt);
            return;
        }

        self.receive_stun(shared, id, pkt);
    }

    /// Route responses of STUN server bindings & TURN allocations
    fn receive_server_response(
        &mut self,
        shared: &mut Shared,
        id: StreamId,
        now: Instant,
        pkt: &ReceivedPkt<Message>,
    ) -> bool {
        let transaction_id = pkt.data.transaction_id();

        if let Some(binding) = self
            .stun_bindings
            .iter_mut()
            .find(|b| b.wants_stun_response(transaction_id))
        {
            let component = binding.component();
            let server = binding.server();

            if let Some(mapped) =
                binding.receive_stun_response(now, &shared.stun_config, &pkt.data)
            {
                log::debug!("STUN server {server} mapped {} to {mapped}", pkt.destination);

                self.add_local_candidate(
                    shared,
                    id,
                    component,
                    CandidateKind::ServerReflexive,
                    pkt.destination,
                    mapped,
                    Some(pkt.destination),
                );
            }

            return true;
        }

        if let Some(allocation) = self
            .relay_allocations
            .iter_mut()
            .find(|a| a.wants_stun_response(transaction_id))
        {
            let component = allocation.component();

            let (allocated, retry) =
                allocation.receive_stun_response(now, &shared.stun_config, &pkt.data);

            if let Some(retry) = retry {
                push_outgoing(shared, id, retry);
            }

            if let Some(allocated) = allocated {
                self.add_local_candidate(
                    shared,
                    id,
                    component,
                    CandidateKind::Relayed,
                    allocated.relayed,
                    allocated.relayed,
                    Some(allocated.mapped),
                );
            }

            return true;
        }

        false
    }

    fn receive_stun(&mut self, shared: &mut Shared, id: StreamId, pkt: ReceivedPkt<Message>) {
        let Some(remote_credentials) = &self.remote_credentials else {
            return;
        };

        if !verify_integrity(&self.local_credentials, remote_credentials, &pkt.data) {
            log::debug!("Stream {} dropping STUN message with invalid integrity", self.name);
            return;
        }

        match pkt.data.class() {
            Class::Request => self.receive_stun_request(shared, id, pkt),
            Class::Success => self.receive_stun_success(shared, id, pkt),
            Class::Error => self.receive_stun_error(shared, pkt),
            Class::Indication => {}
        }
    }

    fn receive_stun_success(&mut self, shared: &mut Shared, id: StreamId, pkt: ReceivedPkt<Message>) {
        let transaction_id = pkt.data.transaction_id();

        let Some(pair) = self.pairs.iter_mut().find(|p| {
            matches!(&p.state, CandidatePairState::InProgress { transaction_id: tsx_id, .. } if *tsx_id == transaction_id)
        }) else {
            log::debug!("Stream {} got STUN response for unknown transaction", self.name);
            return;
        };

        let local = &self.local_candidates[pair.local];
        let remote = &self.remote_candidates[pair.remote];

        // Responses must come from where the request was sent to
        let symmetric = pkt.source == remote.addr
            && (pkt.destination.ip().is_unspecified() || pkt.destination.ip() == local.base.ip());

        if !symmetric {
            log::debug!(
                "Stream {} got non-symmetric response for pair {}",
                self.name,
                DisplayPair(local, remote)
            );
            pair.state = CandidatePairState::Failed;
            return;
        }

        if let Some(Ok(mapped)) = pkt.data.attribute::<XorMappedAddress>() {
            if mapped.0 != local.addr {
                log::debug!(
                    "Stream {} discovered peer reflexive address {} for {}",
                    self.name,
                    mapped.0,
                    local.addr
                );
            }
        }

        log::debug!("Stream {} pair {} succeeded", self.name, DisplayPair(local, remote));

        pair.state = CandidatePairState::Succeeded;

        if pair.nominating {
            pair.nominating = false;
            pair.nominated = true;

            let (component, local, remote) = (pair.component, pair.local, pair.remote);
            self.select_pair(shared, id, component, local, remote);
        }
    }

    fn receive_stun_error(&mut self, shared: &mut Shared, pkt: ReceivedPkt<Message>) {
        let transaction_id = pkt.data.transaction_id();

        let Some(pair) = self.pairs.iter_mut().find(|p| {
            matches!(&p.state, CandidatePairState::InProgress { transaction_id: tsx_id, .. } if *tsx_id == transaction_id)
        }) else {
            return;
        };

        let CandidatePairState::InProgress { is_controlling, .. } = pair.state else {
            return;
        };

        let code = match pkt.data.attribute::<ErrorCode>() {
            Some(Ok(code)) => code,
            _ => {
                pair.state = CandidatePairState::Failed;
                return;
            }
        };

        if code.number != ErrorCode::ROLE_CONFLICT {
            log::debug!(
                "Stream {} check failed with {} {}",
                self.name,
                code.number,
                code.reason
            );
            pair.state = CandidatePairState::Failed;
            return;
        }

        // Switch role only if the conflict refers to the role we currently have
        if is_controlling == shared.is_controlling {
            log::debug!(
                "Role conflict, switching to {}",
                if is_controlling { "controlled" } else { "controlling" }
            );

            shared.is_controlling = !is_controlling;
            shared.role_changed = true;
        }

        pair.state = CandidatePairState::Waiting;
        self.triggered_check_queue.push_back((pair.local, pair.remote));
    }

    fn receive_stun_request(
        &mut self,
        shared: &mut Shared,
        id: StreamId,
        pkt: ReceivedPkt<Message>,
    ) {
        let priority = match pkt.data.attribute::<Priority>() {
            Some(Ok(priority)) => priority.0,
            _ => {
                log::debug!("Binding request is missing PRIORITY");
                return;
            }
        };

        let use_candidate = pkt.data.has_attribute::<UseCandidate>();

        // Resolve role conflicts (RFC 8445 section 7.3.1.1)
        if shared.is_controlling {
            if let Some(Ok(IceControlling(remote_tie_breaker))) =
                pkt.data.attribute::<IceControlling>()
            {
                if shared.tie_breaker >= remote_tie_breaker {
                    self.send_role_error(shared, id, &pkt);
                    return;
                }

                log::debug!("Role conflict, switching to controlled");
                shared.is_controlling = false;
                shared.role_changed = true;
            }
        } else if let Some(Ok(IceControlled(remote_tie_breaker))) =
            pkt.data.attribute::<IceControlled>()
        {
            if shared.tie_breaker >= remote_tie_breaker {
                log::debug!("Role conflict, switching to controlling");
                shared.is_controlling = true;
                shared.role_changed = true;
            } else {
                self.send_role_error(shared, id, &pkt);
                return;
            }
        }

        let Some((local_id, local)) = self.local_candidates.iter().find(|(_, c)| {
            c.kind == CandidateKind::Host
                && c.component == pkt.component
                && (c.addr == pkt.destination
                    || (pkt.destination.ip().is_unspecified() && c.addr.port() == pkt.destination.port()))
        }) else {
            log::debug!(
                "Stream {} got binding request on unknown address {}",
                self.name,
                pkt.destination
            );
            return;
        };

        let local_base = local.base;

        let remote_id = self
            .remote_candidates
            .iter()
            .find(|(_, c)| c.addr == pkt.source && c.component == pkt.component)
            .map(|(id, _)| id);

        let remote_id = match remote_id {
            Some(remote_id) => remote_id,
            None => {
                self.prflx_counter += 1;

                log::debug!(
                    "Stream {} discovered peer reflexive remote candidate {}",
                    self.name,
                    pkt.source
                );

                let remote_id = self.remote_candidates.insert(Candidate {
                    addr: pkt.source,
                    kind: CandidateKind::PeerReflexive,
                    priority,
                    foundation: format!("prflx{}", self.prflx_counter),
                    component: pkt.component,
                    base: pkt.source,
                    related: None,
                });

                self.form_pairs(shared);
                remote_id
            }
        };

        if let Some(pair) = self
            .pairs
            .iter_mut()
            .find(|p| p.local == local_id && p.remote == remote_id)
        {
            if use_candidate {
                pair.received_use_candidate = true;
            }

            if matches!(
                pair.state,
                CandidatePairState::Waiting | CandidatePairState::Failed
            ) && !self.triggered_check_queue.contains(&(local_id, remote_id))
            {
                pair.state = CandidatePairState::Waiting;
                self.triggered_check_queue.push_back((local_id, remote_id));
            }
        }

        match make_success_response(pkt.data.transaction_id(), &self.local_credentials, pkt.source) {
            Ok(data) => shared.events.push_back(IceEvent::SendData {
                stream: id,
                component: pkt.component,
                data,
                source: Some(local_base.ip()),
                target: pkt.source,
            }),
            Err(e) => log::warn!("Failed to build STUN success response, {e}"),
        }

        if use_candidate && !shared.is_controlling {
            self.poll_nomination_of_component(shared, id, pkt.component);
        }
    }

    fn send_role_error(&self, shared: &mut Shared, id: StreamId, pkt: &ReceivedPkt<Message>) {
        match make_role_error(
            pkt.data.transaction_id(),
            &self.local_credentials,
            shared.is_controlling,
            shared.tie_breaker,
        ) {
            Ok(data) => shared.events.push_back(IceEvent::SendData {
                stream: id,
                component: pkt.component,
                data,
                source: Some(pkt.destination.ip()),
                target: pkt.source,
            }),
            Err(e) => log::warn!("Failed to build STUN role conflict response, {e}"),
        }
    }

    pub(crate) fn poll(&mut self, shared: &mut Shared, id: StreamId, now: Instant) {
        for binding in &mut self.stun_bindings {
            if let Some(outgoing) = binding.poll(now, &shared.stun_config) {
                push_outgoing(shared, id, outgoing);
            }
        }

        for allocation in &mut self.relay_allocations {
            if let Some(outgoing) = allocation.poll(now, &shared.stun_config) {
                push_outgoing(shared, id, outgoing);
            }
        }

        self.poll_gathering(shared, id);

        if self.remote_credentials.is_none() {
            return;
        }

        self.poll_retransmit(shared, id, now);
        self.poll_checks(shared, id, now);

        let components: Vec<Component> = self.components().collect();
        for component in components {
            self.poll_nomination_of_component(shared, id, component);
        }

        self.poll_state(shared, id);
    }

    fn poll_gathering(&mut self, shared: &mut Shared, id: StreamId) {
        if self.gathering_state != GatheringState::Gathering {
            return;
        }

        let done = self.stun_bindings.iter().all(StunServerBinding::is_completed)
            && self.relay_allocations.iter().all(RelayAllocation::is_completed);

        if done {
            log::debug!("Stream {} finished gathering", self.name);
            self.gathering_state = GatheringState::Complete;
            shared.events.push_back(IceEvent::GatheringDone { stream: id });
        }
    }

    fn poll_retransmit(&mut self, shared: &mut Shared, id: StreamId, now: Instant) {
        for pair in &mut self.pairs {
            let CandidatePairState::InProgress {
                stun_request,
                retransmit_at,
                retransmits,
                ..
            } = &mut pair.state
            else {
                continue;
            };

            if *retransmit_at > now {
                continue;
            }

            if *retransmits >= shared.stun_config.max_retransmits {
                log::debug!(
                    "Stream {} pair {} timed out",
                    self.name,
                    DisplayPair(
                        &self.local_candidates[pair.local],
                        &self.remote_candidates[pair.remote]
                    )
                );

                pair.state = CandidatePairState::Failed;
                pair.nominating = false;
                continue;
            }

            *retransmits += 1;
            *retransmit_at += shared.stun_config.retransmit_delta(*retransmits);

            shared.events.push_back(IceEvent::SendData {
                stream: id,
                component: pair.component,
                data: stun_request.clone(),
                source: Some(self.local_candidates[pair.local].base.ip()),
                target: self.remote_candidates[pair.remote].addr,
            });
        }
    }

    fn poll_checks(&mut self, shared: &mut Shared, id: StreamId, now: Instant) {
        if let Some(last) = self.last_ta_trigger {
            if last + shared.stun_config.ta > now {
                return;
            }
        }

        let mut next = None;

        while let Some((local, remote)) = self.triggered_check_queue.pop_front() {
            if let Some(index) = self
                .pairs
                .iter()
                .position(|p| p.local == local && p.remote == remote)
            {
                next = Some(index);
                break;
            }
        }

        let next = next.or_else(|| {
            self.pairs
                .iter()
                .position(|p| matches!(p.state, CandidatePairState::Waiting))
        });

        let Some(index) = next else {
            return;
        };

        self.last_ta_trigger = Some(now);

        let Some(remote_credentials) = &self.remote_credentials else {
            return;
        };

        let pair = &mut self.pairs[index];
        let local = &self.local_candidates[pair.local];
        let remote = &self.remote_candidates[pair.remote];

        let transaction_id = TransactionId::random();

        // Checks are sent with the priority a peer reflexive candidate would get
        let prflx_priority = (local.priority & 0x00FF_FFFF)
            | ((CandidateKind::PeerReflexive as u32) << 24);

        let stun_request = match make_binding_request(
            transaction_id,
            BindingRequest {
                local_credentials: &self.local_credentials,
                remote_credentials,
                priority: prflx_priority,
                is_controlling: shared.is_controlling,
                tie_breaker: shared.tie_breaker,
                use_candidate: shared.is_controlling && pair.nominating,
            },
        ) {
            Ok(stun_request) => stun_request,
            Err(e) => {
                log::warn!("Failed to build binding request, {e}");
                pair.state = CandidatePairState::Failed;
                return;
            }
        };

        log::debug!(
            "Stream {} checking pair {}{}",
            self.name,
            DisplayPair(local, remote),
            if pair.nominating { " (nominating)" } else { "" }
        );

        shared.events.push_back(IceEvent::SendData {
            stream: id,
            component: pair.component,
            data: stun_request.clone(),
            source: Some(local.base.ip()),
            target: remote.addr,
        });

        pair.state = CandidatePairState::InProgress {
            transaction_id,
            stun_request,
            retransmit_at: now + shared.stun_config.retransmit_delta(0),
            retransmits: 0,
            is_controlling: shared.is_controlling,
        };
    }

    fn poll_nomination_of_component(
        &mut self,
        shared: &mut Shared,
        id: StreamId,
        component: Component,
    ) {
        let already_nominated = self
            .pairs
            .iter()
            .any(|p| p.component == component && (p.nominated || p.nominating));

        if already_nominated {
            return;
        }

        if shared.is_controlling {
            let Some(pair) = self.pairs.iter_mut().find(|p| {
                p.component == component && matches!(p.state, CandidatePairState::Succeeded)
            }) else {
                return;
            };

            log::debug!(
                "Stream {} nominating pair {}",
                self.name,
                DisplayPair(
                    &self.local_candidates[pair.local],
                    &self.remote_candidates[pair.remote]
                )
            );

            pair.nominating = true;
            self.triggered_check_queue.push_front((pair.local, pair.remote));
        } else {
            let Some(pair) = self.pairs.iter_mut().find(|p| {
                p.component == component
                    && p.received_use_candidate
                    && matches!(p.state, CandidatePairState::Succeeded)
            }) else {
                return;
            };

            pair.nominated = true;

            let (local, remote) = (pair.local, pair.remote);
            self.select_pair(shared, id, component, local, remote);
        }
    }

    fn select_pair(
        &mut self,
        shared: &mut Shared,
        id: StreamId,
        component: Component,
        local: LocalCandidateId,
        remote: RemoteCandidateId,
    ) {
        let Some(entry) = self.components.iter_mut().find(|e| e.component == component) else {
            return;
        };

        if entry.selected == Some((local, remote)) {
            return;
        }

        entry.selected = Some((local, remote));

        let local = &self.local_candidates[local];
        let remote = &self.remote_candidates[remote];

        log::debug!(
            "Stream {} selected pair {} for {component:?}",
            self.name,
            DisplayPair(local, remote)
        );

        shared.events.push_back(IceEvent::SelectedPair {
            stream: id,
            component,
            local: local.base,
            remote: remote.addr,
        });

        self.poll_state(shared, id);
    }

    fn poll_state(&mut self, shared: &mut Shared, id: StreamId) {
        let components: Vec<Component> = self.components().collect();

        for component in components {
            let mut has_nomination = false;
            let mut has_pairs = false;
            let mut still_possible = false;

            for pair in self.pairs.iter().filter(|p| p.component == component) {
                has_pairs = true;

                match pair.state {
                    CandidatePairState::Succeeded if pair.nominated => has_nomination = true,
                    CandidatePairState::Waiting
                    | CandidatePairState::InProgress { .. }
                    | CandidatePairState::Succeeded => still_possible = true,
                    CandidatePairState::Failed => {}
                }
            }

            let Some(current) = self.component_state(component) else {
                continue;
            };

            let new = if has_nomination {
                ComponentState::Connected
            } else if !has_pairs || self.remote_credentials.is_none() {
                continue;
            } else if still_possible {
                match current {
                    ComponentState::Connected | ComponentState::Disconnected => {
                        ComponentState::Disconnected
                    }
                    _ => ComponentState::Connecting,
                }
            } else {
                ComponentState::Failed
            };

            self.set_component_state(shared, id, component, new);
        }
    }

    fn set_component_state(
        &mut self,
        shared: &mut Shared,
        id: StreamId,
        component: Component,
        new: ComponentState,
    ) {
        let Some(entry) = self.components.iter_mut().find(|e| e.component == component) else {
            return;
        };

        if entry.state == new {
            return;
        }

        let old = entry.state;
        entry.state = new;

        log::debug!("Stream {} {component:?} state {old:?} -> {new:?}", self.name);

        shared.events.push_back(IceEvent::ComponentStateChanged {
            stream: id,
            component,
            old,
            new,
        });
    }

    pub(crate) fn timeout(&self, shared: &Shared, now: Instant) -> Option<Duration> {
        let mut timeout = None;

        for binding in &self.stun_bindings {
            timeout = opt_min(timeout, binding.timeout(now));
        }

        for allocation in &self.relay_allocations {
            timeout = opt_min(timeout, allocation.timeout(now));
        }

        if self.gathering_state == GatheringState::Gathering
            && self.stun_bindings.is_empty()
            && self.relay_allocations.is_empty()
        {
            return Some(Duration::ZERO);
        }

        if self.remote_credentials.is_none() {
            return timeout;
        }

        let has_pending_checks = !self.triggered_check_queue.is_empty()
            || self
                .pairs
                .iter()
                .any(|p| matches!(p.state, CandidatePairState::Waiting));

        if has_pending_checks {
            let ta = match self.last_ta_trigger {
                Some(last) => (last + shared.stun_config.ta).saturating_duration_since(now),
                None => Duration::ZERO,
            };

            timeout = opt_min(timeout, Some(ta));
        }

        for pair in &self.pairs {
            if let CandidatePairState::InProgress { retransmit_at, .. } = &pair.state {
                timeout = opt_min(timeout, Some(retransmit_at.saturating_duration_since(now)));
            }
        }

        timeout
    }
}

fn push_outgoing(shared: &mut Shared, id: StreamId, outgoing: Outgoing) {
    shared.events.push_back(IceEvent::SendData {
        stream: id,
        component: outgoing.component,
        data: outgoing.data,
        source: None,
        target: outgoing.target,
    });
}

fn pair_priority(local_candidate: &Candidate, remote_candidate: &Candidate, is_controlling: bool) -> u64 {
    let (g, d) = if is_controlling {
        (
            u64::from(local_candidate.priority),
            u64::from(remote_candidate.priority),
        )
    } else {
        (
            u64::from(remote_candidate.priority),
            u64::from(local_candidate.priority),
        )
    };

    // pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
    (1u64 << 32) * min(g, d) + 2 * max(g, d) + u64::from(g > d)
}

fn compute_foundation(kind: CandidateKind, base: IpAddr, rel_addr: Option<IpAddr>, proto: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    (kind, base, rel_addr, proto).hash(&mut hasher);
    hasher.finish()
}

struct DisplayPair<'a>(&'a Candidate, &'a Candidate);

impl fmt::Display for DisplayPair<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_candidate(f: &mut fmt::Formatter<'_>, c: &Candidate) -> fmt::Result {
            match c.kind {
                CandidateKind::Host => write!(f, "host({})", c.addr),
                CandidateKind::PeerReflexive => {
                    write!(f, "peer-reflexive(base:{}, peer:{})", c.base, c.addr)
                }
                CandidateKind::ServerReflexive => {
                    write!(f, "server-reflexive(base:{}, server:{})", c.base, c.addr)
                }
                CandidateKind::Relayed => write!(f, "relayed({})", c.addr),
            }
        }

        fmt_candidate(f, self.0)?;
        write!(f, " <-> ")?;
        fmt_candidate(f, self.1)
    }
}

pub(crate) fn opt_min<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(min(a, b)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn candidate(kind: CandidateKind, priority: u32) -> Candidate {
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();

        Candidate {
            addr,
            kind,
            priority,
            foundation: "1".into(),
            component: Component::Rtp,
            base: addr,
            related: None,
        }
    }

    #[test]
    fn pair_priority_is_role_symmetric() {
        let a = candidate(CandidateKind::Host, 2_130_706_431);
        let b = candidate(CandidateKind::ServerReflexive, 1_694_498_815);

        // The controlling side's local candidate equals the controlled side's remote one
        assert_eq!(pair_priority(&a, &b, true), pair_priority(&b, &a, false));
        assert_ne!(pair_priority(&a, &b, true), pair_priority(&a, &b, false));
    }

    #[test]
    fn foundation_depends_on_type_and_base() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();

        assert_eq!(
            compute_foundation(CandidateKind::Host, ip, None, "udp"),
            compute_foundation(CandidateKind::Host, ip, None, "udp")
        );
        assert_ne!(
            compute_foundation(CandidateKind::Host, ip, None, "udp"),
            compute_foundation(CandidateKind::ServerReflexive, ip, None, "udp")
        );
        assert_ne!(
            compute_foundation(CandidateKind::Host, ip, None, "udp"),
            compute_foundation(CandidateKind::Host, other, None, "udp")
        );
    }

    #[test]
    fn sdp_candidate_of_server_reflexive() {
        let mut c = candidate(CandidateKind::ServerReflexive, 1_694_498_815);
        c.addr = "203.0.113.5:40000".parse().unwrap();
        c.related = Some("10.0.0.1:5000".parse().unwrap());

        let sdp = c.to_sdp();

        assert_eq!(sdp.typ, "srflx");
        assert_eq!(sdp.port, 40000);
        assert_eq!(sdp.rel_port, Some(5000));
        assert_eq!(
            sdp.to_string(),
            "candidate:1 1 UDP 1694498815 203.0.113.5 40000 typ srflx raddr 10.0.0.1 rport 5000"
        );
    }
}
