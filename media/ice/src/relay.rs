use crate::Component;
use crate::stun::{Outgoing, StunConfig};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use stun_types::attributes::{
    ErrorCode, Lifetime, Nonce, Realm, RequestedTransport, Username, XorMappedAddress,
    XorRelayedAddress, long_term_key,
};
use stun_types::{Class, Message, MessageBuilder, Method, TransactionId};

const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// TURN server used to gather relayed candidates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServer {
    pub server: SocketAddr,
    pub username: String,
    pub password: String,
}

/// Result of a successful allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Allocation {
    pub(crate) relayed: SocketAddr,
    pub(crate) mapped: SocketAddr,
}

struct LongTermAuth {
    realm: String,
    nonce: String,
    key: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Allocate,
    Refresh,
}

enum RelayState {
    Waiting,
    InProgress {
        kind: RequestKind,
        transaction_id: TransactionId,
        request: Vec<u8>,
        retransmit_at: Instant,
        retransmits: u32,
    },
    Allocated {
        refresh_at: Instant,
    },
    Failed,
}

/// UDP allocation on a TURN server (RFC 5766) using the long-term credential mechanism
pub(crate) struct RelayAllocation {
    relay: RelayServer,
    component: Component,
    state: RelayState,
    auth: Option<LongTermAuth>,
    allocation: Option<Allocation>,
}

impl RelayAllocation {
    pub(crate) fn new(relay: RelayServer, component: Component) -> Self {
        Self {
            relay,
            component,
            state: RelayState::Waiting,
            auth: None,
            allocation: None,
        }
    }

    pub(crate) fn component(&self) -> Component {
        self.component
    }

    /// Returns if the allocation either succeeded once or failed
    pub(crate) fn is_completed(&self) -> bool {
        self.allocation.is_some() || matches!(self.state, RelayState::Failed)
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        match &self.state {
            RelayState::Waiting => Some(Duration::ZERO),
            RelayState::InProgress { retransmit_at, .. } => {
                Some(retransmit_at.saturating_duration_since(now))
            }
            RelayState::Allocated { refresh_at } => Some(refresh_at.saturating_duration_since(now)),
            RelayState::Failed => None,
        }
    }

    pub(crate) fn wants_stun_response(&self, transaction_id: TransactionId) -> bool {
        matches!(&self.state, RelayState::InProgress { transaction_id: tsx_id, .. } if *tsx_id == transaction_id)
    }

    pub(crate) fn poll(&mut self, now: Instant, stun_config: &StunConfig) -> Option<Outgoing> {
        match &mut self.state {
            RelayState::Waiting => self.send_request(now, stun_config, RequestKind::Allocate),
            RelayState::InProgress {
                request,
                retransmit_at,
                retransmits,
                ..
            } => {
                if *retransmit_at > now {
                    return None;
                }

                if *retransmits >= stun_config.max_retransmits {
                    log::warn!("TURN server {} did not respond", self.relay.server);
                    self.state = RelayState::Failed;
                    return None;
                }

                *retransmits += 1;
                *retransmit_at += stun_config.retransmit_delta(*retransmits);

                Some(Outgoing {
                    component: self.component,
                    data: request.clone(),
                    target: self.relay.server,
                })
            }
            RelayState::Allocated { refresh_at } => {
                if now >= *refresh_at {
                    self.send_request(now, stun_config, RequestKind::Refresh)
                } else {
                    None
                }
            }
            RelayState::Failed => None,
        }
    }

    fn send_request(
        &mut self,
        now: Instant,
        stun_config: &StunConfig,
        kind: RequestKind,
    ) -> Option<Outgoing> {
        let transaction_id = TransactionId::random();

        let lifetime = match kind {
            RequestKind::Allocate => None,
            RequestKind::Refresh => Some(DEFAULT_LIFETIME.as_secs() as u32),
        };

        let request = match self.build_request(transaction_id, kind, lifetime) {
            Ok(request) => request,
            Err(e) => {
                log::error!("Failed to build TURN {kind:?} request, {e}");
                self.state = RelayState::Failed;
                return None;
            }
        };

        self.state = RelayState::InProgress {
            kind,
            transaction_id,
            request: request.clone(),
            retransmit_at: now + stun_config.retransmit_delta(0),
            retransmits: 0,
        };

        Some(Outgoing {
            component: self.component,
            data: request,
            target: self.relay.server,
        })
    }

    fn build_request(
        &self,
        transaction_id: TransactionId,
        kind: RequestKind,
        lifetime: Option<u32>,
    ) -> Result<Vec<u8>, stun_types::Error> {
        let method = match kind {
            RequestKind::Allocate => Method::Allocate,
            RequestKind::Refresh => Method::Refresh,
        };

        let mut builder = MessageBuilder::new(Class::Request, method, transaction_id);

        if kind == RequestKind::Allocate {
            builder.add_attr(&RequestedTransport::UDP);
        }

        if let Some(lifetime) = lifetime {
            builder.add_attr(&Lifetime(lifetime));
        }

        if let Some(auth) = &self.auth {
            builder.add_attr(&Username::new(&self.relay.username));
            builder.add_attr(&Realm::new(&auth.realm));
            builder.add_attr(&Nonce::new(&auth.nonce));
            builder.add_message_integrity(&auth.key);
        }

        builder.add_fingerprint();
        builder.finish()
    }

    /// Handle a response to the in-flight request
    ///
    /// Returns the allocation when it was created by this response
    pub(crate) fn receive_stun_response(
        &mut self,
        now: Instant,
        stun_config: &StunConfig,
        msg: &Message,
    ) -> (Option<Allocation>, Option<Outgoing>) {
        let RelayState::InProgress { kind, .. } = self.state else {
            return (None, None);
        };

        if let Some(auth) = &self.auth {
            if !msg.verify_integrity(&auth.key) && msg.class() == Class::Success {
                log::debug!("Discarding TURN response with invalid MESSAGE-INTEGRITY");
                return (None, None);
            }
        }

        match msg.class() {
            Class::Success => (self.handle_success(now, kind, msg), None),
            Class::Error => (None, self.handle_error(now, stun_config, kind, msg)),
            Class::Request | Class::Indication => (None, None),
        }
    }

    fn handle_success(&mut self, now: Instant, kind: RequestKind, msg: &Message) -> Option<Allocation> {
        let lifetime = match msg.attribute::<Lifetime>() {
            Some(Ok(lifetime)) => lifetime.duration(),
            _ => DEFAULT_LIFETIME,
        };

        let refresh_in = if lifetime > REFRESH_MARGIN * 2 {
            lifetime - REFRESH_MARGIN
        } else {
            lifetime / 2
        };

        self.state = RelayState::Allocated {
            refresh_at: now + refresh_in,
        };

        if kind == RequestKind::Refresh {
            log::debug!("Refreshed TURN allocation on {}", self.relay.server);
            return None;
        }

        let relayed = msg.attribute::<XorRelayedAddress>().and_then(Result::ok);
        let mapped = msg.attribute::<XorMappedAddress>().and_then(Result::ok);

        let (Some(relayed), Some(mapped)) = (relayed, mapped) else {
            log::warn!("TURN allocate response is missing relayed or mapped address");
            self.state = RelayState::Failed;
            return None;
        };

        let allocation = Allocation {
            relayed: relayed.0,
            mapped: mapped.0,
        };

        log::debug!(
            "Allocated relayed address {} on {} for {:?}",
            allocation.relayed,
            self.relay.server,
            self.component
        );

        self.allocation = Some(allocation);

        Some(allocation)
    }

    fn handle_error(
        &mut self,
        now: Instant,
        stun_config: &StunConfig,
        kind: RequestKind,
        msg: &Message,
    ) -> Option<Outgoing> {
        let code = match msg.attribute::<ErrorCode>() {
            Some(Ok(code)) => code,
            _ => {
                log::warn!("TURN error response without a valid ERROR-CODE");
                self.state = RelayState::Failed;
                return None;
            }
        };

        let nonce = msg.attribute::<Nonce>().and_then(Result::ok);

        match (code.number, nonce) {
            (ErrorCode::UNAUTHORIZED, Some(nonce)) if self.auth.is_none() => {
                let Some(Ok(realm)) = msg.attribute::<Realm>() else {
                    log::warn!("TURN 401 response is missing REALM");
                    self.state = RelayState::Failed;
                    return None;
                };

                let key = long_term_key(&self.relay.username, &realm.0, &self.relay.password);

                self.auth = Some(LongTermAuth {
                    realm: realm.0,
                    nonce: nonce.0,
                    key,
                });

                self.send_request(now, stun_config, kind)
            }
            (ErrorCode::STALE_NONCE, Some(nonce)) if self.auth.is_some() => {
                if let Some(auth) = &mut self.auth {
                    auth.nonce = nonce.0;
                }

                self.send_request(now, stun_config, kind)
            }
            (number, _) => {
                log::warn!(
                    "TURN {kind:?} request to {} failed with {number} {}",
                    self.relay.server,
                    code.reason
                );
                self.state = RelayState::Failed;
                None
            }
        }
    }
}
