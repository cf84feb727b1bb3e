use crate::{Component, IceCredentials};
use std::{
    cmp::min,
    net::SocketAddr,
    time::{Duration, Instant},
};
use stun_types::{
    Class, Message, MessageBuilder, Method, TransactionId,
    attributes::{
        ErrorCode, IceControlled, IceControlling, Priority, UseCandidate, Username,
        XorMappedAddress,
    },
};

/// Timing and limits of the ICE agent's STUN transactions
#[derive(Debug, Clone)]
pub struct StunConfig {
    /// Retransmission timeout of the first retransmit
    pub initial_rto: Duration,
    /// Number of retransmits before a transaction is considered failed
    pub max_retransmits: u32,
    /// Upper bound of the exponential backoff
    pub max_rto: Duration,
    /// Interval in which server reflexive bindings are refreshed
    pub binding_refresh_interval: Duration,
    /// Pacing of connectivity checks (Ta)
    pub ta: Duration,
    /// Maximum number of candidate pairs kept per stream
    pub max_pairs: usize,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(250),
            max_retransmits: 7,
            max_rto: Duration::from_secs(3),
            binding_refresh_interval: Duration::from_secs(20),
            ta: Duration::from_millis(50),
            max_pairs: 100,
        }
    }
}

impl StunConfig {
    pub(crate) fn retransmit_delta(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.min(16);

        min(self.initial_rto.saturating_mul(factor), self.max_rto)
    }
}

pub(crate) struct BindingRequest<'a> {
    pub(crate) local_credentials: &'a IceCredentials,
    pub(crate) remote_credentials: &'a IceCredentials,
    pub(crate) priority: u32,
    pub(crate) is_controlling: bool,
    pub(crate) tie_breaker: u64,
    pub(crate) use_candidate: bool,
}

pub(crate) fn make_binding_request(
    transaction_id: TransactionId,
    request: BindingRequest<'_>,
) -> Result<Vec<u8>, stun_types::Error> {
    let mut builder = MessageBuilder::new(Class::Request, Method::Binding, transaction_id);

    builder.add_attr(&Username::new(format!(
        "{}:{}",
        request.remote_credentials.ufrag, request.local_credentials.ufrag
    )));
    builder.add_attr(&Priority(request.priority));

    if request.is_controlling {
        builder.add_attr(&IceControlling(request.tie_breaker));
    } else {
        builder.add_attr(&IceControlled(request.tie_breaker));
    }

    if request.use_candidate {
        builder.add_attr(&UseCandidate);
    }

    builder.add_message_integrity(request.remote_credentials.pwd.as_bytes());
    builder.add_fingerprint();
    builder.finish()
}

pub(crate) fn make_success_response(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    source: SocketAddr,
) -> Result<Vec<u8>, stun_types::Error> {
    let mut builder = MessageBuilder::new(Class::Success, Method::Binding, transaction_id);

    builder.add_attr(&XorMappedAddress(source));
    builder.add_message_integrity(local_credentials.pwd.as_bytes());
    builder.add_fingerprint();
    builder.finish()
}

pub(crate) fn make_role_error(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    is_controlling: bool,
    tie_breaker: u64,
) -> Result<Vec<u8>, stun_types::Error> {
    let mut builder = MessageBuilder::new(Class::Error, Method::Binding, transaction_id);

    builder.add_attr(&ErrorCode::new(ErrorCode::ROLE_CONFLICT, "Role Conflict"));

    if is_controlling {
        builder.add_attr(&IceControlling(tie_breaker));
    } else {
        builder.add_attr(&IceControlled(tie_breaker));
    }

    builder.add_message_integrity(local_credentials.pwd.as_bytes());
    builder.add_fingerprint();
    builder.finish()
}

/// Check MESSAGE-INTEGRITY of a connectivity check message
///
/// Requests are signed with our password and must carry `local:remote` as USERNAME,
/// responses are signed with the peer's password.
pub(crate) fn verify_integrity(
    local_credentials: &IceCredentials,
    remote_credentials: &IceCredentials,
    stun_msg: &Message,
) -> bool {
    let is_request = matches!(stun_msg.class(), Class::Request | Class::Indication);

    let key = if is_request {
        &local_credentials.pwd
    } else {
        &remote_credentials.pwd
    };

    if !stun_msg.verify_integrity(key.as_bytes()) {
        return false;
    }

    if !is_request {
        return true;
    }

    let expected = format!("{}:{}", local_credentials.ufrag, remote_credentials.ufrag);

    match stun_msg.attribute::<Username>() {
        Some(Ok(username)) => username.0 == expected,
        Some(Err(e)) => {
            log::debug!("Failed to parse STUN username attribute, {e}");
            false
        }
        None => {
            log::debug!("STUN request is missing the USERNAME attribute");
            false
        }
    }
}

/// Outgoing STUN packet produced by a server transaction
pub(crate) struct Outgoing {
    pub(crate) component: Component,
    pub(crate) data: Vec<u8>,
    pub(crate) target: SocketAddr,
}

/// Binding to a STUN server used to discover server reflexive candidates
pub(crate) struct StunServerBinding {
    server: SocketAddr,
    component: Component,
    state: StunServerBindingState,
    last_mapped_addr: Option<SocketAddr>,
}

enum StunServerBindingState {
    Waiting,
    InProgress {
        transaction_id: TransactionId,
        stun_request: Vec<u8>,
        retransmit_at: Instant,
        retransmits: u32,
    },
    WaitingForRefresh {
        refresh_at: Instant,
    },
    Failed,
}

impl StunServerBinding {
    pub(crate) fn new(server: SocketAddr, component: Component) -> Self {
        Self {
            server,
            component,
            state: StunServerBindingState::Waiting,
            last_mapped_addr: None,
        }
    }

    pub(crate) fn component(&self) -> Component {
        self.component
    }

    pub(crate) fn server(&self) -> SocketAddr {
        self.server
    }

    /// Returns if the binding has either been completed or failed to complete
    pub(crate) fn is_completed(&self) -> bool {
        self.last_mapped_addr.is_some() || matches!(self.state, StunServerBindingState::Failed)
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        match &self.state {
            StunServerBindingState::Waiting => Some(Duration::ZERO),
            StunServerBindingState::InProgress { retransmit_at, .. } => {
                Some(retransmit_at.saturating_duration_since(now))
            }
            StunServerBindingState::WaitingForRefresh { refresh_at } => {
                Some(refresh_at.saturating_duration_since(now))
            }
            StunServerBindingState::Failed => None,
        }
    }

    pub(crate) fn poll(&mut self, now: Instant, stun_config: &StunConfig) -> Option<Outgoing> {
        match &mut self.state {
            StunServerBindingState::Waiting => self.start_binding_request(now, stun_config),
            StunServerBindingState::InProgress {
                stun_request,
                retransmit_at,
                retransmits,
                ..
            } => {
                if *retransmit_at > now {
                    return None;
                }

                if *retransmits >= stun_config.max_retransmits {
                    log::debug!("STUN server {} did not respond", self.server);
                    self.state = StunServerBindingState::Failed;
                    self.last_mapped_addr = None;
                    return None;
                }

                *retransmits += 1;
                *retransmit_at += stun_config.retransmit_delta(*retransmits);

                Some(Outgoing {
                    component: self.component,
                    data: stun_request.clone(),
                    target: self.server,
                })
            }
            StunServerBindingState::WaitingForRefresh { refresh_at } => {
                if now >= *refresh_at {
                    self.start_binding_request(now, stun_config)
                } else {
                    None
                }
            }
            StunServerBindingState::Failed => None,
        }
    }

    fn start_binding_request(&mut self, now: Instant, stun_config: &StunConfig) -> Option<Outgoing> {
        let transaction_id = TransactionId::random();

        let mut builder = MessageBuilder::new(Class::Request, Method::Binding, transaction_id);
        builder.add_fingerprint();

        let stun_request = match builder.finish() {
            Ok(stun_request) => stun_request,
            Err(e) => {
                log::error!("Failed to build STUN binding request, {e}");
                self.state = StunServerBindingState::Failed;
                return None;
            }
        };

        self.state = StunServerBindingState::InProgress {
            transaction_id,
            stun_request: stun_request.clone(),
            retransmit_at: now + stun_config.retransmit_delta(0),
            retransmits: 0,
        };

        Some(Outgoing {
            component: self.component,
            data: stun_request,
            target: self.server,
        })
    }

    pub(crate) fn wants_stun_response(&self, transaction_id: TransactionId) -> bool {
        matches!(&self.state, StunServerBindingState::InProgress { transaction_id: tsx_id, .. } if transaction_id == *tsx_id)
    }

    /// Receive a STUN response
    ///
    /// Returns the address discovered through the STUN binding
    pub(crate) fn receive_stun_response(
        &mut self,
        now: Instant,
        stun_config: &StunConfig,
        stun_msg: &Message,
    ) -> Option<SocketAddr> {
        if stun_msg.class() != Class::Success {
            log::debug!("STUN server {} responded with an error", self.server);
            self.state = StunServerBindingState::Failed;
            return None;
        }

        let mapped = match stun_msg.attribute::<XorMappedAddress>() {
            Some(Ok(mapped)) => mapped.0,
            Some(Err(e)) => {
                log::debug!("STUN server response contains invalid XOR-MAPPED-ADDRESS, {e}");
                self.state = StunServerBindingState::Failed;
                return None;
            }
            None => {
                log::debug!("STUN server response is missing XOR-MAPPED-ADDRESS");
                self.state = StunServerBindingState::Failed;
                return None;
            }
        };

        self.state = StunServerBindingState::WaitingForRefresh {
            refresh_at: now + stun_config.binding_refresh_interval,
        };
        self.last_mapped_addr = Some(mapped);

        Some(mapped)
    }
}
