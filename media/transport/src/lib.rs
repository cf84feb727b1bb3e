//! # Media transports negotiated using SDP
//!
//! This crate implements the transport side of a media endpoint: plain RTP, SDES keyed SRTP and
//! ICE/DTLS-SRTP connections (including SCTP data channels), negotiated through an SDP offer/answer
//! exchange.
//!
//! [`Session`] is the top level type and is sans-io. Media processing elements are never created
//! directly, they are requested from a [`Pipeline`] implementation provided by the user.
//!
//! Support for IO is provided when enabling the `tokio` feature flag. It is not a wrapper around
//! `Session`, but a "companion" type to be used alongside it.

pub mod agent;
pub mod certificate;
pub mod config;
pub mod connection;
pub mod dtls;
mod packet_kind;
pub mod pipeline;
mod registry;
pub mod sdes;
mod session;
pub mod socket;
#[cfg(feature = "tokio")]
pub mod tokio;

pub use agent::Agent;
pub use certificate::{Certificate, CertificateError, fingerprint_sdp_attr};
pub use config::{TransportConfig, TransportMode, TurnTransport, TurnUrl, TurnUrlError};
pub use connection::{ConnectedSignal, Connection, ConnectionError, ConnectionKind};
pub use ice::{Component, ComponentState};
pub use pipeline::{Caps, Element, Pad, Pipeline, PipelineError, PropertyValue};
pub use registry::BUNDLE_CONNECTION_NAME;
pub use sdes::{SdesError, SdesKey, SdesKeyManager};
pub use session::{
    LocalMedia, LocalMediaId, MediaHandler, NegotiationError, NegotiationState, ReceivedPacket,
    Session, SessionError, SessionEvent, TransportChange,
};

pub(crate) fn opt_min<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
    }
}
