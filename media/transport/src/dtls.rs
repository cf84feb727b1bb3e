//! DTLS handshake of a single WebRTC component
//!
//! [`DtlsTransport`] is sans-IO: records received from the peer are handed to it and records to send are
//! collected from [`DtlsTransport::pop_to_send`]. It stays locked until ICE reports the component as
//! connected, records received before that are kept and processed once unlocked.

use openssl::{
    error::ErrorStack,
    hash::MessageDigest,
    ssl::{ErrorCode, Ssl, SslContext, SslStream, SslVerifyMode},
};
use sdp_types::{Fingerprint, FingerprintAlgorithm};
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    mem,
    time::Duration,
};

const DTLS_MTU: u32 = 1200;
const KEYING_MATERIAL_LABEL: &str = "EXTRACTOR-dtls_srtp";
const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum DtlsError {
    #[error("failed to create DTLS session: {0}")]
    Create(#[source] ErrorStack),
    #[error("DTLS handshake failed: {0}")]
    Handshake(#[source] openssl::ssl::Error),
    #[error("peer did not negotiate a SRTP protection profile")]
    MissingSrtpProfile,
    #[error("unsupported SRTP protection profile {0}")]
    UnsupportedSrtpProfile(String),
    #[error("failed to export keying material: {0}")]
    ExportKeyingMaterial(#[source] ErrorStack),
    #[error("DTLS transport is not connected")]
    NotConnected,
}

/// Which side of the handshake this transport takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    /// Initiates the handshake (`a=setup:active`)
    Client,
    /// Waits for the peer's ClientHello (`a=setup:passive`)
    Server,
}

impl DtlsRole {
    pub fn from_active(active: bool) -> Self {
        if active {
            DtlsRole::Client
        } else {
            DtlsRole::Server
        }
    }

    pub fn is_active(self) -> bool {
        self == DtlsRole::Client
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    /// Waiting for ICE to connect the component
    Locked,
    Handshaking,
    /// Handshake done, SRTP keys have been exported
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpProfile {
    Aes128CmSha1_80,
    Aes128CmSha1_32,
}

impl SrtpProfile {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "SRTP_AES128_CM_SHA1_80" => Some(SrtpProfile::Aes128CmSha1_80),
            "SRTP_AES128_CM_SHA1_32" => Some(SrtpProfile::Aes128CmSha1_32),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SrtpProfile::Aes128CmSha1_80 => "SRTP_AES128_CM_SHA1_80",
            SrtpProfile::Aes128CmSha1_32 => "SRTP_AES128_CM_SHA1_32",
        }
    }

    /// Length of master key and master salt
    pub fn key_and_salt_len(self) -> (usize, usize) {
        (16, 14)
    }
}

/// SRTP master keys (key followed by salt) exported from a completed handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtlsSrtpKeys {
    pub profile: SrtpProfile,
    /// Used to protect outgoing packets
    pub local: Vec<u8>,
    /// Used to unprotect incoming packets
    pub remote: Vec<u8>,
}

pub(crate) struct DtlsTransport {
    stream: SslStream<IoQueue>,
    role: DtlsRole,
    fingerprints: Vec<Fingerprint>,
    state: DtlsState,
    keys: Option<DtlsSrtpKeys>,
    app_data: VecDeque<Vec<u8>>,
}

impl DtlsTransport {
    /// Create a locked transport, the peer's certificate must match one of `fingerprints` if any are given
    pub(crate) fn new(
        ctx: &SslContext,
        role: DtlsRole,
        fingerprints: Vec<Fingerprint>,
    ) -> Result<Self, DtlsError> {
        let stream = build_stream(ctx, role, fingerprints.clone(), IoQueue::default())?;

        Ok(Self {
            stream,
            role,
            fingerprints,
            state: DtlsState::Locked,
            keys: None,
            app_data: VecDeque::new(),
        })
    }

    pub(crate) fn role(&self) -> DtlsRole {
        self.role
    }

    pub(crate) fn state(&self) -> DtlsState {
        self.state
    }

    pub(crate) fn keys(&self) -> Option<&DtlsSrtpKeys> {
        self.keys.as_ref()
    }

    /// Switch to another certificate, only possible before the handshake started
    pub(crate) fn set_context(&mut self, ctx: &SslContext) -> Result<bool, DtlsError> {
        if self.state != DtlsState::Locked {
            return Ok(false);
        }

        // Records received while locked are kept
        let io = mem::take(self.stream.get_mut());
        self.stream = build_stream(ctx, self.role, self.fingerprints.clone(), io)?;

        Ok(true)
    }

    /// Unlock the transport and start the handshake
    ///
    /// Returns the exported keys if the handshake completed with records received while locked.
    pub(crate) fn unlock(&mut self) -> Result<Option<DtlsSrtpKeys>, DtlsError> {
        if self.state != DtlsState::Locked {
            return Ok(None);
        }

        log::debug!("Unlocking DTLS transport, role={:?}", self.role);

        self.state = DtlsState::Handshaking;
        self.handshake()
    }

    /// Receive a DTLS record from the peer
    ///
    /// Returns the exported keys when this record completed the handshake.
    pub(crate) fn receive(&mut self, data: Vec<u8>) -> Result<Option<DtlsSrtpKeys>, DtlsError> {
        self.stream.get_mut().incoming.push_back(data);

        match self.state {
            DtlsState::Locked | DtlsState::Failed => Ok(None),
            DtlsState::Handshaking => self.handshake(),
            DtlsState::Connected => {
                self.read_app_data();
                Ok(None)
            }
        }
    }

    /// Drive retransmissions of the handshake
    pub(crate) fn poll(&mut self) -> Result<Option<DtlsSrtpKeys>, DtlsError> {
        if self.state == DtlsState::Handshaking {
            self.handshake()
        } else {
            Ok(None)
        }
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        match self.state {
            DtlsState::Handshaking => Some(RETRANSMIT_INTERVAL),
            DtlsState::Locked | DtlsState::Connected | DtlsState::Failed => None,
        }
    }

    pub(crate) fn pop_to_send(&mut self) -> Option<Vec<u8>> {
        self.stream.get_mut().outgoing.pop_front()
    }

    /// Send application data (SCTP packets) over the established connection
    pub(crate) fn send_app_data(&mut self, data: &[u8]) -> Result<(), DtlsError> {
        if self.state != DtlsState::Connected {
            return Err(DtlsError::NotConnected);
        }

        self.stream.ssl_write(data).map_err(DtlsError::Handshake)?;

        Ok(())
    }

    pub(crate) fn pop_app_data(&mut self) -> Option<Vec<u8>> {
        self.app_data.pop_front()
    }

    fn handshake(&mut self) -> Result<Option<DtlsSrtpKeys>, DtlsError> {
        if let Err(e) = self.stream.do_handshake() {
            if e.code() == ErrorCode::WANT_READ {
                return Ok(None);
            }

            self.state = DtlsState::Failed;
            return Err(DtlsError::Handshake(e));
        }

        let keys = match self.export_keys() {
            Ok(keys) => keys,
            Err(e) => {
                self.state = DtlsState::Failed;
                return Err(e);
            }
        };

        log::debug!(
            "DTLS handshake completed, role={:?} profile={}",
            self.role,
            keys.profile.name()
        );

        self.state = DtlsState::Connected;
        self.keys = Some(keys.clone());

        // Records that arrived together with the last flight may already carry data
        self.read_app_data();

        Ok(Some(keys))
    }

    fn export_keys(&self) -> Result<DtlsSrtpKeys, DtlsError> {
        let ssl = self.stream.ssl();

        let profile_name = ssl
            .selected_srtp_profile()
            .ok_or(DtlsError::MissingSrtpProfile)?
            .name();

        let profile = SrtpProfile::from_name(profile_name)
            .ok_or_else(|| DtlsError::UnsupportedSrtpProfile(profile_name.into()))?;

        let (key_len, salt_len) = profile.key_and_salt_len();

        let mut material = vec![0u8; (key_len + salt_len) * 2];
        ssl.export_keying_material(&mut material, KEYING_MATERIAL_LABEL, None)
            .map_err(DtlsError::ExportKeyingMaterial)?;

        // client key | server key | client salt | server salt
        let (keys, salts) = material.split_at(key_len * 2);
        let (client_key, server_key) = keys.split_at(key_len);
        let (client_salt, server_salt) = salts.split_at(salt_len);

        let client = [client_key, client_salt].concat();
        let server = [server_key, server_salt].concat();

        let (local, remote) = if ssl.is_server() {
            (server, client)
        } else {
            (client, server)
        };

        Ok(DtlsSrtpKeys {
            profile,
            local,
            remote,
        })
    }

    fn read_app_data(&mut self) {
        let mut buf = [0u8; 2048];

        loop {
            match self.stream.ssl_read(&mut buf) {
                Ok(0) => break,
                Ok(len) => self.app_data.push_back(buf[..len].to_vec()),
                Err(e) if e.code() == ErrorCode::WANT_READ => break,
                Err(e) if e.code() == ErrorCode::ZERO_RETURN => {
                    log::debug!("DTLS peer closed the connection");
                    break;
                }
                Err(e) => {
                    log::warn!("Failed to read DTLS application data, {e}");
                    break;
                }
            }
        }
    }
}

fn build_stream(
    ctx: &SslContext,
    role: DtlsRole,
    fingerprints: Vec<Fingerprint>,
    io: IoQueue,
) -> Result<SslStream<IoQueue>, DtlsError> {
    let mut ssl = Ssl::new(ctx).map_err(DtlsError::Create)?;
    ssl.set_mtu(DTLS_MTU).map_err(DtlsError::Create)?;

    ssl.set_verify_callback(
        SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        move |_preverify_ok, x509_store| {
            if fingerprints.is_empty() {
                return true;
            }

            let Some(certificate) = x509_store.current_cert() else {
                return false;
            };

            fingerprints.iter().any(|fingerprint| {
                digest_of(&fingerprint.algorithm)
                    .and_then(|digest| certificate.digest(digest).ok())
                    .is_some_and(|digest| digest.as_ref() == fingerprint.fingerprint.as_slice())
            })
        },
    );

    match role {
        DtlsRole::Client => ssl.set_connect_state(),
        DtlsRole::Server => ssl.set_accept_state(),
    }

    SslStream::new(ssl, io).map_err(DtlsError::Create)
}

/// Returns true if the packet is a DTLS record (RFC 7983 demultiplexing)
pub(crate) fn is_dtls_record(data: &[u8]) -> bool {
    matches!(data.first(), Some(20..=63))
}

fn digest_of(algorithm: &FingerprintAlgorithm) -> Option<MessageDigest> {
    match algorithm {
        FingerprintAlgorithm::SHA1 => Some(MessageDigest::sha1()),
        FingerprintAlgorithm::SHA224 => Some(MessageDigest::sha224()),
        FingerprintAlgorithm::SHA256 => Some(MessageDigest::sha256()),
        FingerprintAlgorithm::SHA384 => Some(MessageDigest::sha384()),
        FingerprintAlgorithm::SHA512 => Some(MessageDigest::sha512()),
        FingerprintAlgorithm::MD5 => Some(MessageDigest::md5()),
        FingerprintAlgorithm::Other(_) => None,
    }
}

/// Datagram queues used as the BIO of the OpenSSL stream
#[derive(Default)]
struct IoQueue {
    incoming: VecDeque<Vec<u8>>,
    outgoing: VecDeque<Vec<u8>>,
}

impl Read for IoQueue {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(datagram) = self.incoming.pop_front() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };

        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);

        Ok(len)
    }
}

impl Write for IoQueue {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
