//! SDES (`a=crypto`) key exchange for SRTP over plain RTP sessions

use crate::{connection::Connection, pipeline::Pipeline};
use base64::{Engine, prelude::BASE64_STANDARD};
use sdp_types::{SrtpCrypto, SrtpKeyingMaterial, SrtpSuite};
use std::{collections::HashMap, sync::Arc};

/// Tag of the key offered for every media
pub const DEFAULT_KEY_TAG: u32 = 1;

/// Size of the master key (key and salt) for AES-128 suites
pub const AES_128_KEY_SIZE: usize = 30;
/// Size of the master key (key and salt) for AES-256 suites
pub const AES_256_KEY_SIZE: usize = 46;

#[derive(Debug, thiserror::Error)]
pub enum SdesError {
    #[error("no keys configured for media {0}")]
    MissingKeys(String),
    #[error("no crypto suite configured")]
    NoCryptoSuite,
    #[error("crypto suite {0} is not supported")]
    UnsupportedSuite(String),
    #[error("no key provided in offer")]
    NoKeysOffered,
    #[error("none of the offered keys uses the configured crypto suite")]
    NoSupportedKey,
    #[error("no local key for media {0}")]
    MissingLocalKey(String),
    #[error("remote key (tag={remote_tag}, suite={remote_suite}) does not match local key (tag={local_tag}, suite={local_suite})")]
    KeyMismatch {
        local_tag: u32,
        local_suite: SrtpSuite,
        remote_tag: u32,
        remote_suite: SrtpSuite,
    },
    #[error("master key must be 30 to 46 characters long, got {0}")]
    InvalidMasterKeyLength(usize),
}

/// A single SDES key with its tag and crypto suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesKey {
    pub tag: u32,
    pub suite: SrtpSuite,
    /// Base64 encoded master key and salt
    pub key: String,
}

impl SdesKey {
    pub fn from_crypto(crypto: &SrtpCrypto) -> Option<Self> {
        let key = crypto.keys.first()?;

        Some(Self {
            tag: crypto.tag,
            suite: crypto.suite.clone(),
            key: key.key_and_salt.clone(),
        })
    }

    pub fn to_crypto(&self) -> SrtpCrypto {
        SrtpCrypto {
            tag: self.tag,
            suite: self.suite.clone(),
            keys: vec![SrtpKeyingMaterial::new(self.key.clone())],
            params: vec![],
        }
    }

    /// Cipher and authentication names of the suite as understood by the SRTP elements
    pub fn cipher_and_auth(&self) -> Option<(&'static str, &'static str)> {
        match self.suite {
            SrtpSuite::AES_CM_128_HMAC_SHA1_32 => Some(("aes-128-icm", "hmac-sha1-32")),
            SrtpSuite::AES_CM_128_HMAC_SHA1_80 => Some(("aes-128-icm", "hmac-sha1-80")),
            SrtpSuite::AES_256_CM_HMAC_SHA1_32 => Some(("aes-256-icm", "hmac-sha1-32")),
            SrtpSuite::AES_256_CM_HMAC_SHA1_80 => Some(("aes-256-icm", "hmac-sha1-80")),
            SrtpSuite::Other(_) => None,
        }
    }

    /// Decoded master key and salt
    pub fn key_bytes(&self) -> Option<Vec<u8>> {
        BASE64_STANDARD.decode(&self.key).ok()
    }

    fn check_matches(&self, remote: &SdesKey) -> Result<(), SdesError> {
        if self.tag == remote.tag && self.suite == remote.suite {
            Ok(())
        } else {
            Err(SdesError::KeyMismatch {
                local_tag: self.tag,
                local_suite: self.suite.clone(),
                remote_tag: remote.tag,
                remote_suite: remote.suite.clone(),
            })
        }
    }
}

/// Size of the master key used with the given suite
pub fn max_key_size(suite: &SrtpSuite) -> Option<usize> {
    match suite {
        SrtpSuite::AES_CM_128_HMAC_SHA1_32 | SrtpSuite::AES_CM_128_HMAC_SHA1_80 => {
            Some(AES_128_KEY_SIZE)
        }
        SrtpSuite::AES_256_CM_HMAC_SHA1_32 | SrtpSuite::AES_256_CM_HMAC_SHA1_80 => {
            Some(AES_256_KEY_SIZE)
        }
        SrtpSuite::Other(_) => None,
    }
}

#[derive(Default)]
struct SdesKeyRecord {
    local: Option<SdesKey>,
    remote: Option<SdesKey>,
    offerer: bool,
    connection: Option<Arc<Connection>>,
}

/// Per media local & remote keys of a session
pub struct SdesKeyManager {
    suite: Option<SrtpSuite>,
    /// Base64 encoded, shared by every media and tag of the session
    master_key: Option<String>,
    records: HashMap<String, SdesKeyRecord>,
}

impl SdesKeyManager {
    pub fn new(suite: Option<SrtpSuite>) -> Self {
        Self {
            suite,
            master_key: None,
            records: HashMap::new(),
        }
    }

    /// Use a fixed master key instead of a random one
    pub fn set_master_key(&mut self, key: &str) -> Result<(), SdesError> {
        if !(AES_128_KEY_SIZE..=AES_256_KEY_SIZE).contains(&key.len()) {
            return Err(SdesError::InvalidMasterKeyLength(key.len()));
        }

        self.master_key = Some(BASE64_STANDARD.encode(key));

        Ok(())
    }

    pub fn master_key(&self) -> Option<&str> {
        self.master_key.as_deref()
    }

    pub fn suite(&self) -> Option<&SrtpSuite> {
        self.suite.as_ref()
    }

    /// Start tracking keys for the media
    pub fn add_media(&mut self, mid: &str) {
        self.records.entry(mid.into()).or_default();
    }

    pub fn remove_media(&mut self, mid: &str) {
        self.records.remove(mid);
    }

    /// Forget the keys of every media, the master key is kept
    pub fn clear_media(&mut self) {
        self.records.clear();
    }

    pub fn local_key(&self, mid: &str) -> Option<&SdesKey> {
        self.records.get(mid)?.local.as_ref()
    }

    pub fn remote_key(&self, mid: &str) -> Option<&SdesKey> {
        self.records.get(mid)?.remote.as_ref()
    }

    /// Create a key with the given tag, generating the session's master key on first use
    pub fn create_new_key(&mut self, tag: u32) -> Result<SdesKey, SdesError> {
        let suite = self.suite.clone().ok_or(SdesError::NoCryptoSuite)?;
        let size =
            max_key_size(&suite).ok_or_else(|| SdesError::UnsupportedSuite(suite.to_string()))?;

        let master_key = self.master_key.get_or_insert_with(|| {
            let key: Vec<u8> = (0..size).map(|_| rand::random::<u8>()).collect();
            BASE64_STANDARD.encode(key)
        });

        Ok(SdesKey {
            tag,
            suite,
            key: master_key.clone(),
        })
    }

    /// Offerer: create the local key of the media
    pub fn on_offer_keys(&mut self, mid: &str) -> Result<Vec<SrtpCrypto>, SdesError> {
        if !self.records.contains_key(mid) {
            return Err(SdesError::MissingKeys(mid.into()));
        }

        let key = self.create_new_key(DEFAULT_KEY_TAG)?;

        let record = self.record_mut(mid)?;
        record.local = Some(key.clone());
        record.offerer = true;

        Ok(vec![key.to_crypto()])
    }

    /// Answerer: pick the first offered key with the configured suite and answer with a key of the same tag
    pub fn on_answer_keys(
        &mut self,
        mid: &str,
        offered: &[SrtpCrypto],
    ) -> Result<SrtpCrypto, SdesError> {
        if offered.is_empty() {
            return Err(SdesError::NoKeysOffered);
        }

        let offer_key = self
            .supported_key(offered)
            .ok_or(SdesError::NoSupportedKey)?;

        if !self.records.contains_key(mid) {
            return Err(SdesError::MissingKeys(mid.into()));
        }

        let key = self.create_new_key(offer_key.tag)?;

        let record = self.record_mut(mid)?;
        record.local = Some(key.clone());
        record.remote = Some(offer_key);
        record.offerer = false;

        Ok(key.to_crypto())
    }

    /// Offerer: the answer selected `selected`, install it as the remote key
    ///
    /// Ignored for media this side did not offer.
    pub fn on_selected_key(
        &mut self,
        mid: &str,
        selected: &SrtpCrypto,
        pipeline: &mut dyn Pipeline,
    ) -> Result<(), SdesError> {
        let record = self.record_mut(mid)?;

        if !record.offerer {
            return Ok(());
        }

        let remote = SdesKey::from_crypto(selected).ok_or(SdesError::NoKeysOffered)?;
        record.remote = Some(remote);

        Self::install_remote_key(mid, record, pipeline)
    }

    /// Bind the media's connection to its keys and install everything that is known
    pub fn configure_connection_keys(
        &mut self,
        mid: &str,
        connection: &Arc<Connection>,
        pipeline: &mut dyn Pipeline,
    ) -> Result<(), SdesError> {
        let record = self.record_mut(mid)?;
        record.connection = Some(connection.clone());

        let local = record
            .local
            .as_ref()
            .ok_or_else(|| SdesError::MissingLocalKey(mid.into()))?;

        connection.set_srtp_key(pipeline, local, true);

        if record.offerer {
            return Ok(());
        }

        Self::install_remote_key(mid, record, pipeline)
    }

    fn install_remote_key(
        mid: &str,
        record: &SdesKeyRecord,
        pipeline: &mut dyn Pipeline,
    ) -> Result<(), SdesError> {
        let local = record
            .local
            .as_ref()
            .ok_or_else(|| SdesError::MissingLocalKey(mid.into()))?;

        let Some(remote) = &record.remote else {
            return Ok(());
        };

        local.check_matches(remote)?;

        if let Some(connection) = &record.connection {
            connection.set_srtp_key(pipeline, remote, false);
        }

        Ok(())
    }

    fn supported_key(&self, offered: &[SrtpCrypto]) -> Option<SdesKey> {
        let suite = self.suite.as_ref()?;

        offered
            .iter()
            .filter(|crypto| max_key_size(&crypto.suite).is_some() && crypto.suite == *suite)
            .find_map(SdesKey::from_crypto)
    }

    fn record_mut(&mut self, mid: &str) -> Result<&mut SdesKeyRecord, SdesError> {
        self.records
            .get_mut(mid)
            .ok_or_else(|| SdesError::MissingKeys(mid.into()))
    }
}
