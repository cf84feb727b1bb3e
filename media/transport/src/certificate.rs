use openssl::{
    asn1::{Asn1Time, Asn1Type},
    bn::{BigNum, MsbOption},
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    sha::sha256,
    ssl::{SslAcceptor, SslContext, SslMethod, SslVersion},
    x509::{X509, X509Name},
};
use sdp_types::{Fingerprint, FingerprintAlgorithm};
use std::{fs, io, path::Path};

/// SRTP protection profiles offered in the DTLS `use_srtp` extension
pub(crate) const SRTP_PROFILES: &str = "SRTP_AES128_CM_SHA1_80:SRTP_AES128_CM_SHA1_32";

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("failed to read certificate file: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    OpenSsl(#[from] ErrorStack),
    #[error("PEM does not contain a certificate")]
    MissingCertificate,
    #[error("PEM does not contain a private key")]
    MissingPrivateKey,
}

/// DTLS certificate with its private key
#[derive(Clone)]
pub struct Certificate {
    cert: X509,
    pkey: PKey<Private>,
}

impl Certificate {
    /// Generate a new self-signed certificate
    pub fn generate() -> Result<Self, CertificateError> {
        openssl::init();

        let rsa = Rsa::generate(2048)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let serial_number = {
            let mut serial = BigNum::new()?;
            serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
            serial.to_asn1_integer()?
        };
        builder.set_serial_number(&serial_number)?;

        builder.set_pubkey(&pkey)?;
        builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
        builder.set_not_after(Asn1Time::days_from_now(30)?.as_ref())?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_nid_with_type(Nid::COMMONNAME, "ezk-transport", Asn1Type::UTF8STRING)?;
        let name = name.build();

        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        builder.sign(&pkey, MessageDigest::sha256())?;

        Ok(Self {
            cert: builder.build(),
            pkey,
        })
    }

    /// Load certificate and private key from a single PEM buffer
    pub fn from_pem(pem: &[u8]) -> Result<Self, CertificateError> {
        let cert = X509::stack_from_pem(pem)?
            .into_iter()
            .next()
            .ok_or(CertificateError::MissingCertificate)?;

        let pkey =
            PKey::private_key_from_pem(pem).map_err(|_| CertificateError::MissingPrivateKey)?;

        Ok(Self { cert, pkey })
    }

    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, CertificateError> {
        Self::from_pem(&fs::read(path)?)
    }

    /// Certificate followed by the private key, both PEM encoded
    pub fn to_pem(&self) -> Result<String, CertificateError> {
        let mut pem = self.cert.to_pem()?;
        pem.extend(self.pkey.private_key_to_pem_pkcs8()?);

        Ok(String::from_utf8_lossy(&pem).into_owned())
    }

    /// SHA-256 fingerprint of the DER encoded certificate
    pub fn fingerprint(&self) -> Result<Fingerprint, CertificateError> {
        Ok(Fingerprint {
            algorithm: FingerprintAlgorithm::SHA256,
            fingerprint: sha256(&self.cert.to_der()?).to_vec(),
        })
    }

    /// Build the SSL context used by the DTLS handshakes of all connections using this certificate
    pub(crate) fn ssl_context(&self) -> Result<SslContext, CertificateError> {
        let mut ctx = SslAcceptor::mozilla_modern(SslMethod::dtls())?;
        ctx.set_tlsext_use_srtp(SRTP_PROFILES)?;
        ctx.set_min_proto_version(Some(SslVersion::DTLS1_2))?;
        ctx.set_private_key(&self.pkey)?;
        ctx.set_certificate(&self.cert)?;
        ctx.check_private_key()?;

        Ok(ctx.build().into_context())
    }
}

/// Value of the `a=fingerprint` attribute for the first certificate inside `pem`,
/// e.g. `sha-256 4A:AD:...`
pub fn fingerprint_sdp_attr(pem: &str) -> Result<String, CertificateError> {
    let cert = X509::stack_from_pem(pem.as_bytes())?
        .into_iter()
        .next()
        .ok_or(CertificateError::MissingCertificate)?;

    let fingerprint = Fingerprint {
        algorithm: FingerprintAlgorithm::SHA256,
        fingerprint: sha256(&cert.to_der()?).to_vec(),
    };

    Ok(fingerprint.to_string())
}
