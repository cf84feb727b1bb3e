use common::make_session;
use ezk_transport::{Certificate, LocalMedia, TransportConfig, fingerprint_sdp_attr};
use openssl::x509::X509;
use sdp_types::MediaType;

mod common;

#[test]
fn fingerprint_is_deterministic() {
    let pem = Certificate::generate().unwrap().to_pem().unwrap();

    let first = fingerprint_sdp_attr(&pem).unwrap();
    let second = fingerprint_sdp_attr(&pem).unwrap();
    assert_eq!(first, second);

    let (algorithm, hex) = first.split_once(' ').unwrap();
    assert_eq!(algorithm, "sha-256");
    assert_eq!(hex.split(':').count(), 32);
    assert!(hex.split(':').all(|byte| byte.len() == 2
        && byte.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())));
}

#[test]
fn fingerprint_changes_with_a_single_byte() {
    let pem = Certificate::generate().unwrap().to_pem().unwrap();

    let mut der = X509::from_pem(pem.as_bytes()).unwrap().to_der().unwrap();

    // Last byte of the signature, parsing does not verify it
    let last = der.len() - 1;
    der[last] ^= 0x01;

    let modified = X509::from_der(&der).unwrap().to_pem().unwrap();
    let modified = String::from_utf8(modified).unwrap();

    assert_ne!(
        fingerprint_sdp_attr(&pem).unwrap(),
        fingerprint_sdp_attr(&modified).unwrap()
    );
}

#[test]
fn certificate_file_replaces_the_fingerprint() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut session, _pipeline) = make_session(TransportConfig::webrtc());
    session
        .add_local_media(LocalMedia::new(MediaType::Audio, ["111"]))
        .unwrap();

    let offer = session.create_offer().unwrap();
    let generated = session.fingerprint().unwrap().clone();
    assert_eq!(offer.media_descriptions[0].fingerprint, vec![generated.clone()]);

    let certificate = Certificate::generate().unwrap();
    let path = std::env::temp_dir().join(format!("ezk-transport-{}.pem", std::process::id()));
    std::fs::write(&path, certificate.to_pem().unwrap()).unwrap();

    session.set_certificate_pem_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let expected = certificate.fingerprint().unwrap();
    assert_ne!(expected, generated);
    assert_eq!(session.fingerprint(), Some(&expected));
    assert_eq!(
        session.local_sdp().unwrap().media_descriptions[0].fingerprint,
        vec![expected.clone()]
    );
    assert_eq!(
        fingerprint_sdp_attr(&certificate.to_pem().unwrap()).unwrap(),
        expected.to_string()
    );
}

#[test]
fn missing_certificate_file_is_an_error() {
    let (mut session, _pipeline) = make_session(TransportConfig::webrtc());

    assert!(
        session
            .set_certificate_pem_file("/nonexistent/ezk-transport.pem")
            .is_err()
    );
    assert!(session.fingerprint().is_some());
}
