//! Public-key pinning for API connections
//!
//! A pin is `base64(SHA256(SubjectPublicKeyInfo))`. The regular WebPKI chain
//! validation still runs; on top of it at least one certificate of the
//! presented chain must carry a pinned key. The same pin set and server name
//! are used whichever IP the request is dialled to.

use std::collections::BTreeSet;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Text carried by the TLS error when no pinned key is found
pub(crate) const PIN_FAILURE_MARKER: &str = "pinned certificate key not found";

/// Pins of the API host, fixed at build time (comma separated)
const BUILTIN_API_PINS: Option<&str> = option_env!("WARDEN_API_PINS");

/// Pins of the update host, fixed at build time (comma separated)
const BUILTIN_UPDATE_PINS: Option<&str> = option_env!("WARDEN_UPDATE_PINS");

/// Set of accepted SPKI hashes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinSet {
    pins: BTreeSet<String>,
}

impl PinSet {
    pub fn new<I, S>(pins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            pins: pins
                .into_iter()
                .map(|p| p.as_ref().trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Build-time API pins plus `extra`
    pub fn api(extra: &[String]) -> Self {
        Self::builtin(BUILTIN_API_PINS, extra)
    }

    /// Build-time update-host pins plus `extra`
    pub fn update(extra: &[String]) -> Self {
        Self::builtin(BUILTIN_UPDATE_PINS, extra)
    }

    fn builtin(compiled: Option<&str>, extra: &[String]) -> Self {
        let compiled = compiled.unwrap_or_default().split(',');
        Self::new(compiled.chain(extra.iter().map(String::as_str)))
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn contains(&self, pin: &str) -> bool {
        self.pins.contains(pin)
    }

    /// True when any certificate of the chain has a pinned key
    pub fn matches_chain<'a, I>(&self, chain: I) -> bool
    where
        I: IntoIterator<Item = &'a CertificateDer<'a>>,
    {
        for cert in chain {
            match spki_pin(cert.as_ref()) {
                Ok(pin) if self.contains(&pin) => return true,
                Ok(_) => {}
                Err(e) => log::debug!("Skipping certificate in pin check: {}", e),
            }
        }
        false
    }
}

/// `base64(SHA256(SPKI))` of a DER certificate
pub fn spki_pin(cert_der: &[u8]) -> Result<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| Error::CertificatePinFailure(format!("invalid certificate: {}", e)))?;
    let digest = Sha256::digest(cert.public_key().raw);
    Ok(BASE64.encode(digest))
}

/// WebPKI verification followed by the pin check
#[derive(Debug)]
pub struct PinnedVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pins: PinSet,
}

impl PinnedVerifier {
    pub fn new(pins: PinSet, provider: Arc<CryptoProvider>) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(root_store()), provider)
            .build()
            .map_err(|e| Error::Http(format!("failed to build certificate verifier: {}", e)))?;
        Ok(Self { inner, pins })
    }

    fn check_pins(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if self
            .pins
            .matches_chain(std::iter::once(end_entity).chain(intermediates.iter()))
        {
            Ok(ServerCertVerified::assertion())
        } else {
            log::error!("Certificate check error: {}", PIN_FAILURE_MARKER);
            Err(rustls::Error::General(PIN_FAILURE_MARKER.to_string()))
        }
    }
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        self.check_pins(end_entity, intermediates)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn root_store() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

/// TLS 1.2+ client configuration enforcing `pins`
///
/// There is no unpinned mode: an empty pin set is an error.
pub fn client_config(pins: &PinSet, host: &str) -> Result<ClientConfig> {
    if pins.is_empty() {
        return Err(Error::CertificatePinFailure(format!(
            "no pinned certificate keys for {} (set WARDEN_API_PINS at build time or api.extra_pins)",
            host
        )));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| Error::Http(format!("TLS configuration error: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedVerifier::new(pins.clone(), provider)?))
        .with_no_client_auth();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    // self-signed P-256 certificate for CN=api.example.net
    const TEST_CERT_DER_B64: &str = concat!(
        "MIIBijCCATGgAwIBAgIUaCxqV6zEKigvyXUc3yidbKFxo7swCgYIKoZIzj0EAwIwGjEYMBYGA1UE",
        "AwwPYXBpLmV4YW1wbGUubmV0MCAXDTI2MTAxOTA5MzQ1M1oYDzIxMjYwOTI1MDkzNDUzWjAaMRgw",
        "FgYDVQQDDA9hcGkuZXhhbXBsZS5uZXQwWTATBgcqhkjOPQIBBggqhkjOPQMBBwNCAAS+Un4vG0IT",
        "j02aZmkmOpyZj72ot+1gGN3aw0CK1RPbRSyC2qiBFbTqoXA6e0soqWUBwm/conmfFXRlL9SjzjR3",
        "o1MwUTAdBgNVHQ4EFgQUVOBIPZiviS2hnpqjqUstAJQzeJ0wHwYDVR0jBBgwFoAUVOBIPZiviS2h",
        "npqjqUstAJQzeJ0wDwYDVR0TAQH/BAUwAwEB/zAKBggqhkjOPQQDAgNHADBEAiAeoMrgVhNSl4/C",
        "jmIDwbNeUurhPWeKyB1Daw+UTziRAQIgOWkBC8dJvFPQIOG7zscOJyT6SfzeBXLyY6c99VCm478=",
    );

    const TEST_CERT_PIN: &str = "GhSHA5uyW9Det5rDNeDkIqWeZDJV9B9EgKg4tJk36zM=";

    fn test_cert() -> CertificateDer<'static> {
        CertificateDer::from(BASE64.decode(TEST_CERT_DER_B64).unwrap())
    }

    #[test]
    fn test_spki_pin() {
        let cert = test_cert();
        assert_eq!(spki_pin(cert.as_ref()).unwrap(), TEST_CERT_PIN);
    }

    #[test]
    fn test_chain_without_pinned_key_rejected() {
        let cert = test_cert();
        let pins = PinSet::new(["AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="]);
        assert!(!pins.matches_chain([&cert]));
        assert!(!PinSet::default().matches_chain([&cert]));
    }

    #[test]
    fn test_pinned_key_anywhere_in_chain() {
        let cert = test_cert();
        let garbage = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x00]);
        let pins = PinSet::new(["other", TEST_CERT_PIN]);
        assert!(pins.matches_chain([&garbage, &cert]));
    }

    #[test]
    fn test_pin_set_merges_extra() {
        let pins = PinSet::builtin(Some(" a, b ,,"), &["c".to_string(), " ".to_string()]);
        assert_eq!(pins.len(), 3);
        assert!(pins.contains("a") && pins.contains("b") && pins.contains("c"));
        assert!(PinSet::builtin(None, &[]).is_empty());
    }

    #[test]
    fn test_client_config_requires_pins() {
        client_config(&PinSet::new([TEST_CERT_PIN]), "api.example.net").unwrap();
        let err = client_config(&PinSet::default(), "api.example.net").unwrap_err();
        assert!(matches!(err, Error::CertificatePinFailure(_)), "{}", err);
        assert!(client_config(&PinSet::new([" ", ""]), "api.example.net").is_err());
    }

    fn verifier(pins: PinSet) -> PinnedVerifier {
        PinnedVerifier::new(pins, Arc::new(rustls::crypto::ring::default_provider())).unwrap()
    }

    #[test]
    fn test_certificate_outside_pin_set_rejected() {
        let cert = test_cert();
        let verifier = verifier(PinSet::new(["AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="]));

        let err = verifier.check_pins(&cert, &[]).unwrap_err();
        assert!(err.to_string().contains(PIN_FAILURE_MARKER), "{}", err);

        // the full handshake check never accepts it either
        let name = ServerName::try_from("api.example.net").unwrap();
        assert!(verifier
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn test_pinned_intermediate_accepted() {
        let leaf = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x00]);
        let verifier = verifier(PinSet::new([TEST_CERT_PIN]));
        assert!(verifier.check_pins(&leaf, &[test_cert()]).is_ok());
    }
}
