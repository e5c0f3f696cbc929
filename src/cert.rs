//! TLS peer certificate validation policy
//!
//! [`CertificateValidationBus`] is the dispatch point a [`ByteLineStream`](
//! crate::stream::ByteLineStream) consults when activating TLS. It runs the
//! platform's root-chain validation to produce [`ValidationFindings`], then
//! hands every registered subscriber a mutable `accept` flag alongside those
//! findings. With no subscribers registered, the bus fails closed: no
//! certificate is ever accepted.

use crate::config::{ClientCertificate, TlsProtocol};
use crate::error::{FtpError, Result};
use std::sync::Arc;
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use tokio_rustls::rustls::version::{TLS12, TLS13};
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme,
    SupportedProtocolVersion,
};

/// What the platform's root-chain validation found for a presented
/// certificate, handed to subscribers alongside the `accept` flag they
/// may set.
#[derive(Debug, Clone)]
pub struct ValidationFindings {
    /// `None` if root-chain and host-name validation both succeeded;
    /// otherwise the platform verifier's rejection reason.
    pub chain_error: Option<String>,
}

type Subscriber = Arc<dyn Fn(&mut bool, &ValidationFindings) + Send + Sync>;

/// Multi-subscriber dispatch for TLS peer certificate validation.
#[derive(Default)]
pub struct CertificateValidationBus {
    subscribers: Vec<Subscriber>,
}

impl std::fmt::Debug for CertificateValidationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateValidationBus")
            .field("subscriber_count", &self.subscribers.len())
            .finish()
    }
}

impl CertificateValidationBus {
    /// No subscribers: every handshake fails closed.
    pub fn empty() -> Self {
        Self::default()
    }

    /// `allow_insecure = true` subscribes a handler that accepts any
    /// certificate regardless of chain findings; otherwise subscribes a
    /// handler that accepts only when the platform reported no chain error.
    pub fn new(allow_insecure: bool) -> Self {
        let mut bus = Self::empty();
        if allow_insecure {
            bus.subscribe(|accept, _findings| *accept = true);
        } else {
            bus.subscribe(|accept, findings| *accept = findings.chain_error.is_none());
        }
        bus
    }

    /// A bus that trusts any certificate presented for the given host, used
    /// by [`crate::clone::SessionCloner`] since the original session already
    /// accepted the peer's certificate.
    pub fn trusted_host() -> Self {
        Self::new(true)
    }

    /// Register a subscriber in the accept/reject decision for every
    /// subsequent handshake this bus authorizes.
    pub fn subscribe(
        &mut self,
        handler: impl Fn(&mut bool, &ValidationFindings) + Send + Sync + 'static,
    ) {
        self.subscribers.push(Arc::new(handler));
    }

    /// Run every subscriber over `findings`, starting from `accept = false`.
    fn dispatch(&self, findings: &ValidationFindings) -> bool {
        let mut accept = false;
        for subscriber in &self.subscribers {
            subscriber(&mut accept, findings);
        }
        accept
    }

    /// Build the rustls client configuration this bus authorizes,
    /// restricted to `protocols` (empty means the implementation's default
    /// set) and presenting `client_certs`'s first entry for mutual TLS, if
    /// any. A fresh platform verifier is built each call against the
    /// current `webpki-roots` trust anchors.
    pub fn client_config(
        &self,
        client_certs: &[ClientCertificate],
        protocols: &[TlsProtocol],
    ) -> Result<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let platform = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .expect("webpki-roots trust store is never empty");

        let versions: Vec<&'static SupportedProtocolVersion> = if protocols.is_empty() {
            tokio_rustls::rustls::DEFAULT_VERSIONS.to_vec()
        } else {
            protocols
                .iter()
                .map(|p| match p {
                    TlsProtocol::Tls12 => &TLS12,
                    TlsProtocol::Tls13 => &TLS13,
                })
                .collect()
        };

        let builder = ClientConfig::builder_with_protocol_versions(&versions)
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(BusVerifier {
                platform,
                subscribers: self.subscribers.clone(),
            }));

        match client_certs.first() {
            Some(cert) => {
                let chain = cert
                    .chain
                    .iter()
                    .cloned()
                    .map(CertificateDer::from)
                    .collect::<Vec<_>>();
                let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.private_key.clone()));
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| FtpError::InvalidConfiguration(format!("client certificate: {e}")))
            }
            None => Ok(builder.with_no_client_auth()),
        }
    }
}

/// Adapts a [`CertificateValidationBus`] into an actual rustls verifier:
/// runs the platform's chain validation to produce findings, then dispatches
/// those findings to the bus's subscribers for the final accept/reject call.
struct BusVerifier {
    platform: Arc<WebPkiServerVerifier>,
    subscribers: Vec<Subscriber>,
}

impl ServerCertVerifier for BusVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, Error> {
        let chain_error = self
            .platform
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            .err()
            .map(|e| e.to_string());
        let findings = ValidationFindings { chain_error };

        let mut accept = false;
        for subscriber in self.subscribers.iter() {
            subscriber(&mut accept, &findings);
        }

        if accept {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(Error::General(
                "certificate rejected: no subscriber accepted it".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, Error> {
        self.platform.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, Error> {
        self.platform.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.platform.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_findings(chain_error: Option<&str>) -> ValidationFindings {
        ValidationFindings {
            chain_error: chain_error.map(str::to_string),
        }
    }

    #[test]
    fn empty_bus_rejects_even_clean_findings() {
        let bus = CertificateValidationBus::empty();
        assert!(!bus.dispatch(&sample_findings(None)));
    }

    #[test]
    fn insecure_bus_accepts_regardless_of_chain_error() {
        let bus = CertificateValidationBus::new(true);
        assert!(bus.dispatch(&sample_findings(Some("self-signed"))));
        assert!(bus.dispatch(&sample_findings(None)));
    }

    #[test]
    fn secure_bus_accepts_only_clean_findings() {
        let bus = CertificateValidationBus::new(false);
        assert!(bus.dispatch(&sample_findings(None)));
        assert!(!bus.dispatch(&sample_findings(Some("UnknownIssuer"))));
    }

    #[test]
    fn trusted_host_bus_is_insecure() {
        let bus = CertificateValidationBus::trusted_host();
        assert!(bus.dispatch(&sample_findings(Some("self-signed"))));
    }

    #[test]
    fn insecure_bus_builds_without_panicking() {
        let bus = CertificateValidationBus::new(true);
        let _config = bus.client_config(&[], &[]).unwrap();
    }

    #[test]
    fn secure_bus_builds_without_panicking() {
        let bus = CertificateValidationBus::new(false);
        let _config = bus.client_config(&[], &[]).unwrap();
    }

    #[test]
    fn restricted_protocol_set_builds_without_panicking() {
        let bus = CertificateValidationBus::new(true);
        let _config = bus.client_config(&[], &[TlsProtocol::Tls13]).unwrap();
    }
}
