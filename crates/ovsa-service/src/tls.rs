//! TLS configuration for both ends of the validation protocol.
//!
//! The server requires a client certificate at the handshake and defers
//! identity matching to the validation handler, which compares the
//! presented SPKI fingerprint against the license row. The client pins
//! the server certificate from the customer license by SPKI fingerprint
//! instead of walking a chain.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, Error as TlsError, ServerConfig,
    SignatureScheme,
};

use ovsa_core::certs;
use ovsa_core::error::{OvsaError, Result};

fn default_algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::ring::default_provider().signature_verification_algorithms
}

/// Accepts any structurally valid, in-validity client certificate at the
/// handshake. The handler matches it to the license row afterwards.
#[derive(Debug)]
pub struct PresentedClientCert {
    algorithms: WebPkiSupportedAlgorithms,
    subjects: Vec<DistinguishedName>,
}

impl PresentedClientCert {
    pub fn new() -> Self {
        PresentedClientCert {
            algorithms: default_algorithms(),
            subjects: Vec::new(),
        }
    }
}

impl Default for PresentedClientCert {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCertVerifier for PresentedClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.subjects
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, TlsError> {
        use x509_parser::prelude::*;
        let (_, cert) = X509Certificate::from_der(end_entity.as_ref())
            .map_err(|_| TlsError::General("unparseable client certificate".into()))?;
        if !cert.validity().is_valid() {
            return Err(TlsError::General(
                "client certificate outside validity window".into(),
            ));
        }
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// SPKI-pinned server verification: the presented leaf must carry exactly
/// the public key pinned in the customer license.
#[derive(Debug)]
pub struct SpkiPinnedServerVerifier {
    pin: String,
    algorithms: WebPkiSupportedAlgorithms,
}

impl SpkiPinnedServerVerifier {
    pub fn new(pin_fingerprint: String) -> Self {
        SpkiPinnedServerVerifier {
            pin: pin_fingerprint,
            algorithms: default_algorithms(),
        }
    }
}

impl ServerCertVerifier for SpkiPinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        let fingerprint = certs::spki_fingerprint_der(end_entity.as_ref())
            .map_err(|_| TlsError::General("unparseable server certificate".into()))?;
        if fingerprint != self.pin {
            return Err(TlsError::General("server certificate pin mismatch".into()));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

pub fn server_config(cert_chain_pem: &str, key_pkcs8_der: Vec<u8>) -> Result<ServerConfig> {
    let chain: Vec<CertificateDer<'static>> = certs::pem_to_ders(cert_chain_pem)?
        .into_iter()
        .map(CertificateDer::from)
        .collect();
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pkcs8_der));
    ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(PresentedClientCert::new()))
        .with_single_cert(chain, key)
        .map_err(|e| OvsaError::Crypto(format!("TLS server config: {e}")))
}

pub fn client_config(
    pinned_server_cert_pem: &str,
    client_chain_pem: &str,
    client_key_pkcs8: Vec<u8>,
) -> Result<ClientConfig> {
    let pin = certs::spki_fingerprint_pem(pinned_server_cert_pem)?;
    let chain: Vec<CertificateDer<'static>> = certs::pem_to_ders(client_chain_pem)?
        .into_iter()
        .map(CertificateDer::from)
        .collect();
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(client_key_pkcs8));
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SpkiPinnedServerVerifier::new(pin)))
        .with_client_auth_cert(chain, key)
        .map_err(|e| OvsaError::Crypto(format!("TLS client config: {e}")))
}
