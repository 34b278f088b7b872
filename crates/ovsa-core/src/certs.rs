//! X.509 certificate handling: PEM parsing, validity and structural
//! checks, chain-of-trust walks against configured anchors, and SPKI
//! fingerprints used for identity matching and server-certificate pinning.

use x509_parser::prelude::*;

use crate::crypto::sha256_hex;
use crate::error::{OvsaError, Result};
use crate::ocsp::OcspPolicy;

const MAX_CHAIN_DEPTH: usize = 8;

/// How a certificate is being used, which decides how hard we look at it.
/// Peer certificates (a customer cert during `sale`, a client cert during
/// validation) additionally get EKU and OCSP revocation checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertUse {
    Own,
    Peer,
}

/// The set of trusted CA certificates, DER-encoded.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    ders: Vec<Vec<u8>>,
}

impl TrustAnchors {
    pub fn empty() -> Self {
        TrustAnchors { ders: Vec::new() }
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        Ok(TrustAnchors {
            ders: pem_to_ders(pem)?,
        })
    }

    pub fn from_pem_file(path: &std::path::Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path).map_err(|e| OvsaError::file_io(path, e))?;
        Self::from_pem(&pem)
    }

    pub fn add_pem(&mut self, pem: &str) -> Result<()> {
        self.ders.extend(pem_to_ders(pem)?);
        Ok(())
    }

    fn contains(&self, der: &[u8]) -> bool {
        self.ders.iter().any(|d| d == der)
    }

    pub fn is_empty(&self) -> bool {
        self.ders.is_empty()
    }
}

/// Extract all CERTIFICATE blocks from a PEM string as DER blobs,
/// leaf first.
pub fn pem_to_ders(pem: &str) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    for item in Pem::iter_from_buffer(pem.as_bytes()) {
        let block = item.map_err(|e| OvsaError::Verification(format!("PEM parse: {e}")))?;
        if block.label == "CERTIFICATE" {
            out.push(block.contents.clone());
        }
    }
    if out.is_empty() {
        return Err(OvsaError::Verification(
            "no CERTIFICATE block in PEM input".into(),
        ));
    }
    Ok(out)
}

fn parse_der(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| OvsaError::Verification(format!("X.509 parse: {e}")))?;
    Ok(cert)
}

/// Structural sanity check: the PEM parses and every embedded certificate
/// is a well-formed X.509 structure.
pub fn structural_check(pem: &str) -> Result<()> {
    for der in pem_to_ders(pem)? {
        parse_der(&der)?;
    }
    Ok(())
}

/// DER SubjectPublicKeyInfo of the first certificate in a PEM string.
pub fn leaf_spki_der(pem: &str) -> Result<Vec<u8>> {
    let ders = pem_to_ders(pem)?;
    let cert = parse_der(&ders[0])?;
    Ok(cert.public_key().raw.to_vec())
}

/// SHA-256 over the DER SubjectPublicKeyInfo, hex-encoded. This is the
/// identity used in license records and for server-certificate pinning.
pub fn spki_fingerprint_der(der: &[u8]) -> Result<String> {
    let cert = parse_der(der)?;
    Ok(sha256_hex(cert.public_key().raw))
}

pub fn spki_fingerprint_pem(pem: &str) -> Result<String> {
    let ders = pem_to_ders(pem)?;
    spki_fingerprint_der(&ders[0])
}

pub fn subject_string(pem: &str) -> Result<(String, String)> {
    let ders = pem_to_ders(pem)?;
    let cert = parse_der(&ders[0])?;
    Ok((cert.subject().to_string(), cert.issuer().to_string()))
}

/// Walk the chain from the leaf up to a configured anchor, verifying each
/// signature and (optionally) each validity window. Returns the validated
/// path, leaf first, ending at the anchor.
pub fn verify_certificate_chain(
    pem: &str,
    anchors: &TrustAnchors,
    lifetime_check: bool,
) -> Result<Vec<Vec<u8>>> {
    let presented = pem_to_ders(pem)?;
    let mut pool: Vec<Vec<u8>> = presented;
    for anchor in &anchors.ders {
        if !pool.iter().any(|d| d == anchor) {
            pool.push(anchor.clone());
        }
    }
    let parsed = pool
        .iter()
        .map(|d| parse_der(d))
        .collect::<Result<Vec<_>>>()?;

    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut idx = 0usize;
    for _ in 0..MAX_CHAIN_DEPTH {
        let cert = &parsed[idx];
        if lifetime_check && !cert.validity().is_valid() {
            return Err(OvsaError::Verification(
                "certificate outside validity window".into(),
            ));
        }
        path.push(pool[idx].clone());
        if anchors.contains(&pool[idx]) {
            return Ok(path);
        }
        if cert.subject().as_raw() == cert.issuer().as_raw() {
            cert.verify_signature(None)
                .map_err(|_| OvsaError::Verification("certificate self-signature invalid".into()))?;
            return Err(OvsaError::Verification(
                "certificate does not chain to a trusted CA".into(),
            ));
        }
        let issuer_idx = (0..parsed.len())
            .find(|&j| j != idx && parsed[j].subject().as_raw() == cert.issuer().as_raw())
            .ok_or_else(|| {
                OvsaError::Verification("issuer certificate not available".into())
            })?;
        cert.verify_signature(Some(parsed[issuer_idx].public_key()))
            .map_err(|_| OvsaError::Verification("certificate chain signature invalid".into()))?;
        idx = issuer_idx;
    }
    Err(OvsaError::Verification("certificate chain too deep".into()))
}

fn check_peer_eku(leaf_der: &[u8]) -> Result<()> {
    let cert = parse_der(leaf_der)?;
    if let Ok(Some(eku)) = cert.extended_key_usage() {
        let v = eku.value;
        if !(v.any || v.client_auth || v.server_auth) {
            return Err(OvsaError::Verification(
                "peer certificate extended key usage forbids authentication".into(),
            ));
        }
    }
    Ok(())
}

pub(crate) fn ocsp_responder_url(leaf_der: &[u8]) -> Result<Option<String>> {
    let cert = parse_der(leaf_der)?;
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in &aia.accessdescs {
                if desc.access_method.to_id_string() == "1.3.6.1.5.5.7.48.1" {
                    if let GeneralName::URI(uri) = &desc.access_location {
                        return Ok(Some(uri.to_string()));
                    }
                }
            }
        }
    }
    Ok(None)
}

pub(crate) fn raw_serial(leaf_der: &[u8]) -> Result<Vec<u8>> {
    Ok(parse_der(leaf_der)?.raw_serial().to_vec())
}

pub(crate) fn subject_raw(der: &[u8]) -> Result<Vec<u8>> {
    Ok(parse_der(der)?.subject().as_raw().to_vec())
}

pub(crate) fn spki_bitstring(der: &[u8]) -> Result<Vec<u8>> {
    let cert = parse_der(der)?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}

pub(crate) fn spki_der_of(der: &[u8]) -> Result<Vec<u8>> {
    Ok(parse_der(der)?.public_key().raw.to_vec())
}

/// Full certificate verification. Chain and lifetime for every use;
/// EKU and fail-closed OCSP revocation for peer certificates.
pub async fn verify_certificate(
    pem: &str,
    usage: CertUse,
    lifetime_check: bool,
    anchors: &TrustAnchors,
    ocsp: &OcspPolicy,
) -> Result<()> {
    let path = verify_certificate_chain(pem, anchors, lifetime_check)?;
    if usage == CertUse::Peer {
        check_peer_eku(&path[0])?;
        if path.len() >= 2 {
            crate::ocsp::check_revocation(&path[0], &path[1], ocsp).await?;
        }
        // A leaf that is itself a configured anchor is operator-pinned;
        // there is no issuer to ask about revocation.
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::test_support::self_signed_cert;

    #[test]
    fn self_signed_cert_parses_and_fingerprints() {
        let (pem, _key) = self_signed_cert("CN=unit-test");
        structural_check(&pem).unwrap();
        let fp = spki_fingerprint_pem(&pem).unwrap();
        assert_eq!(fp.len(), 64);
    }

    #[test]
    fn anchored_leaf_verifies() {
        let (pem, _key) = self_signed_cert("CN=anchored");
        let anchors = TrustAnchors::from_pem(&pem).unwrap();
        let path = verify_certificate_chain(&pem, &anchors, true).unwrap();
        assert_eq!(path.len(), 1);
    }

    #[test]
    fn unanchored_leaf_is_rejected() {
        let (pem, _key) = self_signed_cert("CN=floating");
        let (other, _key2) = self_signed_cert("CN=someone-else");
        let anchors = TrustAnchors::from_pem(&other).unwrap();
        let err = verify_certificate_chain(&pem, &anchors, true).unwrap_err();
        assert!(matches!(err, OvsaError::Verification(_)));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(pem_to_ders("not a pem").is_err());
        assert!(structural_check("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n").is_err());
    }
}
