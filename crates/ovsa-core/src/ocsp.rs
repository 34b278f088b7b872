//! Fail-closed OCSP revocation checking for peer certificates.
//!
//! The request and response are the fixed-shape DER structures of RFC
//! 6960, built and walked with a small TLV codec; CertID hashes use
//! SHA-256. The responder is taken from the certificate's AIA extension
//! and queried over HTTP POST with a 3-second deadline and a single
//! retry. Any outcome other than a verified `good` fails the check.

use std::collections::HashMap;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::certs;
use crate::crypto::verify_bytes_with_spki;
use crate::error::{OvsaError, Result};

const OID_SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];
const OID_OCSP_BASIC: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x01];

pub const OCSP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    Good,
    Revoked,
    Unknown,
}

/// Revocation policy injected into certificate verification. `Required`
/// queries the responder named by the certificate; `Static` serves fixed
/// statuses keyed by serial (ingestion tooling and tests).
pub enum OcspPolicy {
    Required(OcspHttp),
    Static(HashMap<String, CertStatus>),
}

impl OcspPolicy {
    pub fn required() -> Result<Self> {
        Ok(OcspPolicy::Required(OcspHttp::new()?))
    }

    pub fn static_status(entries: impl IntoIterator<Item = (String, CertStatus)>) -> Self {
        OcspPolicy::Static(entries.into_iter().collect())
    }

    /// A static policy answering `good` for every serial.
    pub fn assume_good() -> Self {
        OcspPolicy::Static(HashMap::new())
    }
}

pub struct OcspHttp {
    client: reqwest::Client,
}

impl OcspHttp {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(OCSP_TIMEOUT)
            .build()
            .map_err(|e| OvsaError::Transient(format!("OCSP client setup: {e}")))?;
        Ok(OcspHttp { client })
    }

    async fn query(&self, url: &str, request: &[u8]) -> Result<Vec<u8>> {
        // One retry only; anything further is the caller's policy.
        let mut last_err = None;
        for _ in 0..2 {
            match self
                .client
                .post(url)
                .header("Content-Type", "application/ocsp-request")
                .body(request.to_vec())
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                    Ok(body) => return Ok(body.to_vec()),
                    Err(e) => last_err = Some(format!("{e}")),
                },
                Ok(resp) => last_err = Some(format!("HTTP {}", resp.status())),
                Err(e) => last_err = Some(format!("{e}")),
            }
        }
        Err(OvsaError::Transient(format!(
            "OCSP responder unreachable: {}",
            last_err.unwrap_or_default()
        )))
    }
}

/// Check the leaf against its issuer's OCSP responder. Fails closed:
/// missing responder, unreachable responder (after one retry), an
/// unverifiable response, or any status other than `good` is an error.
pub async fn check_revocation(
    leaf_der: &[u8],
    issuer_der: &[u8],
    policy: &OcspPolicy,
) -> Result<()> {
    let serial = certs::raw_serial(leaf_der)?;
    let status = match policy {
        OcspPolicy::Static(map) => map
            .get(&hex::encode(&serial))
            .copied()
            .unwrap_or(CertStatus::Good),
        OcspPolicy::Required(http) => {
            let url = certs::ocsp_responder_url(leaf_der)?.ok_or_else(|| {
                OvsaError::Verification("certificate names no OCSP responder".into())
            })?;
            let request = build_request(leaf_der, issuer_der)?;
            let response = http.query(&url, &request).await?;
            parse_and_verify_response(&response, &serial, issuer_der)?
        }
    };
    match status {
        CertStatus::Good => Ok(()),
        CertStatus::Revoked => Err(OvsaError::Verification("certificate is revoked".into())),
        CertStatus::Unknown => Err(OvsaError::Verification(
            "certificate OCSP status unknown".into(),
        )),
    }
}

// --- DER helpers -----------------------------------------------------------

fn der_len(n: usize) -> Vec<u8> {
    if n < 0x80 {
        vec![n as u8]
    } else if n <= 0xff {
        vec![0x81, n as u8]
    } else if n <= 0xffff {
        vec![0x82, (n >> 8) as u8, n as u8]
    } else {
        vec![
            0x83,
            (n >> 16) as u8,
            (n >> 8) as u8,
            n as u8,
        ]
    }
}

pub(crate) fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + content.len());
    out.push(tag);
    out.extend_from_slice(&der_len(content.len()));
    out.extend_from_slice(content);
    out
}

struct Tlv<'a> {
    tag: u8,
    content: &'a [u8],
    raw: &'a [u8],
}

fn read_tlv(input: &[u8]) -> Result<(Tlv<'_>, &[u8])> {
    let malformed = || OvsaError::Verification("malformed DER".into());
    if input.len() < 2 {
        return Err(malformed());
    }
    let tag = input[0];
    let (len, hdr) = match input[1] {
        n if n < 0x80 => (n as usize, 2),
        0x81 => {
            if input.len() < 3 {
                return Err(malformed());
            }
            (input[2] as usize, 3)
        }
        0x82 => {
            if input.len() < 4 {
                return Err(malformed());
            }
            (((input[2] as usize) << 8) | input[3] as usize, 4)
        }
        0x83 => {
            if input.len() < 5 {
                return Err(malformed());
            }
            (
                ((input[2] as usize) << 16) | ((input[3] as usize) << 8) | input[4] as usize,
                5,
            )
        }
        _ => return Err(malformed()),
    };
    if input.len() < hdr + len {
        return Err(malformed());
    }
    Ok((
        Tlv {
            tag,
            content: &input[hdr..hdr + len],
            raw: &input[..hdr + len],
        },
        &input[hdr + len..],
    ))
}

fn expect_tlv(input: &[u8], tag: u8) -> Result<(Tlv<'_>, &[u8])> {
    let (tlv, rest) = read_tlv(input)?;
    if tlv.tag != tag {
        return Err(OvsaError::Verification(format!(
            "unexpected DER tag 0x{:02x}",
            tlv.tag
        )));
    }
    Ok((tlv, rest))
}

/// Build an OCSPRequest with a single SHA-256 CertID.
pub(crate) fn build_request(leaf_der: &[u8], issuer_der: &[u8]) -> Result<Vec<u8>> {
    let name_hash = Sha256::digest(certs::subject_raw(issuer_der)?);
    let key_hash = Sha256::digest(certs::spki_bitstring(issuer_der)?);
    let serial = certs::raw_serial(leaf_der)?;

    let mut alg = der_tlv(0x06, OID_SHA256);
    alg.extend_from_slice(&[0x05, 0x00]);
    let alg = der_tlv(0x30, &alg);

    let mut cert_id = alg;
    cert_id.extend_from_slice(&der_tlv(0x04, &name_hash));
    cert_id.extend_from_slice(&der_tlv(0x04, &key_hash));
    cert_id.extend_from_slice(&der_tlv(0x02, &serial));
    let cert_id = der_tlv(0x30, &cert_id);

    let request = der_tlv(0x30, &cert_id);
    let request_list = der_tlv(0x30, &request);
    let tbs = der_tlv(0x30, &request_list);
    Ok(der_tlv(0x30, &tbs))
}

/// Walk an OCSPResponse, verify the BasicOCSPResponse signature against
/// the issuer key (or a delegated responder certificate issued by it),
/// and return the status recorded for `serial`.
pub(crate) fn parse_and_verify_response(
    response: &[u8],
    serial: &[u8],
    issuer_der: &[u8],
) -> Result<CertStatus> {
    let (outer, _) = expect_tlv(response, 0x30)?;
    let (status, rest) = expect_tlv(outer.content, 0x0a)?;
    if status.content != [0x00] {
        return Err(OvsaError::Verification(
            "OCSP responder returned an error status".into(),
        ));
    }
    let (response_bytes, _) = expect_tlv(rest, 0xa0)?;
    let (inner, _) = expect_tlv(response_bytes.content, 0x30)?;
    let (oid, after_oid) = expect_tlv(inner.content, 0x06)?;
    if oid.content != OID_OCSP_BASIC {
        return Err(OvsaError::Verification(
            "unsupported OCSP response type".into(),
        ));
    }
    let (octets, _) = expect_tlv(after_oid, 0x04)?;
    let (basic, _) = expect_tlv(octets.content, 0x30)?;

    let (tbs, after_tbs) = expect_tlv(basic.content, 0x30)?;
    let (_sig_alg, after_alg) = expect_tlv(after_tbs, 0x30)?;
    let (sig_bits, after_sig) = expect_tlv(after_alg, 0x03)?;
    if sig_bits.content.is_empty() {
        return Err(OvsaError::Verification("empty OCSP signature".into()));
    }
    let sig_der = &sig_bits.content[1..];

    let issuer_spki = certs::spki_der_of(issuer_der)?;
    let direct = verify_bytes_with_spki(&issuer_spki, tbs.raw, sig_der);
    if direct.is_err() {
        verify_delegated(after_sig, issuer_der, tbs.raw, sig_der)?;
    }

    // tbsResponseData: optional version, responderID, producedAt, responses
    let mut cursor = tbs.content;
    let (first, rest) = read_tlv(cursor)?;
    cursor = if first.tag == 0xa0 { rest } else { cursor };
    let (responder, rest) = read_tlv(cursor)?;
    if responder.tag != 0xa1 && responder.tag != 0xa2 {
        return Err(OvsaError::Verification("malformed OCSP responderID".into()));
    }
    let (_produced_at, rest) = expect_tlv(rest, 0x18)?;
    let (responses, _) = expect_tlv(rest, 0x30)?;

    let mut items = responses.content;
    while !items.is_empty() {
        let (single, rest) = expect_tlv(items, 0x30)?;
        items = rest;
        let (cert_id, after_id) = expect_tlv(single.content, 0x30)?;
        let (_alg, r) = expect_tlv(cert_id.content, 0x30)?;
        let (_name_hash, r) = expect_tlv(r, 0x04)?;
        let (_key_hash, r) = expect_tlv(r, 0x04)?;
        let (entry_serial, _) = expect_tlv(r, 0x02)?;
        if entry_serial.content != serial {
            continue;
        }
        let (status, _) = read_tlv(after_id)?;
        return match status.tag {
            0x80 => Ok(CertStatus::Good),
            0xa1 => Ok(CertStatus::Revoked),
            0x82 => Ok(CertStatus::Unknown),
            _ => Err(OvsaError::Verification(
                "malformed OCSP certificate status".into(),
            )),
        };
    }
    Err(OvsaError::Verification(
        "OCSP response does not cover the certificate".into(),
    ))
}

/// Responder signed with a delegated key: the certs field must carry a
/// certificate issued by the CA whose key then verifies the response.
fn verify_delegated(
    after_sig: &[u8],
    issuer_der: &[u8],
    tbs_raw: &[u8],
    sig_der: &[u8],
) -> Result<()> {
    let invalid = || OvsaError::Verification("OCSP response signature invalid".into());
    let (certs_field, _) = expect_tlv(after_sig, 0xa0).map_err(|_| invalid())?;
    let (cert_seq, _) = expect_tlv(certs_field.content, 0x30).map_err(|_| invalid())?;
    let (delegate, _) = expect_tlv(cert_seq.content, 0x30).map_err(|_| invalid())?;

    use x509_parser::prelude::*;
    let (_, delegate_cert) = X509Certificate::from_der(delegate.raw).map_err(|_| invalid())?;
    let (_, issuer_cert) = X509Certificate::from_der(issuer_der).map_err(|_| invalid())?;
    delegate_cert
        .verify_signature(Some(issuer_cert.public_key()))
        .map_err(|_| invalid())?;
    verify_bytes_with_spki(delegate_cert.public_key().raw, tbs_raw, sig_der).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sign_bytes, EcdsaAlgorithm, KeypairMaterial};
    use crate::keystore::test_support::self_signed_cert_with_key;

    const OID_ECDSA_SHA256: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02];

    fn single_response(serial: &[u8], status_tag: u8) -> Vec<u8> {
        let mut alg = der_tlv(0x06, OID_SHA256);
        alg.extend_from_slice(&[0x05, 0x00]);
        let alg = der_tlv(0x30, &alg);
        let mut cert_id = alg;
        cert_id.extend_from_slice(&der_tlv(0x04, &[0u8; 32]));
        cert_id.extend_from_slice(&der_tlv(0x04, &[0u8; 32]));
        cert_id.extend_from_slice(&der_tlv(0x02, serial));
        let cert_id = der_tlv(0x30, &cert_id);

        let mut single = cert_id;
        let status = if status_tag == 0xa1 {
            // revoked carries a revocationTime
            der_tlv(0xa1, &der_tlv(0x18, b"20250101000000Z"))
        } else {
            vec![status_tag, 0x00]
        };
        single.extend_from_slice(&status);
        single.extend_from_slice(&der_tlv(0x18, b"20260101000000Z"));
        der_tlv(0x30, &single)
    }

    fn build_response(serial: &[u8], status_tag: u8, signer: &KeypairMaterial) -> Vec<u8> {
        let responses = der_tlv(0x30, &single_response(serial, status_tag));
        let mut tbs = der_tlv(0xa1, &der_tlv(0x30, b"responder"));
        tbs.extend_from_slice(&der_tlv(0x18, b"20260101000000Z"));
        tbs.extend_from_slice(&responses);
        let tbs = der_tlv(0x30, &tbs);

        let sig = sign_bytes(signer, &tbs).unwrap();
        let mut sig_bits = vec![0x00];
        sig_bits.extend_from_slice(&sig);

        let mut basic = tbs;
        let mut sig_alg = der_tlv(0x06, OID_ECDSA_SHA256);
        sig_alg.extend_from_slice(&[0x05, 0x00]);
        basic.extend_from_slice(&der_tlv(0x30, &sig_alg));
        basic.extend_from_slice(&der_tlv(0x03, &sig_bits));
        let basic = der_tlv(0x30, &basic);

        let mut inner = der_tlv(0x06, OID_OCSP_BASIC);
        inner.extend_from_slice(&der_tlv(0x04, &basic));
        let mut outer = der_tlv(0x0a, &[0x00]);
        outer.extend_from_slice(&der_tlv(0xa0, &der_tlv(0x30, &inner)));
        der_tlv(0x30, &outer)
    }

    fn issuer_fixture() -> (Vec<u8>, KeypairMaterial) {
        let key = KeypairMaterial::generate(EcdsaAlgorithm::P256);
        let pem = self_signed_cert_with_key(&key, "CN=ocsp-ca");
        let der = crate::certs::pem_to_ders(&pem).unwrap().remove(0);
        (der, key)
    }

    #[test]
    fn good_status_verifies() {
        let (issuer_der, key) = issuer_fixture();
        let serial = [0x01, 0x02, 0x03];
        let resp = build_response(&serial, 0x80, &key);
        let status = parse_and_verify_response(&resp, &serial, &issuer_der).unwrap();
        assert_eq!(status, CertStatus::Good);
    }

    #[test]
    fn revoked_and_unknown_statuses_surface() {
        let (issuer_der, key) = issuer_fixture();
        let serial = [0x09];
        let revoked = build_response(&serial, 0xa1, &key);
        assert_eq!(
            parse_and_verify_response(&revoked, &serial, &issuer_der).unwrap(),
            CertStatus::Revoked
        );
        let unknown = build_response(&serial, 0x82, &key);
        assert_eq!(
            parse_and_verify_response(&unknown, &serial, &issuer_der).unwrap(),
            CertStatus::Unknown
        );
    }

    #[test]
    fn tampered_response_fails_signature() {
        let (issuer_der, key) = issuer_fixture();
        let serial = [0x05];
        let mut resp = build_response(&serial, 0x80, &key);
        // Flip a byte inside the response body.
        let mid = resp.len() / 2;
        resp[mid] ^= 0x40;
        assert!(parse_and_verify_response(&resp, &serial, &issuer_der).is_err());
    }

    #[test]
    fn response_signed_by_stranger_fails() {
        let (issuer_der, _key) = issuer_fixture();
        let stranger = KeypairMaterial::generate(EcdsaAlgorithm::P256);
        let serial = [0x07];
        let resp = build_response(&serial, 0x80, &stranger);
        assert!(parse_and_verify_response(&resp, &serial, &issuer_der).is_err());
    }

    #[test]
    fn uncovered_serial_fails_closed() {
        let (issuer_der, key) = issuer_fixture();
        let resp = build_response(&[0x11], 0x80, &key);
        assert!(parse_and_verify_response(&resp, &[0x22], &issuer_der).is_err());
    }

    #[tokio::test]
    async fn static_policy_answers_without_network() {
        let (issuer_der, key) = issuer_fixture();
        let _ = key;
        let leaf_pem = self_signed_cert_with_key(
            &KeypairMaterial::generate(EcdsaAlgorithm::P256),
            "CN=leaf",
        );
        let leaf_der = crate::certs::pem_to_ders(&leaf_pem).unwrap().remove(0);
        let serial = crate::certs::raw_serial(&leaf_der).unwrap();

        let policy = OcspPolicy::static_status([(hex::encode(&serial), CertStatus::Revoked)]);
        assert!(check_revocation(&leaf_der, &issuer_der, &policy)
            .await
            .is_err());
        let policy = OcspPolicy::assume_good();
        check_revocation(&leaf_der, &issuer_der, &policy)
            .await
            .unwrap();
    }
}
