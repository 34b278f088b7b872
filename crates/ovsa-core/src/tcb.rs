//! TCB reference measurements and quote-evidence verification.
//!
//! A TCB signature is an issuer-signed description of an acceptable
//! runtime measurement: a PCR bank, a selection of registers, and the
//! digest over their values. At validation time the service checks a
//! TPM quote (produced out-of-band) against the bound reference: the
//! quote message must carry the service's challenge and the expected PCR
//! digest, and its signature must verify under an attestation key that
//! matches the provisioned anchor.

use serde::{Deserialize, Serialize};

use crate::crypto::{sha256_hex, verify_bytes_with_spki};
use crate::envelope::SignedBlob;
use crate::error::{OvsaError, Result};
use crate::slots::{SlotId, SlotTable};

const QUOTE_PREFIX: &[u8] = b"OVSA-QUOTE\x01";

/// Signed payload of a TCB signature file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcbPayload {
    pub tcb_name: String,
    pub tcb_version: String,
    pub pcr_bank_algorithm: String,
    pub pcr_selection: Vec<u32>,
    pub pcr_digest: String,
}

impl TcbPayload {
    pub fn validate(&self) -> Result<()> {
        if self.tcb_name.is_empty() {
            return Err(OvsaError::InvalidParameter("empty TCB name".into()));
        }
        if self.pcr_bank_algorithm != "sha256" && self.pcr_bank_algorithm != "sha384" {
            return Err(OvsaError::InvalidParameter(format!(
                "unsupported PCR bank algorithm `{}`",
                self.pcr_bank_algorithm
            )));
        }
        if self.pcr_selection.is_empty() || self.pcr_selection.iter().any(|p| *p > 23) {
            return Err(OvsaError::InvalidParameter("bad PCR selection".into()));
        }
        let digest = hex::decode(&self.pcr_digest)
            .map_err(|_| OvsaError::InvalidParameter("malformed PCR digest".into()))?;
        let expected = if self.pcr_bank_algorithm == "sha256" { 32 } else { 48 };
        if digest.len() != expected {
            return Err(OvsaError::InvalidParameter("bad PCR digest length".into()));
        }
        Ok(())
    }
}

/// Sign a TCB payload with the issuer's primary slot.
pub fn sign_tcb(slots: &SlotTable, slot: SlotId, payload: &TcbPayload) -> Result<SignedBlob> {
    payload.validate()?;
    let value = serde_json::to_value(payload)
        .map_err(|e| OvsaError::InvalidParameter(format!("TCB serialize: {e}")))?;
    crate::crypto::sign_blob(slots, slot, value)
}

/// Verify a TCB blob against the issuer certificate and return its payload.
pub fn verify_tcb_blob(blob: &SignedBlob, issuer_cert_pem: &str) -> Result<TcbPayload> {
    crate::crypto::verify_blob(issuer_cert_pem, blob)?;
    let payload: TcbPayload = blob.payload_as()?;
    payload.validate()?;
    Ok(payload)
}

/// Attestation evidence presented by a runtime: the AK public key, the
/// quote message, and the AK's ECDSA signature over it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteEvidence {
    pub ak_public: String,
    pub message: String,
    pub signature: String,
}

/// Deterministic quote message: length-prefixed challenge and PCR digest
/// under a versioned prefix.
pub fn quote_message(challenge: &[u8], pcr_digest: &[u8]) -> Vec<u8> {
    let items: [&[u8]; 2] = [challenge, pcr_digest];
    let mut out =
        Vec::with_capacity(QUOTE_PREFIX.len() + items.iter().map(|i| 8 + i.len()).sum::<usize>());
    out.extend_from_slice(QUOTE_PREFIX);
    for item in items {
        out.extend_from_slice(&(item.len() as u64).to_be_bytes());
        out.extend_from_slice(item);
    }
    out
}

fn public_key_pem_to_spki(pem: &str) -> Result<Vec<u8>> {
    for item in x509_parser::pem::Pem::iter_from_buffer(pem.as_bytes()) {
        let block = item.map_err(|e| OvsaError::Verification(format!("PEM parse: {e}")))?;
        if block.label == "PUBLIC KEY" {
            return Ok(block.contents.clone());
        }
    }
    Err(OvsaError::Verification("no PUBLIC KEY block in PEM".into()))
}

/// Check quote evidence against the bound TCB reference.
///
/// The quote must embed exactly the challenge issued for this validation
/// and the reference PCR digest, and its signature must verify under the
/// presented AK. When an anchor fingerprint is provisioned, the AK must
/// match it; evidence from any other key is rejected regardless of
/// signature validity.
pub fn verify_quote(
    evidence: &QuoteEvidence,
    tcb: &TcbPayload,
    challenge: &[u8],
    ak_anchor_fingerprint: Option<&str>,
) -> Result<()> {
    use base64::{engine::general_purpose, Engine as _};

    let spki = public_key_pem_to_spki(&evidence.ak_public)?;
    if let Some(anchor) = ak_anchor_fingerprint {
        if sha256_hex(&spki) != anchor {
            return Err(OvsaError::Verification(
                "attestation key does not match provisioned anchor".into(),
            ));
        }
    }

    let digest = hex::decode(&tcb.pcr_digest)
        .map_err(|_| OvsaError::Verification("malformed reference PCR digest".into()))?;
    let message = general_purpose::STANDARD
        .decode(&evidence.message)
        .map_err(|_| OvsaError::Verification("malformed quote message".into()))?;
    if message != quote_message(challenge, &digest) {
        return Err(OvsaError::Verification(
            "TCB measurement does not match reference".into(),
        ));
    }
    let signature = general_purpose::STANDARD
        .decode(&evidence.signature)
        .map_err(|_| OvsaError::Verification("malformed quote signature".into()))?;
    verify_bytes_with_spki(&spki, &message, &signature)
}

#[cfg(any(test, feature = "test-fixtures"))]
pub mod evidence_fixtures {
    //! Software-signed evidence for integration testing. Real deployments
    //! obtain quotes from the platform TPM, outside this crate.

    use super::*;
    use crate::crypto::{sign_bytes, KeypairMaterial};
    use base64::{engine::general_purpose, Engine as _};

    pub fn software_quote(
        ak: &KeypairMaterial,
        challenge: &[u8],
        pcr_digest_hex: &str,
    ) -> QuoteEvidence {
        let digest = hex::decode(pcr_digest_hex).expect("pcr digest hex");
        let message = quote_message(challenge, &digest);
        let signature = sign_bytes(ak, &message).expect("quote signature");
        let spki = ak.public_key_der().expect("ak spki");
        let ak_public = pem_encode_spki(&spki);
        QuoteEvidence {
            ak_public,
            message: general_purpose::STANDARD.encode(message),
            signature: general_purpose::STANDARD.encode(signature),
        }
    }

    pub fn pem_encode_spki(spki: &[u8]) -> String {
        let b64 = general_purpose::STANDARD.encode(spki);
        let mut out = String::from("-----BEGIN PUBLIC KEY-----\n");
        for chunk in b64.as_bytes().chunks(64) {
            out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
            out.push('\n');
        }
        out.push_str("-----END PUBLIC KEY-----\n");
        out
    }

    pub fn ak_fingerprint(ak: &KeypairMaterial) -> String {
        sha256_hex(&ak.public_key_der().expect("ak spki"))
    }
}

#[cfg(test)]
mod tests {
    use super::evidence_fixtures::*;
    use super::*;
    use crate::crypto::{EcdsaAlgorithm, KeypairMaterial};

    fn reference() -> TcbPayload {
        TcbPayload {
            tcb_name: "prod-runtime".into(),
            tcb_version: "1.2".into(),
            pcr_bank_algorithm: "sha256".into(),
            pcr_selection: vec![0, 1, 2, 3, 7],
            pcr_digest: hex::encode([0xabu8; 32]),
        }
    }

    #[test]
    fn payload_validation() {
        assert!(reference().validate().is_ok());
        let mut bad = reference();
        bad.pcr_bank_algorithm = "md5".into();
        assert!(bad.validate().is_err());
        let mut bad = reference();
        bad.pcr_selection = vec![24];
        assert!(bad.validate().is_err());
        let mut bad = reference();
        bad.pcr_digest = "abcd".into();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn sign_and_verify_tcb_blob() {
        let (cert, key) = crate::keystore::test_support::self_signed_cert("CN=issuer");
        let mut slots = SlotTable::new();
        let slot = slots.insert_asymmetric(key, cert.clone()).unwrap();
        let blob = sign_tcb(&slots, slot, &reference()).unwrap();
        let payload = verify_tcb_blob(&blob, &cert).unwrap();
        assert_eq!(payload.tcb_name, "prod-runtime");

        let mut tampered = blob.clone();
        tampered.payload["tcb_version"] = serde_json::json!("9.9");
        assert!(verify_tcb_blob(&tampered, &cert).is_err());
    }

    #[test]
    fn quote_roundtrip_and_mismatches() {
        let ak = KeypairMaterial::generate(EcdsaAlgorithm::P256);
        let tcb = reference();
        let challenge = [7u8; 32];
        let evidence = software_quote(&ak, &challenge, &tcb.pcr_digest);

        verify_quote(&evidence, &tcb, &challenge, Some(&ak_fingerprint(&ak))).unwrap();
        verify_quote(&evidence, &tcb, &challenge, None).unwrap();

        // Wrong challenge (replay) is rejected.
        assert!(verify_quote(&evidence, &tcb, &[8u8; 32], None).is_err());

        // Wrong PCR digest is rejected.
        let mut other = reference();
        other.pcr_digest = hex::encode([0xcdu8; 32]);
        assert!(verify_quote(&evidence, &other, &challenge, None).is_err());

        // Evidence from a non-anchored AK is rejected.
        let rogue = KeypairMaterial::generate(EcdsaAlgorithm::P256);
        let rogue_evidence = software_quote(&rogue, &challenge, &tcb.pcr_digest);
        assert!(verify_quote(
            &rogue_evidence,
            &tcb,
            &challenge,
            Some(&ak_fingerprint(&ak))
        )
        .is_err());
    }
}
