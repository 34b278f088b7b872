//! Runtime client glue: verify bundle and license offline, run the
//! online validation protocol against the pinned license service, then
//! unwrap the bundle key and decrypt the model files in order.
//!
//! Every failure is fail-closed: no plaintext leaves this module unless
//! the full chain of checks has passed.

use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use zeroize::Zeroizing;

use ovsa_core::certs::{self, CertUse, TrustAnchors};
use ovsa_core::crypto;
use ovsa_core::envelope::{read_json_capped, SignedBlob, MAX_LICENSE_FILE};
use ovsa_core::error::{OvsaError, PolicyViolation, Result};
use ovsa_core::keystore::{self, WrappingKeyProvider};
use ovsa_core::license::CustomerLicensePayload;
use ovsa_core::ocsp::OcspPolicy;
use ovsa_core::slots::SlotTable;
use ovsa_core::tcb::QuoteEvidence;

use crate::proto::{
    self, authorization_binding, authorization_token, derive_token_key, token_matches,
    WireMessage, PROTOCOL_VERSION,
};
use crate::server::TLS_HANDSHAKE_DEADLINE;
use crate::tls;

/// Source of TPM quotes. The platform integration signs the service's
/// challenge together with the current PCR digest; this crate only
/// consumes the evidence.
pub trait QuoteProvider: Send + Sync {
    fn quote(&self, challenge: &[u8]) -> Result<QuoteEvidence>;
}

/// A decrypted model file; the plaintext zeroizes on drop.
#[derive(Debug)]
pub struct AcquiredFile {
    pub file_name: String,
    pub plaintext: Zeroizing<Vec<u8>>,
}

pub struct AcquireRequest<'a> {
    pub bundle: &'a Path,
    pub license: &'a Path,
    /// Customer keystore holding the key the license was wrapped to.
    pub keystore: &'a Path,
    pub anchors: &'a TrustAnchors,
}

/// Load, validate online, and decrypt a protected model.
pub async fn acquire_model(
    req: AcquireRequest<'_>,
    wrap_provider: &dyn WrappingKeyProvider,
    quotes: &dyn QuoteProvider,
) -> Result<Vec<AcquiredFile>> {
    let bundle: SignedBlob = read_json_capped(req.bundle, u64::MAX)?;
    let license: SignedBlob = read_json_capped(req.license, MAX_LICENSE_FILE)?;
    let payload: CustomerLicensePayload = license.payload_as()?;

    // Offline checks: issuer chain, both signatures, and the binding
    // between bundle and license.
    certs::verify_certificate(
        &payload.isv_certificate,
        CertUse::Own,
        true,
        req.anchors,
        &OcspPolicy::assume_good(),
    )
    .await?;
    crypto::verify_blob(&payload.isv_certificate, &license)?;

    let bundle_cert = bundle.payload["isv_certificate"]
        .as_str()
        .ok_or_else(|| OvsaError::Verification("bundle missing issuer certificate".into()))?
        .to_string();
    crypto::verify_blob(&bundle_cert, &bundle)?;
    if certs::spki_fingerprint_pem(&bundle_cert)?
        != certs::spki_fingerprint_pem(&payload.isv_certificate)?
    {
        return Err(OvsaError::Verification(
            "bundle and license were signed by different issuers".into(),
        ));
    }

    let bundle_hash = crypto::compute_model_hash(&bundle.canonical_payload()?);
    if bundle_hash != payload.model_hash {
        return Err(OvsaError::Verification(
            "bundle does not match licensed model hash".into(),
        ));
    }
    let bundle_guid = bundle.payload["model_guid"]
        .as_str()
        .ok_or_else(|| OvsaError::Verification("bundle missing model guid".into()))?;
    if bundle_guid != payload.model_guid.to_string() {
        return Err(OvsaError::Verification(
            "bundle model guid does not match license".into(),
        ));
    }

    // Customer identity for mTLS.
    let mut slots = SlotTable::new();
    let customer = keystore::load_asymmetric_key(&mut slots, req.keystore, wrap_provider)?;
    let client_key = slots
        .asymmetric(customer.primary)?
        .keypair
        .to_pkcs8_der()?
        .to_vec();

    // Pinned mTLS connection to the license service.
    let tls_config = tls::client_config(
        &payload.license_server_cert,
        &customer.primary_cert,
        client_key,
    )?;
    let (host, _port) = payload
        .license_server_url
        .rsplit_once(':')
        .ok_or_else(|| OvsaError::Verification("malformed license server URL".into()))?;
    let tcp = TcpStream::connect(&payload.license_server_url)
        .await
        .map_err(|e| OvsaError::Transient(format!("connect {}: {e}", payload.license_server_url)))?;
    let connector = TlsConnector::from(std::sync::Arc::new(tls_config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| OvsaError::Verification("bad license server host name".into()))?;
    let mut stream = tokio::time::timeout(TLS_HANDSHAKE_DEADLINE, connector.connect(server_name, tcp))
        .await
        .map_err(|_| OvsaError::Transient("TLS handshake deadline exceeded".into()))?
        .map_err(|e| OvsaError::Transient(format!("TLS handshake: {e}")))?;

    // Hello exchange: learn the attestation challenge.
    proto::write_frame(
        &mut stream,
        &WireMessage::Hello {
            version: PROTOCOL_VERSION,
            nonce: None,
        },
    )
    .await?;
    let hello = proto::read_frame(&mut stream).await?;
    let WireMessage::Hello { version, nonce: Some(challenge_b64) } = hello else {
        return Err(OvsaError::Verification("service did not issue a challenge".into()));
    };
    if version != PROTOCOL_VERSION {
        return Err(OvsaError::Verification(format!(
            "unsupported service protocol version {version}"
        )));
    }
    let challenge = proto::decode_b64("challenge", &challenge_b64)?;

    // Validation request with fresh client nonce and kex key.
    let evidence = quotes.quote(&challenge)?;
    let nonce_client = proto::fresh_nonce();
    let kex = p256::ecdh::EphemeralSecret::random(&mut rand::rngs::OsRng);
    let kex_pub = kex.public_key().to_encoded_point(false).as_bytes().to_vec();
    proto::write_frame(
        &mut stream,
        &WireMessage::Validate {
            license_guid: payload.license_guid,
            bundle_hash: bundle_hash.clone(),
            tcb_quote: evidence,
            nonce_client: general_purpose::STANDARD.encode(&nonce_client),
            kex_pubkey: general_purpose::STANDARD.encode(&kex_pub),
        },
    )
    .await?;

    let reply = proto::read_frame(&mut stream).await?;
    let (nonce_server, server_kex, authorization) = match reply {
        WireMessage::Authorize {
            nonce_server,
            kex_pubkey,
            authorization,
        } => (nonce_server, kex_pubkey, authorization),
        WireMessage::Error { tag, message } => return Err(error_from_wire(&tag, message)),
        _ => return Err(OvsaError::Verification("unexpected service reply".into())),
    };

    // Recompute the authorization token and require an exact match.
    let server_pub =
        p256::PublicKey::from_sec1_bytes(&proto::decode_b64("service kex key", &server_kex)?)
            .map_err(|_| OvsaError::Verification("malformed service kex key".into()))?;
    let shared = kex.diffie_hellman(&server_pub);
    let token_key = derive_token_key(shared.raw_secret_bytes().as_slice());
    let nonce_server_raw = proto::decode_b64("service nonce", &nonce_server)?;
    let binding = authorization_binding(
        &payload.license_guid,
        &nonce_client,
        &nonce_server_raw,
        &bundle_hash,
    );
    let expected = authorization_token(&token_key, &binding);
    if !token_matches(&expected, &authorization) {
        return Err(OvsaError::Verification(
            "authorization token mismatch".into(),
        ));
    }

    // Authorized: unwrap the bundle key and decrypt in order.
    let (sym, mac_slot) = crypto::unwrap_key(&mut slots, customer.primary, &payload.encryption_key)?;
    slots.clear(mac_slot);

    let entries = bundle.payload["enc_model"]
        .as_array()
        .ok_or_else(|| OvsaError::Verification("bundle missing file entries".into()))?;
    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        let file_name = entry["file_name"]
            .as_str()
            .ok_or_else(|| OvsaError::Verification("bundle entry missing file name".into()))?;
        let iv = proto::decode_b64("entry IV", entry["iv"].as_str().unwrap_or_default())?;
        let ciphertext =
            proto::decode_b64("entry ciphertext", entry["ciphertext"].as_str().unwrap_or_default())?;
        let plaintext = crypto::decrypt_mem(&slots, sym, &iv, &ciphertext)?;
        files.push(AcquiredFile {
            file_name: file_name.to_string(),
            plaintext,
        });
    }
    Ok(files)
}

fn error_from_wire(tag: &str, message: String) -> OvsaError {
    match tag {
        "OVSA_ERR_POLICY_EXPIRED" => OvsaError::Policy(PolicyViolation::Expired),
        "OVSA_ERR_POLICY_EXHAUSTED" => OvsaError::Policy(PolicyViolation::Exhausted),
        "OVSA_ERR_POLICY_REVOKED" => OvsaError::Policy(PolicyViolation::Revoked),
        "OVSA_ERR_POLICY_UNKNOWN" => OvsaError::Policy(PolicyViolation::Unknown),
        "OVSA_ERR_TRANSIENT" => OvsaError::Transient(message),
        _ => OvsaError::Verification(message),
    }
}
