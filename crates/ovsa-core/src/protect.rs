//! The protect pipeline: encrypt model files under a fresh bundle key,
//! sign the bundle, and emit the issuer's master license.
//!
//! All key material lives in a slot table owned by the pipeline context,
//! so it is zeroized on every exit path, success or failure.

use std::path::{Path, PathBuf};

use uuid::Uuid;
use zeroize::Zeroizing;

use crate::bundle::{BundlePayload, Description, EncModelEntry, ModelName, VersionTag, MAX_FILE_NAME};
use crate::canonical::canonical_json_bytes;
use crate::certs::{CertUse, TrustAnchors};
use crate::crypto;
use crate::envelope::write_json_atomic;
use crate::error::{OvsaError, Result};
use crate::keystore::{self, WrappingKeyProvider};
use crate::license::MasterLicensePayload;
use crate::ocsp::OcspPolicy;
use crate::slots::SlotTable;
use base64::{engine::general_purpose, Engine as _};

pub struct ModelMetadata {
    pub name: ModelName,
    pub description: Description,
    pub version: VersionTag,
}

pub struct ProtectRequest<'a> {
    pub model_files: Vec<PathBuf>,
    pub metadata: ModelMetadata,
    pub license_guid: Uuid,
    pub keystore: &'a Path,
    pub protect_out: &'a Path,
    pub master_out: &'a Path,
}

#[derive(Debug)]
pub struct ProtectOutcome {
    pub model_guid: Uuid,
    pub model_hash: String,
    pub files: usize,
    pub plaintext_bytes: u64,
}

pub async fn protect(
    req: ProtectRequest<'_>,
    provider: &dyn WrappingKeyProvider,
    anchors: &TrustAnchors,
) -> Result<ProtectOutcome> {
    if req.model_files.is_empty() {
        return Err(OvsaError::InvalidParameter(
            "no model files to protect".into(),
        ));
    }
    for path in &req.model_files {
        if path.as_os_str().len() > MAX_FILE_NAME {
            return Err(OvsaError::InvalidParameter(format!(
                "input path exceeds {MAX_FILE_NAME} bytes"
            )));
        }
    }

    // Slot table owned here: every allocated slot clears when we return.
    let mut slots = SlotTable::new();

    // 1) Issuer identity: load the keystore, verify the signing certificate.
    let loaded = keystore::load_asymmetric_key(&mut slots, req.keystore, provider)?;
    crate::certs::verify_certificate(
        &loaded.primary_cert,
        CertUse::Own,
        true,
        anchors,
        &OcspPolicy::assume_good(),
    )
    .await?;

    // 2) Fresh 256-bit bundle key.
    let sym = crypto::generate_symmetric_key(&mut slots, 256)?;

    // 3) Encrypt each input in order; plaintext buffers zeroize on drop.
    let mut entries = Vec::with_capacity(req.model_files.len());
    let mut plaintext_bytes = 0u64;
    for path in &req.model_files {
        let data = Zeroizing::new(
            tokio::fs::read(path)
                .await
                .map_err(|e| OvsaError::file_io(path, e))?,
        );
        plaintext_bytes += data.len() as u64;
        let (iv, ciphertext) = crypto::encrypt_mem(&slots, sym, &data)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| OvsaError::InvalidParameter(format!("bad input path {}", path.display())))?;
        entries.push(EncModelEntry {
            file_name: file_name.to_string(),
            iv: general_purpose::STANDARD.encode(iv),
            ciphertext: general_purpose::STANDARD.encode(ciphertext),
        });
    }

    // 4) Bundle payload under a fresh model identity.
    let model_guid = crypto::generate_guid();
    let payload = BundlePayload {
        model_name: req.metadata.name,
        description: req.metadata.description,
        version: req.metadata.version,
        model_guid,
        isv_certificate: loaded.primary_cert.clone(),
        enc_model: entries,
    };
    let payload_value = serde_json::to_value(&payload)
        .map_err(|e| OvsaError::InvalidParameter(format!("bundle serialize: {e}")))?;

    // 5) The model hash covers the canonical payload, pre-signature.
    let model_hash = crypto::compute_model_hash(&canonical_json_bytes(&payload_value)?);

    // 6) Sign and write the protect file.
    let bundle = crypto::sign_blob(&slots, loaded.primary, payload_value)?;
    write_json_atomic(req.protect_out, &bundle, false)?;

    // 7) Master license: self-wrap the bundle key so `sale` can re-derive
    //    the KEK later, and seal the payload with the wrap's MAC key.
    let issuer_spki = slots.asymmetric(loaded.primary)?.keypair.public_key_der()?;
    let (encryption_key, mac_slot) = crypto::wrap_key(&mut slots, &issuer_spki, sym)?;
    let master = MasterLicensePayload {
        license_guid: req.license_guid,
        model_guid,
        model_hash: model_hash.clone(),
        isv_certificate: loaded.primary_cert,
        encryption_key,
        creation_date: chrono::Utc::now(),
    };
    let master_value = serde_json::to_value(&master)
        .map_err(|e| OvsaError::InvalidParameter(format!("master serialize: {e}")))?;
    let sealed = crypto::hmac_json_blob(&slots, mac_slot, master_value)?;
    write_json_atomic(req.master_out, &sealed, false)?;

    Ok(ProtectOutcome {
        model_guid,
        model_hash,
        files: payload.enc_model.len(),
        plaintext_bytes,
    })
}
