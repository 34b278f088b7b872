//! The `sale` pipeline: mint a customer license from a master license,
//! a TCB reference, a policy config and the customer's certificate.

use std::path::Path;

use uuid::Uuid;

use crate::certs::{self, CertUse, TrustAnchors};
use crate::crypto;
use crate::envelope::{read_json_capped, write_json_atomic, MacBlob, SignedBlob, MAX_LICENSE_FILE};
use crate::error::{OvsaError, Result};
use crate::keystore::{self, WrappingKeyProvider};
use crate::license::{
    CustomerCertificate, CustomerLicensePayload, LicenseConfig, MasterLicensePayload,
};
use crate::ocsp::OcspPolicy;
use crate::slots::SlotTable;
use crate::tcb;

pub struct SaleRequest<'a> {
    pub master: &'a Path,
    pub keystore: &'a Path,
    pub license_config: &'a Path,
    pub tcb: &'a Path,
    pub customer_cert: &'a Path,
    pub customer_secondary_cert: Option<&'a Path>,
    pub out: &'a Path,
}

#[derive(Debug)]
pub struct SaleOutcome {
    pub license_guid: Uuid,
    pub model_guid: Uuid,
    pub customer_fingerprint: String,
}

pub async fn sale(
    req: SaleRequest<'_>,
    provider: &dyn WrappingKeyProvider,
    anchors: &TrustAnchors,
    ocsp: &OcspPolicy,
) -> Result<SaleOutcome> {
    let mut slots = SlotTable::new();
    let loaded = keystore::load_asymmetric_key(&mut slots, req.keystore, provider)?;

    // 1) Master license: re-derive the wrap keys with the issuer's private
    //    key, check the HMAC, and recover the bundle key into a slot.
    let master: MacBlob = read_json_capped(req.master, MAX_LICENSE_FILE)?;
    let master_payload: MasterLicensePayload = master.payload_as()?;
    let (sym, mac_slot) = crypto::unwrap_key(&mut slots, loaded.primary, &master_payload.encryption_key)?;
    crypto::verify_hmac_blob(&slots, mac_slot, &master)?;
    let master_issuer = certs::spki_fingerprint_pem(&master_payload.isv_certificate)?;
    let our_identity = certs::spki_fingerprint_pem(&loaded.primary_cert)?;
    if !crate::security::constant_time_eq(master_issuer.as_bytes(), our_identity.as_bytes()) {
        return Err(OvsaError::Verification(
            "master license issuer does not match keystore identity".into(),
        ));
    }

    // 2) TCB reference, signed by the same issuer.
    let tcb_blob: SignedBlob = read_json_capped(req.tcb, MAX_LICENSE_FILE)?;
    tcb::verify_tcb_blob(&tcb_blob, &master_payload.isv_certificate)?;

    // 3) Customer identity: full peer verification including revocation.
    let customer_pem = std::fs::read_to_string(req.customer_cert)
        .map_err(|e| OvsaError::file_io(req.customer_cert, e))?;
    certs::verify_certificate(&customer_pem, CertUse::Peer, true, anchors, ocsp).await?;
    let primary_fingerprint = certs::spki_fingerprint_pem(&customer_pem)?;
    let secondary_fingerprint = match req.customer_secondary_cert {
        Some(path) => {
            let pem = std::fs::read_to_string(path).map_err(|e| OvsaError::file_io(path, e))?;
            certs::structural_check(&pem)?;
            certs::spki_fingerprint_pem(&pem)?
        }
        None => String::new(),
    };

    // 4) Policy and pinned service endpoint.
    let config: LicenseConfig = read_json_capped(req.license_config, MAX_LICENSE_FILE)?;
    config.validate()?;

    // 5) Re-wrap the bundle key to the customer's static public key.
    let customer_spki = certs::leaf_spki_der(&customer_pem)?;
    let (encryption_key, customer_mac) = crypto::wrap_key(&mut slots, &customer_spki, sym)?;
    slots.clear(customer_mac);

    // 6) Assemble, sign, write.
    let payload = CustomerLicensePayload {
        license_guid: master_payload.license_guid,
        model_guid: master_payload.model_guid,
        model_hash: master_payload.model_hash,
        isv_certificate: loaded.primary_cert.clone(),
        customer_certificate: CustomerCertificate {
            pem: customer_pem,
            primary_fingerprint: primary_fingerprint.clone(),
            secondary_fingerprint,
        },
        license_config: config.license_policy,
        license_server_url: config.license_server_url,
        license_server_cert: config.license_server_cert,
        tcb: tcb_blob,
        encryption_key,
        creation_date: chrono::Utc::now(),
    };
    let value = serde_json::to_value(&payload)
        .map_err(|e| OvsaError::InvalidParameter(format!("license serialize: {e}")))?;
    let signed = crypto::sign_blob(&slots, loaded.primary, value)?;
    write_json_atomic(req.out, &signed, false)?;

    Ok(SaleOutcome {
        license_guid: payload.license_guid,
        model_guid: payload.model_guid,
        customer_fingerprint: primary_fingerprint,
    })
}
