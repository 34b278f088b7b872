//! Persistent keystore holding the primary and secondary asymmetric
//! keypairs and their certificates.
//!
//! A store named `ks` lives in two files, `primary_ks` and `secondary_ks`.
//! Each is a versioned JSON record: the PKCS#8 private key encrypted under
//! an at-rest wrapping key, the attached certificate (self-signed at
//! creation, replaced by `-storecert`), and an HMAC integrity tag over the
//! whole record. The wrapping key itself is hardware-bound in deployment
//! and reaches this module only through [`WrappingKeyProvider`]; the
//! software provider derives it with Argon2id from a passphrase.

use aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose, Engine as _};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};

use crate::certs;
use crate::crypto::{EcdsaAlgorithm, KeypairMaterial};
use crate::envelope::write_json_atomic;
use crate::error::{OvsaError, Result};
use crate::slots::{SlotId, SlotTable};

pub const KEYSTORE_VERSION: u32 = 1;
pub const PASSPHRASE_ENV: &str = "OVSA_KEYSTORE_PASSPHRASE";

const RECORD_CAP: u64 = 1024 * 1024;
const MAC_HKDF_SALT: &[u8] = b"ovsa/keystore/mac/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    Primary,
    Secondary,
}

impl StoreRole {
    fn prefix(&self) -> &'static str {
        match self {
            StoreRole::Primary => "primary_",
            StoreRole::Secondary => "secondary_",
        }
    }
}

/// On-disk record for one keypair entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreRecord {
    pub version: u32,
    pub algorithm: EcdsaAlgorithm,
    pub salt: String,
    pub iv: String,
    pub private_key: String,
    pub certificate: String,
    pub subject: String,
    pub issuer: String,
    pub mac: String,
}

/// Source of the at-rest wrapping key.
pub trait WrappingKeyProvider {
    fn wrapping_key(&self, salt: &[u8]) -> Result<Secret<[u8; 32]>>;
}

/// Software provider: Argon2id over a passphrase and the per-record salt.
pub struct PassphraseProvider {
    passphrase: Secret<String>,
}

impl PassphraseProvider {
    pub fn new(passphrase: impl Into<String>) -> Self {
        PassphraseProvider {
            passphrase: Secret::new(passphrase.into()),
        }
    }

    pub fn from_env() -> Result<Self> {
        let pass = std::env::var(PASSPHRASE_ENV).map_err(|_| {
            OvsaError::InvalidParameter(format!("{PASSPHRASE_ENV} is not set"))
        })?;
        Ok(Self::new(pass))
    }
}

impl WrappingKeyProvider for PassphraseProvider {
    fn wrapping_key(&self, salt: &[u8]) -> Result<Secret<[u8; 32]>> {
        let mut out = [0u8; 32];
        let params = Params::new(19456, 2, 1, Some(32))
            .map_err(|e| OvsaError::Crypto(format!("argon2 params: {e}")))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        argon
            .hash_password_into(self.passphrase.expose_secret().as_bytes(), salt, &mut out)
            .map_err(|e| OvsaError::Crypto(format!("argon2 derive: {e}")))?;
        Ok(Secret::new(out))
    }
}

/// Slots for a loaded store. Primary is the signing identity; the
/// secondary is loaded alongside it to uphold the dual-key invariant.
#[derive(Debug)]
pub struct LoadedKeystore {
    pub primary: SlotId,
    pub secondary: SlotId,
    pub primary_cert: String,
    pub secondary_cert: String,
}

pub fn entry_path(store: &Path, role: StoreRole) -> Result<PathBuf> {
    let name = store
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| OvsaError::InvalidParameter("keystore path has no file name".into()))?;
    let prefixed = format!("{}{}", role.prefix(), name);
    Ok(match store.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(prefixed),
        _ => PathBuf::from(prefixed),
    })
}

/// Parse a `/C=IN/ST=KA/O=Org/CN=host` style subject into a DN.
pub fn parse_subject(subject: &str) -> Result<DistinguishedName> {
    let mut dn = DistinguishedName::new();
    let mut seen = 0;
    for rdn in subject.split('/').filter(|s| !s.is_empty()) {
        let (key, value) = rdn.split_once('=').ok_or_else(|| {
            OvsaError::InvalidParameter(format!("malformed subject component `{rdn}`"))
        })?;
        let ty = match key {
            "C" => DnType::CountryName,
            "ST" => DnType::StateOrProvinceName,
            "L" => DnType::LocalityName,
            "O" => DnType::OrganizationName,
            "OU" => DnType::OrganizationalUnitName,
            "CN" => DnType::CommonName,
            other => {
                return Err(OvsaError::InvalidParameter(format!(
                    "unsupported subject attribute `{other}`"
                )))
            }
        };
        dn.push(ty, value);
        seen += 1;
    }
    if seen == 0 {
        return Err(OvsaError::InvalidParameter("empty subject".into()));
    }
    Ok(dn)
}

fn rcgen_signature_alg(alg: EcdsaAlgorithm) -> &'static rcgen::SignatureAlgorithm {
    match alg {
        EcdsaAlgorithm::P256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        EcdsaAlgorithm::P384 => &rcgen::PKCS_ECDSA_P384_SHA384,
    }
}

fn certificate_for(keypair: &KeypairMaterial, subject: &str) -> Result<Certificate> {
    let der = keypair.to_pkcs8_der()?;
    let pair = KeyPair::from_der(&der)
        .map_err(|e| OvsaError::Crypto(format!("keypair import: {e}")))?;
    let mut params = CertificateParams::default();
    params.distinguished_name = parse_subject(subject)?;
    params.alg = rcgen_signature_alg(keypair.algorithm());
    params.key_pair = Some(pair);
    params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    params.not_after = rcgen::date_time_ymd(2044, 1, 1);
    Certificate::from_params(params)
        .map_err(|e| OvsaError::Crypto(format!("certificate build: {e}")))
}

fn record_mac_key(wrap: &Secret<[u8; 32]>) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(MAC_HKDF_SALT), wrap.expose_secret());
    let mut key = [0u8; 32];
    hk.expand(b"integrity", &mut key).expect("HKDF expand");
    key
}

fn record_mac_input(record: &KeystoreRecord) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(record)
        .map_err(|e| OvsaError::InvalidParameter(format!("record serialize: {e}")))?;
    value
        .as_object_mut()
        .expect("record is an object")
        .remove("mac");
    crate::canonical::canonical_json_bytes(&value)
}

fn seal_record(
    keypair: &KeypairMaterial,
    certificate: &str,
    provider: &dyn WrappingKeyProvider,
) -> Result<KeystoreRecord> {
    let mut salt = [0u8; 16];
    getrandom::getrandom(&mut salt)
        .map_err(|_| OvsaError::Crypto("random salt generation failed".into()))?;
    let wrap = provider.wrapping_key(&salt)?;

    let pkcs8 = keypair.to_pkcs8_der()?;
    let mut iv = [0u8; 12];
    getrandom::getrandom(&mut iv)
        .map_err(|_| OvsaError::Crypto("random IV generation failed".into()))?;
    let cipher = Aes256Gcm::new_from_slice(wrap.expose_secret())
        .map_err(|_| OvsaError::Crypto("AES key setup failed".into()))?;
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), pkcs8.as_slice())
        .map_err(|_| OvsaError::Crypto("private key sealing failed".into()))?;

    let (subject, issuer) = certs::subject_string(certificate)?;
    let mut record = KeystoreRecord {
        version: KEYSTORE_VERSION,
        algorithm: keypair.algorithm(),
        salt: general_purpose::STANDARD.encode(salt),
        iv: general_purpose::STANDARD.encode(iv),
        private_key: general_purpose::STANDARD.encode(sealed),
        certificate: certificate.to_string(),
        subject,
        issuer,
        mac: String::new(),
    };
    let mac_key = record_mac_key(&wrap);
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&mac_key)
        .map_err(|_| OvsaError::Crypto("HMAC key setup failed".into()))?;
    mac.update(&record_mac_input(&record)?);
    record.mac = hex::encode(mac.finalize().into_bytes());
    Ok(record)
}

/// Validate the record's MAC and decrypt the private key. The record IV
/// and integrity key pass through an iv+hmac slot so their lifetime is
/// table-scoped like every other piece of key material.
fn open_record(
    slots: &mut SlotTable,
    record: &KeystoreRecord,
    provider: &dyn WrappingKeyProvider,
) -> Result<KeypairMaterial> {
    if record.version != KEYSTORE_VERSION {
        return Err(OvsaError::InvalidParameter(format!(
            "unsupported keystore version {}",
            record.version
        )));
    }
    let salt = general_purpose::STANDARD
        .decode(&record.salt)
        .map_err(|_| OvsaError::Verification("malformed keystore salt".into()))?;
    let iv = general_purpose::STANDARD
        .decode(&record.iv)
        .map_err(|_| OvsaError::Verification("malformed keystore IV".into()))?;
    if iv.len() != 12 {
        return Err(OvsaError::Verification("malformed keystore IV".into()));
    }
    let wrap = provider.wrapping_key(&salt)?;

    let mut iv_arr = [0u8; 12];
    iv_arr.copy_from_slice(&iv);
    let integrity = slots.insert_iv_hmac(iv_arr, record_mac_key(&wrap))?;
    let outcome = (|| {
        let (iv, mac_key) = slots.iv_hmac(integrity)?;
        let tag = hex::decode(&record.mac)
            .map_err(|_| OvsaError::Verification("malformed keystore MAC".into()))?;
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(mac_key.expose_secret())
            .map_err(|_| OvsaError::Crypto("HMAC key setup failed".into()))?;
        mac.update(&record_mac_input(record)?);
        mac.verify_slice(&tag)
            .map_err(|_| OvsaError::Verification("keystore integrity check failed".into()))?;

        let sealed = general_purpose::STANDARD
            .decode(&record.private_key)
            .map_err(|_| OvsaError::Verification("malformed keystore key blob".into()))?;
        let cipher = Aes256Gcm::new_from_slice(wrap.expose_secret())
            .map_err(|_| OvsaError::Crypto("AES key setup failed".into()))?;
        let pkcs8 = zeroize::Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(iv), sealed.as_slice())
                .map_err(|_| OvsaError::Verification("keystore key unsealing failed".into()))?,
        );
        certs::structural_check(&record.certificate)?;
        KeypairMaterial::from_pkcs8_der(record.algorithm, &pkcs8)
    })();
    slots.clear(integrity);
    outcome
}

fn read_record(path: &Path) -> Result<KeystoreRecord> {
    crate::envelope::read_json_capped(path, RECORD_CAP)
}

/// `keygen -storekey`: create disjoint primary and secondary keypairs,
/// write both store records plus a CSR and self-signed certificate for
/// each. `csr_base` defaults to `<store name>.csr`.
pub fn create_store(
    store: &Path,
    algorithm: EcdsaAlgorithm,
    subject: &str,
    csr_base: Option<&str>,
    provider: &dyn WrappingKeyProvider,
) -> Result<()> {
    let primary = KeypairMaterial::generate(algorithm);
    let secondary = KeypairMaterial::generate(algorithm);
    if primary.public_key_der()? == secondary.public_key_der()? {
        return Err(OvsaError::Crypto("duplicate keypair generated".into()));
    }

    let store_name = store
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| OvsaError::InvalidParameter("keystore path has no file name".into()))?;
    let csr_name = csr_base
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{store_name}.csr"));

    for (role, keypair) in [(StoreRole::Primary, &primary), (StoreRole::Secondary, &secondary)] {
        let cert = certificate_for(keypair, subject)?;
        let cert_pem = cert
            .serialize_pem()
            .map_err(|e| OvsaError::Crypto(format!("certificate serialization: {e}")))?;
        let csr_pem = cert
            .serialize_request_pem()
            .map_err(|e| OvsaError::Crypto(format!("CSR serialization: {e}")))?;

        let record = seal_record(keypair, &cert_pem, provider)?;
        let record_path = entry_path(store, role)?;
        write_json_atomic(&record_path, &record, true)?;

        let csr_path = record_path
            .parent()
            .map(|d| d.join(format!("{}{}", role.prefix(), csr_name)))
            .unwrap_or_else(|| PathBuf::from(format!("{}{}", role.prefix(), csr_name)));
        std::fs::write(&csr_path, &csr_pem).map_err(|e| OvsaError::file_io(&csr_path, e))?;
        let crt_path = csr_path.with_file_name(format!(
            "{}.crt",
            csr_path.file_name().and_then(|n| n.to_str()).unwrap_or("key.csr")
        ));
        std::fs::write(&crt_path, &cert_pem).map_err(|e| OvsaError::file_io(&crt_path, e))?;
    }
    Ok(())
}

/// `keygen -storecert`: replace the stored certificate after checking the
/// new certificate's SubjectPublicKeyInfo matches the stored private key.
pub fn attach_certificate(
    store: &Path,
    role: StoreRole,
    cert_pem: &str,
    provider: &dyn WrappingKeyProvider,
) -> Result<()> {
    let path = entry_path(store, role)?;
    let record = read_record(&path)?;
    let mut slots = SlotTable::new();
    let keypair = open_record(&mut slots, &record, provider)?;

    let new_spki = certs::leaf_spki_der(cert_pem)?;
    if new_spki != keypair.public_key_der()? {
        return Err(OvsaError::Verification(
            "certificate public key does not match stored private key".into(),
        ));
    }
    certs::structural_check(cert_pem)?;
    let resealed = seal_record(&keypair, cert_pem, provider)?;
    write_json_atomic(&path, &resealed, true)
}

/// Load a store into key slots. Fails if the secondary entry is missing,
/// if either record's MAC or version check fails, or if either embedded
/// certificate is structurally invalid.
pub fn load_asymmetric_key(
    slots: &mut SlotTable,
    store: &Path,
    provider: &dyn WrappingKeyProvider,
) -> Result<LoadedKeystore> {
    let primary_path = entry_path(store, StoreRole::Primary)?;
    let secondary_path = entry_path(store, StoreRole::Secondary)?;
    if !secondary_path.exists() {
        return Err(OvsaError::InvalidParameter(format!(
            "keystore secondary entry missing: {}",
            secondary_path.display()
        )));
    }

    let primary_record = read_record(&primary_path)?;
    let secondary_record = read_record(&secondary_path)?;
    let primary_key = open_record(slots, &primary_record, provider)?;
    let secondary_key = open_record(slots, &secondary_record, provider)?;

    let primary = slots.insert_asymmetric(primary_key, primary_record.certificate.clone())?;
    let secondary = slots.insert_asymmetric(secondary_key, secondary_record.certificate.clone())?;
    Ok(LoadedKeystore {
        primary,
        secondary,
        primary_cert: primary_record.certificate,
        secondary_cert: secondary_record.certificate,
    })
}

#[cfg(any(test, feature = "test-fixtures"))]
pub mod test_support {
    use super::*;

    /// Self-signed certificate PEM for an existing keypair.
    pub fn self_signed_cert_with_key(keypair: &KeypairMaterial, subject: &str) -> String {
        certificate_for(keypair, subject)
            .and_then(|c| {
                c.serialize_pem()
                    .map_err(|e| OvsaError::Crypto(e.to_string()))
            })
            .expect("test certificate")
    }

    /// Fresh P-256 keypair plus a self-signed certificate.
    pub fn self_signed_cert(subject: &str) -> (String, KeypairMaterial) {
        let key = KeypairMaterial::generate(EcdsaAlgorithm::P256);
        let pem = self_signed_cert_with_key(&key, subject);
        (pem, key)
    }
}
