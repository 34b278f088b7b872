//! Cryptographic primitives: ECDSA sign/verify, ephemeral-static ECDH
//! key wrap, AES-256-GCM, HMAC-SHA-256, digests and randomness.
//!
//! Key agreement follows the wrap construction used throughout the
//! toolchain: a fresh ephemeral keypair on the target's curve, ECDH
//! against the target's static public key, HKDF-SHA-256 expansion into a
//! KEK and a MAC key, then AES-256-GCM wrap of the 32-byte payload key.
//! The MAC half keys the master-license HMAC and is re-derivable by the
//! target from the ephemeral point embedded in the wire blob.

use aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rand::RngCore;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha384};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::canonical::canonical_json_bytes;
use crate::envelope::{MacBlob, SignedBlob};
use crate::error::{OvsaError, Result};
use crate::slots::{SlotId, SlotTable};

pub const GCM_IV_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;
/// AES-GCM wrap of a 32-byte key: ciphertext plus tag.
pub const WRAPPED_KEY_LEN: usize = 32 + GCM_TAG_LEN;

const P256_POINT_LEN: usize = 65;
const P384_POINT_LEN: usize = 97;

const WRAP_HKDF_SALT: &[u8] = b"ovsa/wrap/v1";
const WRAP_KEK_INFO: &[u8] = b"ovsa/kek/v1";
const WRAP_MAC_INFO: &[u8] = b"ovsa/mac/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcdsaAlgorithm {
    #[serde(rename = "ecdsa-p256")]
    P256,
    #[serde(rename = "ecdsa-p384")]
    P384,
}

impl EcdsaAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            EcdsaAlgorithm::P256 => "ecdsa-p256",
            EcdsaAlgorithm::P384 => "ecdsa-p384",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ecdsa-p256" => Ok(EcdsaAlgorithm::P256),
            "ecdsa-p384" => Ok(EcdsaAlgorithm::P384),
            other => Err(OvsaError::InvalidParameter(format!(
                "unknown key algorithm `{other}`"
            ))),
        }
    }
}

/// Private key material for one asymmetric slot. The inner secret keys
/// zeroize their scalars on drop.
pub enum KeypairMaterial {
    P256(p256::SecretKey),
    P384(p384::SecretKey),
}

impl KeypairMaterial {
    pub fn generate(alg: EcdsaAlgorithm) -> Self {
        let mut rng = rand::rngs::OsRng;
        match alg {
            EcdsaAlgorithm::P256 => KeypairMaterial::P256(p256::SecretKey::random(&mut rng)),
            EcdsaAlgorithm::P384 => KeypairMaterial::P384(p384::SecretKey::random(&mut rng)),
        }
    }

    pub fn algorithm(&self) -> EcdsaAlgorithm {
        match self {
            KeypairMaterial::P256(_) => EcdsaAlgorithm::P256,
            KeypairMaterial::P384(_) => EcdsaAlgorithm::P384,
        }
    }

    pub fn from_pkcs8_der(alg: EcdsaAlgorithm, der: &[u8]) -> Result<Self> {
        match alg {
            EcdsaAlgorithm::P256 => p256::SecretKey::from_pkcs8_der(der)
                .map(KeypairMaterial::P256)
                .map_err(|_| OvsaError::Crypto("malformed P-256 private key".into())),
            EcdsaAlgorithm::P384 => p384::SecretKey::from_pkcs8_der(der)
                .map(KeypairMaterial::P384)
                .map_err(|_| OvsaError::Crypto("malformed P-384 private key".into())),
        }
    }

    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>> {
        let doc = match self {
            KeypairMaterial::P256(sk) => sk.to_pkcs8_der(),
            KeypairMaterial::P384(sk) => sk.to_pkcs8_der(),
        }
        .map_err(|_| OvsaError::Crypto("PKCS#8 encoding failed".into()))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    /// DER SubjectPublicKeyInfo of the public half.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        let doc = match self {
            KeypairMaterial::P256(sk) => sk.public_key().to_public_key_der(),
            KeypairMaterial::P384(sk) => sk.public_key().to_public_key_der(),
        }
        .map_err(|_| OvsaError::Crypto("SPKI encoding failed".into()))?;
        Ok(doc.as_bytes().to_vec())
    }
}

/// Sign canonical bytes, returning the DER-encoded ECDSA signature.
/// P-256 signs over SHA-256, P-384 over SHA-384.
pub fn sign_bytes(keypair: &KeypairMaterial, data: &[u8]) -> Result<Vec<u8>> {
    match keypair {
        KeypairMaterial::P256(sk) => {
            use p256::ecdsa::signature::Signer;
            let signing = p256::ecdsa::SigningKey::from(sk);
            let sig: p256::ecdsa::Signature = signing.sign(data);
            Ok(sig.to_der().as_bytes().to_vec())
        }
        KeypairMaterial::P384(sk) => {
            use p384::ecdsa::signature::Signer;
            let signing = p384::ecdsa::SigningKey::from(sk);
            let sig: p384::ecdsa::Signature = signing.sign(data);
            Ok(sig.to_der().as_bytes().to_vec())
        }
    }
}

/// Verify a DER ECDSA signature against a DER SubjectPublicKeyInfo.
pub fn verify_bytes_with_spki(spki_der: &[u8], data: &[u8], sig_der: &[u8]) -> Result<()> {
    if let Ok(pk) = p256::PublicKey::from_public_key_der(spki_der) {
        use p256::ecdsa::signature::Verifier;
        let vk = p256::ecdsa::VerifyingKey::from(&pk);
        let sig = p256::ecdsa::Signature::from_der(sig_der)
            .map_err(|_| OvsaError::Verification("malformed ECDSA signature".into()))?;
        return vk
            .verify(data, &sig)
            .map_err(|_| OvsaError::Verification("ECDSA signature mismatch".into()));
    }
    if let Ok(pk) = p384::PublicKey::from_public_key_der(spki_der) {
        use p384::ecdsa::signature::Verifier;
        let vk = p384::ecdsa::VerifyingKey::from(&pk);
        let sig = p384::ecdsa::Signature::from_der(sig_der)
            .map_err(|_| OvsaError::Verification("malformed ECDSA signature".into()))?;
        return vk
            .verify(data, &sig)
            .map_err(|_| OvsaError::Verification("ECDSA signature mismatch".into()));
    }
    Err(OvsaError::Verification(
        "unsupported public key algorithm".into(),
    ))
}

/// Sign a JSON payload with the asymmetric slot, producing the signature
/// envelope written to disk.
pub fn sign_blob(slots: &SlotTable, slot: SlotId, payload: Value) -> Result<SignedBlob> {
    let asym = slots.asymmetric(slot)?;
    let canonical = canonical_json_bytes(&payload)?;
    let sig = sign_bytes(&asym.keypair, &canonical)?;
    Ok(SignedBlob {
        payload,
        signature: general_purpose::STANDARD.encode(sig),
    })
}

/// Verify a signature envelope against the public half of an asymmetric
/// slot (the issuer checking its own output).
pub fn verify_blob_with_slot(slots: &SlotTable, slot: SlotId, blob: &SignedBlob) -> Result<()> {
    let spki = slots.asymmetric(slot)?.keypair.public_key_der()?;
    let canonical = blob.canonical_payload()?;
    let sig = general_purpose::STANDARD
        .decode(&blob.signature)
        .map_err(|_| OvsaError::Verification("malformed signature encoding".into()))?;
    verify_bytes_with_spki(&spki, &canonical, &sig)
}

/// Verify a signature envelope against the given certificate's public key.
pub fn verify_blob(cert_pem: &str, blob: &SignedBlob) -> Result<()> {
    let spki = crate::certs::leaf_spki_der(cert_pem)?;
    let canonical = blob.canonical_payload()?;
    let sig = general_purpose::STANDARD
        .decode(&blob.signature)
        .map_err(|_| OvsaError::Verification("malformed signature encoding".into()))?;
    verify_bytes_with_spki(&spki, &canonical, &sig)
}

/// Allocate a fresh symmetric key slot. Only 256-bit keys are supported.
pub fn generate_symmetric_key(slots: &mut SlotTable, bits: usize) -> Result<SlotId> {
    if bits != 256 {
        return Err(OvsaError::InvalidParameter(format!(
            "unsupported symmetric key size {bits}"
        )));
    }
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    let slot = slots.insert_symmetric(key);
    key.zeroize();
    slot
}

pub fn generate_guid() -> Uuid {
    Uuid::new_v4()
}

/// AES-256-GCM encrypt with a fresh random 96-bit IV and 128-bit tag.
pub fn encrypt_mem(slots: &SlotTable, sym: SlotId, plaintext: &[u8]) -> Result<([u8; 12], Vec<u8>)> {
    let key = slots.symmetric(sym)?;
    let cipher = Aes256Gcm::new_from_slice(key.expose_secret())
        .map_err(|_| OvsaError::Crypto("AES key setup failed".into()))?;
    let mut iv = [0u8; GCM_IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| OvsaError::Crypto("AES-GCM encryption failed".into()))?;
    Ok((iv, ciphertext))
}

/// AES-256-GCM decrypt; the returned plaintext zeroizes on drop.
pub fn decrypt_mem(
    slots: &SlotTable,
    sym: SlotId,
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if iv.len() != GCM_IV_LEN {
        return Err(OvsaError::Verification("bad IV length".into()));
    }
    let key = slots.symmetric(sym)?;
    let cipher = Aes256Gcm::new_from_slice(key.expose_secret())
        .map_err(|_| OvsaError::Crypto("AES key setup failed".into()))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| OvsaError::Verification("GCM tag verification failed".into()))?;
    Ok(Zeroizing::new(plaintext))
}

/// Wire form of a wrapped key: ephemeral SEC1 point, wrap IV, AES-GCM
/// ciphertext+tag, base64-encoded as one string.
pub struct WrapBlob {
    pub eph_point: Vec<u8>,
    pub iv: [u8; 12],
    pub wrapped: Vec<u8>,
}

impl WrapBlob {
    pub fn encode(&self) -> String {
        let mut raw = Vec::with_capacity(self.eph_point.len() + GCM_IV_LEN + self.wrapped.len());
        raw.extend_from_slice(&self.eph_point);
        raw.extend_from_slice(&self.iv);
        raw.extend_from_slice(&self.wrapped);
        general_purpose::STANDARD.encode(raw)
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| OvsaError::Verification("malformed key wrap encoding".into()))?;
        let point_len = raw
            .len()
            .checked_sub(GCM_IV_LEN + WRAPPED_KEY_LEN)
            .filter(|l| *l == P256_POINT_LEN || *l == P384_POINT_LEN)
            .ok_or_else(|| OvsaError::Verification("bad key wrap length".into()))?;
        let mut iv = [0u8; GCM_IV_LEN];
        iv.copy_from_slice(&raw[point_len..point_len + GCM_IV_LEN]);
        Ok(WrapBlob {
            eph_point: raw[..point_len].to_vec(),
            iv,
            wrapped: raw[point_len + GCM_IV_LEN..].to_vec(),
        })
    }

    pub fn curve(&self) -> EcdsaAlgorithm {
        if self.eph_point.len() == P256_POINT_LEN {
            EcdsaAlgorithm::P256
        } else {
            EcdsaAlgorithm::P384
        }
    }
}

fn derive_wrap_keys(shared: &[u8]) -> (Zeroizing<[u8; 32]>, [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(WRAP_HKDF_SALT), shared);
    let mut kek = Zeroizing::new([0u8; 32]);
    hk.expand(WRAP_KEK_INFO, &mut *kek).expect("HKDF expand");
    let mut mac = [0u8; 32];
    hk.expand(WRAP_MAC_INFO, &mut mac).expect("HKDF expand");
    (kek, mac)
}

/// Wrap the symmetric key in `sym` to the holder of `target_spki_der`.
/// Returns the encoded wire blob and a slot holding the derived MAC key.
pub fn wrap_key(
    slots: &mut SlotTable,
    target_spki_der: &[u8],
    sym: SlotId,
) -> Result<(String, SlotId)> {
    let key = Zeroizing::new(*slots.symmetric(sym)?.expose_secret());
    let mut rng = rand::rngs::OsRng;

    let (eph_point, shared) = if let Ok(pk) = p256::PublicKey::from_public_key_der(target_spki_der)
    {
        let eph = p256::ecdh::EphemeralSecret::random(&mut rng);
        let point = eph.public_key().to_encoded_point(false).as_bytes().to_vec();
        let shared = eph.diffie_hellman(&pk);
        (point, Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    } else if let Ok(pk) = p384::PublicKey::from_public_key_der(target_spki_der) {
        let eph = p384::ecdh::EphemeralSecret::random(&mut rng);
        let point = eph.public_key().to_encoded_point(false).as_bytes().to_vec();
        let shared = eph.diffie_hellman(&pk);
        (point, Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    } else {
        return Err(OvsaError::Crypto(
            "wrap target is not a P-256 or P-384 key".into(),
        ));
    };

    let (kek, mac) = derive_wrap_keys(&shared);
    let cipher = Aes256Gcm::new_from_slice(&*kek)
        .map_err(|_| OvsaError::Crypto("AES key setup failed".into()))?;
    let mut iv = [0u8; GCM_IV_LEN];
    rng.fill_bytes(&mut iv);
    let wrapped = cipher
        .encrypt(Nonce::from_slice(&iv), key.as_slice())
        .map_err(|_| OvsaError::Crypto("key wrap failed".into()))?;

    let mac_slot = slots.insert_hmac(mac)?;
    let blob = WrapBlob {
        eph_point,
        iv,
        wrapped,
    };
    Ok((blob.encode(), mac_slot))
}

/// Unwrap a key wrapped to the asymmetric slot's private key. Returns the
/// symmetric slot and the re-derived MAC key slot.
pub fn unwrap_key(slots: &mut SlotTable, asym: SlotId, encoded: &str) -> Result<(SlotId, SlotId)> {
    let blob = WrapBlob::decode(encoded)?;
    let shared: Zeroizing<Vec<u8>> = {
        let keypair = &slots.asymmetric(asym)?.keypair;
        match (keypair, blob.curve()) {
            (KeypairMaterial::P256(sk), EcdsaAlgorithm::P256) => {
                let eph = p256::PublicKey::from_sec1_bytes(&blob.eph_point)
                    .map_err(|_| OvsaError::Verification("bad ephemeral point".into()))?;
                let shared = p256::ecdh::diffie_hellman(sk.to_nonzero_scalar(), eph.as_affine());
                Zeroizing::new(shared.raw_secret_bytes().to_vec())
            }
            (KeypairMaterial::P384(sk), EcdsaAlgorithm::P384) => {
                let eph = p384::PublicKey::from_sec1_bytes(&blob.eph_point)
                    .map_err(|_| OvsaError::Verification("bad ephemeral point".into()))?;
                let shared = p384::ecdh::diffie_hellman(sk.to_nonzero_scalar(), eph.as_affine());
                Zeroizing::new(shared.raw_secret_bytes().to_vec())
            }
            _ => {
                return Err(OvsaError::Crypto(
                    "algorithm mismatch between key slot and wrap blob".into(),
                ))
            }
        }
    };

    let (kek, mac) = derive_wrap_keys(&shared);
    let cipher = Aes256Gcm::new_from_slice(&*kek)
        .map_err(|_| OvsaError::Crypto("AES key setup failed".into()))?;
    if blob.wrapped.len() != WRAPPED_KEY_LEN {
        return Err(OvsaError::Verification("bad wrapped key length".into()));
    }
    let plain = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&blob.iv), blob.wrapped.as_slice())
            .map_err(|_| OvsaError::Verification("key unwrap failed".into()))?,
    );
    let mut key = [0u8; 32];
    key.copy_from_slice(&plain);
    let sym_slot = slots.insert_symmetric(key)?;
    key.zeroize();
    let mac_slot = slots.insert_hmac(mac)?;
    Ok((sym_slot, mac_slot))
}

/// HMAC-SHA-256 envelope over a JSON payload, keyed by an hmac slot.
pub fn hmac_json_blob(slots: &SlotTable, mac_slot: SlotId, payload: Value) -> Result<MacBlob> {
    let key = slots.hmac(mac_slot)?;
    let canonical = canonical_json_bytes(&payload)?;
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key.expose_secret())
        .map_err(|_| OvsaError::Crypto("HMAC key setup failed".into()))?;
    mac.update(&canonical);
    Ok(MacBlob {
        payload,
        hmac: hex::encode(mac.finalize().into_bytes()),
    })
}

/// Constant-time verification of an HMAC envelope.
pub fn verify_hmac_blob(slots: &SlotTable, mac_slot: SlotId, blob: &MacBlob) -> Result<()> {
    let key = slots.hmac(mac_slot)?;
    let canonical = blob.canonical_payload()?;
    let tag = hex::decode(&blob.hmac)
        .map_err(|_| OvsaError::Verification("malformed HMAC encoding".into()))?;
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key.expose_secret())
        .map_err(|_| OvsaError::Crypto("HMAC key setup failed".into()))?;
    mac.update(&canonical);
    mac.verify_slice(&tag)
        .map_err(|_| OvsaError::Verification("HMAC mismatch".into()))
}

/// SHA-384 over canonical payload bytes, hex-encoded (48 bytes).
pub fn compute_model_hash(canonical: &[u8]) -> String {
    hex::encode(Sha384::digest(canonical))
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_key() -> (SlotTable, SlotId) {
        let mut slots = SlotTable::new();
        let sym = generate_symmetric_key(&mut slots, 256).unwrap();
        (slots, sym)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (slots, sym) = table_with_key();
        let (iv, ct) = encrypt_mem(&slots, sym, b"model weights").unwrap();
        let pt = decrypt_mem(&slots, sym, &iv, &ct).unwrap();
        assert_eq!(pt.as_slice(), b"model weights");
    }

    #[test]
    fn ciphertext_tamper_fails_tag_check() {
        let (slots, sym) = table_with_key();
        let (iv, mut ct) = encrypt_mem(&slots, sym, b"payload").unwrap();
        ct[0] ^= 0x80;
        let err = decrypt_mem(&slots, sym, &iv, &ct).unwrap_err();
        assert!(matches!(err, OvsaError::Verification(_)));
    }

    #[test]
    fn wrap_unwrap_roundtrip_p256() {
        let (mut slots, sym) = table_with_key();
        let recipient = KeypairMaterial::generate(EcdsaAlgorithm::P256);
        let spki = recipient.public_key_der().unwrap();
        let (blob, _mac) = wrap_key(&mut slots, &spki, sym).unwrap();

        let asym = slots.insert_asymmetric(recipient, String::new()).unwrap();
        let (sym2, _mac2) = unwrap_key(&mut slots, asym, &blob).unwrap();
        assert_eq!(
            slots.symmetric(sym).unwrap().expose_secret(),
            slots.symmetric(sym2).unwrap().expose_secret()
        );
    }

    #[test]
    fn wrap_unwrap_roundtrip_p384() {
        let (mut slots, sym) = table_with_key();
        let recipient = KeypairMaterial::generate(EcdsaAlgorithm::P384);
        let spki = recipient.public_key_der().unwrap();
        let (blob, _mac) = wrap_key(&mut slots, &spki, sym).unwrap();

        let asym = slots.insert_asymmetric(recipient, String::new()).unwrap();
        let (sym2, _mac2) = unwrap_key(&mut slots, asym, &blob).unwrap();
        assert_eq!(
            slots.symmetric(sym).unwrap().expose_secret(),
            slots.symmetric(sym2).unwrap().expose_secret()
        );
    }

    #[test]
    fn rewrap_produces_distinct_blob() {
        // A fresh ephemeral key per wrap means two wraps of the same key
        // to the same recipient never collide.
        let (mut slots, sym) = table_with_key();
        let recipient = KeypairMaterial::generate(EcdsaAlgorithm::P256);
        let spki = recipient.public_key_der().unwrap();
        let (a, _) = wrap_key(&mut slots, &spki, sym).unwrap();
        let (b, _) = wrap_key(&mut slots, &spki, sym).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unwrap_with_wrong_key_fails() {
        let (mut slots, sym) = table_with_key();
        let recipient = KeypairMaterial::generate(EcdsaAlgorithm::P256);
        let spki = recipient.public_key_der().unwrap();
        let (blob, _) = wrap_key(&mut slots, &spki, sym).unwrap();

        let other = KeypairMaterial::generate(EcdsaAlgorithm::P256);
        let asym = slots.insert_asymmetric(other, String::new()).unwrap();
        assert!(unwrap_key(&mut slots, asym, &blob).is_err());
    }

    #[test]
    fn wrap_mac_key_is_rederived_on_unwrap() {
        let (mut slots, sym) = table_with_key();
        let recipient = KeypairMaterial::generate(EcdsaAlgorithm::P256);
        let spki = recipient.public_key_der().unwrap();
        let (blob, mac_a) = wrap_key(&mut slots, &spki, sym).unwrap();

        let payload = serde_json::json!({"license_guid": "g"});
        let sealed = hmac_json_blob(&slots, mac_a, payload).unwrap();

        let asym = slots.insert_asymmetric(recipient, String::new()).unwrap();
        let (_sym2, mac_b) = unwrap_key(&mut slots, asym, &blob).unwrap();
        verify_hmac_blob(&slots, mac_b, &sealed).unwrap();
    }

    #[test]
    fn hmac_payload_tamper_detected() {
        let mut slots = SlotTable::new();
        let mac = slots.insert_hmac([9u8; 32]).unwrap();
        let blob = hmac_json_blob(&slots, mac, serde_json::json!({"n": 1})).unwrap();
        let mut bad = blob.clone();
        bad.payload["n"] = serde_json::json!(2);
        assert!(verify_hmac_blob(&slots, mac, &blob).is_ok());
        assert!(verify_hmac_blob(&slots, mac, &bad).is_err());
    }

    #[test]
    fn sign_verify_blob_with_cert_key() {
        let keypair = KeypairMaterial::generate(EcdsaAlgorithm::P256);
        let data = b"canonical payload bytes";
        let sig = sign_bytes(&keypair, data).unwrap();
        let spki = keypair.public_key_der().unwrap();
        verify_bytes_with_spki(&spki, data, &sig).unwrap();

        let mut tampered = sig.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(verify_bytes_with_spki(&spki, data, &tampered).is_err());
        assert!(verify_bytes_with_spki(&spki, b"other bytes", &sig).is_err());
    }

    #[test]
    fn blob_verifies_against_signing_slot() {
        let mut slots = SlotTable::new();
        let keypair = KeypairMaterial::generate(EcdsaAlgorithm::P384);
        let slot = slots.insert_asymmetric(keypair, String::new()).unwrap();
        let blob = sign_blob(&slots, slot, serde_json::json!({"model_guid": "g"})).unwrap();
        verify_blob_with_slot(&slots, slot, &blob).unwrap();

        let mut tampered = blob;
        tampered.payload["model_guid"] = serde_json::json!("h");
        assert!(verify_blob_with_slot(&slots, slot, &tampered).is_err());
    }

    #[test]
    fn model_hash_is_sha384() {
        use hex_literal::hex;
        let h = compute_model_hash(b"abc");
        assert_eq!(h.len(), 96);
        let expected = hex!(
            "cb00753f45a35e8bb5a03d699ac65007272c32ab0eded1631a8b605a43ff5bed"
            "8086072ba1e7cc2358baeca134c825a7"
        );
        assert_eq!(h, hex::encode(expected));
    }

    #[test]
    fn symmetric_key_size_is_enforced() {
        let mut slots = SlotTable::new();
        assert!(generate_symmetric_key(&mut slots, 128).is_err());
        assert!(generate_symmetric_key(&mut slots, 256).is_ok());
    }
}
