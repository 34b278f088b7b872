//! Negative tests: every single-bit or single-field tamper on a produced
//! artifact must be caught by the corresponding integrity check.

use base64::{engine::general_purpose, Engine as _};
use ovsa_core::certs::TrustAnchors;
use ovsa_core::crypto::{self, EcdsaAlgorithm};
use ovsa_core::envelope::{read_json_capped, MacBlob, SignedBlob, MAX_LICENSE_FILE};
use ovsa_core::keystore::{self, PassphraseProvider};
use ovsa_core::protect::{protect, ModelMetadata, ProtectRequest};
use ovsa_core::slots::SlotTable;

async fn protected_fixture(
    dir: &tempfile::TempDir,
) -> (SignedBlob, MacBlob, PassphraseProvider, std::path::PathBuf) {
    let provider = PassphraseProvider::new("tamper-test");
    let ks = dir.path().join("isv");
    keystore::create_store(&ks, EcdsaAlgorithm::P256, "/CN=isv", None, &provider).unwrap();
    let anchors =
        TrustAnchors::from_pem_file(&dir.path().join("primary_isv.csr.crt")).unwrap();

    let input = dir.path().join("model.bin");
    std::fs::write(&input, [0x55u8; 256]).unwrap();
    let protect_out = dir.path().join("m.dat");
    let master_out = dir.path().join("m.mlic");
    protect(
        ProtectRequest {
            model_files: vec![input],
            metadata: ModelMetadata {
                name: "m".to_string().try_into().unwrap(),
                description: "d".to_string().try_into().unwrap(),
                version: "1".to_string().try_into().unwrap(),
            },
            license_guid: "50934a64-5d1b-4655-bcb4-80080fcb8858".parse().unwrap(),
            keystore: &ks,
            protect_out: &protect_out,
            master_out: &master_out,
        },
        &provider,
        &anchors,
    )
    .await
    .unwrap();

    let bundle = read_json_capped(&protect_out, MAX_LICENSE_FILE).unwrap();
    let master = read_json_capped(&master_out, MAX_LICENSE_FILE).unwrap();
    (bundle, master, provider, ks)
}

fn flip_base64_byte(encoded: &str, index: usize) -> String {
    let mut raw = general_purpose::STANDARD.decode(encoded).unwrap();
    raw[index] ^= 0x01;
    general_purpose::STANDARD.encode(raw)
}

#[tokio::test]
async fn ciphertext_bitflip_fails_signature_and_tag() {
    let dir = tempfile::tempdir().unwrap();
    let (bundle, _master, provider, ks) = protected_fixture(&dir).await;
    let cert = bundle.payload["isv_certificate"].as_str().unwrap().to_string();
    crypto::verify_blob(&cert, &bundle).unwrap();

    let mut tampered = bundle.clone();
    let ct = tampered.payload["enc_model"][0]["ciphertext"]
        .as_str()
        .unwrap()
        .to_string();
    tampered.payload["enc_model"][0]["ciphertext"] = flip_base64_byte(&ct, 3).into();

    // The outer signature covers the ciphertext, so the flip is caught
    // there first.
    assert!(crypto::verify_blob(&cert, &tampered).is_err());

    // Even if the signature check were bypassed, the GCM tag fails and no
    // plaintext comes out.
    let mut slots = SlotTable::new();
    let loaded = keystore::load_asymmetric_key(&mut slots, &ks, &provider).unwrap();
    let master: MacBlob = read_json_capped(&dir.path().join("m.mlic"), MAX_LICENSE_FILE).unwrap();
    let enc_key = master.payload["encryption_key"].as_str().unwrap();
    let (sym, _mac) = crypto::unwrap_key(&mut slots, loaded.primary, enc_key).unwrap();
    let iv = general_purpose::STANDARD
        .decode(tampered.payload["enc_model"][0]["iv"].as_str().unwrap())
        .unwrap();
    let ct = general_purpose::STANDARD
        .decode(tampered.payload["enc_model"][0]["ciphertext"].as_str().unwrap())
        .unwrap();
    assert!(crypto::decrypt_mem(&slots, sym, &iv, &ct).is_err());
}

#[tokio::test]
async fn iv_bitflip_fails_tag() {
    let dir = tempfile::tempdir().unwrap();
    let (bundle, master, provider, ks) = protected_fixture(&dir).await;

    let mut slots = SlotTable::new();
    let loaded = keystore::load_asymmetric_key(&mut slots, &ks, &provider).unwrap();
    let enc_key = master.payload["encryption_key"].as_str().unwrap();
    let (sym, _mac) = crypto::unwrap_key(&mut slots, loaded.primary, enc_key).unwrap();

    let iv_good = general_purpose::STANDARD
        .decode(bundle.payload["enc_model"][0]["iv"].as_str().unwrap())
        .unwrap();
    let ct = general_purpose::STANDARD
        .decode(bundle.payload["enc_model"][0]["ciphertext"].as_str().unwrap())
        .unwrap();
    crypto::decrypt_mem(&slots, sym, &iv_good, &ct).unwrap();

    let mut iv_bad = iv_good.clone();
    iv_bad[0] ^= 0x01;
    assert!(crypto::decrypt_mem(&slots, sym, &iv_bad, &ct).is_err());
}

#[tokio::test]
async fn payload_field_tamper_fails_signature() {
    let dir = tempfile::tempdir().unwrap();
    let (bundle, _master, _provider, _ks) = protected_fixture(&dir).await;
    let cert = bundle.payload["isv_certificate"].as_str().unwrap().to_string();

    let mut tampered = bundle.clone();
    tampered.payload["model_name"] = "stolen".into();
    assert!(crypto::verify_blob(&cert, &tampered).is_err());
}

#[tokio::test]
async fn signature_bitflip_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let (bundle, _master, _provider, _ks) = protected_fixture(&dir).await;
    let cert = bundle.payload["isv_certificate"].as_str().unwrap().to_string();

    let mut tampered = bundle.clone();
    tampered.signature = flip_base64_byte(&bundle.signature, 10);
    assert!(crypto::verify_blob(&cert, &tampered).is_err());
}

#[tokio::test]
async fn master_hmac_tamper_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let (_bundle, master, provider, ks) = protected_fixture(&dir).await;

    let mut slots = SlotTable::new();
    let loaded = keystore::load_asymmetric_key(&mut slots, &ks, &provider).unwrap();
    let enc_key = master.payload["encryption_key"].as_str().unwrap().to_string();
    let (_sym, mac_slot) = crypto::unwrap_key(&mut slots, loaded.primary, &enc_key).unwrap();

    crypto::verify_hmac_blob(&slots, mac_slot, &master).unwrap();

    let mut bad_payload = master.clone();
    bad_payload.payload["model_hash"] = "0000".into();
    assert!(crypto::verify_hmac_blob(&slots, mac_slot, &bad_payload).is_err());

    let mut bad_mac = master.clone();
    let mut hmac_bytes = hex::decode(&bad_mac.hmac).unwrap();
    hmac_bytes[0] ^= 0x01;
    bad_mac.hmac = hex::encode(hmac_bytes);
    assert!(crypto::verify_hmac_blob(&slots, mac_slot, &bad_mac).is_err());
}
