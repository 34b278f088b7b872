use std::path::PathBuf;

use ovsa_core::certs::TrustAnchors;
use ovsa_core::crypto::{self, EcdsaAlgorithm};
use ovsa_core::envelope::{read_json_capped, write_json_atomic, MacBlob, SignedBlob, MAX_LICENSE_FILE};
use ovsa_core::keystore::{self, PassphraseProvider};
use ovsa_core::license::{LicenseConfig, LicensePolicy};
use ovsa_core::ocsp::OcspPolicy;
use ovsa_core::protect::{protect, ModelMetadata, ProtectRequest};
use ovsa_core::sale::{sale, SaleRequest};
use ovsa_core::slots::SlotTable;
use ovsa_core::tcb::{sign_tcb, TcbPayload};
use ovsa_core::{CustomerLicensePayload, MasterLicensePayload};

struct Fixture {
    dir: tempfile::TempDir,
    issuer_ks: PathBuf,
    customer_ks: PathBuf,
    anchors: TrustAnchors,
    provider: PassphraseProvider,
}

fn setup() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let provider = PassphraseProvider::new("integration-test");
    let issuer_ks = dir.path().join("isv");
    let customer_ks = dir.path().join("cust");
    keystore::create_store(&issuer_ks, EcdsaAlgorithm::P256, "/C=IN/CN=isv", None, &provider)
        .unwrap();
    keystore::create_store(
        &customer_ks,
        EcdsaAlgorithm::P256,
        "/C=DE/CN=customer",
        None,
        &provider,
    )
    .unwrap();

    let mut anchors = TrustAnchors::empty();
    for cert in ["primary_isv.csr.crt", "primary_cust.csr.crt", "secondary_isv.csr.crt"] {
        let pem = std::fs::read_to_string(dir.path().join(cert)).unwrap();
        anchors.add_pem(&pem).unwrap();
    }
    Fixture {
        dir,
        issuer_ks,
        customer_ks,
        anchors,
        provider,
    }
}

fn metadata() -> ModelMetadata {
    ModelMetadata {
        name: "face-detect".to_string().try_into().unwrap(),
        description: "demo model".to_string().try_into().unwrap(),
        version: "1".to_string().try_into().unwrap(),
    }
}

const LICENSE_GUID: &str = "50934a64-5d1b-4655-bcb4-80080fcb8858";
const XML_BYTES: &[u8] = b"<?xml version=\"1.0\"?><net name=\"m\"/>";
const BIN_BYTES: &[u8] = &[0x4f, 0x56, 0x00, 0x01, 0x7a, 0x7a, 0x7a, 0x7a];

async fn run_protect(fx: &Fixture) -> (PathBuf, PathBuf, ovsa_core::ProtectOutcome) {
    let xml = fx.dir.path().join("a.xml");
    let bin = fx.dir.path().join("a.bin");
    std::fs::write(&xml, XML_BYTES).unwrap();
    std::fs::write(&bin, BIN_BYTES).unwrap();

    let protect_out = fx.dir.path().join("m.dat");
    let master_out = fx.dir.path().join("m.mlic");
    let outcome = protect(
        ProtectRequest {
            model_files: vec![xml, bin],
            metadata: metadata(),
            license_guid: LICENSE_GUID.parse().unwrap(),
            keystore: &fx.issuer_ks,
            protect_out: &protect_out,
            master_out: &master_out,
        },
        &fx.provider,
        &fx.anchors,
    )
    .await
    .unwrap();
    (protect_out, master_out, outcome)
}

fn write_tcb(fx: &Fixture) -> PathBuf {
    let mut slots = SlotTable::new();
    let loaded = keystore::load_asymmetric_key(&mut slots, &fx.issuer_ks, &fx.provider).unwrap();
    let tcb = sign_tcb(
        &slots,
        loaded.primary,
        &TcbPayload {
            tcb_name: "prod-runtime".into(),
            tcb_version: "1.0".into(),
            pcr_bank_algorithm: "sha256".into(),
            pcr_selection: vec![0, 1, 2, 3, 7],
            pcr_digest: hex::encode([0x42u8; 32]),
        },
    )
    .unwrap();
    let path = fx.dir.path().join("runtime.tcb");
    write_json_atomic(&path, &tcb, false).unwrap();
    path
}

fn write_config(fx: &Fixture, policy: LicensePolicy) -> PathBuf {
    let server_cert = std::fs::read_to_string(fx.dir.path().join("secondary_isv.csr.crt")).unwrap();
    let config = LicenseConfig {
        license_policy: policy,
        license_server_url: "localhost:4451".into(),
        license_server_cert: server_cert,
    };
    let path = fx.dir.path().join("license.cfg");
    write_json_atomic(&path, &config, false).unwrap();
    path
}

#[tokio::test]
async fn protect_emits_verifiable_bundle_and_master() {
    let fx = setup();
    let (protect_out, master_out, outcome) = run_protect(&fx).await;

    let bundle: SignedBlob = read_json_capped(&protect_out, MAX_LICENSE_FILE).unwrap();
    let cert = bundle.payload["isv_certificate"].as_str().unwrap().to_string();
    crypto::verify_blob(&cert, &bundle).unwrap();

    // Model hash binds master to bundle.
    let master: MacBlob = read_json_capped(&master_out, MAX_LICENSE_FILE).unwrap();
    let master_payload: MasterLicensePayload = master.payload_as().unwrap();
    let canonical = bundle.canonical_payload().unwrap();
    assert_eq!(crypto::compute_model_hash(&canonical), master_payload.model_hash);
    assert_eq!(outcome.model_hash, master_payload.model_hash);
    assert_eq!(outcome.model_guid, master_payload.model_guid);
    assert_eq!(master_payload.license_guid.to_string(), LICENSE_GUID);
    assert_eq!(
        bundle.payload["model_guid"].as_str().unwrap(),
        outcome.model_guid.to_string()
    );

    // Input order is preserved in the entry list.
    let entries = bundle.payload["enc_model"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["file_name"], "a.xml");
    assert_eq!(entries[1]["file_name"], "a.bin");
}

#[tokio::test]
async fn empty_input_list_is_invalid() {
    let fx = setup();
    let err = protect(
        ProtectRequest {
            model_files: vec![],
            metadata: metadata(),
            license_guid: LICENSE_GUID.parse().unwrap(),
            keystore: &fx.issuer_ks,
            protect_out: &fx.dir.path().join("m.dat"),
            master_out: &fx.dir.path().join("m.mlic"),
        },
        &fx.provider,
        &fx.anchors,
    )
    .await
    .unwrap_err();
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn sale_rewraps_key_for_customer() {
    let fx = setup();
    let (protect_out, master_out, _) = run_protect(&fx).await;
    let tcb_path = write_tcb(&fx);
    let config_path = write_config(&fx, LicensePolicy::TimeLimit { days: 30 });

    let customer_cert = fx.dir.path().join("primary_cust.csr.crt");
    let secondary_cert = fx.dir.path().join("secondary_cust.csr.crt");
    let out = fx.dir.path().join("customer.lic");
    let outcome = sale(
        SaleRequest {
            master: &master_out,
            keystore: &fx.issuer_ks,
            license_config: &config_path,
            tcb: &tcb_path,
            customer_cert: &customer_cert,
            customer_secondary_cert: Some(&secondary_cert),
            out: &out,
        },
        &fx.provider,
        &fx.anchors,
        &OcspPolicy::assume_good(),
    )
    .await
    .unwrap();
    assert_eq!(outcome.license_guid.to_string(), LICENSE_GUID);

    let license: SignedBlob = read_json_capped(&out, MAX_LICENSE_FILE).unwrap();
    let payload: CustomerLicensePayload = license.payload_as().unwrap();
    crypto::verify_blob(&payload.isv_certificate, &license).unwrap();
    assert_eq!(payload.license_config, LicensePolicy::TimeLimit { days: 30 });
    assert!(!payload.customer_certificate.secondary_fingerprint.is_empty());

    // The customer wrap must differ from the issuer self-wrap byte-wise.
    let master: MacBlob = read_json_capped(&master_out, MAX_LICENSE_FILE).unwrap();
    let master_payload: MasterLicensePayload = master.payload_as().unwrap();
    assert_ne!(payload.encryption_key, master_payload.encryption_key);

    // Unwrapping with the customer's private key recovers a key that
    // decrypts the bundle entries back to the original bytes.
    let mut slots = SlotTable::new();
    let customer = keystore::load_asymmetric_key(&mut slots, &fx.customer_ks, &fx.provider).unwrap();
    let (sym, _mac) = crypto::unwrap_key(&mut slots, customer.primary, &payload.encryption_key).unwrap();

    let bundle: SignedBlob = read_json_capped(&protect_out, MAX_LICENSE_FILE).unwrap();
    use base64::{engine::general_purpose, Engine as _};
    let entries = bundle.payload["enc_model"].as_array().unwrap();
    let iv = general_purpose::STANDARD
        .decode(entries[0]["iv"].as_str().unwrap())
        .unwrap();
    let ct = general_purpose::STANDARD
        .decode(entries[0]["ciphertext"].as_str().unwrap())
        .unwrap();
    let plain = crypto::decrypt_mem(&slots, sym, &iv, &ct).unwrap();
    assert_eq!(plain.as_slice(), XML_BYTES);

    let iv = general_purpose::STANDARD
        .decode(entries[1]["iv"].as_str().unwrap())
        .unwrap();
    let ct = general_purpose::STANDARD
        .decode(entries[1]["ciphertext"].as_str().unwrap())
        .unwrap();
    let plain = crypto::decrypt_mem(&slots, sym, &iv, &ct).unwrap();
    assert_eq!(plain.as_slice(), BIN_BYTES);
}

#[tokio::test]
async fn sale_rejects_foreign_master_license() {
    let fx = setup();
    let (_, master_out, _) = run_protect(&fx).await;
    let tcb_path = write_tcb(&fx);
    let config_path = write_config(&fx, LicensePolicy::Unlimited);

    // A different keystore cannot re-derive the master HMAC key.
    let other_ks = fx.dir.path().join("other");
    keystore::create_store(&other_ks, EcdsaAlgorithm::P256, "/CN=other", None, &fx.provider)
        .unwrap();
    let err = sale(
        SaleRequest {
            master: &master_out,
            keystore: &other_ks,
            license_config: &config_path,
            tcb: &tcb_path,
            customer_cert: &fx.dir.path().join("primary_cust.csr.crt"),
            customer_secondary_cert: None,
            out: &fx.dir.path().join("x.lic"),
        },
        &fx.provider,
        &fx.anchors,
        &OcspPolicy::assume_good(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.tag(), "OVSA_ERR_VERIFY");
}

#[tokio::test]
async fn sale_rejects_unanchored_customer() {
    let fx = setup();
    let (_, master_out, _) = run_protect(&fx).await;
    let tcb_path = write_tcb(&fx);
    let config_path = write_config(&fx, LicensePolicy::Unlimited);

    // A customer certificate that does not chain to the anchors fails.
    let stray_ks = fx.dir.path().join("stray");
    keystore::create_store(&stray_ks, EcdsaAlgorithm::P256, "/CN=stray", None, &fx.provider)
        .unwrap();
    let err = sale(
        SaleRequest {
            master: &master_out,
            keystore: &fx.issuer_ks,
            license_config: &config_path,
            tcb: &tcb_path,
            customer_cert: &fx.dir.path().join("primary_stray.csr.crt"),
            customer_secondary_cert: None,
            out: &fx.dir.path().join("x.lic"),
        },
        &fx.provider,
        &fx.anchors,
        &OcspPolicy::assume_good(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.tag(), "OVSA_ERR_VERIFY");
}
