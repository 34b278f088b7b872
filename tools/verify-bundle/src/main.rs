use std::path::Path;

use anyhow::{bail, Context};

use ovsa_core::crypto;
use ovsa_core::envelope::{read_json_capped, MacBlob, SignedBlob};
use ovsa_core::license::MasterLicensePayload;

/// Offline sanity checker for issuer output: verifies the bundle
/// signature against its embedded certificate and cross-checks the
/// master license's model hash and GUID against the bundle.
fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let (Some(bundle_path), Some(master_path)) = (args.next(), args.next()) else {
        bail!("usage: verify-bundle <protect.dat> <master.mlic>");
    };

    let bundle: SignedBlob =
        read_json_capped(Path::new(&bundle_path), u64::MAX).context("read bundle")?;
    let master: MacBlob =
        read_json_capped(Path::new(&master_path), 16 * 1024 * 1024).context("read master")?;
    let master_payload: MasterLicensePayload = master.payload_as().context("master payload")?;

    let Some(cert) = bundle.payload["isv_certificate"].as_str() else {
        bail!("bundle carries no issuer certificate");
    };
    crypto::verify_blob(cert, &bundle).context("bundle signature")?;
    println!("bundle signature: OK");

    let canonical = bundle.canonical_payload()?;
    let hash = crypto::compute_model_hash(&canonical);
    if hash != master_payload.model_hash {
        bail!(
            "model hash mismatch: bundle {} vs master {}",
            hash,
            master_payload.model_hash
        );
    }
    println!("model hash: OK ({})", &hash[..16]);

    let Some(guid) = bundle.payload["model_guid"].as_str() else {
        bail!("bundle carries no model guid");
    };
    if guid != master_payload.model_guid.to_string() {
        bail!("model guid mismatch");
    }
    println!("model guid: OK ({guid})");

    let entries = bundle.payload["enc_model"]
        .as_array()
        .map(|a| a.len())
        .unwrap_or(0);
    if entries == 0 {
        bail!("bundle contains no encrypted entries");
    }
    println!("encrypted entries: {entries}");
    println!("BUNDLE OK");
    Ok(())
}
