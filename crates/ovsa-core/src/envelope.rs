//! Signed and MAC'd JSON blob envelopes, plus atomic file helpers.
//!
//! Every artifact in the toolchain is a single top-level JSON object:
//! `{"payload": {...}, "signature": "<base64 ECDSA DER>"}` for signed
//! blobs, `{"payload": {...}, "hmac": "<hex SHA-256>"}` for the master
//! license. The integrity value always covers the canonical bytes of
//! `payload` only (see [`crate::canonical`]).

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::canonical::canonical_json_bytes;
use crate::error::{OvsaError, Result};
use crate::security::set_secure_permissions;

/// Upper bound for license-sized artifacts read from disk.
pub const MAX_LICENSE_FILE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedBlob {
    pub payload: Value,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacBlob {
    pub payload: Value,
    pub hmac: String,
}

impl SignedBlob {
    pub fn canonical_payload(&self) -> Result<Vec<u8>> {
        canonical_json_bytes(&self.payload)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| OvsaError::Verification(format!("malformed payload: {e}")))
    }
}

impl MacBlob {
    pub fn canonical_payload(&self) -> Result<Vec<u8>> {
        canonical_json_bytes(&self.payload)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| OvsaError::Verification(format!("malformed payload: {e}")))
    }
}

/// Read and deserialize a JSON file, refusing anything over `max_bytes`.
pub fn read_json_capped<T: DeserializeOwned>(path: &Path, max_bytes: u64) -> Result<T> {
    let meta = std::fs::metadata(path).map_err(|e| OvsaError::file_io(path, e))?;
    if meta.len() > max_bytes {
        return Err(OvsaError::InvalidParameter(format!(
            "{}: file exceeds {} byte limit",
            path.display(),
            max_bytes
        )));
    }
    let data = std::fs::read(path).map_err(|e| OvsaError::file_io(path, e))?;
    serde_json::from_slice(&data)
        .map_err(|e| OvsaError::Verification(format!("{}: malformed JSON: {e}", path.display())))
}

/// Serialize to pretty JSON and write atomically: temp file in the target
/// directory, fsync, then rename over the destination.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T, secret: bool) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let dir = dir.unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| OvsaError::file_io(path, e))?;
    if secret {
        set_secure_permissions(tmp.path()).ok();
    }
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| OvsaError::InvalidParameter(format!("JSON serialization: {e}")))?;
    tmp.write_all(&data)
        .and_then(|_| tmp.write_all(b"\n"))
        .map_err(|e| OvsaError::file_io(path, e))?;
    tmp.as_file_mut()
        .sync_all()
        .map_err(|e| OvsaError::file_io(path, e))?;
    tmp.persist(path)
        .map_err(|e| OvsaError::file_io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signed_blob_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.json");
        let blob = SignedBlob {
            payload: json!({"model_name": "m", "version": "1"}),
            signature: "c2ln".into(),
        };
        write_json_atomic(&path, &blob, false).unwrap();
        let back: SignedBlob = read_json_capped(&path, MAX_LICENSE_FILE).unwrap();
        assert_eq!(back.payload["model_name"], "m");
        assert_eq!(back.signature, "c2ln");
    }

    #[test]
    fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.json");
        std::fs::write(&path, vec![b'x'; 64]).unwrap();
        let err = read_json_capped::<Value>(&path, 16).unwrap_err();
        assert!(matches!(err, OvsaError::InvalidParameter(_)));
    }

    #[test]
    fn canonical_payload_ignores_file_formatting() {
        let a: SignedBlob =
            serde_json::from_str(r#"{ "payload": {"b": 1, "a": 2}, "signature": "s" }"#).unwrap();
        let b: SignedBlob =
            serde_json::from_str(r#"{"signature":"s","payload":{"a":2,"b":1}}"#).unwrap();
        assert_eq!(
            a.canonical_payload().unwrap(),
            b.canonical_payload().unwrap()
        );
    }
}
