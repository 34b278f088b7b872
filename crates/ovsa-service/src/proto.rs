//! Wire protocol: length-prefixed (u32, network order) JSON messages over
//! the mTLS stream, plus the authorization binding and token derivation
//! shared by server and client.

use base64::{engine::general_purpose, Engine as _};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use ovsa_core::error::{OvsaError, Result};
use ovsa_core::tcb::QuoteEvidence;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_FRAME: u32 = 1024 * 1024;
pub const NONCE_LEN: usize = 32;

const AUTH_PREFIX: &[u8] = b"OVSA-AUTH\x01";
const TOKEN_HKDF_SALT: &[u8] = b"ovsa/authz/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Exchanged first in each direction; the server's hello carries the
    /// attestation challenge.
    Hello {
        version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
    },
    Validate {
        license_guid: Uuid,
        bundle_hash: String,
        tcb_quote: QuoteEvidence,
        nonce_client: String,
        kex_pubkey: String,
    },
    Authorize {
        nonce_server: String,
        kex_pubkey: String,
        authorization: String,
    },
    Error {
        tag: String,
        message: String,
    },
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &WireMessage) -> Result<()> {
    let body = serde_json::to_vec(msg)
        .map_err(|e| OvsaError::InvalidParameter(format!("frame serialize: {e}")))?;
    if body.len() > MAX_FRAME as usize {
        return Err(OvsaError::InvalidParameter("frame too large".into()));
    }
    writer
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .map_err(|e| OvsaError::Transient(format!("write: {e}")))?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| OvsaError::Transient(format!("write: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| OvsaError::Transient(format!("flush: {e}")))
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<WireMessage> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| OvsaError::Transient(format!("read: {e}")))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(OvsaError::Verification(format!("frame of {len} bytes refused")));
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| OvsaError::Transient(format!("read: {e}")))?;
    serde_json::from_slice(&body)
        .map_err(|e| OvsaError::Verification(format!("malformed frame: {e}")))
}

pub fn fresh_nonce() -> Vec<u8> {
    use rand::RngCore;
    let mut nonce = vec![0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(value)
        .map_err(|_| OvsaError::Verification(format!("malformed {field}")))
}

/// Length-prefixed binding of the values the authorization token covers.
pub fn authorization_binding(
    license_guid: &Uuid,
    nonce_client: &[u8],
    nonce_server: &[u8],
    bundle_hash: &str,
) -> Vec<u8> {
    let guid = license_guid.to_string();
    let items: [&[u8]; 4] = [
        guid.as_bytes(),
        nonce_client,
        nonce_server,
        bundle_hash.as_bytes(),
    ];
    let mut out =
        Vec::with_capacity(AUTH_PREFIX.len() + items.iter().map(|i| 8 + i.len()).sum::<usize>());
    out.extend_from_slice(AUTH_PREFIX);
    for item in items {
        out.extend_from_slice(&(item.len() as u64).to_be_bytes());
        out.extend_from_slice(item);
    }
    out
}

/// Token key from the per-validation ECDH exchange.
pub fn derive_token_key(shared: &[u8]) -> zeroize::Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(TOKEN_HKDF_SALT), shared);
    let mut key = zeroize::Zeroizing::new([0u8; 32]);
    hk.expand(b"token", &mut *key).expect("HKDF expand");
    key
}

pub fn authorization_token(key: &[u8; 32], binding: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts 32-byte keys");
    mac.update(binding);
    hex::encode(mac.finalize().into_bytes())
}

pub fn token_matches(expected: &str, presented: &str) -> bool {
    use subtle::ConstantTimeEq;
    let (Ok(a), Ok(b)) = (hex::decode(expected), hex::decode(presented)) else {
        return false;
    };
    a.len() == b.len() && bool::from(a.ct_eq(&b))
}
