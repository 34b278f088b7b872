use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Which policy rule a license failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyViolation {
    Expired,
    Exhausted,
    Revoked,
    Unknown,
}

impl PolicyViolation {
    pub fn tag(&self) -> &'static str {
        match self {
            PolicyViolation::Expired => "OVSA_ERR_POLICY_EXPIRED",
            PolicyViolation::Exhausted => "OVSA_ERR_POLICY_EXHAUSTED",
            PolicyViolation::Revoked => "OVSA_ERR_POLICY_REVOKED",
            PolicyViolation::Unknown => "OVSA_ERR_POLICY_UNKNOWN",
        }
    }
}

/// Error taxonomy for the whole toolchain. Messages never contain key
/// material; secret bytes stay out of `Display` output by construction.
#[derive(Debug, Error)]
pub enum OvsaError {
    #[error("OVSA_ERR_INVALID_PARAMETER: {0}")]
    InvalidParameter(String),

    #[error("OVSA_ERR_FILE_IO: {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Non-semantic primitive failure: allocation, slot exhaustion,
    /// algorithm mismatch, malformed key material.
    #[error("OVSA_ERR_CRYPTO: {0}")]
    Crypto(String),

    /// A signature, HMAC, certificate chain, OCSP, TCB or hash check failed.
    #[error("OVSA_ERR_VERIFY: {0}")]
    Verification(String),

    #[error("{}", .0.tag())]
    Policy(PolicyViolation),

    #[error("OVSA_ERR_TRANSIENT: {0}")]
    Transient(String),
}

impl OvsaError {
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OvsaError::FileIo {
            path: path.into(),
            source,
        }
    }

    /// Stable short tag for logs and wire errors.
    pub fn tag(&self) -> &'static str {
        match self {
            OvsaError::InvalidParameter(_) => "OVSA_ERR_INVALID_PARAMETER",
            OvsaError::FileIo { .. } => "OVSA_ERR_FILE_IO",
            OvsaError::Crypto(_) => "OVSA_ERR_CRYPTO",
            OvsaError::Verification(_) => "OVSA_ERR_VERIFY",
            OvsaError::Policy(p) => p.tag(),
            OvsaError::Transient(_) => "OVSA_ERR_TRANSIENT",
        }
    }

    /// Process exit code for the CLI tools.
    pub fn exit_code(&self) -> i32 {
        match self {
            OvsaError::InvalidParameter(_) => 1,
            OvsaError::FileIo { .. } | OvsaError::Transient(_) => 2,
            OvsaError::Crypto(_) => 3,
            OvsaError::Verification(_) => 4,
            OvsaError::Policy(_) => 5,
        }
    }
}

pub type Result<T, E = OvsaError> = std::result::Result<T, E>;
