//! Protected-bundle payload types.
//!
//! Bounded strings are validated newtypes: once parsed, downstream code
//! can never observe an over-long model name, description or version.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OvsaError, Result};

pub const MAX_NAME_SIZE: usize = 256;
pub const MAX_VERSION_SIZE: usize = 32;
pub const MAX_FILE_NAME: usize = 4096;

macro_rules! bounded_string {
    ($name:ident, $max:expr, $label:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(try_from = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                if value.is_empty() {
                    return Err(OvsaError::InvalidParameter(format!(
                        "{} must not be empty",
                        $label
                    )));
                }
                if value.len() > $max {
                    return Err(OvsaError::InvalidParameter(format!(
                        "{} exceeds {} bytes",
                        $label, $max
                    )));
                }
                Ok($name(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = OvsaError;
            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

bounded_string!(ModelName, MAX_NAME_SIZE, "model name");
bounded_string!(Description, MAX_NAME_SIZE, "description");
bounded_string!(VersionTag, MAX_VERSION_SIZE, "version");

/// One encrypted model file: AES-256-GCM ciphertext (tag included) under
/// the bundle key with a per-file IV, both base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncModelEntry {
    pub file_name: String,
    pub iv: String,
    pub ciphertext: String,
}

/// The signed payload of a protect file. Field names are the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundlePayload {
    pub model_name: ModelName,
    pub description: Description,
    pub version: VersionTag,
    pub model_guid: Uuid,
    pub isv_certificate: String,
    pub enc_model: Vec<EncModelEntry>,
}
