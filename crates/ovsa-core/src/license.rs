//! Master and customer license payloads and the license policy model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::SignedBlob;
use crate::error::{OvsaError, Result};

pub const MAX_TIME_LIMIT_DAYS: u32 = 3650;
pub const MAX_USAGE_COUNT: u32 = 1_000_000;

/// Usage policy attached to a customer license. Exactly one variant is
/// encoded at issue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LicensePolicy {
    TimeLimit { days: u32 },
    UsageCount { n: u32 },
    Unlimited,
}

impl LicensePolicy {
    pub fn validate(&self) -> Result<()> {
        match self {
            LicensePolicy::TimeLimit { days } => {
                if *days == 0 || *days > MAX_TIME_LIMIT_DAYS {
                    return Err(OvsaError::InvalidParameter(format!(
                        "time limit must be 1..={MAX_TIME_LIMIT_DAYS} days, got {days}"
                    )));
                }
            }
            LicensePolicy::UsageCount { n } => {
                if *n == 0 || *n > MAX_USAGE_COUNT {
                    return Err(OvsaError::InvalidParameter(format!(
                        "usage count must be 1..={MAX_USAGE_COUNT}, got {n}"
                    )));
                }
            }
            LicensePolicy::Unlimited => {}
        }
        Ok(())
    }

    /// Wall-clock expiry for a license created at `creation`, if any.
    pub fn expiry_after(&self, creation: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            LicensePolicy::TimeLimit { days } => Some(creation + Duration::days(i64::from(*days))),
            _ => None,
        }
    }

    /// Initial usage quota, if any.
    pub fn initial_quota(&self) -> Option<u32> {
        match self {
            LicensePolicy::UsageCount { n } => Some(*n),
            _ => None,
        }
    }
}

/// Payload of the issuer-internal master license. Never leaves the
/// issuer; integrity-protected by HMAC rather than a signature, keyed by
/// the MAC half of the self-wrap key derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterLicensePayload {
    pub license_guid: Uuid,
    pub model_guid: Uuid,
    pub model_hash: String,
    pub isv_certificate: String,
    pub encryption_key: String,
    pub creation_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerCertificate {
    pub pem: String,
    pub primary_fingerprint: String,
    pub secondary_fingerprint: String,
}

/// Payload of a signed customer license.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerLicensePayload {
    pub license_guid: Uuid,
    pub model_guid: Uuid,
    pub model_hash: String,
    pub isv_certificate: String,
    pub customer_certificate: CustomerCertificate,
    pub license_config: LicensePolicy,
    pub license_server_url: String,
    pub license_server_cert: String,
    pub tcb: SignedBlob,
    pub encryption_key: String,
    pub creation_date: DateTime<Utc>,
}

/// Configuration consumed by `sale`, produced by `licgen`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseConfig {
    pub license_policy: LicensePolicy,
    pub license_server_url: String,
    pub license_server_cert: String,
}

impl LicenseConfig {
    pub fn validate(&self) -> Result<()> {
        self.license_policy.validate()?;
        let (host, port) = self
            .license_server_url
            .rsplit_once(':')
            .ok_or_else(|| OvsaError::InvalidParameter("license server URL must be host:port".into()))?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(OvsaError::InvalidParameter(format!(
                "malformed license server URL `{}`",
                self.license_server_url
            )));
        }
        crate::certs::structural_check(&self.license_server_cert)
    }
}
