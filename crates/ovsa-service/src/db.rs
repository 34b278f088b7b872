//! File-backed license store.
//!
//! One row per issued customer license. Ingestion verifies the license
//! signature before extracting fingerprints and policy; usage-count
//! consumption runs inside an immediate transaction so two concurrent
//! validations of the same license serialize on the row.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ovsa_core::certs;
use ovsa_core::crypto;
use ovsa_core::envelope::SignedBlob;
use ovsa_core::error::{OvsaError, PolicyViolation, Result};
use ovsa_core::license::{CustomerLicensePayload, LicensePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Active,
    Exhausted,
    Expired,
    Revoked,
}

impl LicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseStatus::Active => "active",
            LicenseStatus::Exhausted => "exhausted",
            LicenseStatus::Expired => "expired",
            LicenseStatus::Revoked => "revoked",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(LicenseStatus::Active),
            "exhausted" => Ok(LicenseStatus::Exhausted),
            "expired" => Ok(LicenseStatus::Expired),
            "revoked" => Ok(LicenseStatus::Revoked),
            other => Err(OvsaError::Crypto(format!("corrupt status `{other}`"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LicenseRow {
    pub license_guid: Uuid,
    pub customer_primary_fingerprint: String,
    pub customer_secondary_fingerprint: String,
    pub license_policy: LicensePolicy,
    pub tcb_signature: SignedBlob,
    pub model_guid: Uuid,
    pub model_hash: String,
    pub remaining_quota: Option<i64>,
    pub expiry: Option<DateTime<Utc>>,
    pub status: LicenseStatus,
}

impl LicenseRow {
    /// Policy gate for a validation happening `now`. Read-only: an
    /// expired or exhausted observation never writes the row here.
    pub fn check_policy(&self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            LicenseStatus::Active => {}
            LicenseStatus::Exhausted => {
                return Err(OvsaError::Policy(PolicyViolation::Exhausted))
            }
            LicenseStatus::Expired => return Err(OvsaError::Policy(PolicyViolation::Expired)),
            LicenseStatus::Revoked => return Err(OvsaError::Policy(PolicyViolation::Revoked)),
        }
        if let Some(expiry) = self.expiry {
            if now > expiry {
                return Err(OvsaError::Policy(PolicyViolation::Expired));
            }
        }
        if let Some(quota) = self.remaining_quota {
            if quota <= 0 {
                return Err(OvsaError::Policy(PolicyViolation::Exhausted));
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct LicenseDb {
    path: PathBuf,
}

fn db_err(e: rusqlite::Error) -> OvsaError {
    OvsaError::Transient(format!("license database: {e}"))
}

impl LicenseDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = LicenseDb {
            path: path.to_path_buf(),
        };
        let conn = db.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS licenses (
                license_guid TEXT PRIMARY KEY,
                customer_primary_fingerprint TEXT NOT NULL,
                customer_secondary_fingerprint TEXT NOT NULL,
                license_policy TEXT NOT NULL,
                tcb_signature TEXT NOT NULL,
                model_guid TEXT NOT NULL,
                model_hash TEXT NOT NULL,
                remaining_quota INTEGER,
                expiry TEXT,
                status TEXT NOT NULL
            )",
        )
        .map_err(db_err)?;
        Ok(db)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .map_err(|e| OvsaError::file_io(&self.path, std::io::Error::other(e)))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        // Durability: committed transactions are synced to disk.
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))
            .map_err(db_err)?;
        conn.execute_batch("PRAGMA synchronous=FULL;").map_err(db_err)?;
        Ok(conn)
    }

    /// Admin ingestion: verify the license signature, cross-check the
    /// supplied customer certificate when given, then insert the row as
    /// `active`. Duplicate GUIDs are rejected.
    pub fn ingest(
        &self,
        license: &SignedBlob,
        customer_cert_pem: Option<&str>,
    ) -> Result<Uuid> {
        let payload: CustomerLicensePayload = license.payload_as()?;
        crypto::verify_blob(&payload.isv_certificate, license)?;
        payload.license_config.validate()?;
        if let Some(pem) = customer_cert_pem {
            if certs::spki_fingerprint_pem(pem)? != payload.customer_certificate.primary_fingerprint
            {
                return Err(OvsaError::Verification(
                    "supplied customer certificate does not match the license".into(),
                ));
            }
        }

        let remaining = payload.license_config.initial_quota().map(i64::from);
        let expiry = payload
            .license_config
            .expiry_after(payload.creation_date)
            .map(|t| t.to_rfc3339());
        let policy_json = serde_json::to_string(&payload.license_config)
            .map_err(|e| OvsaError::InvalidParameter(format!("policy serialize: {e}")))?;
        let tcb_json = serde_json::to_string(&payload.tcb)
            .map_err(|e| OvsaError::InvalidParameter(format!("tcb serialize: {e}")))?;

        let conn = self.connect()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO licenses (
                    license_guid, customer_primary_fingerprint,
                    customer_secondary_fingerprint, license_policy,
                    tcb_signature, model_guid, model_hash,
                    remaining_quota, expiry, status
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'active')",
                params![
                    payload.license_guid.to_string(),
                    payload.customer_certificate.primary_fingerprint,
                    payload.customer_certificate.secondary_fingerprint,
                    policy_json,
                    tcb_json,
                    payload.model_guid.to_string(),
                    payload.model_hash,
                    remaining,
                    expiry,
                ],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            return Err(OvsaError::InvalidParameter(format!(
                "license {} already ingested",
                payload.license_guid
            )));
        }
        Ok(payload.license_guid)
    }

    pub fn fetch(&self, guid: &Uuid) -> Result<Option<LicenseRow>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT license_guid, customer_primary_fingerprint,
                    customer_secondary_fingerprint, license_policy,
                    tcb_signature, model_guid, model_hash,
                    remaining_quota, expiry, status
             FROM licenses WHERE license_guid = ?1",
            params![guid.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, String>(9)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?
        .map(
            |(guid, pfp, sfp, policy, tcb, model_guid, model_hash, quota, expiry, status)| -> Result<LicenseRow> {
                Ok(LicenseRow {
                    license_guid: guid
                        .parse()
                        .map_err(|_| OvsaError::Crypto("corrupt license guid".into()))?,
                    customer_primary_fingerprint: pfp,
                    customer_secondary_fingerprint: sfp,
                    license_policy: serde_json::from_str(&policy)
                        .map_err(|e| OvsaError::Crypto(format!("corrupt policy: {e}")))?,
                    tcb_signature: serde_json::from_str(&tcb)
                        .map_err(|e| OvsaError::Crypto(format!("corrupt tcb blob: {e}")))?,
                    model_guid: model_guid
                        .parse()
                        .map_err(|_| OvsaError::Crypto("corrupt model guid".into()))?,
                    model_hash,
                    remaining_quota: quota,
                    expiry: expiry
                        .map(|e| {
                            DateTime::parse_from_rfc3339(&e)
                                .map(|t| t.with_timezone(&Utc))
                                .map_err(|_| OvsaError::Crypto("corrupt expiry".into()))
                        })
                        .transpose()?,
                    status: LicenseStatus::parse(&status)?,
                })
            },
        )
        .transpose()
    }

    /// Step 6 of the validation algorithm: consume one use atomically.
    /// Licenses without a usage policy pass through untouched. The last
    /// use flips the row to `exhausted`; a concurrent loser sees that
    /// state inside its own transaction and fails without mutating.
    pub fn consume_usage(&self, guid: &Uuid) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let row: Option<(Option<i64>, String)> = tx
            .query_row(
                "SELECT remaining_quota, status FROM licenses WHERE license_guid = ?1",
                params![guid.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        let (quota, status) = row.ok_or(OvsaError::Policy(PolicyViolation::Unknown))?;
        match LicenseStatus::parse(&status)? {
            LicenseStatus::Active => {}
            LicenseStatus::Exhausted => return Err(OvsaError::Policy(PolicyViolation::Exhausted)),
            LicenseStatus::Expired => return Err(OvsaError::Policy(PolicyViolation::Expired)),
            LicenseStatus::Revoked => return Err(OvsaError::Policy(PolicyViolation::Revoked)),
        }
        let Some(quota) = quota else {
            return Ok(());
        };
        if quota <= 0 {
            return Err(OvsaError::Policy(PolicyViolation::Exhausted));
        }
        let next = quota - 1;
        let next_status = if next == 0 { "exhausted" } else { "active" };
        tx.execute(
            "UPDATE licenses SET remaining_quota = ?2, status = ?3 WHERE license_guid = ?1",
            params![guid.to_string(), next, next_status],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    /// Admin operation; terminal.
    pub fn revoke(&self, guid: &Uuid) -> Result<()> {
        let conn = self.connect()?;
        let updated = conn
            .execute(
                "UPDATE licenses SET status = 'revoked' WHERE license_guid = ?1",
                params![guid.to_string()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(OvsaError::Policy(PolicyViolation::Unknown));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn row(policy: LicensePolicy, quota: Option<i64>, expiry: Option<DateTime<Utc>>) -> LicenseRow {
        LicenseRow {
            license_guid: Uuid::new_v4(),
            customer_primary_fingerprint: "fp".into(),
            customer_secondary_fingerprint: String::new(),
            license_policy: policy,
            tcb_signature: SignedBlob {
                payload: serde_json::json!({}),
                signature: String::new(),
            },
            model_guid: Uuid::new_v4(),
            model_hash: "hash".into(),
            remaining_quota: quota,
            expiry,
            status: LicenseStatus::Active,
        }
    }

    #[test]
    fn time_limit_boundary_is_exact() {
        let now = Utc::now();
        let r = row(
            LicensePolicy::TimeLimit { days: 30 },
            None,
            Some(now + Duration::seconds(1)),
        );
        assert!(r.check_policy(now).is_ok());

        let r = row(
            LicensePolicy::TimeLimit { days: 30 },
            None,
            Some(now - Duration::seconds(1)),
        );
        let err = r.check_policy(now).unwrap_err();
        assert!(matches!(
            err,
            OvsaError::Policy(PolicyViolation::Expired)
        ));
    }

    #[test]
    fn terminal_states_absorb() {
        let now = Utc::now();
        for (status, violation) in [
            (LicenseStatus::Exhausted, PolicyViolation::Exhausted),
            (LicenseStatus::Expired, PolicyViolation::Expired),
            (LicenseStatus::Revoked, PolicyViolation::Revoked),
        ] {
            let mut r = row(LicensePolicy::Unlimited, None, None);
            r.status = status;
            let err = r.check_policy(now).unwrap_err();
            assert!(matches!(err, OvsaError::Policy(v) if v == violation));
        }
    }

    #[test]
    fn zero_quota_is_exhausted() {
        let now = Utc::now();
        let r = row(LicensePolicy::UsageCount { n: 1 }, Some(0), None);
        assert!(matches!(
            r.check_policy(now).unwrap_err(),
            OvsaError::Policy(PolicyViolation::Exhausted)
        ));
    }
}
