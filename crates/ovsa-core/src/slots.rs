//! Process-local key slot table.
//!
//! Loaded cryptographic material is addressed through small opaque slot
//! ids rather than passed around by value. Slot ids are allocated from
//! `[MIN_KEY_SLOT, MAX_KEY_SLOT)` and never recycled within a table's
//! lifetime; clearing a slot (or dropping the table) zeroizes its material.

use std::collections::HashMap;

use secrecy::Secret;

use crate::crypto::KeypairMaterial;
use crate::error::{OvsaError, Result};

pub const MIN_KEY_SLOT: u16 = 1;
pub const MAX_KEY_SLOT: u16 = 64;

/// Opaque handle to a loaded key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u16);

impl SlotId {
    pub fn index(self) -> u16 {
        self.0
    }
}

/// An asymmetric slot carries the keypair together with the certificate
/// attached to it in the keystore.
pub struct AsymmetricSlot {
    pub keypair: KeypairMaterial,
    pub certificate_pem: String,
}

pub enum SlotMaterial {
    Asymmetric(AsymmetricSlot),
    Symmetric(Secret<[u8; 32]>),
    Hmac(Secret<[u8; 32]>),
    IvHmac {
        iv: [u8; 12],
        mac_key: Secret<[u8; 32]>,
    },
}

impl SlotMaterial {
    fn kind(&self) -> &'static str {
        match self {
            SlotMaterial::Asymmetric(_) => "asymmetric",
            SlotMaterial::Symmetric(_) => "symmetric",
            SlotMaterial::Hmac(_) => "hmac",
            SlotMaterial::IvHmac { .. } => "iv+hmac",
        }
    }
}

pub struct SlotTable {
    next: u16,
    slots: HashMap<u16, SlotMaterial>,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotTable {
    pub fn new() -> Self {
        SlotTable {
            next: MIN_KEY_SLOT,
            slots: HashMap::new(),
        }
    }

    fn alloc(&mut self, material: SlotMaterial) -> Result<SlotId> {
        if self.next >= MAX_KEY_SLOT {
            return Err(OvsaError::Crypto("key slot table exhausted".into()));
        }
        let id = self.next;
        // Ids are never reused, even after a clear.
        self.next += 1;
        self.slots.insert(id, material);
        Ok(SlotId(id))
    }

    pub fn insert_asymmetric(&mut self, keypair: KeypairMaterial, certificate_pem: String) -> Result<SlotId> {
        self.alloc(SlotMaterial::Asymmetric(AsymmetricSlot {
            keypair,
            certificate_pem,
        }))
    }

    pub fn insert_symmetric(&mut self, key: [u8; 32]) -> Result<SlotId> {
        self.alloc(SlotMaterial::Symmetric(Secret::new(key)))
    }

    pub fn insert_hmac(&mut self, key: [u8; 32]) -> Result<SlotId> {
        self.alloc(SlotMaterial::Hmac(Secret::new(key)))
    }

    pub fn insert_iv_hmac(&mut self, iv: [u8; 12], mac_key: [u8; 32]) -> Result<SlotId> {
        self.alloc(SlotMaterial::IvHmac {
            iv,
            mac_key: Secret::new(mac_key),
        })
    }

    fn get(&self, id: SlotId) -> Result<&SlotMaterial> {
        if !(MIN_KEY_SLOT..MAX_KEY_SLOT).contains(&id.0) {
            return Err(OvsaError::Crypto(format!("slot id {} out of range", id.0)));
        }
        self.slots
            .get(&id.0)
            .ok_or_else(|| OvsaError::Crypto(format!("slot {} is empty", id.0)))
    }

    pub fn asymmetric(&self, id: SlotId) -> Result<&AsymmetricSlot> {
        match self.get(id)? {
            SlotMaterial::Asymmetric(a) => Ok(a),
            other => Err(wrong_kind(id, "asymmetric", other)),
        }
    }

    pub fn symmetric(&self, id: SlotId) -> Result<&Secret<[u8; 32]>> {
        match self.get(id)? {
            SlotMaterial::Symmetric(k) => Ok(k),
            other => Err(wrong_kind(id, "symmetric", other)),
        }
    }

    pub fn hmac(&self, id: SlotId) -> Result<&Secret<[u8; 32]>> {
        match self.get(id)? {
            SlotMaterial::Hmac(k) => Ok(k),
            other => Err(wrong_kind(id, "hmac", other)),
        }
    }

    pub fn iv_hmac(&self, id: SlotId) -> Result<(&[u8; 12], &Secret<[u8; 32]>)> {
        match self.get(id)? {
            SlotMaterial::IvHmac { iv, mac_key } => Ok((iv, mac_key)),
            other => Err(wrong_kind(id, "iv+hmac", other)),
        }
    }

    /// Drop the slot's material. `Secret` wrappers zeroize on drop.
    pub fn clear(&mut self, id: SlotId) {
        self.slots.remove(&id.0);
    }

    pub fn clear_all(&mut self) {
        self.slots.clear();
    }

    pub fn occupied(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for SlotTable {
    fn drop(&mut self) {
        self.clear_all();
    }
}

fn wrong_kind(id: SlotId, wanted: &str, got: &SlotMaterial) -> OvsaError {
    OvsaError::Crypto(format!(
        "wrong slot: slot {} holds {} material, {} required",
        id.index(),
        got.kind(),
        wanted
    ))
}
