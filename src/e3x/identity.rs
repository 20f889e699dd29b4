//! Local identity: per-cipher-set keys and their opaque local handles.

use std::rc::Rc;

use crate::cipher::{CipherRegistry, CipherSet, KeyPair, LocalHandle};
use crate::core::{CipherError, MeshError};
use crate::hashname::{csid_entries, csid_hex};
use crate::packet::Packet;

/// One loaded cipher-set identity.
pub(crate) struct LocalSlot {
    pub csid: u8,
    pub cs: Rc<dyn CipherSet>,
    pub key: Packet,
    pub handle: LocalHandle,
}

/// The local endpoint identity: every cipher-set key this node holds.
///
/// Created once per endpoint; exchanges borrow it for handshake
/// generation and verification.
pub struct LocalIdentity {
    slots: Vec<LocalSlot>,
}

impl LocalIdentity {
    /// Load an identity from key and secret bundles
    /// (`{"<csid hex>": "<base32>"}` maps). Sets that fail to load are
    /// skipped; at least one must survive.
    pub fn load(
        registry: &CipherRegistry,
        secrets: &Packet,
        keys: &Packet,
    ) -> Result<Self, MeshError> {
        let mut slots = Vec::new();
        for (csid, key_bytes) in csid_entries(keys) {
            let Some(cs) = registry.get(csid) else { continue };
            let Some(secret_bytes) = secrets.get_base32(&csid_hex(csid)) else {
                tracing::debug!(csid = %csid_hex(csid), "key without matching secret, skipping");
                continue;
            };
            let mut key = Packet::new();
            key.set_body(&key_bytes);
            let mut secret = Packet::new();
            secret.set_body(&secret_bytes);
            match cs.local_new(&key, &secret) {
                Ok(handle) => slots.push(LocalSlot { csid, cs, key, handle }),
                Err(err) => {
                    tracing::warn!(csid = %csid_hex(csid), %err, "cipher set failed to load key");
                }
            }
        }
        if slots.is_empty() {
            return Err(MeshError::NoCommonCipherSet);
        }
        slots.sort_by_key(|s| s.csid);
        Ok(Self { slots })
    }

    /// Generate a fresh identity with every installed cipher set; returns
    /// the identity plus the key and secret bundles to persist.
    pub fn generate(registry: &CipherRegistry) -> Result<(Self, Packet, Packet), MeshError> {
        let mut keys = Packet::new();
        let mut secrets = Packet::new();
        let mut slots = Vec::new();
        for cs in registry.iter() {
            let KeyPair { key, secret } = cs.generate()?;
            let hex = csid_hex(cs.csid());
            keys.set_base32(&hex, key.body());
            secrets.set_base32(&hex, secret.body());
            let handle = cs.local_new(&key, &secret)?;
            slots.push(LocalSlot { csid: cs.csid(), cs: cs.clone(), key, handle });
        }
        if slots.is_empty() {
            return Err(MeshError::NoCommonCipherSet);
        }
        Ok((Self { slots }, keys, secrets))
    }

    /// The public key packet for a cipher set.
    pub fn key(&self, csid: u8) -> Option<&Packet> {
        self.slot(csid).map(|s| &s.key)
    }

    /// Cipher-set ids this identity holds, ascending.
    pub fn csids(&self) -> Vec<u8> {
        self.slots.iter().map(|s| s.csid).collect()
    }

    /// The full public key bundle (`{"<csid hex>": "<base32>"}`).
    pub fn keys_packet(&self) -> Packet {
        let mut keys = Packet::new();
        for s in &self.slots {
            keys.set_base32(&csid_hex(s.csid), s.key.body());
        }
        keys
    }

    /// Try to decrypt an inbound handshake message; the cipher set is
    /// picked from the message's `csid` header (or lone binary head byte).
    pub fn decrypt(&self, message: &Packet) -> Result<(Packet, u8), CipherError> {
        let csid = message_csid(message).ok_or(CipherError::UnknownSet(0))?;
        let slot = self
            .slot(csid)
            .ok_or(CipherError::UnknownSet(csid))?;
        let inner = slot.cs.local_decrypt(&slot.handle, message)?;
        Ok((inner, csid))
    }

    /// Sign `data` with the strongest held identity.
    pub fn sign(&self, args: &Packet, data: &[u8]) -> Result<Packet, CipherError> {
        let slot = self.slots.last().ok_or(CipherError::UnknownSet(0))?;
        slot.cs.local_sign(&slot.handle, args, data)
    }

    pub(crate) fn slot(&self, csid: u8) -> Option<&LocalSlot> {
        self.slots.iter().find(|s| s.csid == csid)
    }
}

/// Extract the cipher-set id from a handshake message head.
pub(crate) fn message_csid(message: &Packet) -> Option<u8> {
    if let Some(hex) = message.get("csid") {
        return crate::hashname::csid_from_hex(hex);
    }
    match message.head_bin() {
        Some([csid]) => Some(*csid),
        _ => None,
    }
}
