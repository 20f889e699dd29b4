//! Cipher set abstraction.
//!
//! A cipher set is a pluggable bundle of concrete cryptographic algorithms
//! identified by a short id (`1a`/`1c`/`2a`/`3a`). The exchange layer never
//! touches raw key bytes; everything goes through the [`CipherSet`]
//! capability trait, so sets are fully swappable and testable via fakes.
//!
//! Each set owns its private state behind opaque [`LocalHandle`],
//! [`RemoteHandle`], and [`EphemeralHandle`] values. Passing a handle to a
//! different set is a local invariant violation surfaced as
//! [`CipherError::WrongHandle`].

use std::any::Any;
use std::rc::Rc;

use crate::core::{CipherError, CS_MAX};
use crate::packet::Packet;

#[cfg(feature = "cs3a")]
pub mod cs3a;

#[cfg(test)]
pub(crate) mod fake;

/// Opaque local-identity key material owned by a cipher set.
pub type LocalHandle = Box<dyn Any>;

/// Opaque remote-identity key material owned by a cipher set.
pub type RemoteHandle = Box<dyn Any>;

/// Opaque ephemeral-session state owned by a cipher set.
pub type EphemeralHandle = Box<dyn Any>;

/// A generated keypair: public key packet and secret key packet, each with
/// the raw material in the body.
pub struct KeyPair {
    /// Public key (body = raw key bytes).
    pub key: Packet,
    /// Secret key (body = raw secret bytes).
    pub secret: Packet,
}

/// The capability table every cipher set implements.
pub trait CipherSet {
    /// Cipher set id byte (e.g. `0x3a`).
    fn csid(&self) -> u8;

    /// Two-character hex form of the id.
    fn hex(&self) -> &'static str;

    /// Human-readable algorithm bundle name.
    fn alg(&self) -> &'static str;

    /// Fill `buf` with cryptographically secure random bytes.
    fn rand(&self, buf: &mut [u8]);

    /// SHA-256.
    fn hash(&self, data: &[u8]) -> [u8; 32];

    /// Generate a fresh keypair.
    fn generate(&self) -> Result<KeyPair, CipherError>;

    /// Build the local identity from key/secret packets.
    fn local_new(&self, key: &Packet, secret: &Packet) -> Result<LocalHandle, CipherError>;

    /// Decrypt an inbound handshake message addressed to this identity,
    /// returning the inner packet.
    fn local_decrypt(&self, local: &LocalHandle, outer: &Packet) -> Result<Packet, CipherError>;

    /// Produce a detached signature over `data`.
    fn local_sign(
        &self,
        local: &LocalHandle,
        args: &Packet,
        data: &[u8],
    ) -> Result<Packet, CipherError>;

    /// Build a remote identity from its public key packet.
    fn remote_new(&self, key: &Packet) -> Result<RemoteHandle, CipherError>;

    /// Verify an inbound handshake message came from this remote identity.
    fn remote_verify(
        &self,
        remote: &RemoteHandle,
        local: &LocalHandle,
        outer: &Packet,
    ) -> Result<(), CipherError>;

    /// Encrypt an inner handshake packet to this remote identity.
    fn remote_encrypt(
        &self,
        remote: &RemoteHandle,
        local: &LocalHandle,
        inner: &Packet,
    ) -> Result<Packet, CipherError>;

    /// Validate a detached signature made by this remote identity.
    fn remote_validate(
        &self,
        remote: &RemoteHandle,
        args: &Packet,
        sig: &Packet,
        data: &[u8],
    ) -> Result<(), CipherError>;

    /// Build the ephemeral session for ongoing channel traffic from a
    /// validated handshake message.
    fn ephemeral_new(
        &self,
        remote: &RemoteHandle,
        outer: &Packet,
    ) -> Result<EphemeralHandle, CipherError>;

    /// Encrypt a channel packet under the ephemeral session.
    fn ephemeral_encrypt(
        &self,
        ephem: &mut EphemeralHandle,
        inner: &Packet,
    ) -> Result<Packet, CipherError>;

    /// Decrypt a channel packet under the ephemeral session.
    fn ephemeral_decrypt(
        &self,
        ephem: &mut EphemeralHandle,
        outer: &Packet,
    ) -> Result<Packet, CipherError>;
}

/// Registry slot order; each id has a fixed slot.
const CSIDS: [u8; CS_MAX] = [0x1a, 0x1c, 0x2a, 0x3a];

/// The fixed registry of up to four cipher-set slots.
///
/// A set that fails to initialize leaves its slot empty: degraded but
/// operational. Owned by the mesh; exchanges keep `Rc` references to the
/// set they selected.
#[derive(Default)]
pub struct CipherRegistry {
    slots: [Option<Rc<dyn CipherSet>>; CS_MAX],
}

impl CipherRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in set installed.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut reg = Self::new();
        #[cfg(feature = "cs3a")]
        reg.install(Rc::new(cs3a::Cs3a::new()));
        reg
    }

    /// Install a cipher set into its slot, replacing any previous one.
    /// Unknown ids are ignored.
    pub fn install(&mut self, set: Rc<dyn CipherSet>) -> &mut Self {
        if let Some(slot) = CSIDS.iter().position(|&id| id == set.csid()) {
            self.slots[slot] = Some(set);
        }
        self
    }

    /// Look up a set by id byte.
    pub fn get(&self, csid: u8) -> Option<Rc<dyn CipherSet>> {
        let slot = CSIDS.iter().position(|&id| id == csid)?;
        self.slots[slot].clone()
    }

    /// Look up a set by its two-character hex id.
    pub fn get_hex(&self, hex: &str) -> Option<Rc<dyn CipherSet>> {
        self.get(crate::hashname::csid_from_hex(hex)?)
    }

    /// Any installed set (for rand/hash utility use).
    pub fn default_set(&self) -> Option<Rc<dyn CipherSet>> {
        self.slots.iter().rev().flatten().next().cloned()
    }

    /// Iterate over the installed sets, lowest id first.
    pub fn iter(&self) -> impl Iterator<Item = &Rc<dyn CipherSet>> {
        self.slots.iter().flatten()
    }

    /// Number of installed sets.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// True when no set is installed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Downcast an opaque handle to a set's concrete type.
pub(crate) fn handle_ref<T: 'static>(handle: &dyn Any) -> Result<&T, CipherError> {
    handle.downcast_ref::<T>().ok_or(CipherError::WrongHandle)
}

/// Downcast an opaque handle mutably.
pub(crate) fn handle_mut<T: 'static>(handle: &mut dyn Any) -> Result<&mut T, CipherError> {
    handle.downcast_mut::<T>().ok_or(CipherError::WrongHandle)
}
