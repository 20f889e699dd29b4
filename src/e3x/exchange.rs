//! The per-peer cryptographic exchange state machine.
//!
//! An exchange moves through three states:
//!
//! - **Down**: no ephemeral session, `out == 0`.
//! - **Handshake-pending**: a handshake has been generated with a new `out`
//!   sequence but peer traffic hasn't confirmed it yet.
//! - **Up**: a validated ephemeral session exists; channel packets flow.
//!
//! Incoming handshakes are only accepted for a strictly greater `at` than
//! the last accepted one; replays and stale rotations fail `sync` without
//! touching the established session.

use std::rc::Rc;

use sha2::{Digest, Sha256};

use crate::cipher::{CipherSet, EphemeralHandle, RemoteHandle};
use crate::core::{ExchangeError, TOKEN_SIZE};
use crate::e3x::LocalIdentity;
use crate::hashname::{csid_hex, intermediates};
use crate::packet::Packet;

/// Exchange session state between two hashnames for one cipher set.
pub struct Exchange {
    cs: Rc<dyn CipherSet>,
    csid: u8,
    remote: RemoteHandle,
    ephem: Option<EphemeralHandle>,
    token: [u8; TOKEN_SIZE],
    eid: [u8; TOKEN_SIZE],
    at_in: u32,
    at_out: u32,
    cid_next: u32,
    cid_seen: u32,
    order: u8,
}

impl Exchange {
    /// Create an exchange to the peer holding `key` (raw key in the body).
    pub fn new(
        local: &LocalIdentity,
        csid: u8,
        key: &Packet,
    ) -> Result<Self, ExchangeError> {
        let slot = local
            .slot(csid)
            .ok_or(ExchangeError::Cipher(crate::core::CipherError::UnknownSet(csid)))?;
        let cs = slot.cs.clone();
        let remote = cs.remote_new(key)?;

        // Ordering tie-break: the side with the greater key takes the even
        // channel ids and even handshake sequences.
        let order = if slot.key.body() > key.body() { 2 } else { 1 };

        let (lo, hi) = if slot.key.body() <= key.body() {
            (slot.key.body(), key.body())
        } else {
            (key.body(), slot.key.body())
        };
        let mut h = Sha256::new();
        h.update(lo);
        h.update(hi);
        let digest = h.finalize();
        let mut token = [0u8; TOKEN_SIZE];
        token.copy_from_slice(&digest[..TOKEN_SIZE]);

        Ok(Self {
            cs,
            csid,
            remote,
            ephem: None,
            token,
            eid: [0u8; TOKEN_SIZE],
            at_in: 0,
            at_out: 0,
            cid_next: order as u32,
            cid_seen: 0,
            order,
        })
    }

    /// Cipher-set id of this exchange.
    pub fn csid(&self) -> u8 {
        self.csid
    }

    /// The 16-byte routing token shared by both ends of this exchange.
    pub fn token(&self) -> &[u8; TOKEN_SIZE] {
        &self.token
    }

    /// The 16-byte id of the current ephemeral session (zero when down).
    pub fn eid(&self) -> &[u8; TOKEN_SIZE] {
        &self.eid
    }

    /// Last accepted incoming handshake sequence.
    pub fn at_in(&self) -> u32 {
        self.at_in
    }

    /// Current outgoing handshake sequence.
    pub fn at_out(&self) -> u32 {
        self.at_out
    }

    /// True while a validated ephemeral session exists.
    pub fn is_up(&self) -> bool {
        self.ephem.is_some()
    }

    // =========================================================================
    // Handshakes
    // =========================================================================

    /// Generate a handshake, rotating to a fresh outgoing sequence. Safe to
    /// call repeatedly to force rotation. With no `inner` given, the
    /// identity's key bundle (raw key in body, intermediates in the head)
    /// is sent.
    pub fn handshake(
        &mut self,
        inner: Option<Packet>,
        local: &LocalIdentity,
    ) -> Result<Packet, ExchangeError> {
        let at = self.next_out();
        let mut inner = match inner {
            Some(p) => p,
            None => intermediates(&local.keys_packet(), self.csid)
                .ok_or(ExchangeError::MissingHeader("keys"))?,
        };
        inner.set_uint("at", at as u64);

        let slot = local
            .slot(self.csid)
            .ok_or(ExchangeError::Cipher(crate::core::CipherError::UnknownSet(self.csid)))?;
        let mut outer = self.cs.remote_encrypt(&self.remote, &slot.handle, &inner)?;
        outer
            .set("csid", &csid_hex(self.csid))
            .set_uint("at", at as u64);
        self.at_out = at;
        Ok(outer)
    }

    /// Stateless wrap of an arbitrary inner packet to this peer (no
    /// sequence rotation).
    pub fn message(
        &self,
        inner: &Packet,
        local: &LocalIdentity,
    ) -> Result<Packet, ExchangeError> {
        let slot = local
            .slot(self.csid)
            .ok_or(ExchangeError::Cipher(crate::core::CipherError::UnknownSet(self.csid)))?;
        let mut outer = self.cs.remote_encrypt(&self.remote, &slot.handle, inner)?;
        outer.set("csid", &csid_hex(self.csid));
        Ok(outer)
    }

    /// Verify an inbound handshake message came from this peer.
    pub fn verify(&self, outer: &Packet, local: &LocalIdentity) -> Result<(), ExchangeError> {
        let slot = local
            .slot(self.csid)
            .ok_or(ExchangeError::Cipher(crate::core::CipherError::UnknownSet(self.csid)))?;
        self.cs.remote_verify(&self.remote, &slot.handle, outer)?;
        Ok(())
    }

    /// Validate a detached signature from this peer.
    pub fn validate(
        &self,
        args: &Packet,
        sig: &Packet,
        data: &[u8],
    ) -> Result<(), ExchangeError> {
        self.cs.remote_validate(&self.remote, args, sig, data)?;
        Ok(())
    }

    /// Synchronize to an incoming handshake: accept only a strictly newer
    /// sequence, atomically replacing the ephemeral session. A failed sync
    /// leaves the existing session untouched.
    pub fn sync(&mut self, outer: &Packet, local: &LocalIdentity) -> Result<(), ExchangeError> {
        let at = outer
            .get_uint("at")
            .ok_or(ExchangeError::MissingHeader("at"))? as u32;
        if at <= self.at_in {
            return Err(ExchangeError::StaleHandshake { at, accepted: self.at_in });
        }
        self.verify(outer, local)?;
        let ephem = self.cs.ephemeral_new(&self.remote, outer)?;

        self.ephem = Some(ephem);
        self.at_in = at;
        if self.at_out < at {
            // Catch our side up, keeping our sequence parity.
            self.at_out = if at % 2 == (self.order as u32) % 2 { at } else { at + 1 };
        }
        let digest = Sha256::digest(outer.body());
        self.eid.copy_from_slice(&digest[..TOKEN_SIZE]);
        tracing::debug!(at, "exchange synchronized");
        Ok(())
    }

    /// Drop the ephemeral session and reset sequence tracking; the next
    /// inbound handshake resynchronizes from scratch.
    pub fn down(&mut self) {
        self.ephem = None;
        self.at_out = 0;
        self.at_in = 0;
        self.eid = [0u8; TOKEN_SIZE];
    }

    fn next_out(&self) -> u32 {
        let base = self.at_out.max(self.at_in);
        let mut at = base + 1;
        if at % 2 != (self.order as u32) % 2 {
            at += 1;
        }
        at
    }

    // =========================================================================
    // Channel packets
    // =========================================================================

    /// Decrypt an inbound channel packet (headerless, token-prefixed body)
    /// and validate its channel id.
    pub fn receive(&mut self, outer: &Packet) -> Result<Packet, ExchangeError> {
        let ephem = self.ephem.as_mut().ok_or(ExchangeError::Down)?;
        let body = outer.body();
        if body.len() < TOKEN_SIZE || body[..TOKEN_SIZE] != self.token {
            return Err(ExchangeError::Cipher(crate::core::CipherError::DecryptFailed));
        }
        let mut sealed = Packet::new();
        sealed.set_body(&body[TOKEN_SIZE..]);
        let inner = self.cs.ephemeral_decrypt(ephem, &sealed)?;

        if let Some(cid) = inner.get_uint("c") {
            self.cid_validate(cid as u32)?;
        }
        Ok(inner)
    }

    /// Encrypt an outbound channel packet; the result is headerless with
    /// the routing token leading the body.
    pub fn send(&mut self, inner: &Packet) -> Result<Packet, ExchangeError> {
        let ephem = self.ephem.as_mut().ok_or(ExchangeError::Down)?;
        let sealed = self.cs.ephemeral_encrypt(ephem, inner)?;
        let mut body = self.token.to_vec();
        body.extend_from_slice(sealed.body());
        let mut outer = Packet::new();
        outer.set_body(&body);
        Ok(outer)
    }

    /// Allocate the next outgoing channel id.
    pub fn cid(&mut self) -> u32 {
        let id = self.cid_next;
        self.cid_next += 2;
        id
    }

    /// Validate an inbound channel id against the parity split and track
    /// the highest one seen.
    pub fn cid_validate(&mut self, cid: u32) -> Result<(), ExchangeError> {
        if cid == 0 {
            return Err(ExchangeError::InvalidChannelId(cid));
        }
        // Their ids have the opposite parity of ours.
        if cid % 2 == (self.order as u32) % 2 {
            return Err(ExchangeError::InvalidChannelId(cid));
        }
        if cid > self.cid_seen {
            self.cid_seen = cid;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::fake::FakeCs;
    use crate::cipher::CipherRegistry;

    fn endpoints() -> (LocalIdentity, LocalIdentity) {
        let mut reg = CipherRegistry::new();
        reg.install(Rc::new(FakeCs::new(0x3a)));
        let (a, _, _) = LocalIdentity::generate(&reg).unwrap();
        let (b, _, _) = LocalIdentity::generate(&reg).unwrap();
        (a, b)
    }

    fn exchange_pair(a: &LocalIdentity, b: &LocalIdentity) -> (Exchange, Exchange) {
        let xa = Exchange::new(a, 0x3a, b.key(0x3a).unwrap()).unwrap();
        let xb = Exchange::new(b, 0x3a, a.key(0x3a).unwrap()).unwrap();
        (xa, xb)
    }

    #[test]
    fn test_orders_are_complementary() {
        let (a, b) = endpoints();
        let (xa, xb) = exchange_pair(&a, &b);
        assert_ne!(xa.order, xb.order);
        assert_eq!(xa.token(), xb.token());
    }

    #[test]
    fn test_handshake_sync_up() {
        let (a, b) = endpoints();
        let (mut xa, mut xb) = exchange_pair(&a, &b);
        assert!(!xa.is_up());

        let hs_a = xa.handshake(None, &a).unwrap();
        xb.sync(&hs_a, &b).unwrap();
        assert!(xb.is_up());
        assert_eq!(xb.at_in(), xa.at_out());

        let hs_b = xb.handshake(None, &b).unwrap();
        xa.sync(&hs_b, &a).unwrap();
        assert!(xa.is_up());
        assert_ne!(xa.eid(), &[0u8; 16]);
    }

    #[test]
    fn test_replay_rejected_session_kept() {
        let (a, b) = endpoints();
        let (mut xa, mut xb) = exchange_pair(&a, &b);
        let hs1 = xa.handshake(None, &a).unwrap();
        xb.sync(&hs1, &b).unwrap();
        let accepted = xb.at_in();

        // Replaying the same handshake must fail and change nothing.
        let err = xb.sync(&hs1, &b).unwrap_err();
        assert!(matches!(err, ExchangeError::StaleHandshake { .. }));
        assert!(xb.is_up());
        assert_eq!(xb.at_in(), accepted);

        // A newer rotation is accepted.
        let hs2 = xa.handshake(None, &a).unwrap();
        assert!(xa.at_out() > accepted);
        xb.sync(&hs2, &b).unwrap();
        assert_eq!(xb.at_in(), xa.at_out());
    }

    #[test]
    fn test_down_resets_and_resyncs() {
        let (a, b) = endpoints();
        let (mut xa, mut xb) = exchange_pair(&a, &b);
        let hs = xa.handshake(None, &a).unwrap();
        xb.sync(&hs, &b).unwrap();

        xb.down();
        assert!(!xb.is_up());
        assert_eq!(xb.at_in(), 0);
        // The same handshake is acceptable again after the explicit reset.
        xb.sync(&hs, &b).unwrap();
        assert!(xb.is_up());
    }

    #[test]
    fn test_channel_roundtrip_and_down_errors() {
        let (a, b) = endpoints();
        let (mut xa, mut xb) = exchange_pair(&a, &b);

        let mut inner = Packet::new();
        inner.set_uint("c", xa.order as u64).set_body(b"data");
        assert!(matches!(xa.send(&inner), Err(ExchangeError::Down)));

        let hs_a = xa.handshake(None, &a).unwrap();
        let hs_b = xb.handshake(None, &b).unwrap();
        xb.sync(&hs_a, &b).unwrap();
        xa.sync(&hs_b, &a).unwrap();

        let wire = xa.send(&inner).unwrap();
        // Token leads the body for mesh routing.
        assert_eq!(&wire.body()[..16], xa.token());
        let got = xb.receive(&wire).unwrap();
        assert!(inner.equals(&got));
    }

    #[test]
    fn test_cid_parity() {
        let (a, b) = endpoints();
        let (mut xa, mut xb) = exchange_pair(&a, &b);
        let ours = xa.cid();
        let next = xa.cid();
        assert_eq!(next, ours + 2);
        // Our own parity is invalid inbound.
        assert!(xa.cid_validate(ours).is_err());
        // The peer's allocation is valid on our side.
        let theirs = xb.cid();
        xa.cid_validate(theirs).unwrap();
        assert!(xa.cid_validate(0).is_err());
    }

    #[test]
    fn test_wrong_token_rejected() {
        let (a, b) = endpoints();
        let (mut xa, mut xb) = exchange_pair(&a, &b);
        let hs_a = xa.handshake(None, &a).unwrap();
        let hs_b = xb.handshake(None, &b).unwrap();
        xb.sync(&hs_a, &b).unwrap();
        xa.sync(&hs_b, &a).unwrap();

        let mut wire = xa.send(&Packet::new()).unwrap();
        let mut body = wire.body().to_vec();
        body[0] ^= 0xff;
        wire.set_body(&body);
        assert!(xb.receive(&wire).is_err());
    }
}
