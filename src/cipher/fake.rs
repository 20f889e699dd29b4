//! Deterministic fake cipher set for tests.
//!
//! Implements the full capability contract with honest framing but no real
//! cryptography: handshake "encryption" prepends the sender's public key
//! and XORs the payload, the ephemeral session XORs with a fixed pad.
//! Verification checks the identity binding, so wrong-peer and corrupted
//! messages still fail the way real sets fail.

use std::cell::Cell;

use sha2::{Digest, Sha256};

use super::{handle_mut, handle_ref, CipherSet, EphemeralHandle, KeyPair, LocalHandle, RemoteHandle};
use crate::core::CipherError;
use crate::packet::Packet;

const PAD: u8 = 0x5a;

pub struct FakeLocal {
    pub key: Vec<u8>,
}

pub struct FakeRemote {
    pub key: Vec<u8>,
}

pub struct FakeEphemeral {
    seq: u32,
}

pub struct FakeCs {
    csid: u8,
    counter: Cell<u8>,
}

impl FakeCs {
    pub fn new(csid: u8) -> Self {
        Self { csid, counter: Cell::new(0) }
    }
}

fn xor_pad(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ PAD).collect()
}

impl CipherSet for FakeCs {
    fn csid(&self) -> u8 {
        self.csid
    }

    fn hex(&self) -> &'static str {
        "fa"
    }

    fn alg(&self) -> &'static str {
        "fake"
    }

    fn rand(&self, buf: &mut [u8]) {
        // Deterministic on purpose.
        let c = self.counter.get().wrapping_add(1);
        self.counter.set(c);
        for (i, b) in buf.iter_mut().enumerate() {
            *b = c.wrapping_add(i as u8);
        }
    }

    fn hash(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    fn generate(&self) -> Result<KeyPair, CipherError> {
        let mut raw = [0u8; 32];
        self.rand(&mut raw);
        let mut key = Packet::new();
        key.set_body(&raw);
        let mut secret = Packet::new();
        secret.set_body(&raw);
        Ok(KeyPair { key, secret })
    }

    fn local_new(&self, key: &Packet, secret: &Packet) -> Result<LocalHandle, CipherError> {
        if key.body().is_empty() || secret.body().is_empty() {
            return Err(CipherError::InvalidKey("empty fake key".into()));
        }
        Ok(Box::new(FakeLocal { key: key.body().to_vec() }))
    }

    fn local_decrypt(&self, local: &LocalHandle, outer: &Packet) -> Result<Packet, CipherError> {
        let _local = handle_ref::<FakeLocal>(local.as_ref())?;
        let body = outer.body();
        if body.len() < 32 {
            return Err(CipherError::DecryptFailed);
        }
        let inner_raw = xor_pad(&body[32..]);
        Packet::parse(&inner_raw).map_err(|_| CipherError::DecryptFailed)
    }

    fn local_sign(
        &self,
        local: &LocalHandle,
        _args: &Packet,
        data: &[u8],
    ) -> Result<Packet, CipherError> {
        let local = handle_ref::<FakeLocal>(local.as_ref())?;
        let mut h = Sha256::new();
        h.update(&local.key);
        h.update(data);
        let mut sig = Packet::new();
        sig.set_body(&h.finalize());
        Ok(sig)
    }

    fn remote_new(&self, key: &Packet) -> Result<RemoteHandle, CipherError> {
        if key.body().is_empty() {
            return Err(CipherError::InvalidKey("empty fake key".into()));
        }
        Ok(Box::new(FakeRemote { key: key.body().to_vec() }))
    }

    fn remote_verify(
        &self,
        remote: &RemoteHandle,
        _local: &LocalHandle,
        outer: &Packet,
    ) -> Result<(), CipherError> {
        let remote = handle_ref::<FakeRemote>(remote.as_ref())?;
        let body = outer.body();
        if body.len() < 32 || body[..32] != remote.key[..] {
            return Err(CipherError::VerifyFailed);
        }
        Ok(())
    }

    fn remote_encrypt(
        &self,
        _remote: &RemoteHandle,
        local: &LocalHandle,
        inner: &Packet,
    ) -> Result<Packet, CipherError> {
        let local = handle_ref::<FakeLocal>(local.as_ref())?;
        let mut body = local.key.clone();
        body.extend_from_slice(&xor_pad(&inner.encode()));
        let mut outer = Packet::new();
        outer.set_body(&body);
        Ok(outer)
    }

    fn remote_validate(
        &self,
        remote: &RemoteHandle,
        _args: &Packet,
        sig: &Packet,
        data: &[u8],
    ) -> Result<(), CipherError> {
        let remote = handle_ref::<FakeRemote>(remote.as_ref())?;
        let mut h = Sha256::new();
        h.update(&remote.key);
        h.update(data);
        if sig.body() == &h.finalize()[..] {
            Ok(())
        } else {
            Err(CipherError::SignatureInvalid)
        }
    }

    fn ephemeral_new(
        &self,
        _remote: &RemoteHandle,
        outer: &Packet,
    ) -> Result<EphemeralHandle, CipherError> {
        if outer.body().len() < 32 {
            return Err(CipherError::VerifyFailed);
        }
        Ok(Box::new(FakeEphemeral { seq: 0 }))
    }

    fn ephemeral_encrypt(
        &self,
        ephem: &mut EphemeralHandle,
        inner: &Packet,
    ) -> Result<Packet, CipherError> {
        let ephem = handle_mut::<FakeEphemeral>(ephem.as_mut())?;
        ephem.seq += 1;
        let mut body = ephem.seq.to_be_bytes().to_vec();
        body.extend_from_slice(&xor_pad(&inner.encode()));
        let mut outer = Packet::new();
        outer.set_body(&body);
        Ok(outer)
    }

    fn ephemeral_decrypt(
        &self,
        ephem: &mut EphemeralHandle,
        outer: &Packet,
    ) -> Result<Packet, CipherError> {
        let _ephem = handle_mut::<FakeEphemeral>(ephem.as_mut())?;
        let body = outer.body();
        if body.len() < 4 {
            return Err(CipherError::DecryptFailed);
        }
        Packet::parse(&xor_pad(&body[4..])).map_err(|_| CipherError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_handshake_roundtrip() {
        let cs = FakeCs::new(0x1a);
        let a = cs.generate().unwrap();
        let b = cs.generate().unwrap();
        let a_local = cs.local_new(&a.key, &a.secret).unwrap();
        let b_local = cs.local_new(&b.key, &b.secret).unwrap();
        let b_remote_of_a = cs.remote_new(&b.key).unwrap();
        let a_remote_of_b = cs.remote_new(&a.key).unwrap();

        let mut inner = Packet::new();
        inner.set_int("at", 1).set_body(b"keydata");
        let outer = cs.remote_encrypt(&b_remote_of_a, &a_local, &inner).unwrap();

        // B verifies it came from A and decrypts.
        cs.remote_verify(&a_remote_of_b, &b_local, &outer).unwrap();
        let opened = cs.local_decrypt(&b_local, &outer).unwrap();
        assert_eq!(opened.get_int("at"), Some(1));
        assert_eq!(opened.body(), b"keydata");
    }

    #[test]
    fn test_fake_verify_rejects_wrong_sender() {
        let cs = FakeCs::new(0x1a);
        let a = cs.generate().unwrap();
        let b = cs.generate().unwrap();
        let c = cs.generate().unwrap();
        let a_local = cs.local_new(&a.key, &a.secret).unwrap();
        let b_local = cs.local_new(&b.key, &b.secret).unwrap();
        let b_remote = cs.remote_new(&b.key).unwrap();
        // B expects messages from C, not A.
        let c_remote = cs.remote_new(&c.key).unwrap();

        let inner = Packet::new();
        let outer = cs.remote_encrypt(&b_remote, &a_local, &inner).unwrap();
        assert!(cs.remote_verify(&c_remote, &b_local, &outer).is_err());
    }

    #[test]
    fn test_fake_ephemeral_roundtrip() {
        let cs = FakeCs::new(0x1a);
        let kp = cs.generate().unwrap();
        let remote = cs.remote_new(&kp.key).unwrap();
        let mut hs = Packet::new();
        hs.set_body(&[7u8; 40]);
        let mut tx = cs.ephemeral_new(&remote, &hs).unwrap();
        let mut rx = cs.ephemeral_new(&remote, &hs).unwrap();

        let mut inner = Packet::new();
        inner.set_int("c", 1).set_body(b"chan data");
        let outer = cs.ephemeral_encrypt(&mut tx, &inner).unwrap();
        let opened = cs.ephemeral_decrypt(&mut rx, &outer).unwrap();
        assert!(inner.equals(&opened));
    }

    #[test]
    fn test_fake_sign_validate() {
        let cs = FakeCs::new(0x1a);
        let kp = cs.generate().unwrap();
        let local = cs.local_new(&kp.key, &kp.secret).unwrap();
        let remote = cs.remote_new(&kp.key).unwrap();
        let args = Packet::new();
        let sig = cs.local_sign(&local, &args, b"payload").unwrap();
        cs.remote_validate(&remote, &args, &sig, b"payload").unwrap();
        assert!(cs.remote_validate(&remote, &args, &sig, b"tampered").is_err());
    }
}
