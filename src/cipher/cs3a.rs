//! CS3a: the built-in software cipher set.
//!
//! X25519 for static and ephemeral agreement, ChaCha20-Poly1305 for AEAD,
//! HKDF-SHA256 for key derivation.
//!
//! Handshake message layout (outer body):
//! ```text
//! +------------------+---------------------+------------------+
//! | Ephemeral Key    | Sealed Inner        | Identity Tag     |
//! | 32 bytes         | n + 16 bytes        | 16 bytes         |
//! +------------------+---------------------+------------------+
//! ```
//!
//! The sealed inner is AEAD under `HKDF(DH(eph, remote_static))`, so only
//! the addressed identity can open it. The trailing tag is an AEAD-as-MAC
//! under `HKDF(DH(local_static, remote_static))` over the rest of the
//! message, binding the sender's long-term identity.
//!
//! Channel packets run under the ephemeral session: per-direction
//! ChaCha20-Poly1305 keys from `HKDF(DH(eph_a, eph_b))`, 64-bit counter
//! nonces, `[counter LE64][ciphertext]` bodies.

use std::cell::RefCell;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::{handle_mut, handle_ref, CipherSet, EphemeralHandle, KeyPair, LocalHandle, RemoteHandle};
use crate::core::CipherError;
use crate::packet::Packet;

const KEY_SIZE: usize = 32;
const TAG_SIZE: usize = 16;
const SEQ_SIZE: usize = 8;

/// Local identity key material. The secret is zeroized on drop.
pub struct Cs3aLocal {
    secret: [u8; KEY_SIZE],
    public: [u8; KEY_SIZE],
}

impl Drop for Cs3aLocal {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

struct EphPair {
    secret: StaticSecret,
    public: [u8; KEY_SIZE],
}

/// Remote identity: the peer's static public key plus our current outgoing
/// ephemeral, generated on first use and shared between the handshake we
/// send and the session that a validated reply establishes.
pub struct Cs3aRemote {
    public: [u8; KEY_SIZE],
    eph: RefCell<Option<EphPair>>,
}

/// Ephemeral session: per-direction keys and counters.
pub struct Cs3aEphemeral {
    tx_key: [u8; KEY_SIZE],
    rx_key: [u8; KEY_SIZE],
    tx_seq: u64,
    rx_seq: u64,
}

impl Drop for Cs3aEphemeral {
    fn drop(&mut self) {
        self.tx_key.zeroize();
        self.rx_key.zeroize();
    }
}

/// The CS3a cipher set.
#[derive(Default)]
pub struct Cs3a;

impl Cs3a {
    /// Create the set.
    pub fn new() -> Self {
        Self
    }
}

fn hkdf_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; KEY_SIZE], CipherError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(info, &mut okm)
        .map_err(|_| CipherError::EncryptFailed)?;
    Ok(okm)
}

fn aead(key: &[u8; KEY_SIZE]) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key))
}

fn seq_nonce(seq: u64) -> Nonce {
    let mut n = [0u8; 12];
    n[..SEQ_SIZE].copy_from_slice(&seq.to_le_bytes());
    Nonce::from(n)
}

fn pub_from(bytes: &[u8]) -> Result<PublicKey, CipherError> {
    let arr: [u8; KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| CipherError::InvalidKey("bad x25519 key length".into()))?;
    Ok(PublicKey::from(arr))
}

/// The identity tag: AEAD over empty plaintext with the message as AAD.
fn identity_tag(auth_key: &[u8; KEY_SIZE], msg: &[u8]) -> Result<Vec<u8>, CipherError> {
    aead(auth_key)
        .encrypt(&seq_nonce(0), Payload { msg: b"", aad: msg })
        .map_err(|_| CipherError::EncryptFailed)
}

impl Cs3aRemote {
    /// Our current ephemeral for this pairing, generating one if needed.
    fn eph_public(&self) -> [u8; KEY_SIZE] {
        let mut slot = self.eph.borrow_mut();
        let pair = slot.get_or_insert_with(|| {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&secret).to_bytes();
            EphPair { secret, public }
        });
        pair.public
    }

    fn eph_dh(&self, their_pub: &PublicKey) -> Option<([u8; KEY_SIZE], [u8; KEY_SIZE])> {
        let slot = self.eph.borrow();
        let pair = slot.as_ref()?;
        Some((pair.secret.diffie_hellman(their_pub).to_bytes(), pair.public))
    }
}

impl CipherSet for Cs3a {
    fn csid(&self) -> u8 {
        0x3a
    }

    fn hex(&self) -> &'static str {
        "3a"
    }

    fn alg(&self) -> &'static str {
        "x25519-chacha20poly1305-hkdf-sha256"
    }

    fn rand(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }

    fn hash(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    fn generate(&self) -> Result<KeyPair, CipherError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let mut key = Packet::new();
        key.set_body(public.as_bytes());
        let mut sk = Packet::new();
        sk.set_body(secret.as_bytes());
        Ok(KeyPair { key, secret: sk })
    }

    fn local_new(&self, key: &Packet, secret: &Packet) -> Result<LocalHandle, CipherError> {
        let public: [u8; KEY_SIZE] = key
            .body()
            .try_into()
            .map_err(|_| CipherError::InvalidKey("bad public key length".into()))?;
        let sk: [u8; KEY_SIZE] = secret
            .body()
            .try_into()
            .map_err(|_| CipherError::InvalidKey("bad secret key length".into()))?;
        Ok(Box::new(Cs3aLocal { secret: sk, public }))
    }

    fn local_decrypt(&self, local: &LocalHandle, outer: &Packet) -> Result<Packet, CipherError> {
        let local = handle_ref::<Cs3aLocal>(local.as_ref())?;
        let body = outer.body();
        if body.len() < KEY_SIZE + TAG_SIZE + TAG_SIZE {
            return Err(CipherError::DecryptFailed);
        }
        let eph_pub = &body[..KEY_SIZE];
        let sealed = &body[KEY_SIZE..body.len() - TAG_SIZE];

        let secret = StaticSecret::from(local.secret);
        let shared = secret.diffie_hellman(&pub_from(eph_pub)?);
        let mut salt = eph_pub.to_vec();
        salt.extend_from_slice(&local.public);
        let msg_key = hkdf_key(shared.as_bytes(), &salt, b"cs3a msg")?;

        let inner_raw = aead(&msg_key)
            .decrypt(&seq_nonce(0), Payload { msg: sealed, aad: eph_pub })
            .map_err(|_| CipherError::DecryptFailed)?;
        Packet::parse(&inner_raw).map_err(|_| CipherError::DecryptFailed)
    }

    fn local_sign(
        &self,
        local: &LocalHandle,
        _args: &Packet,
        _data: &[u8],
    ) -> Result<Packet, CipherError> {
        // x25519 is agreement-only; this set carries no signature scheme.
        let _ = handle_ref::<Cs3aLocal>(local.as_ref())?;
        Err(CipherError::SignatureInvalid)
    }

    fn remote_new(&self, key: &Packet) -> Result<RemoteHandle, CipherError> {
        let public: [u8; KEY_SIZE] = key
            .body()
            .try_into()
            .map_err(|_| CipherError::InvalidKey("bad public key length".into()))?;
        Ok(Box::new(Cs3aRemote { public, eph: RefCell::new(None) }))
    }

    fn remote_verify(
        &self,
        remote: &RemoteHandle,
        local: &LocalHandle,
        outer: &Packet,
    ) -> Result<(), CipherError> {
        let remote = handle_ref::<Cs3aRemote>(remote.as_ref())?;
        let local = handle_ref::<Cs3aLocal>(local.as_ref())?;
        let body = outer.body();
        if body.len() < KEY_SIZE + TAG_SIZE + TAG_SIZE {
            return Err(CipherError::VerifyFailed);
        }
        let (msg, tag) = body.split_at(body.len() - TAG_SIZE);

        let secret = StaticSecret::from(local.secret);
        let shared = secret.diffie_hellman(&PublicKey::from(remote.public));
        let auth_key = hkdf_key(shared.as_bytes(), &remote.public, b"cs3a auth")?;

        let expected = identity_tag(&auth_key, msg)?;
        if expected == tag {
            Ok(())
        } else {
            Err(CipherError::VerifyFailed)
        }
    }

    fn remote_encrypt(
        &self,
        remote: &RemoteHandle,
        local: &LocalHandle,
        inner: &Packet,
    ) -> Result<Packet, CipherError> {
        let remote = handle_ref::<Cs3aRemote>(remote.as_ref())?;
        let local = handle_ref::<Cs3aLocal>(local.as_ref())?;
        let eph_pub = remote.eph_public();
        let remote_pub = PublicKey::from(remote.public);
        let (eph_shared, _) = remote
            .eph_dh(&remote_pub)
            .ok_or(CipherError::EncryptFailed)?;

        let mut salt = eph_pub.to_vec();
        salt.extend_from_slice(&remote.public);
        let msg_key = hkdf_key(&eph_shared, &salt, b"cs3a msg")?;

        let sealed = aead(&msg_key)
            .encrypt(&seq_nonce(0), Payload { msg: &inner.encode(), aad: &eph_pub })
            .map_err(|_| CipherError::EncryptFailed)?;

        let mut msg = eph_pub.to_vec();
        msg.extend_from_slice(&sealed);

        let secret = StaticSecret::from(local.secret);
        let shared = secret.diffie_hellman(&remote_pub);
        let auth_key = hkdf_key(shared.as_bytes(), &local.public, b"cs3a auth")?;
        let tag = identity_tag(&auth_key, &msg)?;
        msg.extend_from_slice(&tag);

        let mut outer = Packet::new();
        outer.set_body(&msg);
        Ok(outer)
    }

    fn remote_validate(
        &self,
        remote: &RemoteHandle,
        _args: &Packet,
        _sig: &Packet,
        _data: &[u8],
    ) -> Result<(), CipherError> {
        // x25519 is agreement-only; this set carries no signature scheme.
        let _ = handle_ref::<Cs3aRemote>(remote.as_ref())?;
        Err(CipherError::SignatureInvalid)
    }

    fn ephemeral_new(
        &self,
        remote: &RemoteHandle,
        outer: &Packet,
    ) -> Result<EphemeralHandle, CipherError> {
        let remote = handle_ref::<Cs3aRemote>(remote.as_ref())?;
        let body = outer.body();
        if body.len() < KEY_SIZE {
            return Err(CipherError::VerifyFailed);
        }
        let their_eph_bytes: [u8; KEY_SIZE] = body[..KEY_SIZE]
            .try_into()
            .map_err(|_| CipherError::VerifyFailed)?;
        let their_eph = pub_from(&their_eph_bytes)?;

        // Make sure we have our own ephemeral (generated here when the peer
        // handshakes first), then agree on direction keys by key order.
        let our_eph_pub = remote.eph_public();
        let (shared, _) = remote
            .eph_dh(&their_eph)
            .ok_or(CipherError::VerifyFailed)?;

        let (lo, hi) = if our_eph_pub <= their_eph_bytes {
            (our_eph_pub, their_eph_bytes)
        } else {
            (their_eph_bytes, our_eph_pub)
        };
        let mut salt = lo.to_vec();
        salt.extend_from_slice(&hi);
        let lo_key = hkdf_key(&shared, &salt, b"cs3a lo")?;
        let hi_key = hkdf_key(&shared, &salt, b"cs3a hi")?;

        let (tx_key, rx_key) = if our_eph_pub == lo {
            (lo_key, hi_key)
        } else {
            (hi_key, lo_key)
        };

        Ok(Box::new(Cs3aEphemeral { tx_key, rx_key, tx_seq: 0, rx_seq: 0 }))
    }

    fn ephemeral_encrypt(
        &self,
        ephem: &mut EphemeralHandle,
        inner: &Packet,
    ) -> Result<Packet, CipherError> {
        let ephem = handle_mut::<Cs3aEphemeral>(ephem.as_mut())?;
        ephem.tx_seq += 1;
        let ct = aead(&ephem.tx_key)
            .encrypt(
                &seq_nonce(ephem.tx_seq),
                Payload { msg: &inner.encode(), aad: b"" },
            )
            .map_err(|_| CipherError::EncryptFailed)?;
        let mut body = ephem.tx_seq.to_le_bytes().to_vec();
        body.extend_from_slice(&ct);
        let mut outer = Packet::new();
        outer.set_body(&body);
        Ok(outer)
    }

    fn ephemeral_decrypt(
        &self,
        ephem: &mut EphemeralHandle,
        outer: &Packet,
    ) -> Result<Packet, CipherError> {
        let ephem = handle_mut::<Cs3aEphemeral>(ephem.as_mut())?;
        let body = outer.body();
        if body.len() < SEQ_SIZE + TAG_SIZE {
            return Err(CipherError::DecryptFailed);
        }
        let seq_bytes: [u8; SEQ_SIZE] = body[..SEQ_SIZE]
            .try_into()
            .map_err(|_| CipherError::DecryptFailed)?;
        let seq = u64::from_le_bytes(seq_bytes);
        let inner_raw = aead(&ephem.rx_key)
            .decrypt(&seq_nonce(seq), Payload { msg: &body[SEQ_SIZE..], aad: b"" })
            .map_err(|_| CipherError::DecryptFailed)?;
        if seq > ephem.rx_seq {
            ephem.rx_seq = seq;
        }
        Packet::parse(&inner_raw).map_err(|_| CipherError::DecryptFailed)
    }
}
