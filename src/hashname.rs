//! Hashname identities.
//!
//! A hashname is a 32-byte public identity derived from a peer's public
//! key(s): a SHA-256 rollup absorbing, per cipher-set id in ascending
//! order, the csid byte followed by the SHA-256 intermediate of that key.
//! Peers that only share one key can still agree on the hashname by
//! exchanging base32 intermediates for the sets they don't hold.
//!
//! Displayed as 52 characters of lowercase unpadded base32; the short form
//! (first 5 bytes, 8 characters) is used where radio budgets are tight.

use std::fmt;
use std::sync::OnceLock;

use data_encoding::{Encoding, Specification};
use sha2::{Digest, Sha256};

use crate::core::{HASHNAME_SHORT_SIZE, HASHNAME_SIZE};
use crate::packet::Packet;

/// Lowercase unpadded base32 (RFC 4648 alphabet).
pub(crate) fn base32() -> &'static Encoding {
    static ENC: OnceLock<Encoding> = OnceLock::new();
    ENC.get_or_init(|| {
        let mut spec = Specification::new();
        spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
        spec.encoding().expect("static base32 alphabet")
    })
}

/// A 32-byte hashname.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hashname([u8; HASHNAME_SIZE]);

impl Hashname {
    /// Wrap raw bytes.
    pub fn from_bin(bin: [u8; HASHNAME_SIZE]) -> Self {
        Self(bin)
    }

    /// Parse the 52-character base32 form.
    pub fn from_char(s: &str) -> Option<Self> {
        let bytes = base32().decode(s.as_bytes()).ok()?;
        let bin: [u8; HASHNAME_SIZE] = bytes.try_into().ok()?;
        Some(Self(bin))
    }

    /// Derive from a full key map (`{"<csid hex>": "<base32 key>", ...}`).
    pub fn from_keys(keys: &Packet) -> Option<Self> {
        let mut entries = csid_entries(keys);
        if entries.is_empty() {
            return None;
        }
        entries.sort_by_key(|(csid, _)| *csid);
        let mut rollup = Vec::new();
        for (csid, key) in entries {
            let inter: [u8; 32] = Sha256::digest(&key).into();
            rollup = absorb(&rollup, csid, &inter);
        }
        Some(Self(rollup.try_into().ok()?))
    }

    /// Derive from one raw key (packet body) for `csid`, with base32
    /// intermediate hashes for any other sets in the packet's head.
    pub fn from_key(key: &Packet, csid: u8) -> Option<Self> {
        if key.body().is_empty() {
            return None;
        }
        let mut entries: Vec<(u8, [u8; 32])> = vec![(csid, Sha256::digest(key.body()).into())];
        for name in key.key_names().map(str::to_string).collect::<Vec<_>>() {
            let Some(id) = csid_from_hex(&name) else { continue };
            if id == csid {
                continue;
            }
            let inter = key.get_base32(&name)?;
            let inter: [u8; 32] = inter.try_into().ok()?;
            entries.push((id, inter));
        }
        entries.sort_by_key(|(id, _)| *id);
        let mut rollup = Vec::new();
        for (id, inter) in entries {
            rollup = absorb(&rollup, id, &inter);
        }
        Some(Self(rollup.try_into().ok()?))
    }

    /// The raw 32 bytes.
    pub fn bin(&self) -> &[u8; HASHNAME_SIZE] {
        &self.0
    }

    /// The short binary form (first 5 bytes).
    pub fn short_bin(&self) -> [u8; HASHNAME_SHORT_SIZE] {
        let mut out = [0u8; HASHNAME_SHORT_SIZE];
        out.copy_from_slice(&self.0[..HASHNAME_SHORT_SIZE]);
        out
    }

    /// The 8-character short base32 form.
    pub fn short(&self) -> String {
        base32().encode(&self.short_bin())
    }

    /// Compare only the short prefixes.
    pub fn short_eq(&self, other: &Hashname) -> bool {
        self.0[..HASHNAME_SHORT_SIZE] == other.0[..HASHNAME_SHORT_SIZE]
    }
}

impl fmt::Display for Hashname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base32().encode(&self.0))
    }
}

impl fmt::Debug for Hashname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hashname({})", self.short())
    }
}

fn absorb(rollup: &[u8], csid: u8, intermediate: &[u8; 32]) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(rollup);
    h.update([csid]);
    let step: [u8; 32] = h.finalize().into();
    let mut h = Sha256::new();
    h.update(step);
    h.update(intermediate);
    h.finalize().to_vec()
}

/// Extract `(csid, raw key bytes)` pairs from a key map packet.
pub(crate) fn csid_entries(keys: &Packet) -> Vec<(u8, Vec<u8>)> {
    let names: Vec<String> = keys.key_names().map(str::to_string).collect();
    names
        .into_iter()
        .filter_map(|name| {
            let csid = csid_from_hex(&name)?;
            let key = keys.get_base32(&name)?;
            Some((csid, key))
        })
        .collect()
}

/// Generate the intermediate-hash map for a key bundle, with the raw key
/// for `csid` moved into the body (the shape a handshake inner carries).
pub fn intermediates(keys: &Packet, csid: u8) -> Option<Packet> {
    let mut out = Packet::new();
    let mut found = false;
    for (id, key) in csid_entries(keys) {
        if id == csid {
            out.set_body(&key);
            found = true;
        } else {
            out.set_base32(&csid_hex(id), &Sha256::digest(&key));
        }
    }
    found.then_some(out)
}

/// Best (highest) mutually supported cipher-set id between two key maps.
pub fn best_id(a: &Packet, b: &Packet) -> Option<u8> {
    let ours: Vec<u8> = a.key_names().filter_map(csid_from_hex).collect();
    b.key_names()
        .filter_map(csid_from_hex)
        .filter(|id| ours.contains(id))
        .max()
}

/// Parse a two-character csid hex string.
pub fn csid_from_hex(hex: &str) -> Option<u8> {
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// Render a csid as its two-character hex string.
pub fn csid_hex(csid: u8) -> String {
    format!("{csid:02x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_packet() -> Packet {
        let mut keys = Packet::new();
        keys.set_base32("3a", &[1u8; 32]);
        keys.set_base32("1a", &[2u8; 21]);
        keys
    }

    #[test]
    fn test_from_keys_stable() {
        let a = Hashname::from_keys(&keys_packet()).unwrap();
        let b = Hashname::from_keys(&keys_packet()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string().len(), 52);
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let mut reordered = Packet::new();
        reordered.set_base32("1a", &[2u8; 21]);
        reordered.set_base32("3a", &[1u8; 32]);
        assert_eq!(
            Hashname::from_keys(&keys_packet()),
            Hashname::from_keys(&reordered)
        );
    }

    #[test]
    fn test_from_key_matches_from_keys() {
        let keys = keys_packet();
        let full = Hashname::from_keys(&keys).unwrap();
        // Build the single-key + intermediates form for csid 0x3a.
        let im = intermediates(&keys, 0x3a).unwrap();
        let partial = Hashname::from_key(&im, 0x3a).unwrap();
        assert_eq!(full, partial);
    }

    #[test]
    fn test_char_roundtrip() {
        let hn = Hashname::from_keys(&keys_packet()).unwrap();
        let s = hn.to_string();
        assert_eq!(Hashname::from_char(&s), Some(hn));
        assert!(Hashname::from_char("not base32!").is_none());
    }

    #[test]
    fn test_short() {
        let hn = Hashname::from_bin([0xab; 32]);
        assert_eq!(hn.short().len(), 8);
        let other = Hashname::from_bin({
            let mut b = [0xab; 32];
            b[31] = 0;
            b
        });
        assert!(hn.short_eq(&other));
        assert_ne!(hn, other);
    }

    #[test]
    fn test_best_id() {
        let mut a = Packet::new();
        a.set_base32("1a", &[1; 21]).set_base32("3a", &[2; 32]);
        let mut b = Packet::new();
        b.set_base32("1a", &[3; 21]).set_base32("3a", &[4; 32]);
        assert_eq!(best_id(&a, &b), Some(0x3a));
        let mut c = Packet::new();
        c.set_base32("1a", &[5; 21]);
        assert_eq!(best_id(&a, &c), Some(0x1a));
        let d = Packet::new();
        assert_eq!(best_id(&a, &d), None);
    }

    #[test]
    fn test_missing_keys() {
        assert!(Hashname::from_keys(&Packet::new()).is_none());
    }
}
