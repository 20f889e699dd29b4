//! The packet container.
//!
//! A packet is a self-describing binary container: a head that is either
//! empty, short binary (1-6 bytes, e.g. a lone cipher-set id), or a JSON
//! object, followed by an opaque body.
//!
//! Wire format:
//! ```text
//! +------------------+--------------+--------------+
//! | Head Length      | Head         | Body         |
//! | 2 bytes (BE16)   | 0..n bytes   | remainder    |
//! +------------------+--------------+--------------+
//! ```
//!
//! A head length of 0 means a headerless (body-only) packet. Packets may
//! also wrap one another through an owned `chain`: dropping a packet drops
//! everything chained below it, and `unlink` takes the child back out.

use serde_json::{Map, Value};

use crate::core::{PacketError, HEAD_JSON_MIN, HEAD_LEN_SIZE};
use crate::hashname::base32;

/// Packet head: empty, raw binary, or a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Head {
    Empty,
    Binary(Vec<u8>),
    Json(Map<String, Value>),
}

/// A packet: head + body + optional chained parent/child.
#[derive(Debug)]
pub struct Packet {
    pub(crate) head: Head,
    body: Vec<u8>,
    chain: Option<Box<Packet>>,
    /// Caller bookkeeping, never touched by the protocol.
    pub id: u32,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Packet {
    /// Deep-copies head and body. The chain is deliberately not copied.
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
            body: self.body.clone(),
            chain: None,
            id: self.id,
        }
    }
}

impl Packet {
    /// Create an empty (headerless, bodyless) packet.
    pub fn new() -> Self {
        Self {
            head: Head::Empty,
            body: Vec::new(),
            chain: None,
            id: 0,
        }
    }

    /// Parse a packet from raw bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, PacketError> {
        if raw.len() < HEAD_LEN_SIZE {
            return Err(PacketError::UnexpectedEof);
        }
        let head_len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
        let rest = &raw[HEAD_LEN_SIZE..];
        if head_len > rest.len() {
            return Err(PacketError::Truncated {
                claimed: head_len,
                available: rest.len(),
            });
        }
        let (head_bytes, body) = rest.split_at(head_len);

        let head = if head_len == 0 {
            Head::Empty
        } else if head_len < HEAD_JSON_MIN {
            Head::Binary(head_bytes.to_vec())
        } else {
            match serde_json::from_slice::<Value>(head_bytes) {
                Ok(Value::Object(map)) => Head::Json(map),
                _ => return Err(PacketError::InvalidHead),
            }
        };

        Ok(Self {
            head,
            body: body.to_vec(),
            chain: None,
            id: 0,
        })
    }

    /// Encode to the full wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let head = self.head_bytes();
        let mut raw = Vec::with_capacity(HEAD_LEN_SIZE + head.len() + self.body.len());
        raw.extend_from_slice(&(head.len() as u16).to_be_bytes());
        raw.extend_from_slice(&head);
        raw.extend_from_slice(&self.body);
        raw
    }

    /// Total encoded length.
    pub fn len(&self) -> usize {
        HEAD_LEN_SIZE + self.head_len() + self.body.len()
    }

    /// True when both head and body are empty.
    pub fn is_empty(&self) -> bool {
        matches!(self.head, Head::Empty) && self.body.is_empty()
    }

    // =========================================================================
    // Head access
    // =========================================================================

    /// Encoded head bytes (JSON heads are serialized on demand).
    pub fn head_bytes(&self) -> Vec<u8> {
        match &self.head {
            Head::Empty => Vec::new(),
            Head::Binary(b) => b.clone(),
            Head::Json(map) => serde_json::to_vec(&Value::Object(map.clone()))
                .unwrap_or_default(),
        }
    }

    /// Encoded head length.
    pub fn head_len(&self) -> usize {
        match &self.head {
            Head::Empty => 0,
            Head::Binary(b) => b.len(),
            Head::Json(map) => serde_json::to_vec(&Value::Object(map.clone()))
                .map(|v| v.len())
                .unwrap_or(0),
        }
    }

    /// Replace the head with raw binary bytes (empties it for zero length).
    pub fn set_head_bin(&mut self, bytes: &[u8]) -> &mut Self {
        self.head = if bytes.is_empty() {
            Head::Empty
        } else {
            Head::Binary(bytes.to_vec())
        };
        self
    }

    /// The binary head, when the head is raw binary.
    pub fn head_bin(&self) -> Option<&[u8]> {
        match &self.head {
            Head::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// The JSON head as a serialized string, when the head is JSON.
    pub fn json(&self) -> Option<String> {
        match &self.head {
            Head::Json(map) => serde_json::to_string(&Value::Object(map.clone())).ok(),
            _ => None,
        }
    }

    /// True when the head is a JSON object.
    pub fn is_json(&self) -> bool {
        matches!(self.head, Head::Json(_))
    }

    fn json_mut(&mut self) -> &mut Map<String, Value> {
        if !matches!(self.head, Head::Json(_)) {
            self.head = Head::Json(Map::new());
        }
        match &mut self.head {
            Head::Json(map) => map,
            _ => unreachable!("head was just set to JSON"),
        }
    }

    fn json_ref(&self) -> Option<&Map<String, Value>> {
        match &self.head {
            Head::Json(map) => Some(map),
            _ => None,
        }
    }

    // =========================================================================
    // Body access
    // =========================================================================

    /// The body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replace the body.
    pub fn set_body(&mut self, body: &[u8]) -> &mut Self {
        self.body = body.to_vec();
        self
    }

    /// Take the body out, leaving it empty.
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Append bytes to the body.
    pub fn append(&mut self, chunk: &[u8]) -> &mut Self {
        self.body.extend_from_slice(chunk);
        self
    }

    /// Append a string to the body.
    pub fn append_str(&mut self, chunk: &str) -> &mut Self {
        self.append(chunk.as_bytes())
    }

    // =========================================================================
    // JSON setters (all escape through serialization; chainable)
    // =========================================================================

    /// Set a string value. Quotes and control characters are escaped.
    pub fn set(&mut self, key: &str, val: &str) -> &mut Self {
        self.json_mut().insert(key.to_string(), Value::String(val.to_string()));
        self
    }

    /// Set a pre-serialized JSON fragment. The caller is responsible for
    /// its validity; an unparseable fragment is stored as a plain string.
    pub fn set_raw(&mut self, key: &str, raw: &str) -> &mut Self {
        let val = serde_json::from_str::<Value>(raw)
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        self.json_mut().insert(key.to_string(), val);
        self
    }

    /// Set an integer value.
    pub fn set_int(&mut self, key: &str, val: i64) -> &mut Self {
        self.json_mut().insert(key.to_string(), Value::from(val));
        self
    }

    /// Set an unsigned integer value.
    pub fn set_uint(&mut self, key: &str, val: u64) -> &mut Self {
        self.json_mut().insert(key.to_string(), Value::from(val));
        self
    }

    /// Set a float value rounded to the given number of decimal places.
    pub fn set_float(&mut self, key: &str, val: f64, places: usize) -> &mut Self {
        let rounded: f64 = format!("{val:.places$}").parse().unwrap_or(val);
        let num = serde_json::Number::from_f64(rounded).unwrap_or_else(|| 0.into());
        self.json_mut().insert(key.to_string(), Value::Number(num));
        self
    }

    /// Set a boolean value.
    pub fn set_bool(&mut self, key: &str, val: bool) -> &mut Self {
        self.json_mut().insert(key.to_string(), Value::Bool(val));
        self
    }

    /// Set binary data as lowercase unpadded base32.
    pub fn set_base32(&mut self, key: &str, val: &[u8]) -> &mut Self {
        let enc = base32().encode(val);
        self.set(key, &enc)
    }

    /// Copy all top-level keys from another packet's JSON head.
    pub fn set_json(&mut self, other: &Packet) -> &mut Self {
        if let Some(src) = other.json_ref() {
            let dst = self.json_mut();
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
        self
    }

    /// Remove a key.
    pub fn unset(&mut self, key: &str) -> &mut Self {
        if let Head::Json(map) = &mut self.head {
            map.shift_remove(key);
            if map.is_empty() {
                self.head = Head::Empty;
            }
        }
        self
    }

    // =========================================================================
    // JSON getters
    // =========================================================================

    /// Get a string value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.json_ref()?.get(key)?.as_str()
    }

    /// Get an integer value.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.json_ref()?.get(key)?.as_i64()
    }

    /// Get an unsigned integer value.
    pub fn get_uint(&self, key: &str) -> Option<u64> {
        self.json_ref()?.get(key)?.as_u64()
    }

    /// Get a float value.
    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.json_ref()?.get(key)?.as_f64()
    }

    /// Get a boolean value.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.json_ref()?.get(key)?.as_bool()
    }

    /// Get any value serialized back to JSON text.
    pub fn get_raw(&self, key: &str) -> Option<String> {
        serde_json::to_string(self.json_ref()?.get(key)?).ok()
    }

    /// Compare a key's string value.
    pub fn get_cmp(&self, key: &str, val: &str) -> bool {
        self.get(key) == Some(val)
    }

    /// Build a new packet from a key's object value.
    pub fn get_json(&self, key: &str) -> Option<Packet> {
        match self.json_ref()?.get(key)? {
            Value::Object(map) => {
                let mut p = Packet::new();
                p.head = Head::Json(map.clone());
                Some(p)
            }
            _ => None,
        }
    }

    /// Build packets from a key's array-of-objects value.
    pub fn get_array(&self, key: &str) -> Vec<Packet> {
        let Some(Value::Array(items)) = self.json_ref().and_then(|m| m.get(key)) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|v| match v {
                Value::Object(map) => {
                    let mut p = Packet::new();
                    p.head = Head::Json(map.clone());
                    Some(p)
                }
                _ => None,
            })
            .collect()
    }

    /// Decode a base32 string value to bytes.
    pub fn get_base32(&self, key: &str) -> Option<Vec<u8>> {
        base32().decode(self.get(key)?.as_bytes()).ok()
    }

    /// Number of top-level keys.
    pub fn keys(&self) -> usize {
        self.json_ref().map(|m| m.len()).unwrap_or(0)
    }

    /// Iterate over top-level key names.
    pub fn key_names(&self) -> impl Iterator<Item = &str> {
        self.json_ref().into_iter().flat_map(|m| m.keys()).map(String::as_str)
    }

    // =========================================================================
    // Canonicalization and comparison
    // =========================================================================

    /// Alpha-sort the JSON keys for canonical encoding. Idempotent.
    pub fn sort(&mut self) -> &mut Self {
        if let Head::Json(map) = &mut self.head {
            let mut entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            *map = entries.into_iter().collect();
        }
        self
    }

    /// Compare top-level header key/value sets and exact body bytes.
    /// Nested structures are compared by value, chains and ids are ignored.
    pub fn equals(&self, other: &Packet) -> bool {
        if self.body != other.body {
            return false;
        }
        match (&self.head, &other.head) {
            (Head::Empty, Head::Empty) => true,
            (Head::Binary(a), Head::Binary(b)) => a == b,
            (Head::Json(a), Head::Json(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
            }
            _ => false,
        }
    }

    // =========================================================================
    // Chain
    // =========================================================================

    /// Wrap a child packet in a new empty parent; dropping the parent drops
    /// the child.
    pub fn chain(child: Packet) -> Packet {
        let mut p = Packet::new();
        p.chain = Some(Box::new(child));
        p
    }

    /// Attach a child, dropping any previously chained one.
    pub fn link(&mut self, child: Packet) -> &mut Self {
        self.chain = Some(Box::new(child));
        self
    }

    /// The chained child, if any.
    pub fn linked(&self) -> Option<&Packet> {
        self.chain.as_deref()
    }

    /// Take the chained child back out.
    pub fn unlink(&mut self) -> Option<Packet> {
        self.chain.take().map(|b| *b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_roundtrip() {
        let p = Packet::new();
        let raw = p.encode();
        assert_eq!(raw, vec![0, 0]);
        let q = Packet::parse(&raw).unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn test_json_roundtrip() {
        let mut p = Packet::new();
        p.set("type", "ping").set_int("c", 1).set_body(b"hello");
        let raw = p.encode();
        let q = Packet::parse(&raw).unwrap();
        assert_eq!(q.get("type"), Some("ping"));
        assert_eq!(q.get_int("c"), Some(1));
        assert_eq!(q.body(), b"hello");
        assert!(p.equals(&q));
    }

    #[test]
    fn test_binary_head() {
        let mut p = Packet::new();
        p.set_head_bin(&[0x3a]).set_body(&[1, 2, 3]);
        let raw = p.encode();
        assert_eq!(raw, vec![0, 1, 0x3a, 1, 2, 3]);
        let q = Packet::parse(&raw).unwrap();
        assert_eq!(q.head_bin(), Some(&[0x3a][..]));
        assert!(!q.is_json());
    }

    #[test]
    fn test_parse_truncated() {
        assert!(matches!(Packet::parse(&[0]), Err(PacketError::UnexpectedEof)));
        // Head claims 10 bytes, only 2 available.
        let raw = [0u8, 10, 1, 2];
        assert!(matches!(
            Packet::parse(&raw),
            Err(PacketError::Truncated { claimed: 10, available: 2 })
        ));
    }

    #[test]
    fn test_parse_invalid_json_head() {
        let mut raw = vec![0u8, 9];
        raw.extend_from_slice(b"[1,2,3,4]"); // array, not an object
        assert!(matches!(Packet::parse(&raw), Err(PacketError::InvalidHead)));
    }

    #[test]
    fn test_escaping() {
        let mut p = Packet::new();
        p.set("msg", "say \"hi\"\n");
        let raw = p.encode();
        let q = Packet::parse(&raw).unwrap();
        assert_eq!(q.get("msg"), Some("say \"hi\"\n"));
    }

    #[test]
    fn test_sort_idempotent() {
        let mut p = Packet::new();
        p.set("zeta", "1").set("alpha", "2").set("mid", "3");
        let mut sorted = p.clone();
        sorted.sort();
        assert_eq!(sorted.json().unwrap(), r#"{"alpha":"2","mid":"3","zeta":"1"}"#);
        let once = sorted.json().unwrap();
        sorted.sort();
        assert_eq!(sorted.json().unwrap(), once);
        // Key order differs but top-level comparison is order-blind.
        assert!(p.equals(&sorted));
    }

    #[test]
    fn test_equals_body_sensitive() {
        let mut a = Packet::new();
        a.set("k", "v").set_body(b"x");
        let mut b = a.clone();
        assert!(a.equals(&b));
        b.set_body(b"y");
        assert!(!a.equals(&b));
    }

    #[test]
    fn test_chain_ownership() {
        let mut inner = Packet::new();
        inner.set("inner", "yes");
        let mut outer = Packet::chain(inner);
        assert_eq!(outer.linked().unwrap().get("inner"), Some("yes"));
        let back = outer.unlink().unwrap();
        assert_eq!(back.get("inner"), Some("yes"));
        assert!(outer.linked().is_none());
    }

    #[test]
    fn test_clone_drops_chain() {
        let mut outer = Packet::chain(Packet::new());
        outer.set("k", "v");
        let copy = outer.clone();
        assert!(copy.linked().is_none());
        assert_eq!(copy.get("k"), Some("v"));
    }

    #[test]
    fn test_base32_value() {
        let mut p = Packet::new();
        p.set_base32("bin", &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(p.get_base32("bin").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_set_raw_fragment() {
        let mut p = Packet::new();
        p.set_raw("paths", r#"[{"type":"udp4"}]"#);
        let paths = p.get_array("paths");
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].get("type"), Some("udp4"));
    }

    #[test]
    fn test_unset_last_key_empties_head() {
        let mut p = Packet::new();
        p.set("only", "one");
        p.unset("only");
        assert_eq!(p.head_len(), 0);
        assert_eq!(p.encode(), vec![0, 0]);
    }
}
