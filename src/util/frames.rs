//! Fixed-size frame transport.
//!
//! For transports whose atomic unit is one fixed-size frame (LoRa-class
//! radios, short serial records). One packet is in flight per direction;
//! integrity rides on a rolling CRC32 chain instead of sequence numbers.
//!
//! Data frame (`size` bytes):
//! ```text
//! +---------------------------+------------------+
//! | Payload                   | Chain Hash       |
//! | size-4 bytes              | 4 bytes (LE32)   |
//! +---------------------------+------------------+
//! ```
//! The chain hash of a frame is `crc32(prev_chain || payload)`, seeded at
//! the last confirmed packet boundary (`inbase`/`outbase`), so a missed or
//! duplicated frame shows up as a mismatch without per-frame counters.
//! The payload stream of one packet is `[u16 LE total][raw packet bytes]`
//! with the final frame zero-padded.
//!
//! Meta frame (`size` bytes, reserved trailing 14):
//! ```text
//! +------------------+-----------+-----------+-------+-----+----------+
//! | Meta Payload     | In Last   | Out Last  | Flags | Len | Check    |
//! | size-14 bytes    | 4 (LE32)  | 4 (LE32)  | 1     | 1   | 4 (LE32) |
//! +------------------+-----------+-----------+-------+-----+----------+
//! ```
//! Meta frames confirm the receive chain (`In Last`), advertise the send
//! chain, and carry the more-pending / flush-request flags. A receiver
//! classifies a frame by checking the data-chain hash first, then the meta
//! check; neither matching means a missed frame. The partial inbox then
//! rewinds to the last packet boundary and the sender re-sends its whole
//! outbox; there is no per-frame retransmission.

use std::collections::VecDeque;

use crate::core::{AdapterError, FRAME_MAX, FRAME_META_RESERVED, FRAME_MIN};
use crate::packet::Packet;

const HASH_SIZE: usize = 4;
const LEN_PREFIX: usize = 2;
const FLAG_MORE: u8 = 0x01;
const FLAG_FLUSH: u8 = 0x02;
const META_SEED: &[u8] = b"meta";

fn chain(prev: u32, payload: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(&prev.to_le_bytes());
    h.update(payload);
    h.finalize()
}

fn meta_check(frame_head: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(META_SEED);
    h.update(frame_head);
    h.finalize()
}

/// Frame transport engine for one session.
pub struct Frames {
    size: usize,
    /// Outgoing packet stream (`[u16 len][raw]`), present while in flight.
    outbox: Option<Vec<u8>>,
    /// Frames of the outbox confirmed sent via [`Frames::sent`].
    out_sent: usize,
    /// Chain state after `out_sent` frames.
    out_hash: u32,
    /// Chain base at the last confirmed outgoing packet boundary.
    outbase: u32,
    /// Completed inbound packets.
    received: VecDeque<Packet>,
    /// Partial inbound payload stream.
    in_cache: Vec<u8>,
    /// Chain state over the partial inbound stream.
    in_hash: u32,
    /// Chain base at the last inbound packet boundary.
    inbase: u32,
    flush: bool,
    /// A chain mismatch was seen and the peer's re-send is still owed.
    miss: bool,
    more: bool,
    err: bool,
}

impl Frames {
    /// Create with a frame size (16-128, multiple of 4).
    pub fn new(size: usize) -> Result<Self, AdapterError> {
        if !(FRAME_MIN..=FRAME_MAX).contains(&size) || size % 4 != 0 {
            return Err(AdapterError::InvalidSize(size));
        }
        Ok(Self {
            size,
            outbox: None,
            out_sent: 0,
            out_hash: 0,
            outbase: 0,
            received: VecDeque::new(),
            in_cache: Vec::new(),
            in_hash: 0,
            inbase: 0,
            flush: false,
            miss: false,
            more: false,
            err: false,
        })
    }

    /// The fixed frame size.
    pub fn size(&self) -> usize {
        self.size
    }

    fn payload_per_frame(&self) -> usize {
        self.size - HASH_SIZE
    }

    /// Queue a packet for sending; only one may be in flight.
    pub fn send(&mut self, out: Packet) -> Result<(), AdapterError> {
        if self.err {
            return Err(AdapterError::Failed);
        }
        if self.outbox.is_some() {
            return Err(AdapterError::Busy);
        }
        let raw = out.encode();
        let mut stream = Vec::with_capacity(LEN_PREFIX + raw.len());
        stream.extend_from_slice(&(raw.len() as u16).to_le_bytes());
        stream.extend_from_slice(&raw);
        self.outbox = Some(stream);
        self.out_sent = 0;
        self.out_hash = self.outbase;
        Ok(())
    }

    /// Next reassembled inbound packet, if any.
    pub fn receive(&mut self) -> Option<Packet> {
        self.received.pop_front()
    }

    /// Bytes buffered in the partial inbound stream.
    pub fn inlen(&self) -> usize {
        self.in_cache.len()
    }

    /// Bytes of the outbox not yet confirmed sent.
    pub fn outlen(&self) -> usize {
        match &self.outbox {
            Some(stream) => stream.len().saturating_sub(self.out_sent * self.payload_per_frame()),
            None => 0,
        }
    }

    fn frames_total(&self) -> usize {
        match &self.outbox {
            Some(stream) => stream.len().div_ceil(self.payload_per_frame()),
            None => 0,
        }
    }

    fn frame_payload(&self, index: usize) -> Option<Vec<u8>> {
        let stream = self.outbox.as_ref()?;
        let psize = self.payload_per_frame();
        let start = index * psize;
        if start >= stream.len() {
            return None;
        }
        let end = (start + psize).min(stream.len());
        let mut payload = stream[start..end].to_vec();
        payload.resize(psize, 0);
        Some(payload)
    }

    /// Chain state after the entire outbox has gone out.
    fn out_final_hash(&self) -> u32 {
        let mut h = self.out_hash;
        for i in self.out_sent..self.frames_total() {
            if let Some(p) = self.frame_payload(i) {
                h = chain(h, &p);
            }
        }
        h
    }

    // =========================================================================
    // Outgoing
    // =========================================================================

    /// Fill the next frame to transmit: the next unsent data frame when
    /// payload is pending, a meta frame otherwise. Idempotent - repeated
    /// calls without [`Frames::sent`] produce byte-identical frames.
    pub fn outbox(&self) -> Result<Vec<u8>, AdapterError> {
        if self.err {
            return Err(AdapterError::Failed);
        }
        if let Some(payload) = self.frame_payload(self.out_sent) {
            let hash = chain(self.out_hash, &payload);
            let mut frame = payload;
            frame.extend_from_slice(&hash.to_le_bytes());
            return Ok(frame);
        }
        Ok(self.meta_frame())
    }

    fn meta_frame(&self) -> Vec<u8> {
        let mut frame = vec![0u8; self.size - FRAME_META_RESERVED];
        frame.extend_from_slice(&self.in_hash.to_le_bytes());
        frame.extend_from_slice(&self.out_final_hash().to_le_bytes());
        let mut flags = 0u8;
        if self.outbox.is_some() {
            flags |= FLAG_MORE;
        }
        if self.miss {
            flags |= FLAG_FLUSH;
        }
        frame.push(flags);
        frame.push(0); // meta payload length, app use
        let check = meta_check(&frame);
        frame.extend_from_slice(&check.to_le_bytes());
        frame
    }

    /// Advance after one frame was physically transmitted. Must be called
    /// exactly once per transmitted frame, with no interleaved
    /// [`Frames::inbox`] for the same transaction.
    pub fn sent(&mut self) -> Result<bool, AdapterError> {
        if self.err {
            return Err(AdapterError::Failed);
        }
        if let Some(payload) = self.frame_payload(self.out_sent) {
            self.out_hash = chain(self.out_hash, &payload);
            self.out_sent += 1;
            if self.out_sent >= self.frames_total() {
                // Fully sent; hold the outbox for possible re-send until
                // the peer's meta confirms the chain.
                self.flush = true;
            }
            Ok(self.frame_payload(self.out_sent).is_some())
        } else {
            // A meta frame went out; the flush request is satisfied.
            self.flush = false;
            Ok(false)
        }
    }

    // =========================================================================
    // Incoming
    // =========================================================================

    /// Process one received frame.
    pub fn inbox(&mut self, frame: &[u8]) -> Result<(), AdapterError> {
        if self.err {
            return Err(AdapterError::Failed);
        }
        if frame.len() != self.size {
            self.err = true;
            return Err(AdapterError::InvalidSize(frame.len()));
        }
        let (head, hash_bytes) = frame.split_at(self.size - HASH_SIZE);
        let hash = u32::from_le_bytes([hash_bytes[0], hash_bytes[1], hash_bytes[2], hash_bytes[3]]);

        // Data frame: the chain must continue from our receive state.
        if hash == chain(self.in_hash, head) {
            self.in_hash = hash;
            self.miss = false;
            self.in_cache.extend_from_slice(head);
            self.complete_packets();
            return Ok(());
        }

        // Meta frame: self-checked with the fixed seed.
        if hash == meta_check(head) {
            self.process_meta(head);
            return Ok(());
        }

        // Neither chain continues: a frame went missing or arrived twice.
        // Drop back to the last packet boundary and ask for a flush; the
        // sender re-sends the whole outbox.
        tracing::debug!("frame chain mismatch, rewinding to last boundary");
        self.in_cache.clear();
        self.in_hash = self.inbase;
        self.flush = true;
        self.miss = true;
        Err(AdapterError::HashMismatch)
    }

    fn process_meta(&mut self, head: &[u8]) {
        let at = self.size - FRAME_META_RESERVED;
        let inlast = u32::from_le_bytes([head[at], head[at + 1], head[at + 2], head[at + 3]]);
        let flags = head[at + 8];
        self.more = flags & FLAG_MORE != 0;
        if flags & FLAG_FLUSH != 0 {
            self.flush = true;
        }

        if self.outbox.is_some() {
            let fully_sent = self.out_sent >= self.frames_total();
            if fully_sent && inlast == self.out_hash {
                // Peer confirmed the full outbox; it leaves flight.
                self.outbox = None;
                self.outbase = self.out_hash;
                self.out_sent = 0;
            } else if inlast == self.outbase && (fully_sent || flags & FLAG_FLUSH != 0) {
                // Peer never advanced; re-send everything from the base.
                tracing::debug!("peer missed outbox, re-sending from base");
                self.out_sent = 0;
                self.out_hash = self.outbase;
            }
        }
    }

    /// Pull a completed packet out of the inbound stream.
    fn complete_packets(&mut self) {
        if self.in_cache.len() < LEN_PREFIX {
            return;
        }
        let total = u16::from_le_bytes([self.in_cache[0], self.in_cache[1]]) as usize;
        if total == 0 {
            // Nothing but padding; treat as a boundary keepalive.
            self.in_cache.clear();
            self.inbase = self.in_hash;
            return;
        }
        if self.in_cache.len() < LEN_PREFIX + total {
            return;
        }
        match Packet::parse(&self.in_cache[LEN_PREFIX..LEN_PREFIX + total]) {
            Ok(p) => {
                self.received.push_back(p);
                // Boundary: future chains seed from here, and the peer
                // is owed a confirming meta.
                self.in_cache.clear();
                self.inbase = self.in_hash;
                self.flush = true;
            }
            Err(err) => {
                tracing::warn!(%err, "frame stream held an unparseable packet");
                self.in_cache.clear();
                self.inbase = self.in_hash;
                self.err = true;
            }
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Data is waiting to be sent.
    pub fn waiting(&self) -> bool {
        self.outbox.is_some()
    }

    /// An inbound frame is expected (peer advertised more, or a packet is
    /// partially received).
    pub fn awaiting(&self) -> bool {
        self.more || !self.in_cache.is_empty()
    }

    /// Sending or expecting frames.
    pub fn busy(&self) -> bool {
        self.waiting() || self.awaiting()
    }

    /// A frame should be transmitted right now.
    pub fn pending(&self) -> bool {
        if self.err {
            return false;
        }
        self.flush || self.frame_payload(self.out_sent).is_some()
    }

    /// True until an unrecoverable failure was hit.
    pub fn ok(&self) -> bool {
        !self.err
    }

    /// Clear the error state (the session restarts from the chain bases).
    pub fn clear(&mut self) -> &mut Self {
        self.err = false;
        self
    }
}
