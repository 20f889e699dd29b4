//! Channels: ordered, reliable packet streams multiplexed on a link.
//!
//! A channel is identified by a small wire id scoped to its link, with the
//! even/odd split decided by which side opened it. Reliable channels carry
//! a `seq` header starting at 1; out-of-order arrivals buffer in the
//! reassembly queue and [`Channel::receiving`] only ever yields the next
//! in-order packet. `ack` and `miss` headers ride on outgoing packets.
//!
//! Timeouts are cooperative: every send or receive must be followed by
//! [`Channel::process`], which arms and checks the inactivity deadline and
//! fires the handler for anything newly deliverable. An elapsed deadline
//! becomes a local synthetic error packet through the same handler path.

use crate::core::CHAN_TIMEOUT;
use crate::packet::Packet;

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanState {
    /// Opened locally or remotely, not yet confirmed by inbound traffic.
    Opening,
    /// Confirmed by traffic in both directions.
    Open,
    /// Terminal: closed, errored, or timed out.
    Ended,
}

/// Handler invoked per delivered packet (including synthetic errors).
pub type ChanHandler = Box<dyn FnMut(&mut Channel, Packet)>;

/// One logical packet stream on a link.
pub struct Channel {
    id: u32,
    typ: String,
    reliable: bool,
    state: ChanState,
    /// Reassembly queue, ascending by seq for reliable channels.
    in_q: Vec<Packet>,
    seq_out: u32,
    /// Highest contiguous seq delivered to the application.
    seq_deliver: u32,
    /// Highest seq the peer has acked of ours.
    peer_acked: u32,
    unacked: Option<Packet>,
    resend: bool,
    /// End seq once the peer signaled `end`.
    end_at: Option<u32>,
    activity: bool,
    timeout_len: u32,
    deadline: u32,
    handler: Option<ChanHandler>,
    err: Option<String>,
    err_delivered: bool,
}

impl Channel {
    /// Create a channel from an open packet (outgoing or incoming); the id
    /// is allocated/validated by the owning exchange.
    pub fn new(open: &Packet, id: u32) -> Self {
        Self {
            id,
            typ: open.get("type").unwrap_or_default().to_string(),
            reliable: open.get_uint("seq").is_some(),
            state: ChanState::Opening,
            in_q: Vec::new(),
            seq_out: 0,
            seq_deliver: 0,
            peer_acked: 0,
            unacked: None,
            resend: false,
            end_at: None,
            activity: false,
            timeout_len: CHAN_TIMEOUT,
            deadline: 0,
            handler: None,
            err: None,
            err_delivered: false,
        }
    }

    /// Wire id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Channel type string from the open.
    pub fn kind(&self) -> &str {
        &self.typ
    }

    /// Current state.
    pub fn state(&self) -> ChanState {
        self.state
    }

    /// True for reliable (sequenced) channels.
    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    /// Packets buffered in the reassembly queue.
    pub fn size(&self) -> usize {
        self.in_q.len()
    }

    /// Get or set the inactivity timeout (in `now` units); returns the
    /// current value.
    pub fn timeout(&mut self, at: Option<u32>) -> u32 {
        if let Some(len) = at {
            self.timeout_len = len;
            self.deadline = 0; // re-arm on next process
        }
        self.timeout_len
    }

    /// Register the packet handler.
    pub fn handle(&mut self, handler: ChanHandler) -> &mut Self {
        self.handler = Some(handler);
        self
    }

    // =========================================================================
    // Incoming
    // =========================================================================

    /// Process a decrypted inner packet into the reassembly queue.
    /// Duplicates are discarded, out-of-order arrivals buffer.
    pub fn receive(&mut self, inner: Packet) {
        if self.state == ChanState::Ended {
            return;
        }
        self.activity = true;
        if self.state == ChanState::Opening {
            self.state = ChanState::Open;
        }

        if let Some(err) = inner.get("err") {
            self.err = Some(err.to_string());
            self.state = ChanState::Ended;
            return;
        }

        if let Some(ack) = inner.get_uint("ack") {
            let ack = ack as u32;
            if ack > self.peer_acked {
                self.peer_acked = ack;
            }
            if let Some(last) = &self.unacked {
                if last.get_uint("seq").map(|s| s as u32).unwrap_or(0) <= self.peer_acked {
                    self.unacked = None;
                }
            }
        }
        if inner.get_raw("miss").is_some() {
            self.resend = true;
        }

        let Some(seq) = inner.get_uint("seq").map(|s| s as u32) else {
            // Unreliable: deliver in arrival order, but only content-bearing
            // packets (pure ack/miss carriers are bookkeeping).
            if !inner.body().is_empty() || inner.get("end").is_some() || self.typ_packet(&inner) {
                self.in_q.push(inner);
            }
            return;
        };

        if inner.get_bool("end") == Some(true) || inner.get("end").is_some() {
            self.end_at = Some(seq);
        }

        if seq <= self.seq_deliver || self.in_q.iter().any(|p| p.get_uint("seq") == Some(seq as u64)) {
            tracing::trace!(chan = self.id, seq, "duplicate discarded");
            return;
        }
        let pos = self
            .in_q
            .iter()
            .position(|p| p.get_uint("seq").map(|s| s as u32).unwrap_or(0) > seq)
            .unwrap_or(self.in_q.len());
        self.in_q.insert(pos, inner);
    }

    fn typ_packet(&self, p: &Packet) -> bool {
        p.get("type").is_some()
    }

    /// Pop the next in-order packet, if it has arrived.
    pub fn receiving(&mut self) -> Option<Packet> {
        if self.reliable {
            let next = self.seq_deliver + 1;
            let first = self.in_q.first()?;
            if first.get_uint("seq").map(|s| s as u32) != Some(next) {
                return None;
            }
            let p = self.in_q.remove(0);
            self.seq_deliver = next;
            if self.end_at == Some(next) {
                self.state = ChanState::Ended;
            }
            Some(p)
        } else {
            if self.in_q.is_empty() {
                return None;
            }
            Some(self.in_q.remove(0))
        }
    }

    // =========================================================================
    // Outgoing
    // =========================================================================

    /// A base packet carrying only id/ack/miss headers.
    pub fn oob(&self) -> Packet {
        let mut p = Packet::new();
        p.set_uint("c", self.id as u64);
        if self.reliable && self.seq_deliver > 0 {
            p.set_uint("ack", self.seq_deliver as u64);
        }
        if let Some(miss) = self.missing() {
            p.set_raw("miss", &miss);
        }
        p
    }

    /// Create the next sequenced outgoing packet with all bookkeeping
    /// headers stamped; the caller delivers it through the owning link.
    pub fn packet(&mut self) -> Packet {
        let mut p = self.oob();
        if self.reliable {
            self.seq_out += 1;
            p.set_uint("seq", self.seq_out as u64);
            if self.seq_out == 1 && !self.typ.is_empty() {
                p.set("type", &self.typ);
            }
        } else if self.seq_out == 0 {
            self.seq_out = 1;
            if !self.typ.is_empty() {
                p.set("type", &self.typ);
            }
        }
        p
    }

    /// Record a packet as sent (kept for retransmission until acked).
    pub fn sent(&mut self, p: &Packet) {
        self.activity = true;
        if self.reliable && p.get_uint("seq").is_some() {
            self.unacked = Some(p.clone());
        }
    }

    /// Seq values missing below the highest buffered arrival.
    fn missing(&self) -> Option<String> {
        if !self.reliable || self.in_q.is_empty() {
            return None;
        }
        let have: Vec<u32> = self
            .in_q
            .iter()
            .filter_map(|p| p.get_uint("seq").map(|s| s as u32))
            .collect();
        let top = *have.iter().max()?;
        let missing: Vec<String> = (self.seq_deliver + 1..top)
            .filter(|s| !have.contains(s))
            .map(|s| s.to_string())
            .collect();
        if missing.is_empty() {
            return None;
        }
        Some(format!("[{}]", missing.join(",")))
    }

    // =========================================================================
    // Recovery and errors
    // =========================================================================

    /// Recovery hooks: `false` forces timeout tracking to restart (after a
    /// fresh handshake); `true` cancels any pending timeout and requests a
    /// re-send of the last unacknowledged packet (after an exchange
    /// resync).
    pub fn sync(&mut self, resync: bool) {
        self.deadline = 0;
        if resync {
            self.resend = self.unacked.is_some();
        } else {
            self.activity = true;
        }
    }

    /// Manufacture a local-only terminal error, delivered on next
    /// [`Channel::process`].
    pub fn err(&mut self, reason: &str) {
        if self.err.is_none() {
            self.err = Some(reason.to_string());
        }
        self.state = ChanState::Ended;
    }

    /// Drive timeouts and handler delivery. Returns a packet to retransmit
    /// through the link, if one is due.
    pub fn process(&mut self, now: u32) -> Option<Packet> {
        // Arm or push out the inactivity deadline.
        if self.state != ChanState::Ended && self.timeout_len > 0 {
            if self.deadline == 0 || self.activity {
                self.deadline = now.saturating_add(self.timeout_len);
            }
        }
        self.activity = false;

        if self.state != ChanState::Ended
            && self.deadline > 0
            && now >= self.deadline
        {
            tracing::debug!(chan = self.id, now, "channel timeout");
            self.err("timeout");
        }

        // Deliver anything newly in order, then any terminal error, through
        // the handler.
        if let Some(mut handler) = self.handler.take() {
            while let Some(p) = self.receiving() {
                handler(self, p);
            }
            if self.state == ChanState::Ended && !self.err_delivered {
                if let Some(reason) = self.err.clone() {
                    self.err_delivered = true;
                    let mut ep = Packet::new();
                    ep.set_uint("c", self.id as u64).set("err", &reason);
                    handler(self, ep);
                }
            }
            self.handler = Some(handler);
        }

        if self.state == ChanState::Ended {
            self.resend = false;
            return None;
        }
        if self.resend {
            self.resend = false;
            return self.unacked.clone();
        }
        None
    }

    /// True once the channel is terminal and any error was delivered.
    pub fn is_done(&self) -> bool {
        self.state == ChanState::Ended && (self.err.is_none() || self.err_delivered)
    }

    /// The pending local error, if any.
    pub fn error(&self) -> Option<&str> {
        self.err.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn open_reliable() -> Packet {
        let mut p = Packet::new();
        p.set("type", "test").set_uint("seq", 1);
        p
    }

    fn seq_packet(c: u32, seq: u32, body: &[u8]) -> Packet {
        let mut p = Packet::new();
        p.set_uint("c", c as u64).set_uint("seq", seq as u64).set_body(body);
        p
    }

    #[test]
    fn test_out_of_order_delivery() {
        let mut ch = Channel::new(&open_reliable(), 1);
        ch.receive(seq_packet(1, 2, b"two"));
        ch.receive(seq_packet(1, 3, b"three"));
        assert!(ch.receiving().is_none());
        assert_eq!(ch.size(), 2);

        ch.receive(seq_packet(1, 1, b"one"));
        assert_eq!(ch.receiving().unwrap().body(), b"one");
        assert_eq!(ch.receiving().unwrap().body(), b"two");
        assert_eq!(ch.receiving().unwrap().body(), b"three");
        assert!(ch.receiving().is_none());
    }

    #[test]
    fn test_duplicates_discarded() {
        let mut ch = Channel::new(&open_reliable(), 1);
        ch.receive(seq_packet(1, 1, b"one"));
        ch.receive(seq_packet(1, 1, b"one again"));
        assert_eq!(ch.size(), 1);
        assert_eq!(ch.receiving().unwrap().body(), b"one");
        // Already delivered seqs are also dropped.
        ch.receive(seq_packet(1, 1, b"late"));
        assert!(ch.receiving().is_none());
    }

    #[test]
    fn test_opening_to_open_on_receive() {
        let mut ch = Channel::new(&open_reliable(), 1);
        assert_eq!(ch.state(), ChanState::Opening);
        ch.receive(seq_packet(1, 1, b""));
        assert_eq!(ch.state(), ChanState::Open);
    }

    #[test]
    fn test_packet_stamps_seq_and_ack() {
        let mut ch = Channel::new(&open_reliable(), 5);
        let first = ch.packet();
        assert_eq!(first.get_uint("c"), Some(5));
        assert_eq!(first.get_uint("seq"), Some(1));
        assert_eq!(first.get("type"), Some("test"));

        ch.receive(seq_packet(5, 1, b"in"));
        ch.receiving();
        let second = ch.packet();
        assert_eq!(second.get_uint("seq"), Some(2));
        assert_eq!(second.get_uint("ack"), Some(1));
        assert!(second.get("type").is_none());
    }

    #[test]
    fn test_miss_header_lists_gaps() {
        let mut ch = Channel::new(&open_reliable(), 1);
        ch.receive(seq_packet(1, 4, b""));
        let p = ch.oob();
        assert_eq!(p.get_raw("miss").unwrap(), "[1,2,3]");
    }

    #[test]
    fn test_timeout_fires_exactly_once() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut ch = Channel::new(&open_reliable(), 1);
        ch.timeout(Some(10));
        let sink = fired.clone();
        ch.handle(Box::new(move |_, p| {
            sink.borrow_mut().push(p.get("err").map(str::to_string));
        }));

        ch.process(100); // arms deadline at 110
        ch.process(105);
        assert_ne!(ch.state(), ChanState::Ended);
        assert!(fired.borrow().is_empty());

        ch.process(110);
        assert_eq!(ch.state(), ChanState::Ended);
        assert_eq!(fired.borrow().len(), 1);
        assert_eq!(fired.borrow()[0], Some("timeout".to_string()));

        // Further processing never re-fires.
        ch.process(200);
        assert_eq!(fired.borrow().len(), 1);
    }

    #[test]
    fn test_activity_pushes_deadline() {
        let mut ch = Channel::new(&open_reliable(), 1);
        ch.timeout(Some(10));
        ch.process(100); // deadline 110
        ch.receive(seq_packet(1, 1, b""));
        ch.process(109); // activity re-arms to 119
        ch.process(112);
        assert_ne!(ch.state(), ChanState::Ended);
        ch.process(119);
        assert_eq!(ch.state(), ChanState::Ended);
    }

    #[test]
    fn test_ack_clears_unacked_and_resync_resends() {
        let mut ch = Channel::new(&open_reliable(), 1);
        let p = ch.packet();
        ch.sent(&p);

        // Resync requests a retransmit of the unacked packet.
        ch.sync(true);
        let resend = ch.process(1).unwrap();
        assert_eq!(resend.get_uint("seq"), Some(1));

        // Peer ack clears it; a later resync has nothing to send.
        let mut ack = Packet::new();
        ack.set_uint("c", 1).set_uint("ack", 1);
        ch.receive(ack);
        ch.sync(true);
        assert!(ch.process(2).is_none());
    }

    #[test]
    fn test_local_err_delivered() {
        let fired = Rc::new(RefCell::new(0u32));
        let mut ch = Channel::new(&open_reliable(), 1);
        let sink = fired.clone();
        ch.handle(Box::new(move |_, p| {
            assert_eq!(p.get("err"), Some("refused"));
            *sink.borrow_mut() += 1;
        }));
        ch.err("refused");
        ch.process(1);
        assert_eq!(*fired.borrow(), 1);
        assert!(ch.is_done());
    }

    #[test]
    fn test_remote_err_ends() {
        let mut ch = Channel::new(&open_reliable(), 1);
        let mut p = Packet::new();
        p.set_uint("c", 1).set("err", "denied");
        ch.receive(p);
        assert_eq!(ch.state(), ChanState::Ended);
        assert_eq!(ch.error(), Some("denied"));
    }

    #[test]
    fn test_end_header_closes_after_delivery() {
        let mut ch = Channel::new(&open_reliable(), 1);
        let mut last = seq_packet(1, 2, b"bye");
        last.set_bool("end", true);
        ch.receive(last);
        ch.receive(seq_packet(1, 1, b"hi"));
        assert_eq!(ch.receiving().unwrap().body(), b"hi");
        assert_eq!(ch.state(), ChanState::Open);
        assert_eq!(ch.receiving().unwrap().body(), b"bye");
        assert_eq!(ch.state(), ChanState::Ended);
    }
}
