//! Tempos: schedulable radio timelines.

use sha2::{Digest, Sha256};

use crate::core::KNOCK_FRAME_SIZE;
use crate::util::Frames;

/// Stable handle into the community's tempo arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempoId(pub(crate) usize);

/// Window direction for stream tempos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Transmit window.
    Tx,
    /// Receive window.
    Rx,
}

/// The two tempo flavors; the variants carry their own flags, which are
/// mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TempoKind {
    /// A community broadcast timeline (signals and beacons).
    Signal {
        /// A quality-of-service ping is owed.
        qos_ping: bool,
        /// A quality-of-service pong is owed.
        qos_pong: bool,
        /// This signal is the advertising beacon.
        beacon: bool,
    },
    /// A point-to-point frame timeline.
    Stream {
        /// We are requesting this stream via our signal.
        requesting: bool,
        /// We are accepting the peer's request.
        accepting: bool,
        /// Current window direction.
        direction: Direction,
    },
}

/// One schedulable radio timeline.
pub struct Tempo {
    pub(crate) id: TempoId,
    /// Signal or stream, with flavor-specific flags.
    pub kind: TempoKind,
    /// Owning mote index, unset for our own signal and the beacon.
    pub(crate) mote: Option<usize>,
    /// Frame transport for stream tempos (and the beacon's handshakes).
    pub frames: Option<Frames>,
    /// Driver-bound medium id; zero until the driver accepts the tempo.
    pub medium: u32,
    /// Scheduler time of the next window.
    pub at: u32,
    /// Window counter, part of the hopping seed.
    pub seq: u32,
    /// Channel of the next knock, driver-computed.
    pub chan: u8,
    /// Scheduling priority, driver-tunable.
    pub priority: u8,
    /// Keying secret for hopping and stream crypto.
    pub secret: [u8; 32],
    /// Don't schedule at all.
    pub hold: bool,
    /// No pending data: skip TX windows, keep RX.
    pub idle: bool,
    /// Too many missed windows; needs re-advertisement.
    pub lost: bool,
    pub(crate) c_tx: u16,
    pub(crate) c_rx: u16,
    pub(crate) c_bad: u16,
    pub(crate) c_miss: u8,
    pub(crate) c_skip: u8,
    /// RSSI of the most recent received frame.
    pub last_rssi: i16,
    /// Strongest RSSI seen on this tempo.
    pub best_rssi: i16,
    /// Weakest RSSI seen on this tempo.
    pub worst_rssi: i16,
}

impl Tempo {
    pub(crate) fn new(id: TempoId, kind: TempoKind, secret: [u8; 32], at: u32) -> Self {
        let frames = match &kind {
            TempoKind::Stream { .. } => Frames::new(KNOCK_FRAME_SIZE).ok(),
            TempoKind::Signal { beacon: true, .. } => Frames::new(KNOCK_FRAME_SIZE).ok(),
            TempoKind::Signal { .. } => None,
        };
        Self {
            id,
            kind,
            mote: None,
            frames,
            medium: 0,
            at,
            seq: 0,
            chan: 0,
            priority: 0,
            secret,
            hold: false,
            idle: false,
            lost: false,
            c_tx: 0,
            c_rx: 0,
            c_bad: 0,
            c_miss: 0,
            c_skip: 0,
            last_rssi: 0,
            best_rssi: i16::MIN,
            worst_rssi: i16::MAX,
        }
    }

    /// This tempo's handle.
    pub fn id(&self) -> TempoId {
        self.id
    }

    /// True for signal-flavor tempos (including the beacon).
    pub fn is_signal(&self) -> bool {
        matches!(self.kind, TempoKind::Signal { .. })
    }

    /// True for the advertising beacon.
    pub fn is_beacon(&self) -> bool {
        matches!(self.kind, TempoKind::Signal { beacon: true, .. })
    }

    /// True for stream-flavor tempos.
    pub fn is_stream(&self) -> bool {
        matches!(self.kind, TempoKind::Stream { .. })
    }

    /// The owning mote's arena index, if any.
    pub fn mote_index(&self) -> Option<usize> {
        self.mote
    }

    /// The per-window seed: leading bytes of `SHA-256(secret || seq)`.
    pub fn seed(&self) -> [u8; 8] {
        let mut h = Sha256::new();
        h.update(self.secret);
        h.update(self.seq.to_le_bytes());
        let digest = h.finalize();
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        seed
    }

    /// Fold one received-frame RSSI reading into the stats.
    pub(crate) fn rssi_sample(&mut self, rssi: i16) {
        self.last_rssi = rssi;
        if rssi > self.best_rssi {
            self.best_rssi = rssi;
        }
        if rssi < self.worst_rssi {
            self.worst_rssi = rssi;
        }
    }

    /// Frames received on this tempo.
    pub fn rx_count(&self) -> u16 {
        self.c_rx
    }

    /// Frames transmitted on this tempo.
    pub fn tx_count(&self) -> u16 {
        self.c_tx
    }

    /// Frames dropped for integrity failures.
    pub fn bad_count(&self) -> u16 {
        self.c_bad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_changes_with_seq() {
        let mut t = Tempo::new(TempoId(0), TempoKind::Signal { qos_ping: false, qos_pong: false, beacon: false }, [7; 32], 0);
        let s0 = t.seed();
        t.seq += 1;
        assert_ne!(s0, t.seed());
    }

    #[test]
    fn test_kind_predicates() {
        let sig = Tempo::new(TempoId(0), TempoKind::Signal { qos_ping: false, qos_pong: false, beacon: false }, [0; 32], 0);
        assert!(sig.is_signal() && !sig.is_stream() && !sig.is_beacon());
        assert!(sig.frames.is_none());

        let beacon = Tempo::new(TempoId(1), TempoKind::Signal { qos_ping: false, qos_pong: false, beacon: true }, [0; 32], 0);
        assert!(beacon.is_beacon() && beacon.frames.is_some());

        let stream = Tempo::new(
            TempoId(2),
            TempoKind::Stream { requesting: false, accepting: false, direction: Direction::Rx },
            [0; 32],
            0,
        );
        assert!(stream.is_stream() && stream.frames.is_some());
    }

    #[test]
    fn test_rssi_stats() {
        let mut t = Tempo::new(TempoId(0), TempoKind::Signal { qos_ping: false, qos_pong: false, beacon: false }, [0; 32], 0);
        t.rssi_sample(-70);
        t.rssi_sample(-40);
        t.rssi_sample(-90);
        assert_eq!(t.last_rssi, -90);
        assert_eq!(t.best_rssi, -40);
        assert_eq!(t.worst_rssi, -90);
    }
}
