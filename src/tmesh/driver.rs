//! The radio driver contract.
//!
//! The scheduler owns policy (which tempo goes next, idle/lost/hold
//! transitions); the driver owns mechanism (bit-exact timing, channel
//! hopping math, the actual transceiving). The driver performs each
//! [`Knock`] asynchronously and reports the outcome back through
//! [`crate::tmesh::Tmesh::knocked`] as a plain [`KnockOutcome`] value, so
//! the scheduler is never re-entered from interrupt context.

use std::cmp::Ordering;

use crate::core::{KNOCK_FRAME_SIZE, TmeshError};
use crate::hashname::Hashname;

use super::tempo::{Tempo, TempoId};

/// One scheduled transceive attempt on a tempo.
#[derive(Debug, Clone)]
pub struct Knock {
    /// The tempo this knock serves.
    pub tempo: TempoId,
    /// Transmit (`true`) or receive window.
    pub is_tx: bool,
    /// Window start, in scheduler time units.
    pub start: u32,
    /// Window stop; the driver may refine this.
    pub stop: u32,
    /// Outgoing frame for TX knocks; receive buffer destination for RX.
    pub frame: [u8; KNOCK_FRAME_SIZE],
    /// Window seed, for the driver's hopping math.
    pub nonce: [u8; 8],
    /// Non-zero requests an ad-hoc immediate TX / seek-until RX.
    pub adhoc: u32,
}

/// Driver-reported completion of a knock.
#[derive(Debug, Clone, Default)]
pub struct KnockOutcome {
    /// Actual start time.
    pub started: u32,
    /// Actual stop time.
    pub stopped: u32,
    /// Received signal strength (RX only).
    pub rssi: i16,
    /// Signal-to-noise (RX only).
    pub snr: i16,
    /// The received frame, for a successful RX window.
    pub frame: Option<[u8; KNOCK_FRAME_SIZE]>,
    /// The window failed (nothing heard, TX error).
    pub err: bool,
    /// The driver declares the tempo's peer gone.
    pub gone: bool,
}

/// The pluggable hardware driver.
pub trait Driver {
    /// Tie-break between two tempos both due for scheduling; `Less` means
    /// `a` knocks first.
    fn sort(&mut self, a: &Tempo, b: &Tempo) -> Ordering;

    /// A knock is ready; begin the radio operation.
    fn schedule(&mut self, knock: &Knock) -> Result<(), TmeshError>;

    /// Advance a tempo to its next window: update `at`, `chan`, and
    /// anything medium-specific, from the per-window seed.
    fn advance(&mut self, tempo: &mut Tempo, seed: &[u8; 8]) -> Result<(), TmeshError>;

    /// Bind or update a tempo's hardware medium. Called with the current
    /// medium id (0 for a fresh tempo); the driver must leave a non-zero
    /// id on the tempo to accept it.
    fn medium(&mut self, tempo: &mut Tempo, seed: &[u8; 8], medium: u32)
        -> Result<(), TmeshError>;

    /// A new neighbor appeared on the medium; `false` ignores it.
    fn accept(&mut self, id: &Hashname, route: u32) -> bool;

    /// A tempo is being dropped; release any driver resources.
    fn free_tempo(&mut self, tempo: &Tempo);
}
