//! Time-division mesh scheduling for shared half-duplex radio mediums.
//!
//! One [`Tmesh`] exists per joined community. It owns an arena of
//! [`Tempo`]s (the community signal, an advertising beacon, and
//! point-to-point streams), a list of [`Mote`]s (discovered peers), and a
//! single in-flight [`Knock`]. The injected [`Driver`] supplies the
//! mechanism: window math, medium binding, and the actual transceiving.
//!
//! The cooperative cycle is: [`Tmesh::schedule`] picks the next due tempo
//! and hands the driver a knock; the driver completes it out-of-band and
//! the embedder reports the result through [`Tmesh::knocked`], which
//! drains the completion synchronously (no interrupt-context re-entry).

mod driver;
mod tempo;

pub use driver::{Driver, Knock, KnockOutcome};
pub use tempo::{Direction, Tempo, TempoId, TempoKind};

use sha2::{Digest, Sha256};

use crate::core::{KNOCK_FRAME_SIZE, TEMPO_MISS_MAX, TmeshError};
use crate::hashname::Hashname;
use crate::packet::Packet;

const ADVERT_SHORT: usize = 5;
const ADVERT_ROUTE: usize = 4;

/// A discovered peer on the shared medium.
pub struct Mote {
    link: Hashname,
    signal: Option<TempoId>,
    stream: Option<TempoId>,
    route: u32,
}

impl Mote {
    /// The peer's hashname (short-extended for beacon-discovered motes
    /// until a handshake completes).
    pub fn link(&self) -> &Hashname {
        &self.link
    }

    /// Their signal tempo, once tracked.
    pub fn signal(&self) -> Option<TempoId> {
        self.signal
    }

    /// The private stream tempo, once established.
    pub fn stream(&self) -> Option<TempoId> {
        self.stream
    }

    /// Most recent route block from the peer.
    pub fn route(&self) -> u32 {
        self.route
    }
}

/// One joined community: tempo arena, motes, knock slot, driver.
pub struct Tmesh<D: Driver> {
    driver: D,
    id: Hashname,
    community: String,
    community_secret: [u8; 32],
    at: u32,
    tempos: Vec<Option<Tempo>>,
    motes: Vec<Option<Mote>>,
    signal: Option<TempoId>,
    beacon: Option<TempoId>,
    knock: Option<Knock>,
    route: u32,
    seen: [u8; ADVERT_SHORT],
}

impl<D: Driver> Tmesh<D> {
    /// Join a community under this endpoint's hashname, with an optional
    /// shared password strengthening the community keys.
    pub fn new(id: Hashname, community: &str, password: Option<&str>, driver: D) -> Self {
        let mut h = Sha256::new();
        h.update(community.as_bytes());
        h.update([0u8]);
        if let Some(pass) = password {
            h.update(pass.as_bytes());
        }
        Self {
            driver,
            id,
            community: community.to_string(),
            community_secret: h.finalize().into(),
            at: 0,
            tempos: Vec::new(),
            motes: Vec::new(),
            signal: None,
            beacon: None,
            knock: None,
            route: 0,
            seen: [0u8; ADVERT_SHORT],
        }
    }

    /// The community name.
    pub fn community(&self) -> &str {
        &self.community
    }

    /// Last scheduling time.
    pub fn at(&self) -> u32 {
        self.at
    }

    /// The in-flight knock, if one is outstanding.
    pub fn knock(&self) -> Option<&Knock> {
        self.knock.as_ref()
    }

    /// The beacon tempo handle, once created.
    pub fn beacon(&self) -> Option<TempoId> {
        self.beacon
    }

    /// Our signal tempo handle, once created.
    pub fn signal(&self) -> Option<TempoId> {
        self.signal
    }

    /// Borrow a tempo.
    pub fn tempo(&self, id: TempoId) -> Option<&Tempo> {
        self.tempos.get(id.0)?.as_ref()
    }

    /// Borrow a tempo mutably (e.g. to pull received frames).
    pub fn tempo_mut(&mut self, id: TempoId) -> Option<&mut Tempo> {
        self.tempos.get_mut(id.0)?.as_mut()
    }

    /// Update and advertise our route value.
    pub fn set_route(&mut self, route: u32) {
        self.route = route;
    }

    // =========================================================================
    // Mote management
    // =========================================================================

    /// Find or create the mote for a linked peer; creating one also brings
    /// up our own signal tempo and the peer's private stream.
    pub fn mote(&mut self, link: Hashname) -> Result<usize, TmeshError> {
        if let Some(i) = self.mote_index(&link) {
            return Ok(i);
        }
        if self.signal.is_none() {
            let secret = self.derive_secret(b"signal", self.id.bin());
            let id = self.tempo_create(
                TempoKind::Signal { qos_ping: false, qos_pong: false, beacon: false },
                secret,
            )?;
            self.signal = Some(id);
        }

        // One-time secret for the private stream, from both hashnames.
        let (lo, hi) = if self.id.bin() <= link.bin() {
            (self.id, link)
        } else {
            (link, self.id)
        };
        let mut keying = lo.bin().to_vec();
        keying.extend_from_slice(hi.bin());
        let secret = self.derive_secret(b"stream", &keying);
        let stream = self.tempo_create(
            TempoKind::Stream { requesting: true, accepting: false, direction: Direction::Rx },
            secret,
        )?;

        let their_signal_secret = self.derive_secret(b"signal", link.bin());
        let their_signal = self.tempo_create(
            TempoKind::Signal { qos_ping: false, qos_pong: false, beacon: false },
            their_signal_secret,
        )?;

        let index = self.motes.len();
        self.motes.push(Some(Mote {
            link,
            signal: Some(their_signal),
            stream: Some(stream),
            route: 0,
        }));
        if let Some(t) = self.tempo_mut(stream) {
            t.mote = Some(index);
            t.lost = true; // lost until first rx
        }
        if let Some(t) = self.tempo_mut(their_signal) {
            t.mote = Some(index);
        }
        Ok(index)
    }

    /// The mote tracking a hashname, if any.
    pub fn moted(&self, link: &Hashname) -> Option<&Mote> {
        self.motes
            .iter()
            .flatten()
            .find(|m| m.link == *link || m.link.short_eq(link))
    }

    fn mote_index(&self, link: &Hashname) -> Option<usize> {
        self.motes
            .iter()
            .position(|m| m.as_ref().is_some_and(|m| m.link == *link))
    }

    /// Drop a mote and free its tempos.
    pub fn demote(&mut self, index: usize) -> Result<(), TmeshError> {
        let Some(Some(mote)) = self.motes.get_mut(index).map(Option::take) else {
            return Err(TmeshError::Idle);
        };
        for id in [mote.signal, mote.stream].into_iter().flatten() {
            self.tempo_free(id);
        }
        Ok(())
    }

    /// Queue a packet onto a mote's private stream, waking it from idle.
    pub fn mote_send(&mut self, index: usize, packet: Packet) -> Result<(), TmeshError> {
        let stream = self
            .motes
            .get(index)
            .and_then(|m| m.as_ref())
            .and_then(|m| m.stream)
            .ok_or(TmeshError::Idle)?;
        let tempo = self.tempo_mut(stream).ok_or(TmeshError::Idle)?;
        let frames = tempo.frames.as_mut().ok_or(TmeshError::Idle)?;
        frames
            .send(packet)
            .map_err(|e| TmeshError::Driver(e.to_string()))?;
        tempo.idle = false;
        Ok(())
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Pick the next due tempo at time `at` and hand the driver a knock.
    /// A fresh community with no motes schedules its advertising beacon.
    pub fn schedule(&mut self, at: u32) -> Result<&Knock, TmeshError> {
        if self.knock.is_some() {
            return Err(TmeshError::KnockBusy);
        }
        self.at = at;

        if self.beacon.is_none() {
            let secret = self.derive_secret(b"beacon", &[]);
            let id = self.tempo_create(
                TempoKind::Signal { qos_ping: false, qos_pong: false, beacon: true },
                secret,
            )?;
            self.beacon = Some(id);
        }

        // Catch every eligible tempo's window up past `at`.
        let candidates = self.eligible();
        for id in &candidates {
            loop {
                let Some(tempo) = self.tempos[id.0].as_mut() else { break };
                if tempo.at > at {
                    break;
                }
                let seed = tempo.seed();
                self.driver.advance(tempo, &seed)?;
                tempo.seq = tempo.seq.wrapping_add(1);
                if tempo.at <= at {
                    // The driver refused to move it forward; skip it.
                    tempo.c_skip = tempo.c_skip.saturating_add(1);
                    break;
                }
            }
        }

        // Driver-tie-broken pick of the next tempo.
        let mut best: Option<TempoId> = None;
        for id in candidates {
            let Some(tempo) = self.tempos[id.0].as_ref() else { continue };
            if tempo.at <= at {
                continue;
            }
            match best.and_then(|b| self.tempos[b.0].as_ref()) {
                None => best = Some(id),
                Some(cur) => {
                    if self.driver.sort(cur, tempo) == std::cmp::Ordering::Greater {
                        best = Some(id);
                    }
                }
            }
        }
        let target = best.ok_or(TmeshError::Idle)?;

        let knock = self.build_knock(target)?;
        self.driver.schedule(&knock)?;
        self.knock = Some(knock);
        Ok(self.knock.as_ref().ok_or(TmeshError::Idle)?)
    }

    /// Tempos that policy allows scheduling right now.
    fn eligible(&self) -> Vec<TempoId> {
        let mut out = Vec::new();
        let has_motes = self.motes.iter().flatten().next().is_some();
        if let Some(b) = self.beacon {
            // The beacon stands down once the community has peers.
            if !has_motes {
                out.push(b);
            }
        }
        if has_motes {
            if let Some(s) = self.signal {
                out.push(s);
            }
        }
        for mote in self.motes.iter().flatten() {
            if let Some(s) = mote.signal {
                out.push(s);
            }
            if let Some(s) = mote.stream {
                if let Some(t) = self.tempo(s) {
                    // hold = never schedule; idle or lost streams only
                    // listen, which still lets them resync.
                    if !t.hold {
                        out.push(s);
                    }
                }
            }
        }
        out
    }

    fn build_knock(&mut self, target: TempoId) -> Result<Knock, TmeshError> {
        let our_short = self.id.short_bin();
        let route = self.route;
        let tempo = self.tempos[target.0].as_mut().ok_or(TmeshError::Idle)?;

        let mut frame = [0u8; KNOCK_FRAME_SIZE];
        let is_tx = match &mut tempo.kind {
            TempoKind::Signal { beacon: true, .. } => {
                // Alternate advertising and seeking.
                let tx = tempo.seq % 2 == 0;
                if tx {
                    frame[..ADVERT_SHORT].copy_from_slice(&our_short);
                    frame[ADVERT_SHORT..ADVERT_SHORT + ADVERT_ROUTE]
                        .copy_from_slice(&route.to_le_bytes());
                }
                tx
            }
            TempoKind::Signal { .. } => {
                // Our own signal transmits; tracked peer signals listen.
                let tx = tempo.mote.is_none();
                if tx {
                    frame[..ADVERT_SHORT].copy_from_slice(&our_short);
                    frame[ADVERT_SHORT..ADVERT_SHORT + ADVERT_ROUTE]
                        .copy_from_slice(&route.to_le_bytes());
                }
                tx
            }
            TempoKind::Stream { direction, .. } => {
                let pending = tempo
                    .frames
                    .as_ref()
                    .map(|f| f.pending() && !tempo.idle)
                    .unwrap_or(false);
                *direction = if pending { Direction::Tx } else { Direction::Rx };
                if pending {
                    if let Some(frames) = tempo.frames.as_ref() {
                        let out = frames
                            .outbox()
                            .map_err(|e| TmeshError::Driver(e.to_string()))?;
                        frame[..out.len().min(KNOCK_FRAME_SIZE)]
                            .copy_from_slice(&out[..out.len().min(KNOCK_FRAME_SIZE)]);
                    }
                }
                pending
            }
        };

        Ok(Knock {
            tempo: target,
            is_tx,
            start: tempo.at,
            stop: tempo.at,
            frame,
            nonce: tempo.seed(),
            adhoc: 0,
        })
    }

    // =========================================================================
    // Knock completion
    // =========================================================================

    /// Drain a completed knock. A successful receive returns the tempo so
    /// the caller can pull reassembled packets from its frame transport.
    pub fn knocked(&mut self, outcome: KnockOutcome) -> Result<Option<TempoId>, TmeshError> {
        let knock = self.knock.take().ok_or(TmeshError::NoKnock)?;
        let target = knock.tempo;
        let our_short = self.id.short_bin();

        if outcome.gone {
            return Ok(self.tempo_gone(target));
        }
        let Some(tempo) = self.tempos[target.0].as_mut() else {
            return Ok(None);
        };

        if outcome.err {
            if !knock.is_tx {
                tempo.c_miss = tempo.c_miss.saturating_add(1);
                if tempo.is_stream() && tempo.c_miss >= TEMPO_MISS_MAX {
                    tracing::debug!(tempo = target.0, "stream lost after missed windows");
                    tempo.lost = true;
                }
            }
            return Ok(None);
        }

        if knock.is_tx {
            let is_stream = tempo.is_stream();
            tempo.c_tx = tempo.c_tx.saturating_add(1);
            if let Some(frames) = tempo.frames.as_mut() {
                if frames.waiting() || frames.pending() {
                    let _ = frames.sent();
                }
                // Power policy: a drained stream goes idle until new data.
                if is_stream && !frames.busy() && !frames.pending() {
                    tempo.idle = true;
                }
            }
            return Ok(None);
        }

        // Successful receive.
        tempo.c_rx = tempo.c_rx.saturating_add(1);
        tempo.c_miss = 0;
        tempo.lost = false;
        tempo.rssi_sample(outcome.rssi);
        let is_advert = tempo.is_beacon() || (tempo.is_signal() && tempo.mote.is_some());
        let Some(frame) = outcome.frame else {
            return Ok(None);
        };

        if is_advert {
            self.advert_received(&frame, &our_short);
            return Ok(Some(target));
        }

        let Some(tempo) = self.tempos[target.0].as_mut() else {
            return Ok(None);
        };
        if let Some(frames) = tempo.frames.as_mut() {
            match frames.inbox(&frame) {
                Ok(()) => return Ok(Some(target)),
                Err(err) => {
                    tempo.c_bad = tempo.c_bad.saturating_add(1);
                    tracing::debug!(tempo = target.0, %err, "bad frame dropped");
                    return Ok(None);
                }
            }
        }
        Ok(Some(target))
    }

    /// Handle an advertisement heard on the beacon or a tracked signal.
    fn advert_received(&mut self, frame: &[u8; KNOCK_FRAME_SIZE], our_short: &[u8; ADVERT_SHORT]) {
        let mut short = [0u8; ADVERT_SHORT];
        short.copy_from_slice(&frame[..ADVERT_SHORT]);
        if &short == our_short || short == self.seen || short == [0u8; ADVERT_SHORT] {
            return;
        }
        let route = u32::from_le_bytes([
            frame[ADVERT_SHORT],
            frame[ADVERT_SHORT + 1],
            frame[ADVERT_SHORT + 2],
            frame[ADVERT_SHORT + 3],
        ]);

        let mut bin = [0u8; 32];
        bin[..ADVERT_SHORT].copy_from_slice(&short);
        let id = Hashname::from_bin(bin);
        if !self.driver.accept(&id, route) {
            tracing::trace!(peer = %id.short(), "driver ignored advertisement");
            return;
        }
        self.seen = short;
        match self.mote(id) {
            Ok(index) => {
                if let Some(Some(mote)) = self.motes.get_mut(index) {
                    mote.route = route;
                }
                tracing::debug!(peer = %id.short(), route, "mote discovered from advertisement");
            }
            Err(err) => {
                tracing::warn!(peer = %id.short(), %err, "mote creation failed");
            }
        }
    }

    /// Driver declared the tempo's peer gone. A dead private stream drops
    /// its whole mote, which puts the beacon back on the air; other tempos
    /// fall to lost (or hold, when already idle).
    fn tempo_gone(&mut self, target: TempoId) -> Option<TempoId> {
        let (is_stream, idle, mote) = match self.tempos[target.0].as_ref() {
            Some(t) => (t.is_stream(), t.idle, t.mote),
            None => return None,
        };
        if is_stream {
            if let Some(index) = mote {
                tracing::debug!(tempo = target.0, mote = index, "stream gone, dropping mote");
                let _ = self.demote(index);
                return None;
            }
        }
        if let Some(tempo) = self.tempos[target.0].as_mut() {
            if idle {
                tempo.hold = true;
            } else {
                tempo.lost = true;
            }
        }
        None
    }

    // =========================================================================
    // Time rebasing
    // =========================================================================

    /// Subtract `at` cycles from every window time, so the embedder can
    /// prevent 32-bit clock overflow. Call before a schedule.
    pub fn rebase(&mut self, at: u32) {
        self.at = self.at.saturating_sub(at);
        for tempo in self.tempos.iter_mut().flatten() {
            tempo.at = tempo.at.saturating_sub(at);
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn derive_secret(&self, purpose: &[u8], keying: &[u8]) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(purpose);
        h.update(self.community_secret);
        h.update(keying);
        h.finalize().into()
    }

    fn tempo_create(&mut self, kind: TempoKind, secret: [u8; 32]) -> Result<TempoId, TmeshError> {
        let id = TempoId(self.tempos.len());
        let mut tempo = Tempo::new(id, kind, secret, self.at);
        let seed = tempo.seed();
        self.driver.medium(&mut tempo, &seed, 0)?;
        if tempo.medium == 0 {
            return Err(TmeshError::Driver("driver left medium unbound".into()));
        }
        // First window.
        self.driver.advance(&mut tempo, &seed)?;
        tempo.seq = tempo.seq.wrapping_add(1);
        self.tempos.push(Some(tempo));
        Ok(id)
    }

    fn tempo_free(&mut self, id: TempoId) {
        if let Some(tempo) = self.tempos.get_mut(id.0).and_then(Option::take) {
            self.driver.free_tempo(&tempo);
        }
    }
}
