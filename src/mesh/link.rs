//! Links: the session façade tying a hashname to an exchange and its
//! channels.
//!
//! A link never performs I/O itself; ciphertext is handed to the
//! registered transport callback. Channel creation, handshake routing, and
//! lifecycle events flow through the owning mesh.

use crate::core::{ExchangeError, MeshError};
use crate::e3x::{Exchange, LocalIdentity};
use crate::hashname::Hashname;
use crate::mesh::chan::{ChanState, Channel};
use crate::packet::Packet;

/// Transport callback: delivers one encrypted packet toward the peer.
pub type SendCallback = Box<dyn FnMut(&Hashname, Packet)>;

/// What a link wants its mesh to do after handling an inbound packet.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    /// Nothing further.
    None,
    /// The exchange came up (first sync or resync); notify link-state
    /// handlers and flush channels.
    Up,
    /// A new incoming channel open needs an accept/decline decision.
    Open(Packet),
}

/// One known remote hashname: exchange, channels, transport plumbing.
pub struct Link {
    id: Hashname,
    csid: u8,
    key: Option<Packet>,
    x: Option<Exchange>,
    chans: Vec<Channel>,
    send_cb: Option<SendCallback>,
}

impl Link {
    /// Track a hashname with no key material yet.
    pub(crate) fn new(id: Hashname) -> Self {
        Self {
            id,
            csid: 0,
            key: None,
            x: None,
            chans: Vec::new(),
            send_cb: None,
        }
    }

    /// The peer's hashname.
    pub fn id(&self) -> &Hashname {
        &self.id
    }

    /// The selected cipher-set id.
    pub fn csid(&self) -> u8 {
        self.csid
    }

    /// The peer's raw key packet, once known.
    pub fn key(&self) -> Option<&Packet> {
        self.key.as_ref()
    }

    /// Load the peer's key for `csid`, (re)creating the exchange.
    pub fn load(
        &mut self,
        local: &LocalIdentity,
        csid: u8,
        key: &Packet,
    ) -> Result<(), MeshError> {
        if self.csid == csid && self.x.is_some() {
            return Ok(());
        }
        self.x = Some(Exchange::new(local, csid, key)?);
        self.csid = csid;
        self.key = Some(key.clone());
        Ok(())
    }

    /// Attach the transport callback that performs actual byte delivery.
    pub fn set_transport(&mut self, send: SendCallback) -> &mut Self {
        self.send_cb = Some(send);
        self
    }

    /// The exchange's routing token, once an exchange exists.
    pub fn token(&self) -> Option<&[u8; 16]> {
        self.x.as_ref().map(|x| x.token())
    }

    /// Liveness probe: `Some(self)` only while the exchange has a live
    /// ephemeral session.
    pub fn up(&self) -> Option<&Self> {
        self.x.as_ref().filter(|x| x.is_up()).map(|_| self)
    }

    /// Force the link down: drop the session, end every channel.
    pub fn down(&mut self) {
        if let Some(x) = &mut self.x {
            x.down();
        }
        for ch in &mut self.chans {
            ch.err("down");
        }
    }

    // =========================================================================
    // Handshakes
    // =========================================================================

    /// Generate the current handshake for this link.
    pub fn handshake(&mut self, local: &LocalIdentity) -> Result<Packet, MeshError> {
        let x = self.x.as_mut().ok_or(MeshError::UnknownLink)?;
        Ok(x.handshake(None, local)?)
    }

    /// Generate and deliver a handshake through the transport.
    pub fn sync(&mut self, local: &LocalIdentity) -> Result<(), MeshError> {
        let hs = self.handshake(local)?;
        self.deliver(hs);
        Ok(())
    }

    /// Force a fresh handshake rotation and resend channel state.
    pub fn resync(&mut self, local: &LocalIdentity) -> Result<(), MeshError> {
        for ch in &mut self.chans {
            ch.sync(true);
        }
        self.sync(local)
    }

    /// Route a decrypted-and-validated handshake into the exchange.
    pub(crate) fn receive_handshake(
        &mut self,
        outer: &Packet,
        local: &LocalIdentity,
    ) -> Result<LinkEvent, MeshError> {
        let x = self.x.as_mut().ok_or(MeshError::UnknownLink)?;
        let was_up = x.is_up();
        let never_sent = x.at_out() == 0;
        x.sync(outer, local)?;

        // A first come-up restarts channel timing; replacing an already
        // established session also retransmits the last unacked packets,
        // since anything in flight under the old keys is gone.
        for ch in &mut self.chans {
            ch.sync(was_up);
        }
        if never_sent {
            // First contact from our side: answer so the peer can sync too.
            let hs = self.handshake(local)?;
            self.deliver(hs);
        }
        Ok(if was_up { LinkEvent::None } else { LinkEvent::Up })
    }

    // =========================================================================
    // Channel traffic
    // =========================================================================

    /// Decrypt an inbound channel packet and dispatch it to the addressed
    /// channel; unknown ids with a `type` surface as an open decision.
    pub(crate) fn receive(&mut self, outer: &Packet) -> Result<LinkEvent, MeshError> {
        let x = self.x.as_mut().ok_or(ExchangeError::Down).map_err(MeshError::from)?;
        let inner = x.receive(outer)?;
        let Some(cid) = inner.get_uint("c").map(|c| c as u32) else {
            tracing::debug!(link = %self.id.short(), "channel packet without id dropped");
            return Ok(LinkEvent::None);
        };

        if let Some(ch) = self.chans.iter_mut().find(|c| c.id() == cid) {
            ch.receive(inner);
            return Ok(LinkEvent::None);
        }
        if inner.get("type").is_some() {
            return Ok(LinkEvent::Open(inner));
        }
        tracing::debug!(link = %self.id.short(), cid, "packet for unknown channel dropped");
        Ok(LinkEvent::None)
    }

    /// Accept a new incoming channel open (after the mesh's open handlers
    /// agreed) and feed it the opening packet.
    pub(crate) fn accept_open(&mut self, open: Packet) -> Result<u32, MeshError> {
        let x = self.x.as_mut().ok_or(MeshError::UnknownLink)?;
        let cid = open
            .get_uint("c")
            .ok_or(ExchangeError::MissingHeader("c"))? as u32;
        x.cid_validate(cid)?;
        let mut ch = Channel::new(&open, cid);
        ch.receive(open);
        self.chans.push(ch);
        Ok(cid)
    }

    /// Open a new outgoing channel; the open packet's `type` names the
    /// protocol, a `seq` of 1 requests reliability. Returns the wire id.
    pub fn chan(&mut self, open: &Packet) -> Result<u32, MeshError> {
        let x = self.x.as_mut().ok_or(MeshError::UnknownLink)?;
        let cid = x.cid();
        self.chans.push(Channel::new(open, cid));
        Ok(cid)
    }

    /// Access a channel by wire id.
    pub fn channel(&mut self, cid: u32) -> Option<&mut Channel> {
        self.chans.iter_mut().find(|c| c.id() == cid)
    }

    /// Ids of the currently tracked channels.
    pub fn channels(&self) -> Vec<u32> {
        self.chans.iter().map(|c| c.id()).collect()
    }

    /// Encrypt an inner packet and deliver it through the transport.
    pub fn direct(&mut self, inner: &Packet) -> Result<(), MeshError> {
        let x = self.x.as_mut().ok_or(ExchangeError::Down).map_err(MeshError::from)?;
        let outer = x.send(inner)?;
        self.deliver(outer);
        Ok(())
    }

    /// Stamp, encrypt, and deliver the next packet on a channel.
    pub fn chan_send(&mut self, cid: u32, mut inner: Packet) -> Result<(), MeshError> {
        let ch = self
            .chans
            .iter_mut()
            .find(|c| c.id() == cid)
            .ok_or(MeshError::UnknownLink)?;
        if ch.state() == ChanState::Ended {
            return Err(MeshError::Channel(crate::core::ChannelError::Ended));
        }
        let base = ch.packet();
        inner.set_json(&base);
        ch.sent(&inner);
        self.direct(&inner)
    }

    /// Hand an already-encrypted packet to the transport.
    pub fn send(&mut self, outer: Packet) {
        self.deliver(outer);
    }

    fn deliver(&mut self, outer: Packet) {
        match &mut self.send_cb {
            Some(cb) => cb(&self.id, outer),
            None => {
                tracing::debug!(link = %self.id.short(), "no transport, packet dropped");
            }
        }
    }

    /// Drive every channel's timeouts and retransmissions; prunes channels
    /// that have fully ended.
    pub fn process(&mut self, now: u32) {
        for i in 0..self.chans.len() {
            if let Some(resend) = self.chans[i].process(now) {
                if let Some(x) = self.x.as_mut() {
                    if let Ok(outer) = x.send(&resend) {
                        match &mut self.send_cb {
                            Some(cb) => cb(&self.id, outer),
                            None => {}
                        }
                    }
                }
            }
        }
        self.chans.retain(|c| !c.is_done());
    }
}
