//! # HASHMESH Protocol
//!
//! An embedded end-to-end encrypted mesh networking stack for constrained
//! devices. It provides:
//!
//! - **Identity**: 32-byte hashnames derived from public keys
//! - **Security**: pluggable cipher sets driving per-peer encrypted
//!   exchanges with replay-protected handshake rotation
//! - **Streams**: ordered, reliable channels multiplexed per link
//! - **Transports**: chunked and fixed-frame adapters for byte-budget
//!   links (serial, stream sockets, packet radios)
//! - **Scheduling**: time-division signal/stream windows for shared
//!   half-duplex radio mediums
//!
//! ## Feature Flags
//!
//! - `cs3a` (default): built-in software cipher set (x25519 +
//!   ChaCha20-Poly1305 + HKDF-SHA256)
//! - `tmesh` (default): time-division radio scheduling layer
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------+
//! |           Application                   |
//! +-----------------------------------------+
//! |           Mesh / Link / Channel         |  session + streams
//! +-----------------------------------------+
//! |           Exchange (e3x)                |  handshakes, sessions
//! +-----------------------------------------+
//! |           Packet (head + body)          |  wire container
//! +-----------------------------------------+
//! |   Chunks / Frames      |    Tmesh       |  byte budget + airtime
//! +-----------------------------------------+
//! |           Transport / Radio driver      |  embedder-supplied
//! +-----------------------------------------+
//! ```
//!
//! Everything is single-threaded and poll-driven: transports feed bytes in
//! whenever they arrive, and the embedder calls `process(now)` from its
//! run loop to drive timeouts.
//!
//! ## Example
//!
//! ```rust
//! # #[cfg(feature = "cs3a")]
//! # fn main() -> Result<(), hashmesh_protocol::MeshError> {
//! use hashmesh_protocol::{CipherRegistry, Mesh};
//!
//! // Each endpoint generates (or reloads) an identity.
//! let (mut alice, _secrets) = Mesh::generate(CipherRegistry::with_defaults())?;
//! let (mut bob, _) = Mesh::generate(CipherRegistry::with_defaults())?;
//!
//! // Bob accepts discovered peers and "echo" channels.
//! bob.on_discover("app", Box::new(|_, _| true));
//! bob.on_open("app", Box::new(|_, open| open.get_cmp("type", "echo")));
//!
//! // Alice knows Bob's public keys and knocks first.
//! let bob_keys = bob.keys().clone();
//! let bob_hn = *alice.link_get_keys(&bob_keys)?.id();
//! let handshake = alice.handshake(&bob_hn)?;
//! bob.receive(handshake, 1)?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "cs3a"))]
//! # fn main() {}
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Wire container
pub mod packet;

// Identity
pub mod hashname;

// Cipher set abstraction (CS3a implementation feature-gated within)
pub mod cipher;

// Exchange layer
pub mod e3x;

// Session layer
pub mod mesh;

// Byte transport adapters
pub mod util;

// Time-division radio scheduling (feature-gated)
#[cfg(feature = "tmesh")]
#[cfg_attr(docsrs, doc(cfg(feature = "tmesh")))]
pub mod tmesh;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cipher::{CipherRegistry, CipherSet};
    pub use crate::core::*;
    pub use crate::e3x::{Exchange, LocalIdentity};
    pub use crate::hashname::Hashname;
    pub use crate::mesh::{ChanState, Channel, Link, Mesh};
    pub use crate::packet::{Packet, PacketList};
    pub use crate::util::{Chunks, Frames};

    #[cfg(feature = "tmesh")]
    pub use crate::tmesh::{Driver, Knock, KnockOutcome, Tempo, TempoId, Tmesh};
}

// Re-export commonly used items at crate root
pub use self::cipher::CipherRegistry;
pub use self::core::MeshError;
pub use self::hashname::Hashname;
pub use self::mesh::{Channel, Link, Mesh};
pub use self::packet::Packet;
