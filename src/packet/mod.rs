//! Packet container and list utilities.
//!
//! Everything on the wire is a [`Packet`]: handshakes, channel traffic, key
//! bundles, and the inner payloads the crypto layer wraps. See
//! [`container`] for the wire format.

mod container;
mod list;

pub use container::Packet;
pub use list::PacketList;
