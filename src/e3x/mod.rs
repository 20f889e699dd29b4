//! End-to-end encrypted exchange layer.
//!
//! [`LocalIdentity`] holds this endpoint's per-cipher-set keys;
//! [`Exchange`] runs the per-peer handshake and session state machine on
//! top of the [`crate::cipher`] capability traits.

mod exchange;
mod identity;

pub use exchange::Exchange;
pub use identity::LocalIdentity;

pub(crate) use identity::message_csid;
