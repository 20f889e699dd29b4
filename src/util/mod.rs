//! Byte-budget transport adapters.
//!
//! [`Chunks`] adapts packets to transports with a small variable write
//! unit (streams, serial); [`Frames`] to fixed-size frame transports
//! (radio records) with rolling-hash integrity.

mod chunks;
mod frames;

pub use chunks::Chunks;
pub use frames::Frames;
