//! Core constants and error types (always included).

pub mod constants;
mod error;

pub use constants::*;
pub use error::{
    AdapterError, ChannelError, CipherError, ExchangeError, MeshError, PacketError, TmeshError,
};
