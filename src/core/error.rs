//! Error types for the HASHMESH protocol.

use thiserror::Error;

/// Errors from the packet container layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Raw buffer shorter than its own length prefix claims.
    #[error("truncated packet: head claims {claimed} bytes, {available} available")]
    Truncated {
        /// Head length from the prefix.
        claimed: usize,
        /// Bytes actually available after the prefix.
        available: usize,
    },

    /// Head of JSON length that is not a JSON object.
    #[error("invalid head: not a JSON object")]
    InvalidHead,

    /// Raw buffer too short to carry a length prefix.
    #[error("unexpected end of data")]
    UnexpectedEof,
}

/// Errors from a cipher set implementation.
#[derive(Debug, Error)]
pub enum CipherError {
    /// No registered cipher set matches the requested id.
    #[error("unknown cipher set: 0x{0:02x}")]
    UnknownSet(u8),

    /// Key material missing or of the wrong shape.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Handshake message failed verification or decryption.
    #[error("handshake verification failed")]
    VerifyFailed,

    /// AEAD decryption failed (bad tag or corrupted ciphertext).
    #[error("decryption failed")]
    DecryptFailed,

    /// AEAD encryption failed.
    #[error("encryption failed")]
    EncryptFailed,

    /// Signature did not validate.
    #[error("signature validation failed")]
    SignatureInvalid,

    /// An opaque handle from a different cipher set was passed in.
    #[error("handle belongs to a different cipher set")]
    WrongHandle,
}

/// Errors from the exchange state machine.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Cipher layer failure.
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Handshake sequence at or below the last accepted value.
    #[error("stale handshake: at {at} <= accepted {accepted}")]
    StaleHandshake {
        /// Sequence from the rejected handshake.
        at: u32,
        /// Last accepted incoming sequence.
        accepted: u32,
    },

    /// Channel traffic before any ephemeral session exists.
    #[error("exchange is down, peer must handshake first")]
    Down,

    /// Channel id outside the parity/ordering rule.
    #[error("invalid channel id {0}")]
    InvalidChannelId(u32),

    /// Packet missing a required header.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
}

/// Errors from the channel layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Operation on a channel already in the terminal state.
    #[error("channel ended")]
    Ended,

    /// Inactivity deadline elapsed.
    #[error("channel timeout")]
    Timeout,
}

/// Errors from the chunk/frame byte transport adapters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Requested size outside the allowed bounds.
    #[error("invalid size {0}")]
    InvalidSize(usize),

    /// Frame integrity chain broken; outbox must be resent.
    #[error("frame hash mismatch")]
    HashMismatch,

    /// Adapter entered an unrecoverable error state.
    #[error("adapter failed")]
    Failed,

    /// `sent()` without a pending outbound frame.
    #[error("no frame in flight")]
    NothingSent,

    /// A frame is already in flight; only one may be queued per direction.
    #[error("adapter busy")]
    Busy,
}

/// Errors from the tmesh scheduling layer.
#[derive(Debug, Error)]
pub enum TmeshError {
    /// Driver declined or failed the request.
    #[error("driver error: {0}")]
    Driver(String),

    /// No tempo is eligible for scheduling.
    #[error("nothing to schedule")]
    Idle,

    /// A knock is still outstanding.
    #[error("knock already active")]
    KnockBusy,

    /// Completion reported with no knock outstanding.
    #[error("no knock active")]
    NoKnock,
}

/// Top-level protocol errors.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Packet container error.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Cipher set error.
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Exchange error.
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    /// Channel error.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Byte transport adapter error.
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Tmesh scheduling error.
    #[error("tmesh error: {0}")]
    Tmesh(#[from] TmeshError),

    /// No mutually supported cipher set with the peer.
    #[error("no common cipher set")]
    NoCommonCipherSet,

    /// Referenced hashname is not linked.
    #[error("unknown link")]
    UnknownLink,
}
