//! Protocol constants.
//!
//! These values are fixed by the wire protocol and MUST NOT be changed.

// =============================================================================
// PACKET CONTAINER
// =============================================================================

/// Length-prefix size on the wire (`u16` big-endian head length).
pub const HEAD_LEN_SIZE: usize = 2;

/// Head lengths below this are raw binary (e.g. a single cipher-set id
/// byte); at or above it the head must be a JSON object.
pub const HEAD_JSON_MIN: usize = 7;

// =============================================================================
// IDENTITY
// =============================================================================

/// Hashname size (SHA-256 rollup output).
pub const HASHNAME_SIZE: usize = 32;

/// Short hashname size (leading bytes, beacon/advertisement use).
pub const HASHNAME_SHORT_SIZE: usize = 5;

/// Exchange routing token size.
pub const TOKEN_SIZE: usize = 16;

// =============================================================================
// CIPHER SETS
// =============================================================================

/// Number of cipher-set registry slots.
pub const CS_MAX: usize = 4;

/// SHA-256 output size.
pub const HASH_SIZE: usize = 32;

// =============================================================================
// BYTE TRANSPORT ADAPTERS
// =============================================================================

/// Default (and maximum) chunk payload cap.
pub const CHUNK_CAP: usize = 256;

/// Minimum frame size.
pub const FRAME_MIN: usize = 16;

/// Maximum frame size.
pub const FRAME_MAX: usize = 128;

/// Reserved trailing envelope of a meta frame (hashes + flags + length +
/// frame check); meta payload space is `size - FRAME_META_RESERVED`.
pub const FRAME_META_RESERVED: usize = 14;

// =============================================================================
// CHANNELS
// =============================================================================

/// Default channel inactivity timeout, in the embedder's `now` units
/// (conventionally seconds).
pub const CHAN_TIMEOUT: u32 = 10;

// =============================================================================
// TMESH
// =============================================================================

/// Radio frame payload carried by one knock.
pub const KNOCK_FRAME_SIZE: usize = 64;

/// Missed receive windows before a stream tempo is marked lost.
pub const TEMPO_MISS_MAX: u8 = 5;
