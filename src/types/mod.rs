//! Shared identifiers and error types.

use std::fmt;

/// Logical version counter used to decide when retired memory may be reclaimed.
pub type Generation = u64;

/// Number of low bits of an [`EntryRef`] addressing a slot inside a chunk.
pub const OFFSET_BITS: u32 = 10;
/// Number of slots held by a single arena chunk.
pub const CHUNK_SLOTS: usize = 1 << OFFSET_BITS;
/// Largest chunk id an [`EntryRef`] can address.
pub const MAX_CHUNKS: usize = (1 << (32 - OFFSET_BITS)) - 1;

const OFFSET_MASK: u32 = (1 << OFFSET_BITS) - 1;

/// Opaque, copyable handle naming an entry stored inside an arena.
///
/// The raw value `0` is the distinguished invalid handle. Handles carry no
/// generation tag; staleness is prevented by deferring slot reuse until no
/// reader generation can still observe the handle.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct EntryRef(u32);

impl EntryRef {
    /// The invalid handle.
    pub const INVALID: EntryRef = EntryRef(0);

    /// Builds a handle for `offset` inside chunk `chunk`.
    pub fn new(chunk: u32, offset: u32) -> Self {
        assert!((chunk as usize) < MAX_CHUNKS, "chunk id {chunk} out of range");
        assert!(offset <= OFFSET_MASK, "chunk offset {offset} out of range");
        Self(((chunk + 1) << OFFSET_BITS) | offset)
    }

    /// Reconstructs a handle from its raw integer representation.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw integer representation.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns `true` unless this is [`EntryRef::INVALID`].
    pub const fn valid(self) -> bool {
        self.0 != 0
    }

    /// Chunk id part of a valid handle.
    pub fn chunk(self) -> u32 {
        debug_assert!(self.valid(), "chunk() on invalid entry ref");
        (self.0 >> OFFSET_BITS) - 1
    }

    /// Slot offset part of a valid handle.
    pub fn offset(self) -> u32 {
        self.0 & OFFSET_MASK
    }
}

impl fmt::Debug for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid() {
            write!(f, "EntryRef({}:{})", self.chunk(), self.offset())
        } else {
            f.write_str("EntryRef(invalid)")
        }
    }
}

/// Errors surfaced by configuration and structural self-checks.
#[derive(thiserror::Error, Debug)]
pub enum TreeError {
    /// A configuration knob is outside its accepted range.
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
    /// A TOML configuration document could not be parsed.
    #[error("config: {0}")]
    Config(#[from] toml::de::Error),
    /// A structural invariant does not hold.
    #[error("corruption: {0}")]
    Corruption(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, TreeError>;
