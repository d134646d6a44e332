//! Error types for the node tree and its decoders.
//!
//! Errors travel by value. A fatal error keeps a node from being created at all;
//! a recoverable one is attached to an existing node as a [`Warning`] and parsing
//! continues. [`ErrorKind`] classifies variants so callers can tell, for example,
//! an arithmetic overflow (malformed structure) from an unmapped read (truncated
//! or hostile input).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// The main error type for tree construction and stream decoding.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to access memory of process {pid}: {source}")]
    ProcessAccess {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    // ==================== Address Translation Errors ====================
    #[error("address arithmetic overflow: {address:#x} + {offset:#x}")]
    AddressOverflow { address: u64, offset: u64 },

    #[error("address {address:#x} is not mapped")]
    NotMapped { address: u64 },

    #[error("only {available:#x} of {requested:#x} bytes are mapped at {address:#x}")]
    PartiallyMapped {
        address: u64,
        requested: u64,
        available: u64,
    },

    #[error("mapping at {address:#x} (size {size:#x}) overlaps an existing mapping")]
    OverlappingMapping { address: u64, size: u64 },

    #[error("mapping at {address:#x} has zero size")]
    EmptyMapping { address: u64 },

    // ==================== Format Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("invalid fat binary magic: {0:#x}")]
    InvalidFatMagic(u32),

    #[error("invalid dyld cache magic: expected 'dyld', got {0:?}")]
    InvalidCacheMagic([u8; 4]),

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: u64 },

    #[error("no registered {what} variant accepts this data")]
    NoMatchingVariant { what: &'static str },

    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: u64, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("{what} size must be non-zero")]
    ZeroSize { what: &'static str },

    // ==================== Stream Decoding Errors ====================
    #[error("truncated LEB128 value at offset {offset:#x}")]
    TruncatedLeb128 { offset: usize },

    #[error("LEB128 value at offset {offset:#x} overflows 64 bits")]
    Leb128Overflow { offset: usize },

    #[error("unterminated string at offset {offset:#x}")]
    UnterminatedString { offset: usize },

    #[error("unknown opcode {opcode:#04x} at offset {offset:#x}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("bind ordinal table index {index} out of range (table size {size})")]
    OrdinalOutOfRange { index: u64, size: usize },

    #[error("segment index {index} out of range ({count} segments)")]
    SegmentIndexOutOfRange { index: u8, count: usize },

    #[error("repeat count {count} exceeds the bounds of segment {segment}")]
    RepeatCountTooLarge { count: u64, segment: u8 },

    #[error("export trie node at offset {offset:#x} is reachable more than once")]
    ExportTrieCycle { offset: usize },

    #[error("export trie walk exceeded {limit} nodes")]
    ExportTrieLimit { limit: usize },

    #[error("invalid export trie at offset {offset:#x}: {reason}")]
    InvalidExportTrie { offset: usize, reason: String },

    // ==================== Node / Pointer Errors ====================
    #[error("pointer {address:#x} is not representable under mask {mask:#x}")]
    PointerNotRepresentable { address: u64, mask: u64 },

    #[error("null pointer")]
    NullPointer,

    #[error("no node contains address {address:#x}")]
    NoContainingNode { address: u64 },

    #[error("node {id} is not a {expected}")]
    UnexpectedNodeClass { id: u32, expected: &'static str },
}

/// A specialized Result type for node tree operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The byte source itself failed.
    Io,
    /// Address or size arithmetic wrapped the address space.
    Overflow,
    /// No byte is mapped at the requested address.
    NotMapped,
    /// Some, but not all, requested bytes are mapped, or a read ran past a buffer.
    Bounds,
    /// An encoded value or stream ended early.
    Truncated,
    /// The structure is recognisable but internally inconsistent.
    Malformed,
    /// An index or ordinal names something that does not exist.
    OutOfRange,
    /// The data is valid but of a kind this crate does not handle.
    Unsupported,
    /// A lookup found no node.
    NotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Io => "io",
            ErrorKind::Overflow => "overflow",
            ErrorKind::NotMapped => "not-mapped",
            ErrorKind::Bounds => "bounds",
            ErrorKind::Truncated => "truncated",
            ErrorKind::Malformed => "malformed",
            ErrorKind::OutOfRange => "out-of-range",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::NotFound => "not-found",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_)
            | Error::FileOpen { .. }
            | Error::MemoryMap { .. }
            | Error::ProcessAccess { .. } => ErrorKind::Io,

            Error::AddressOverflow { .. } | Error::Leb128Overflow { .. } => ErrorKind::Overflow,

            Error::NotMapped { .. } => ErrorKind::NotMapped,

            Error::PartiallyMapped { .. }
            | Error::BufferTooSmall { .. }
            | Error::LoadCommandOverflow { .. } => ErrorKind::Bounds,

            Error::TruncatedLeb128 { .. } | Error::UnterminatedString { .. } => {
                ErrorKind::Truncated
            }

            Error::OrdinalOutOfRange { .. }
            | Error::SegmentIndexOutOfRange { .. }
            | Error::RepeatCountTooLarge { .. }
            | Error::PointerNotRepresentable { .. } => ErrorKind::OutOfRange,

            Error::InvalidMachoMagic(_)
            | Error::InvalidFatMagic(_)
            | Error::InvalidCacheMagic(_)
            | Error::NoMatchingVariant { .. } => ErrorKind::Unsupported,

            Error::NoContainingNode { .. } | Error::NullPointer => ErrorKind::NotFound,

            Error::OverlappingMapping { .. }
            | Error::EmptyMapping { .. }
            | Error::Parse { .. }
            | Error::ZeroSize { .. }
            | Error::UnknownOpcode { .. }
            | Error::ExportTrieCycle { .. }
            | Error::ExportTrieLimit { .. }
            | Error::InvalidExportTrie { .. }
            | Error::UnexpectedNodeClass { .. } => ErrorKind::Malformed,
        }
    }

    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: u64, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }

    /// Shifts the offset carried by a stream error by `base`.
    ///
    /// Decoders report offsets relative to the slice they were handed; callers
    /// decoding a sub-slice use this to make the offset blob-relative again.
    pub fn rebased(self, base: usize) -> Self {
        match self {
            Error::TruncatedLeb128 { offset } => Error::TruncatedLeb128 {
                offset: offset + base,
            },
            Error::Leb128Overflow { offset } => Error::Leb128Overflow {
                offset: offset + base,
            },
            Error::UnterminatedString { offset } => Error::UnterminatedString {
                offset: offset + base,
            },
            other => other,
        }
    }
}

// =============================================================================
// Warnings
// =============================================================================

/// A recoverable anomaly found while building a node.
///
/// Warnings never abort construction; they describe one field or one child that
/// could not be derived.
#[derive(Debug, Clone)]
pub struct Warning {
    /// Name of the field or child collection the warning refers to
    pub property: String,
    /// Classification of the underlying problem
    pub code: ErrorKind,
    /// Human readable description
    pub description: String,
    /// The error that caused this warning, if there was one
    pub underlying: Option<Arc<Error>>,
}

impl PartialEq for Warning {
    fn eq(&self, other: &Self) -> bool {
        self.property == other.property
            && self.code == other.code
            && self.description == other.description
            && self.underlying.is_some() == other.underlying.is_some()
    }
}

impl Eq for Warning {}

impl Warning {
    /// Creates a warning from an error.
    pub fn from_error(property: impl Into<String>, error: Error) -> Self {
        Self {
            property: property.into(),
            code: error.kind(),
            description: error.to_string(),
            underlying: Some(Arc::new(error)),
        }
    }

    /// Creates a warning that has no underlying error.
    pub fn new(property: impl Into<String>, code: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            code,
            description: description.into(),
            underlying: None,
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.property, self.code, self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_and_unmapped_are_distinct() {
        let overflow = Error::AddressOverflow {
            address: u64::MAX,
            offset: 1,
        };
        let unmapped = Error::NotMapped { address: 0x1000 };
        assert_eq!(overflow.kind(), ErrorKind::Overflow);
        assert_eq!(unmapped.kind(), ErrorKind::NotMapped);
        assert_ne!(overflow.kind(), unmapped.kind());
    }

    #[test]
    fn test_warning_from_error() {
        let warning = Warning::from_error("n_strx", Error::UnterminatedString { offset: 4 });
        assert_eq!(warning.property, "n_strx");
        assert_eq!(warning.code, ErrorKind::Truncated);
        assert!(warning.underlying.is_some());
        assert!(warning.to_string().starts_with("n_strx [truncated]"));
    }

    #[test]
    fn test_warning_equality() {
        let a = Warning::from_error("n_strx", Error::UnterminatedString { offset: 4 });
        assert_eq!(a, a.clone());
        // Separately built warnings for the same error compare equal.
        let b = Warning::from_error("n_strx", Error::UnterminatedString { offset: 4 });
        assert_eq!(a, b);
        let c = Warning::from_error("n_strx", Error::UnterminatedString { offset: 8 });
        assert_ne!(a, c);
        assert_ne!(a, Warning::new("n_strx", a.code, a.description.clone()));

        let plain = Warning::new("segment", ErrorKind::Truncated, "short");
        assert_eq!(plain, Warning::new("segment", ErrorKind::Truncated, "short"));
        assert_ne!(plain, Warning::new("section", ErrorKind::Truncated, "short"));
    }

    #[test]
    fn test_rebased_offsets() {
        let err = Error::TruncatedLeb128 { offset: 3 }.rebased(0x10);
        assert!(matches!(err, Error::TruncatedLeb128 { offset: 0x13 }));
        let err = Error::NullPointer.rebased(0x10);
        assert!(matches!(err, Error::NullPointer));
    }
}
