#![forbid(unsafe_code)]
//! Error types for ext2view.
//!
//! # Error Taxonomy
//!
//! Two layers:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `e2v-types` | Byte-level format violations found while decoding a record |
//! | Runtime | `E2vError` | `e2v-error` (this crate) | Errors returned by the reader, the session, and the CLI |
//!
//! `e2v-error` does not depend on `e2v-types`. The `ParseError → E2vError`
//! conversion lives in `e2v-core`, which sees both:
//!
//! | ParseError Variant | E2vError Variant |
//! |--------------------|------------------|
//! | `InvalidMagic` | `BadSignature` |
//! | `InvalidField` (geometry fields) | `InvalidGeometry` |
//! | `InvalidField` (feature fields) | `UnsupportedFeature` |
//! | `InvalidField` (other) | `Format` |
//! | `InsufficientData` | `Corruption { block, detail }` |
//! | `IntegerConversion` | `Corruption { block, detail }` |
//!
//! ## Kinds
//!
//! Every variant belongs to one [`ErrorKind`]:
//!
//! | Kind | Variants |
//! |------|----------|
//! | `Io` | `Io` |
//! | `Format` | `BadSignature`, `Format`, `InvalidGeometry`, `UnsupportedFeature`, `Corruption` |
//! | `Range` | `OutOfRange` |
//! | `Type` | `NotDirectory`, `IsDirectory`, `NotRegularFile` |
//! | `Lookup` | `NotFound`, `PathNotDirectory`, `InvalidPath` |
//!
//! ## errno Mapping
//!
//! [`E2vError::to_errno`] is exhaustive (no wildcard arm), so a new variant
//! does not compile until it has an errno.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | OS error or `EIO` |
//! | `BadSignature`, `Format`, `InvalidGeometry` | `EINVAL` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |
//! | `Corruption` | `EIO` |
//! | `OutOfRange` | `ERANGE` |
//! | `NotDirectory`, `PathNotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotRegularFile`, `InvalidPath` | `EINVAL` |
//! | `NotFound` | `ENOENT` |

use std::fmt;
use thiserror::Error;

/// Coarse classification of an [`E2vError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The backing store could not supply the requested bytes.
    Io,
    /// Bad signature, inconsistent superblock, or corrupt metadata.
    Format,
    /// Group, inode, or block index out of bounds.
    Range,
    /// A directory or regular file was required.
    Type,
    /// Name resolution failed.
    Lookup,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Io => "io",
            Self::Format => "format",
            Self::Range => "range",
            Self::Type => "type",
            Self::Lookup => "lookup",
        };
        f.write_str(name)
    }
}

/// Unified error type for all ext2view operations.
#[derive(Debug, Error)]
pub enum E2vError {
    /// Operating system I/O error, including short reads on truncated images.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The superblock magic did not match.
    #[error("bad signature: expected {expected:#06x}, found {actual:#06x}")]
    BadSignature { expected: u16, actual: u16 },

    /// Structurally invalid format detected while opening the volume.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Block size, group sizing, or other geometry out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The volume or inode uses a feature this reader does not decode.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Metadata read from a live volume was inconsistent.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// An index exceeded the bound of the table or mapping it addresses.
    #[error("{what} {index} out of range (limit {limit})")]
    OutOfRange {
        what: &'static str,
        index: u64,
        limit: u64,
    },

    /// A directory operation was attempted on a non-directory inode.
    #[error("inode {ino} is not a directory")]
    NotDirectory { ino: u64 },

    /// A file operation was attempted on a directory inode.
    #[error("inode {ino} is a directory")]
    IsDirectory { ino: u64 },

    /// A regular file was required.
    #[error("inode {ino} is not a regular file")]
    NotRegularFile { ino: u64 },

    /// A path component does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An intermediate path component is not a directory.
    #[error("not a directory: {0}")]
    PathNotDirectory(String),

    /// Empty or unrooted path.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
}

impl E2vError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::BadSignature { .. }
            | Self::Format(_)
            | Self::InvalidGeometry(_)
            | Self::UnsupportedFeature(_)
            | Self::Corruption { .. } => ErrorKind::Format,
            Self::OutOfRange { .. } => ErrorKind::Range,
            Self::NotDirectory { .. } | Self::IsDirectory { .. } | Self::NotRegularFile { .. } => {
                ErrorKind::Type
            }
            Self::NotFound(_) | Self::PathNotDirectory(_) | Self::InvalidPath(_) => {
                ErrorKind::Lookup
            }
        }
    }

    /// Convert to a POSIX errno value.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::BadSignature { .. } | Self::Format(_) | Self::InvalidGeometry(_) => {
                libc::EINVAL
            }
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::OutOfRange { .. } => libc::ERANGE,
            Self::NotDirectory { .. } | Self::PathNotDirectory(_) => libc::ENOTDIR,
            Self::IsDirectory { .. } => libc::EISDIR,
            Self::NotRegularFile { .. } | Self::InvalidPath(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
        }
    }
}

/// Result alias using `E2vError`.
pub type Result<T> = std::result::Result<T, E2vError>;
