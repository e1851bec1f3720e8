#![forbid(unsafe_code)]
//! Error types for the ext2 engine.
//!
//! # Error Taxonomy
//!
//! Two layers, same as any byte-format engine:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `e2-types` | Format violations found while decoding bytes |
//! | Runtime | `E2Error` | `e2-error` (this crate) | Errors reported to the command surface and the CLI |
//!
//! `e2-error` does not depend on `e2-types`. `ParseError` is converted at the
//! crate that knows the context:
//!
//! | ParseError | E2Error | Where |
//! |------------|---------|-------|
//! | `InvalidMagic` on the superblock | `NotAnExt2Image` | `e2-core` mount |
//! | any variant inside a directory block | `CorruptDirectory { block, .. }` | `e2-dir` |
//! | `InvalidField` during mount | `InvalidGeometry` / `UnsupportedBlockSize` / `Format` | `e2-core` mount |
//! | `InsufficientData` / `IntegerConversion` on live metadata | `Corruption { block, .. }` | `e2-inode`, `e2-core` |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`E2Error::to_errno`].
//! The match has no wildcard arm, so a new variant does not compile until it
//! has been assigned one.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption`, `CorruptDirectory` | `EIO` |
//! | `NotAnExt2Image`, `Format`, `InvalidGeometry` | `EINVAL` |
//! | `UnsupportedBlockSize` | `EOPNOTSUPP` |
//! | `NotFound`, `EntryNotFound` | `ENOENT` |
//! | `NotADirectory` | `ENOTDIR` |
//! | `IsADirectory` | `EISDIR` |
//! | `AlreadyExists` | `EEXIST` |
//! | `DirectoryNotEmpty` | `ENOTEMPTY` |
//! | `BitmapExhausted`, `DirectoryFull`, `BlockNotAllocated` | `ENOSPC` |
//! | `FileTooLarge` | `EFBIG` |
//! | `SyntaxError`, `InvalidName` | `EINVAL` |
//! | `UnknownCommand` | `ENOSYS` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

/// Unified error type for every engine operation.
///
/// Everything except `NotAnExt2Image` at mount time is local to one command:
/// the caller reports it and keeps the filesystem context.
#[derive(Debug, Error)]
pub enum E2Error {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The superblock magic did not match `0xEF53`.
    #[error("not an ext2 image: superblock magic is {actual:#06x}")]
    NotAnExt2Image { actual: u16 },

    /// Live metadata failed to decode at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    /// Structurally invalid image found during mount.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Geometry fields that are numerically impossible.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Valid ext2, but addressed with a layout this engine does not handle.
    #[error("unsupported block size: {0}")]
    UnsupportedBlockSize(String),

    /// Name did not resolve in the current directory.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("file exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// A directory-block edit referenced a name that is not in the block.
    #[error("no directory entry named {0}")]
    EntryNotFound(String),

    /// Zero or overflowing `rec_len`, or another record-level violation.
    #[error("corrupt directory block {block}: {detail}")]
    CorruptDirectory { block: u32, detail: String },

    /// No clear bit in the bitmap of the given group.
    #[error("{kind} bitmap exhausted in group {group}")]
    BitmapExhausted { kind: &'static str, group: u32 },

    /// The directory's single data block has no room for another record.
    #[error("directory block {block} is full")]
    DirectoryFull { block: u32 },

    /// The file needs triple indirection.
    #[error("file too large: needs {needed_blocks} blocks, at most {max_blocks} addressable")]
    FileTooLarge { needed_blocks: u64, max_blocks: u64 },

    /// Wrong number of arguments for a command.
    #[error("invalid syntax: {command} takes {expected} argument(s), got {got}")]
    SyntaxError {
        command: String,
        expected: usize,
        got: usize,
    },

    #[error("unsupported command: {0}")]
    UnknownCommand(String),

    /// Empty, `.`/`..`, or containing `/` or NUL.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("name too long")]
    NameTooLong,

    /// The image was opened read-only and a mutation was attempted.
    #[error("read-only filesystem")]
    ReadOnly,

    /// A write reached a logical block that has no physical block behind it.
    #[error("inode {ino}: logical block {logical} is not allocated")]
    BlockNotAllocated { ino: u32, logical: u64 },
}

impl E2Error {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::CorruptDirectory { .. } => libc::EIO,
            Self::NotAnExt2Image { .. }
            | Self::Format(_)
            | Self::InvalidGeometry(_)
            | Self::SyntaxError { .. }
            | Self::InvalidName(_) => libc::EINVAL,
            Self::UnsupportedBlockSize(_) => libc::EOPNOTSUPP,
            Self::NotFound(_) | Self::EntryNotFound(_) => libc::ENOENT,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            Self::BitmapExhausted { .. }
            | Self::DirectoryFull { .. }
            | Self::BlockNotAllocated { .. } => libc::ENOSPC,
            Self::FileTooLarge { .. } => libc::EFBIG,
            Self::UnknownCommand(_) => libc::ENOSYS,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Mount-time failures end the session; everything else is per-command.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotAnExt2Image { .. }
                | Self::Format(_)
                | Self::InvalidGeometry(_)
                | Self::UnsupportedBlockSize(_)
        )
    }
}

/// Result alias using `E2Error`.
pub type Result<T> = std::result::Result<T, E2Error>;
