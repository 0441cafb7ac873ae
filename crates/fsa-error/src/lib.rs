#![forbid(unsafe_code)]
//! Error types for the free-space accounting subsystem.
//!
//! # Error Taxonomy
//!
//! | Class | Variants | Effect |
//! |-------|----------|--------|
//! | Corruption | `ChecksumMismatch`, `StructuralCorruption`, `Corruption` | Group quarantined for the rest of the mount; other groups keep working |
//! | Exhaustion | `NoSpace` | Caller may consult the retry policy before giving up |
//! | Transient | `Io`, `NotReady` | Nothing is cached; a later call may succeed |
//! | Fatal lookup | `GroupOutOfRange`, `DescriptorNotLoaded` | Filesystem-level inconsistency, never retried |
//! | Consistency fault | `Accounting` | Counter invariant broken; claims are refused for the mount |
//! | Setup | `Format`, `Parse`, `InvalidGeometry`, `InvalidArgument` | Mount-time or API misuse |
//!
//! `fsa-error` does not depend on `fsa-types`; `ParseError` is converted into
//! `FsaError::Parse` / `FsaError::Corruption` by the crates that see both.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`FsaError::to_errno`].
//! The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `ChecksumMismatch` | `EBADMSG` (kernel `EFSBADCRC`) |
//! | `StructuralCorruption`, `Corruption` | `EUCLEAN` (kernel `EFSCORRUPTED`) |
//! | `GroupOutOfRange`, `DescriptorNotLoaded` | `EUCLEAN` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotReady` | `EAGAIN` |
//! | `Accounting` | `EIO` |
//! | `Format`, `Parse`, `InvalidGeometry`, `InvalidArgument` | `EINVAL` |

use thiserror::Error;

/// Unified error type for all free-space operations.
#[derive(Debug, Error)]
pub enum FsaError {
    /// Operating system I/O error. Never cached as corruption.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Live metadata could not be parsed at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// A descriptor or bitmap checksum did not verify.
    #[error("group {group}: bad {what} checksum")]
    ChecksumMismatch { group: u32, what: &'static str },

    /// A bitmap failed structural validation, or its group is quarantined.
    #[error("group {group}: invalid block bitmap at block {block}: {detail}")]
    StructuralCorruption {
        group: u32,
        block: u64,
        detail: String,
    },

    /// Group index beyond the filesystem's group count.
    #[error("group {group} out of range (group count {count})")]
    GroupOutOfRange { group: u32, count: u32 },

    /// The descriptor-table block backing this group was never loaded.
    #[error("group descriptor not loaded: group {group}, descriptor block {desc_block}")]
    DescriptorNotLoaded { group: u32, desc_block: u32 },

    /// Not enough free clusters for the requested reservation tier.
    #[error("no space left on device")]
    NoSpace,

    /// Bitmap accessed before its read completed.
    #[error("group {group}: block bitmap not loaded yet")]
    NotReady { group: u32 },

    /// A counter invariant was violated; the mount refuses further claims.
    #[error("accounting fault: {0}")]
    Accounting(String),

    /// Invalid on-disk format detected at mount time.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the caller.
    #[error("parse error: {0}")]
    Parse(String),

    /// On-disk geometry is invalid or out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Caller supplied an argument outside the accepted range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl FsaError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::ChecksumMismatch { .. } => libc::EBADMSG,
            Self::Corruption { .. }
            | Self::StructuralCorruption { .. }
            | Self::GroupOutOfRange { .. }
            | Self::DescriptorNotLoaded { .. } => libc::EUCLEAN,
            Self::NoSpace => libc::ENOSPC,
            Self::NotReady { .. } => libc::EAGAIN,
            Self::Accounting(_) => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidArgument(_) => libc::EINVAL,
        }
    }

    /// Whether this error quarantines (or reports a quarantined) group.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. }
                | Self::ChecksumMismatch { .. }
                | Self::StructuralCorruption { .. }
        )
    }

    /// Whether a later attempt at the same operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::NotReady { .. } | Self::NoSpace)
    }
}

/// Result alias using `FsaError`.
pub type Result<T> = std::result::Result<T, FsaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(FsaError, libc::c_int)> = vec![
            (FsaError::Io(std::io::Error::other("test")), libc::EIO),
            (
                FsaError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EUCLEAN,
            ),
            (
                FsaError::ChecksumMismatch {
                    group: 3,
                    what: "block bitmap",
                },
                libc::EBADMSG,
            ),
            (
                FsaError::StructuralCorruption {
                    group: 3,
                    block: 99,
                    detail: "inode table bit clear".into(),
                },
                libc::EUCLEAN,
            ),
            (FsaError::GroupOutOfRange { group: 9, count: 4 }, libc::EUCLEAN),
            (
                FsaError::DescriptorNotLoaded {
                    group: 200,
                    desc_block: 1,
                },
                libc::EUCLEAN,
            ),
            (FsaError::NoSpace, libc::ENOSPC),
            (FsaError::NotReady { group: 1 }, libc::EAGAIN),
            (FsaError::Accounting("dirty < 0".into()), libc::EIO),
            (FsaError::Format("bad magic".into()), libc::EINVAL),
            (FsaError::Parse("short".into()), libc::EINVAL),
            (FsaError::InvalidGeometry("blocks_per_group=0".into()), libc::EINVAL),
            (FsaError::InvalidArgument("too many".into()), libc::EINVAL),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(FsaError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = FsaError::ChecksumMismatch {
            group: 12,
            what: "group descriptor",
        };
        assert_eq!(err.to_string(), "group 12: bad group descriptor checksum");

        let err = FsaError::StructuralCorruption {
            group: 2,
            block: 65_537,
            detail: "inode bitmap bit clear".into(),
        };
        assert_eq!(
            err.to_string(),
            "group 2: invalid block bitmap at block 65537: inode bitmap bit clear"
        );

        assert_eq!(FsaError::NoSpace.to_string(), "no space left on device");
    }

    #[test]
    fn classification_is_disjoint_for_quarantine_and_retry() {
        let corrupt = FsaError::ChecksumMismatch {
            group: 0,
            what: "block bitmap",
        };
        assert!(corrupt.is_corruption());
        assert!(!corrupt.is_transient());

        let io = FsaError::Io(std::io::Error::other("eio"));
        assert!(io.is_transient());
        assert!(!io.is_corruption());

        let fatal = FsaError::GroupOutOfRange { group: 5, count: 5 };
        assert!(!fatal.is_transient());
        assert!(!fatal.is_corruption());
    }
}
