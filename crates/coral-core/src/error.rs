//! Error types of the runtime and their mapping onto the integer `stat` ABI.

use thiserror::Error;

use crate::transport::TransportError;
use crate::types::stat;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, CoralError>;

/// Errors that can occur in runtime operations.
#[derive(Error, Debug)]
pub enum CoralError {
    /// A peer involved in the operation has stopped.
    #[error("Image stopped")]
    StoppedImage,

    /// A peer involved in the operation has failed.
    #[error("Image failed")]
    FailedImage,

    /// The image set of a `sync_images` call contains a duplicate.
    #[error("Duplicate image {0} in sync images set")]
    DuplicateSyncImage(crate::types::ImageIndex),

    /// A lock slot on this image is already held by this image.
    #[error("Already locked")]
    MutexSelfDeadlock,

    /// Memory or window allocation failed.
    #[error("Failed to allocate {size} bytes")]
    AllocationFailed {
        /// Requested size in bytes.
        size: usize,
    },

    /// A reference chain contains an unknown node, array-ref or vector kind.
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// A descriptor or reference rank is outside the supported range.
    #[error("Rank {0} out of range")]
    RankOutOfRange(usize),

    /// A subscript or extent is outside the referenced bounds.
    #[error("Extent out of range: {0}")]
    ExtentOutOfRange(String),

    /// The destination extent does not match and cannot be reallocated.
    #[error("Extent mismatch on non-reallocatable destination (needed {needed}, have {have})")]
    NonReallocatableExtentMismatch {
        /// Element count the reference selects.
        needed: usize,
        /// Element count the destination provides.
        have: usize,
    },

    /// More than one non-scalar array part in a single reference chain.
    #[error("Rank out of range: two or more array parts in reference chain")]
    DoubleArrayReference,

    /// No conversion exists between the two element types/kinds.
    #[error("Unsupported type conversion from type {from_type:?} kind {from_kind} to type {to_type:?} kind {to_kind}")]
    TypeConversion {
        /// Source element type.
        from_type: crate::types::ElemType,
        /// Source kind.
        from_kind: u32,
        /// Destination element type.
        to_type: crate::types::ElemType,
        /// Destination kind.
        to_kind: u32,
    },

    /// A feature the build or transport does not provide.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The runtime has already been finalized.
    #[error("Runtime already finalized")]
    Finalized,

    /// Control value: this image is shutting down with the given exit code.
    ///
    /// Not an error in the usual sense; the fleet runner unwinds the image's
    /// closure when it sees this. A process-per-image embedding maps it to
    /// `process::exit`.
    #[error("Image shutdown with exit code {code}")]
    Shutdown {
        /// Process exit code.
        code: i32,
    },

    /// An error reported by the underlying transport.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl CoralError {
    /// Create an invalid-reference error.
    pub fn invalid_reference(msg: impl Into<String>) -> Self {
        Self::InvalidReference(msg.into())
    }

    /// Create an extent error.
    pub fn extent(msg: impl Into<String>) -> Self {
        Self::ExtentOutOfRange(msg.into())
    }

    /// Create an unsupported-feature error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// The integer `stat` code this error reports.
    pub fn stat_code(&self) -> i32 {
        match self {
            CoralError::StoppedImage | CoralError::Finalized => stat::STOPPED_IMAGE,
            CoralError::FailedImage => stat::FAILED_IMAGE,
            CoralError::Transport(e) if e.is_proc_failed() => stat::FAILED_IMAGE,
            CoralError::DuplicateSyncImage(_) => stat::DUP_SYNC_IMAGES,
            CoralError::MutexSelfDeadlock => stat::ALREADY_LOCKED,
            CoralError::Shutdown { code } => *code,
            _ => stat::GENERIC,
        }
    }

}

/// Write `msg` into a caller-provided fixed-width message buffer, padding the
/// remainder with ASCII spaces. Longer messages are truncated.
pub fn fill_errmsg(buf: &mut [u8], msg: &str) {
    let bytes = msg.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
    for b in &mut buf[n..] {
        *b = b' ';
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_codes() {
        assert_eq!(CoralError::StoppedImage.stat_code(), stat::STOPPED_IMAGE);
        assert_eq!(CoralError::FailedImage.stat_code(), stat::FAILED_IMAGE);
        assert_eq!(CoralError::DuplicateSyncImage(2).stat_code(), stat::DUP_SYNC_IMAGES);
        assert_eq!(CoralError::MutexSelfDeadlock.stat_code(), stat::ALREADY_LOCKED);
        assert_eq!(CoralError::DoubleArrayReference.stat_code(), stat::GENERIC);
    }

    #[test]
    fn test_errmsg_padding() {
        let mut buf = [0u8; 16];
        fill_errmsg(&mut buf, "Already locked");
        assert_eq!(&buf[..14], b"Already locked");
        assert_eq!(&buf[14..], b"  ");
    }

    #[test]
    fn test_errmsg_truncation() {
        let mut buf = [0u8; 8];
        fill_errmsg(&mut buf, "a very long message");
        assert_eq!(&buf, b"a very l");
    }
}
