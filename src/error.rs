use thiserror::Error;

/// Result type alias for disk and filesystem operations
pub type Result<T> = std::result::Result<T, FsError>;

const ENOENT: i32 = 2;
const EIO: i32 = 5;
const EEXIST: i32 = 17;
const ENOSPC: i32 = 28;

/// Errors that can occur while working with disk images and their filesystems
#[derive(Debug, Error)]
pub enum FsError {
    /// I/O error occurred while reading or writing the image file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No codec recognized the image file
    #[error("unknown image format")]
    UnknownFormat,

    /// No interleave table exists for this sector count
    #[error("no sector interleave available for the current number of sectors ({sectors})")]
    UnsupportedGeometry {
        /// Sectors per head reported by the image
        sectors: u32,
    },

    /// A (track, head, sector) coordinate is out of range
    #[error("invalid {kind} number: {value} (max: {max})")]
    InvalidGeometry {
        /// Which coordinate overflowed ("track", "head" or "sector")
        kind: &'static str,
        /// Offending value
        value: u32,
        /// Largest valid value
        max: u32,
    },

    /// Sector write past the last addressable position
    #[error("invalid sector position: {pos} (max: {max})")]
    OutOfRange {
        /// Requested linear position
        pos: u32,
        /// Largest valid position
        max: u32,
    },

    /// Sector write whose payload does not match the disk's sector size
    #[error("invalid sector size: {actual} (expected: {expected})")]
    SectorSizeMismatch {
        /// Length of the rejected payload
        actual: usize,
        /// The disk's uniform sector size
        expected: u32,
    },

    /// Path absent, or parent directory is not the root
    #[error("no such file")]
    NotFound,

    /// A file with this name already exists
    #[error("file already exists")]
    AlreadyExists,

    /// Directory slots or data blocks exhausted
    #[error("no space left on the filesystem")]
    NoSpace,

    /// Malformed structure encountered while parsing an image
    #[error("corrupt image: {0}")]
    Corrupt(String),
}

impl FsError {
    /// Create a corrupt-image error with context
    pub fn corrupt<S: Into<String>>(message: S) -> Self {
        FsError::Corrupt(message.into())
    }

    /// Map this error onto the negative POSIX errno reported to the
    /// filesystem host. Expected application errors keep their own code;
    /// everything else collapses to -EIO.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => -ENOENT,
            FsError::AlreadyExists => -EEXIST,
            FsError::NoSpace => -ENOSPC,
            _ => -EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FsError::OutOfRange { pos: 1440, max: 1439 };
        assert_eq!(err.to_string(), "invalid sector position: 1440 (max: 1439)");

        let err = FsError::SectorSizeMismatch {
            actual: 256,
            expected: 512,
        };
        assert_eq!(err.to_string(), "invalid sector size: 256 (expected: 512)");
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), -2);
        assert_eq!(FsError::AlreadyExists.errno(), -17);
        assert_eq!(FsError::NoSpace.errno(), -28);
        assert_eq!(FsError::UnknownFormat.errno(), -5);
        assert_eq!(FsError::corrupt("bad tag").errno(), -5);
    }
}
