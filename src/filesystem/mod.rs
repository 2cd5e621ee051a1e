/// Filesystem engine and host-callback dispatch

/// CP/M-family directory and allocation engine
pub mod cpm;
/// Directory entry codec
pub mod fat;

pub use cpm::{CpmFs, DiskParameterBlock, Variant};
pub use fat::FatEntry;

use crate::error::Result;
use std::sync::RwLock;
use tracing::error;

/// Allocation granule of the CP/M-family filesystems
pub const BLOCK_SIZE: u32 = 2048;
/// 128-byte sub-unit of a block; directory entries count these
pub const RECORD_SIZE: u32 = 128;

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// Mode reported for the root directory
pub const DIR_MODE: u32 = S_IFDIR | 0o755;
/// Mode reported for regular files
pub const FILE_MODE: u32 = S_IFREG | 0o644;

const EIO: i32 = 5;

/// Stat data synthesized for a path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttr {
    /// File type and permission bits
    pub mode: u32,
    /// Link count; always 1 here
    pub nlink: u32,
    /// Size in bytes
    pub size: u64,
    /// Preferred I/O size (the disk's sector size)
    pub blksize: u32,
    /// 512-byte units covered by the file
    pub blocks: u64,
}

/// Filesystem-wide statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
    /// Block size in bytes
    pub block_size: u32,
    /// Fragment size in bytes (same as the block size)
    pub fragment_size: u32,
    /// Data blocks available to files
    pub blocks: u64,
    /// Unallocated data blocks
    pub blocks_free: u64,
    /// Directory slots in total
    pub files: u64,
    /// Unallocated directory slots
    pub files_free: u64,
    /// Longest possible filename
    pub name_max: u32,
}

/// The operations a mounted filesystem serves
///
/// Paths are flat: only `/` and `/<name>` exist. Every method reports
/// failures through [`crate::error::FsError`]; the [`Dispatcher`] maps them
/// onto POSIX errno codes for the host.
pub trait Filesystem {
    /// Stat a path
    fn getattr(&self, path: &str) -> Result<FileAttr>;

    /// Remove a file's primary directory entry
    fn unlink(&mut self, path: &str) -> Result<()>;

    /// Grow or shrink a file to `length` bytes
    fn truncate(&mut self, path: &str, length: u64) -> Result<()>;

    /// Check that a file exists; no handle state is kept
    fn open(&self, path: &str) -> Result<()>;

    /// Read into `buf` from `offset`, returning the bytes transferred
    fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `buf` at `offset`, extending the file if needed; returns the
    /// bytes transferred
    fn write(&mut self, path: &str, buf: &[u8], offset: u64) -> Result<usize>;

    /// Filesystem-wide statistics; only valid for `/`
    fn statfs(&self, path: &str) -> Result<FsStats>;

    /// Release a previously opened file
    fn release(&self, path: &str) -> Result<()>;

    /// Enumerate the root directory
    ///
    /// The filler is invoked once per file; returning `true` from it stops
    /// the enumeration.
    fn readdir(&self, path: &str, filler: &mut dyn FnMut(&str, &FileAttr) -> bool) -> Result<()>;

    /// Create an empty file
    fn create(&mut self, path: &str) -> Result<()>;
}

/// Locked adapter between host callbacks and a [`Filesystem`]
///
/// Host callbacks may arrive on parallel threads; one readers-writer lock
/// spans every operation, so each callback sees a consistent snapshot of
/// the directory and block map. Reads and attribute queries share the lock,
/// mutations take it exclusively. Returns follow the host convention:
/// negative errno on failure, zero or bytes transferred on success.
pub struct Dispatcher<F> {
    inner: RwLock<F>,
}

impl<F: Filesystem> Dispatcher<F> {
    /// Wrap a filesystem for host dispatch
    pub fn new(fs: F) -> Self {
        Self {
            inner: RwLock::new(fs),
        }
    }

    /// Recover the filesystem, e.g. to flush it after unmount
    pub fn into_inner(self) -> F {
        match self.inner.into_inner() {
            Ok(fs) => fs,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn status(result: Result<()>) -> i32 {
        match result {
            Ok(()) => 0,
            Err(err) => report(err),
        }
    }

    /// Stat a path into `attr`
    pub fn getattr(&self, path: &str, attr: &mut FileAttr) -> i32 {
        let Ok(fs) = self.inner.read() else {
            return -EIO;
        };

        match fs.getattr(path) {
            Ok(found) => {
                *attr = found;
                0
            }
            Err(err) => report(err),
        }
    }

    /// Remove a file
    pub fn unlink(&self, path: &str) -> i32 {
        let Ok(mut fs) = self.inner.write() else {
            return -EIO;
        };

        Self::status(fs.unlink(path))
    }

    /// Resize a file
    pub fn truncate(&self, path: &str, length: u64) -> i32 {
        let Ok(mut fs) = self.inner.write() else {
            return -EIO;
        };

        Self::status(fs.truncate(path, length))
    }

    /// Open a file
    pub fn open(&self, path: &str) -> i32 {
        let Ok(fs) = self.inner.read() else {
            return -EIO;
        };

        Self::status(fs.open(path))
    }

    /// Read into `buf`; returns bytes read or a negative errno
    pub fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> i32 {
        let Ok(fs) = self.inner.read() else {
            return -EIO;
        };

        match fs.read(path, buf, offset) {
            Ok(n) => n as i32,
            Err(err) => report(err),
        }
    }

    /// Write from `buf`; returns bytes written or a negative errno
    pub fn write(&self, path: &str, buf: &[u8], offset: u64) -> i32 {
        let Ok(mut fs) = self.inner.write() else {
            return -EIO;
        };

        match fs.write(path, buf, offset) {
            Ok(n) => n as i32,
            Err(err) => report(err),
        }
    }

    /// Query filesystem statistics into `stats`
    pub fn statfs(&self, path: &str, stats: &mut FsStats) -> i32 {
        let Ok(fs) = self.inner.read() else {
            return -EIO;
        };

        match fs.statfs(path) {
            Ok(found) => {
                *stats = found;
                0
            }
            Err(err) => report(err),
        }
    }

    /// Release a file
    pub fn release(&self, path: &str) -> i32 {
        let Ok(fs) = self.inner.read() else {
            return -EIO;
        };

        Self::status(fs.release(path))
    }

    /// Enumerate a directory through `filler`
    pub fn readdir(&self, path: &str, filler: &mut dyn FnMut(&str, &FileAttr) -> bool) -> i32 {
        let Ok(fs) = self.inner.read() else {
            return -EIO;
        };

        Self::status(fs.readdir(path, filler))
    }

    /// Create an empty file
    pub fn create(&self, path: &str) -> i32 {
        let Ok(mut fs) = self.inner.write() else {
            return -EIO;
        };

        Self::status(fs.create(path))
    }
}

/// Convert an error to its errno, logging anything that is not an expected
/// application error
fn report(err: crate::error::FsError) -> i32 {
    let code = err.errno();

    if code == -EIO {
        error!("filesystem operation failed: {}", err);
    }

    code
}
