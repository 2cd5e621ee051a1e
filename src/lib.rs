/*!
# floppyfs

Vintage 8-bit microcomputer floppy images as mountable flat filesystems.

The crate is a two-layer translator between POSIX-style file operations and
raw disk-image bytes:

- A disk-image codec layer decodes and re-encodes ImageDisk (IMD) and CPC
  DSK/EDSK containers into a uniform sector-addressable grid with in-memory
  mutation tracking.
- A CP/M-family directory engine implements the multi-extent directory,
  block allocation, sector interleaving and file I/O on top of that grid,
  in two flavors: standard CP/M 2.2 3.5" and the BASIC (HC) 3.5" variant.

## Quick start

```rust,no_run
use floppyfs::{image, CpmFs, Dispatcher, Filesystem, Variant};
use std::path::Path;

let disk = image::open("disk.img")?;
let mut fs = CpmFs::new(disk, Variant::Basic)?;

fs.create("/HELLO.TXT")?;
fs.write("/HELLO.TXT", b"HELLO", 0)?;
fs.save(Path::new("disk.img"))?;

// host callbacks go through the locked dispatcher
let fs = CpmFs::new(image::open("disk.img")?, Variant::Basic)?;
let dispatcher = Dispatcher::new(fs);
let mut buf = [0u8; 5];
assert_eq!(dispatcher.read("/HELLO.TXT", &mut buf, 0), 5);
# Ok::<(), floppyfs::FsError>(())
```

## Modules

- `geometry`: track/head/sector arithmetic and the linear position space
- `image`: the `Disk` trait, format detection and the IMD and DSK codecs
- `filesystem`: the `Filesystem` trait, the locked dispatcher and the
  CP/M-family engine
- `error`: error types and the `Result` alias
*/

#![warn(missing_docs)]

/// Error types and Result alias
pub mod error;
/// Disk geometry and sector addressing
pub mod geometry;
/// Disk image codecs
pub mod image;
/// Filesystem engine and host dispatch
pub mod filesystem;

// Re-export common types
pub use error::{FsError, Result};
pub use filesystem::{
    CpmFs, Dispatcher, FatEntry, FileAttr, Filesystem, FsStats, Variant,
};
pub use geometry::{DiskPos, DiskProperties};
pub use image::{Disk, DskImage, ImdImage, Sector};
