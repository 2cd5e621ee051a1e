/// CP/M-family directory and allocation engine

use std::path::Path;

use crate::error::{FsError, Result};
use crate::filesystem::fat::{FatEntry, ALLOCATION_UNITS, ENTRY_SIZE, FILENAME_LEN, FREE_BYTE};
use crate::filesystem::{
    FileAttr, Filesystem, FsStats, BLOCK_SIZE, DIR_MODE, FILE_MODE, RECORD_SIZE,
};
use crate::geometry::DiskPos;
use crate::image::{Disk, Sector};

/// Disk Parameter Block: per-format layout constants
///
/// See <https://www.seasip.info/Cpm/format22.html> for field meanings.
#[derive(Debug, Clone, Copy)]
pub struct DiskParameterBlock {
    /// 128-byte records per track
    pub spt: u16,
    /// Block shift; 4 means 2048-byte blocks
    pub bsh: u8,
    /// Block mask
    pub blm: u8,
    /// Extent mask
    pub exm: u8,
    /// Highest block number
    pub dsm: u16,
    /// Highest directory entry number
    pub drm: u16,
    /// Directory allocation bitmap, first byte
    pub al0: u8,
    /// Directory allocation bitmap, second byte
    pub al1: u8,
    /// Checksum vector size; 0 for a fixed disk
    pub cks: u16,
    /// Reserved tracks before the directory
    pub off: u16,
}

/// CP/M 2.2 3.5" format
static CPM_DPB: DiskParameterBlock = DiskParameterBlock {
    spt: 32,
    bsh: 4,
    blm: 15,
    exm: 0,
    dsm: 341,
    drm: 127,
    al0: 0xC0,
    al1: 0,
    cks: 0,
    off: 2,
};

/// BASIC 3.5" format
static BASIC_DPB: DiskParameterBlock = DiskParameterBlock {
    spt: 32,
    bsh: 4,
    blm: 15,
    exm: 0,
    dsm: 320,
    drm: 127,
    al0: 0xC0,
    al1: 0,
    cks: 0,
    off: 0,
};

const INTERLEAVE_9: [u8; 9] = [0, 2, 4, 6, 8, 1, 3, 5, 7];
const INTERLEAVE_16: [u8; 16] = [0, 2, 4, 6, 8, 10, 12, 14, 1, 3, 5, 7, 9, 11, 13, 15];

fn interleave_for(sectors: u32) -> Option<&'static [u8]> {
    match sectors {
        9 => Some(&INTERLEAVE_9),
        16 => Some(&INTERLEAVE_16),
        _ => None,
    }
}

/// The two supported filesystem flavors
///
/// Both share the engine; they differ only in the parameter block, the
/// extent-number encoding and the continuation-extent predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Standard CP/M 2.2 on 3.5" media
    Cpm,
    /// BASIC (HC) 3.5" flavor
    Basic,
}

impl Variant {
    /// Parse a variant name as used on the command line
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cpm" => Some(Variant::Cpm),
            "hc" => Some(Variant::Basic),
            _ => None,
        }
    }

    /// The layout constants of this flavor
    pub fn dpb(&self) -> &'static DiskParameterBlock {
        match self {
            Variant::Cpm => &CPM_DPB,
            Variant::Basic => &BASIC_DPB,
        }
    }

    /// Split an extent index into the on-disk (ex_lo, ex_hi) pair
    fn encode_extent(&self, index: u32) -> (u8, u8) {
        match self {
            Variant::Cpm => ((index % 32) as u8, (index / 32) as u8),
            Variant::Basic => (index as u8, 0),
        }
    }

    /// Whether an entry is a continuation extent rather than a primary
    fn is_extent(&self, entry: &FatEntry) -> bool {
        match self {
            Variant::Cpm => entry.ex_lo != 0,
            Variant::Basic => entry.ex_lo != 0 || entry.ex_hi != 0,
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Variant::Cpm => write!(f, "cpm"),
            Variant::Basic => write!(f, "hc"),
        }
    }
}

/// Extract the filename of a flat path; `None` for anything but `/<name>`
fn basename(path: &str) -> Option<&str> {
    let name = path.strip_prefix('/')?;

    if name.is_empty() || name.contains('/') {
        return None;
    }

    Some(name)
}

fn blocks_for(length: u64) -> u32 {
    (length / BLOCK_SIZE as u64 + u64::from(length % BLOCK_SIZE as u64 != 0)) as u32
}

/// The directory and allocation engine shared by both variants
///
/// The directory is loaded once at mount; every operation walks the
/// in-memory entries by name, so files are purely emergent from the entry
/// set. [`CpmFs::save`] flushes the directory and the image back out.
pub struct CpmFs {
    disk: Box<dyn Disk>,
    variant: Variant,
    interleave: &'static [u8],
    /// Logical block number of the first directory block, derived from the
    /// reserved-track offset
    first_block: u32,
    entries: Vec<FatEntry>,
}

impl CpmFs {
    /// Mount a disk as the given filesystem flavor
    pub fn new(disk: Box<dyn Disk>, variant: Variant) -> Result<Self> {
        let sectors = disk.properties().sectors();
        let interleave =
            interleave_for(sectors).ok_or(FsError::UnsupportedGeometry { sectors })?;

        let props = disk.properties();
        let first_block =
            variant.dpb().off as u32 * props.sectors_per_track() * props.sector_size()
                / BLOCK_SIZE;

        let mut fs = Self {
            disk,
            variant,
            interleave,
            first_block,
            entries: Vec::new(),
        };

        fs.load_fat()?;

        Ok(fs)
    }

    /// The mounted flavor
    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// The underlying disk image
    pub fn disk(&self) -> &dyn Disk {
        self.disk.as_ref()
    }

    /// The raw directory entries, free slots included
    pub fn entries(&self) -> &[FatEntry] {
        &self.entries
    }

    /// Flush the directory and write the image back to `path`
    ///
    /// Both steps are skipped while the disk is unmodified, so a read-only
    /// session never rewrites the image.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.save_fat()?;

        if self.disk.modified() {
            self.disk.save(path)?;
        }

        Ok(())
    }

    /// Apply the sector interleave to a linear position
    fn ipos(&self, pos: u32) -> Result<u32> {
        let props = self.disk.properties();

        let apos = DiskPos::from_pos(props, pos)?;
        let bpos = DiskPos::new(
            props,
            apos.track(),
            apos.head(),
            self.interleave[apos.sector() as usize] as u32,
        )?;

        Ok(bpos.pos())
    }

    /// Read a logical block, substituting zero-fill for absent sectors
    fn read_block(&self, block: u32) -> Result<Vec<u8>> {
        let sector_size = self.disk.properties().sector_size();
        let per_block = BLOCK_SIZE / sector_size;

        let start = (self.first_block + block) * per_block;
        let mut buf = Vec::with_capacity(BLOCK_SIZE as usize);

        for i in start..start + per_block {
            let sector = self.disk.read(self.ipos(i)?);

            if sector.is_empty() {
                buf.resize(buf.len() + sector_size as usize, 0);
            } else {
                buf.extend_from_slice(sector.data());
            }
        }

        Ok(buf)
    }

    /// Write a logical block sector by sector
    fn write_block(&mut self, block: u32, buf: &[u8]) -> Result<()> {
        let sector_size = self.disk.properties().sector_size();
        let per_block = BLOCK_SIZE / sector_size;

        let start = (self.first_block + block) * per_block;

        for (i, chunk) in buf.chunks(sector_size as usize).enumerate() {
            let pos = self.ipos(start + i as u32)?;
            self.disk.write(pos, Sector::new(chunk.to_vec()))?;
        }

        Ok(())
    }

    /// Parse the directory out of blocks 0 and 1
    fn load_fat(&mut self) -> Result<()> {
        self.entries.clear();
        self.entries
            .reserve(2 * BLOCK_SIZE as usize / ENTRY_SIZE);

        for block in 0..2 {
            let buf = self.read_block(block)?;

            for raw in buf.chunks_exact(ENTRY_SIZE) {
                self.entries.push(FatEntry::from_bytes(raw));
            }
        }

        Ok(())
    }

    /// Wipe free blocks and write the directory back, if anything changed
    fn save_fat(&mut self) -> Result<()> {
        if !self.disk.modified() {
            return Ok(());
        }

        let free = self.free_block_map()?;
        let wipe = vec![FREE_BYTE; BLOCK_SIZE as usize];

        for (block, is_free) in free.iter().enumerate() {
            if *is_free {
                self.write_block(block as u32, &wipe)?;
            }
        }

        let mut buf = Vec::with_capacity(self.entries.len() * ENTRY_SIZE);
        for entry in &self.entries {
            buf.extend_from_slice(&entry.to_bytes());
        }

        let full_blocks = buf.len() / BLOCK_SIZE as usize;
        for i in 0..full_blocks {
            self.write_block(
                i as u32,
                &buf[i * BLOCK_SIZE as usize..(i + 1) * BLOCK_SIZE as usize],
            )?;
        }

        let tail = buf.len() % BLOCK_SIZE as usize;
        if tail != 0 {
            self.write_block(full_blocks as u32 + 1, &buf[buf.len() - tail..])?;
        }

        Ok(())
    }

    /// Mark every block referenced by an allocated entry, plus the two
    /// directory blocks, as used
    fn free_block_map(&self) -> Result<Vec<bool>> {
        let total = self.disk.properties().size() / BLOCK_SIZE - self.first_block;
        let mut free = vec![true; total as usize];

        free[0] = false;
        free[1] = false;

        for entry in &self.entries {
            if entry.free() {
                continue;
            }

            for &unit in entry.allocation_units.iter() {
                *free
                    .get_mut(unit as usize)
                    .ok_or_else(|| FsError::corrupt("allocation unit out of range"))? = false;
            }
        }

        Ok(free)
    }

    /// Index of the primary entry for `name`, if any
    fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| !e.free() && !self.variant.is_extent(e) && e.matches(name))
    }

    /// Sum size, block and extent counts over a file's extents
    ///
    /// Stops at the first non-full extent, which is always the last one.
    fn file_totals(&self, name: &str) -> (u64, u32, u32) {
        let mut size = 0u64;
        let mut blocks = 0u32;
        let mut extents = 0u32;

        for entry in &self.entries {
            if entry.free() || !entry.matches(name) {
                continue;
            }

            size += entry.size() as u64;
            blocks += entry.block_count();
            extents += 1;

            if !entry.full() {
                break;
            }
        }

        (size, blocks, extents)
    }

    fn file_attr(&self, size: u64) -> FileAttr {
        FileAttr {
            mode: FILE_MODE,
            nlink: 1,
            size,
            blksize: self.disk.properties().sector_size(),
            blocks: size / 512 + u64::from(size % 512 != 0),
        }
    }

    fn shrink(&mut self, name: &str, target_blocks: u32, blocks: u32) -> Result<()> {
        let mut delta = blocks.saturating_sub(target_blocks);

        for entry in self.entries.iter_mut().rev() {
            if entry.free() || !entry.matches(name) {
                continue;
            }

            let mut slot = ALLOCATION_UNITS;
            while slot > 0 && delta > 0 {
                if entry.allocation_units[slot - 1] != 0 {
                    entry.allocation_units[slot - 1] = 0;
                    delta -= 1;
                }
                slot -= 1;
            }

            entry.record_count = (entry.block_count() * BLOCK_SIZE / RECORD_SIZE) as u8;
            if entry.record_count == 0 && delta > 0 {
                entry.clear();
            }
        }

        // blocks left over mean the directory disagreed with itself
        if delta > 0 {
            Err(FsError::NotFound)
        } else {
            Ok(())
        }
    }

    fn grow(&mut self, name: &str, target_blocks: u32, blocks: u32) -> Result<()> {
        if target_blocks <= blocks {
            return Ok(());
        }

        let mut free = self.free_block_map()?;
        let mut delta = target_blocks - blocks;

        let wipe = vec![FREE_BYTE; BLOCK_SIZE as usize];
        let variant = self.variant;

        let mut tail_seen = false;
        let mut extents = 0u32;

        for idx in 0..self.entries.len() {
            {
                let entry = &mut self.entries[idx];

                if !tail_seen {
                    if entry.free() || !entry.matches(name) {
                        continue;
                    }

                    extents += 1;

                    if entry.full() {
                        continue;
                    }
                } else {
                    if !entry.free() {
                        continue;
                    }

                    entry.clear();
                    entry.user_code = 0;
                    entry.set_name(name);

                    let (lo, hi) = variant.encode_extent(extents);
                    entry.ex_lo = lo;
                    entry.ex_hi = hi;
                    extents += 1;
                }
            }

            let mut slot = 0;
            while slot < ALLOCATION_UNITS && delta > 0 {
                if self.entries[idx].allocation_units[slot] != 0 {
                    slot += 1;
                    continue;
                }

                let Some(block) = take_free_block(&mut free) else {
                    break;
                };

                self.entries[idx].allocation_units[slot] = block;
                self.write_block(block as u32, &wipe)?;

                delta -= 1;
                slot += 1;
            }

            let entry = &mut self.entries[idx];
            entry.record_count = (entry.block_count() * BLOCK_SIZE / RECORD_SIZE) as u8;
            tail_seen = entry.full();
        }

        if delta > 0 {
            Err(FsError::NoSpace)
        } else {
            Ok(())
        }
    }
}

/// First-fit search over the free-block map
fn take_free_block(free: &mut [bool]) -> Option<u16> {
    let block = free.iter().position(|&b| b)?;
    free[block] = false;

    Some(block as u16)
}

impl Filesystem for CpmFs {
    fn getattr(&self, path: &str) -> Result<FileAttr> {
        if path == "/" {
            let primaries = self
                .entries
                .iter()
                .filter(|e| !e.free() && !self.variant.is_extent(e))
                .count();

            return Ok(FileAttr {
                mode: DIR_MODE,
                nlink: 1,
                size: primaries as u64 * 2,
                blksize: self.disk.properties().sector_size(),
                blocks: (BLOCK_SIZE * 2 / 512) as u64,
            });
        }

        let name = basename(path).ok_or(FsError::NotFound)?;
        let (size, _, extents) = self.file_totals(name);

        if extents == 0 {
            return Err(FsError::NotFound);
        }

        Ok(self.file_attr(size))
    }

    fn unlink(&mut self, path: &str) -> Result<()> {
        let name = basename(path).ok_or(FsError::NotFound)?;

        // continuation extents stay behind; the free-block wipe in
        // save_fat reclaims their data
        let idx = self.find(name).ok_or(FsError::NotFound)?;
        self.entries[idx].clear();

        Ok(())
    }

    fn truncate(&mut self, path: &str, length: u64) -> Result<()> {
        let name = basename(path).ok_or(FsError::NotFound)?;

        let (size, blocks, extents) = self.file_totals(name);

        if extents == 0 {
            return Err(FsError::NotFound);
        }

        if length == size {
            return Ok(());
        }

        let target_blocks = blocks_for(length);

        if length < size {
            self.shrink(name, target_blocks, blocks)
        } else {
            self.grow(name, target_blocks, blocks)
        }
    }

    fn open(&self, path: &str) -> Result<()> {
        let name = basename(path).ok_or(FsError::NotFound)?;

        self.find(name).map(|_| ()).ok_or(FsError::NotFound)
    }

    fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        let name = basename(path).ok_or(FsError::NotFound)?;

        let mut total: u64 = self
            .entries
            .iter()
            .filter(|e| !e.free() && e.matches(name))
            .map(|e| e.size() as u64)
            .sum();

        if offset >= total {
            return Ok(0);
        }

        let mut block_pos = (offset / BLOCK_SIZE as u64) as u32;
        let mut block_off = (offset % BLOCK_SIZE as u64) as usize;
        let mut remaining = buf.len();

        for entry in &self.entries {
            if entry.free() || !entry.matches(name) {
                continue;
            }

            let blocks = entry.block_count();
            if block_pos > blocks {
                block_pos -= blocks;
            } else {
                while remaining > 0 && total > 0 && block_pos < blocks {
                    let data =
                        self.read_block(entry.allocation_units[block_pos as usize] as u32)?;
                    block_pos += 1;

                    let mut n = remaining.min(data.len() - block_off);
                    n = n.min(total as usize);

                    let start = buf.len() - remaining;
                    buf[start..start + n].copy_from_slice(&data[block_off..block_off + n]);

                    remaining -= n;
                    total -= n as u64;
                    block_off = 0;
                }
                block_pos = 0;
            }
        }

        Ok(buf.len() - remaining)
    }

    fn write(&mut self, path: &str, buf: &[u8], offset: u64) -> Result<usize> {
        let name = basename(path).ok_or(FsError::NotFound)?;

        let mut total: u64 = self
            .entries
            .iter()
            .filter(|e| !e.free() && e.matches(name))
            .map(|e| e.size() as u64)
            .sum();

        let end = offset + buf.len() as u64;
        if end > total {
            self.truncate(path, end)?;
            total = blocks_for(end) as u64 * BLOCK_SIZE as u64;
        }

        let mut block_pos = (offset / BLOCK_SIZE as u64) as u32;
        let mut block_off = (offset % BLOCK_SIZE as u64) as usize;
        let mut remaining = buf.len();

        for idx in 0..self.entries.len() {
            let (skip, blocks, units) = {
                let entry = &self.entries[idx];
                (
                    entry.free() || !entry.matches(name),
                    entry.block_count(),
                    entry.allocation_units,
                )
            };

            if skip {
                continue;
            }

            if block_pos > blocks {
                block_pos -= blocks;
            } else {
                while remaining > 0 && total > 0 && block_pos < blocks {
                    let block = units[block_pos as usize] as u32;
                    let mut data = self.read_block(block)?;

                    let mut n = remaining.min(data.len() - block_off);
                    n = n.min(total as usize);

                    let start = buf.len() - remaining;
                    data[block_off..block_off + n].copy_from_slice(&buf[start..start + n]);

                    self.write_block(block, &data)?;
                    block_pos += 1;

                    remaining -= n;
                    total -= n as u64;
                    block_off = 0;
                }
                block_pos = 0;
            }
        }

        Ok(buf.len() - remaining)
    }

    fn statfs(&self, path: &str) -> Result<FsStats> {
        if path != "/" {
            return Err(FsError::NotFound);
        }

        let mut used_blocks = 0u64;
        let mut free_entries = 0u64;

        for entry in &self.entries {
            if entry.free() {
                free_entries += 1;
            } else {
                used_blocks += entry.block_count() as u64;
            }
        }

        let total =
            (self.disk.properties().size() / BLOCK_SIZE - self.first_block - 2) as u64;

        Ok(FsStats {
            block_size: BLOCK_SIZE,
            fragment_size: BLOCK_SIZE,
            blocks: total,
            blocks_free: total.saturating_sub(used_blocks),
            files: self.entries.len() as u64,
            files_free: free_entries,
            name_max: FILENAME_LEN as u32,
        })
    }

    fn release(&self, path: &str) -> Result<()> {
        self.open(path)
    }

    fn readdir(&self, path: &str, filler: &mut dyn FnMut(&str, &FileAttr) -> bool) -> Result<()> {
        if path != "/" {
            return Err(FsError::NotFound);
        }

        for entry in &self.entries {
            if entry.free() || self.variant.is_extent(entry) {
                continue;
            }

            let name = entry.name();
            let (size, _, _) = self.file_totals(&name);

            if filler(&name, &self.file_attr(size)) {
                break;
            }
        }

        Ok(())
    }

    fn create(&mut self, path: &str) -> Result<()> {
        let name = basename(path).ok_or(FsError::NotFound)?;

        if self.find(name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        let idx = self
            .entries
            .iter()
            .position(|e| e.free())
            .ok_or(FsError::NoSpace)?;

        let entry = &mut self.entries[idx];
        entry.clear();
        entry.user_code = 0;
        entry.set_name(name);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::DskImage;

    fn cpm_fs() -> CpmFs {
        let disk = DskImage::blank(80, 2, 9, 512, true).unwrap();
        CpmFs::new(Box::new(disk), Variant::Cpm).unwrap()
    }

    fn hc_fs() -> CpmFs {
        let disk = DskImage::blank(80, 2, 16, 256, true).unwrap();
        CpmFs::new(Box::new(disk), Variant::Basic).unwrap()
    }

    #[test]
    fn test_unsupported_geometry() {
        let disk = DskImage::blank(40, 1, 10, 512, false).unwrap();
        let result = CpmFs::new(Box::new(disk), Variant::Cpm);

        assert!(matches!(
            result,
            Err(FsError::UnsupportedGeometry { sectors: 10 })
        ));
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("/A.TXT"), Some("A.TXT"));
        assert_eq!(basename("/"), None);
        assert_eq!(basename("/dir/file"), None);
        assert_eq!(basename("plain"), None);
    }

    #[test]
    fn test_interleave_mapping() {
        let fs = cpm_fs();

        // logical sector 3 of (track 3, head 0) lands on physical sector 6
        let logical = DiskPos::new(fs.disk.properties(), 3, 0, 3).unwrap();
        let physical = fs.ipos(logical.pos()).unwrap();
        let dpos = DiskPos::from_pos(fs.disk.properties(), physical).unwrap();

        assert_eq!(dpos.track(), 3);
        assert_eq!(dpos.head(), 0);
        assert_eq!(dpos.sector(), 6);
    }

    #[test]
    fn test_reserved_track_offset() {
        // two reserved tracks of 18 sectors x 512 bytes = 9 blocks
        assert_eq!(cpm_fs().first_block, 9);
        assert_eq!(hc_fs().first_block, 0);
    }

    #[test]
    fn test_fresh_directory_is_free() {
        let fs = cpm_fs();

        assert_eq!(fs.entries().len(), 128);
        assert!(fs.entries().iter().all(|e| e.free()));
    }

    #[test]
    fn test_getattr_root() {
        let fs = cpm_fs();
        let attr = fs.getattr("/").unwrap();

        assert_eq!(attr.mode, DIR_MODE);
        assert_eq!(attr.size, 0);

        assert!(matches!(fs.getattr("/a/b"), Err(FsError::NotFound)));
    }

    #[test]
    fn test_create_and_getattr() {
        let mut fs = cpm_fs();

        fs.create("/A.TXT").unwrap();

        let attr = fs.getattr("/A.TXT").unwrap();
        assert_eq!(attr.mode, FILE_MODE);
        assert_eq!(attr.size, 0);

        let root = fs.getattr("/").unwrap();
        assert_eq!(root.size, 2);

        assert!(matches!(fs.create("/A.TXT"), Err(FsError::AlreadyExists)));
    }

    #[test]
    fn test_create_unlink_create() {
        let mut fs = cpm_fs();

        fs.create("/A.TXT").unwrap();
        fs.unlink("/A.TXT").unwrap();
        assert!(matches!(fs.getattr("/A.TXT"), Err(FsError::NotFound)));
        fs.create("/A.TXT").unwrap();
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut fs = cpm_fs();

        fs.create("/A.TXT").unwrap();
        assert_eq!(fs.write("/A.TXT", b"HELLO", 0).unwrap(), 5);

        let mut buf = [0u8; 5];
        assert_eq!(fs.read("/A.TXT", &mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"HELLO");

        // sizes are block-granular
        assert_eq!(fs.getattr("/A.TXT").unwrap().size, 2048);
    }

    #[test]
    fn test_read_past_end() {
        let mut fs = cpm_fs();

        fs.create("/A.TXT").unwrap();
        fs.write("/A.TXT", b"HELLO", 0).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(fs.read("/A.TXT", &mut buf, 4096).unwrap(), 0);
    }

    #[test]
    fn test_first_allocated_block_is_two() {
        let mut fs = cpm_fs();

        fs.create("/A.TXT").unwrap();
        fs.write("/A.TXT", b"x", 0).unwrap();

        let entry = &fs.entries()[0];
        assert_eq!(entry.allocation_units()[0], 2);
        assert_eq!(entry.record_count(), 16);
    }

    #[test]
    fn test_multi_extent_allocation() {
        let mut fs = cpm_fs();

        fs.create("/BIG.DAT").unwrap();
        let payload = vec![0x5A; 20 * 1024];
        assert_eq!(fs.write("/BIG.DAT", &payload, 0).unwrap(), payload.len());

        let extents: Vec<&FatEntry> = fs
            .entries()
            .iter()
            .filter(|e| !e.free() && e.matches("BIG.DAT"))
            .collect();
        assert_eq!(extents.len(), 2);

        assert_eq!(extents[0].ex_lo(), 0);
        assert_eq!(extents[0].ex_hi(), 0);
        assert_eq!(extents[0].block_count(), 8);
        assert_eq!(extents[0].record_count(), 128);

        assert_eq!(extents[1].ex_lo(), 1);
        assert_eq!(extents[1].ex_hi(), 0);
        assert_eq!(extents[1].block_count(), 2);
        assert_eq!(extents[1].record_count(), 32);

        assert_eq!(fs.getattr("/BIG.DAT").unwrap().size, 20 * 1024);

        let mut read_back = vec![0u8; payload.len()];
        assert_eq!(
            fs.read("/BIG.DAT", &mut read_back, 0).unwrap(),
            payload.len()
        );
        assert_eq!(read_back, payload);
    }

    #[test]
    fn test_shrink_across_extents() {
        let mut fs = cpm_fs();

        fs.create("/BIG.DAT").unwrap();
        fs.write("/BIG.DAT", &vec![0x5A; 20 * 1024], 0).unwrap();

        fs.truncate("/BIG.DAT", 2048).unwrap();

        let extents: Vec<&FatEntry> = fs
            .entries()
            .iter()
            .filter(|e| !e.free() && e.matches("BIG.DAT"))
            .collect();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].block_count(), 1);
        assert_eq!(extents[0].record_count(), 16);
    }

    #[test]
    fn test_truncate_to_zero_keeps_entry() {
        let mut fs = cpm_fs();

        fs.create("/A.TXT").unwrap();
        fs.write("/A.TXT", b"HELLO", 0).unwrap();
        fs.truncate("/A.TXT", 0).unwrap();

        let attr = fs.getattr("/A.TXT").unwrap();
        assert_eq!(attr.size, 0);

        let entry = &fs.entries()[0];
        assert!(!entry.free());
        assert_eq!(entry.record_count(), 0);
        assert_eq!(entry.block_count(), 0);

        // a later write re-allocates
        fs.write("/A.TXT", b"AGAIN", 0).unwrap();
        assert_eq!(fs.getattr("/A.TXT").unwrap().size, 2048);
    }

    #[test]
    fn test_unlink_leaves_continuation_extents() {
        let mut fs = cpm_fs();

        fs.create("/BIG.DAT").unwrap();
        fs.write("/BIG.DAT", &vec![1u8; 20 * 1024], 0).unwrap();

        fs.unlink("/BIG.DAT").unwrap();

        // primary freed, continuation untouched
        assert!(fs.entries()[0].free());
        assert!(!fs.entries()[1].free());
        assert_eq!(fs.entries()[1].ex_lo(), 1);
        assert!(matches!(fs.getattr("/BIG.DAT"), Err(FsError::NotFound)));
    }

    #[test]
    fn test_readdir_empty_and_nonroot() {
        let fs = cpm_fs();

        let mut names = Vec::new();
        fs.readdir("/", &mut |name, _| {
            names.push(name.to_string());
            false
        })
        .unwrap();
        assert!(names.is_empty());

        let result = fs.readdir("/sub", &mut |_, _| false);
        assert!(matches!(result, Err(FsError::NotFound)));
    }

    #[test]
    fn test_readdir_lists_primaries_with_summed_sizes() {
        let mut fs = cpm_fs();

        fs.create("/BIG.DAT").unwrap();
        fs.write("/BIG.DAT", &vec![1u8; 20 * 1024], 0).unwrap();
        fs.create("/SMALL.TXT").unwrap();

        let mut listed = Vec::new();
        fs.readdir("/", &mut |name, attr| {
            listed.push((name.to_string(), attr.size));
            false
        })
        .unwrap();

        assert_eq!(
            listed,
            vec![
                ("BIG.DAT".to_string(), 20 * 1024),
                ("SMALL.TXT".to_string(), 0)
            ]
        );
    }

    #[test]
    fn test_statfs() {
        let mut fs = cpm_fs();

        let stats = fs.statfs("/").unwrap();
        assert_eq!(stats.block_size, 2048);
        // 720 KiB / 2 KiB - 9 reserved - 2 directory
        assert_eq!(stats.blocks, 349);
        assert_eq!(stats.blocks_free, 349);
        assert_eq!(stats.files, 128);
        assert_eq!(stats.files_free, 128);
        assert_eq!(stats.name_max, 11);

        fs.create("/A.TXT").unwrap();
        fs.write("/A.TXT", &vec![0u8; 4096], 0).unwrap();

        let stats = fs.statfs("/").unwrap();
        assert_eq!(stats.blocks_free, 347);
        assert_eq!(stats.files_free, 127);

        assert!(matches!(fs.statfs("/A.TXT"), Err(FsError::NotFound)));
    }

    #[test]
    fn test_write_at_offset_across_blocks() {
        let mut fs = cpm_fs();

        fs.create("/A.DAT").unwrap();
        fs.write("/A.DAT", &vec![0xAA; 4096], 0).unwrap();

        // overwrite a span crossing the block boundary
        fs.write("/A.DAT", &[1, 2, 3, 4], 2046).unwrap();

        let mut buf = [0u8; 6];
        fs.read("/A.DAT", &mut buf, 2045).unwrap();
        assert_eq!(buf, [0xAA, 1, 2, 3, 4, 0xAA]);
    }

    #[test]
    fn test_no_space_for_entries() {
        let mut fs = cpm_fs();

        for i in 0..128 {
            fs.create(&format!("/F{}", i)).unwrap();
        }

        assert!(matches!(fs.create("/ONEMORE"), Err(FsError::NoSpace)));
    }

    #[test]
    fn test_no_space_for_blocks() {
        let mut fs = cpm_fs();

        fs.create("/HOG.DAT").unwrap();

        // 349 data blocks available; ask for more
        let result = fs.truncate("/HOG.DAT", 400 * 2048);
        assert!(matches!(result, Err(FsError::NoSpace)));
    }

    #[test]
    fn test_basic_variant_extent_encoding() {
        let mut fs = hc_fs();

        fs.create("/BIG.DAT").unwrap();
        // 3 extents worth of data on the 640 KiB layout
        fs.truncate("/BIG.DAT", 17 * 2048).unwrap();

        let extents: Vec<&FatEntry> = fs
            .entries()
            .iter()
            .filter(|e| !e.free() && e.matches("BIG.DAT"))
            .collect();
        assert_eq!(extents.len(), 3);
        assert_eq!(extents[1].ex_lo(), 1);
        assert_eq!(extents[2].ex_lo(), 2);
        assert!(extents.iter().all(|e| e.ex_hi() == 0));
    }

    #[test]
    fn test_variant_extent_predicates() {
        let mut entry = FatEntry::from_bytes(&[0u8; 32]);
        entry.ex_lo = 0;
        entry.ex_hi = 1;

        // only the BASIC variant looks at the high byte
        assert!(!Variant::Cpm.is_extent(&entry));
        assert!(Variant::Basic.is_extent(&entry));
    }

    #[test]
    fn test_save_fat_round_trip() {
        let mut fs = cpm_fs();

        fs.create("/KEEP.ME").unwrap();
        fs.write("/KEEP.ME", b"PERSISTENT", 0).unwrap();

        let entries = fs.entries().to_vec();

        fs.save_fat().unwrap();
        fs.load_fat().unwrap();

        assert_eq!(fs.entries(), &entries[..]);

        let mut buf = [0u8; 10];
        fs.read("/KEEP.ME", &mut buf, 0).unwrap();
        assert_eq!(&buf, b"PERSISTENT");
    }

    #[test]
    fn test_allocation_units_unique_and_in_range() {
        let mut fs = cpm_fs();

        fs.create("/A.DAT").unwrap();
        fs.create("/B.DAT").unwrap();
        fs.write("/A.DAT", &vec![1u8; 5000], 0).unwrap();
        fs.write("/B.DAT", &vec![2u8; 9000], 0).unwrap();

        let mut seen = Vec::new();
        for entry in fs.entries().iter().filter(|e| !e.free()) {
            for &unit in entry.allocation_units() {
                if unit != 0 {
                    assert!(unit >= 2);
                    assert!((unit as u32) < fs.disk().properties().size() / BLOCK_SIZE);
                    assert!(!seen.contains(&unit));
                    seen.push(unit);
                }
            }
        }
    }
}
