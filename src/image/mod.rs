/// Disk image codecs and the uniform sector-addressable view

/// CPC DSK codec (standard and extended)
pub mod dsk;
/// ImageDisk (IMD) codec
pub mod imd;
/// Sector definition
pub mod sector;

pub use dsk::DskImage;
pub use imd::ImdImage;
pub use sector::Sector;

use crate::error::{FsError, Result};
use crate::geometry::DiskProperties;
use std::path::Path;

/// Uniform sector-addressable view of a disk image
///
/// Positions are linear indices in `[0, max_pos]`; see [`crate::geometry`]
/// for the mapping to (track, head, sector) triples. The whole image lives
/// in memory; `save` serializes it back to a file.
pub trait Disk: Send + Sync {
    /// Geometry of this image
    fn properties(&self) -> &DiskProperties;

    /// Read the sector at a linear position
    ///
    /// Unformatted positions return the absent-sector sentinel.
    fn read(&self, pos: u32) -> &Sector;

    /// Replace the sector at a linear position
    ///
    /// Writing to a position whose track was never formatted materializes
    /// the enclosing track. The modified flag is set on the first
    /// successful write and stays set.
    fn write(&mut self, pos: u32, sector: Sector) -> Result<()>;

    /// Whether any sector has been written since load
    fn modified(&self) -> bool;

    /// Serialize the image back to a file
    fn save(&self, path: &Path) -> Result<()>;
}

/// Open a disk image, detecting its container format
///
/// Tries IMD first, then DSK; fails with [`FsError::UnknownFormat`] if
/// neither codec recognizes the file.
pub fn open<P: AsRef<Path>>(path: P) -> Result<Box<dyn Disk>> {
    let bytes = std::fs::read(path)?;

    if ImdImage::detect(&bytes) {
        return Ok(Box::new(ImdImage::from_bytes(&bytes)?));
    }

    if DskImage::detect(&bytes) {
        return Ok(Box::new(DskImage::from_bytes(&bytes)?));
    }

    Err(FsError::UnknownFormat)
}

/// Byte cursor over an in-memory image
///
/// All multi-byte reads are little-endian, matching both container formats.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub(crate) fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    pub(crate) fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| FsError::corrupt("unexpected end of image"))?;
        self.pos += 1;

        Ok(byte)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;

        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| FsError::corrupt("unexpected end of image"))?;
        self.pos = end;

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_reader() {
        let data = [0x01, 0x02, 0x34, 0x12, 0xFF];
        let mut reader = ByteReader::new(&data);

        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert_eq!(reader.read_u8().unwrap(), 0x02);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert!(!reader.at_end());
        assert_eq!(reader.read_u8().unwrap(), 0xFF);
        assert!(reader.at_end());
        assert!(reader.read_u8().is_err());
    }

    #[test]
    fn test_byte_reader_seek() {
        let data = [0u8; 16];
        let mut reader = ByteReader::new(&data);

        reader.skip(4);
        assert_eq!(reader.pos(), 4);
        reader.seek(12);
        assert_eq!(reader.read_bytes(4).unwrap(), &[0u8; 4]);
        assert!(reader.read_bytes(1).is_err());
    }

    #[test]
    fn test_open_unknown_format() {
        let dir = std::env::temp_dir().join("floppyfs-unknown-format-test");
        std::fs::write(&dir, b"not a disk image at all").unwrap();

        let result = open(&dir);
        assert!(matches!(result, Err(FsError::UnknownFormat)));

        std::fs::remove_file(&dir).ok();
    }
}
