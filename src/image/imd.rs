/// ImageDisk (IMD) codec

use chrono::Local;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use crate::error::{FsError, Result};
use crate::geometry::{DiskPos, DiskProperties};
use crate::image::{ByteReader, Disk, Sector};

/// `IMD v.vv: dd/mm/yyyy hh:mm:ss` -- fixed-width ASCII prefix
const HEADER_LEN: usize = 29;
const COMMENT_TERMINATOR: u8 = 0x1A;

/// Highest valid data-transfer-rate byte (250 kbps MFM)
const MAX_MODE: u8 = 5;
/// Highest valid sector-size code (8192 bytes)
const MAX_SIZE_CODE: u8 = 6;

/// Head byte flag: a cylinder map follows the numbering map
const CYLINDER_MAP_FLAG: u8 = 0x80;
/// Head byte flag: a head map follows
const HEAD_MAP_FLAG: u8 = 0x40;

const SECTOR_ABSENT: u8 = 0x00;
const SECTOR_VERBATIM: u8 = 0x01;
const SECTOR_COMPRESSED: u8 = 0x02;

static EMPTY_SECTOR: Sector = Sector::empty();

fn size_code_to_bytes(code: u8) -> u32 {
    128 << code
}

fn bytes_to_size_code(size: usize) -> Option<u8> {
    match size {
        128 => Some(0),
        256 => Some(1),
        512 => Some(2),
        1024 => Some(3),
        2048 => Some(4),
        4096 => Some(5),
        8192 => Some(6),
        _ => None,
    }
}

/// One track record as stored in the file
#[derive(Debug, Clone)]
struct ImdTrack {
    mode: u8,
    cylinder: u8,
    /// Raw head byte; bits 0x80/0x40 gate the optional maps, bit 0 is the
    /// physical head
    head: u8,
    size_code: u8,
    /// Physical interleave: position i on the track holds sector id
    /// `numbering_map[i]` (1-based)
    numbering_map: Vec<u8>,
    cylinder_map: Vec<u8>,
    head_map: Vec<u8>,
    sectors: Vec<Sector>,
}

/// An ImageDisk file held fully in memory
pub struct ImdImage {
    properties: DiskProperties,
    tracks: Vec<ImdTrack>,
    /// linear position -> (track index, sector index within track)
    index: HashMap<u32, (usize, usize)>,
    modified: bool,
}

impl ImdImage {
    /// Check whether a byte buffer starts like an IMD file
    ///
    /// Matches `IMD v.vv: ` where v are decimal digits.
    pub fn detect(bytes: &[u8]) -> bool {
        if bytes.len() < 10 {
            return false;
        }

        bytes.starts_with(b"IMD ")
            && bytes[4].is_ascii_digit()
            && bytes[5] == b'.'
            && bytes[6].is_ascii_digit()
            && bytes[7].is_ascii_digit()
            && bytes[8] == b':'
            && bytes[9] == b' '
    }

    /// Parse an IMD image from a byte buffer
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(FsError::corrupt("file shorter than the IMD header"));
        }

        let mut reader = ByteReader::new(bytes);
        reader.seek(HEADER_LEN);

        // skip over the comment
        loop {
            if reader.read_u8()? == COMMENT_TERMINATOR {
                break;
            }
        }

        let mut tracks = Vec::new();

        while !reader.at_end() {
            tracks.push(Self::parse_track(&mut reader)?);
        }

        // stable by cylinder, so the two heads of one cylinder keep their
        // file order
        tracks.sort_by_key(|t| t.cylinder);

        let properties = Self::derive_properties(&tracks);
        let index = Self::build_index(&properties, &tracks)?;

        Ok(Self {
            properties,
            tracks,
            index,
            modified: false,
        })
    }

    fn parse_track(reader: &mut ByteReader) -> Result<ImdTrack> {
        let mode = reader.read_u8()?;
        if mode > MAX_MODE {
            return Err(FsError::corrupt(format!("invalid mode byte: {}", mode)));
        }

        let cylinder = reader.read_u8()?;
        let head = reader.read_u8()?;
        let nsectors = reader.read_u8()?;

        let size_code = reader.read_u8()?;
        if size_code > MAX_SIZE_CODE {
            return Err(FsError::corrupt(format!(
                "invalid sector size code: {}",
                size_code
            )));
        }

        let numbering_map = reader.read_bytes(nsectors as usize)?.to_vec();

        let cylinder_map = if head & CYLINDER_MAP_FLAG != 0 {
            reader.read_bytes(nsectors as usize)?.to_vec()
        } else {
            Vec::new()
        };

        let head_map = if head & HEAD_MAP_FLAG != 0 {
            reader.read_bytes(nsectors as usize)?.to_vec()
        } else {
            Vec::new()
        };

        let sector_size = size_code_to_bytes(size_code) as usize;
        let mut sectors = Vec::with_capacity(nsectors as usize);

        for _ in 0..nsectors {
            let header = reader.read_u8()?;

            if header == SECTOR_ABSENT {
                sectors.push(Sector::empty());
            } else if header & 0x01 != 0 {
                sectors.push(Sector::new(reader.read_bytes(sector_size)?.to_vec()));
            } else {
                let byte = reader.read_u8()?;
                sectors.push(Sector::filled(sector_size, byte));
            }
        }

        Ok(ImdTrack {
            mode,
            cylinder,
            head,
            size_code,
            numbering_map,
            cylinder_map,
            head_map,
            sectors,
        })
    }

    /// Derive the uniform geometry from the observed tracks
    fn derive_properties(tracks: &[ImdTrack]) -> DiskProperties {
        let mut cylinders = 0;
        let mut heads = 0;
        let mut sector_size = 0;
        let mut counts: HashMap<u8, u32> = HashMap::new();

        for track in tracks {
            cylinders = cylinders.max(track.cylinder as u32 + 1);
            heads = heads.max((track.head & 0x01) as u32 + 1);
            sector_size = sector_size.max(size_code_to_bytes(track.size_code));
            *counts.entry(track.numbering_map.len() as u8).or_insert(0) += 1;
        }

        let sectors = counts
            .iter()
            .max_by_key(|&(&n, &count)| (count, n))
            .map(|(&n, _)| n as u32)
            .unwrap_or(0);

        if counts.len() > 1 {
            warn!(
                "multiple sector counts per track are not supported; \
                 choosing the most common count: {}",
                sectors
            );
        }

        DiskProperties::new(cylinders, heads, sectors, sector_size)
    }

    fn build_index(
        properties: &DiskProperties,
        tracks: &[ImdTrack],
    ) -> Result<HashMap<u32, (usize, usize)>> {
        let mut index = HashMap::new();

        for (track_idx, track) in tracks.iter().enumerate() {
            for (sector_idx, &id) in track.numbering_map.iter().enumerate() {
                let sector = id
                    .checked_sub(1)
                    .ok_or_else(|| FsError::corrupt("sector id 0 in numbering map"))?;
                let dpos = DiskPos::new(
                    properties,
                    track.cylinder as u32,
                    (track.head & 0x01) as u32,
                    sector as u32,
                )?;

                index.insert(dpos.pos(), (track_idx, sector_idx));
            }
        }

        Ok(index)
    }

    /// Serialize the image to a byte buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();

        let stamp = Local::now().format("%m/%d/%Y %H:%M:%S");
        out.extend_from_slice(format!("IMD 1.17: {}\r\n", stamp).as_bytes());
        out.extend_from_slice(format!("floppyfs {}", env!("CARGO_PKG_VERSION")).as_bytes());
        out.push(COMMENT_TERMINATOR);

        for track in &self.tracks {
            out.push(track.mode);
            out.push(track.cylinder);
            out.push(track.head);
            out.push(track.numbering_map.len() as u8);
            out.push(track.size_code);

            out.extend_from_slice(&track.numbering_map);

            if track.head & CYLINDER_MAP_FLAG != 0 {
                out.extend_from_slice(&track.cylinder_map);
            }

            if track.head & HEAD_MAP_FLAG != 0 {
                out.extend_from_slice(&track.head_map);
            }

            for sector in &track.sectors {
                if sector.is_empty() {
                    out.push(SECTOR_ABSENT);
                } else if let Some(byte) = sector.uniform_byte() {
                    out.push(SECTOR_COMPRESSED);
                    out.push(byte);
                } else {
                    out.push(SECTOR_VERBATIM);
                    out.extend_from_slice(sector.data());
                }
            }
        }

        out
    }
}

impl Disk for ImdImage {
    fn properties(&self) -> &DiskProperties {
        &self.properties
    }

    fn read(&self, pos: u32) -> &Sector {
        match self.index.get(&pos) {
            Some(&(track, sector)) => &self.tracks[track].sectors[sector],
            None => &EMPTY_SECTOR,
        }
    }

    fn write(&mut self, pos: u32, sector: Sector) -> Result<()> {
        if pos > self.properties.max_pos() {
            return Err(FsError::OutOfRange {
                pos,
                max: self.properties.max_pos(),
            });
        }

        if !sector.is_empty() && sector.len() != self.properties.sector_size() as usize {
            return Err(FsError::SectorSizeMismatch {
                actual: sector.len(),
                expected: self.properties.sector_size(),
            });
        }

        if let Some(&(track, slot)) = self.index.get(&pos) {
            self.tracks[track].sectors[slot] = sector;
        } else {
            self.materialize_track(pos, sector)?;
        }

        self.modified = true;

        Ok(())
    }

    fn modified(&self) -> bool {
        self.modified
    }

    fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes())?;

        Ok(())
    }
}

impl ImdImage {
    /// Create the track enclosing `pos`, carrying the first track's mode
    /// and numbering so the new track matches the rest of the image
    fn materialize_track(&mut self, pos: u32, sector: Sector) -> Result<()> {
        let dpos = DiskPos::from_pos(&self.properties, pos)?;
        let nsectors = self.properties.sectors() as usize;

        let size_code = bytes_to_size_code(sector.len()).ok_or(FsError::SectorSizeMismatch {
            actual: sector.len(),
            expected: self.properties.sector_size(),
        })?;

        let (mode, numbering_map) = match self.tracks.first() {
            Some(first) => (first.mode, first.numbering_map.clone()),
            None => (MAX_MODE, (1..=nsectors as u8).collect()),
        };

        let mut sectors = vec![Sector::empty(); nsectors];
        sectors[dpos.sector() as usize] = sector;

        let track = ImdTrack {
            mode,
            cylinder: dpos.track() as u8,
            head: dpos.head() as u8,
            size_code,
            numbering_map,
            cylinder_map: Vec::new(),
            head_map: Vec::new(),
            sectors,
        };

        let track_idx = self.tracks.len();
        for sector_idx in 0..nsectors {
            let id = *track
                .numbering_map
                .get(sector_idx)
                .ok_or_else(|| FsError::corrupt("numbering map shorter than the track"))?;
            let slot = id
                .checked_sub(1)
                .ok_or_else(|| FsError::corrupt("sector id 0 in numbering map"))?;
            let ipos = DiskPos::new(&self.properties, dpos.track(), dpos.head(), slot as u32)?;

            self.index.insert(ipos.pos(), (track_idx, sector_idx));
        }

        self.tracks.push(track);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal IMD image: `tracks` cylinders, one head, 9 sectors
    /// of 512 bytes, sequential numbering, every sector compressed to 0xE5
    fn sample_image(tracks: u8) -> Vec<u8> {
        let mut out = Vec::new();

        out.extend_from_slice(b"IMD 1.17: 01/01/2024 12:00:00\r\n");
        out.extend_from_slice(b"test image");
        out.push(0x1A);

        for cyl in 0..tracks {
            out.push(5); // 250 kbps MFM
            out.push(cyl);
            out.push(0); // head
            out.push(9);
            out.push(2); // 512 bytes

            out.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);

            for _ in 0..9 {
                out.push(SECTOR_COMPRESSED);
                out.push(0xE5);
            }
        }

        out
    }

    #[test]
    fn test_detect() {
        assert!(ImdImage::detect(b"IMD 1.17: 01/01/2024 12:00:00\r\n"));
        assert!(ImdImage::detect(b"IMD 1.18: whatever"));
        assert!(!ImdImage::detect(b"MV - CPCEMU Disk-File\r\nDisk-Info\r\n"));
        assert!(!ImdImage::detect(b"IMD x.17: bad version"));
        assert!(!ImdImage::detect(b"IMD 1."));
    }

    #[test]
    fn test_parse_geometry() {
        let image = ImdImage::from_bytes(&sample_image(40)).unwrap();

        let props = image.properties();
        assert_eq!(props.tracks(), 40);
        assert_eq!(props.heads(), 1);
        assert_eq!(props.sectors(), 9);
        assert_eq!(props.sector_size(), 512);
        assert!(!image.modified());
    }

    #[test]
    fn test_parse_sector_records() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"IMD 1.17: 01/01/2024 12:00:00\r\n");
        bytes.push(0x1A);

        // one track, three sectors: verbatim, compressed, absent
        bytes.extend_from_slice(&[5, 0, 0, 3, 0]); // 128-byte sectors
        bytes.extend_from_slice(&[1, 2, 3]);
        bytes.push(SECTOR_VERBATIM);
        bytes.extend_from_slice(&(0..128).map(|i| i as u8).collect::<Vec<_>>());
        bytes.push(SECTOR_COMPRESSED);
        bytes.push(0x42);
        bytes.push(SECTOR_ABSENT);

        let image = ImdImage::from_bytes(&bytes).unwrap();

        assert_eq!(image.read(0).data()[5], 5);
        assert_eq!(image.read(1).data(), &[0x42; 128]);
        assert!(image.read(2).is_empty());
    }

    #[test]
    fn test_reject_bad_mode() {
        let mut bytes = sample_image(1);
        // first track header byte follows the comment terminator
        let pos = bytes.iter().position(|&b| b == 0x1A).unwrap() + 1;
        bytes[pos] = 6;

        assert!(ImdImage::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_reject_bad_size_code() {
        let mut bytes = sample_image(1);
        let pos = bytes.iter().position(|&b| b == 0x1A).unwrap() + 5;
        bytes[pos] = 7;

        assert!(ImdImage::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_write_and_modified_flag() {
        let mut image = ImdImage::from_bytes(&sample_image(2)).unwrap();
        assert!(!image.modified());

        image.write(3, Sector::filled(512, 0xAA)).unwrap();
        assert!(image.modified());
        assert_eq!(image.read(3).data(), &[0xAA; 512]);
    }

    #[test]
    fn test_write_out_of_range() {
        let mut image = ImdImage::from_bytes(&sample_image(2)).unwrap();

        let result = image.write(18, Sector::filled(512, 0));
        assert!(matches!(result, Err(FsError::OutOfRange { .. })));
    }

    #[test]
    fn test_write_size_mismatch() {
        let mut image = ImdImage::from_bytes(&sample_image(2)).unwrap();

        let result = image.write(0, Sector::filled(256, 0));
        assert!(matches!(result, Err(FsError::SectorSizeMismatch { .. })));
    }

    #[test]
    fn test_write_materializes_track() {
        // image with only cylinder 0 formatted, but geometry says 4 tracks
        let mut bytes = sample_image(1);
        // raise the cylinder of a second copy of the track to 3
        let mut tail = sample_image(1)[bytes.len() - (5 + 9 + 18)..].to_vec();
        tail[1] = 3;
        bytes.extend_from_slice(&tail);

        let mut image = ImdImage::from_bytes(&bytes).unwrap();
        assert_eq!(image.properties().tracks(), 4);

        // cylinder 1 was never formatted
        assert!(image.read(9).is_empty());

        image.write(9, Sector::filled(512, 0x11)).unwrap();
        assert_eq!(image.read(9).data(), &[0x11; 512]);

        // the rest of the new track stays absent
        assert!(image.read(10).is_empty());
    }

    #[test]
    fn test_compression_round_trip() {
        let mut image = ImdImage::from_bytes(&sample_image(2)).unwrap();

        let patterned: Vec<u8> = (0..512).map(|i| (i * 7 % 251) as u8).collect();
        image.write(0, Sector::new(patterned.clone())).unwrap();
        image.write(1, Sector::filled(512, 0x42)).unwrap();

        let saved = image.to_bytes();
        let reloaded = ImdImage::from_bytes(&saved).unwrap();

        assert_eq!(reloaded.read(0).data(), patterned.as_slice());
        assert_eq!(reloaded.read(1).data(), &[0x42; 512]);
        assert_eq!(reloaded.properties(), image.properties());
    }

    #[test]
    fn test_save_load_fixpoint() {
        let mut image = ImdImage::from_bytes(&sample_image(3)).unwrap();
        image
            .write(5, Sector::new((0..512).map(|i| i as u8).collect()))
            .unwrap();

        let once = ImdImage::from_bytes(&image.to_bytes()).unwrap();
        let twice = ImdImage::from_bytes(&once.to_bytes()).unwrap();

        assert_eq!(once.properties(), twice.properties());
        for pos in 0..=once.properties().max_pos() {
            assert_eq!(once.read(pos), twice.read(pos));
        }
    }
}
