/// CPC DSK codec, standard and extended layouts

use std::collections::HashMap;
use std::path::Path;

use crate::error::{FsError, Result};
use crate::geometry::{DiskPos, DiskProperties};
use crate::image::{ByteReader, Disk, Sector};

const STANDARD_SIGNATURE: &[u8] = b"MV - CPCEMU Disk-File\r\nDisk-Info\r\n";
const EXTENDED_SIGNATURE: &[u8] = b"EXTENDED CPC DSK File\r\nDisk-Info\r\n";
const TRACK_TAG: &[u8] = b"Track-Info\r\n";

const CREATOR_LEN: usize = 14;
/// Track blocks start on this boundary; the disk-info block fills the first
const DATA_ALIGNMENT: usize = 256;
/// Sector and track sizes are stored in units of 256 bytes
const SIZE_UNIT: u32 = 256;

/// Gap and filler used when materializing a track on write. PC-compatible
/// controllers do not use the gap but drivers expect 0x1B anyway.
const DEFAULT_GAP: u8 = 0x1B;
const DEFAULT_FILLER: u8 = 0xE5;

static EMPTY_SECTOR: Sector = Sector::empty();

/// One 8-byte sector-info record
#[derive(Debug, Clone, Default)]
struct SectorInfo {
    track: u8,
    side: u8,
    /// 1-based sector id on disk
    id: u8,
    size_code: u8,
    status1: u8,
    status2: u8,
    /// Actual stored length; only meaningful in the extended layout
    data_length: u16,
}

#[derive(Debug, Clone)]
struct DskTrack {
    track: u8,
    side: u8,
    size_code: u8,
    sector_count: u8,
    gap: u8,
    filler: u8,
    infos: Vec<SectorInfo>,
    sectors: Vec<Sector>,
}

/// A CPC DSK file held fully in memory
pub struct DskImage {
    properties: DiskProperties,
    extended: bool,
    /// Extended layout: per-(track, side) block sizes in 256-byte units,
    /// kept verbatim for re-serialization
    track_sizes: Vec<u8>,
    tracks: Vec<DskTrack>,
    /// linear position -> (track index, sector index within track)
    index: HashMap<u32, (usize, usize)>,
    modified: bool,
}

impl DskImage {
    /// Check whether a byte buffer starts with either DSK signature
    pub fn detect(bytes: &[u8]) -> bool {
        bytes.starts_with(STANDARD_SIGNATURE) || bytes.starts_with(EXTENDED_SIGNATURE)
    }

    /// Parse a DSK image from a byte buffer
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);

        let signature = reader.read_bytes(STANDARD_SIGNATURE.len())?;
        let extended = if signature == STANDARD_SIGNATURE {
            false
        } else if signature == EXTENDED_SIGNATURE {
            true
        } else {
            return Err(FsError::corrupt("unknown DSK signature"));
        };

        reader.skip(CREATOR_LEN);

        let track_count = reader.read_u8()?;
        let side_count = reader.read_u8()?;

        // track size; unused here, recomputed on save
        reader.skip(2);

        let mut track_sizes = Vec::new();
        let mut tracks = Vec::new();

        if extended {
            for _ in 0..track_count as usize * side_count as usize {
                track_sizes.push(reader.read_u8()?);
            }

            reader.seek(DATA_ALIGNMENT);

            for t in 0..track_count {
                for s in 0..side_count {
                    if track_sizes[t as usize * side_count as usize + s as usize] == 0 {
                        continue;
                    }

                    tracks.push(Self::parse_track(&mut reader, true)?);
                }
            }
        } else {
            reader.skip(204);

            for _ in 0..track_count {
                tracks.push(Self::parse_track(&mut reader, false)?);
            }
        }

        let properties = Self::derive_properties(track_count, side_count, &tracks);
        let index = Self::build_index(&properties, &tracks)?;

        Ok(Self {
            properties,
            extended,
            track_sizes,
            tracks,
            index,
            modified: false,
        })
    }

    fn parse_track(reader: &mut ByteReader, extended: bool) -> Result<DskTrack> {
        let track_start = reader.pos();

        if reader.read_bytes(TRACK_TAG.len())? != TRACK_TAG {
            return Err(FsError::corrupt("unexpected track tag"));
        }

        reader.skip(4);

        let track = reader.read_u8()?;
        let side = reader.read_u8()?;

        reader.skip(2);

        let size_code = reader.read_u8()?;
        let sector_count = reader.read_u8()?;
        let gap = reader.read_u8()?;
        let filler = reader.read_u8()?;

        let mut infos = Vec::with_capacity(sector_count as usize);

        for _ in 0..sector_count {
            let mut info = SectorInfo {
                track: reader.read_u8()?,
                side: reader.read_u8()?,
                id: reader.read_u8()?,
                size_code: reader.read_u8()?,
                status1: reader.read_u8()?,
                status2: reader.read_u8()?,
                data_length: 0,
            };

            if extended {
                info.data_length = reader.read_u16()?;
            } else {
                reader.skip(2);
            }

            infos.push(info);
        }

        reader.seek(track_start + DATA_ALIGNMENT);

        let mut sectors = Vec::with_capacity(infos.len());

        for info in &infos {
            let size = if extended {
                info.data_length as usize
            } else {
                info.size_code as usize * SIZE_UNIT as usize
            };

            sectors.push(Sector::new(reader.read_bytes(size)?.to_vec()));
        }

        Ok(DskTrack {
            track,
            side,
            size_code,
            sector_count,
            gap,
            filler,
            infos,
            sectors,
        })
    }

    fn derive_properties(track_count: u8, side_count: u8, tracks: &[DskTrack]) -> DiskProperties {
        let mut sectors = 0;
        let mut sector_size = 0;

        for track in tracks {
            sectors = sectors.max(track.sector_count as u32);
            sector_size = sector_size.max(track.size_code as u32 * SIZE_UNIT);
        }

        DiskProperties::new(track_count as u32, side_count as u32, sectors, sector_size)
    }

    fn build_index(
        properties: &DiskProperties,
        tracks: &[DskTrack],
    ) -> Result<HashMap<u32, (usize, usize)>> {
        let mut index = HashMap::new();

        for (track_idx, track) in tracks.iter().enumerate() {
            for (sector_idx, info) in track.infos.iter().enumerate() {
                let sector = info
                    .id
                    .checked_sub(1)
                    .ok_or_else(|| FsError::corrupt("sector id 0 in sector info"))?;
                let dpos = DiskPos::new(
                    properties,
                    info.track as u32,
                    info.side as u32,
                    sector as u32,
                )?;

                index.insert(dpos.pos(), (track_idx, sector_idx));
            }
        }

        Ok(index)
    }

    /// Create a blank, fully formatted image with every sector filled 0xE5
    ///
    /// Standard layout keeps one track record per cylinder, so multi-sided
    /// images should use the extended layout.
    pub fn blank(
        tracks: u32,
        sides: u32,
        sectors: u32,
        sector_size: u32,
        extended: bool,
    ) -> Result<Self> {
        let properties = DiskProperties::new(tracks, sides, sectors, sector_size);

        let size_code = (sector_size / SIZE_UNIT) as u8;
        let block_units = ((DATA_ALIGNMENT as u32 + sectors * sector_size) / SIZE_UNIT) as u8;

        let mut track_records = Vec::new();
        let mut track_sizes = Vec::new();

        for t in 0..tracks {
            for s in 0..sides {
                if !extended && s > 0 {
                    continue;
                }

                let infos = (0..sectors)
                    .map(|i| SectorInfo {
                        track: t as u8,
                        side: s as u8,
                        id: i as u8 + 1,
                        size_code,
                        status1: 0,
                        status2: 0,
                        data_length: if extended { sector_size as u16 } else { 0 },
                    })
                    .collect();

                track_records.push(DskTrack {
                    track: t as u8,
                    side: s as u8,
                    size_code,
                    sector_count: sectors as u8,
                    gap: DEFAULT_GAP,
                    filler: DEFAULT_FILLER,
                    infos,
                    sectors: (0..sectors)
                        .map(|_| Sector::filled(sector_size as usize, DEFAULT_FILLER))
                        .collect(),
                });

                track_sizes.push(block_units);
            }
        }

        let index = Self::build_index(&properties, &track_records)?;

        Ok(Self {
            properties,
            extended,
            track_sizes: if extended { track_sizes } else { Vec::new() },
            tracks: track_records,
            index,
            modified: false,
        })
    }

    /// Serialize the image to a byte buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();

        if self.extended {
            out.extend_from_slice(EXTENDED_SIGNATURE);
        } else {
            out.extend_from_slice(STANDARD_SIGNATURE);
        }

        let mut creator = format!("floppyfs {}", env!("CARGO_PKG_VERSION")).into_bytes();
        creator.resize(CREATOR_LEN, 0);
        out.extend_from_slice(&creator);

        out.push(self.properties.tracks() as u8);
        out.push(self.properties.heads() as u8);

        if self.extended {
            out.extend_from_slice(&[0, 0]);
        } else {
            let track_size =
                (self.properties.sectors() * self.properties.sector_size()) as u16 + 256;
            out.extend_from_slice(&track_size.to_le_bytes());
        }

        if self.extended {
            out.extend_from_slice(&self.track_sizes);
        } else {
            out.extend_from_slice(&[0u8; 204]);
        }

        if out.len() % DATA_ALIGNMENT != 0 {
            out.resize(out.len() + DATA_ALIGNMENT - out.len() % DATA_ALIGNMENT, 0);
        }

        for track in &self.tracks {
            let track_start = out.len();

            out.extend_from_slice(TRACK_TAG);
            out.extend_from_slice(&[0u8; 4]);

            out.push(track.track);
            out.push(track.side);

            if self.extended {
                out.extend_from_slice(&[0x00, 0x00]);
            } else {
                out.extend_from_slice(&[0x01, 0x00]);
            }

            out.push(track.size_code);
            out.push(track.sector_count);
            out.push(track.gap);
            out.push(track.filler);

            for info in &track.infos {
                out.push(info.track);
                out.push(info.side);
                out.push(info.id);
                out.push(info.size_code);
                out.push(info.status1);
                out.push(info.status2);
                out.extend_from_slice(&info.data_length.to_le_bytes());
            }

            if out.len() < track_start + DATA_ALIGNMENT {
                out.resize(track_start + DATA_ALIGNMENT, 0);
            }

            for sector in &track.sectors {
                out.extend_from_slice(sector.data());
            }
        }

        out
    }

    /// Create the track enclosing `pos` with per-format defaults
    fn materialize_track(&mut self, pos: u32, sector: Sector) -> Result<()> {
        let dpos = DiskPos::from_pos(&self.properties, pos)?;

        let sector_count = self.properties.sectors();
        let size_code = (self.properties.sector_size() / SIZE_UNIT) as u8;

        let infos = (0..sector_count)
            .map(|i| SectorInfo {
                track: dpos.track() as u8,
                side: dpos.head() as u8,
                id: i as u8 + 1,
                size_code,
                status1: 0,
                status2: 0,
                data_length: if self.extended {
                    self.properties.sector_size() as u16
                } else {
                    0
                },
            })
            .collect();

        let mut sectors = vec![Sector::empty(); sector_count as usize];
        sectors[dpos.sector() as usize] = sector;

        let track = DskTrack {
            track: dpos.track() as u8,
            side: dpos.head() as u8,
            size_code,
            sector_count: sector_count as u8,
            gap: DEFAULT_GAP,
            filler: DEFAULT_FILLER,
            infos,
            sectors,
        };

        let track_idx = self.tracks.len();
        for i in 0..sector_count {
            let ipos = DiskPos::new(&self.properties, dpos.track(), dpos.head(), i)?;
            self.index.insert(ipos.pos(), (track_idx, i as usize));
        }

        self.tracks.push(track);

        Ok(())
    }
}

impl Disk for DskImage {
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
