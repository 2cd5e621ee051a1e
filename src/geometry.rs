/// Disk geometry and sector addressing

use crate::error::{FsError, Result};

/// Immutable geometry of a disk image
///
/// All derived quantities are computed once at construction. The linear
/// address space runs from 0 to `max_pos` inclusive, one slot per sector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskProperties {
    tracks: u32,
    heads: u32,
    sectors: u32,
    sector_size: u32,
    sectors_per_track: u32,
    max_pos: u32,
    size: u32,
}

impl DiskProperties {
    /// Create geometry from track count, head count, sectors per head and
    /// sector size in bytes
    pub fn new(tracks: u32, heads: u32, sectors: u32, sector_size: u32) -> Self {
        let positions = tracks * heads * sectors;

        Self {
            tracks,
            heads,
            sectors,
            sector_size,
            sectors_per_track: sectors * heads,
            max_pos: positions.saturating_sub(1),
            size: positions * sector_size,
        }
    }

    /// Number of tracks (cylinders)
    pub fn tracks(&self) -> u32 {
        self.tracks
    }

    /// Number of heads (sides)
    pub fn heads(&self) -> u32 {
        self.heads
    }

    /// Sectors per head within one track
    pub fn sectors(&self) -> u32 {
        self.sectors
    }

    /// Uniform sector size in bytes
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Sectors per track across all heads
    pub fn sectors_per_track(&self) -> u32 {
        self.sectors_per_track
    }

    /// Largest valid linear sector position
    pub fn max_pos(&self) -> u32 {
        self.max_pos
    }

    /// Total capacity in bytes
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Check a (track, head, sector) triple against the geometry bounds
    pub fn validate(&self, track: u32, head: u32, sector: u32) -> Result<()> {
        if track >= self.tracks {
            return Err(FsError::InvalidGeometry {
                kind: "track",
                value: track,
                max: self.tracks - 1,
            });
        }

        if head >= self.heads {
            return Err(FsError::InvalidGeometry {
                kind: "head",
                value: head,
                max: self.heads - 1,
            });
        }

        if sector >= self.sectors {
            return Err(FsError::InvalidGeometry {
                kind: "sector",
                value: sector,
                max: self.sectors - 1,
            });
        }

        Ok(())
    }
}

/// A sector address, holding both the (track, head, sector) triple and its
/// linear position
///
/// The two constructors are inverses of each other for every valid address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskPos {
    track: u32,
    head: u32,
    sector: u32,
    pos: u32,
}

impl DiskPos {
    /// Build an address from a (track, head, sector) triple
    pub fn new(props: &DiskProperties, track: u32, head: u32, sector: u32) -> Result<Self> {
        props.validate(track, head, sector)?;

        Ok(Self {
            track,
            head,
            sector,
            pos: track * props.sectors_per_track() + head * props.sectors() + sector,
        })
    }

    /// Recover the (track, head, sector) triple from a linear position
    pub fn from_pos(props: &DiskProperties, pos: u32) -> Result<Self> {
        let track = pos / props.sectors_per_track();
        let head = (pos % props.sectors_per_track()) / props.sectors();
        let sector = (pos % props.sectors_per_track()) % props.sectors();

        props.validate(track, head, sector)?;

        Ok(Self {
            track,
            head,
            sector,
            pos,
        })
    }

    /// Track (cylinder) number
    pub fn track(&self) -> u32 {
        self.track
    }

    /// Head (side) number
    pub fn head(&self) -> u32 {
        self.head
    }

    /// Sector number within the head
    pub fn sector(&self) -> u32 {
        self.sector
    }

    /// Linear sector position
    pub fn pos(&self) -> u32 {
        self.pos
    }
}
