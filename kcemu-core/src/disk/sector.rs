//! Sector addressing and track storage shared by the image codecs.
//!
//! A track owns one contiguous byte buffer. Sectors refer into it by
//! offset and length, so writing through a sector updates the track
//! buffer that later reads see.

use std::ops::Range;

use super::DiskId;

/// Sector address as recorded in the ID field (C, H, R, N).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SectorId {
    pub cyl: u8,
    pub head: u8,
    pub sector: u8,
    pub size_code: u8,
}

impl SectorId {
    pub fn new(cyl: u8, head: u8, sector: u8, size_code: u8) -> Self {
        Self {
            cyl,
            head,
            sector,
            size_code,
        }
    }

    /// Nominal size, `128 << size_code`.
    pub fn nominal_size(&self) -> usize {
        128usize << (self.size_code.min(7) as usize)
    }
}

/// Handle identifying one sector of one disk, used for writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorKey {
    pub disk: DiskId,
    pub cyl: usize,
    pub head: usize,
    pub index: usize,
}

/// Borrowed view of a sector, tagged with the disk it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct SectorView<'a> {
    pub disk: DiskId,
    /// Physical cylinder and head the sector was found on.
    pub cyl: usize,
    pub head: usize,
    /// Position within the track's ID table.
    pub index: usize,
    pub id: SectorId,
    pub deleted: bool,
    pub error: bool,
    pub data: &'a [u8],
    /// Bytes reserved for this sector in the backing file.
    pub file_portion_len: usize,
}

impl SectorView<'_> {
    pub fn key(&self) -> SectorKey {
        SectorKey {
            disk: self.disk,
            cyl: self.cyl,
            head: self.head,
            index: self.index,
        }
    }

    pub fn sector_num(&self) -> u8 {
        self.id.sector
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Stored sector metadata; the payload lives in the owning track buffer.
#[derive(Debug, Clone)]
pub(crate) struct SectorSlot {
    pub id: SectorId,
    pub deleted: bool,
    pub error: bool,
    pub data_pos: usize,
    pub data_len: usize,
    /// Room in the track buffer starting at `data_pos`.
    pub room: usize,
    pub file_pos: Option<u64>,
    pub file_portion_len: usize,
}

impl SectorSlot {
    pub fn range(&self) -> Range<usize> {
        self.data_pos..self.data_pos + self.data_len
    }
}

/// One physical track: file placement, payload buffer and sector table.
#[derive(Debug, Clone, Default)]
pub(crate) struct TrackData {
    pub file_pos: u64,
    /// Total on-disk length including any header and padding.
    pub file_len: usize,
    pub buf: Vec<u8>,
    pub sectors: Vec<SectorSlot>,
}

impl TrackData {
    pub fn new(file_pos: u64, file_len: usize, buf: Vec<u8>) -> Self {
        Self {
            file_pos,
            file_len,
            buf,
            sectors: Vec::new(),
        }
    }

    /// Append a sector whose payload starts at `data_pos` of the buffer.
    /// The visible length is clamped to the buffer end.
    pub fn push(
        &mut self,
        id: SectorId,
        data_pos: usize,
        size: usize,
        file_pos: Option<u64>,
        file_portion_len: usize,
    ) {
        let room = self.buf.len().saturating_sub(data_pos);
        self.sectors.push(SectorSlot {
            id,
            deleted: false,
            error: false,
            data_pos: data_pos.min(self.buf.len()),
            data_len: size.min(room),
            room: file_portion_len.min(room),
            file_pos,
            file_portion_len,
        });
    }

    pub fn view(&self, disk: DiskId, cyl: usize, head: usize, index: usize) -> Option<SectorView<'_>> {
        let slot = self.sectors.get(index)?;
        Some(SectorView {
            disk,
            cyl,
            head,
            index,
            id: slot.id,
            deleted: slot.deleted,
            error: slot.error,
            data: &self.buf[slot.range()],
            file_portion_len: slot.file_portion_len,
        })
    }

    /// Mirror a successful write into the track buffer.
    pub fn store(&mut self, index: usize, data: &[u8], deleted: bool) -> bool {
        let Some(slot) = self.sectors.get_mut(index) else {
            return false;
        };
        if data.len() > slot.room {
            return false;
        }
        let start = slot.data_pos;
        self.buf[start..start + data.len()].copy_from_slice(data);
        slot.data_len = data.len();
        slot.deleted = deleted;
        slot.error = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_views_share_track_buffer() {
        let mut track = TrackData::new(0x100, 0x300, vec![0xE5; 512]);
        track.push(SectorId::new(0, 0, 1, 1), 0, 256, Some(0x200), 256);
        track.push(SectorId::new(0, 0, 2, 1), 256, 256, Some(0x300), 256);

        assert!(track.store(1, &[1, 2, 3], false));
        assert_eq!(&track.buf[256..259], &[1, 2, 3]);

        let view = track.view(DiskId::next(), 0, 0, 1).unwrap();
        assert_eq!(view.data, &[1, 2, 3]);
        assert_eq!(view.file_portion_len, 256);
        assert_eq!(view.sector_num(), 2);
    }

    #[test]
    fn test_clamped_sector_at_buffer_end() {
        let mut track = TrackData::new(0, 0, vec![0; 300]);
        track.push(SectorId::new(0, 0, 1, 2), 0, 512, None, 512);
        track.push(SectorId::new(0, 0, 2, 2), 512, 512, None, 512);
        let view = track.view(DiskId::next(), 0, 0, 0).unwrap();
        assert_eq!(view.data_len(), 300);
        let view = track.view(DiskId::next(), 0, 0, 1).unwrap();
        assert_eq!(view.data_len(), 0);
        assert!(!track.store(0, &[0; 400], false));
    }
}
