//! A drive slot holding an optional disk image.

use super::{FloppyDisk, SectorId, SectorKey, SectorView};

/// Access counter value after a disk access; decays once per station tick.
pub const ACCESS_HOLD_TICKS: u32 = 10;

/// Highest cylinder the head can step to.
const MAX_HEAD_CYLINDER: usize = 95;

/// Gives the controller access to its drives by number.
pub trait DriveSelector {
    fn floppy_disk_drive(&mut self, drive_num: usize) -> Option<&mut FloppyDiskDrive>;
}

#[derive(Default)]
pub struct FloppyDiskDrive {
    disk: Option<Box<dyn FloppyDisk>>,
    /// SD disk in a DD drive: the software steps twice per disk cylinder.
    skip_odd_cylinders: bool,
    head_cylinder: usize,
    access_counter: u32,
}

impl FloppyDiskDrive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a disk, closing any previous one.
    pub fn set_disk(&mut self, disk: Box<dyn FloppyDisk>, skip_odd_cylinders: bool) {
        self.remove_disk();
        self.disk = Some(disk);
        self.skip_odd_cylinders = skip_odd_cylinders;
    }

    pub fn remove_disk(&mut self) {
        if let Some(mut disk) = self.disk.take() {
            disk.close();
        }
        self.skip_odd_cylinders = false;
    }

    pub fn disk(&self) -> Option<&dyn FloppyDisk> {
        self.disk.as_deref()
    }

    pub fn disk_mut(&mut self) -> Option<&mut (dyn FloppyDisk + 'static)> {
        self.disk.as_deref_mut()
    }

    pub fn skip_odd_cylinders(&self) -> bool {
        self.skip_odd_cylinders
    }

    pub fn is_ready(&self) -> bool {
        self.disk.is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.disk.as_ref().is_none_or(|d| d.is_read_only())
    }

    pub fn head_cylinder(&self) -> usize {
        self.head_cylinder
    }

    pub fn is_track0(&self) -> bool {
        self.head_cylinder == 0
    }

    /// Head back to cylinder 0.
    pub fn reset(&mut self) {
        self.head_cylinder = 0;
    }

    /// One step pulse; `outward` moves towards cylinder 0.
    pub fn seek_step(&mut self, outward: bool) {
        if outward {
            self.head_cylinder = self.head_cylinder.saturating_sub(1);
        } else if self.head_cylinder < MAX_HEAD_CYLINDER {
            self.head_cylinder += 1;
        }
    }

    pub fn seek_to(&mut self, cyl: usize) {
        self.head_cylinder = cyl.min(MAX_HEAD_CYLINDER);
    }

    pub fn access_counter(&self) -> u32 {
        self.access_counter
    }

    pub fn is_active(&self) -> bool {
        self.access_counter > 0
    }

    /// Decrement the activity counter; returns whether it is still active.
    pub fn decay_access(&mut self) -> bool {
        self.access_counter = self.access_counter.saturating_sub(1);
        self.access_counter > 0
    }

    fn touch(&mut self) {
        self.access_counter = ACCESS_HOLD_TICKS;
    }

    /// Disk cylinder under the head, `None` between the cylinders of an SD disk.
    fn disk_cylinder(&self) -> Option<usize> {
        if self.skip_odd_cylinders {
            if self.head_cylinder & 1 != 0 {
                return None;
            }
            Some(self.head_cylinder / 2)
        } else {
            Some(self.head_cylinder)
        }
    }

    pub fn sector_count(&mut self, head: usize) -> usize {
        self.touch();
        match (self.disk.as_deref(), self.disk_cylinder()) {
            (Some(disk), Some(cyl)) => disk.sectors_of_cylinder(cyl, head),
            _ => 0,
        }
    }

    pub fn sector_by_index(&mut self, head: usize, index: usize) -> Option<SectorView<'_>> {
        self.touch();
        let cyl = self.disk_cylinder()?;
        self.disk.as_deref()?.sector_by_index(cyl, head, index)
    }

    /// Find a sector under the head whose ID matches `id` in C, H and R.
    pub fn find_sector(&mut self, head: usize, id: SectorId) -> Option<SectorView<'_>> {
        self.touch();
        let cyl = self.disk_cylinder()?;
        let disk = self.disk.as_deref()?;
        (0..disk.sectors_of_cylinder(cyl, head))
            .filter_map(|i| disk.sector_by_index(cyl, head, i))
            .find(|s| s.id.cyl == id.cyl && s.id.head == id.head && s.id.sector == id.sector)
    }

    pub fn format_track(&mut self, head: usize, ids: &[SectorId], data: &[u8]) -> bool {
        self.touch();
        let Some(cyl) = self.disk_cylinder() else {
            return false;
        };
        match self.disk.as_deref_mut() {
            Some(disk) if !disk.is_read_only() => disk.format_track(cyl, head, ids, data),
            _ => false,
        }
    }

    pub fn write_sector(&mut self, key: SectorKey, data: &[u8], deleted: bool) -> bool {
        self.touch();
        match self.disk.as_deref_mut() {
            Some(disk) if !disk.is_read_only() => disk.write_sector(key, data, deleted),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskGeometry, PlainDisk};

    fn sd_disk() -> Box<dyn FloppyDisk> {
        let fmt = DiskGeometry::new(1, 40, 2, 128);
        let image: Vec<u8> = (0..fmt.disk_size()).map(|i| (i / 256) as u8).collect();
        Box::new(PlainDisk::from_bytes(image, fmt, None))
    }

    #[test]
    fn test_skip_odd_cylinders() {
        let mut drive = FloppyDiskDrive::new();
        drive.set_disk(sd_disk(), true);
        drive.seek_to(4);
        let id = SectorId::new(2, 0, 1, 0);
        assert_eq!(drive.find_sector(0, id).unwrap().data[0], 2);
        drive.seek_step(false);
        assert_eq!(drive.sector_count(0), 0);
        assert!(drive.find_sector(0, id).is_none());
    }

    #[test]
    fn test_direct_cylinders() {
        let mut drive = FloppyDiskDrive::new();
        drive.set_disk(sd_disk(), false);
        drive.seek_to(3);
        assert_eq!(drive.sector_by_index(0, 0).unwrap().data[0], 3);
        drive.reset();
        assert!(drive.is_track0());
        drive.seek_step(true);
        assert_eq!(drive.head_cylinder(), 0);
    }

    #[test]
    fn test_access_counter_decays() {
        let mut drive = FloppyDiskDrive::new();
        assert!(!drive.is_ready());
        assert!(drive.is_read_only());
        drive.sector_count(0);
        assert_eq!(drive.access_counter(), ACCESS_HOLD_TICKS);
        for _ in 1..ACCESS_HOLD_TICKS {
            assert!(drive.decay_access());
        }
        assert!(!drive.decay_access());
    }
}
