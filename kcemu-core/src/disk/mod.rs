//! Floppy disk images.
//!
//! Every image format implements [`FloppyDisk`]: a geometry, sector lookup
//! by cylinder/head/index and the two mutating operations the floppy
//! controller needs, `format_track` and `write_sector`. Failures during
//! those live operations are reported through an [`ErrorListener`] and a
//! `false` return, never as a panic or `Err`, so the emulated machine keeps
//! running when a disk goes bad.

pub mod anadisk;
pub mod cpc;
pub mod drive;
pub mod plain;
pub mod sector;
pub mod station;

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;

use crate::error::{KcError, KcResult};

pub use anadisk::AnaDisk;
pub use cpc::CpcDisk;
pub use drive::{DriveSelector, FloppyDiskDrive};
pub use plain::PlainDisk;
pub use sector::{SectorId, SectorKey, SectorView};
pub use station::DiskStation;

/// Callback for disk errors; the UI or log decides how to show them.
pub type ErrorListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Identity of an open disk image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiskId(u64);

impl DiskId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        DiskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Disk geometry as reported to the controller and the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskGeometry {
    pub sides: usize,
    pub cylinders: usize,
    pub sectors_per_cylinder: usize,
    pub sector_size: usize,
}

impl DiskGeometry {
    pub const fn new(sides: usize, cylinders: usize, sectors_per_cylinder: usize, sector_size: usize) -> Self {
        Self {
            sides,
            cylinders,
            sectors_per_cylinder,
            sector_size,
        }
    }

    pub fn disk_size(&self) -> usize {
        self.sides * self.cylinders * self.sectors_per_cylinder * self.sector_size
    }
}

/// Well-known formats offered for new images.
pub type FloppyDiskFormat = DiskGeometry;

pub const FMT_400K: FloppyDiskFormat = DiskGeometry::new(2, 40, 5, 1024);
pub const FMT_624K: FloppyDiskFormat = DiskGeometry::new(2, 80, 16, 256);
pub const FMT_720K: FloppyDiskFormat = DiskGeometry::new(2, 80, 9, 512);
pub const FMT_780K: FloppyDiskFormat = DiskGeometry::new(2, 80, 5, 1024);

/// Human readable description of a format, e.g. `780K (2x80x5x1024)`.
pub fn format_text(geom: &DiskGeometry) -> String {
    // 780K counts the capacity left after the two system tracks
    let kbytes = if geom == &FMT_780K {
        780
    } else {
        geom.disk_size() / 1024
    };
    format!(
        "{}K ({}x{}x{}x{})",
        kbytes, geom.sides, geom.cylinders, geom.sectors_per_cylinder, geom.sector_size
    )
}

/// A bundled, bootable disk offered by an emulated system.
#[derive(Debug, Clone, PartialEq)]
pub struct FloppyDiskInfo {
    /// Resource path, e.g. `/disks/z1013/z1013cpm64x16.dump.gz`.
    pub resource: &'static str,
    pub text: &'static str,
    pub sys_tracks: usize,
    pub block_size: usize,
    pub block_num_16bit: bool,
}

/// The operations the controller and the disk station need.
pub trait FloppyDisk: Send {
    fn id(&self) -> DiskId;

    fn geometry(&self) -> DiskGeometry;

    fn is_read_only(&self) -> bool;

    /// Source file or resource name.
    fn file_name(&self) -> Option<&str>;

    /// Short name of the image format.
    fn file_format_text(&self) -> &'static str;

    /// Additional notes about the medium.
    fn remark(&self) -> Option<String> {
        None
    }

    /// Number of sectors on a track.
    fn sectors_of_cylinder(&self, cyl: usize, head: usize) -> usize;

    /// Sector at position `index` of the track's ID table.
    fn sector_by_index(&self, cyl: usize, head: usize, index: usize) -> Option<SectorView<'_>>;

    /// Search a track for the sector with record number `sector_num`.
    fn read_sector(&self, cyl: usize, head: usize, sector_num: u8) -> Option<SectorView<'_>> {
        (0..self.sectors_of_cylinder(cyl, head))
            .filter_map(|i| self.sector_by_index(cyl, head, i))
            .find(|s| s.id.sector == sector_num)
    }

    /// Replace a whole track. Each sector receives a copy of `data`.
    fn format_track(&mut self, cyl: usize, head: usize, ids: &[SectorId], data: &[u8]) -> bool;

    /// Rewrite one sector in place.
    fn write_sector(&mut self, key: SectorKey, data: &[u8], deleted: bool) -> bool;

    fn set_error_listener(&mut self, listener: Option<ErrorListener>);

    /// Release the file lock and handle. Safe to call repeatedly.
    fn close(&mut self);

    /// Text shown in the disk station.
    fn media_text(&self) -> String {
        let name = self.file_name().unwrap_or("");
        if self.is_read_only() {
            format!("{} (read-only)", name)
        } else {
            name.to_string()
        }
    }

    fn sides(&self) -> usize {
        self.geometry().sides
    }

    fn cylinders(&self) -> usize {
        self.geometry().cylinders
    }

    fn sectors_per_cylinder(&self) -> usize {
        self.geometry().sectors_per_cylinder
    }

    fn sector_size(&self) -> usize {
        self.geometry().sector_size
    }
}

/// Size code for a sector length: the smallest `n` with `128 << n >= size`.
pub fn size_code_of(size: usize) -> u8 {
    let mut size = size;
    let mut code = 0;
    while size > 0x80 {
        size = (size >> 1) | (size & 1);
        code += 1;
    }
    code
}

pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1F && data[1] == 0x8B
}

/// Decompress when the data carries a gzip header.
pub fn decompress_if_gzip(data: Vec<u8>) -> KcResult<Vec<u8>> {
    if !is_gzip(&data) {
        return Ok(data);
    }
    let mut out = Vec::new();
    GzDecoder::new(data.as_slice()).read_to_end(&mut out)?;
    Ok(out)
}

/// Read a whole file, transparently decompressing gzip content.
pub fn read_maybe_gzip(path: &Path) -> KcResult<Vec<u8>> {
    decompress_if_gzip(std::fs::read(path)?)
}

/// Take the advisory lock on an open image file.
pub(crate) fn lock_file(file: &File, path: &Path) -> KcResult<()> {
    match file.try_lock() {
        Ok(()) => Ok(()),
        Err(std::fs::TryLockError::WouldBlock) => Err(KcError::Locked(path.display().to_string())),
        Err(std::fs::TryLockError::Error(e)) => Err(KcError::Io(e)),
    }
}

/// Release lock and drop the handle; nothing is reported.
pub(crate) fn release_file(file: &mut Option<File>) {
    if let Some(f) = file.take() {
        if let Err(e) = f.unlock() {
            log::debug!("unlock failed: {}", e);
        }
    }
}

pub(crate) fn fire_error(listener: &Option<ErrorListener>, msg: &str) {
    log::warn!("{}", msg);
    if let Some(l) = listener {
        l(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_code() {
        assert_eq!(size_code_of(128), 0);
        assert_eq!(size_code_of(256), 1);
        assert_eq!(size_code_of(512), 2);
        assert_eq!(size_code_of(1024), 3);
        assert_eq!(size_code_of(0x1800), 6);
        // odd sizes round up
        assert_eq!(size_code_of(300), 2);
        assert_eq!(size_code_of(0), 0);
    }

    #[test]
    fn test_gzip_detection() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"track data").unwrap();
        let packed = enc.finish().unwrap();
        assert!(is_gzip(&packed));
        assert_eq!(decompress_if_gzip(packed).unwrap(), b"track data");
        assert_eq!(decompress_if_gzip(b"plain".to_vec()).unwrap(), b"plain");
    }

    #[test]
    fn test_format_text() {
        assert_eq!(format_text(&FMT_780K), "780K (2x80x5x1024)");
        assert_eq!(format_text(&FMT_720K), "720K (2x80x9x512)");
    }
}
