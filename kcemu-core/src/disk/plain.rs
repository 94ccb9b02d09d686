//! Headerless disk images: sectors stored back to back in
//! cylinder/head/sector order, sector numbers starting at 1.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{
    fire_error, lock_file, read_maybe_gzip, release_file, size_code_of, DiskGeometry, DiskId,
    ErrorListener, FloppyDisk, FloppyDiskFormat, SectorId, SectorKey, SectorView, FMT_400K,
    FMT_624K, FMT_720K, FMT_780K,
};
use crate::error::{KcError, KcResult};

/// Plain image with an externally known geometry.
pub struct PlainDisk {
    id: DiskId,
    geom: DiskGeometry,
    file_name: Option<String>,
    remark: Option<String>,
    image: Vec<u8>,
    file: Option<File>,
    listener: Option<ErrorListener>,
}

impl PlainDisk {
    /// Guess a well-known format from the image size.
    pub fn format_for_size(len: usize) -> Option<FloppyDiskFormat> {
        [FMT_780K, FMT_720K, FMT_624K, FMT_400K]
            .into_iter()
            .find(|f| f.disk_size() == len)
    }

    pub fn new_file(path: &Path, format: FloppyDiskFormat) -> KcResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        lock_file(&file, path)?;
        file.set_len(0)?;
        let mut disk = Self::from_bytes(Vec::new(), format, Some(path.display().to_string()));
        disk.file = Some(file);
        Ok(disk)
    }

    pub fn open_file(path: &Path, format: FloppyDiskFormat) -> KcResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        lock_file(&file, path)?;
        let mut image = Vec::new();
        file.read_to_end(&mut image)?;
        let mut disk = Self::from_bytes(image, format, Some(path.display().to_string()));
        disk.file = Some(file);
        Ok(disk)
    }

    /// Read-only image; gzip content is decompressed.
    pub fn read_file(path: &Path, format: FloppyDiskFormat) -> KcResult<Self> {
        let image = read_maybe_gzip(path)?;
        Ok(Self::from_bytes(image, format, Some(path.display().to_string())))
    }

    pub fn from_bytes(image: Vec<u8>, format: FloppyDiskFormat, name: Option<String>) -> Self {
        Self {
            id: DiskId::next(),
            geom: format,
            file_name: name,
            remark: None,
            image,
            file: None,
            listener: None,
        }
    }

    pub fn set_remark(&mut self, remark: Option<String>) {
        self.remark = remark;
    }

    fn offset(&self, cyl: usize, head: usize, index: usize) -> Option<usize> {
        let g = &self.geom;
        if cyl >= g.cylinders || head >= g.sides || index >= g.sectors_per_cylinder {
            return None;
        }
        Some(((cyl * g.sides + head) * g.sectors_per_cylinder + index) * g.sector_size)
    }

    fn write_through(&mut self, pos: usize, data: &[u8]) -> KcResult<()> {
        let file = self.file.as_mut().ok_or(KcError::ReadOnly)?;
        file.seek(SeekFrom::Start(pos as u64))?;
        file.write_all(data)?;
        if self.image.len() < pos + data.len() {
            self.image.resize(pos + data.len(), 0);
        }
        self.image[pos..pos + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl FloppyDisk for PlainDisk {
    fn id(&self) -> DiskId {
        self.id
    }

    fn geometry(&self) -> DiskGeometry {
        self.geom
    }

    fn is_read_only(&self) -> bool {
        self.file.is_none()
    }

    fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    fn file_format_text(&self) -> &'static str {
        "plain disk image"
    }

    fn remark(&self) -> Option<String> {
        self.remark.clone()
    }

    fn sectors_of_cylinder(&self, cyl: usize, head: usize) -> usize {
        (0..self.geom.sectors_per_cylinder)
            .take_while(|i| {
                self.offset(cyl, head, *i)
                    .is_some_and(|p| p + self.geom.sector_size <= self.image.len())
            })
            .count()
    }

    fn sector_by_index(&self, cyl: usize, head: usize, index: usize) -> Option<SectorView<'_>> {
        let size = self.geom.sector_size;
        let pos = self.offset(cyl, head, index)?;
        let data = self.image.get(pos..pos + size)?;
        Some(SectorView {
            disk: self.id,
            cyl,
            head,
            index,
            id: SectorId::new(cyl as u8, head as u8, (index + 1) as u8, size_code_of(size)),
            deleted: false,
            error: false,
            data,
            file_portion_len: size,
        })
    }

    fn format_track(&mut self, cyl: usize, head: usize, ids: &[SectorId], data: &[u8]) -> bool {
        if self.file.is_none() || ids.is_empty() {
            return false;
        }
        let g = self.geom;
        let fits = cyl < g.cylinders
            && head < g.sides
            && data.len() == g.sector_size
            && ids.len() == g.sectors_per_cylinder
            && ids
                .iter()
                .all(|id| id.sector >= 1 && (id.sector as usize) <= g.sectors_per_cylinder);
        if !fits {
            fire_error(
                &self.listener,
                "Formatting failed: track layout does not match the plain image format",
            );
            return false;
        }
        let Some(start) = self.offset(cyl, head, 0) else {
            return false;
        };
        let track: Vec<u8> = data.repeat(ids.len());
        match self.write_through(start, &track) {
            Ok(()) => true,
            Err(e) => {
                fire_error(&self.listener, &format!("Formatting failed: {}", e));
                false
            }
        }
    }

    fn write_sector(&mut self, key: SectorKey, data: &[u8], deleted: bool) -> bool {
        if deleted || key.disk != self.id || self.file.is_none() {
            return false;
        }
        let Some(pos) = self.offset(key.cyl, key.head, key.index) else {
            return false;
        };
        if data.len() > self.geom.sector_size {
            fire_error(&self.listener, "Writing failed: sector too small");
            return false;
        }
        match self.write_through(pos, data) {
            Ok(()) => true,
            Err(e) => {
                let msg = format!(
                    "Writing cylinder {}, head {}, sector {} failed: {}",
                    key.cyl,
                    key.head,
                    key.index + 1,
                    e
                );
                fire_error(&self.listener, &msg);
                false
            }
        }
    }

    fn set_error_listener(&mut self, listener: Option<ErrorListener>) {
        self.listener = listener;
    }

    fn close(&mut self) {
        release_file(&mut self.file);
    }
}

impl Drop for PlainDisk {
    fn drop(&mut self) {
        self.close();
    }
}
