//! AnaDisk dumps: a flat sequence of sector records.
//!
//! Each record is an 8-byte header followed by the sector data:
//!
//! | offset | content                |
//! |--------|------------------------|
//! | 0      | physical cylinder      |
//! | 1      | physical head          |
//! | 2      | ID cylinder            |
//! | 3      | ID head                |
//! | 4      | ID sector number       |
//! | 5      | ID size code           |
//! | 6..8   | data length, LE        |

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::sector::TrackData;
use super::{
    fire_error, lock_file, read_maybe_gzip, release_file, DiskGeometry, DiskId, ErrorListener,
    FloppyDisk, SectorId, SectorKey, SectorView,
};
use crate::error::{KcError, KcResult};

const RECORD_HEADER: usize = 8;

/// Disk image in AnaDisk format.
pub struct AnaDisk {
    id: DiskId,
    geom: DiskGeometry,
    file_name: Option<String>,
    resource: bool,
    file: Option<File>,
    sides: [BTreeMap<usize, TrackData>; 2],
    listener: Option<ErrorListener>,
}

impl AnaDisk {
    pub fn new_file(path: &Path) -> KcResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        lock_file(&file, path)?;
        file.set_len(0)?;
        let mut disk = Self::empty(Some(path.display().to_string()));
        disk.file = Some(file);
        Ok(disk)
    }

    pub fn open_file(path: &Path) -> KcResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        lock_file(&file, path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let mut disk = Self::parse(&data, Some(path.display().to_string()), false)?;
        disk.file = Some(file);
        Ok(disk)
    }

    pub fn read_file(path: &Path) -> KcResult<Self> {
        let data = read_maybe_gzip(path)?;
        Self::parse(&data, Some(path.display().to_string()), false)
    }

    pub fn read_bytes(data: &[u8], name: Option<&str>, resource: bool) -> KcResult<Self> {
        Self::parse(data, name.map(str::to_string), resource)
    }

    /// Plausibility check used for content based format detection.
    pub fn is_anadisk(data: &[u8]) -> bool {
        if data.len() < RECORD_HEADER {
            return false;
        }
        let h = &data[..RECORD_HEADER];
        let len = u16::from_le_bytes([h[6], h[7]]) as usize;
        h[1] <= 1 && h[5] <= 6 && len > 0 && len <= 0x4000 && data.len() >= RECORD_HEADER + len
    }

    fn empty(file_name: Option<String>) -> Self {
        Self {
            id: DiskId::next(),
            geom: DiskGeometry::default(),
            file_name,
            resource: false,
            file: None,
            sides: [BTreeMap::new(), BTreeMap::new()],
            listener: None,
        }
    }

    fn parse(data: &[u8], file_name: Option<String>, resource: bool) -> KcResult<Self> {
        let mut disk = Self::empty(file_name);
        disk.resource = resource;
        let mut pos = 0;
        while pos + RECORD_HEADER <= data.len() {
            let h = &data[pos..pos + RECORD_HEADER];
            let phys_cyl = h[0] as usize;
            let phys_head = h[1] as usize;
            let len = u16::from_le_bytes([h[6], h[7]]) as usize;
            let data_pos = pos + RECORD_HEADER;
            if phys_head > 1 || data_pos + len > data.len() {
                log::debug!("AnaDisk record at {:#x} unusable, rest ignored", pos);
                break;
            }
            let id = SectorId::new(h[2], h[3], h[4], h[5]);
            let track = disk.sides[phys_head]
                .entry(phys_cyl)
                .or_insert_with(|| TrackData::new(pos as u64, 0, Vec::new()));
            let buf_pos = track.buf.len();
            track.buf.extend_from_slice(&data[data_pos..data_pos + len]);
            track.file_len += RECORD_HEADER + len;
            track.push(id, buf_pos, len, Some(data_pos as u64), len);
            pos = data_pos + len;
        }
        if disk.sides.iter().all(BTreeMap::is_empty) {
            return Err(KcError::Format("not an AnaDisk image".to_string()));
        }
        disk.update_geometry();
        Ok(disk)
    }

    fn update_geometry(&mut self) {
        let mut geom = DiskGeometry::default();
        for (head, map) in self.sides.iter().enumerate() {
            for (cyl, track) in map {
                geom.sides = geom.sides.max(head + 1);
                geom.cylinders = geom.cylinders.max(cyl + 1);
                geom.sectors_per_cylinder = geom.sectors_per_cylinder.max(track.sectors.len());
                for s in &track.sectors {
                    geom.sector_size = geom.sector_size.max(s.data_len);
                }
            }
        }
        self.geom = geom;
    }

    /// Tracks in file order: cylinder first, then head.
    fn ordered_tracks(&self) -> Vec<(usize, usize)> {
        let mut keys: Vec<(usize, usize)> = self
            .sides
            .iter()
            .enumerate()
            .flat_map(|(head, map)| map.keys().map(move |cyl| (*cyl, head)))
            .collect();
        keys.sort_unstable();
        keys
    }

    fn track_record_bytes(cyl: usize, head: usize, track: &TrackData) -> Vec<u8> {
        let mut out = Vec::with_capacity(track.file_len);
        for s in &track.sectors {
            let len = (s.data_len as u16).to_le_bytes();
            out.extend_from_slice(&[cyl as u8, head as u8, s.id.cyl, s.id.head, s.id.sector, s.id.size_code, len[0], len[1]]);
            out.extend_from_slice(&track.buf[s.range()]);
        }
        out
    }

    /// Rewrite the whole file and refresh all file positions.
    fn rewrite(&mut self) -> std::io::Result<()> {
        let mut out = Vec::new();
        for (cyl, head) in self.ordered_tracks() {
            if let Some(track) = self.sides[head].get_mut(&cyl) {
                track.file_pos = out.len() as u64;
                let mut p = track.file_pos;
                for s in track.sectors.iter_mut() {
                    p += RECORD_HEADER as u64;
                    s.file_pos = Some(p);
                    p += s.data_len as u64;
                }
                out.extend_from_slice(&Self::track_record_bytes(cyl, head, track));
            }
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&out)?;
        file.flush()
    }

    fn do_format(&mut self, cyl: usize, head: usize, ids: &[SectorId], data: &[u8]) -> std::io::Result<()> {
        if cyl > 0xFF || data.len() > 0xFFFF {
            return Err(std::io::Error::other("track geometry not representable"));
        }
        let mut buf = Vec::with_capacity(ids.len() * data.len());
        let mut track = TrackData::new(0, ids.len() * (RECORD_HEADER + data.len()), Vec::new());
        for _ in ids {
            buf.extend_from_slice(data);
        }
        track.buf = buf;
        for (i, id) in ids.iter().enumerate() {
            track.push(*id, i * data.len(), data.len(), None, data.len());
        }
        let appends = self
            .ordered_tracks()
            .last()
            .is_none_or(|last| *last < (cyl, head));
        let end = self
            .file
            .as_mut()
            .map(|f| f.seek(SeekFrom::End(0)))
            .transpose()?
            .unwrap_or(0);
        self.sides[head].insert(cyl, track);
        if appends {
            let Some(track) = self.sides[head].get_mut(&cyl) else {
                return Ok(());
            };
            track.file_pos = end;
            let mut p = end;
            for s in track.sectors.iter_mut() {
                p += RECORD_HEADER as u64;
                s.file_pos = Some(p);
                p += s.data_len as u64;
            }
            let bytes = Self::track_record_bytes(cyl, head, track);
            if let Some(file) = self.file.as_mut() {
                file.write_all(&bytes)?;
                file.flush()?;
            }
        } else {
            self.rewrite()?;
        }
        self.update_geometry();
        Ok(())
    }
}

impl FloppyDisk for AnaDisk {
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
        "AnaDisk image"
    }

    fn remark(&self) -> Option<String> {
        self.resource.then(|| "bundled disk".to_string())
    }

    fn sectors_of_cylinder(&self, cyl: usize, head: usize) -> usize {
        self.sides[head & 1].get(&cyl).map_or(0, |t| t.sectors.len())
    }

    fn sector_by_index(&self, cyl: usize, head: usize, index: usize) -> Option<SectorView<'_>> {
        self.sides[head & 1].get(&cyl)?.view(self.id, cyl, head & 1, index)
    }

    fn format_track(&mut self, cyl: usize, head: usize, ids: &[SectorId], data: &[u8]) -> bool {
        if self.file.is_none() || ids.is_empty() {
            return false;
        }
        match self.do_format(cyl, head & 1, ids, data) {
            Ok(()) => true,
            Err(e) => {
                fire_error(&self.listener, &format!("Formatting failed: {}", e));
                false
            }
        }
    }

    fn write_sector(&mut self, key: SectorKey, data: &[u8], deleted: bool) -> bool {
        if deleted || key.disk != self.id {
            return false;
        }
        let Some(file) = self.file.as_mut() else {
            return false;
        };
        let Some(track) = self.sides[key.head & 1].get_mut(&key.cyl) else {
            return false;
        };
        let Some(slot) = track.sectors.get_mut(key.index) else {
            return false;
        };
        let Some(file_pos) = slot.file_pos else {
            return false;
        };
        let sector_num = slot.id.sector;
        let result = if data.len() > slot.file_portion_len {
            Err(std::io::Error::other("sector space in image file too small"))
        } else {
            file.seek(SeekFrom::Start(file_pos))
                .and_then(|_| file.write_all(data))
        };
        match result {
            Ok(()) => {
                // keep the record length; a short write leaves the tail as it was
                let mut full = track.buf[slot.data_pos..slot.data_pos + slot.data_len].to_vec();
                full[..data.len()].copy_from_slice(data);
                track.store(key.index, &full, false)
            }
            Err(e) => {
                slot.error = true;
                let msg = format!(
                    "Writing cylinder {}, head {}, sector {} failed: {}",
                    key.cyl, key.head, sector_num, e
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

impl Drop for AnaDisk {
    fn drop(&mut self) {
        self.close();
    }
}

/// Serialize any disk as an AnaDisk dump.
pub fn export_bytes(disk: &dyn FloppyDisk) -> KcResult<Vec<u8>> {
    let geom = disk.geometry();
    let mut out = Vec::new();
    for cyl in 0..geom.cylinders {
        for head in 0..geom.sides {
            for i in 0..disk.sectors_of_cylinder(cyl, head) {
                let Some(s) = disk.sector_by_index(cyl, head, i) else {
                    continue;
                };
                if s.deleted {
                    return Err(KcError::sector(cyl, head, s.sector_num(), "deleted sectors cannot be stored in AnaDisk images"));
                }
                let len = (s.data_len() as u16).to_le_bytes();
                out.extend_from_slice(&[cyl as u8, head as u8, s.id.cyl, s.id.head, s.id.sector, s.id.size_code, len[0], len[1]]);
                out.extend_from_slice(s.data);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pc: u8, ph: u8, r: u8, data: &[u8]) -> Vec<u8> {
        let len = (data.len() as u16).to_le_bytes();
        let mut v = vec![pc, ph, pc, ph, r, 1, len[0], len[1]];
        v.extend_from_slice(data);
        v
    }

    #[test]
    fn test_parse_records() {
        let mut img = Vec::new();
        img.extend(record(0, 0, 1, &[1; 256]));
        img.extend(record(0, 0, 2, &[2; 256]));
        img.extend(record(0, 1, 1, &[3; 256]));
        img.extend(record(1, 0, 1, &[4; 256]));
        assert!(AnaDisk::is_anadisk(&img));
        let disk = AnaDisk::read_bytes(&img, Some("t.dump"), false).unwrap();
        assert_eq!(disk.geometry(), DiskGeometry::new(2, 2, 2, 256));
        assert_eq!(disk.read_sector(0, 0, 2).unwrap().data[0], 2);
        assert_eq!(disk.read_sector(0, 1, 1).unwrap().data[0], 3);
        assert_eq!(disk.sectors_of_cylinder(1, 1), 0);
    }

    #[test]
    fn test_truncated_record_ignored() {
        let mut img = record(0, 0, 1, &[1; 128]);
        img.extend_from_slice(&[0, 0, 0, 0, 2, 0, 0x80, 0x00, 1, 2, 3]);
        let disk = AnaDisk::read_bytes(&img, None, false).unwrap();
        assert_eq!(disk.sectors_of_cylinder(0, 0), 1);
    }

    #[test]
    fn test_format_append_and_rewrite() {
        let path = std::env::temp_dir().join(format!("kcemu-ana-{}.dump", std::process::id()));
        {
            let mut disk = AnaDisk::new_file(&path).unwrap();
            let ids0: Vec<_> = (1..=3).map(|r| SectorId::new(0, 0, r, 1)).collect();
            let ids1: Vec<_> = (1..=3).map(|r| SectorId::new(1, 0, r, 1)).collect();
            assert!(disk.format_track(0, 0, &ids0, &[0xE5; 256]));
            assert!(disk.format_track(1, 0, &ids1, &[0xE5; 256]));
            let key = disk.read_sector(1, 0, 2).unwrap().key();
            assert!(disk.write_sector(key, &[7; 256], false));
            // shrink track 0: everything behind it moves
            assert!(disk.format_track(0, 0, &ids0[..2], &[0x11; 256]));
            let key = disk.read_sector(1, 0, 3).unwrap().key();
            assert!(disk.write_sector(key, &[9; 100], false));
        }
        let disk = AnaDisk::open_file(&path).unwrap();
        assert_eq!(disk.sectors_of_cylinder(0, 0), 2);
        assert_eq!(disk.read_sector(0, 0, 1).unwrap().data[0], 0x11);
        assert_eq!(disk.read_sector(1, 0, 2).unwrap().data[0], 7);
        let s3 = disk.read_sector(1, 0, 3).unwrap();
        assert_eq!(s3.data_len(), 256);
        assert_eq!(s3.data[99], 9);
        assert_eq!(s3.data[100], 0xE5);
        drop(disk);
        let _ = std::fs::remove_file(&path);
    }
}
