//! CPC disk images (`.dsk`), standard and extended format.
//!
//! Layout: a 256-byte disk info block followed by the tracks, each with a
//! 256-byte track info block and the sector payloads in ID table order.
//! Standard images use one track size for all tracks, extended images
//! store `size >> 8` per track in the disk info block.
//!
//! Formatting a track whose size no longer matches its old slot drops all
//! following tracks and, for standard images, converts the file to the
//! extended format.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::sector::TrackData;
use super::{
    fire_error, lock_file, read_maybe_gzip, release_file, size_code_of, DiskGeometry, DiskId,
    ErrorListener, FloppyDisk, SectorId, SectorKey, SectorView,
};
use crate::error::{KcError, KcResult};

pub const FILE_HEADER_STD: &[u8] = b"MV - CPCEMU Disk-File\r\nDisk-Info\r\n";
pub const FILE_HEADER_EXT: &[u8] = b"EXTENDED CPC DSK File\r\nDisk-Info\r\n";
pub const TRACK_HEADER: &[u8] = b"Track-Info\r\n";
pub const MAX_SECTORS_PER_TRACK: usize = 29;

const CREATOR: &[u8] = b"JKCEMU";
const HEADER_SIZE: usize = 0x100;
const MAX_TRACK_TABLE: usize = 204;
const GAP3_LEN: u8 = 0x4E;
const FILLER: u8 = 0xE5;
const MAX_STD_SECTOR_SIZE: usize = 6144;

/// Whether `header` starts with one of the two CPC magic strings.
pub fn is_cpc_disk_header(header: &[u8]) -> bool {
    header.starts_with(FILE_HEADER_STD) || header.starts_with(FILE_HEADER_EXT)
}

/// Disk image in CPC format.
pub struct CpcDisk {
    id: DiskId,
    geom: DiskGeometry,
    file_name: Option<String>,
    resource: bool,
    extended: bool,
    /// Track size of a standard image, header included.
    track_size: usize,
    file: Option<File>,
    sides: [BTreeMap<usize, TrackData>; 2],
    listener: Option<ErrorListener>,
}

impl CpcDisk {
    /// Create (or truncate) an image file for formatting.
    pub fn new_file(path: &Path) -> KcResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        lock_file(&file, path)?;
        file.set_len(0)?;
        Ok(Self::empty(Some(path.display().to_string()), Some(file)))
    }

    /// Open an existing image for reading and writing.
    pub fn open_file(path: &Path) -> KcResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        lock_file(&file, path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let mut disk = Self::parse(&data, Some(path.display().to_string()), false)?;
        disk.file = Some(file);
        Ok(disk)
    }

    /// Load a read-only snapshot, gzip content is decompressed.
    pub fn read_file(path: &Path) -> KcResult<Self> {
        let data = read_maybe_gzip(path)?;
        Self::parse(&data, Some(path.display().to_string()), false)
    }

    /// Read-only image from memory, e.g. a bundled resource.
    pub fn read_bytes(data: &[u8], name: Option<&str>, resource: bool) -> KcResult<Self> {
        Self::parse(data, name.map(str::to_string), resource)
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Byte position and on-disk length of a track.
    pub fn track_placement(&self, cyl: usize, head: usize) -> Option<(u64, usize)> {
        self.track(cyl, head).map(|t| (t.file_pos, t.file_len))
    }

    fn empty(file_name: Option<String>, file: Option<File>) -> Self {
        Self {
            id: DiskId::next(),
            geom: DiskGeometry::default(),
            file_name,
            resource: false,
            extended: false,
            track_size: 0,
            file,
            sides: [BTreeMap::new(), BTreeMap::new()],
            listener: None,
        }
    }

    fn parse(data: &[u8], file_name: Option<String>, resource: bool) -> KcResult<Self> {
        let not_cpc = || KcError::Format("not a CPC disk image".to_string());
        if data.len() < HEADER_SIZE {
            return Err(not_cpc());
        }
        let header = &data[..HEADER_SIZE];
        let extended = header.starts_with(FILE_HEADER_EXT);
        if !extended && !header.starts_with(FILE_HEADER_STD) {
            return Err(not_cpc());
        }
        let cyls = header[0x30] as usize;
        let n_sides = header[0x31] as usize;
        let disk_track_size = if extended {
            0
        } else {
            u16::from_le_bytes([header[0x32], header[0x33]]) as usize
        };
        if cyls == 0 || n_sides == 0 {
            return Err(not_cpc());
        }

        let mut disk = Self::empty(file_name, None);
        disk.resource = resource;
        disk.extended = extended;
        disk.track_size = disk_track_size;

        let mut pos = HEADER_SIZE;
        let mut any_track = false;
        for i in 0..cyls * n_sides {
            let track_pos = pos;
            let Some(th) = data.get(pos..pos + HEADER_SIZE) else {
                log::debug!("CPC image ends before track {}", i);
                break;
            };
            if !th.starts_with(TRACK_HEADER) {
                log::debug!("CPC track {} has no track info block", i);
                break;
            }
            pos += HEADER_SIZE;

            let track_size = if extended {
                if i < MAX_TRACK_TABLE {
                    (header[0x34 + i] as usize) << 8
                } else {
                    0
                }
            } else {
                disk_track_size
            };
            let cyl = th[0x10] as usize;
            let side = th[0x11] as usize;
            let size_code = th[0x14];
            if size_code > 6 {
                log::warn!("CPC track {}: sector size code {} not supported", i, size_code);
                break;
            }
            let mut sector_size = if !extended && size_code == 6 {
                0x1800
            } else {
                128usize << size_code
            };
            disk.geom.sector_size = disk.geom.sector_size.max(sector_size);
            let n_sectors = th[0x15] as usize;
            if n_sectors > MAX_SECTORS_PER_TRACK {
                log::warn!("CPC track {}: {} sectors not supported", i, n_sectors);
                break;
            }

            let sector_base = pos;
            let mut buf = None;
            if track_size > HEADER_SIZE {
                let len = track_size - HEADER_SIZE;
                let avail = data.len().saturating_sub(pos).min(len);
                let mut b = vec![0u8; len];
                b[..avail].copy_from_slice(&data[pos..pos + avail]);
                buf = Some(b);
                pos += len;
            }

            if n_sectors == 0 {
                continue;
            }
            disk.geom.sectors_per_cylinder = disk.geom.sectors_per_cylinder.max(n_sectors);
            let Some(buf) = buf else {
                continue;
            };
            if side > 1 {
                log::debug!("CPC track {}: head {} ignored", i, side);
                continue;
            }
            if disk.sides[side].contains_key(&cyl) {
                log::debug!("CPC track {}: cylinder {} head {} repeated", i, cyl, side);
                continue;
            }

            let mut track = TrackData::new(track_pos as u64, track_size, buf);
            let mut data_pos = 0;
            for k in 0..n_sectors {
                let e = &th[0x18 + k * 8..0x20 + k * 8];
                let id = SectorId::new(e[0], e[1], e[2], e[3]);
                if extended {
                    sector_size = u16::from_le_bytes([e[6], e[7]]) as usize;
                }
                track.push(
                    id,
                    data_pos,
                    sector_size,
                    Some((sector_base + data_pos) as u64),
                    sector_size,
                );
                data_pos += sector_size;
            }
            disk.sides[side].insert(cyl, track);
            any_track = true;
        }
        if !any_track {
            return Err(not_cpc());
        }
        disk.geom.sides = n_sides;
        disk.geom.cylinders = cyls;
        Ok(disk)
    }

    fn track(&self, cyl: usize, head: usize) -> Option<&TrackData> {
        self.sides[head & 1].get(&cyl)
    }

    fn do_format(&mut self, cyl: usize, head: usize, ids: &[SectorId], data: &[u8]) -> KcResult<()> {
        if head == 1 && self.geom.sides < 2 && self.geom.cylinders > 1 {
            return Err(KcError::Format(
                "formatting the second side afterwards is not supported".to_string(),
            ));
        }
        if ids.len() > MAX_SECTORS_PER_TRACK {
            return Err(KcError::Format(format!("{} sectors per track not supported", ids.len())));
        }
        if cyl > 0xFF {
            return Err(KcError::Format(format!("cylinder {} not supported", cyl)));
        }
        let track_size = (0x1FF + ids.len() * data.len()) & !0xFF;
        if track_size > 0xFF00 {
            return Err(KcError::Format("track too large".to_string()));
        }
        let Some(file) = self.file.as_mut() else {
            return Err(KcError::ReadOnly);
        };

        if self.geom.cylinders == 0 {
            self.geom = DiskGeometry::default();
            self.extended = false;
            self.track_size = track_size;
            self.sides[0].clear();
            self.sides[1].clear();
            file.set_len(0)?;
            write_at(file, 0, &disk_header(false, 0, 0, track_size, &[]))?;
        }

        let (mut track_pos, old_size) = self
            .track(cyl, head)
            .map(|t| (t.file_pos, t.file_len))
            .unwrap_or((0, 0));
        if track_pos < HEADER_SIZE as u64 || track_size != old_size {
            let first_side0 = if head == 0 { cyl } else { cyl + 1 };
            self.sides[0].retain(|c, _| *c < first_side0);
            self.sides[1].retain(|c, _| *c < cyl);

            if self.extended {
                let mut p = HEADER_SIZE;
                p += self.sides[0]
                    .range(..first_side0)
                    .map(|(_, t)| t.file_len)
                    .sum::<usize>();
                if self.geom.sides > 1 {
                    p += self.sides[1].range(..cyl).map(|(_, t)| t.file_len).sum::<usize>();
                }
                track_pos = p as u64;
            } else {
                let sides = self.geom.sides;
                track_pos = (HEADER_SIZE + (cyl * sides + head) * self.track_size) as u64;
                if track_size != self.track_size || data.len() > MAX_STD_SECTOR_SIZE {
                    let table = self.track_size_table();
                    let file = self.file.as_mut().ok_or(KcError::ReadOnly)?;
                    write_at(
                        file,
                        0,
                        &disk_header(true, self.geom.cylinders, self.geom.sides, 0, &table),
                    )?;
                    self.extended = true;
                    self.track_size = 0;
                    log::debug!("CPC image converted to extended format at cylinder {}", cyl);
                }
            }
        }

        let size_code = size_code_of(data.len());
        let mut th = Vec::with_capacity(HEADER_SIZE);
        th.extend_from_slice(TRACK_HEADER);
        th.resize(0x10, 0);
        th.extend_from_slice(&[cyl as u8, head as u8, 0, 0, size_code, ids.len() as u8, GAP3_LEN, FILLER]);
        for id in ids {
            let len = (data.len() as u16).to_le_bytes();
            th.extend_from_slice(&[id.cyl, id.head, id.sector, id.size_code, 0, 0, len[0], len[1]]);
        }
        th.resize(HEADER_SIZE, 0);

        let mut buf = Vec::with_capacity(track_size - HEADER_SIZE);
        for _ in ids {
            buf.extend_from_slice(data);
        }
        buf.resize(track_size - HEADER_SIZE, 0);

        let file = self.file.as_mut().ok_or(KcError::ReadOnly)?;
        write_at(file, track_pos, &th)?;
        file.write_all(&buf)?;

        let mut track = TrackData::new(track_pos, track_size, buf);
        let sector_base = track_pos + HEADER_SIZE as u64;
        for (i, id) in ids.iter().enumerate() {
            let data_pos = i * data.len();
            track.push(*id, data_pos, data.len(), Some(sector_base + data_pos as u64), data.len());
        }
        self.sides[head].insert(cyl, track);

        if cyl >= self.geom.cylinders {
            self.geom.cylinders = cyl + 1;
            write_at(file, 0x30, &[self.geom.cylinders as u8])?;
        }
        let sides = if head == 1 { 2 } else { 1 };
        if sides > self.geom.sides {
            self.geom.sides = sides;
            write_at(file, 0x31, &[sides as u8])?;
        }
        self.geom.sectors_per_cylinder = self.geom.sectors_per_cylinder.max(ids.len());
        if self.geom.sector_size == 0 {
            self.geom.sector_size = data.len();
        }
        if self.extended {
            let idx = cyl * self.geom.sides + head;
            if idx < MAX_TRACK_TABLE {
                write_at(file, (0x34 + idx) as u64, &[(track_size >> 8) as u8])?;
            }
        }
        file.flush()?;
        Ok(())
    }

    /// Size table for the extended header from the tracks still present.
    fn track_size_table(&self) -> Vec<u8> {
        let sides = self.geom.sides.max(1);
        let mut table = vec![0u8; (self.geom.cylinders * sides).min(MAX_TRACK_TABLE)];
        for (head, map) in self.sides.iter().enumerate() {
            for (cyl, track) in map {
                let idx = cyl * sides + head;
                if let Some(slot) = table.get_mut(idx) {
                    *slot = (track.file_len >> 8) as u8;
                }
            }
        }
        table
    }
}

impl FloppyDisk for CpcDisk {
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
        if self.extended {
            "CPC disk image (extended)"
        } else {
            "CPC disk image"
        }
    }

    fn remark(&self) -> Option<String> {
        self.resource.then(|| "bundled disk".to_string())
    }

    fn sectors_of_cylinder(&self, cyl: usize, head: usize) -> usize {
        self.track(cyl, head).map_or(0, |t| t.sectors.len())
    }

    fn sector_by_index(&self, cyl: usize, head: usize, index: usize) -> Option<SectorView<'_>> {
        self.track(cyl, head)?.view(self.id, cyl, head & 1, index)
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
        let result = if data.len() > slot.file_portion_len || data.len() > slot.room {
            Err(std::io::Error::other("sector space in image file too small"))
        } else {
            write_at(file, file_pos, data)
        };
        match result {
            Ok(()) => track.store(key.index, data, false),
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

impl Drop for CpcDisk {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_at(file: &mut File, pos: u64, bytes: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(pos))?;
    file.write_all(bytes)
}

fn disk_header(extended: bool, cyls: usize, sides: usize, track_size: usize, table: &[u8]) -> Vec<u8> {
    let mut h = Vec::with_capacity(HEADER_SIZE);
    h.extend_from_slice(if extended { FILE_HEADER_EXT } else { FILE_HEADER_STD });
    h.extend_from_slice(CREATOR);
    h.resize(0x30, 0);
    h.push(cyls as u8);
    h.push(sides as u8);
    h.extend_from_slice(&(track_size as u16).to_le_bytes());
    h.extend_from_slice(&table[..table.len().min(MAX_TRACK_TABLE)]);
    h.resize(HEADER_SIZE, 0);
    h
}

/// Serialize any disk as a standard-format CPC image.
pub fn export_bytes(disk: &dyn FloppyDisk) -> KcResult<Vec<u8>> {
    let geom = disk.geometry();
    if geom.cylinders > 255 {
        return Err(KcError::Export(format!("{} cylinders not supported", geom.cylinders)));
    }
    if geom.sides > 2 {
        return Err(KcError::Export(format!("{} sides not supported", geom.sides)));
    }
    if geom.sectors_per_cylinder > 255 {
        return Err(KcError::Export(format!(
            "{} sectors per cylinder not supported",
            geom.sectors_per_cylinder
        )));
    }
    let sector_size = geom.sector_size;
    let size_code = size_code_of(sector_size);
    let track_size = HEADER_SIZE + geom.sectors_per_cylinder * sector_size;
    if track_size > 0xFFFF {
        return Err(KcError::Export(format!("track size {} not supported", track_size)));
    }

    let mut out = disk_header(false, geom.cylinders, geom.sides, track_size, &[]);
    for cyl in 0..geom.cylinders {
        for head in 0..geom.sides {
            let n = disk.sectors_of_cylinder(cyl, head);
            if n > MAX_SECTORS_PER_TRACK || n > geom.sectors_per_cylinder {
                return Err(KcError::Export(format!(
                    "cylinder {}, head {}: {} sectors not supported",
                    cyl, head, n
                )));
            }
            let mut th = Vec::with_capacity(HEADER_SIZE);
            th.extend_from_slice(TRACK_HEADER);
            th.resize(0x10, 0);
            th.extend_from_slice(&[cyl as u8, head as u8, 0, 0, size_code, n as u8, GAP3_LEN, FILLER]);
            let mut payload = Vec::with_capacity(n * sector_size);
            for i in 0..n {
                let sector = disk
                    .sector_by_index(cyl, head, i)
                    .ok_or_else(|| KcError::sector(cyl, head, (i + 1) as u8, "sector not found"))?;
                if sector.deleted {
                    return Err(KcError::sector(
                        cyl,
                        head,
                        sector.sector_num(),
                        "deleted sectors cannot be stored in CPC images",
                    ));
                }
                if sector.data_len() > sector_size {
                    return Err(KcError::sector(cyl, head, sector.sector_num(), "sector too large"));
                }
                th.extend_from_slice(&[cyl as u8, head as u8, sector.sector_num(), size_code, 0, 0, 0, 0]);
                payload.extend_from_slice(sector.data);
                payload.resize((i + 1) * sector_size, 0);
            }
            th.resize(HEADER_SIZE, 0);
            out.extend_from_slice(&th);
            out.extend_from_slice(&payload);
            out.resize(out.len() + (track_size - HEADER_SIZE).saturating_sub(payload.len()), 0);
        }
    }
    Ok(out)
}

/// Write a standard-format CPC image. Nothing is left behind on failure.
pub fn export(disk: &dyn FloppyDisk, path: &Path) -> KcResult<()> {
    let data = export_bytes(disk)?;
    if let Err(e) = std::fs::write(path, &data) {
        let _ = std::fs::remove_file(path);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("kcemu-cpc-{}-{}", std::process::id(), name))
    }

    /// Standard image whose sector bytes encode their position.
    fn std_image(sides: usize, cyls: usize, spc: usize, size: usize) -> Vec<u8> {
        let track_size = 0x100 + spc * size;
        let mut out = disk_header(false, cyls, sides, track_size, &[]);
        for cyl in 0..cyls {
            for head in 0..sides {
                let mut th = TRACK_HEADER.to_vec();
                th.resize(0x10, 0);
                th.extend_from_slice(&[cyl as u8, head as u8, 0, 0, size_code_of(size), spc as u8, 0x4E, 0xE5]);
                for s in 0..spc {
                    th.extend_from_slice(&[cyl as u8, head as u8, (s + 1) as u8, size_code_of(size), 0, 0, 0, 0]);
                }
                th.resize(0x100, 0);
                out.extend_from_slice(&th);
                for s in 0..spc {
                    for b in 0..size {
                        out.push((cyl * 7 + head * 3 + s + b) as u8);
                    }
                }
            }
        }
        out
    }

    fn track_header_offset(track: usize, track_size: usize) -> usize {
        0x100 + track * track_size
    }

    #[test]
    fn test_load_standard_2x40x5x1024() {
        let data = std_image(2, 40, 5, 1024);
        assert_eq!(data.len(), 0x100 + 40 * 2 * (0x100 + 5 * 1024));
        let disk = CpcDisk::read_bytes(&data, None, false).unwrap();
        let geom = disk.geometry();
        assert_eq!(geom, DiskGeometry::new(2, 40, 5, 1024));
        assert_eq!(disk.sectors_of_cylinder(0, 0), 5);
        let first = disk.sector_by_index(0, 0, 0).unwrap();
        assert_eq!(&first.data[..4], &[0, 1, 2, 3]);
        assert_eq!(first.disk, disk.id());
        let side1 = disk.read_sector(3, 1, 2).unwrap();
        assert_eq!(side1.data[0], (3 * 7 + 3 + 1) as u8);
        assert!(disk.is_read_only());
    }

    #[test]
    fn test_load_is_repeatable() {
        let data = std_image(1, 3, 9, 512);
        let a = CpcDisk::read_bytes(&data, None, false).unwrap();
        let b = CpcDisk::read_bytes(&data, None, false).unwrap();
        assert_eq!(a.geometry(), b.geometry());
        for cyl in 0..3 {
            for i in 0..9 {
                assert_eq!(
                    a.sector_by_index(cyl, 0, i).unwrap().data,
                    b.sector_by_index(cyl, 0, i).unwrap().data
                );
            }
        }
    }

    #[test]
    fn test_too_many_sectors_stops_loading() {
        let mut data = std_image(1, 4, 5, 256);
        let ts = 0x100 + 5 * 256;
        data[track_header_offset(2, ts) + 0x15] = 30;
        let disk = CpcDisk::read_bytes(&data, None, false).unwrap();
        assert_eq!(disk.sectors_of_cylinder(0, 0), 5);
        assert_eq!(disk.sectors_of_cylinder(1, 0), 5);
        assert_eq!(disk.sectors_of_cylinder(2, 0), 0);
        assert_eq!(disk.sectors_of_cylinder(3, 0), 0);
    }

    #[test]
    fn test_size_code_seven_stops_loading() {
        let mut data = std_image(1, 3, 2, 256);
        let ts = 0x100 + 2 * 256;
        data[track_header_offset(1, ts) + 0x14] = 7;
        let disk = CpcDisk::read_bytes(&data, None, false).unwrap();
        assert_eq!(disk.sectors_of_cylinder(0, 0), 2);
        assert_eq!(disk.sectors_of_cylinder(1, 0), 0);

        // first track already broken: nothing usable
        data[track_header_offset(0, ts) + 0x14] = 7;
        assert!(CpcDisk::read_bytes(&data, None, false).is_err());
    }

    #[test]
    fn test_size_code_six_standard_is_0x1800() {
        let mut out = disk_header(false, 1, 1, 0x100 + 0x1800, &[]);
        let mut th = TRACK_HEADER.to_vec();
        th.resize(0x10, 0);
        th.extend_from_slice(&[0, 0, 0, 0, 6, 1, 0x4E, 0xE5, 0, 0, 1, 6, 0, 0, 0, 0]);
        th.resize(0x100, 0);
        out.extend_from_slice(&th);
        out.resize(out.len() + 0x1800, 0xAA);
        let disk = CpcDisk::read_bytes(&out, None, false).unwrap();
        assert_eq!(disk.sector_size(), 0x1800);
        assert_eq!(disk.sector_by_index(0, 0, 0).unwrap().data_len(), 0x1800);
    }

    #[test]
    fn test_truncated_image_keeps_loaded_tracks() {
        let data = std_image(1, 4, 2, 256);
        let ts = 0x100 + 2 * 256;
        let cut = &data[..track_header_offset(2, ts) + 20];
        let disk = CpcDisk::read_bytes(cut, None, false).unwrap();
        assert_eq!(disk.sectors_of_cylinder(1, 0), 2);
        assert_eq!(disk.sectors_of_cylinder(2, 0), 0);
    }

    #[test]
    fn test_extended_sector_size_from_id_table() {
        let mut table = vec![0u8; 1];
        table[0] = 0x03; // 0x300 bytes
        let mut out = disk_header(true, 1, 1, 0, &table);
        let mut th = TRACK_HEADER.to_vec();
        th.resize(0x10, 0);
        th.extend_from_slice(&[0, 0, 0, 0, 2, 2, 0x4E, 0xE5]);
        th.extend_from_slice(&[0, 0, 1, 2, 0, 0, 0x2C, 0x01]); // 300 bytes
        th.extend_from_slice(&[0, 0, 2, 2, 0, 0, 0x00, 0x01]); // 256 bytes
        th.resize(0x100, 0);
        out.extend_from_slice(&th);
        out.extend((0..0x200).map(|i| i as u8));
        let disk = CpcDisk::read_bytes(&out, None, false).unwrap();
        assert!(disk.is_extended());
        let s1 = disk.sector_by_index(0, 0, 0).unwrap();
        let s2 = disk.sector_by_index(0, 0, 1).unwrap();
        assert_eq!(s1.data_len(), 300);
        assert_eq!(s2.data[0], 300u16 as u8);
        // second sector runs past the track payload and is clamped
        assert_eq!(s2.data_len(), 0x200 - 300);
    }

    #[test]
    fn test_not_a_cpc_image() {
        assert!(CpcDisk::read_bytes(b"hello", None, false).is_err());
        assert!(CpcDisk::read_bytes(&[0u8; 0x200], None, false).is_err());
    }

    fn ids(cyl: u8, head: u8, n: u8, code: u8) -> Vec<SectorId> {
        (1..=n).map(|r| SectorId::new(cyl, head, r, code)).collect()
    }

    #[test]
    fn test_format_grows_cylinders_and_keeps_data() {
        let path = temp_path("grow.dsk");
        {
            let mut disk = CpcDisk::new_file(&path).unwrap();
            for cyl in 0..5u8 {
                assert!(disk.format_track(cyl as usize, 0, &ids(cyl, 0, 5, 3), &[cyl; 1024]));
            }
            let key = disk.sector_by_index(2, 0, 1).unwrap().key();
            assert!(disk.write_sector(key, &[0x55; 1024], false));
            assert_eq!(disk.cylinders(), 5);

            assert!(disk.format_track(5, 0, &ids(5, 0, 5, 3), &[0xE5; 1024]));
            assert_eq!(disk.cylinders(), 6);
            assert!(!disk.is_extended());
            for cyl in 0..5 {
                let expected = if cyl == 2 { 0x55 } else { cyl as u8 };
                assert_eq!(disk.sector_by_index(cyl, 0, 1).unwrap().data[0], expected);
            }
            disk.close();
        }
        let disk = CpcDisk::open_file(&path).unwrap();
        assert_eq!(disk.geometry(), DiskGeometry::new(1, 6, 5, 1024));
        assert_eq!(disk.read_sector(2, 0, 2).unwrap().data[100], 0x55);
        assert_eq!(disk.read_sector(4, 0, 5).unwrap().data[0], 4);
        assert_eq!(disk.read_sector(5, 0, 1).unwrap().data[0], 0xE5);
        drop(disk);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_format_different_size_promotes_to_extended() {
        let path = temp_path("promote.dsk");
        {
            let mut disk = CpcDisk::new_file(&path).unwrap();
            assert!(disk.format_track(0, 0, &ids(0, 0, 9, 2), &[0x11; 512]));
            assert!(disk.format_track(1, 0, &ids(1, 0, 9, 2), &[0x22; 512]));
            assert!(disk.format_track(2, 0, &ids(2, 0, 5, 3), &[0x33; 1024]));
            assert!(disk.is_extended());
            let (pos, len) = disk.track_placement(2, 0).unwrap();
            assert_eq!(pos, (0x100 + 2 * (0x100 + 9 * 512)) as u64);
            assert_eq!(len, 0x100 + 5 * 1024);
        }
        let disk = CpcDisk::open_file(&path).unwrap();
        assert!(disk.is_extended());
        assert_eq!(disk.cylinders(), 3);
        assert_eq!(disk.read_sector(1, 0, 9).unwrap().data, &[0x22; 512][..]);
        assert_eq!(disk.read_sector(2, 0, 5).unwrap().data, &[0x33; 1024][..]);
        drop(disk);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_two_sided_format_layout() {
        let path = temp_path("twosided.dsk");
        {
            let mut disk = CpcDisk::new_file(&path).unwrap();
            for cyl in 0..3u8 {
                for head in 0..2u8 {
                    assert!(disk.format_track(
                        cyl as usize,
                        head as usize,
                        &ids(cyl, head, 4, 1),
                        &[cyl * 2 + head; 256]
                    ));
                }
            }
        }
        let disk = CpcDisk::open_file(&path).unwrap();
        assert_eq!(disk.geometry(), DiskGeometry::new(2, 3, 4, 256));
        assert_eq!(disk.read_sector(2, 1, 3).unwrap().data[0], 5);
        assert_eq!(disk.read_sector(1, 0, 1).unwrap().data[0], 2);
        drop(disk);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_write_sector_too_long_is_rejected() {
        let path = temp_path("toolong.dsk");
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let mut disk = CpcDisk::new_file(&path).unwrap();
            let sink = errors.clone();
            disk.set_error_listener(Some(Arc::new(move |msg: &str| {
                sink.lock().unwrap().push(msg.to_string());
            })));
            assert!(disk.format_track(0, 0, &ids(0, 0, 2, 1), &[0x77; 256]));
            let key = disk.sector_by_index(0, 0, 0).unwrap().key();
            assert!(!disk.write_sector(key, &[0x99; 257], false));
            assert!(disk.sector_by_index(0, 0, 0).unwrap().error);
            assert!(!disk.write_sector(key, &[0x99; 16], true));
        }
        assert_eq!(errors.lock().unwrap().len(), 1);
        let disk = CpcDisk::open_file(&path).unwrap();
        assert_eq!(disk.read_sector(0, 0, 1).unwrap().data, &[0x77; 256][..]);
        drop(disk);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_write_sector_of_other_disk_is_rejected() {
        let path = temp_path("foreign.dsk");
        let mut disk = CpcDisk::new_file(&path).unwrap();
        assert!(disk.format_track(0, 0, &ids(0, 0, 1, 1), &[0; 256]));
        let other = CpcDisk::read_bytes(&std_image(1, 1, 1, 256), None, false).unwrap();
        let foreign = other.sector_by_index(0, 0, 0).unwrap().key();
        assert!(!disk.write_sector(foreign, &[1; 256], false));
        drop(disk);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_second_side_afterwards_fails() {
        let path = temp_path("side2.dsk");
        let mut disk = CpcDisk::new_file(&path).unwrap();
        assert!(disk.format_track(0, 0, &ids(0, 0, 1, 1), &[0; 256]));
        assert!(disk.format_track(1, 0, &ids(1, 0, 1, 1), &[0; 256]));
        assert!(!disk.format_track(0, 1, &ids(0, 1, 1, 1), &[0; 256]));
        drop(disk);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_lock_blocks_second_open() {
        let path = temp_path("lock.dsk");
        std::fs::write(&path, std_image(1, 1, 1, 256)).unwrap();
        let mut first = CpcDisk::open_file(&path).unwrap();
        assert!(matches!(CpcDisk::open_file(&path), Err(KcError::Locked(_))));
        first.close();
        first.close();
        assert!(CpcDisk::open_file(&path).is_ok());
        let _ = std::fs::remove_file(&path);
    }

    fn assert_same_sectors(a: &dyn FloppyDisk, b: &dyn FloppyDisk) {
        assert_eq!(a.geometry(), b.geometry());
        let geom = a.geometry();
        for cyl in 0..geom.cylinders {
            for head in 0..geom.sides {
                let n = a.sectors_of_cylinder(cyl, head);
                assert_eq!(b.sectors_of_cylinder(cyl, head), n, "cyl {} head {}", cyl, head);
                for i in 0..n {
                    let (sa, sb) = (
                        a.sector_by_index(cyl, head, i).unwrap(),
                        b.sector_by_index(cyl, head, i).unwrap(),
                    );
                    assert_eq!(sa.id, sb.id);
                    assert_eq!(sa.data, sb.data);
                }
            }
        }
    }

    #[test]
    fn test_export_round_trip() {
        let src = CpcDisk::read_bytes(&std_image(2, 10, 9, 512), None, false).unwrap();
        let path = temp_path("export.dsk");
        export(&src, &path).unwrap();
        let back = CpcDisk::read_file(&path).unwrap();
        assert!(!back.is_extended());
        assert_same_sectors(&src, &back);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_export_round_trip_geometries() {
        for (sides, cyls, spc, size) in [
            (1, 4, 29, 128),
            (2, 3, 16, 256),
            (1, 80, 9, 512),
            (2, 40, 5, 1024),
        ] {
            let src = CpcDisk::read_bytes(&std_image(sides, cyls, spc, size), None, false).unwrap();
            let data = export_bytes(&src).unwrap();
            assert_eq!(data.len(), 0x100 + sides * cyls * (0x100 + spc * size));
            let back = CpcDisk::read_bytes(&data, None, false).unwrap();
            assert!(!back.is_extended());
            assert_same_sectors(&src, &back);
        }
    }

    #[test]
    fn test_export_uneven_tracks_pads_standard_layout() {
        let mut data = std_image(2, 3, 9, 512);
        let ts = 0x100 + 9 * 512;
        // cylinder 1 head 0 holds 4 sectors, cylinder 2 head 1 holds 7
        data[track_header_offset(2, ts) + 0x15] = 4;
        data[track_header_offset(5, ts) + 0x15] = 7;
        let src = CpcDisk::read_bytes(&data, None, false).unwrap();
        assert_eq!(src.sectors_of_cylinder(1, 0), 4);

        let out = export_bytes(&src).unwrap();
        assert_eq!(out.len(), data.len());
        let back = CpcDisk::read_bytes(&out, None, false).unwrap();
        assert!(!back.is_extended());
        assert_eq!(back.sectors_of_cylinder(1, 0), 4);
        assert_eq!(back.sectors_of_cylinder(2, 1), 7);
        assert_same_sectors(&src, &back);
    }

    /// A disk that reports one sector as written with a deleted data mark.
    struct DeletedMark {
        inner: CpcDisk,
        at: (usize, usize, usize),
    }

    impl FloppyDisk for DeletedMark {
        fn id(&self) -> DiskId {
            self.inner.id()
        }
        fn geometry(&self) -> DiskGeometry {
            self.inner.geometry()
        }
        fn is_read_only(&self) -> bool {
            true
        }
        fn file_name(&self) -> Option<&str> {
            None
        }
        fn file_format_text(&self) -> &'static str {
            "deleted mark"
        }
        fn sectors_of_cylinder(&self, cyl: usize, head: usize) -> usize {
            self.inner.sectors_of_cylinder(cyl, head)
        }
        fn sector_by_index(&self, cyl: usize, head: usize, index: usize) -> Option<SectorView<'_>> {
            let mut sector = self.inner.sector_by_index(cyl, head, index)?;
            sector.deleted = (cyl, head, index) == self.at;
            Some(sector)
        }
        fn format_track(&mut self, _: usize, _: usize, _: &[SectorId], _: &[u8]) -> bool {
            false
        }
        fn write_sector(&mut self, _: SectorKey, _: &[u8], _: bool) -> bool {
            false
        }
        fn set_error_listener(&mut self, _: Option<ErrorListener>) {}
        fn close(&mut self) {}
    }

    #[test]
    fn test_export_deleted_sector_fails_without_output() {
        let disk = DeletedMark {
            inner: CpcDisk::read_bytes(&std_image(2, 4, 5, 256), None, false).unwrap(),
            at: (3, 1, 1),
        };
        let path = temp_path("deleted.dsk");
        let _ = std::fs::remove_file(&path);

        let err = export(&disk, &path).unwrap_err();
        assert!(matches!(err, KcError::Export(_)));
        let msg = err.to_string();
        assert!(msg.contains("cylinder 3, head 1, sector 2"), "{}", msg);
        assert!(msg.contains("deleted"), "{}", msg);
        assert!(!path.exists());
    }
}
