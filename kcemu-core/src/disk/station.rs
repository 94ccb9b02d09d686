//! The disk station: the drives of an emulated system and the images
//! mounted in them.
//!
//! The station opens images by file name, mounts bundled disks from the
//! resource package, keeps the drive activity counters and filters disk
//! errors so that a failing disk produces one message per access burst
//! instead of one per sector.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    decompress_if_gzip, format_text, AnaDisk, CpcDisk, DriveSelector, ErrorListener, FloppyDisk,
    FloppyDiskDrive, FloppyDiskFormat, FloppyDiskInfo, PlainDisk, FMT_780K,
};
use crate::config::Properties;
use crate::error::{KcError, KcResult};
use crate::resources::RomResources;

pub const MAX_DRIVES: usize = 4;

const PROP_PREFIX: &str = "jkcemu.floppydisk.";

/// Station shared between the emulation thread and the front end.
pub type SharedDiskStation = Arc<Mutex<DiskStation>>;

/// Where the disk in a drive came from.
#[derive(Debug, Clone, PartialEq)]
pub enum DiskSource {
    File { path: PathBuf, read_only: bool },
    Resource(&'static str),
}

/// Image format chosen from a file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageKind {
    Cpc,
    AnaDisk,
    Plain,
    /// Decide by looking at the content.
    Unknown,
}

fn image_kind(path: &Path) -> (ImageKind, bool) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let (name, gz) = match name.strip_suffix(".gz") {
        Some(stem) => (stem.to_string(), true),
        None => (name, false),
    };
    let kind = match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("dsk") => ImageKind::Cpc,
        Some("dump") | Some("dmp") => ImageKind::AnaDisk,
        Some("img") | Some("image") | Some("raw") => ImageKind::Plain,
        _ => ImageKind::Unknown,
    };
    (kind, gz)
}

fn detect_kind(data: &[u8]) -> ImageKind {
    if super::cpc::is_cpc_disk_header(data) {
        ImageKind::Cpc
    } else if AnaDisk::is_anadisk(data) {
        ImageKind::AnaDisk
    } else {
        ImageKind::Plain
    }
}

pub struct DiskStation {
    drives: Vec<FloppyDiskDrive>,
    sources: Vec<Option<DiskSource>>,
    resources: Option<Arc<RomResources>>,
    catalog: Vec<FloppyDiskInfo>,
    default_format: FloppyDiskFormat,
    double_density_drives: bool,
    error_shown: Arc<AtomicBool>,
    error_forward: Option<ErrorListener>,
}

impl DiskStation {
    pub fn new(drive_count: usize, resources: Option<Arc<RomResources>>) -> Self {
        let count = drive_count.clamp(1, MAX_DRIVES);
        Self {
            drives: (0..count).map(|_| FloppyDiskDrive::new()).collect(),
            sources: vec![None; count],
            resources,
            catalog: Vec::new(),
            default_format: FMT_780K,
            double_density_drives: true,
            error_shown: Arc::new(AtomicBool::new(false)),
            error_forward: None,
        }
    }

    pub fn shared(self) -> SharedDiskStation {
        Arc::new(Mutex::new(self))
    }

    pub fn drive_count(&self) -> usize {
        self.drives.len()
    }

    /// Bundled disks and default format of the emulated system.
    pub fn set_system_disks(&mut self, catalog: &[FloppyDiskInfo], default_format: FloppyDiskFormat) {
        self.catalog = catalog.to_vec();
        self.default_format = default_format;
    }

    pub fn available_disks(&self) -> &[FloppyDiskInfo] {
        &self.catalog
    }

    pub fn default_format(&self) -> FloppyDiskFormat {
        self.default_format
    }

    pub fn set_double_density_drives(&mut self, state: bool) {
        self.double_density_drives = state;
    }

    /// Receiver of de-duplicated disk errors.
    pub fn set_error_listener(&mut self, listener: Option<ErrorListener>) {
        self.error_forward = listener;
    }

    pub fn drive(&self, idx: usize) -> Option<&FloppyDiskDrive> {
        self.drives.get(idx)
    }

    pub fn source(&self, idx: usize) -> Option<&DiskSource> {
        self.sources.get(idx).and_then(|s| s.as_ref())
    }

    fn check_index(&self, idx: usize) -> KcResult<()> {
        if idx < self.drives.len() {
            Ok(())
        } else {
            Err(KcError::InvalidDrive(idx))
        }
    }

    fn station_listener(&self) -> ErrorListener {
        let shown = Arc::clone(&self.error_shown);
        let forward = self.error_forward.clone();
        Arc::new(move |msg: &str| {
            if !shown.swap(true, Ordering::AcqRel) {
                if let Some(f) = &forward {
                    f(msg);
                }
            } else {
                log::debug!("suppressed disk error: {}", msg);
            }
        })
    }

    /// Mount a disk. Without an explicit choice, SD images (fewer than 50
    /// cylinders) skip odd cylinders in double density drives.
    pub fn set_disk(
        &mut self,
        idx: usize,
        mut disk: Box<dyn FloppyDisk>,
        source: Option<DiskSource>,
        skip_odd_cylinders: Option<bool>,
    ) -> KcResult<()> {
        self.check_index(idx)?;
        let cyls = disk.cylinders();
        let skip = skip_odd_cylinders
            .unwrap_or(self.double_density_drives && cyls > 0 && cyls < 50);
        disk.set_error_listener(Some(self.station_listener()));
        log::info!(
            "drive {}: {} ({})",
            idx,
            disk.media_text(),
            format_text(&disk.geometry())
        );
        self.drives[idx].set_disk(disk, skip);
        self.sources[idx] = source;
        Ok(())
    }

    pub fn remove_disk(&mut self, idx: usize) {
        if let Some(drive) = self.drives.get_mut(idx) {
            drive.remove_disk();
            self.sources[idx] = None;
        }
    }

    pub fn remove_all(&mut self) {
        for idx in 0..self.drives.len() {
            self.remove_disk(idx);
        }
    }

    /// Open an image file, choosing the codec by its name.
    pub fn open_path(
        &mut self,
        idx: usize,
        path: &Path,
        read_only: bool,
        format: Option<FloppyDiskFormat>,
        skip_odd_cylinders: Option<bool>,
    ) -> KcResult<()> {
        self.check_index(idx)?;
        if !path.exists() {
            return Err(KcError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                path.display().to_string(),
            )));
        }
        // the lock of a still mounted image would block reopening it
        self.remove_disk(idx);

        let (mut kind, gz) = image_kind(path);
        let read_only = read_only || gz;
        let mut data = None;
        if kind == ImageKind::Unknown || gz {
            let bytes = decompress_if_gzip(std::fs::read(path)?)?;
            if kind == ImageKind::Unknown {
                kind = detect_kind(&bytes);
            }
            data = Some(bytes);
        }
        let name = path.display().to_string();

        let disk: Box<dyn FloppyDisk> = match (kind, read_only) {
            (ImageKind::Cpc, false) => Box::new(CpcDisk::open_file(path)?),
            (ImageKind::AnaDisk, false) => Box::new(AnaDisk::open_file(path)?),
            (ImageKind::Cpc, true) => match &data {
                Some(bytes) => Box::new(CpcDisk::read_bytes(bytes, Some(&name), false)?),
                None => Box::new(CpcDisk::read_file(path)?),
            },
            (ImageKind::AnaDisk, true) => match &data {
                Some(bytes) => Box::new(AnaDisk::read_bytes(bytes, Some(&name), false)?),
                None => Box::new(AnaDisk::read_file(path)?),
            },
            (_, ro) => {
                let len = match &data {
                    Some(bytes) => bytes.len(),
                    None => std::fs::metadata(path)?.len() as usize,
                };
                let fmt = format
                    .or_else(|| PlainDisk::format_for_size(len))
                    .unwrap_or(self.default_format);
                match (ro, data) {
                    (false, _) => Box::new(PlainDisk::open_file(path, fmt)?),
                    (true, Some(bytes)) => Box::new(PlainDisk::from_bytes(bytes, fmt, Some(name))),
                    (true, None) => Box::new(PlainDisk::read_file(path, fmt)?),
                }
            }
        };
        let source = DiskSource::File {
            path: path.to_path_buf(),
            read_only,
        };
        self.set_disk(idx, disk, Some(source), skip_odd_cylinders)
    }

    /// Create an empty image; it gets its content when the system formats it.
    pub fn new_file(&mut self, idx: usize, path: &Path) -> KcResult<()> {
        self.check_index(idx)?;
        self.remove_disk(idx);
        let disk: Box<dyn FloppyDisk> = match image_kind(path) {
            (_, true) => return Err(KcError::UnsupportedFile(path.display().to_string())),
            (ImageKind::AnaDisk, false) => Box::new(AnaDisk::new_file(path)?),
            (ImageKind::Plain, false) => Box::new(PlainDisk::new_file(path, self.default_format)?),
            _ => Box::new(CpcDisk::new_file(path)?),
        };
        let source = DiskSource::File {
            path: path.to_path_buf(),
            read_only: false,
        };
        // an empty image has no geometry yet, the drive type decides
        self.set_disk(idx, disk, Some(source), Some(false))
    }

    fn resource_bytes(&self, info: &FloppyDiskInfo) -> KcResult<Vec<u8>> {
        let res = self
            .resources
            .as_ref()
            .ok_or_else(|| KcError::ResourceNotFound(info.resource.to_string()))?;
        decompress_if_gzip(res.require(info.resource)?.to_vec())
    }

    /// Mount a bundled disk read-only.
    pub fn open_resource(&mut self, idx: usize, info: &FloppyDiskInfo) -> KcResult<()> {
        self.check_index(idx)?;
        let bytes = self.resource_bytes(info)?;
        let disk: Box<dyn FloppyDisk> = match detect_kind(&bytes) {
            ImageKind::Cpc => Box::new(CpcDisk::read_bytes(&bytes, Some(info.text), true)?),
            ImageKind::AnaDisk => Box::new(AnaDisk::read_bytes(&bytes, Some(info.text), true)?),
            _ => {
                let fmt = PlainDisk::format_for_size(bytes.len()).unwrap_or(self.default_format);
                let mut disk = PlainDisk::from_bytes(bytes, fmt, Some(info.text.to_string()));
                disk.set_remark(Some(format!(
                    "{} system tracks, {} byte blocks",
                    info.sys_tracks, info.block_size
                )));
                Box::new(disk)
            }
        };
        self.set_disk(idx, disk, Some(DiskSource::Resource(info.resource)), None)
    }

    /// Write a bundled disk, decompressed, to a file.
    pub fn export_resource(&self, info: &FloppyDiskInfo, path: &Path) -> KcResult<()> {
        let bytes = self.resource_bytes(info)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Decay the activity counters. Errors are shown again once all
    /// drives are idle. Returns the activity LED state.
    pub fn tick(&mut self) -> bool {
        let mut active = false;
        for drive in &mut self.drives {
            if drive.decay_access() {
                active = true;
            }
        }
        if !active {
            self.error_shown.store(false, Ordering::Release);
        }
        active
    }

    /// Heads back to cylinder 0 (system reset).
    pub fn reset_drives(&mut self) {
        for drive in &mut self.drives {
            drive.reset();
        }
    }

    pub fn disk_info_text(&self, idx: usize) -> Option<String> {
        let drive = self.drives.get(idx)?;
        let disk = drive.disk()?;
        let mut text = String::new();
        let media = disk.media_text();
        if !media.is_empty() {
            text.push_str(&media);
            text.push('\n');
        }
        text.push_str(&format!("{}, {}", disk.file_format_text(), format_text(&disk.geometry())));
        if let Some(remark) = disk.remark() {
            let remark = remark.trim();
            if !remark.is_empty() {
                text.push_str("\n\n");
                text.push_str(remark);
            }
        }
        if drive.skip_odd_cylinders() {
            text.push_str("\n\nSD disk in a DD drive (cylinder numbers doubled)");
        }
        Some(text)
    }

    /// Mount the disks named in the settings. Failures are logged and
    /// leave the drive empty.
    pub fn apply_settings(&mut self, props: &Properties) -> bool {
        for idx in 0..self.drives.len() {
            let key = |name: &str| format!("{}{}.{}", PROP_PREFIX, idx, name);
            let read_only = props.get_bool(&key("readonly"), true);
            let skip = props
                .get_str(&key("skip_odd_cylinders"))
                .map(|_| props.get_bool(&key("skip_odd_cylinders"), false));

            let wanted = if let Some(file) = props.get_str(&key("file")) {
                Some(DiskSource::File {
                    path: PathBuf::from(file),
                    read_only,
                })
            } else {
                props.get_str(&key("resource")).and_then(|res| {
                    self.catalog
                        .iter()
                        .find(|i| i.resource == res)
                        .map(|i| DiskSource::Resource(i.resource))
                })
            };
            if wanted.is_some() && self.sources[idx] == wanted {
                continue;
            }
            let result = match &wanted {
                Some(DiskSource::File { path, read_only }) => {
                    self.open_path(idx, path, *read_only, None, skip)
                }
                Some(DiskSource::Resource(res)) => {
                    let info = self.catalog.iter().find(|i| i.resource == *res).cloned();
                    match info {
                        Some(info) => self.open_resource(idx, &info),
                        None => Ok(()),
                    }
                }
                None => {
                    self.remove_disk(idx);
                    Ok(())
                }
            };
            if let Err(e) = result {
                log::warn!("drive {}: {}", idx, e);
            }
        }
        true
    }

    pub fn put_settings_to(&self, props: &mut Properties) {
        for idx in 0..self.drives.len() {
            let key = |name: &str| format!("{}{}.{}", PROP_PREFIX, idx, name);
            for name in ["file", "resource", "readonly", "skip_odd_cylinders"] {
                props.remove(&key(name));
            }
            match &self.sources[idx] {
                Some(DiskSource::File { path, read_only }) => {
                    props.set(key("file"), path.display().to_string());
                    props.set_bool(key("readonly"), *read_only);
                }
                Some(DiskSource::Resource(res)) => props.set(key("resource"), *res),
                None => continue,
            }
            props.set_bool(key("skip_odd_cylinders"), self.drives[idx].skip_odd_cylinders());
        }
    }
}

impl DriveSelector for DiskStation {
    fn floppy_disk_drive(&mut self, drive_num: usize) -> Option<&mut FloppyDiskDrive> {
        self.drives.get_mut(drive_num)
    }
}

impl Drop for DiskStation {
    fn drop(&mut self) {
        self.remove_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskGeometry, SectorId};
    use std::sync::atomic::AtomicUsize;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("kcemu-station-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_image_kind_by_name() {
        assert_eq!(image_kind(Path::new("a/B.DSK")), (ImageKind::Cpc, false));
        assert_eq!(image_kind(Path::new("x.dump.gz")), (ImageKind::AnaDisk, true));
        assert_eq!(image_kind(Path::new("x.img")), (ImageKind::Plain, false));
        assert_eq!(image_kind(Path::new("x.bin")), (ImageKind::Unknown, false));
    }

    #[test]
    fn test_open_plain_by_size() {
        let path = temp_path("disk.img");
        std::fs::write(&path, vec![0xE5; FMT_780K.disk_size()]).unwrap();
        let mut station = DiskStation::new(2, None);
        station.open_path(1, &path, true, None, None).unwrap();
        let drive = station.drive(1).unwrap();
        assert_eq!(drive.disk().unwrap().geometry(), FMT_780K);
        assert!(!drive.skip_odd_cylinders());
        assert!(station.disk_info_text(1).unwrap().contains("780K"));
        assert!(matches!(
            station.open_path(4, &path, true, None, None),
            Err(KcError::InvalidDrive(4))
        ));
        drop(station);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_sd_disk_skips_odd_cylinders() {
        let path = temp_path("sd.raw");
        let fmt = DiskGeometry::new(2, 40, 5, 1024);
        std::fs::write(&path, vec![0; fmt.disk_size()]).unwrap();
        let mut station = DiskStation::new(1, None);
        station.open_path(0, &path, true, Some(fmt), None).unwrap();
        assert!(station.drive(0).unwrap().skip_odd_cylinders());
        station.open_path(0, &path, true, Some(fmt), Some(false)).unwrap();
        assert!(!station.drive(0).unwrap().skip_odd_cylinders());
        drop(station);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_errors_shown_once_per_burst() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut station = DiskStation::new(1, None);
        station.set_error_listener(Some(Arc::new(move |_msg: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        let fmt = DiskGeometry::new(1, 2, 2, 128);
        let disk = PlainDisk::from_bytes(vec![0; fmt.disk_size()], fmt, None);
        station.set_disk(0, Box::new(disk), None, Some(false)).unwrap();

        let listener = station.station_listener();
        listener("first");
        listener("second");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // activity keeps the filter closed
        let drive = station.floppy_disk_drive(0).unwrap();
        drive.find_sector(0, SectorId::new(0, 0, 1, 0));
        assert!(station.tick());
        listener("third");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        while station.tick() {}
        listener("fourth");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_settings_round_trip() {
        let path = temp_path("settings.dsk");
        let mut station = DiskStation::new(2, None);
        station.new_file(0, &path).unwrap();
        let mut props = Properties::new();
        station.put_settings_to(&mut props);
        assert_eq!(
            props.get_str("jkcemu.floppydisk.0.file"),
            Some(path.display().to_string().as_str())
        );
        assert!(!props.get_bool("jkcemu.floppydisk.0.readonly", true));
        assert!(props.get_str("jkcemu.floppydisk.1.file").is_none());

        // same source stays mounted, no second lock attempt
        assert!(station.apply_settings(&props));
        assert!(station.drive(0).unwrap().is_ready());
        drop(station);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_resource_disk() {
        let fmt = DiskGeometry::new(1, 2, 2, 128);
        let mut res = RomResources::new();
        res.insert("/disks/test.img", vec![0x11; fmt.disk_size()]);
        let info = FloppyDiskInfo {
            resource: "/disks/test.img",
            text: "Test disk",
            sys_tracks: 1,
            block_size: 1024,
            block_num_16bit: false,
        };
        let mut station = DiskStation::new(1, Some(Arc::new(res)));
        station.set_system_disks(std::slice::from_ref(&info), fmt);
        station.open_resource(0, &info).unwrap();
        let drive = station.drive(0).unwrap();
        assert!(drive.is_read_only());
        assert_eq!(drive.disk().unwrap().read_sector(1, 0, 2).unwrap().data[0], 0x11);

        let out = temp_path("export.img");
        station.export_resource(&info, &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap().len(), fmt.disk_size());
        let _ = std::fs::remove_file(&out);
    }
}
