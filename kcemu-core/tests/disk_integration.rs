//! Integration tests for disk images mounted through the disk station.

use std::io::Write;
use std::path::PathBuf;

use flate2::write::GzEncoder;
use flate2::Compression;
use kcemu_core::disk::{cpc, DiskStation, FloppyDisk, PlainDisk};
use kcemu_core::disk::station::DiskSource;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("kcemu_{}_{}", std::process::id(), name))
}

fn sample_plain() -> PlainDisk {
    // 2x40x5x1024 with the sector number in every byte
    let mut image = vec![0u8; 2 * 40 * 5 * 1024];
    for (i, chunk) in image.chunks_mut(1024).enumerate() {
        chunk.fill((i % 5 + 1) as u8);
    }
    let fmt = kcemu_core::disk::DiskGeometry::new(2, 40, 5, 1024);
    PlainDisk::from_bytes(image, fmt, Some("sample".to_string()))
}

#[test]
fn test_gzipped_cpc_image_mounts_read_only() {
    let dsk = cpc::export_bytes(&sample_plain()).expect("export");
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&dsk).unwrap();
    let path = temp_path("sample.dsk.gz");
    std::fs::write(&path, enc.finish().unwrap()).unwrap();

    let mut station = DiskStation::new(2, None);
    station.open_path(1, &path, false, None, None).expect("open");
    assert!(matches!(
        station.source(1),
        Some(DiskSource::File { read_only: true, .. })
    ));

    let drive = station.drive(1).unwrap();
    assert!(drive.is_read_only());
    // 40 cylinders: an SD disk in a DD drive
    assert!(drive.skip_odd_cylinders());
    let disk = drive.disk().unwrap();
    assert_eq!(disk.cylinders(), 40);
    let sector = disk.read_sector(7, 1, 4).expect("sector");
    assert!(sector.data.iter().all(|&b| b == 4));

    let info = station.disk_info_text(1).unwrap();
    assert!(info.contains("2x40x5x1024"), "{}", info);

    station.remove_all();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_open_missing_file_fails() {
    let mut station = DiskStation::new(1, None);
    assert!(station
        .open_path(0, &temp_path("missing.img"), true, None, None)
        .is_err());
    assert!(station.open_path(3, &temp_path("x.img"), true, None, None).is_err());
    assert!(station.drive(0).unwrap().disk().is_none());
}

#[test]
fn test_single_density_drives_keep_all_cylinders() {
    let path = temp_path("sd.dsk");
    std::fs::write(&path, cpc::export_bytes(&sample_plain()).expect("export")).unwrap();

    let mut station = DiskStation::new(1, None);
    assert!(station.available_disks().is_empty());
    station.set_double_density_drives(false);
    station.open_path(0, &path, true, None, None).expect("open");
    assert!(!station.drive(0).unwrap().skip_odd_cylinders());

    station.remove_all();
    let _ = std::fs::remove_file(&path);
}
