//! Integration tests running small programs on complete systems.

use std::path::PathBuf;
use std::sync::Arc;

use kcemu_core::system::kc85::{Kc85Module, D004};
use kcemu_core::system::{HueblerMc, Z1013, Z9001};
use kcemu_core::{
    AnySystem, BufferedPrinter, Emulator, ExitReason, KcSystem, Machine, Properties, ResetLevel,
    RomResources, SystemKind,
};

fn props(pairs: &[(&str, &str)]) -> Properties {
    Properties::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
}

/// ROM image of `len` bytes with `code` at its start and `JR $` at `park`.
fn rom_with(code: &[u8], len: usize, park: usize) -> Vec<u8> {
    let mut rom = vec![0u8; len];
    rom[..code.len()].copy_from_slice(code);
    rom[park] = 0x18;
    rom[park + 1] = 0xFE;
    rom
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("kcemu_{}_{}", std::process::id(), name))
}

#[test]
fn test_z1013_monitor_print_and_paste() {
    let code = [
        0x31, 0x00, 0x01, // LD SP,0100
        0x3E, b'K', // LD A,'K'
        0x32, 0x00, 0xEC, // LD (EC00),A
        0x3E, b'O', // LD A,'O'
        0xCD, 0xCA, 0xFF, // CALL FFCA (print A)
        0xCD, 0x30, 0xF1, // CALL F130 (key input)
        0x32, 0x01, 0xEC, // LD (EC01),A
        0x76, // HALT
    ];
    let mut res = RomResources::new();
    res.insert("/rom/z1013/mon_202.bin", rom_with(&code, 0x800, 0x130));
    let mut sys = Z1013::new(&props(&[("jkcemu.system", "Z1013.64")]), Arc::new(res));
    let printer = BufferedPrinter::new();
    sys.set_printer(Box::new(printer.clone()));
    assert!(sys.paste("X"));

    let mut emu = Emulator::new(sys);
    emu.max_speed = true;
    let exit = emu.run_for(2_000);
    assert_eq!(exit.reason, ExitReason::Limit);

    assert_eq!(printer.output_string(), "O");
    assert_eq!(emu.machine().screen_char(0, 0), Some('K'));
    assert_eq!(emu.machine().screen_char(1, 0), Some('X'));
    assert_eq!(emu.machine().screen_text().lines().count(), 32);
}

#[test]
fn test_z9001_bios_list_call() {
    let code = [
        0x31, 0x00, 0x02, // LD SP,0200
        0x3E, b'Z', // LD A,'Z'
        0x32, 0x00, 0xEC, // LD (EC00),A
        0x0E, 0x05, // LD C,5
        0x1E, b'P', // LD E,'P'
        0xCD, 0x05, 0x00, // CALL 0005
        0x76, // HALT
    ];
    let mut res = RomResources::new();
    res.insert("/rom/z9001/os13.bin", rom_with(&code, 0x1000, 0x800));
    let mut sys = Z9001::new(&props(&[("jkcemu.system", "KC87")]), Arc::new(res));
    let printer = BufferedPrinter::new();
    sys.set_printer(Box::new(printer.clone()));

    let mut emu = Emulator::new(sys);
    emu.max_speed = true;
    emu.run_for(5_000);

    assert_eq!(printer.output_string(), "P");
    assert_eq!(emu.machine().screen_char(0, 0), Some('Z'));
    assert_eq!(emu.machine().screen_size(), (40, 24));
}

#[test]
fn test_z9001_fdc_reads_plain_image() {
    let path = temp_path("fdc.img");
    let mut image = vec![0u8; 2 * 80 * 5 * 1024];
    for (i, b) in image[..1024].iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    image[1024..2048].fill(0xE5);
    std::fs::write(&path, &image).unwrap();
    let file = path.display().to_string();

    let mut res = RomResources::new();
    res.insert("/rom/z9001/os13.bin", vec![0x76; 0x1000]);
    let mut sys = Z9001::new(
        &props(&[
            ("jkcemu.system", "KC87"),
            ("jkcemu.z9001.floppydisk.enabled", "true"),
            ("jkcemu.floppydisk.0.file", &file),
        ]),
        Arc::new(res),
    );
    sys.reset(ResetLevel::PowerOn);
    assert!(sys.disk_station().is_some());
    assert_eq!(sys.read_io(0x10), 0x80);

    // READ DATA, drive 0, C0 H0 R1 N3, EOT 5
    for b in [0x46, 0x00, 0x00, 0x00, 0x01, 0x03, 0x05, 0x2A, 0xFF] {
        sys.write_io(0x11, b);
    }
    assert_eq!(sys.read_io(0x10), 0xF0);
    let sector: Vec<u8> = (0..1024).map(|_| sys.read_io(0x11)).collect();
    assert_eq!(sector, image[..1024]);

    // terminal count ends the transfer before sector 2 is read
    sys.write_io(0x12, 0);
    let result: Vec<u8> = (0..7).map(|_| sys.read_io(0x11)).collect();
    assert_eq!(result, [0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x03]);
    assert_eq!(sys.read_io(0x10), 0x80);

    drop(sys);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_any_system_from_settings() {
    let res = Arc::new(RomResources::new());
    let sys = AnySystem::create(&props(&[("jkcemu.system", "KC85/1")]), Arc::clone(&res));
    assert_eq!(sys.kind(), SystemKind::Z9001);
    let sys = AnySystem::create(&props(&[("jkcemu.system", "HueblerGraphicsMC")]), res);
    assert_eq!(sys.kind(), SystemKind::Huebler);
}

#[test]
fn test_huebler_stop_handle_ends_run() {
    let mut res = RomResources::new();
    res.insert("/rom/huebler/hgmc_os.bin", rom_with(&[0x18, 0xFE], 0x100, 0x10));
    let sys = HueblerMc::new(&props(&[("jkcemu.system", "HueblerGraphicsMC")]), Arc::new(res));
    let mut emu = Emulator::new(sys);
    emu.max_speed = true;
    let stop = emu.stop_handle();
    let worker = std::thread::spawn(move || {
        let exit = emu.run();
        (exit, emu)
    });
    std::thread::sleep(std::time::Duration::from_millis(20));
    stop.store(true, std::sync::atomic::Ordering::SeqCst);
    let (exit, emu) = worker.join().unwrap();
    assert_eq!(exit.reason, ExitReason::Stopped);
    assert_eq!(exit.pc, 0xF000);
    assert!(emu.tstates() > 0);
}

#[test]
fn test_d004_processor_fills_shared_ram() {
    // LD HL,FC00; LD B,4; loop: LD (HL),B; INC L; DJNZ loop; HALT
    let boot = vec![0x21, 0x00, 0xFC, 0x06, 0x04, 0x70, 0x2C, 0x10, 0xFC, 0x76];
    let mut res = RomResources::new();
    res.insert("/rom/kc85/d004_20.bin", vec![0xC3; 0x2000]);
    res.insert("/rom/kc85/d004_boot.bin", boot);
    let mut d004 = D004::new(&Properties::new(), Arc::new(res), 1773);
    d004.set_status(0x05);
    assert_eq!(d004.read_mem(0xC000), Some(0xC3));

    d004.write_io(0x00F4, 0x01);
    d004.tick(500);
    let shared: Vec<Option<u8>> = (0..4u16).map(|i| d004.read_io((i << 8) | 0xF0)).collect();
    assert_eq!(shared, [Some(4), Some(3), Some(2), Some(1)]);

    d004.reset(ResetLevel::PowerOn);
    assert!(!d004.is_running());
}
