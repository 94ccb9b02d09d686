//! Floppy disk station D004.
//!
//! The module carries its own Z80 with 64K RAM, an 8272 FDC and up to four
//! drives. The KC85 sees the module ROM at C000 (or E000) and reaches the
//! top 1K of the floppy processor memory through ports F0-F3, the high
//! byte of the port address selecting the byte within a 256 byte page.
//! Port F4 starts, stops, resets and interrupts the floppy processor.

use std::sync::Arc;

use super::{Kc85Module, STATUS_ENABLED};
use crate::config::Properties;
use crate::disk::station::{DiskStation, SharedDiskStation, MAX_DRIVES};
use crate::disk::DriveSelector;
use crate::emulator::{Emulator, Machine, PcIntercepts, ResetLevel};
use crate::fdc::Fdc8272;
use crate::resources::RomResources;
use crate::system::{fill_random, DISK_TICK_TSTATES};

pub const PROP_PREFIX: &str = "jkcemu.kc85.d004.";
pub const PROP_ROM_FILE: &str = "rom.file";
pub const PROP_BOOT_ROM_FILE: &str = "boot_rom.file";

pub const ROM_RESOURCE: &str = "/rom/kc85/d004_20.bin";
pub const BOOT_ROM_RESOURCE: &str = "/rom/kc85/d004_boot.bin";

pub const SLOT: u8 = 0xFC;
pub const TYPE_BYTE: u8 = 0xA7;

/// Floppy processor clock.
pub const PROC_SPEED_KHZ: u32 = 4000;

const STATUS_CONNECTED: u8 = 0x04;
const STATUS_ROM_E000: u8 = 0x20;

const CTRL_ENABLE: u8 = 0x01;
const CTRL_STOP: u8 = 0x02;
const CTRL_RESET: u8 = 0x04;
const CTRL_NMI: u8 = 0x08;

fn key(name: &str) -> String {
    format!("{}{}", PROP_PREFIX, name)
}

/// Shared RAM address for a KC85 port F0-F3.
fn shared_addr(port: u16) -> u16 {
    0xFC00 | ((port & 0xFF) << 8) | (port >> 8)
}

/// The floppy processor side of the D004.
///
/// Ports: F0 FDC main status, F1 FDC data, F8 terminal count. An optional
/// boot ROM overlays RAM from address 0 for reading.
pub struct D004ProcSys {
    ram: Vec<u8>,
    boot_rom: Option<Arc<[u8]>>,
    fdc: Fdc8272,
    disk_station: SharedDiskStation,
    disk_tstates: u32,
    intercepts: PcIntercepts<D004ProcSys>,
}

impl D004ProcSys {
    fn new(props: &Properties, resources: &Arc<RomResources>) -> Self {
        let mut station = DiskStation::new(MAX_DRIVES, Some(Arc::clone(resources)));
        station.apply_settings(props);
        let boot_rom = match props.get_str(&key(PROP_BOOT_ROM_FILE)) {
            Some(_) => resources.rom_from_settings(props, &key(PROP_BOOT_ROM_FILE), BOOT_ROM_RESOURCE),
            None => resources.get(BOOT_ROM_RESOURCE),
        };
        Self {
            ram: vec![0; 0x10000],
            boot_rom,
            fdc: Fdc8272::new(),
            disk_station: station.shared(),
            disk_tstates: 0,
            intercepts: PcIntercepts::new(),
        }
    }

    pub fn disk_station(&self) -> SharedDiskStation {
        Arc::clone(&self.disk_station)
    }

    pub fn fdc(&self) -> &Fdc8272 {
        &self.fdc
    }

    fn with_fdc<R>(&mut self, f: impl FnOnce(&mut Fdc8272, &mut dyn DriveSelector) -> R) -> Option<R> {
        let mut guard = self.disk_station.lock().ok()?;
        Some(f(&mut self.fdc, &mut *guard))
    }

    fn mem_byte(&self, addr: u16) -> u8 {
        if let Some(b) = self.boot_rom.as_ref().and_then(|r| r.get(addr as usize)) {
            return *b;
        }
        self.ram[addr as usize]
    }
}

impl Machine for D004ProcSys {
    fn read_mem(&mut self, addr: u16) -> u8 {
        self.mem_byte(addr)
    }

    fn debug_mem(&self, addr: u16) -> u8 {
        self.mem_byte(addr)
    }

    fn write_mem(&mut self, addr: u16, value: u8) {
        self.ram[addr as usize] = value;
    }

    fn read_io(&mut self, port: u16) -> u8 {
        match port as u8 {
            0xF0 => self.fdc.read_main_status(),
            0xF1 => self.with_fdc(|fdc, sel| fdc.read_data(sel)).unwrap_or(0xFF),
            0xF8 => {
                self.with_fdc(|fdc, sel| fdc.terminal_count(sel));
                0xFF
            }
            _ => 0xFF,
        }
    }

    fn write_io(&mut self, port: u16, value: u8) {
        match port as u8 {
            0xF1 => {
                self.with_fdc(|fdc, sel| fdc.write_data(sel, value));
            }
            0xF8 => {
                self.with_fdc(|fdc, sel| fdc.terminal_count(sel));
            }
            _ => {}
        }
    }

    fn tick(&mut self, tstates: u32) {
        self.disk_tstates += tstates;
        if self.disk_tstates >= DISK_TICK_TSTATES {
            self.disk_tstates = 0;
            if let Ok(mut station) = self.disk_station.lock() {
                station.tick();
            }
        }
    }

    fn reset(&mut self, level: ResetLevel) {
        if level == ResetLevel::PowerOn {
            fill_random(&mut self.ram);
        }
        self.fdc.reset();
        if let Ok(mut station) = self.disk_station.lock() {
            station.reset_drives();
        }
    }

    fn default_speed_khz(&self) -> u32 {
        PROC_SPEED_KHZ
    }

    fn pc_intercepts(&self) -> PcIntercepts<Self> {
        self.intercepts.clone()
    }
}

pub struct D004 {
    rom: Option<Arc<[u8]>>,
    rom_addr: u16,
    status: u8,
    connected: bool,
    ctrl: u8,
    proc: Emulator<D004ProcSys>,
    running: bool,
    host_khz: u32,
    /// Host T-states times the processor clock not yet converted.
    tstate_rest: u64,
    /// Processor T-states owed (positive) or run ahead (negative).
    proc_credit: i64,
}

impl D004 {
    /// `host_khz` is the clock of the KC85 the module is plugged into.
    pub fn new(props: &Properties, resources: Arc<RomResources>, host_khz: u32) -> Self {
        let mut proc = Emulator::new(D004ProcSys::new(props, &resources));
        proc.max_speed = true;
        Self {
            rom: resources.rom_from_settings(props, &key(PROP_ROM_FILE), ROM_RESOURCE),
            rom_addr: 0xC000,
            status: 0,
            connected: false,
            ctrl: 0,
            proc,
            running: false,
            host_khz: host_khz.max(1),
            tstate_rest: 0,
            proc_credit: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn processor(&self) -> &Emulator<D004ProcSys> {
        &self.proc
    }

    pub fn disk_station(&self) -> SharedDiskStation {
        self.proc.machine().disk_station()
    }

    /// Mount the disks named in the settings.
    pub fn apply_settings(&mut self, props: &Properties) {
        if let Ok(mut station) = self.proc.machine().disk_station.lock() {
            station.apply_settings(props);
        }
    }

    pub fn die(&mut self) {
        self.running = false;
        self.proc.die();
    }

    fn start_processor(&mut self) {
        if !self.running {
            log::debug!("D004 processor started");
            self.proc.reset(ResetLevel::Warm);
            self.running = true;
            self.tstate_rest = 0;
            self.proc_credit = 0;
        }
    }

    fn stop_processor(&mut self, power_on: bool) {
        if self.running {
            log::debug!("D004 processor stopped");
            self.running = false;
            if power_on {
                self.proc.power_on();
            }
        }
    }

    fn write_control(&mut self, value: u8) {
        let rising = value & !self.ctrl;
        self.ctrl = value;
        if rising & CTRL_ENABLE != 0 {
            self.start_processor();
        }
        if rising & CTRL_STOP != 0 {
            self.stop_processor(false);
        }
        if rising & CTRL_RESET != 0 && self.running {
            self.proc.reset(ResetLevel::Warm);
        }
        if rising & CTRL_NMI != 0 && self.running {
            self.proc.nmi();
        }
    }
}

impl Kc85Module for D004 {
    fn slot(&self) -> u8 {
        SLOT
    }

    fn type_byte(&self) -> u8 {
        TYPE_BYTE
    }

    fn module_name(&self) -> &str {
        "D004"
    }

    fn status(&self) -> u8 {
        self.status
    }

    fn set_status(&mut self, value: u8) {
        self.status = value;
        self.connected = value & STATUS_CONNECTED != 0;
        self.rom_addr = if value & STATUS_ROM_E000 != 0 { 0xE000 } else { 0xC000 };
    }

    fn read_mem(&self, addr: u16) -> Option<u8> {
        if self.status & STATUS_ENABLED == 0 {
            return None;
        }
        let idx = addr.checked_sub(self.rom_addr)? as usize;
        self.rom.as_ref().and_then(|r| r.get(idx).copied())
    }

    fn read_io(&mut self, port: u16) -> Option<u8> {
        if self.connected && (0xF0..=0xF3).contains(&(port & 0xFF)) {
            Some(self.proc.machine().debug_mem(shared_addr(port)))
        } else {
            None
        }
    }

    /// Ports F0-F4 belong to the module whether or not it is connected.
    fn write_io(&mut self, port: u16, value: u8) -> bool {
        match port & 0xFF {
            0xF0..=0xF3 => {
                if self.connected {
                    self.proc.machine_mut().write_mem(shared_addr(port), value);
                }
                true
            }
            0xF4 => {
                if self.connected {
                    self.write_control(value);
                }
                true
            }
            _ => false,
        }
    }

    fn reset(&mut self, level: ResetLevel) {
        self.stop_processor(level == ResetLevel::PowerOn);
        self.ctrl = 0;
    }

    fn tick(&mut self, tstates: u32) {
        if !self.running {
            return;
        }
        let total = tstates as u64 * PROC_SPEED_KHZ as u64 + self.tstate_rest;
        let host = self.host_khz as u64;
        self.tstate_rest = total % host;
        self.proc_credit += (total / host) as i64;
        if self.proc_credit > 0 {
            let start = self.proc.tstates();
            self.proc.run_for(self.proc_credit as u64);
            self.proc_credit -= (self.proc.tstates() - start) as i64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use z80emu::Cpu;

    const HOST_KHZ: u32 = 1773;

    fn d004(rom: Vec<u8>, boot: Vec<u8>) -> D004 {
        let mut res = RomResources::new();
        res.insert(ROM_RESOURCE, rom);
        res.insert(BOOT_ROM_RESOURCE, boot);
        D004::new(&Properties::new(), Arc::new(res), HOST_KHZ)
    }

    // LD HL,FC00; loop: INC (HL); JR loop
    fn counter_program() -> Vec<u8> {
        vec![0x21, 0x00, 0xFC, 0x34, 0x18, 0xFD]
    }

    #[test]
    fn test_module_identity_and_rom_mapping() {
        let mut m = d004(vec![0xAA; 0x2000], counter_program());
        assert_eq!(m.slot(), 0xFC);
        assert_eq!(m.type_byte(), 0xA7);
        assert_eq!(m.module_name(), "D004");

        assert_eq!(m.read_mem(0xC000), None);
        m.set_status(STATUS_ENABLED);
        assert!(m.is_enabled());
        assert_eq!(m.read_mem(0xC000), Some(0xAA));
        assert_eq!(m.read_mem(0xDFFF), Some(0xAA));
        assert_eq!(m.read_mem(0xBFFF), None);

        m.set_status(STATUS_ENABLED | STATUS_ROM_E000);
        assert_eq!(m.read_mem(0xC000), None);
        assert_eq!(m.read_mem(0xE000), Some(0xAA));
    }

    #[test]
    fn test_shared_ram_ports() {
        let mut m = d004(vec![0; 0x2000], counter_program());
        // not connected: writes are claimed but dropped
        assert!(m.write_io(0x12F1, 0x5A));
        assert_eq!(m.read_io(0x12F1), None);
        assert!(!m.write_io(0x00F5, 0));

        m.set_status(STATUS_CONNECTED);
        assert!(m.write_io(0x12F1, 0x5A));
        assert_eq!(m.read_io(0x12F1), Some(0x5A));
        assert_eq!(m.processor().machine().debug_mem(0xFD12), 0x5A);
        assert!(m.write_io(0xFFF3, 0x77));
        assert_eq!(m.processor().machine().debug_mem(0xFFFF), 0x77);
        assert_eq!(m.read_io(0x00F4), None);
    }

    #[test]
    fn test_control_port_edges() {
        let mut m = d004(vec![0; 0x2000], counter_program());
        m.set_status(STATUS_CONNECTED);
        m.write_io(0x00F0, 0);
        m.tick(1000);
        assert_eq!(m.read_io(0x00F0), Some(0));

        m.write_io(0x00F4, CTRL_ENABLE);
        assert!(m.is_running());
        m.tick(1000);
        let count = m.read_io(0x00F0).unwrap();
        assert!(count > 50, "count {}", count);

        // reset edge restarts the program at 0
        m.write_io(0x00F4, CTRL_ENABLE | CTRL_RESET);
        assert_eq!(m.processor().cpu().get_pc(), 0);

        m.write_io(0x00F4, CTRL_ENABLE | CTRL_STOP);
        assert!(!m.is_running());
        let frozen = m.read_io(0x00F0);
        m.tick(1000);
        assert_eq!(m.read_io(0x00F0), frozen);

        // enable is still high: no new edge
        m.write_io(0x00F4, CTRL_ENABLE);
        assert!(!m.is_running());
        m.write_io(0x00F4, 0);
        m.write_io(0x00F4, CTRL_ENABLE);
        assert!(m.is_running());

        m.reset(ResetLevel::Cold);
        assert!(!m.is_running());
    }

    #[test]
    fn test_processor_sees_idle_fdc() {
        // IN A,(F0); LD (FC00),A; HALT
        let boot = vec![0xDB, 0xF0, 0x32, 0x00, 0xFC, 0x76];
        let mut m = d004(vec![0; 0x2000], boot);
        m.set_status(STATUS_CONNECTED);
        m.write_io(0x00F4, CTRL_ENABLE);
        m.tick(200);
        assert_eq!(m.read_io(0x00F0), Some(0x80));
        assert_eq!(m.disk_station().lock().unwrap().drive_count(), 4);
    }
}
