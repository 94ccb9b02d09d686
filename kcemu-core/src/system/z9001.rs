//! Z9001, KC85/1 and KC87.
//!
//! # Memory map
//!
//! | Range     | Content                                                    |
//! |-----------|------------------------------------------------------------|
//! | 0000-RAM  | RAM, 16K to 74K (4000-7FFF and C000-E7FF switchable)       |
//! | B800-BFFF | printer module ROM (only where no RAM is fitted)           |
//! | C000-E7FF | KC87 BASIC ROM, or the FDC boot ROM                        |
//! | E800-EBFF | color RAM                                                  |
//! | EC00-EFFF | video RAM, or a KRT pixel bank in graphics mode            |
//! | F000-FFFF | OS ROM; with FDC, writes to F800-FFFF switch the boot ROM  |
//!
//! Accesses to video and color RAM during the visible part of a scanline
//! stall the CPU until the line's visible part is over.

use std::collections::VecDeque;
use std::sync::Arc;

use z80emu::{CpuFlags, Reg8};

use super::{
    fill_random, KcSystem, DISK_TICK_TSTATES, PROP_CATCH_PRINT_CALLS, PROP_FDC_ENABLED,
    PROP_OS_FILE, PROP_PASTE_FAST, PROP_RF1_PREFIX, PROP_RF2_PREFIX, PROP_SYSNAME,
};
use crate::config::Properties;
use crate::devices::{
    accept_interrupt, finish_interrupt, interrupt_pending, InterruptSource, KeyMatrix8x8,
    RamFloppy, RamFloppyType, SpecialKey, Z80Ctc, Z80Pio, Z80Sio,
};
use crate::disk::station::{DiskStation, SharedDiskStation};
use crate::disk::{DiskGeometry, DriveSelector, FloppyDiskFormat, FloppyDiskInfo};
use crate::emulator::{CpuAccess, Machine, PcHandler, PcIntercepts, ResetLevel};
use crate::fdc::Fdc8272;
use crate::printer::{NullPrinter, PrintSink};
use crate::resources::RomResources;

pub const PROP_PREFIX: &str = "jkcemu.z9001.";
pub const PROP_COLOR: &str = "color";
pub const PROP_GRAPHIC_TYPE: &str = "graphic.type";
pub const PROP_PRINTER_MODULE_ENABLED: &str = "printer_module.enabled";
pub const PROP_RAM_KBYTE: &str = "ram.kbyte";

pub const SYSNAME_Z9001: &str = "Z9001";
pub const SYSNAME_KC85_1: &str = "KC85/1";
pub const SYSNAME_KC87: &str = "KC87";

/// Nominal clock is 2.4576 MHz.
pub const DEFAULT_SPEED_KHZ: u32 = 2458;

/// OS keyboard buffer: character and "new key" cell.
const MEM_KEY_CHAR: u16 = 0x0024;
const MEM_KEY_NEW: u16 = 0x0025;

const COLOR_ADDR: u16 = 0xE800;
const VIDEO_ADDR: u16 = 0xEC00;
const VIDEO_SIZE: usize = 0x400;
const COLUMNS: usize = 40;

const LINES_PER_FRAME: u32 = 312;
const VISIBLE_LINES: u32 = 192;
const BLINK_MILLIS: u32 = 200;

pub const AVAILABLE_DISKS: [FloppyDiskInfo; 1] = [FloppyDiskInfo {
    resource: "/disks/z9001/z9cpmsys.dump.gz",
    text: "Z9001 CP/A system disk",
    sys_tracks: 0,
    block_size: 2048,
    block_num_16bit: true,
}];

pub const DEFAULT_DISK_FORMAT: FloppyDiskFormat = DiskGeometry::new(2, 80, 5, 1024);

/// Model, which selects the ROM set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    Z9001,
    Kc85_1,
    Kc87,
}

impl Model {
    fn from_name(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        if upper.starts_with(SYSNAME_KC87) {
            Model::Kc87
        } else if upper.starts_with(SYSNAME_KC85_1) {
            Model::Kc85_1
        } else {
            Model::Z9001
        }
    }

    fn os_resource(self) -> &'static str {
        match self {
            Model::Z9001 => "/rom/z9001/os11.bin",
            Model::Kc85_1 => "/rom/z9001/os12.bin",
            Model::Kc87 => "/rom/z9001/os13.bin",
        }
    }

    /// KC87 carries BASIC in ROM.
    fn basic_resource(self) -> Option<&'static str> {
        (self == Model::Kc87).then_some("/rom/z9001/basic86.bin")
    }
}

/// Pixel graphics card on ports B8-BA.
#[derive(Debug, Clone)]
pub enum Graphics {
    None,
    /// 256x192 pixels, addressed through ports B9 (low) and BA (high byte
    /// on the upper address lines).
    Robotron {
        pixels: Vec<u8>,
        addr_l: u8,
        bg: u8,
        fg: u8,
        border: bool,
        active: bool,
    },
    /// Eight 1K banks overlaying the video RAM, one per character line.
    Krt { pixels: Vec<u8>, bank: usize, active: bool },
}

impl Graphics {
    fn from_settings(props: &Properties) -> Self {
        match props.get_str(&key(PROP_GRAPHIC_TYPE)).map(str::to_ascii_lowercase).as_deref() {
            Some("robotron") => Graphics::Robotron {
                pixels: vec![0; 0x1800],
                addr_l: 0,
                bg: 0,
                fg: 0,
                border: false,
                active: false,
            },
            Some("krt") => Graphics::Krt {
                pixels: vec![0; 0x2000],
                bank: 0,
                active: false,
            },
            _ => Graphics::None,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Graphics::None => 0,
            Graphics::Robotron { .. } => 1,
            Graphics::Krt { .. } => 2,
        }
    }

    fn is_active(&self) -> bool {
        match self {
            Graphics::None => false,
            Graphics::Robotron { active, .. } | Graphics::Krt { active, .. } => *active,
        }
    }

    fn reset(&mut self, power_on: bool) {
        match self {
            Graphics::None => {}
            Graphics::Robotron { pixels, addr_l, bg, fg, border, active } => {
                if power_on {
                    fill_random(pixels);
                }
                *addr_l = 0;
                *bg = 0;
                *fg = 0;
                *border = false;
                *active = false;
            }
            Graphics::Krt { pixels, active, .. } => {
                if power_on {
                    fill_random(pixels);
                }
                *active = false;
            }
        }
    }
}

/// Printer module: ROM at B800, CTC at A8, SIO at B0.
#[derive(Debug, Clone)]
struct PrinterModule {
    rom: Option<Arc<[u8]>>,
    ctc: Z80Ctc,
    sio: Z80Sio,
}

type Intercept = fn(&mut Z9001, &mut CpuAccess<'_>) -> bool;

fn handler(f: Intercept) -> PcHandler<Z9001> {
    Arc::new(f)
}

fn key(name: &str) -> String {
    format!("{}{}", PROP_PREFIX, name)
}

fn sys_name(props: &Properties) -> String {
    props.get_str(PROP_SYSNAME).unwrap_or(SYSNAME_Z9001).to_string()
}

/// Highest RAM address for the configured RAM size.
pub fn ram_end_addr(props: &Properties) -> u16 {
    match props.get_str(&key(PROP_RAM_KBYTE)) {
        Some("32") => 0x7FFF,
        Some("48") => 0xBFFF,
        Some("74") => 0xE7FF,
        _ => 0x3FFF,
    }
}

fn rf_prefix(rf: &str) -> String {
    format!("{}{}", PROP_PREFIX, rf)
}

fn ram_floppy_from_settings(props: &Properties, rf: &str) -> Option<RamFloppy> {
    let prefix = rf_prefix(rf);
    props
        .get_bool(&format!("{}enabled", prefix), false)
        .then(|| RamFloppy::from_settings(RamFloppyType::Z9001Paged, props, &prefix))
}

fn rf_complies(rf: &Option<RamFloppy>, props: &Properties, name: &str) -> bool {
    let prefix = rf_prefix(name);
    let wanted = props.get_bool(&format!("{}enabled", prefix), false);
    match rf {
        Some(rf) => wanted && rf.complies(RamFloppyType::Z9001Paged, props, &prefix),
        None => !wanted,
    }
}

/// Page register value of a RAM floppy: bits 15..22 from the upper port
/// byte, bits 7..14 from the data byte.
fn rf_page_addr(port: u16, value: u8) -> usize {
    (((port as usize) << 7) & 0x7F_8000) | (((value as usize) << 7) & 0x7F80)
}

pub struct Z9001 {
    props: Properties,
    sys_name: String,
    model: Model,
    os_rom: Option<Arc<[u8]>>,
    rom_basic: Option<Arc<[u8]>>,
    boot_rom: Option<Arc<[u8]>>,
    ram: Vec<u8>,
    ram_ext: Option<Vec<u8>>,
    ram_end: u16,
    ram_color: Option<Vec<u8>>,
    ram_video: Vec<u8>,
    graphics: Graphics,
    pio90: Z80Pio,
    pio88: Z80Pio,
    ctc80: Z80Ctc,
    printer_module: Option<PrinterModule>,
    keyboard: KeyMatrix8x8,
    fdc: Option<Fdc8272>,
    fdc_tc: bool,
    fdc_reset: bool,
    disk_station: Option<SharedDiskStation>,
    disk_tstates: u32,
    ram_floppy1: Option<RamFloppy>,
    ram_floppy2: Option<RamFloppy>,
    rf1_addr: usize,
    rf2_addr: usize,
    printer: Box<dyn PrintSink>,
    intercepts: PcIntercepts<Z9001>,
    paste_fast: bool,
    paste_queue: VecDeque<u8>,
    boot_rom_enabled: bool,
    ram_4000_ext: bool,
    ram_c000: bool,
    mode_20_rows: bool,
    border_color: u8,
    color_swap: bool,
    blink_tstates: u32,
    tstates_per_line: u32,
    tstates_visible: u32,
    line_num: u32,
    line_tstates: u32,
    wait_states: u32,
    screen_resized: bool,
}

impl Z9001 {
    pub fn new(props: &Properties, resources: Arc<RomResources>) -> Self {
        let name = sys_name(props);
        let model = Model::from_name(&name);
        let fdc_enabled = props.get_bool(&key(PROP_FDC_ENABLED), false);
        let disk_station = fdc_enabled.then(|| {
            let mut station = DiskStation::new(2, Some(Arc::clone(&resources)));
            station.set_system_disks(&AVAILABLE_DISKS, DEFAULT_DISK_FORMAT);
            station.apply_settings(props);
            station.shared()
        });
        let printer_module = props
            .get_bool(&key(PROP_PRINTER_MODULE_ENABLED), false)
            .then(|| PrinterModule {
                rom: resources.get("/rom/z9001/modprinter.bin"),
                ctc: Z80Ctc::new(),
                sio: Z80Sio::new(),
            });
        let ram_end = ram_end_addr(props);
        let mut sys = Self {
            props: props.clone(),
            sys_name: name,
            model,
            os_rom: resources.rom_from_settings(props, &key(PROP_OS_FILE), model.os_resource()),
            rom_basic: model.basic_resource().and_then(|r| resources.get(r)),
            boot_rom: if fdc_enabled {
                resources.get("/rom/z9001/bootrom.bin")
            } else {
                None
            },
            ram: vec![0; 0x10000],
            ram_ext: (ram_end > 0xC000).then(|| vec![0; 0x4000]),
            ram_end,
            ram_color: props.get_bool(&key(PROP_COLOR), true).then(|| vec![0; VIDEO_SIZE]),
            ram_video: vec![0x20; VIDEO_SIZE],
            graphics: Graphics::from_settings(props),
            pio90: Z80Pio::new(),
            pio88: Z80Pio::new(),
            ctc80: Z80Ctc::new(),
            printer_module,
            keyboard: KeyMatrix8x8::new(),
            fdc: fdc_enabled.then(Fdc8272::new),
            fdc_tc: false,
            fdc_reset: false,
            disk_station,
            disk_tstates: 0,
            ram_floppy1: ram_floppy_from_settings(props, PROP_RF1_PREFIX),
            ram_floppy2: ram_floppy_from_settings(props, PROP_RF2_PREFIX),
            rf1_addr: 0,
            rf2_addr: 0,
            printer: Box::new(NullPrinter),
            intercepts: PcIntercepts::new(),
            paste_fast: true,
            paste_queue: VecDeque::new(),
            boot_rom_enabled: false,
            ram_4000_ext: false,
            ram_c000: false,
            mode_20_rows: false,
            border_color: 0,
            color_swap: false,
            blink_tstates: 0,
            tstates_per_line: 0,
            tstates_visible: 0,
            line_num: 0,
            line_tstates: 0,
            wait_states: 0,
            screen_resized: false,
        };
        sys.set_line_timing(DEFAULT_SPEED_KHZ);
        sys.register_intercepts(props);
        sys
    }

    /// Scanline timing for a CPU clock of `khz`.
    pub fn set_line_timing(&mut self, khz: u32) {
        self.tstates_per_line = khz * 20 / LINES_PER_FRAME;
        self.tstates_visible = self.tstates_per_line / 2;
    }

    fn register_intercepts(&mut self, props: &Properties) {
        self.paste_fast = props.get_bool(&key(PROP_PASTE_FAST), true);
        let mut entries: Vec<(u16, PcHandler<Self>)> = Vec::new();
        if props.get_bool(&key(PROP_CATCH_PRINT_CALLS), true) {
            entries.push((0x0005, handler(Self::pc_bios_call)));
        }
        self.intercepts.replace(entries);
    }

    /// BIOS call 5 (LIST): print register E.
    fn pc_bios_call(&mut self, cpu: &mut CpuAccess<'_>) -> bool {
        if cpu.reg8(Reg8::C) != 5 {
            return false;
        }
        self.printer.print(cpu.reg8(Reg8::E));
        cpu.set_flag(CpuFlags::C, false);
        true
    }

    pub fn model(&self) -> Model {
        self.model
    }

    pub fn graphics(&self) -> &Graphics {
        &self.graphics
    }

    pub fn border_color(&self) -> u8 {
        self.border_color
    }

    pub fn is_boot_rom_enabled(&self) -> bool {
        self.boot_rom_enabled
    }

    pub fn ram_floppy1(&self) -> Option<&RamFloppy> {
        self.ram_floppy1.as_ref()
    }

    pub fn ram_floppy2(&self) -> Option<&RamFloppy> {
        self.ram_floppy2.as_ref()
    }

    /// Foreground and background color index of a character cell; blinking
    /// cells swap both while the blink phase is on. `None` without color
    /// RAM.
    pub fn char_colors(&self, col: usize, row: usize) -> Option<(u8, u8)> {
        let ram = self.ram_color.as_ref()?;
        let info = *ram.get(row * COLUMNS + col)?;
        let fg = (info >> 4) & 0x07;
        let bg = info & 0x07;
        if info & 0x80 != 0 && self.color_swap {
            Some((bg, fg))
        } else {
            Some((fg, bg))
        }
    }

    pub fn flush(&mut self) {
        for rf in [&mut self.ram_floppy1, &mut self.ram_floppy2].into_iter().flatten() {
            if let Err(e) = rf.flush() {
                log::error!("Z9001: {}", e);
            }
        }
    }

    fn complies(&self, props: &Properties) -> bool {
        let same_flag = |k: &str, current: bool, default: bool| props.get_bool(&key(k), default) == current;
        sys_name(props) == self.sys_name
            && props.get_str(&key(PROP_OS_FILE)) == self.props.get_str(&key(PROP_OS_FILE))
            && same_flag(PROP_FDC_ENABLED, self.fdc.is_some(), false)
            && same_flag(PROP_PRINTER_MODULE_ENABLED, self.printer_module.is_some(), false)
            && same_flag(PROP_COLOR, self.ram_color.is_some(), true)
            && Graphics::from_settings(props).kind() == self.graphics.kind()
            && ram_end_addr(props) == self.ram_end
            && rf_complies(&self.ram_floppy1, props, PROP_RF1_PREFIX)
            && rf_complies(&self.ram_floppy2, props, PROP_RF2_PREFIX)
    }

    fn with_fdc<R>(&mut self, f: impl FnOnce(&mut Fdc8272, &mut dyn DriveSelector) -> R) -> Option<R> {
        let fdc = self.fdc.as_mut()?;
        let station = self.disk_station.as_ref()?;
        let mut guard = station.lock().ok()?;
        Some(f(fdc, &mut *guard))
    }

    /// Stall a CPU access to video or color RAM during the visible part of
    /// a line.
    fn video_access_wait(&mut self) {
        if self.line_num < VISIBLE_LINES
            && self.tstates_per_line > 0
            && self.tstates_visible > 0
            && self.line_tstates < self.tstates_visible
        {
            self.wait_states += self.tstates_visible - self.line_tstates;
        }
    }

    fn krt_bank_index(&self, offs: usize) -> Option<usize> {
        match &self.graphics {
            Graphics::Krt { bank, active: true, .. } => Some(bank * VIDEO_SIZE + offs),
            _ => None,
        }
    }

    fn mem_byte(&self, addr: u16) -> u8 {
        let a = addr as usize;
        if self.ram_4000_ext && (0x4000..0x8000).contains(&addr) {
            if let Some(ext) = &self.ram_ext {
                return ext[a - 0x4000];
            }
        }
        if self.boot_rom_enabled && (0xC000..0xE800).contains(&addr) {
            if let Some(rom) = &self.boot_rom {
                return rom.get(a - 0xC000).copied().unwrap_or(0xFF);
            }
        }
        if !self.ram_c000 && addr >= 0xC000 {
            if let Some(b) = self.rom_basic.as_ref().and_then(|r| r.get(a - 0xC000)) {
                return *b;
            }
        }
        if addr >= 0xF000 {
            if let Some(b) = self.os_rom.as_ref().and_then(|r| r.get(a - 0xF000)) {
                return *b;
            }
        }
        if (COLOR_ADDR..VIDEO_ADDR).contains(&addr) {
            if let Some(ram) = &self.ram_color {
                return ram[a - COLOR_ADDR as usize];
            }
        }
        if (VIDEO_ADDR..0xF000).contains(&addr) {
            let offs = a - VIDEO_ADDR as usize;
            return match (self.krt_bank_index(offs), &self.graphics) {
                (Some(idx), Graphics::Krt { pixels, .. }) => pixels.get(idx).copied().unwrap_or(0xFF),
                _ => self.ram_video[offs],
            };
        }
        if addr <= self.ram_end && (addr < 0xC000 || self.ram_c000) {
            return self.ram[a];
        }
        // printer module ROM only shows where no RAM answers
        if (0xB800..0xC000).contains(&addr) {
            if let Some(b) = self
                .printer_module
                .as_ref()
                .and_then(|m| m.rom.as_ref())
                .and_then(|r| r.get(a - 0xB800))
            {
                return *b;
            }
        }
        0xFF
    }

    fn set_mem_byte(&mut self, addr: u16, value: u8) -> bool {
        let a = addr as usize;
        if self.ram_4000_ext && (0x4000..0x8000).contains(&addr) {
            if let Some(ext) = &mut self.ram_ext {
                ext[a - 0x4000] = value;
                return true;
            }
        }
        let mut rv = false;
        if (COLOR_ADDR..VIDEO_ADDR).contains(&addr) {
            if let Some(ram) = &mut self.ram_color {
                ram[a - COLOR_ADDR as usize] = value;
                rv = true;
            }
        }
        if (VIDEO_ADDR..0xF000).contains(&addr) {
            let offs = a - VIDEO_ADDR as usize;
            match (self.krt_bank_index(offs), &mut self.graphics) {
                (Some(idx), Graphics::Krt { pixels, .. }) => {
                    if let Some(b) = pixels.get_mut(idx) {
                        *b = value;
                    }
                }
                _ => self.ram_video[offs] = value,
            }
            rv = true;
        } else if self.fdc.is_some() && addr >= 0xF800 {
            self.boot_rom_enabled = addr & 0x0400 == 0;
        } else if addr <= self.ram_end {
            // RAM at C000 is writable even while a ROM is visible there
            self.ram[a] = value;
            rv = true;
        }
        rv
    }

    fn is_video_addr(&self, addr: u16) -> bool {
        (VIDEO_ADDR..0xF000).contains(&addr)
            || (self.ram_color.is_some() && (COLOR_ADDR..VIDEO_ADDR).contains(&addr))
    }

    /// PIO 88 port A: bit 2 selects 20 rows, bits 3-5 the border color.
    fn update_screen_config(&mut self, value: u8) {
        let mode_20_rows = value & 0x04 != 0;
        if mode_20_rows != self.mode_20_rows {
            self.screen_resized = true;
        }
        self.mode_20_rows = mode_20_rows;
        self.border_color = (value >> 3) & 0x07;
    }

    fn put_keyboard_values(&mut self) {
        let col_out = self.pio90.fetch_out_value_port_a(false);
        self.pio90.put_in_value_port_b(self.keyboard.row_value(col_out), 0xFF);
        let row_out = self.pio90.fetch_out_value_port_b(false);
        self.pio90.put_in_value_port_a(self.keyboard.col_value(row_out), 0xFF);
    }

    fn set_ram_switch(&mut self, port: u8) {
        match port {
            4 => self.ram_4000_ext = false,
            5 => self.ram_4000_ext = self.ram_ext.is_some(),
            6 => self.ram_c000 = false,
            7 => self.ram_c000 = self.ram_ext.is_some(),
            _ => {}
        }
    }

    fn fdc_terminal_count(&mut self) {
        self.with_fdc(|fdc, sel| fdc.terminal_count(sel));
    }

    /// Additional register of the Robotron floppy module: TC on bit 4,
    /// reset on bit 5, both on the rising edge.
    fn write_fdc_control(&mut self, value: u8) {
        if self.fdc.is_none() {
            return;
        }
        let tc = value & 0x10 != 0;
        if tc && !self.fdc_tc {
            self.fdc_terminal_count();
        }
        let res = value & 0x20 != 0;
        if res && !self.fdc_reset {
            if let Some(fdc) = &mut self.fdc {
                fdc.reset();
            }
        }
        self.fdc_tc = tc;
        self.fdc_reset = res;
    }

    fn read_io_byte(&mut self, port: u16) -> u8 {
        let mut rv = 0xFF;
        let low = port as u8;
        match low {
            4..=7 => self.set_ram_switch(low),
            0x10 | 0x98 | 0x9A | 0x9C | 0x9E => {
                if let Some(fdc) = &self.fdc {
                    rv = fdc.read_main_status();
                }
            }
            0x11 | 0x99 | 0x9B | 0x9D | 0x9F => {
                if let Some(v) = self.with_fdc(|fdc, sel| fdc.read_data(sel)) {
                    rv = v;
                }
            }
            0x12 | 0x13 => self.fdc_terminal_count(),
            0x20 => {
                if let Some(rf) = &self.ram_floppy1 {
                    rv = rf.get_byte(self.rf1_addr | ((port as usize >> 8) & 0x7F));
                }
            }
            0x24 => {
                if let Some(rf) = &self.ram_floppy2 {
                    rv = rf.get_byte(self.rf2_addr | ((port as usize >> 8) & 0x7F));
                }
            }
            0x80..=0x87 => rv = self.ctc80.read((low & 3) as usize),
            0x88..=0x8F => {
                rv = match low & 3 {
                    0 => self.pio88.read_data_a(),
                    1 => self.pio88.read_data_b(),
                    2 => self.pio88.read_control_a(),
                    _ => self.pio88.read_control_b(),
                }
            }
            0x90..=0x97 => {
                rv = match low & 3 {
                    0 => self.pio90.read_data_a(),
                    1 => self.pio90.read_data_b(),
                    2 => self.pio90.read_control_a(),
                    _ => self.pio90.read_control_b(),
                }
            }
            0xA8..=0xAF => {
                if let Some(m) = &self.printer_module {
                    rv = m.ctc.read((low & 3) as usize);
                }
            }
            0xB0..=0xB7 => {
                if let Some(m) = &mut self.printer_module {
                    let ch = (low & 1) as usize;
                    rv = if low & 2 == 0 {
                        m.sio.read_data(ch)
                    } else {
                        m.sio.read_control(ch)
                    };
                }
            }
            0xB8 => match &self.graphics {
                Graphics::Robotron { bg, fg, border, active, .. } => {
                    rv = bg | (fg << 4);
                    if *active {
                        rv |= 0x08;
                    }
                    if *border {
                        rv |= 0x40;
                    }
                }
                Graphics::Krt { bank, active, .. } => {
                    rv = *bank as u8;
                    if *active {
                        rv |= 0x08;
                    }
                }
                Graphics::None => {}
            },
            0xBA => {
                if let Graphics::Robotron { pixels, addr_l, .. } = &self.graphics {
                    let addr = (port as usize & 0xFF00) | *addr_l as usize;
                    rv = pixels.get(addr).copied().unwrap_or(0xFF);
                }
            }
            _ => {}
        }
        rv
    }

    fn write_io_byte(&mut self, port: u16, value: u8) {
        let low = port as u8;
        match low {
            4..=7 => self.set_ram_switch(low),
            0x11 | 0x99 | 0x9B | 0x9D | 0x9F => {
                self.with_fdc(|fdc, sel| fdc.write_data(sel, value));
            }
            0x12 | 0x13 => self.fdc_terminal_count(),
            0x20 => {
                if let Some(rf) = &mut self.ram_floppy1 {
                    rf.set_byte(self.rf1_addr | ((port as usize >> 8) & 0x7F), value);
                }
            }
            0x21 => self.rf1_addr = rf_page_addr(port, value),
            0x24 => {
                if let Some(rf) = &mut self.ram_floppy2 {
                    rf.set_byte(self.rf2_addr | ((port as usize >> 8) & 0x7F), value);
                }
            }
            0x25 => self.rf2_addr = rf_page_addr(port, value),
            0x80..=0x87 => self.ctc80.write((low & 3) as usize, value),
            0x88..=0x8F => match low & 3 {
                0 => {
                    self.pio88.write_data_a(value);
                    let v = self.pio88.fetch_out_value_port_a(false);
                    self.update_screen_config(v);
                }
                1 => self.pio88.write_data_b(value),
                2 => self.pio88.write_control_a(value),
                _ => self.pio88.write_control_b(value),
            },
            0x90..=0x97 => {
                match low & 3 {
                    0 => self.pio90.write_data_a(value),
                    1 => self.pio90.write_data_b(value),
                    2 => self.pio90.write_control_a(value),
                    _ => self.pio90.write_control_b(value),
                }
                if low & 2 == 0 {
                    self.put_keyboard_values();
                }
            }
            0xA0..=0xA7 => self.write_fdc_control(value),
            0xA8..=0xAF => {
                if let Some(m) = &mut self.printer_module {
                    m.ctc.write((low & 3) as usize, value);
                }
            }
            0xB0..=0xB7 => {
                if let Some(m) = &mut self.printer_module {
                    let ch = (low & 1) as usize;
                    if low & 2 == 0 {
                        m.sio.write_data(ch, value);
                    } else {
                        m.sio.write_control(ch, value);
                    }
                }
            }
            0xB8 => match &mut self.graphics {
                Graphics::Robotron { bg, fg, border, active, .. } => {
                    *bg = value & 0x07;
                    *fg = (value >> 4) & 0x07;
                    *border = value & 0x80 != 0;
                    *active = value & 0x08 != 0;
                }
                Graphics::Krt { bank, active, .. } => {
                    *bank = (value & 0x07) as usize;
                    *active = value & 0x08 != 0;
                }
                Graphics::None => {}
            },
            0xB9 => {
                if let Graphics::Robotron { addr_l, .. } = &mut self.graphics {
                    *addr_l = value;
                }
            }
            0xBA => {
                if let Graphics::Robotron { pixels, addr_l, .. } = &mut self.graphics {
                    let addr = (port as usize & 0xFF00) | *addr_l as usize;
                    if let Some(b) = pixels.get_mut(addr) {
                        *b = value;
                    }
                }
            }
            _ => {}
        }
    }

    /// Feed the next paste character once the OS has taken the last one.
    fn feed_paste(&mut self) {
        if self.paste_queue.is_empty() || self.debug_mem(MEM_KEY_NEW) != 0 {
            return;
        }
        if let Some(ch) = self.paste_queue.pop_front() {
            self.set_mem_byte(MEM_KEY_CHAR, ch);
            self.set_mem_byte(MEM_KEY_NEW, ch);
        }
    }

    /// Daisy chain in priority order: keyboard PIO, PIO 88, CTC, then the
    /// printer module.
    fn interrupt_chain(&mut self) -> Vec<&mut dyn InterruptSource> {
        let mut chain: Vec<&mut dyn InterruptSource> = Vec::with_capacity(5);
        chain.push(&mut self.pio90);
        chain.push(&mut self.pio88);
        chain.push(&mut self.ctc80);
        if let Some(m) = &mut self.printer_module {
            chain.push(&mut m.ctc);
            chain.push(&mut m.sio);
        }
        chain
    }

    fn advance_line(&mut self, tstates: u32) {
        if self.tstates_per_line == 0 {
            return;
        }
        self.line_tstates += tstates;
        if self.line_tstates >= self.tstates_per_line {
            self.line_num = (self.line_num + self.line_tstates / self.tstates_per_line) % LINES_PER_FRAME;
            self.line_tstates %= self.tstates_per_line;
        }
    }
}

impl Machine for Z9001 {
    fn read_mem(&mut self, addr: u16) -> u8 {
        if self.is_video_addr(addr) {
            self.video_access_wait();
        }
        self.mem_byte(addr)
    }

    fn debug_mem(&self, addr: u16) -> u8 {
        self.mem_byte(addr)
    }

    fn write_mem(&mut self, addr: u16, value: u8) {
        if self.is_video_addr(addr) {
            self.video_access_wait();
        }
        self.set_mem_byte(addr, value);
    }

    fn read_io(&mut self, port: u16) -> u8 {
        self.read_io_byte(port)
    }

    fn write_io(&mut self, port: u16, value: u8) {
        self.write_io_byte(port, value);
    }

    fn tick(&mut self, tstates: u32) {
        let zc = self.ctc80.system_update(tstates);
        if zc[2] > 0 {
            // output 2 is wired to input 3
            self.ctc80.external_update(3, zc[2]);
        }
        if let Some(m) = &mut self.printer_module {
            m.ctc.system_update(tstates);
            for b in m.sio.take_transmitted(0) {
                self.printer.print(b);
            }
        }
        self.advance_line(tstates);
        self.blink_tstates += tstates;
        if self.blink_tstates >= DEFAULT_SPEED_KHZ * BLINK_MILLIS {
            self.blink_tstates = 0;
            self.color_swap = !self.color_swap;
        }
        if self.paste_fast {
            self.feed_paste();
        }
        if let Some(station) = &self.disk_station {
            self.disk_tstates += tstates;
            if self.disk_tstates >= DISK_TICK_TSTATES {
                self.disk_tstates = 0;
                if let Ok(mut station) = station.lock() {
                    station.tick();
                }
            }
        }
    }

    fn take_wait_states(&mut self) -> u32 {
        std::mem::take(&mut self.wait_states)
    }

    fn interrupt_pending(&self) -> bool {
        let mut chain: Vec<&dyn InterruptSource> = Vec::with_capacity(5);
        chain.push(&self.pio90);
        chain.push(&self.pio88);
        chain.push(&self.ctc80);
        if let Some(m) = &self.printer_module {
            chain.push(&m.ctc);
            chain.push(&m.sio);
        }
        interrupt_pending(&chain)
    }

    fn interrupt_ack(&mut self) -> u8 {
        accept_interrupt(&mut self.interrupt_chain()).unwrap_or(0xFF)
    }

    fn reti(&mut self) {
        finish_interrupt(&mut self.interrupt_chain());
    }

    fn reset(&mut self, level: ResetLevel) {
        let power_on = level == ResetLevel::PowerOn;
        if power_on {
            fill_random(&mut self.ram);
            if let Some(ext) = &mut self.ram_ext {
                fill_random(ext);
            }
            if self.fdc.is_some() {
                // DRAM pattern after power on; all zero would keep the boot
                // ROM from activating the ROM module
                for (i, b) in self.ram[..0x4000].iter_mut().enumerate() {
                    *b = if i & 1 != 0 { 0x00 } else { 0xFF };
                }
            }
            fill_random(&mut self.ram_video);
            if let Some(ram) = &mut self.ram_color {
                fill_random(ram);
            }
        }
        self.graphics.reset(power_on);
        let hard = matches!(level, ResetLevel::PowerOn | ResetLevel::Cold);
        self.ctc80.reset(hard);
        self.pio88.reset(hard);
        self.pio90.reset(hard);
        if let Some(m) = &mut self.printer_module {
            m.ctc.reset(hard);
            m.sio.reset();
        }
        if let Some(fdc) = &mut self.fdc {
            fdc.reset();
        }
        if let Some(station) = &self.disk_station {
            if let Ok(mut station) = station.lock() {
                station.reset_drives();
            }
        }
        self.keyboard.clear();
        self.paste_queue.clear();
        self.rf1_addr = 0;
        self.rf2_addr = 0;
        self.fdc_tc = false;
        self.fdc_reset = false;
        self.ram_4000_ext = false;
        self.ram_c000 = false;
        self.boot_rom_enabled = self.fdc.is_some();
        self.blink_tstates = 0;
        self.color_swap = false;
        self.line_num = 0;
        self.line_tstates = 0;
        self.wait_states = 0;
        self.update_screen_config(0);
    }

    fn reset_start_address(&self) -> u16 {
        0xF000
    }

    fn default_speed_khz(&self) -> u32 {
        DEFAULT_SPEED_KHZ
    }

    fn pc_intercepts(&self) -> PcIntercepts<Self> {
        self.intercepts.clone()
    }
}

impl KcSystem for Z9001 {
    fn title(&self) -> &str {
        &self.sys_name
    }

    fn screen_size(&self) -> (usize, usize) {
        (COLUMNS, if self.mode_20_rows { 20 } else { 24 })
    }

    fn screen_char(&self, col: usize, row: usize) -> Option<char> {
        let (cols, rows) = self.screen_size();
        if self.graphics.is_active() || col >= cols || row >= rows {
            return None;
        }
        match self.ram_video[row * COLUMNS + col] {
            b @ 0x20..=0x7E => Some(b as char),
            _ => None,
        }
    }

    /// Letters arrive with swapped case: the OS works in upper case.
    fn key_typed(&mut self, ch: char) -> bool {
        let ch = if ch.is_ascii_lowercase() {
            ch.to_ascii_uppercase()
        } else {
            ch.to_ascii_lowercase()
        };
        let rv = self.keyboard.set_key_char(ch);
        if rv {
            self.put_keyboard_values();
        }
        rv
    }

    fn key_pressed(&mut self, key: SpecialKey, shift: bool) -> bool {
        let rv = self.keyboard.set_special_key(key, shift);
        if rv {
            self.put_keyboard_values();
        }
        rv
    }

    fn key_released(&mut self) {
        self.keyboard.clear();
        self.put_keyboard_values();
    }

    fn paste(&mut self, text: &str) -> bool {
        if !self.paste_fast {
            return false;
        }
        self.paste_queue.extend(text.chars().filter_map(|ch| match ch {
            '\n' => Some(b'\r'),
            c if (c as u32) > 0 && (c as u32) <= 0xFF => Some(c as u8),
            _ => None,
        }));
        true
    }

    fn apply_settings(&mut self, props: &Properties) -> bool {
        if !self.complies(props) {
            return false;
        }
        self.register_intercepts(props);
        if let Some(station) = &self.disk_station {
            if let Ok(mut station) = station.lock() {
                station.apply_settings(props);
            }
        }
        self.props = props.clone();
        true
    }

    fn set_printer(&mut self, printer: Box<dyn PrintSink>) {
        self.printer = printer;
    }

    fn take_screen_resized(&mut self) -> bool {
        std::mem::take(&mut self.screen_resized)
    }

    fn disk_station(&self) -> Option<SharedDiskStation> {
        self.disk_station.clone()
    }
}
