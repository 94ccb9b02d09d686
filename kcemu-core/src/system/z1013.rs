//! Z1013 home computer.
//!
//! # Memory map
//!
//! | Range       | Content                                                  |
//! |-------------|----------------------------------------------------------|
//! | 0000-03FF   | static RAM (Z1013.12 only)                               |
//! | 0000-RAMEND | dynamic RAM, 16K or 64K                                  |
//! | C000-EBFF   | KC-BASIC module ROM, or Mega-ROM windows C000-E7FF       |
//! | EC00-EFFF   | video RAM, or a pixel RAM bank in graphics mode          |
//! | F000-FFFF   | monitor ROM unless disabled through port 4               |
//!
//! # I/O ports (low address byte)
//!
//! | Port       | Device                                                   |
//! |------------|----------------------------------------------------------|
//! | 04         | mode register: ROM off, alt font, 4 MHz, 64x16           |
//! | 18/19      | CCJ 80 column card                                       |
//! | 4x, 8x     | I/O extension window (hard disk)                         |
//! | 5x, 9x     | RAM floppy 2 (58-5F) and 1 (98-9F)                       |
//! | 7x         | real-time clock                                          |
//! | Cx, DC-DF  | I/O extension windows (network, USB)                     |
//! | F0/F1      | FDC status/data, F8 terminal count, FA FDC reset         |
//! | FF         | Mega-ROM segment                                         |
//! | xxx000xx   | keyboard/user port PIO (A5 and up ignored)               |
//! | xxx010xx   | keyboard column, pixel graphics bank                     |
//! | xxx011xx   | pixel graphics on, xxx100xx off                          |

use std::collections::VecDeque;
use std::sync::Arc;

use z80emu::{CpuFlags, StkReg16};

use super::{
    fill_random, read_rom_file, rom_byte, KcSystem, DISK_TICK_TSTATES, JOY_BUTTONS, JOY_DOWN,
    JOY_LEFT, JOY_RIGHT, JOY_UP, PROP_CATCH_PRINT_CALLS, PROP_FDC_ENABLED, PROP_OS_FILE,
    PROP_PASTE_FAST, PROP_RELOAD_ROMS, PROP_RF1_PREFIX, PROP_RF2_PREFIX, PROP_RTC_ENABLED,
    PROP_SYSNAME,
};
use crate::config::Properties;
use crate::devices::ccj;
use crate::devices::{
    accept_interrupt, finish_interrupt, interrupt_pending, ExtensionSlot, GraphicCcj, PioMode,
    RamFloppy, RamFloppyType, Rtc72421, SpecialKey, Z1013Keyboard, Z80Pio,
};
use crate::disk::station::{DiskStation, SharedDiskStation};
use crate::disk::{DriveSelector, FloppyDiskFormat, FloppyDiskInfo, FMT_780K};
use crate::emulator::{CpuAccess, Machine, PcHandler, PcIntercepts, ResetLevel};
use crate::fdc::Fdc8272;
use crate::printer::{NullPrinter, PrintSink};
use crate::resources::RomResources;

pub const PROP_PREFIX: &str = "jkcemu.z1013.";
pub const PROP_MONITOR: &str = "monitor";
pub const PROP_USERPORT: &str = "userport";
pub const PROP_CATCH_JOY_CALLS: &str = "catch_joystick_calls";
pub const PROP_GRAPHIC_ENABLED: &str = "graphic.enabled";
pub const PROP_GCCJ_ENABLED: &str = "graphic_ccj.enabled";
pub const PROP_ROMBASIC_ENABLED: &str = "rom_basic.enabled";
pub const PROP_ROMBASIC_FILE: &str = "rom_basic.file";
pub const PROP_ROMMEGA_ENABLED: &str = "rom_mega.enabled";
pub const PROP_ROMMEGA_FILE: &str = "rom_mega.file";

pub const SYSNAME_Z1013_01: &str = "Z1013.01";
pub const SYSNAME_Z1013_12: &str = "Z1013.12";
pub const SYSNAME_Z1013_16: &str = "Z1013.16";
pub const SYSNAME_Z1013_64: &str = "Z1013.64";

/// Argument cell of the monitor's logical printer driver.
pub const MEM_ARG1: u16 = 0x001B;

const VIDEO_ADDR: u16 = 0xEC00;
const VIDEO_SIZE: usize = 0x400;
const PIXEL_BANKS: usize = 8;
const MEGA_WINDOW: usize = 0x800;
const MEGA_SEGMENTS: usize = 256;

/// T-states until the Centronics printer acknowledges a byte (10 ms at
/// 2 MHz).
const CENTRONICS_ACK_TSTATES: i32 = 20_000;

pub const AVAILABLE_DISKS: [FloppyDiskInfo; 2] = [
    FloppyDiskInfo {
        resource: "/disks/z1013/z1013cpm64x16.dump.gz",
        text: "Z1013 CP/M boot disk (64x16 characters)",
        sys_tracks: 2,
        block_size: 2048,
        block_num_16bit: true,
    },
    FloppyDiskInfo {
        resource: "/disks/z1013/z1013cpm80x25.dump.gz",
        text: "Z1013 CP/M boot disk (80x25 characters)",
        sys_tracks: 2,
        block_size: 2048,
        block_num_16bit: true,
    },
];

pub const DEFAULT_DISK_FORMAT: FloppyDiskFormat = FMT_780K;

/// Monitor program in the F000 ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monitor {
    Mon202,
    A2,
    RbK7659,
    RbS6009,
    IncomK7669,
    Jm1992,
    Bl4K7659,
}

impl Monitor {
    pub fn from_settings(props: &Properties) -> Self {
        match props.get_str(&key(PROP_MONITOR)) {
            Some("A.2") => Monitor::A2,
            Some("RB_K7659") => Monitor::RbK7659,
            Some("RB_S6009") => Monitor::RbS6009,
            Some("INCOM_K7669") => Monitor::IncomK7669,
            Some("JM_1992") => Monitor::Jm1992,
            Some("BL4_K7659") => Monitor::Bl4K7659,
            _ => Monitor::Mon202,
        }
    }

    pub fn resource(self) -> &'static str {
        match self {
            Monitor::Mon202 => "/rom/z1013/mon_202.bin",
            Monitor::A2 => "/rom/z1013/mon_a2.bin",
            Monitor::RbK7659 => "/rom/z1013/mon_rb_k7659.bin",
            Monitor::RbS6009 => "/rom/z1013/mon_rb_s6009.bin",
            Monitor::IncomK7669 => "/rom/z1013/mon_incom_k7669.bin",
            Monitor::Jm1992 => "/rom/z1013/mon_jm_1992.bin",
            Monitor::Bl4K7659 => "/rom/z1013/bl4_k7659.bin",
        }
    }

    /// Keyboard input routine replaced by fast paste.
    pub fn paste_address(self) -> u16 {
        match self {
            Monitor::A2 => 0xF119,
            Monitor::Jm1992 => 0xF25A,
            _ => 0xF130,
        }
    }
}

/// Hardware on the user port (PIO port A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserPort {
    None,
    JoystickJuTe0687,
    JoystickPractic0487,
    JoystickPractic0188,
    /// 7 bit Centronics, BUSY on bit 7.
    Centronics7Practic0289,
    /// 8 bit Centronics, acknowledged by strobe.
    Centronics8Fa1090,
}

impl UserPort {
    pub fn from_settings(props: &Properties) -> Self {
        match props.get_str(&key(PROP_USERPORT)) {
            Some("joystick:jute0687") => UserPort::JoystickJuTe0687,
            Some("joystick:practic0487") => UserPort::JoystickPractic0487,
            Some("joystick:practic0188") => UserPort::JoystickPractic0188,
            Some("centronics7:practic0289") => UserPort::Centronics7Practic0289,
            Some("centronics8:fa1090") => UserPort::Centronics8Fa1090,
            _ => UserPort::None,
        }
    }

    fn is_centronics(self) -> bool {
        matches!(self, UserPort::Centronics7Practic0289 | UserPort::Centronics8Fa1090)
    }
}

/// Graphics hardware beside the standard 32x32 video RAM.
#[derive(Debug, Clone)]
pub enum GraphicsCard {
    None,
    /// Eight 1K pixel RAM banks overlaying the video RAM.
    Pixel { banks: Vec<Vec<u8>>, bank: usize, active: bool },
    /// 80 column card; `last_written` tracks a sequential EC00-EFFF write.
    Ccj { card: GraphicCcj, active: bool, last_written: Option<u16> },
}

impl GraphicsCard {
    fn from_settings(props: &Properties) -> Self {
        let ccj = props.get_bool(&key(PROP_GCCJ_ENABLED), false);
        let pixel = props.get_bool(&key(PROP_GRAPHIC_ENABLED), false);
        if ccj {
            if pixel {
                log::warn!("Z1013: CCJ card and pixel graphics configured, using the CCJ card");
            }
            GraphicsCard::Ccj {
                card: GraphicCcj::new(),
                active: false,
                last_written: None,
            }
        } else if pixel {
            GraphicsCard::Pixel {
                banks: vec![vec![0; VIDEO_SIZE]; PIXEL_BANKS],
                bank: 0,
                active: false,
            }
        } else {
            GraphicsCard::None
        }
    }

    fn kind(&self) -> u8 {
        match self {
            GraphicsCard::None => 0,
            GraphicsCard::Pixel { .. } => 1,
            GraphicsCard::Ccj { .. } => 2,
        }
    }
}

type Intercept = fn(&mut Z1013, &mut CpuAccess<'_>) -> bool;

fn handler(f: Intercept) -> PcHandler<Z1013> {
    Arc::new(f)
}

fn key(name: &str) -> String {
    format!("{}{}", PROP_PREFIX, name)
}

fn sys_name(props: &Properties) -> String {
    props.get_str(PROP_SYSNAME).unwrap_or(SYSNAME_Z1013_64).to_string()
}

/// Highest dynamic RAM address of the model.
pub fn ram_end_addr(props: &Properties) -> u16 {
    match sys_name(props).as_str() {
        SYSNAME_Z1013_01 | SYSNAME_Z1013_16 => 0x3FFF,
        SYSNAME_Z1013_12 => 0x03FF,
        _ => 0xFFFF,
    }
}

pub fn default_speed_khz(props: &Properties) -> u32 {
    if sys_name(props).starts_with(SYSNAME_Z1013_01) {
        1000
    } else {
        2000
    }
}

fn rf_prefix(rf: &str) -> String {
    format!("{}{}", PROP_PREFIX, rf)
}

fn ram_floppy_from_settings(props: &Properties, rf: &str) -> Option<RamFloppy> {
    let prefix = rf_prefix(rf);
    props
        .get_bool(&format!("{}enabled", prefix), false)
        .then(|| RamFloppy::from_settings(RamFloppyType::Mp3_1988, props, &prefix))
}

pub struct Z1013 {
    props: Properties,
    resources: Arc<RomResources>,
    sys_name: String,
    monitor: Monitor,
    os_rom: Option<Arc<[u8]>>,
    rom_basic: Option<Arc<[u8]>>,
    rom_mega: Option<Arc<[u8]>>,
    mega_seg: usize,
    ram: Vec<u8>,
    ram_end: u16,
    ram_static: Option<Vec<u8>>,
    ram_video: Vec<u8>,
    graphics: GraphicsCard,
    pio: Z80Pio,
    keyboard: Z1013Keyboard,
    user_port: UserPort,
    joy_actions: [u8; 2],
    centronics_ack: i32,
    fdc: Option<Fdc8272>,
    disk_station: Option<SharedDiskStation>,
    disk_tstates: u32,
    rtc: Option<Rtc72421>,
    ram_floppy1: Option<RamFloppy>,
    ram_floppy2: Option<RamFloppy>,
    extensions: Vec<ExtensionSlot>,
    printer: Box<dyn PrintSink>,
    intercepts: PcIntercepts<Z1013>,
    paste_fast: bool,
    paste_queue: VecDeque<u8>,
    rom_disabled: bool,
    alt_font: bool,
    mode_64x16: bool,
    mode_4mhz: bool,
    speed_khz: u32,
    speed_request: Option<u32>,
    screen_resized: bool,
}

impl Z1013 {
    pub fn new(props: &Properties, resources: Arc<RomResources>) -> Self {
        let ram_end = ram_end_addr(props);
        let disk_station = props.get_bool(&key(PROP_FDC_ENABLED), false).then(|| {
            let mut station = DiskStation::new(4, Some(Arc::clone(&resources)));
            station.set_system_disks(&AVAILABLE_DISKS, DEFAULT_DISK_FORMAT);
            station.apply_settings(props);
            station.shared()
        });
        let mut sys = Self {
            props: props.clone(),
            resources,
            sys_name: sys_name(props),
            monitor: Monitor::from_settings(props),
            os_rom: None,
            rom_basic: None,
            rom_mega: None,
            mega_seg: 0,
            ram: vec![0; 0x10000],
            ram_end,
            ram_static: (ram_end == 0x03FF).then(|| vec![0; 0x400]),
            ram_video: vec![0x20; VIDEO_SIZE],
            graphics: GraphicsCard::from_settings(props),
            pio: Z80Pio::new(),
            keyboard: Z1013Keyboard::new(),
            user_port: UserPort::None,
            joy_actions: [0; 2],
            centronics_ack: 0,
            fdc: disk_station.as_ref().map(|_| Fdc8272::new()),
            disk_station,
            disk_tstates: 0,
            rtc: props.get_bool(&key(PROP_RTC_ENABLED), false).then(Rtc72421::new),
            ram_floppy1: ram_floppy_from_settings(props, PROP_RF1_PREFIX),
            ram_floppy2: ram_floppy_from_settings(props, PROP_RF2_PREFIX),
            extensions: Vec::new(),
            printer: Box::new(NullPrinter),
            intercepts: PcIntercepts::new(),
            paste_fast: true,
            paste_queue: VecDeque::new(),
            rom_disabled: false,
            alt_font: false,
            mode_64x16: false,
            mode_4mhz: false,
            speed_khz: default_speed_khz(props),
            speed_request: None,
            screen_resized: false,
        };
        sys.apply_user_port(props);
        sys.register_intercepts(props);
        if !props.get_bool(&key(PROP_RELOAD_ROMS), false) {
            sys.load_roms(props);
        }
        sys
    }

    fn load_roms(&mut self, props: &Properties) {
        self.monitor = Monitor::from_settings(props);
        self.os_rom =
            self.resources
                .rom_from_settings(props, &key(PROP_OS_FILE), self.monitor.resource());
        self.rom_basic = None;
        self.rom_mega = None;
        if props.get_bool(&key(PROP_ROMBASIC_ENABLED), false) {
            self.rom_basic = self.resources.rom_from_settings(
                props,
                &key(PROP_ROMBASIC_FILE),
                "/rom/z1013/kcbasic.bin",
            );
        } else if props.get_bool(&key(PROP_ROMMEGA_ENABLED), false) {
            self.rom_mega = read_rom_file(props, &key(PROP_ROMMEGA_FILE));
            if self.rom_mega.is_none() {
                // module plugged in but empty
                self.rom_mega = Some(Arc::from(Vec::new()));
            }
        }
    }

    fn apply_user_port(&mut self, props: &Properties) {
        self.user_port = UserPort::from_settings(props);
        if self.user_port == UserPort::Centronics7Practic0289 {
            // printer ready
            self.pio.put_in_value_port_a(0, 0x80);
        }
    }

    fn register_intercepts(&mut self, props: &Properties) {
        self.paste_fast = props.get_bool(&key(PROP_PASTE_FAST), true);
        let mut entries: Vec<(u16, PcHandler<Self>)> = Vec::new();
        if self.paste_fast {
            let addr = Monitor::from_settings(props).paste_address();
            entries.push((addr, handler(Self::pc_paste_char)));
        }
        if props.get_bool(&key(PROP_CATCH_PRINT_CALLS), true) {
            entries.push((0xFFCA, handler(Self::pc_print_a)));
            entries.push((0xFFCD, handler(Self::pc_printer_reset)));
            entries.push((0xFFDF, handler(Self::pc_print_arg1)));
            entries.push((0xFFE5, handler(Self::pc_print_screen)));
            entries.push((0xFFE8, handler(Self::pc_print_a)));
            entries.push((0xFFEB, handler(Self::pc_printer_reset)));
        }
        if props.get_bool(&key(PROP_CATCH_JOY_CALLS), true) {
            entries.push((0xFFBB, handler(Self::pc_joystick)));
        }
        self.intercepts.replace(entries);
    }

    fn pc_paste_char(&mut self, cpu: &mut CpuAccess<'_>) -> bool {
        if !self.paste_fast {
            return false;
        }
        match self.paste_queue.pop_front() {
            Some(ch) => {
                cpu.set_a(ch);
                true
            }
            None => false,
        }
    }

    /// Joystick query: B = joystick 1, C = joystick 0.
    fn pc_joystick(&mut self, cpu: &mut CpuAccess<'_>) -> bool {
        let bits = |m: u8| {
            let mut v = 0u16;
            for (mask, bit) in [
                (JOY_LEFT, 0x01),
                (JOY_RIGHT, 0x02),
                (JOY_DOWN, 0x04),
                (JOY_UP, 0x08),
                (JOY_BUTTONS, 0x10),
            ] {
                if m & mask != 0 {
                    v |= bit;
                }
            }
            v
        };
        let bc = (bits(self.joy_actions[1]) << 8) | bits(self.joy_actions[0]);
        cpu.set_reg16(StkReg16::BC, bc);
        cpu.set_flag(CpuFlags::Z, bc == 0);
        cpu.set_flag(CpuFlags::C, false);
        true
    }

    fn pc_print_a(&mut self, cpu: &mut CpuAccess<'_>) -> bool {
        self.printer.print(cpu.a());
        true
    }

    fn pc_print_arg1(&mut self, _cpu: &mut CpuAccess<'_>) -> bool {
        let b = self.debug_mem(MEM_ARG1);
        self.printer.print(b);
        true
    }

    fn pc_printer_reset(&mut self, _cpu: &mut CpuAccess<'_>) -> bool {
        self.printer.reset();
        true
    }

    /// Hardcopy of the 32x32 screen.
    fn pc_print_screen(&mut self, _cpu: &mut CpuAccess<'_>) -> bool {
        let mut addr = VIDEO_ADDR;
        for _ in 0..32 {
            for _ in 0..32 {
                let b = self.debug_mem(addr);
                self.printer.print(b);
                addr = addr.wrapping_add(1);
            }
            self.printer.print(b'\r');
            self.printer.print(b'\n');
        }
        true
    }

    pub fn monitor(&self) -> Monitor {
        self.monitor
    }

    pub fn user_port(&self) -> UserPort {
        self.user_port
    }

    pub fn graphics(&self) -> &GraphicsCard {
        &self.graphics
    }

    pub fn pio(&self) -> &Z80Pio {
        &self.pio
    }

    pub fn keyboard(&self) -> &Z1013Keyboard {
        &self.keyboard
    }

    pub fn is_rom_disabled(&self) -> bool {
        self.rom_disabled
    }

    pub fn is_mode_64x16(&self) -> bool {
        self.mode_64x16
    }

    pub fn is_mode_4mhz(&self) -> bool {
        self.mode_4mhz
    }

    pub fn mega_rom_segment(&self) -> usize {
        self.mega_seg
    }

    pub fn ram_floppy1(&self) -> Option<&RamFloppy> {
        self.ram_floppy1.as_ref()
    }

    pub fn ram_floppy2(&self) -> Option<&RamFloppy> {
        self.ram_floppy2.as_ref()
    }

    /// Plug an I/O card (hard disk at 4x/8x, network at Cx, USB at DC).
    pub fn plug_extension(&mut self, slot: ExtensionSlot) {
        log::info!("Z1013: {:?} plugged in", slot);
        self.extensions.push(slot);
    }

    /// Save changed RAM floppy contents to their files.
    pub fn flush(&mut self) {
        for rf in [&mut self.ram_floppy1, &mut self.ram_floppy2].into_iter().flatten() {
            if let Err(e) = rf.flush() {
                log::error!("Z1013: {}", e);
            }
        }
    }

    fn complies(&self, props: &Properties) -> bool {
        let same_flag = |k: &str, current: bool| props.get_bool(&key(k), false) == current;
        sys_name(props) == self.sys_name
            && Monitor::from_settings(props) == self.monitor
            && props.get_str(&key(PROP_OS_FILE)) == self.props.get_str(&key(PROP_OS_FILE))
            && ram_end_addr(props) == self.ram_end
            && same_flag(PROP_ROMBASIC_ENABLED, self.rom_basic.is_some())
            && props.get_str(&key(PROP_ROMBASIC_FILE))
                == self.props.get_str(&key(PROP_ROMBASIC_FILE))
            && same_flag(PROP_ROMMEGA_ENABLED, self.rom_mega.is_some())
            && props.get_str(&key(PROP_ROMMEGA_FILE))
                == self.props.get_str(&key(PROP_ROMMEGA_FILE))
            && same_flag(PROP_FDC_ENABLED, self.fdc.is_some())
            && same_flag(PROP_RTC_ENABLED, self.rtc.is_some())
            && GraphicsCard::from_settings(props).kind() == self.graphics.kind()
            && rf_complies(&self.ram_floppy1, props, PROP_RF1_PREFIX)
            && rf_complies(&self.ram_floppy2, props, PROP_RF2_PREFIX)
    }

    /// A0 is wired to PIO B5.
    fn address_changed(&mut self, addr: u16) {
        self.pio.put_in_value_port_b(((addr << 5) & 0x20) as u8, 0x20);
    }

    fn with_fdc<R>(&mut self, f: impl FnOnce(&mut Fdc8272, &mut dyn DriveSelector) -> R) -> Option<R> {
        let fdc = self.fdc.as_mut()?;
        let station = self.disk_station.as_ref()?;
        let mut guard = station.lock().ok()?;
        Some(f(fdc, &mut *guard))
    }

    /// Extension port windows only decode with a card plugged in;
    /// otherwise the PIO and keyboard mirrors answer.
    fn extension_window(&self, port: u8) -> bool {
        (matches!(port & 0xF0, 0x40 | 0x80 | 0xC0) || port & 0xFC == 0xDC)
            && self.extensions.iter().any(|s| s.matches(port as u16))
    }

    fn read_extension(&mut self, port: u16) -> Option<u8> {
        self.extensions.iter_mut().find_map(|s| s.read(port))
    }

    fn write_extension(&mut self, port: u16, value: u8) -> bool {
        self.extensions.iter_mut().any(|s| s.write(port, value))
    }

    /// Video RAM or the selected pixel bank.
    fn video_bank(&self) -> &[u8] {
        match &self.graphics {
            GraphicsCard::Pixel { banks, bank, active: true } => &banks[*bank],
            _ => &self.ram_video,
        }
    }

    fn video_bank_mut(&mut self) -> &mut [u8] {
        match &mut self.graphics {
            GraphicsCard::Pixel { banks, bank, active: true } => &mut banks[*bank],
            _ => &mut self.ram_video,
        }
    }

    fn set_pixel_mode(&mut self, on: bool) {
        if let GraphicsCard::Pixel { active, .. } = &mut self.graphics {
            *active = on;
        }
    }

    fn mem_byte(&self, addr: u16) -> u8 {
        let a = addr as usize;
        if (0xC000..0xEC00).contains(&addr) {
            if let Some(rom) = &self.rom_basic {
                if let Some(&b) = rom.get(a - 0xC000) {
                    return b;
                }
            } else if let (Some(rom), true) = (&self.rom_mega, addr < 0xE800) {
                let win = (a - 0xC000) / MEGA_WINDOW;
                let idx = (a - 0xC000) % MEGA_WINDOW + (win * MEGA_SEGMENTS + self.mega_seg) * MEGA_WINDOW;
                return rom.get(idx).copied().unwrap_or(0xFF);
            }
        } else if addr >= VIDEO_ADDR && a < VIDEO_ADDR as usize + VIDEO_SIZE {
            return self.video_bank()[a - VIDEO_ADDR as usize];
        } else if addr >= 0xF000 && !self.rom_disabled {
            if let Some(b) = rom_byte(self.os_rom.as_ref(), a - 0xF000) {
                return b;
            }
        }
        if let Some(sram) = &self.ram_static {
            if let Some(&b) = sram.get(a) {
                return b;
            }
        }
        if addr <= self.ram_end {
            self.ram[a]
        } else {
            0xFF
        }
    }

    fn set_mem_byte(&mut self, addr: u16, value: u8) {
        let a = addr as usize;
        if addr >= VIDEO_ADDR && a < VIDEO_ADDR as usize + VIDEO_SIZE {
            self.video_bank_mut()[a - VIDEO_ADDR as usize] = value;
            return;
        }
        // writes to the module ROMs reach the RAM below
        if addr >= 0xF000 && !self.rom_disabled {
            if let Some(rom) = &self.os_rom {
                if a < 0xF000 + rom.len() {
                    return;
                }
            }
        }
        if let Some(sram) = &mut self.ram_static {
            if let Some(b) = sram.get_mut(a) {
                *b = value;
                return;
            }
        }
        if addr <= self.ram_end {
            self.ram[a] = value;
        }
    }

    /// Writing EC00..EFFF in ascending order switches back from the CCJ
    /// card to the standard screen.
    fn check_ccj_deactivation(&mut self, addr: u16) {
        let GraphicsCard::Ccj { active, last_written, .. } = &mut self.graphics else {
            return;
        };
        if !*active || !(VIDEO_ADDR..0xF000).contains(&addr) {
            return;
        }
        let follows = last_written.map(|l| l.wrapping_add(1) == addr).unwrap_or(false);
        if addr == VIDEO_ADDR || (addr > VIDEO_ADDR && addr < 0xEFFF && follows) {
            *last_written = Some(addr);
        } else if addr == 0xEFFF && follows {
            *active = false;
            *last_written = None;
            self.screen_resized = true;
        } else {
            *last_written = None;
        }
    }

    fn request_speed(&mut self, khz: u32) {
        self.speed_khz = khz;
        self.speed_request = Some(khz);
    }

    fn write_mode_register(&mut self, value: u8) {
        let old_64x16 = self.mode_64x16;
        self.rom_disabled = value & 0x10 != 0;
        self.alt_font = value & 0x20 != 0;
        self.mode_64x16 = value & 0x80 != 0;
        if value & 0x40 != 0 {
            if !self.mode_4mhz && self.speed_khz == 2000 {
                self.request_speed(4000);
                self.mode_4mhz = true;
            }
        } else {
            if self.mode_4mhz && self.speed_khz == 4000 {
                self.request_speed(2000);
            }
            self.mode_4mhz = false;
        }
        if self.mode_64x16 != old_64x16 {
            self.screen_resized = true;
        }
    }

    fn put_joystick_values(&mut self) {
        let [joy0, joy1] = self.joy_actions;
        match self.user_port {
            UserPort::JoystickJuTe0687 => {
                let mut value = 0xF1u8;
                if joy0 & JOY_BUTTONS != 0 {
                    value ^= 0xF0;
                } else {
                    for (mask, bit) in [(JOY_LEFT, 0x20), (JOY_RIGHT, 0x40), (JOY_UP, 0x80), (JOY_DOWN, 0x10)] {
                        if joy0 & mask != 0 {
                            value ^= bit;
                        }
                    }
                }
                self.pio.put_in_value_port_a(value, 0xFF);
            }
            UserPort::JoystickPractic0487 => {
                let mut value = 0u8;
                if joy0 & JOY_BUTTONS != 0 {
                    value |= 0xF0;
                } else {
                    for (mask, bit) in [(JOY_LEFT, 0x20), (JOY_RIGHT, 0x80), (JOY_UP, 0x10), (JOY_DOWN, 0x40)] {
                        if joy0 & mask != 0 {
                            value |= bit;
                        }
                    }
                }
                if joy1 & JOY_BUTTONS != 0 {
                    value |= 0x0F;
                } else {
                    for (mask, bit) in [(JOY_LEFT, 0x02), (JOY_RIGHT, 0x08), (JOY_UP, 0x01), (JOY_DOWN, 0x04)] {
                        if joy1 & mask != 0 {
                            value |= bit;
                        }
                    }
                }
                self.pio.put_in_value_port_a(!value, 0xFF);
            }
            UserPort::JoystickPractic0188 => {
                let select = !self.pio.fetch_out_value_port_a(false);
                let mut actions = 0;
                if select & 0x20 != 0 {
                    actions |= joy0;
                }
                if select & 0x40 != 0 {
                    actions |= joy1;
                }
                let mut value = 0xFFu8;
                for (mask, bit) in [
                    (JOY_LEFT, 0x01),
                    (JOY_RIGHT, 0x02),
                    (JOY_DOWN, 0x04),
                    (JOY_UP, 0x08),
                    (JOY_BUTTONS, 0x10),
                ] {
                    if actions & mask != 0 {
                        value ^= bit;
                    }
                }
                self.pio.put_in_value_port_a(value, 0xFF);
            }
            _ => {}
        }
    }

    fn write_pio_data_a(&mut self, value: u8) {
        self.pio.write_data_a(value);
        match self.user_port {
            UserPort::JoystickPractic0188 => self.put_joystick_values(),
            up if up.is_centronics() && self.pio.mode_port_a() == PioMode::ByteOut => {
                if up == UserPort::Centronics7Practic0289 {
                    self.printer.print(value & 0x7F);
                    // BUSY
                    self.pio.put_in_value_port_a(0x80, 0x80);
                } else {
                    self.printer.print(value);
                }
                self.centronics_ack = CENTRONICS_ACK_TSTATES;
            }
            _ => {}
        }
    }

    fn read_io_byte(&mut self, port: u8) -> u8 {
        let mut rv = 0x0F;
        if port == 4 {
            rv = 0;
            if self.rom_disabled {
                rv |= 0x10;
            }
            if self.alt_font {
                rv |= 0x20;
            }
            if self.mode_4mhz {
                rv |= 0x40;
            }
            if self.mode_64x16 {
                rv |= 0x80;
            }
        } else if let GraphicsCard::Ccj { card, .. } = &mut self.graphics {
            if port == 0x18 {
                rv = card.read_status();
            } else if port == 0x19 {
                rv = card.read_data();
            }
        }
        let port16 = port as u16;
        if self.extension_window(port) {
            if let Some(v) = self.read_extension(port16) {
                rv = v;
            }
        } else if port & 0xF0 == 0x70 {
            if let Some(rtc) = &self.rtc {
                rv = rtc.read(port16);
            }
        } else if port & 0xF8 == 0x98 && self.ram_floppy1.is_some() {
            if let Some(rf) = &mut self.ram_floppy1 {
                rv = rf.read_byte((port & 7) as usize);
            }
        } else if port & 0xF8 == 0x58 && self.ram_floppy2.is_some() {
            if let Some(rf) = &mut self.ram_floppy2 {
                rv = rf.read_byte((port & 7) as usize);
            }
        } else if port >= 0xF0 {
            match port {
                0xF0 => {
                    if let Some(fdc) = &self.fdc {
                        rv = fdc.read_main_status();
                    }
                }
                0xF1 => {
                    if let Some(v) = self.with_fdc(|fdc, sel| fdc.read_data(sel)) {
                        rv = v;
                    }
                }
                0xF8 => {
                    self.with_fdc(|fdc, sel| fdc.terminal_count(sel));
                }
                0xFA => {
                    if let Some(fdc) = &mut self.fdc {
                        fdc.reset();
                    }
                }
                0xFC..=0xFF if self.rom_mega.is_none() => {
                    // USB card mirror
                    if let Some(v) = self.read_extension(0xDC | (port16 & 3)) {
                        rv = v;
                    }
                }
                _ => {}
            }
        } else {
            match port & 0x1C {
                0 => {
                    rv = match port & 3 {
                        0 => self.pio.read_data_a(),
                        1 => self.pio.read_control_a(),
                        2 => self.pio.read_data_b(),
                        _ => self.pio.read_control_b(),
                    }
                }
                0x0C => self.set_pixel_mode(true),
                0x10 => self.set_pixel_mode(false),
                _ => {}
            }
        }
        rv
    }

    fn write_io_byte(&mut self, port: u8, value: u8) {
        if port == 4 {
            self.write_mode_register(value);
        } else if let GraphicsCard::Ccj { card, active, .. } = &mut self.graphics {
            if port == 0x18 {
                card.write_arg(value);
            } else if port == 0x19 {
                card.write_cmd(value);
                if !*active {
                    *active = true;
                    self.screen_resized = true;
                }
            }
        }
        let port16 = port as u16;
        if self.extension_window(port) {
            self.write_extension(port16, value);
        } else if port & 0xF0 == 0x70 {
            if let Some(rtc) = &mut self.rtc {
                rtc.write(port16, value);
            }
        } else if port & 0xF8 == 0x98 && self.ram_floppy1.is_some() {
            if let Some(rf) = &mut self.ram_floppy1 {
                rf.write_byte((port & 7) as usize, value);
            }
        } else if port & 0xF8 == 0x58 && self.ram_floppy2.is_some() {
            if let Some(rf) = &mut self.ram_floppy2 {
                rf.write_byte((port & 7) as usize, value);
            }
        } else if port >= 0xF0 {
            match port {
                0xF1 => {
                    self.with_fdc(|fdc, sel| fdc.write_data(sel, value));
                }
                0xF8 => {
                    self.with_fdc(|fdc, sel| fdc.terminal_count(sel));
                }
                0xFA => {
                    if let Some(fdc) = &mut self.fdc {
                        fdc.reset();
                    }
                }
                0xFC..=0xFF => {
                    if self.rom_mega.is_some() {
                        if port == 0xFF {
                            self.mega_seg = value as usize;
                        }
                    } else {
                        self.write_extension(0xDC | (port16 & 3), value);
                    }
                }
                _ => {}
            }
        } else {
            match port & 0x1C {
                0 => match port & 3 {
                    0 => self.write_pio_data_a(value),
                    1 => self.pio.write_control_a(value),
                    2 => {
                        self.pio.write_data_b(value);
                        self.keyboard.put_row_values(&mut self.pio);
                    }
                    _ => self.pio.write_control_b(value),
                },
                0x08 => {
                    self.keyboard.set_selected_col((value & 0x0F) as usize);
                    self.keyboard.put_row_values(&mut self.pio);
                    if let GraphicsCard::Pixel { bank, active, .. } = &mut self.graphics {
                        match value & 0x0F {
                            8 => *active = true,
                            9 => *active = false,
                            _ => {}
                        }
                        *bank = (value & 0x07) as usize;
                    }
                }
                0x0C => self.set_pixel_mode(true),
                0x10 => self.set_pixel_mode(false),
                _ => {}
            }
        }
    }
}

fn rf_complies(rf: &Option<RamFloppy>, props: &Properties, name: &str) -> bool {
    let prefix = rf_prefix(name);
    let wanted = props.get_bool(&format!("{}enabled", prefix), false);
    match rf {
        Some(rf) => wanted && rf.complies(RamFloppyType::Mp3_1988, props, &prefix),
        None => !wanted,
    }
}

impl Machine for Z1013 {
    fn read_mem(&mut self, addr: u16) -> u8 {
        let value = self.mem_byte(addr);
        self.address_changed(addr);
        value
    }

    fn debug_mem(&self, addr: u16) -> u8 {
        self.mem_byte(addr)
    }

    fn write_mem(&mut self, addr: u16, value: u8) {
        self.set_mem_byte(addr, value);
        self.check_ccj_deactivation(addr);
        self.address_changed(addr);
    }

    fn read_io(&mut self, port: u16) -> u8 {
        let value = self.read_io_byte(port as u8);
        self.address_changed(port);
        value
    }

    fn write_io(&mut self, port: u16, value: u8) {
        self.write_io_byte(port as u8, value);
        self.address_changed(port);
    }

    fn tick(&mut self, tstates: u32) {
        for ext in &mut self.extensions {
            ext.tick(tstates);
        }
        if self.centronics_ack > 0 {
            self.centronics_ack -= tstates as i32;
            if self.centronics_ack <= 0 {
                match self.user_port {
                    UserPort::Centronics7Practic0289 => self.pio.put_in_value_port_a(0, 0x80),
                    UserPort::Centronics8Fa1090 => self.pio.strobe_port_a(),
                    _ => {}
                }
            }
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

    fn take_speed_request(&mut self) -> Option<u32> {
        self.speed_request.take()
    }

    fn interrupt_pending(&self) -> bool {
        interrupt_pending(&[&self.pio])
    }

    fn interrupt_ack(&mut self) -> u8 {
        accept_interrupt(&mut [&mut self.pio]).unwrap_or(0xFF)
    }

    fn reti(&mut self) {
        finish_interrupt(&mut [&mut self.pio]);
    }

    fn reset(&mut self, level: ResetLevel) {
        self.centronics_ack = 0;
        self.joy_actions = [0; 2];
        self.mega_seg = 0;
        self.rom_disabled = false;
        self.alt_font = false;
        self.set_pixel_mode(false);
        if let GraphicsCard::Ccj { card, active, last_written } = &mut self.graphics {
            card.reset();
            *last_written = None;
            if *active {
                *active = false;
                self.screen_resized = true;
            }
        }
        if self.mode_64x16 {
            self.mode_64x16 = false;
            self.screen_resized = true;
        }
        if level == ResetLevel::PowerOn {
            self.speed_khz = default_speed_khz(&self.props);
        }
        if self.mode_4mhz {
            self.request_speed(default_speed_khz(&self.props));
            self.mode_4mhz = false;
        }
        if level == ResetLevel::PowerOn {
            if self.props.get_bool(&key(PROP_RELOAD_ROMS), false) {
                let props = self.props.clone();
                self.load_roms(&props);
            }
            fill_random(&mut self.ram);
            if let GraphicsCard::Pixel { banks, .. } = &mut self.graphics {
                for bank in banks.iter_mut() {
                    fill_random(bank);
                }
            }
            if let Some(sram) = &mut self.ram_static {
                fill_random(sram);
            }
            fill_random(&mut self.ram_video);
        }
        self.pio.reset(matches!(level, ResetLevel::PowerOn | ResetLevel::Cold));
        self.keyboard.reset();
        for ext in &mut self.extensions {
            ext.reset(level == ResetLevel::PowerOn);
        }
        if let Some(fdc) = &mut self.fdc {
            fdc.reset();
        }
        if let Some(station) = &self.disk_station {
            if let Ok(mut station) = station.lock() {
                station.reset_drives();
            }
        }
        if self.user_port == UserPort::Centronics7Practic0289 {
            self.pio.put_in_value_port_a(0, 0x80);
        }
    }

    fn reset_start_address(&self) -> u16 {
        0xF000
    }

    fn default_speed_khz(&self) -> u32 {
        default_speed_khz(&self.props)
    }

    fn pc_intercepts(&self) -> PcIntercepts<Self> {
        self.intercepts.clone()
    }
}

impl KcSystem for Z1013 {
    fn title(&self) -> &str {
        &self.sys_name
    }

    fn screen_size(&self) -> (usize, usize) {
        match &self.graphics {
            GraphicsCard::Ccj { active: true, .. } => (ccj::COLUMNS, ccj::ROWS),
            _ if self.mode_64x16 => (64, 16),
            _ => (32, 32),
        }
    }

    fn screen_char(&self, col: usize, row: usize) -> Option<char> {
        if let GraphicsCard::Ccj { card, active: true, .. } = &self.graphics {
            return card.screen_char(col, row);
        }
        let (cols, rows) = self.screen_size();
        if col >= cols || row >= rows {
            return None;
        }
        match self.ram_video[row * cols + col] {
            b @ 0x20..=0x7E => Some(b as char),
            b @ 0xA0..=0xFE if self.alt_font => Some((b & 0x7F) as char),
            _ => None,
        }
    }

    fn key_typed(&mut self, ch: char) -> bool {
        let rv = self.keyboard.set_key_char(ch);
        self.keyboard.put_row_values(&mut self.pio);
        rv
    }

    fn key_pressed(&mut self, key: SpecialKey, _shift: bool) -> bool {
        let rv = self.keyboard.set_special_key(key);
        self.keyboard.put_row_values(&mut self.pio);
        rv
    }

    fn key_released(&mut self) {
        self.keyboard.set_key_released();
        self.keyboard.put_row_values(&mut self.pio);
    }

    fn paste(&mut self, text: &str) -> bool {
        if !self.paste_fast {
            return false;
        }
        self.paste_queue.extend(text.chars().filter_map(|ch| match ch {
            '\n' => Some(b'\r'),
            c if c.is_ascii() => Some(c as u8),
            _ => None,
        }));
        true
    }

    fn apply_settings(&mut self, props: &Properties) -> bool {
        if !self.complies(props) {
            return false;
        }
        self.apply_user_port(props);
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

    fn set_joystick(&mut self, num: usize, actions: u8) {
        if let Some(slot) = self.joy_actions.get_mut(num) {
            *slot = actions;
            self.put_joystick_values();
        }
    }

    fn take_screen_resized(&mut self) -> bool {
        std::mem::take(&mut self.screen_resized)
    }

    fn disk_station(&self) -> Option<SharedDiskStation> {
        self.disk_station.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer::BufferedPrinter;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        Properties::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    /// Z1013 with a fake monitor ROM of 0x76 (HALT) bytes.
    fn z1013(pairs: &[(&str, &str)]) -> Z1013 {
        let mut res = RomResources::new();
        res.insert("/rom/z1013/mon_202.bin", vec![0x76; 0x800]);
        res.insert("/rom/z1013/kcbasic.bin", vec![0xBA; 0x2C00]);
        let mut sys = Z1013::new(&props(pairs), Arc::new(res));
        sys.reset(ResetLevel::PowerOn);
        sys
    }

    #[test]
    fn test_memory_map() {
        let mut sys = z1013(&[]);
        assert_eq!(sys.read_mem(0xF000), 0x76);
        sys.write_mem(0xF000, 0x12);
        assert_eq!(sys.read_mem(0xF000), 0x76);
        // beyond the 2K ROM image
        sys.write_mem(0xF800, 0x34);
        assert_eq!(sys.read_mem(0xF800), 0x34);

        sys.write_mem(0xEC00, b'A');
        assert_eq!(sys.screen_char(0, 0), Some('A'));

        // ROM off: F000 is RAM
        sys.write_io(4, 0x10);
        assert!(sys.is_rom_disabled());
        assert_eq!(sys.read_io(4) & 0x10, 0x10);
        sys.write_mem(0xF000, 0x55);
        assert_eq!(sys.read_mem(0xF000), 0x55);
        sys.write_io(4, 0x00);
        assert_eq!(sys.read_mem(0xF000), 0x76);
    }

    #[test]
    fn test_model_ram_sizes() {
        let mut sys = z1013(&[("jkcemu.system", "Z1013.16")]);
        sys.write_mem(0x4000, 0x11);
        assert_eq!(sys.read_mem(0x4000), 0xFF);
        sys.write_mem(0x3FFF, 0x22);
        assert_eq!(sys.read_mem(0x3FFF), 0x22);
        assert_eq!(sys.default_speed_khz(), 2000);

        let mut sys = z1013(&[("jkcemu.system", "Z1013.12")]);
        sys.write_mem(0x0200, 0x33);
        assert_eq!(sys.read_mem(0x0200), 0x33);
        assert_eq!(sys.read_mem(0x0400), 0xFF);

        let sys = z1013(&[("jkcemu.system", "Z1013.01")]);
        assert_eq!(sys.default_speed_khz(), 1000);
    }

    #[test]
    fn test_basic_and_mega_rom() {
        let mut sys = z1013(&[("jkcemu.z1013.rom_basic.enabled", "true")]);
        assert_eq!(sys.read_mem(0xC000), 0xBA);
        assert_eq!(sys.read_mem(0xEBFF), 0xBA);
        sys.write_mem(0xC000, 0x01);
        assert_eq!(sys.read_mem(0xC000), 0xBA);

        let path = std::env::temp_dir().join(format!("kcemu_mega_{}.bin", std::process::id()));
        let mut mega = vec![0u8; 0x280000];
        // window 1 (C800), segment 3
        mega[(256 + 3) * 2048 + 5] = 0x42;
        std::fs::write(&path, &mega).unwrap();
        let file = path.display().to_string();
        let mut sys = z1013(&[
            ("jkcemu.z1013.rom_mega.enabled", "true"),
            ("jkcemu.z1013.rom_mega.file", &file),
        ]);
        sys.write_io(0xFF, 3);
        assert_eq!(sys.mega_rom_segment(), 3);
        assert_eq!(sys.read_mem(0xC805), 0x42);
        // E800-EBFF is RAM
        sys.write_mem(0xE800, 0x77);
        assert_eq!(sys.read_mem(0xE800), 0x77);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_mode_register_turbo_transitions() {
        let mut sys = z1013(&[]);
        sys.write_io(4, 0x40);
        assert_eq!(sys.take_speed_request(), Some(4000));
        assert!(sys.is_mode_4mhz());
        // no second request for the same mode
        sys.write_io(4, 0x40);
        assert_eq!(sys.take_speed_request(), None);
        sys.write_io(4, 0x00);
        assert_eq!(sys.take_speed_request(), Some(2000));
        assert_eq!(sys.read_io(4) & 0x40, 0);

        sys.write_io(4, 0x40);
        sys.take_speed_request();
        sys.reset(ResetLevel::Warm);
        assert_eq!(sys.take_speed_request(), Some(2000));
        assert!(!sys.is_mode_4mhz());
    }

    #[test]
    fn test_64x16_mode_signals_resize_once() {
        let mut sys = z1013(&[]);
        sys.take_screen_resized();
        sys.write_io(4, 0x80);
        assert!(sys.take_screen_resized());
        assert_eq!(sys.screen_size(), (64, 16));
        sys.write_io(4, 0x80);
        assert!(!sys.take_screen_resized());
        sys.write_mem(0xEC00 + 64 + 1, b'Z');
        assert_eq!(sys.screen_char(1, 1), Some('Z'));
        sys.reset(ResetLevel::Warm);
        assert!(sys.take_screen_resized());
        assert_eq!(sys.screen_size(), (32, 32));
    }

    #[test]
    fn test_address_line_on_pio_b5() {
        let mut sys = z1013(&[]);
        sys.read_mem(0x0001);
        assert_eq!(sys.pio().read_data_b() & 0x20, 0x20);
        sys.read_io(0x0002);
        assert_eq!(sys.pio().read_data_b() & 0x20, 0);
    }

    #[test]
    fn test_pixel_graphics_banks() {
        let mut sys = z1013(&[("jkcemu.z1013.graphic.enabled", "true")]);
        sys.write_mem(0xEC10, 0x20);
        // column port: bank 3, graphics on through 0x0C
        sys.write_io(0x08, 0x03);
        sys.write_io(0x0C, 0);
        sys.write_mem(0xEC10, 0xAA);
        assert_eq!(sys.read_mem(0xEC10), 0xAA);
        sys.write_io(0x10, 0);
        assert_eq!(sys.read_mem(0xEC10), 0x20);
        // value 8 switches graphics on and selects bank 0
        sys.write_io(0x08, 0x08);
        sys.write_mem(0xEC10, 0x55);
        sys.write_io(0x08, 0x0B);
        assert_eq!(sys.read_mem(0xEC10), 0xAA);
        sys.write_io(0x08, 0x09);
        assert_eq!(sys.read_mem(0xEC10), 0x20);
        // reading IOSEL4 also switches off
        sys.write_io(0x0C, 0);
        sys.read_io(0x10);
        assert_eq!(sys.read_mem(0xEC10), 0x20);
    }

    #[test]
    fn test_ccj_activation_and_sequential_write() {
        let mut sys = z1013(&[("jkcemu.z1013.graphic_ccj.enabled", "true")]);
        sys.take_screen_resized();
        sys.write_io(0x18, b'X');
        sys.write_io(0x19, 3);
        assert!(sys.take_screen_resized());
        assert_eq!(sys.screen_size(), (80, 24));
        assert_eq!(sys.screen_char(0, 0), Some('X'));
        assert_eq!(sys.read_io(0x18), 0x80);

        // interrupted sequence keeps the card
        sys.write_mem(0xEC00, 0x20);
        sys.write_mem(0xEC05, 0x20);
        assert_eq!(sys.screen_size(), (80, 24));
        for addr in 0xEC00..=0xEFFFu16 {
            sys.write_mem(addr, 0x20);
        }
        assert!(sys.take_screen_resized());
        assert_eq!(sys.screen_size(), (32, 32));
    }

    #[test]
    fn test_centronics_printing() {
        let mut sys = z1013(&[("jkcemu.z1013.userport", "centronics7:practic0289")]);
        let printer = BufferedPrinter::new();
        sys.set_printer(Box::new(printer.clone()));
        // port A in input mode: nothing printed
        sys.write_io(0x00, b'-');
        sys.write_io(0x01, 0x0F);
        sys.write_io(0x00, b'A' | 0x80);
        assert_eq!(printer.output(), vec![b'A']);

        let mut sys = z1013(&[("jkcemu.z1013.userport", "centronics8:fa1090")]);
        let printer = BufferedPrinter::new();
        sys.set_printer(Box::new(printer.clone()));
        sys.write_io(0x01, 0x0F);
        sys.write_io(0x00, 0xC1);
        assert_eq!(printer.output(), vec![0xC1]);
        assert!(sys.pio().is_ready_port_a());
        sys.tick(19_999);
        assert!(sys.pio().is_ready_port_a());
        sys.tick(1);
        assert!(!sys.pio().is_ready_port_a());
    }

    #[test]
    fn test_joystick_on_user_port() {
        let mut sys = z1013(&[("jkcemu.z1013.userport", "joystick:practic0487")]);
        sys.write_io(0x01, 0x4F); // port A byte input
        sys.set_joystick(0, JOY_LEFT);
        sys.set_joystick(1, JOY_BUTTONS);
        assert_eq!(sys.pio().read_data_a(), !(0x20 | 0x0F));

        let mut sys = z1013(&[("jkcemu.z1013.userport", "joystick:jute0687")]);
        sys.write_io(0x01, 0x4F);
        sys.set_joystick(0, JOY_UP | JOY_RIGHT);
        assert_eq!(sys.pio().read_data_a(), 0xF1 ^ 0x80 ^ 0x40);
    }

    #[test]
    fn test_paste_queue_and_settings() {
        let mut sys = z1013(&[]);
        assert!(sys.paste("ab\n"));
        assert_eq!(sys.paste_queue, VecDeque::from(vec![b'a', b'b', b'\r']));
        assert_eq!(
            sys.pc_intercepts().addresses(),
            vec![0xF130, 0xFFBB, 0xFFCA, 0xFFCD, 0xFFDF, 0xFFE5, 0xFFE8, 0xFFEB]
        );

        let p = props(&[
            ("jkcemu.z1013.paste.fast", "false"),
            ("jkcemu.z1013.catch_print_calls", "false"),
        ]);
        assert!(sys.apply_settings(&p));
        assert_eq!(sys.pc_intercepts().addresses(), vec![0xFFBB]);
        assert!(!sys.paste("x"));

        let p = props(&[("jkcemu.z1013.monitor", "A.2")]);
        assert!(!sys.apply_settings(&p));
        let p = props(&[("jkcemu.z1013.rtc.enabled", "true")]);
        assert!(!sys.apply_settings(&p));
    }

    #[test]
    fn test_pio_mirrors_without_extension_cards() {
        let mut sys = z1013(&[]);
        sys.write_io(0x41, 0x0F);
        assert_eq!(sys.pio.mode_port_a(), PioMode::ByteOut);
        sys.write_io(0x81, 0x4F);
        assert_eq!(sys.pio.mode_port_a(), PioMode::ByteIn);
        sys.write_io(0xC1, 0x0F);
        assert_eq!(sys.pio.mode_port_a(), PioMode::ByteOut);
    }

    #[test]
    fn test_extension_card_takes_its_window() {
        struct Card(u8);
        impl crate::devices::IoExtension for Card {
            fn name(&self) -> &str {
                "gide"
            }
            fn read(&mut self, _port: u16) -> Option<u8> {
                Some(self.0)
            }
            fn write(&mut self, _port: u16, value: u8) -> bool {
                self.0 = value;
                true
            }
        }
        let mut sys = z1013(&[]);
        sys.plug_extension(ExtensionSlot::new(0x40, 0xF0, Box::new(Card(0))));
        sys.write_io(0x41, 0x0F);
        assert_eq!(sys.pio.mode_port_a(), PioMode::ByteIn);
        assert_eq!(sys.read_io(0x41), 0x0F);
        // 8x window stays a PIO mirror
        sys.write_io(0x81, 0x0F);
        assert_eq!(sys.pio.mode_port_a(), PioMode::ByteOut);
    }

    #[test]
    fn test_rtc_and_ram_floppy_ports() {
        let mut sys = z1013(&[
            ("jkcemu.z1013.rtc.enabled", "true"),
            ("jkcemu.z1013.ramfloppy.1.enabled", "true"),
            ("jkcemu.z1013.ramfloppy.1.kbyte", "64"),
        ]);
        assert_eq!(sys.read_io(0x7F) & 0xF0, 0xF0);
        sys.write_io(0x98, 0x10);
        sys.write_io(0x99, 0x00);
        sys.write_io(0x9A, 0x00);
        sys.write_io(0x9B, 0xE5);
        assert_eq!(sys.ram_floppy1().map(|rf| rf.get_byte(0x10)), Some(0xE5));
        // second RAM floppy absent
        assert_eq!(sys.read_io(0x5B), 0x0F);
    }
}
