//! Huebler/Evert graphic computer core.
//!
//! 64K RAM with the OS ROM at F000. The keyboard delivers a whole ASCII
//! character on ports 08/0A and a key flag on 09/0B. The OS prints through
//! the routine at F00F, character in register C.

use std::sync::Arc;

use z80emu::Reg8;

use super::{fill_random, KcSystem, PROP_CATCH_PRINT_CALLS, PROP_OS_FILE, PROP_SYSNAME};
use crate::config::Properties;
use crate::devices::{accept_interrupt, finish_interrupt, interrupt_pending, SpecialKey, Z80Ctc, Z80Pio};
use crate::emulator::{CpuAccess, Machine, PcHandler, PcIntercepts, ResetLevel};
use crate::printer::{NullPrinter, PrintSink};
use crate::resources::RomResources;

pub const PROP_PREFIX: &str = "jkcemu.huebler.";

pub const SYSNAME_HUEBLER: &str = "HueblerGraphicsMC";

pub const OS_RESOURCE: &str = "/rom/huebler/hgmc_os.bin";

const OS_ADDR: u16 = 0xF000;
const PRINT_ADDR: u16 = 0xF00F;

fn key(name: &str) -> String {
    format!("{}{}", PROP_PREFIX, name)
}

fn pc_print_c(sys: &mut HueblerMc, cpu: &mut CpuAccess<'_>) -> bool {
    sys.printer.print(cpu.reg8(Reg8::C));
    true
}

pub struct HueblerMc {
    props: Properties,
    sys_name: String,
    os_rom: Option<Arc<[u8]>>,
    ram: Vec<u8>,
    key_char: u8,
    pio: Z80Pio,
    ctc: Z80Ctc,
    printer: Box<dyn PrintSink>,
    intercepts: PcIntercepts<HueblerMc>,
}

impl HueblerMc {
    pub fn new(props: &Properties, resources: Arc<RomResources>) -> Self {
        let sys = Self {
            props: props.clone(),
            sys_name: props.get_str(PROP_SYSNAME).unwrap_or(SYSNAME_HUEBLER).to_string(),
            os_rom: resources.rom_from_settings(props, &key(PROP_OS_FILE), OS_RESOURCE),
            ram: vec![0; 0x10000],
            key_char: 0,
            pio: Z80Pio::new(),
            ctc: Z80Ctc::new(),
            printer: Box::new(NullPrinter),
            intercepts: PcIntercepts::new(),
        };
        sys.register_intercepts(props);
        sys
    }

    fn register_intercepts(&self, props: &Properties) {
        let mut entries: Vec<(u16, PcHandler<Self>)> = Vec::new();
        if props.get_bool(&key(PROP_CATCH_PRINT_CALLS), true) {
            let print: PcHandler<Self> = Arc::new(pc_print_c);
            entries.push((PRINT_ADDR, print));
        }
        self.intercepts.replace(entries);
    }

    pub fn pio(&self) -> &Z80Pio {
        &self.pio
    }

    fn mem_byte(&self, addr: u16) -> u8 {
        if addr >= OS_ADDR {
            if let Some(b) = self.os_rom.as_ref().and_then(|r| r.get((addr - OS_ADDR) as usize)) {
                return *b;
            }
        }
        self.ram[addr as usize]
    }
}

impl Machine for HueblerMc {
    fn read_mem(&mut self, addr: u16) -> u8 {
        self.mem_byte(addr)
    }

    fn debug_mem(&self, addr: u16) -> u8 {
        self.mem_byte(addr)
    }

    fn write_mem(&mut self, addr: u16, value: u8) {
        let rom_len = self.os_rom.as_ref().map_or(0, |r| r.len());
        if addr < OS_ADDR || (addr - OS_ADDR) as usize >= rom_len {
            self.ram[addr as usize] = value;
        }
    }

    fn read_io(&mut self, port: u16) -> u8 {
        match port as u8 {
            0x08 | 0x0A => self.key_char,
            0x09 | 0x0B => {
                if self.key_char != 0 {
                    0xFF
                } else {
                    0
                }
            }
            0x0C => self.pio.read_data_a(),
            0x0D => self.pio.read_control_a(),
            0x0E => self.pio.read_data_b(),
            0x0F => self.pio.read_control_b(),
            p @ 0x14..=0x17 => self.ctc.read((p & 3) as usize),
            _ => 0,
        }
    }

    fn write_io(&mut self, port: u16, value: u8) {
        match port as u8 {
            0x0C => self.pio.write_data_a(value),
            0x0D => self.pio.write_control_a(value),
            0x0E => self.pio.write_data_b(value),
            0x0F => self.pio.write_control_b(value),
            p @ 0x14..=0x17 => self.ctc.write((p & 3) as usize, value),
            _ => {}
        }
    }

    fn tick(&mut self, tstates: u32) {
        self.ctc.system_update(tstates);
    }

    // only the CTC is wired to the interrupt line
    fn interrupt_pending(&self) -> bool {
        interrupt_pending(&[&self.ctc])
    }

    fn interrupt_ack(&mut self) -> u8 {
        accept_interrupt(&mut [&mut self.ctc]).unwrap_or(0xFF)
    }

    fn reti(&mut self) {
        finish_interrupt(&mut [&mut self.ctc]);
    }

    fn reset(&mut self, level: ResetLevel) {
        if level == ResetLevel::PowerOn {
            fill_random(&mut self.ram);
        }
        let hard = matches!(level, ResetLevel::PowerOn | ResetLevel::Cold);
        self.pio.reset(hard);
        self.ctc.reset(hard);
        self.key_char = 0;
    }

    fn reset_start_address(&self) -> u16 {
        OS_ADDR
    }

    fn default_speed_khz(&self) -> u32 {
        2500
    }

    fn pc_intercepts(&self) -> PcIntercepts<Self> {
        self.intercepts.clone()
    }
}

impl KcSystem for HueblerMc {
    fn title(&self) -> &str {
        &self.sys_name
    }

    /// The display is pixel graphics only.
    fn screen_size(&self) -> (usize, usize) {
        (0, 0)
    }

    fn screen_char(&self, _col: usize, _row: usize) -> Option<char> {
        None
    }

    fn key_typed(&mut self, ch: char) -> bool {
        let ch = if ch.is_ascii_lowercase() {
            ch.to_ascii_uppercase()
        } else {
            ch.to_ascii_lowercase()
        };
        match ch as u32 {
            c @ 1..=0x7E => {
                self.key_char = c as u8;
                true
            }
            _ => false,
        }
    }

    fn key_pressed(&mut self, key: SpecialKey, _shift: bool) -> bool {
        let ch = match key {
            SpecialKey::Backspace | SpecialKey::Left => 0x08,
            SpecialKey::Right => 0x09,
            SpecialKey::Down => 0x0A,
            SpecialKey::Up => 0x0B,
            SpecialKey::Enter => 0x0D,
            SpecialKey::Escape => 0x1B,
            SpecialKey::Space => 0x20,
            SpecialKey::Delete => 0x7F,
            _ => return false,
        };
        self.key_char = ch;
        true
    }

    fn key_released(&mut self) {
        self.key_char = 0;
    }

    fn paste(&mut self, _text: &str) -> bool {
        false
    }

    fn apply_settings(&mut self, props: &Properties) -> bool {
        let same_os = props.get_str(&key(PROP_OS_FILE)) == self.props.get_str(&key(PROP_OS_FILE));
        if props.get_str(PROP_SYSNAME).unwrap_or(SYSNAME_HUEBLER) != self.sys_name || !same_os {
            return false;
        }
        self.register_intercepts(props);
        self.props = props.clone();
        true
    }

    fn set_printer(&mut self, printer: Box<dyn PrintSink>) {
        self.printer = printer;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::Emulator;
    use crate::printer::BufferedPrinter;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        Properties::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    fn huebler(os: Vec<u8>) -> HueblerMc {
        let mut res = RomResources::new();
        res.insert(OS_RESOURCE, os);
        HueblerMc::new(&props(&[("jkcemu.system", "HueblerGraphicsMC")]), Arc::new(res))
    }

    #[test]
    fn test_keyboard_ports() {
        let mut sys = huebler(vec![0; 0x1000]);
        assert_eq!(sys.read_io(0x09), 0);
        assert!(sys.key_typed('a'));
        assert_eq!(sys.read_io(0x08), b'A');
        assert_eq!(sys.read_io(0x0B), 0xFF);
        sys.key_released();
        assert_eq!(sys.read_io(0x0A), 0);
        assert!(!sys.key_typed('\u{7F}'));
        assert!(sys.key_pressed(SpecialKey::Enter, false));
        assert_eq!(sys.read_io(0x08), 0x0D);
    }

    #[test]
    fn test_rom_is_read_only() {
        let mut sys = huebler(vec![0xC9; 0x800]);
        sys.write_mem(0xF000, 0x00);
        assert_eq!(sys.read_mem(0xF000), 0xC9);
        sys.write_mem(0xF800, 0x12);
        assert_eq!(sys.read_mem(0xF800), 0x12);
    }

    #[test]
    fn test_print_call_runs_from_reset() {
        // F000: LD SP,0100; LD C,'H'; CALL F00F; LD C,'i'; CALL F00F; HALT
        let mut os = vec![
            0x31, 0x00, 0x01, 0x0E, b'H', 0xCD, 0x0F, 0xF0, 0x0E, b'i', 0xCD, 0x0F, 0xF0, 0x76,
        ];
        os.resize(0x0F, 0x00);
        // the ROM routine itself would loop forever
        os.extend_from_slice(&[0x18, 0xFE]);
        let mut sys = huebler(os);
        let printer = BufferedPrinter::new();
        sys.set_printer(Box::new(printer.clone()));
        let mut emu = Emulator::new(sys);
        emu.max_speed = true;
        emu.run_for(200);
        assert_eq!(printer.output_string(), "Hi");

        assert!(emu
            .machine_mut()
            .apply_settings(&props(&[
                ("jkcemu.system", "HueblerGraphicsMC"),
                ("jkcemu.huebler.catch_print_calls", "false"),
            ])));
        assert!(emu.machine().pc_intercepts().is_empty());
    }
}
