//! Z80 PIO (U855) parallel I/O controller.
//!
//! # Control words
//!
//! | Pattern      | Meaning                                          |
//! |--------------|--------------------------------------------------|
//! | `xxxxxxx0`   | interrupt vector                                 |
//! | `mm001111`   | operating mode `mm` (0 out, 1 in, 2 bidir, 3 bit)|
//! | `eahm0111`   | interrupt control; `m` = mask word follows       |
//! | `e0000011`   | interrupt enable flip-flop only                  |
//!
//! In bit mode the word after the mode word is the I/O direction mask
//! (1 = input). Host hardware drives the input lines with
//! [`Z80Pio::put_in_value_port_a`] and reads the output lines with
//! [`Z80Pio::fetch_out_value_port_a`].

use super::InterruptSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PioMode {
    ByteOut,
    ByteIn,
    ByteInOut,
    BitInOut,
}

impl PioMode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => PioMode::ByteOut,
            1 => PioMode::ByteIn,
            2 => PioMode::ByteInOut,
            _ => PioMode::BitInOut,
        }
    }
}

/// Follow-up byte expected after a control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Control,
    IoMask,
    IntMask,
}

#[derive(Debug, Clone)]
struct PioPort {
    mode: PioMode,
    expect: Expect,
    /// Output register.
    out_value: u8,
    /// Levels of the input lines.
    in_value: u8,
    /// Input latch of byte modes, taken over on strobe.
    in_latch: u8,
    /// Bit mode direction, 1 = input.
    io_mask: u8,
    vector: u8,
    int_enabled: bool,
    /// Bit mode: AND instead of OR over the monitored lines.
    int_and: bool,
    /// Bit mode: lines are active high.
    int_high: bool,
    /// Bit mode: 0 = line is monitored.
    int_mask: u8,
    /// Last evaluation of the bit mode condition, for edge detection.
    int_condition: bool,
    int_requested: bool,
    int_in_service: bool,
    /// Output byte waiting to be taken by the peripheral.
    ready: bool,
}

impl PioPort {
    fn new() -> Self {
        Self {
            mode: PioMode::ByteIn,
            expect: Expect::Control,
            out_value: 0,
            in_value: 0xFF,
            in_latch: 0xFF,
            io_mask: 0xFF,
            vector: 0,
            int_enabled: false,
            int_and: false,
            int_high: false,
            int_mask: 0xFF,
            int_condition: false,
            int_requested: false,
            int_in_service: false,
            ready: false,
        }
    }

    fn reset(&mut self, hard: bool) {
        self.mode = PioMode::ByteIn;
        self.expect = Expect::Control;
        self.io_mask = 0xFF;
        self.int_enabled = false;
        self.int_mask = 0xFF;
        self.int_condition = false;
        self.int_requested = false;
        self.int_in_service = false;
        self.ready = false;
        if hard {
            self.out_value = 0;
            self.in_value = 0xFF;
            self.in_latch = 0xFF;
            self.vector = 0;
        }
    }

    fn write_control(&mut self, value: u8) {
        match self.expect {
            Expect::IoMask => {
                self.io_mask = value;
                self.expect = Expect::Control;
                self.check_bit_interrupt();
                return;
            }
            Expect::IntMask => {
                self.int_mask = value;
                self.expect = Expect::Control;
                self.int_condition = false;
                self.check_bit_interrupt();
                return;
            }
            Expect::Control => {}
        }
        if value & 0x01 == 0 {
            self.vector = value;
        } else if value & 0x0F == 0x0F {
            self.mode = PioMode::from_bits(value >> 6);
            if self.mode == PioMode::BitInOut {
                self.expect = Expect::IoMask;
            }
        } else if value & 0x0F == 0x07 {
            self.int_enabled = value & 0x80 != 0;
            self.int_and = value & 0x40 != 0;
            self.int_high = value & 0x20 != 0;
            if value & 0x10 != 0 {
                self.int_requested = false;
                self.expect = Expect::IntMask;
            }
        } else if value & 0x0F == 0x03 {
            self.int_enabled = value & 0x80 != 0;
        }
    }

    fn write_data(&mut self, value: u8) {
        self.out_value = value;
        match self.mode {
            PioMode::ByteOut | PioMode::ByteInOut => self.ready = true,
            PioMode::BitInOut => self.check_bit_interrupt(),
            PioMode::ByteIn => {}
        }
    }

    fn read_data(&self) -> u8 {
        match self.mode {
            PioMode::ByteOut => self.out_value,
            PioMode::ByteIn | PioMode::ByteInOut => self.in_latch,
            PioMode::BitInOut => (self.in_value & self.io_mask) | (self.out_value & !self.io_mask),
        }
    }

    fn put_in_value(&mut self, value: u8, mask: u8) {
        self.in_value = (self.in_value & !mask) | (value & mask);
        match self.mode {
            // without handshake the latch follows the lines
            PioMode::ByteIn | PioMode::ByteInOut => self.in_latch = self.in_value,
            PioMode::BitInOut => self.check_bit_interrupt(),
            PioMode::ByteOut => {}
        }
    }

    /// Strobe from the peripheral: input byte taken over or output byte
    /// acknowledged.
    fn strobe(&mut self) {
        match self.mode {
            PioMode::ByteIn | PioMode::ByteInOut => {
                self.in_latch = self.in_value;
                self.request_interrupt();
            }
            PioMode::ByteOut => {
                self.ready = false;
                self.request_interrupt();
            }
            PioMode::BitInOut => {}
        }
    }

    fn out_lines(&self) -> u8 {
        match self.mode {
            PioMode::ByteOut | PioMode::ByteInOut => self.out_value,
            PioMode::BitInOut => self.out_value | self.io_mask,
            PioMode::ByteIn => 0xFF,
        }
    }

    fn request_interrupt(&mut self) {
        if self.int_enabled {
            self.int_requested = true;
        }
    }

    fn check_bit_interrupt(&mut self) {
        if self.mode != PioMode::BitInOut {
            return;
        }
        let monitored = !self.int_mask & self.io_mask;
        let lines = if self.int_high {
            self.in_value
        } else {
            !self.in_value
        } & monitored;
        let condition = if monitored == 0 {
            false
        } else if self.int_and {
            lines == monitored
        } else {
            lines != 0
        };
        if condition && !self.int_condition {
            self.request_interrupt();
        }
        self.int_condition = condition;
    }
}

#[derive(Debug, Clone)]
pub struct Z80Pio {
    a: PioPort,
    b: PioPort,
}

impl Default for Z80Pio {
    fn default() -> Self {
        Self::new()
    }
}

impl Z80Pio {
    pub fn new() -> Self {
        Self {
            a: PioPort::new(),
            b: PioPort::new(),
        }
    }

    /// `hard` also clears the output registers and the vectors.
    pub fn reset(&mut self, hard: bool) {
        self.a.reset(hard);
        self.b.reset(hard);
    }

    pub fn mode_port_a(&self) -> PioMode {
        self.a.mode
    }

    pub fn mode_port_b(&self) -> PioMode {
        self.b.mode
    }

    pub fn read_data_a(&self) -> u8 {
        self.a.read_data()
    }

    pub fn read_data_b(&self) -> u8 {
        self.b.read_data()
    }

    pub fn read_control_a(&self) -> u8 {
        0xFF
    }

    pub fn read_control_b(&self) -> u8 {
        0xFF
    }

    pub fn write_data_a(&mut self, value: u8) {
        self.a.write_data(value);
    }

    pub fn write_data_b(&mut self, value: u8) {
        self.b.write_data(value);
    }

    pub fn write_control_a(&mut self, value: u8) {
        self.a.write_control(value);
    }

    pub fn write_control_b(&mut self, value: u8) {
        self.b.write_control(value);
    }

    /// Drive the input lines selected by `mask`.
    pub fn put_in_value_port_a(&mut self, value: u8, mask: u8) {
        self.a.put_in_value(value, mask);
    }

    pub fn put_in_value_port_b(&mut self, value: u8, mask: u8) {
        self.b.put_in_value(value, mask);
    }

    pub fn strobe_port_a(&mut self) {
        self.a.strobe();
    }

    pub fn strobe_port_b(&mut self) {
        self.b.strobe();
    }

    /// Levels of the output lines; `strobe` acknowledges the byte.
    pub fn fetch_out_value_port_a(&mut self, strobe: bool) -> u8 {
        let value = self.a.out_lines();
        if strobe {
            self.a.strobe();
        }
        value
    }

    pub fn fetch_out_value_port_b(&mut self, strobe: bool) -> u8 {
        let value = self.b.out_lines();
        if strobe {
            self.b.strobe();
        }
        value
    }

    /// Output byte of port A not yet acknowledged.
    pub fn is_ready_port_a(&self) -> bool {
        self.a.ready
    }
}

impl InterruptSource for Z80Pio {
    fn interrupt_requested(&self) -> bool {
        if self.a.int_in_service {
            return false;
        }
        self.a.int_requested || (!self.b.int_in_service && self.b.int_requested)
    }

    fn interrupt_in_service(&self) -> bool {
        self.a.int_in_service || self.b.int_in_service
    }

    fn accept_interrupt(&mut self) -> u8 {
        let port = if self.a.int_requested {
            &mut self.a
        } else {
            &mut self.b
        };
        port.int_requested = false;
        port.int_in_service = true;
        port.vector
    }

    fn finish_interrupt(&mut self) -> bool {
        if self.a.int_in_service {
            self.a.int_in_service = false;
            true
        } else if self.b.int_in_service {
            self.b.int_in_service = false;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_state_is_byte_input() {
        let mut pio = Z80Pio::new();
        assert_eq!(pio.mode_port_a(), PioMode::ByteIn);
        pio.put_in_value_port_a(0x5A, 0xFF);
        assert_eq!(pio.read_data_a(), 0x5A);
        pio.put_in_value_port_a(0x80, 0x80);
        assert_eq!(pio.read_data_a(), 0xDA);
    }

    #[test]
    fn test_byte_output_with_strobe_interrupt() {
        let mut pio = Z80Pio::new();
        pio.write_control_a(0x20); // vector
        pio.write_control_a(0x0F); // mode 0
        pio.write_control_a(0x87); // interrupts on
        pio.write_data_a(0x41);
        assert!(pio.is_ready_port_a());
        assert!(!pio.interrupt_requested());

        assert_eq!(pio.fetch_out_value_port_a(true), 0x41);
        assert!(!pio.is_ready_port_a());
        assert!(pio.interrupt_requested());
        assert_eq!(pio.accept_interrupt(), 0x20);
        assert!(pio.interrupt_in_service());
        assert!(pio.finish_interrupt());
    }

    #[test]
    fn test_bit_mode_mixes_lines() {
        let mut pio = Z80Pio::new();
        pio.write_control_b(0xCF); // mode 3
        pio.write_control_b(0x0F); // low nibble input
        pio.write_data_b(0xA5);
        pio.put_in_value_port_b(0x03, 0xFF);
        assert_eq!(pio.read_data_b(), 0xA3);
        assert_eq!(pio.fetch_out_value_port_b(false), 0xAF);
    }

    #[test]
    fn test_bit_mode_interrupt_on_edge() {
        let mut pio = Z80Pio::new();
        pio.write_control_b(0x40);
        pio.write_control_b(0xCF);
        pio.write_control_b(0xFF);
        pio.write_control_b(0x97); // enabled, OR, active low, mask follows
        pio.write_control_b(0xFE); // monitor bit 0
        pio.put_in_value_port_b(0xFF, 0xFF);
        assert!(!pio.interrupt_requested());
        pio.put_in_value_port_b(0x00, 0x01);
        assert!(pio.interrupt_requested());
        assert_eq!(pio.accept_interrupt(), 0x40);
        // staying low is no new edge
        pio.finish_interrupt();
        pio.put_in_value_port_b(0x00, 0x01);
        assert!(!pio.interrupt_requested());
    }

    #[test]
    fn test_soft_reset_keeps_output_latch() {
        let mut pio = Z80Pio::new();
        pio.write_control_a(0x0F);
        pio.write_data_a(0x33);
        pio.reset(false);
        pio.write_control_a(0x0F);
        assert_eq!(pio.read_data_a(), 0x33);
        pio.reset(true);
        pio.write_control_a(0x0F);
        assert_eq!(pio.read_data_a(), 0x00);
    }
}
