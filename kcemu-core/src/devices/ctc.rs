//! Z80 CTC (U857) counter/timer circuit with four channels.
//!
//! # Channel control word (bit 0 = 1)
//!
//! | Bit | Meaning                                   |
//! |-----|-------------------------------------------|
//! | 7   | interrupt enable                          |
//! | 6   | counter mode (1) / timer mode (0)         |
//! | 5   | prescaler 256 (1) / 16 (0), timer mode    |
//! | 4   | rising edge (counter mode)                |
//! | 3   | timer waits for trigger                   |
//! | 2   | time constant follows                     |
//! | 1   | software reset                            |
//!
//! A byte with bit 0 = 0 written to channel 0 is the interrupt vector; the
//! channel number is inserted into bits 1-2.

use super::InterruptSource;

#[derive(Debug, Clone, Default)]
struct Channel {
    control: u8,
    time_constant: u16,
    counter: u16,
    /// T-states collected towards the next prescaler tick.
    prescale: u32,
    running: bool,
    expect_tc: bool,
    int_requested: bool,
    int_in_service: bool,
}

impl Channel {
    fn int_enabled(&self) -> bool {
        self.control & 0x80 != 0
    }

    fn counter_mode(&self) -> bool {
        self.control & 0x40 != 0
    }

    fn prescaler(&self) -> u32 {
        if self.control & 0x20 != 0 {
            256
        } else {
            16
        }
    }

    /// Counts `n` pulses; returns the number of zero passes.
    fn count(&mut self, mut n: u32) -> u32 {
        let mut zero = 0;
        while n > 0 {
            let step = n.min(self.counter as u32);
            self.counter -= step as u16;
            n -= step;
            if self.counter == 0 {
                zero += 1;
                self.counter = self.time_constant;
                if self.int_enabled() {
                    self.int_requested = true;
                }
            }
        }
        zero
    }
}

#[derive(Debug, Clone, Default)]
pub struct Z80Ctc {
    channels: [Channel; 4],
    vector: u8,
}

impl Z80Ctc {
    pub fn new() -> Self {
        Self::default()
    }

    /// `hard` also clears the interrupt vector.
    pub fn reset(&mut self, hard: bool) {
        for ch in self.channels.iter_mut() {
            *ch = Channel {
                time_constant: ch.time_constant,
                ..Channel::default()
            };
        }
        if hard {
            self.vector = 0;
        }
    }

    /// Current down counter value.
    pub fn read(&self, channel: usize) -> u8 {
        let ch = &self.channels[channel & 3];
        (ch.counter & 0xFF) as u8
    }

    pub fn write(&mut self, channel: usize, value: u8) {
        let idx = channel & 3;
        let ch = &mut self.channels[idx];
        if ch.expect_tc {
            ch.expect_tc = false;
            ch.time_constant = if value == 0 { 256 } else { value as u16 };
            ch.counter = ch.time_constant;
            ch.prescale = 0;
            ch.running = true;
        } else if value & 0x01 != 0 {
            ch.control = value;
            if value & 0x02 != 0 {
                ch.running = false;
                ch.int_requested = false;
            }
            ch.expect_tc = value & 0x04 != 0;
            if !ch.int_enabled() {
                ch.int_requested = false;
            }
        } else if idx == 0 {
            self.vector = value & 0xF8;
        }
    }

    /// Advance the timers by `tstates` of the system clock. Returns the
    /// number of zero-count pulses per channel.
    pub fn system_update(&mut self, tstates: u32) -> [u32; 4] {
        let mut zc = [0; 4];
        for (i, ch) in self.channels.iter_mut().enumerate() {
            if !ch.running || ch.counter_mode() || ch.time_constant == 0 {
                continue;
            }
            ch.prescale += tstates;
            let ticks = ch.prescale / ch.prescaler();
            ch.prescale %= ch.prescaler();
            if ticks > 0 {
                zc[i] = ch.count(ticks);
            }
        }
        zc
    }

    /// External pulses on the CLK/TRG input of a channel in counter mode.
    pub fn external_update(&mut self, channel: usize, pulses: u32) -> u32 {
        let ch = &mut self.channels[channel & 3];
        if ch.running && ch.counter_mode() && ch.time_constant > 0 {
            ch.count(pulses)
        } else {
            0
        }
    }
}

impl InterruptSource for Z80Ctc {
    fn interrupt_requested(&self) -> bool {
        for ch in &self.channels {
            if ch.int_in_service {
                return false;
            }
            if ch.int_requested {
                return true;
            }
        }
        false
    }

    fn interrupt_in_service(&self) -> bool {
        self.channels.iter().any(|c| c.int_in_service)
    }

    fn accept_interrupt(&mut self) -> u8 {
        for (i, ch) in self.channels.iter_mut().enumerate() {
            if ch.int_requested {
                ch.int_requested = false;
                ch.int_in_service = true;
                return self.vector | ((i as u8) << 1);
            }
        }
        0xFF
    }

    fn finish_interrupt(&mut self) -> bool {
        match self.channels.iter_mut().find(|c| c.int_in_service) {
            Some(ch) => {
                ch.int_in_service = false;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_prescaler_16() {
        let mut ctc = Z80Ctc::new();
        ctc.write(1, 0x05); // timer, prescaler 16, constant follows
        ctc.write(1, 10);
        assert_eq!(ctc.read(1), 10);
        assert_eq!(ctc.system_update(16 * 4), [0, 0, 0, 0]);
        assert_eq!(ctc.read(1), 6);
        assert_eq!(ctc.system_update(16 * 6 + 15), [0, 1, 0, 0]);
        assert_eq!(ctc.read(1), 10);
        assert_eq!(ctc.system_update(1), [0, 0, 0, 0]);
        assert_eq!(ctc.read(1), 9);
    }

    #[test]
    fn test_counter_mode_and_vector() {
        let mut ctc = Z80Ctc::new();
        ctc.write(0, 0x40);
        ctc.write(3, 0xC5); // interrupt, counter, constant follows
        ctc.write(3, 2);
        assert_eq!(ctc.system_update(10_000), [0; 4]);
        assert_eq!(ctc.external_update(3, 5), 2);
        assert!(ctc.interrupt_requested());
        assert_eq!(ctc.accept_interrupt(), 0x46);
        assert!(ctc.finish_interrupt());
        assert!(!ctc.interrupt_in_service());
    }

    #[test]
    fn test_software_reset_stops_channel() {
        let mut ctc = Z80Ctc::new();
        ctc.write(0, 0x05);
        ctc.write(0, 1);
        assert_eq!(ctc.system_update(32)[0], 2);
        ctc.write(0, 0x03);
        assert_eq!(ctc.system_update(32)[0], 0);
    }
}
