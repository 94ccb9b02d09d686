//! Z80 SIO (U856) serial controller, asynchronous byte level only.
//!
//! Bits on the line are not modelled. A byte written to the transmit
//! register is handed to the host immediately through
//! [`Z80Sio::take_transmitted`]; received bytes are queued with
//! [`Z80Sio::receive`].

use std::collections::VecDeque;

use super::InterruptSource;

const RR0_RX_AVAILABLE: u8 = 0x01;
const RR0_TX_EMPTY: u8 = 0x04;
const RR0_DCD: u8 = 0x08;
const RR0_CTS: u8 = 0x20;
const RR1_ALL_SENT: u8 = 0x01;

#[derive(Debug, Clone, Default)]
struct SioChannel {
    /// Write registers WR0..WR7.
    wr: [u8; 8],
    pointer: usize,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    tx_int_pending: bool,
}

impl SioChannel {
    fn reset(&mut self) {
        *self = SioChannel::default();
    }

    fn rx_enabled(&self) -> bool {
        self.wr[3] & 0x01 != 0
    }

    fn tx_enabled(&self) -> bool {
        self.wr[5] & 0x08 != 0
    }

    fn rx_int_enabled(&self) -> bool {
        self.wr[1] & 0x18 != 0
    }

    fn tx_int_enabled(&self) -> bool {
        self.wr[1] & 0x02 != 0
    }

    fn rx_int(&self) -> bool {
        self.rx_int_enabled() && !self.rx.is_empty()
    }

    fn tx_int(&self) -> bool {
        self.tx_int_enabled() && self.tx_int_pending
    }
}

#[derive(Debug, Clone, Default)]
pub struct Z80Sio {
    ch: [SioChannel; 2],
    in_service: bool,
}

impl Z80Sio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.ch[0].reset();
        self.ch[1].reset();
        self.in_service = false;
    }

    pub fn write_control(&mut self, channel: usize, value: u8) {
        let idx = channel & 1;
        let ch = &mut self.ch[idx];
        let reg = ch.pointer;
        ch.pointer = 0;
        if reg != 0 {
            ch.wr[reg] = value;
            return;
        }
        ch.wr[0] = value;
        ch.pointer = (value & 0x07) as usize;
        match (value >> 3) & 0x07 {
            // channel reset
            3 => ch.reset(),
            // reset transmit interrupt pending
            5 => ch.tx_int_pending = false,
            // return from interrupt, channel A only
            7 if idx == 0 => self.in_service = false,
            _ => {}
        }
    }

    pub fn read_control(&self, channel: usize) -> u8 {
        let idx = channel & 1;
        let ch = &self.ch[idx];
        match ch.pointer {
            1 => RR1_ALL_SENT,
            2 if idx == 1 => self.vector(),
            _ => {
                let mut rr0 = RR0_TX_EMPTY | RR0_DCD | RR0_CTS;
                if !ch.rx.is_empty() {
                    rr0 |= RR0_RX_AVAILABLE;
                }
                rr0
            }
        }
    }

    pub fn write_data(&mut self, channel: usize, value: u8) {
        let ch = &mut self.ch[channel & 1];
        if ch.tx_enabled() {
            ch.tx.push(value);
            ch.tx_int_pending = true;
        }
    }

    pub fn read_data(&mut self, channel: usize) -> u8 {
        self.ch[channel & 1].rx.pop_front().unwrap_or(0)
    }

    /// Bytes sent since the last call.
    pub fn take_transmitted(&mut self, channel: usize) -> Vec<u8> {
        std::mem::take(&mut self.ch[channel & 1].tx)
    }

    pub fn receive(&mut self, channel: usize, value: u8) {
        let ch = &mut self.ch[channel & 1];
        if ch.rx_enabled() {
            ch.rx.push_back(value);
        }
    }

    /// Interrupt vector from WR2 of channel B, modified by the status if
    /// WR1 bit 2 of channel B is set.
    fn vector(&self) -> u8 {
        let base = self.ch[1].wr[2];
        if self.ch[1].wr[1] & 0x04 == 0 {
            return base;
        }
        let code = if self.ch[0].rx_int() {
            6
        } else if self.ch[0].tx_int() {
            4
        } else if self.ch[1].rx_int() {
            2
        } else if self.ch[1].tx_int() {
            0
        } else {
            3
        };
        (base & 0xF1) | (code << 1)
    }
}

impl InterruptSource for Z80Sio {
    fn interrupt_requested(&self) -> bool {
        !self.in_service && self.ch.iter().any(|c| c.rx_int() || c.tx_int())
    }

    fn interrupt_in_service(&self) -> bool {
        self.in_service
    }

    fn accept_interrupt(&mut self) -> u8 {
        let vector = self.vector();
        self.in_service = true;
        // the transmit interrupt is taken with its acknowledge
        if let Some(ch) = self.ch.iter_mut().find(|c| !c.rx_int() && c.tx_int()) {
            ch.tx_int_pending = false;
        }
        vector
    }

    fn finish_interrupt(&mut self) -> bool {
        std::mem::replace(&mut self.in_service, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmit_to_host() {
        let mut sio = Z80Sio::new();
        sio.write_data(0, b'X');
        assert!(sio.take_transmitted(0).is_empty());

        sio.write_control(0, 0x05);
        sio.write_control(0, 0x68); // tx enable, 8 bit
        sio.write_data(0, b'A');
        sio.write_data(0, b'B');
        assert_eq!(sio.take_transmitted(0), b"AB");
        assert!(sio.take_transmitted(0).is_empty());
        assert_eq!(sio.read_control(0) & RR0_TX_EMPTY, RR0_TX_EMPTY);
    }

    #[test]
    fn test_receive_with_status_vector() {
        let mut sio = Z80Sio::new();
        sio.write_control(1, 0x02);
        sio.write_control(1, 0x80); // vector
        sio.write_control(1, 0x01);
        sio.write_control(1, 0x04); // status affects vector
        sio.write_control(0, 0x03);
        sio.write_control(0, 0xC1); // rx enable
        sio.write_control(0, 0x01);
        sio.write_control(0, 0x18); // rx interrupt on all chars

        sio.receive(0, 0x55);
        assert_eq!(sio.read_control(0) & RR0_RX_AVAILABLE, RR0_RX_AVAILABLE);
        assert!(sio.interrupt_requested());
        assert_eq!(sio.accept_interrupt(), 0x8C);
        assert_eq!(sio.read_data(0), 0x55);
        assert!(sio.finish_interrupt());
        assert!(!sio.interrupt_requested());
    }
}
