//! 80 column graphic card (CCJ) for the Z1013.
//!
//! The card has its own text RAM and is programmed through two ports: an
//! argument latch (0x18 write) and a command register (0x19 write).
//! Reading 0x18 returns the status, reading 0x19 returns the character at
//! the address pointer and advances it.
//!
//! | Cmd | Action                                          |
//! |-----|-------------------------------------------------|
//! | 1   | address pointer, low byte = argument            |
//! | 2   | address pointer, high byte = argument           |
//! | 3   | store argument at the pointer, pointer + 1      |
//! | 4   | fill the text RAM with the argument             |
//! | 5   | cursor position = pointer                       |

pub const COLUMNS: usize = 80;
pub const ROWS: usize = 24;

const RAM_SIZE: usize = 0x800;
const STATUS_READY: u8 = 0x80;

#[derive(Debug, Clone)]
pub struct GraphicCcj {
    ram: Vec<u8>,
    arg: u8,
    addr: usize,
    cursor: usize,
}

impl Default for GraphicCcj {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicCcj {
    pub fn new() -> Self {
        Self {
            ram: vec![0x20; RAM_SIZE],
            arg: 0,
            addr: 0,
            cursor: 0,
        }
    }

    pub fn reset(&mut self) {
        self.arg = 0;
        self.addr = 0;
        self.cursor = 0;
    }

    pub fn write_arg(&mut self, value: u8) {
        self.arg = value;
    }

    pub fn write_cmd(&mut self, value: u8) {
        match value {
            1 => self.addr = (self.addr & 0xFF00) | self.arg as usize,
            2 => self.addr = (self.addr & 0x00FF) | ((self.arg as usize) << 8),
            3 => {
                let idx = self.addr % RAM_SIZE;
                self.ram[idx] = self.arg;
                self.addr = (self.addr + 1) % RAM_SIZE;
            }
            4 => self.ram.fill(self.arg),
            5 => self.cursor = self.addr % RAM_SIZE,
            _ => log::trace!("CCJ: unknown command {:#04x}", value),
        }
    }

    pub fn read_status(&self) -> u8 {
        STATUS_READY
    }

    pub fn read_data(&mut self) -> u8 {
        let value = self.ram[self.addr % RAM_SIZE];
        self.addr = (self.addr + 1) % RAM_SIZE;
        value
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.cursor % COLUMNS, self.cursor / COLUMNS)
    }

    pub fn screen_char(&self, col: usize, row: usize) -> Option<char> {
        if col >= COLUMNS || row >= ROWS {
            return None;
        }
        match self.ram[row * COLUMNS + col] {
            b @ 0x20..=0x7E => Some(b as char),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(ccj: &mut GraphicCcj, c: u8, arg: u8) {
        ccj.write_arg(arg);
        ccj.write_cmd(c);
    }

    #[test]
    fn test_text_ram_access() {
        let mut ccj = GraphicCcj::new();
        cmd(&mut ccj, 4, b' ');
        cmd(&mut ccj, 1, 81);
        cmd(&mut ccj, 2, 0);
        cmd(&mut ccj, 3, b'O');
        cmd(&mut ccj, 3, b'K');
        assert_eq!(ccj.screen_char(1, 1), Some('O'));
        assert_eq!(ccj.screen_char(2, 1), Some('K'));
        assert_eq!(ccj.screen_char(80, 0), None);

        cmd(&mut ccj, 1, 81);
        cmd(&mut ccj, 5, 0);
        assert_eq!(ccj.cursor(), (1, 1));
        assert_eq!(ccj.read_data(), b'O');
        assert_eq!(ccj.read_data(), b'K');
        assert_eq!(ccj.read_status() & STATUS_READY, STATUS_READY);
    }
}
