//! Keyboard matrices of the Z1013 (8 columns x 4 rows) and the Z9001
//! (8 columns x 8 rows).
//!
//! Both matrices hold, per column, the bit mask of the rows whose key is
//! pressed. The host system reads the matrix through its keyboard PIO.

use super::Z80Pio;

/// Non-character keys of the host keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKey {
    Backspace,
    Left,
    Right,
    Up,
    Down,
    Escape,
    Enter,
    Space,
    Insert,
    Delete,
    /// F1..F8
    Function(u8),
}

/// Z1013 layout. Row 3 carries the four shift keys S1..S4 in columns 3..6
/// and ENTER in column 7.
///
/// | Layer | Row 0      | Row 1      | Row 2        | Row 3 col 0-2 |
/// |-------|------------|------------|--------------|---------------|
/// | none  | `@ABCDEFG` | `HIJKLMNO` | `PQRSTUVW`   | `XYZ`         |
/// | S1    | `01234567` | `89:;<=>?` | `` !"#$%&'`` | `()*`         |
/// | S2    | `` `abcdefg`` | `hijklmno` | `pqrstuvw` | `xyz`        |
/// | S3    | control codes 0x00..0x1A of the base layer                 |
/// | S4    | cursor and edit keys, `+,-./[\]`                           |
const Z1013_LAYERS: [[&[u8]; 4]; 3] = [
    [b"@ABCDEFG", b"HIJKLMNO", b"PQRSTUVW", b"XYZ"],
    [b"01234567", b"89:;<=>?", b" !\"#$%&'", b"()*"],
    [b"`abcdefg", b"hijklmno", b"pqrstuvw", b"xyz"],
];

/// S4 layer, row 0 and row 1.
const Z1013_S4: [[u8; 8]; 2] = [
    [0x08, 0x09, 0x0A, 0x0B, 0x1B, 0x7F, 0x03, b'^'],
    [b'+', b',', b'-', b'.', b'/', b'[', b'\\', b']'],
];

const Z1013_ENTER_COL: usize = 7;
const Z1013_SHIFT_ROW: u8 = 0x08;

#[derive(Debug, Clone, Default)]
pub struct Z1013Keyboard {
    /// Row bits per column, bit 0 = row 0.
    matrix: [u8; 8],
    selected_col: usize,
}

impl Z1013Keyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.matrix = [0; 8];
        self.selected_col = 0;
    }

    fn press(&mut self, col: usize, row: usize, shift: Option<usize>) {
        self.matrix = [0; 8];
        self.matrix[col] |= 1 << row;
        if let Some(s) = shift {
            self.matrix[3 + s] |= Z1013_SHIFT_ROW;
        }
    }

    /// Press the key combination producing `ch`.
    pub fn set_key_char(&mut self, ch: char) -> bool {
        let Ok(b) = u8::try_from(ch as u32) else {
            return false;
        };
        if b == 0x0D {
            self.matrix = [0; 8];
            self.matrix[Z1013_ENTER_COL] = Z1013_SHIFT_ROW;
            return true;
        }
        for (layer, rows) in Z1013_LAYERS.iter().enumerate() {
            for (row, chars) in rows.iter().enumerate() {
                if let Some(col) = chars.iter().position(|&c| c == b) {
                    self.press(col, row, layer.checked_sub(1));
                    return true;
                }
            }
        }
        if b < 0x20 || b == 0x7F {
            if let Some(pos) = Z1013_S4.iter().flatten().position(|&c| c == b) {
                self.press(pos % 8, pos / 8, Some(3));
                return true;
            }
            // control code: S3 + letter of the base layer
            for (row, chars) in Z1013_LAYERS[0].iter().enumerate() {
                if let Some(col) = chars.iter().position(|&c| c == b + 0x40) {
                    self.press(col, row, Some(2));
                    return true;
                }
            }
            return false;
        }
        if let Some(pos) = Z1013_S4.iter().flatten().position(|&c| c == b) {
            self.press(pos % 8, pos / 8, Some(3));
            return true;
        }
        false
    }

    pub fn set_special_key(&mut self, key: SpecialKey) -> bool {
        let ch: u8 = match key {
            SpecialKey::Backspace | SpecialKey::Left => 0x08,
            SpecialKey::Right => 0x09,
            SpecialKey::Down => 0x0A,
            SpecialKey::Up => 0x0B,
            SpecialKey::Escape => 0x1B,
            SpecialKey::Delete => 0x7F,
            SpecialKey::Enter => 0x0D,
            SpecialKey::Space => 0x20,
            SpecialKey::Insert | SpecialKey::Function(_) => return false,
        };
        self.set_key_char(ch as char)
    }

    pub fn set_key_released(&mut self) {
        self.matrix = [0; 8];
    }

    pub fn set_selected_col(&mut self, col: usize) {
        self.selected_col = col;
    }

    /// Low nibble of PIO port B: pressed rows of the selected column are 0.
    pub fn row_bits(&self) -> u8 {
        let rows = self.matrix.get(self.selected_col).copied().unwrap_or(0);
        !rows & 0x0F
    }

    pub fn put_row_values(&self, pio: &mut Z80Pio) {
        pio.put_in_value_port_b(self.row_bits(), 0x0F);
    }
}

const Z9001_NORMAL: [&[u8; 8]; 6] = [
    b"01234567",
    b"89:;,=.?",
    b"@ABCDEFG",
    b"HIJKLMNO",
    b"PQRSTUVW",
    b"XYZ\0\0\0^\0",
];

const Z9001_SHIFT: [&[u8; 8]; 6] = [
    b"_!\"#$%&'",
    b"()*+<->/",
    b"\0abcdefg",
    b"hijklmno",
    b"pqrstuvw",
    b"xyz\0\0\0\0\0",
];

const Z9001_SHIFT_BIT: (usize, u8) = (0, 0x80);
const Z9001_CONTROL_BIT: (usize, u8) = (2, 0x80);

/// Z9001 matrix on PIO 90: port A drives the columns, port B the rows.
#[derive(Debug, Clone, Default)]
pub struct KeyMatrix8x8 {
    matrix: [u8; 8],
}

impl KeyMatrix8x8 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.matrix = [0; 8];
    }

    pub fn is_pressed(&self) -> bool {
        self.matrix.iter().any(|&m| m != 0)
    }

    fn set_char_in(&mut self, ch: u8, table: &[&[u8; 8]; 6]) -> bool {
        if ch == 0 {
            return false;
        }
        for (row, chars) in table.iter().enumerate() {
            if let Some(col) = chars.iter().position(|&c| c == ch) {
                self.matrix[col] = 1 << row;
                return true;
            }
        }
        false
    }

    fn set_bit(&mut self, (col, mask): (usize, u8)) {
        self.matrix[col] |= mask;
    }

    /// Press the key (with shift or control) producing `ch`.
    pub fn set_key_char(&mut self, ch: char) -> bool {
        let Ok(b) = u8::try_from(ch as u32) else {
            return false;
        };
        if b == b' ' {
            return self.set_special_key(SpecialKey::Space, false);
        }
        self.clear();
        if (1..0x20).contains(&b) {
            let letter = b + 0x40;
            if self.set_char_in(letter, &Z9001_NORMAL) || self.set_char_in(letter, &Z9001_SHIFT) {
                self.set_bit(Z9001_CONTROL_BIT);
                return true;
            }
            false
        } else if self.set_char_in(b, &Z9001_NORMAL) {
            true
        } else if self.set_char_in(b, &Z9001_SHIFT) {
            self.set_bit(Z9001_SHIFT_BIT);
            true
        } else {
            false
        }
    }

    /// Press a special key; F1..F8 are GRAPHIC, COLOR, LIST, RUN, STOP,
    /// PAUSE, CONT and CR LN.
    pub fn set_special_key(&mut self, key: SpecialKey, shift: bool) -> bool {
        self.clear();
        let (col, mask, with_shift) = match key {
            SpecialKey::Backspace => (0, 0x40, false),
            SpecialKey::Left if shift => (3, 0x20, false),
            SpecialKey::Left => (0, 0x40, false),
            SpecialKey::Right if shift => (3, 0x20, false),
            SpecialKey::Right => (1, 0x40, true),
            SpecialKey::Down => (2, 0x40, false),
            SpecialKey::Up => (3, 0x40, false),
            SpecialKey::Escape => (4, 0x40, shift),
            SpecialKey::Enter => (5, 0x40, false),
            SpecialKey::Space => (7, 0x40, false),
            SpecialKey::Insert => (5, 0x20, shift),
            SpecialKey::Delete => (5, 0x20, true),
            SpecialKey::Function(1) => (3, 0x80, false),
            SpecialKey::Function(2) => (1, 0x80, false),
            SpecialKey::Function(3) => (4, 0x80, false),
            SpecialKey::Function(4) => (5, 0x80, false),
            SpecialKey::Function(5) => (6, 0x40, false),
            SpecialKey::Function(6) => (4, 0x20, shift),
            SpecialKey::Function(7) => (4, 0x20, true),
            SpecialKey::Function(8) => (4, 0x40, true),
            SpecialKey::Function(_) => return false,
        };
        if with_shift {
            self.set_bit(Z9001_SHIFT_BIT);
        }
        self.matrix[col] |= mask;
        true
    }

    /// Row lines seen on port B for the column output `col_out` of port A
    /// (active low on both sides).
    pub fn row_value(&self, col_out: u8) -> u8 {
        let cols = !col_out;
        let rows = self
            .matrix
            .iter()
            .enumerate()
            .filter(|&(i, _)| cols & (1 << i) != 0)
            .fold(0u8, |acc, (_, &m)| acc | m);
        !rows
    }

    /// Column lines seen on port A for the row output `row_out` of port B.
    pub fn col_value(&self, row_out: u8) -> u8 {
        let rows = !row_out;
        let cols = self
            .matrix
            .iter()
            .enumerate()
            .filter(|&(_, &m)| rows & m != 0)
            .fold(0u8, |acc, (i, _)| acc | (1 << i));
        !cols
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows_for(kb: &mut Z1013Keyboard, col: usize) -> u8 {
        kb.set_selected_col(col);
        kb.row_bits()
    }

    #[test]
    fn test_z1013_letter_and_shift_layers() {
        let mut kb = Z1013Keyboard::new();
        assert!(kb.set_key_char('K'));
        assert_eq!(rows_for(&mut kb, 3), 0x0D);
        assert_eq!(rows_for(&mut kb, 4), 0x0F);

        assert!(kb.set_key_char('k'));
        assert_eq!(rows_for(&mut kb, 3), 0x0D);
        // S2 in column 4, row 3
        assert_eq!(rows_for(&mut kb, 4), 0x07);

        assert!(kb.set_key_char('\r'));
        assert_eq!(rows_for(&mut kb, 7), 0x07);

        assert!(kb.set_key_char('\x01'));
        assert_eq!(rows_for(&mut kb, 1), 0x0E);
        assert_eq!(rows_for(&mut kb, 5), 0x07);

        kb.set_key_released();
        assert_eq!(rows_for(&mut kb, 1), 0x0F);
        assert!(!kb.set_key_char('\u{00E4}'));
    }

    #[test]
    fn test_z1013_special_keys() {
        let mut kb = Z1013Keyboard::new();
        assert!(kb.set_special_key(SpecialKey::Enter));
        assert_eq!(rows_for(&mut kb, 7), 0x07);
        assert!(kb.set_special_key(SpecialKey::Backspace));
        assert!(!kb.set_special_key(SpecialKey::Insert));
    }

    #[test]
    fn test_z1013_rows_into_pio() {
        let mut kb = Z1013Keyboard::new();
        let mut pio = Z80Pio::new();
        kb.set_key_char('A');
        kb.set_selected_col(1);
        kb.put_row_values(&mut pio);
        assert_eq!(pio.read_data_b() & 0x0F, 0x0E);
    }

    #[test]
    fn test_z9001_matrix_values() {
        let mut kb = KeyMatrix8x8::new();
        assert!(kb.set_key_char('a'));
        // column 1, row 2 plus shift (column 0, row 7)
        assert_eq!(kb.row_value(!0x02), !0x04);
        assert_eq!(kb.row_value(!0x01), !0x80);
        assert_eq!(kb.col_value(!0x04), !0x02);
        assert_eq!(kb.row_value(0xFF), 0xFF);

        assert!(kb.set_key_char('\x03'));
        assert_eq!(kb.row_value(!0x08), !0x04);
        assert_eq!(kb.row_value(!0x04), !0x80);

        assert!(kb.set_special_key(SpecialKey::Enter, false));
        assert_eq!(kb.col_value(!0x40), !0x20);
        kb.clear();
        assert!(!kb.is_pressed());
    }
}
