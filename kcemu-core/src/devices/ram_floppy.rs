//! RAM floppy: battery-buffered RAM disk on an I/O card.
//!
//! Two interfaces exist:
//!
//! - **MP 3/1988** (Z1013, eight ports): register 0 address low, 1 address
//!   middle, 2 address high, 3 data with auto increment, 4 data without
//!   increment. Registers 5-7 read as `0xFF`.
//! - **Z9001 page scheme**: the host computes the full address from a page
//!   register and the upper port byte and calls [`RamFloppy::get_byte`] /
//!   [`RamFloppy::set_byte`] directly.
//!
//! The content can be loaded from and saved to a file. Settings use the
//! keys `<prefix>kbyte` and `<prefix>file`.

use std::path::{Path, PathBuf};

use crate::config::Properties;
use crate::error::KcResult;

pub const DEFAULT_SIZE_KBYTE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamFloppyType {
    Mp3_1988,
    Z9001Paged,
}

#[derive(Debug, Clone)]
pub struct RamFloppy {
    rf_type: RamFloppyType,
    data: Vec<u8>,
    addr: usize,
    file: Option<PathBuf>,
    dirty: bool,
}

impl RamFloppy {
    pub fn new(rf_type: RamFloppyType, size_kbyte: usize) -> Self {
        Self {
            rf_type,
            data: vec![0; size_kbyte.max(1) * 1024],
            addr: 0,
            file: None,
            dirty: false,
        }
    }

    /// Create from settings; a configured file is loaded, a missing or
    /// unreadable one is logged and leaves the RAM empty.
    pub fn from_settings(rf_type: RamFloppyType, props: &Properties, prefix: &str) -> Self {
        let kbyte = props.get_int(&format!("{}kbyte", prefix), DEFAULT_SIZE_KBYTE as i64);
        let kbyte = if (1..=8192).contains(&kbyte) {
            kbyte as usize
        } else {
            DEFAULT_SIZE_KBYTE
        };
        let mut rf = Self::new(rf_type, kbyte);
        if let Some(file) = props.get_str(&format!("{}file", prefix)) {
            let path = PathBuf::from(file);
            if let Err(e) = rf.load(&path) {
                log::warn!("RAM floppy file {} not loaded: {}", path.display(), e);
            }
            rf.file = Some(path);
        }
        rf
    }

    /// Same type, size and file as the settings would create.
    pub fn complies(&self, rf_type: RamFloppyType, props: &Properties, prefix: &str) -> bool {
        let kbyte = props.get_int(&format!("{}kbyte", prefix), DEFAULT_SIZE_KBYTE as i64);
        let file = props.get_str(&format!("{}file", prefix)).map(PathBuf::from);
        self.rf_type == rf_type && self.size() == kbyte.max(1) as usize * 1024 && self.file == file
    }

    pub fn rf_type(&self) -> RamFloppyType {
        self.rf_type
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn get_byte(&self, addr: usize) -> u8 {
        self.data.get(addr).copied().unwrap_or(0xFF)
    }

    pub fn set_byte(&mut self, addr: usize, value: u8) {
        if let Some(b) = self.data.get_mut(addr) {
            *b = value;
            self.dirty = true;
        }
    }

    pub fn read_byte(&mut self, reg: usize) -> u8 {
        match reg & 7 {
            0 => self.addr as u8,
            1 => (self.addr >> 8) as u8,
            2 => (self.addr >> 16) as u8,
            3 => {
                let value = self.get_byte(self.addr);
                self.advance();
                value
            }
            4 => self.get_byte(self.addr),
            _ => 0xFF,
        }
    }

    pub fn write_byte(&mut self, reg: usize, value: u8) {
        let v = value as usize;
        match reg & 7 {
            0 => self.addr = (self.addr & !0xFF) | v,
            1 => self.addr = (self.addr & !0xFF00) | (v << 8),
            2 => self.addr = (self.addr & 0xFFFF) | (v << 16),
            3 => {
                self.set_byte(self.addr, value);
                self.advance();
            }
            4 => self.set_byte(self.addr, value),
            _ => {}
        }
    }

    fn advance(&mut self) {
        self.addr = (self.addr + 1) % self.data.len().max(1);
    }

    /// Clear the content (power on without battery).
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.addr = 0;
        self.dirty = false;
    }

    /// Load a file; a shorter file leaves the rest zero.
    pub fn load(&mut self, path: &Path) -> KcResult<()> {
        let content = std::fs::read(path)?;
        let n = content.len().min(self.data.len());
        self.data.fill(0);
        self.data[..n].copy_from_slice(&content[..n]);
        self.dirty = false;
        Ok(())
    }

    pub fn save(&mut self, path: &Path) -> KcResult<()> {
        std::fs::write(path, &self.data)?;
        self.dirty = false;
        Ok(())
    }

    /// Write back to the configured file if changed.
    pub fn flush(&mut self) -> KcResult<()> {
        if let (true, Some(path)) = (self.dirty, self.file.clone()) {
            self.save(&path)?;
            log::info!("RAM floppy saved to {}", path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mp3_register_interface() {
        let mut rf = RamFloppy::new(RamFloppyType::Mp3_1988, 128);
        rf.write_byte(0, 0xFE);
        rf.write_byte(1, 0xFF);
        rf.write_byte(2, 0x01);
        rf.write_byte(3, 0x11);
        rf.write_byte(3, 0x22);
        assert_eq!(rf.read_byte(0), 0x00);
        assert_eq!(rf.read_byte(2), 0x00);
        assert_eq!(rf.get_byte(0x1FFFE), 0x11);
        assert_eq!(rf.get_byte(0x1FFFF), 0x22);
        assert!(rf.is_dirty());

        rf.write_byte(2, 0x01);
        rf.write_byte(0, 0xFE);
        rf.write_byte(1, 0xFF);
        assert_eq!(rf.read_byte(4), 0x11);
        assert_eq!(rf.read_byte(3), 0x11);
        assert_eq!(rf.read_byte(3), 0x22);
        assert_eq!(rf.read_byte(6), 0xFF);
    }

    #[test]
    fn test_settings_and_file() {
        let path = std::env::temp_dir().join(format!("kcemu-rf-{}.bin", std::process::id()));
        std::fs::write(&path, [1, 2, 3]).unwrap();
        let props = Properties::from_pairs([
            ("rf.kbyte", "64".to_string()),
            ("rf.file", path.display().to_string()),
        ]);
        let mut rf = RamFloppy::from_settings(RamFloppyType::Z9001Paged, &props, "rf.");
        assert_eq!(rf.size(), 64 * 1024);
        assert_eq!(rf.get_byte(2), 3);
        assert!(rf.complies(RamFloppyType::Z9001Paged, &props, "rf."));
        assert!(!rf.complies(RamFloppyType::Mp3_1988, &props, "rf."));

        rf.set_byte(3, 4);
        rf.flush().unwrap();
        let saved = std::fs::read(&path).unwrap();
        assert_eq!(saved.len(), 64 * 1024);
        assert_eq!(&saved[..4], &[1, 2, 3, 4]);
        let _ = std::fs::remove_file(&path);
    }
}
