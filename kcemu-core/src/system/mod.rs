//! The emulated computers.
//!
//! Each system is a [`Machine`] for the emulation loop plus the host-side
//! surface of [`KcSystem`]: keyboard, paste, screen text and settings.

pub mod huebler;
pub mod kc85;
pub mod z1013;
pub mod z9001;

use std::sync::Arc;

use rand::Rng;

use crate::config::Properties;
use crate::devices::SpecialKey;
use crate::disk::station::SharedDiskStation;
use crate::emulator::Machine;
use crate::printer::PrintSink;
use crate::resources::RomResources;

pub use huebler::HueblerMc;
pub use z1013::Z1013;
pub use z9001::Z9001;

/// Property holding the system name, e.g. `Z1013.64` or `KC87`.
pub const PROP_SYSNAME: &str = "jkcemu.system";

/// Common settings key suffixes.
pub const PROP_OS_FILE: &str = "os.file";
pub const PROP_PASTE_FAST: &str = "paste.fast";
pub const PROP_CATCH_PRINT_CALLS: &str = "catch_print_calls";
pub const PROP_FDC_ENABLED: &str = "floppydisk.enabled";
pub const PROP_RTC_ENABLED: &str = "rtc.enabled";
pub const PROP_RELOAD_ROMS: &str = "external_rom.reload_on_poweron";
pub const PROP_RF1_PREFIX: &str = "ramfloppy.1.";
pub const PROP_RF2_PREFIX: &str = "ramfloppy.2.";

/// Joystick action bits.
pub const JOY_LEFT: u8 = 0x01;
pub const JOY_RIGHT: u8 = 0x02;
pub const JOY_DOWN: u8 = 0x04;
pub const JOY_UP: u8 = 0x08;
pub const JOY_BUTTONS: u8 = 0x10;

/// T-states between two activity decays of the disk station.
pub(crate) const DISK_TICK_TSTATES: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemKind {
    Z1013,
    Z9001,
    Huebler,
}

impl SystemKind {
    /// System selected by [`PROP_SYSNAME`]; unknown names fall back to the
    /// Z1013.
    pub fn from_settings(props: &Properties) -> Self {
        let name = props.get_str(PROP_SYSNAME).unwrap_or_default();
        Self::from_name(name).unwrap_or(SystemKind::Z1013)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        if upper.starts_with("Z1013") {
            Some(SystemKind::Z1013)
        } else if upper.starts_with("Z9001") || upper.starts_with("KC87") || upper.starts_with("KC85/1") {
            Some(SystemKind::Z9001)
        } else if upper.starts_with("HUEBLER") || upper.starts_with("HGMC") {
            Some(SystemKind::Huebler)
        } else {
            None
        }
    }
}

/// Host-side operations shared by all systems.
pub trait KcSystem: Machine {
    fn title(&self) -> &str;

    /// Columns and rows of the text screen.
    fn screen_size(&self) -> (usize, usize);

    fn screen_char(&self, col: usize, row: usize) -> Option<char>;

    /// Text screen content, trailing blanks of each row removed.
    fn screen_text(&self) -> String {
        let (cols, rows) = self.screen_size();
        let mut text = String::new();
        for row in 0..rows {
            let line: String = (0..cols)
                .map(|col| self.screen_char(col, row).unwrap_or(' '))
                .collect();
            text.push_str(line.trim_end());
            text.push('\n');
        }
        text
    }

    fn key_typed(&mut self, ch: char) -> bool;

    fn key_pressed(&mut self, key: SpecialKey, shift: bool) -> bool;

    fn key_released(&mut self);

    /// Queue text for fast pasting; `false` if the system cannot paste
    /// fast with the current settings.
    fn paste(&mut self, text: &str) -> bool;

    /// Apply changed settings in place; `false` means a new instance is
    /// required.
    fn apply_settings(&mut self, props: &Properties) -> bool;

    fn set_printer(&mut self, printer: Box<dyn PrintSink>);

    /// Joystick `num` moved; `actions` is a combination of the `JOY_*` bits.
    fn set_joystick(&mut self, _num: usize, _actions: u8) {}

    /// The screen geometry changed since the last call.
    fn take_screen_resized(&mut self) -> bool {
        false
    }

    fn disk_station(&self) -> Option<SharedDiskStation> {
        None
    }
}

/// One of the systems, chosen at run time from [`PROP_SYSNAME`].
pub enum AnySystem {
    Z1013(Z1013),
    Z9001(Z9001),
    Huebler(HueblerMc),
}

impl AnySystem {
    pub fn create(props: &Properties, resources: Arc<RomResources>) -> Self {
        match SystemKind::from_settings(props) {
            SystemKind::Z1013 => AnySystem::Z1013(Z1013::new(props, resources)),
            SystemKind::Z9001 => AnySystem::Z9001(Z9001::new(props, resources)),
            SystemKind::Huebler => AnySystem::Huebler(HueblerMc::new(props, resources)),
        }
    }

    pub fn kind(&self) -> SystemKind {
        match self {
            AnySystem::Z1013(_) => SystemKind::Z1013,
            AnySystem::Z9001(_) => SystemKind::Z9001,
            AnySystem::Huebler(_) => SystemKind::Huebler,
        }
    }
}

/// Uninitialised RAM content.
pub(crate) fn fill_random(buf: &mut [u8]) {
    rand::rng().fill(buf);
}

/// ROM image from an external file only (no bundled fallback).
pub(crate) fn read_rom_file(props: &Properties, key: &str) -> Option<Arc<[u8]>> {
    let file = props.get_str(key)?;
    match std::fs::read(file) {
        Ok(data) if !data.is_empty() => Some(data.into()),
        Ok(_) => {
            log::warn!("ROM file {} is empty", file);
            None
        }
        Err(e) => {
            log::warn!("cannot read ROM file {}: {}", file, e);
            None
        }
    }
}

pub(crate) fn rom_byte(rom: Option<&Arc<[u8]>>, idx: usize) -> Option<u8> {
    rom.and_then(|r| r.get(idx).copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_kind_from_name() {
        assert_eq!(SystemKind::from_name("Z1013.64"), Some(SystemKind::Z1013));
        assert_eq!(SystemKind::from_name("KC87"), Some(SystemKind::Z9001));
        assert_eq!(SystemKind::from_name("kc85/1"), Some(SystemKind::Z9001));
        assert_eq!(SystemKind::from_name("HueblerGraphicsMC"), Some(SystemKind::Huebler));
        assert_eq!(SystemKind::from_name("KC85/4"), None);
        assert_eq!(SystemKind::from_settings(&Properties::new()), SystemKind::Z1013);
    }

    #[test]
    fn test_fill_random_changes_content() {
        let mut buf = [0u8; 256];
        fill_random(&mut buf);
        assert!(buf.iter().any(|&b| b != 0));
    }
}
