//! KC85 expansion modules.

pub mod d004;

pub use d004::D004;

use crate::emulator::ResetLevel;

/// Status bit: module memory switched on.
pub const STATUS_ENABLED: u8 = 0x01;

/// Module plugged into a KC85 slot, addressed by the slot byte and
/// identified by its type byte.
pub trait Kc85Module {
    fn slot(&self) -> u8;

    fn type_byte(&self) -> u8;

    fn module_name(&self) -> &str;

    fn status(&self) -> u8;

    /// Control byte written by the slot switch command.
    fn set_status(&mut self, value: u8);

    fn is_enabled(&self) -> bool {
        self.status() & STATUS_ENABLED != 0
    }

    /// Byte answered by the module; `None` if it does not decode `addr`.
    fn read_mem(&self, _addr: u16) -> Option<u8> {
        None
    }

    fn read_io(&mut self, _port: u16) -> Option<u8> {
        None
    }

    /// `true` if the module took the write.
    fn write_io(&mut self, _port: u16, _value: u8) -> bool {
        false
    }

    fn reset(&mut self, _level: ResetLevel) {}

    /// Host T-states elapsed.
    fn tick(&mut self, _tstates: u32) {}
}
