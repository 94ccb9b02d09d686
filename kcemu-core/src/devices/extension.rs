//! Pluggable I/O cards (hard disk interface, network, USB) living in a
//! fixed port window of a host system.

/// An I/O card plugged into a port window.
pub trait IoExtension: Send {
    fn name(&self) -> &str;

    /// `None` leaves the bus value to the host.
    fn read(&mut self, port: u16) -> Option<u8>;

    /// Returns `true` if the card took the write.
    fn write(&mut self, port: u16, value: u8) -> bool;

    fn reset(&mut self, _power_on: bool) {}

    /// Time in T-states since the last call.
    fn tick(&mut self, _tstates: u32) {}
}

/// A card decoded at `(port & mask) == base`.
pub struct ExtensionSlot {
    base: u8,
    mask: u8,
    ext: Box<dyn IoExtension>,
}

impl ExtensionSlot {
    pub fn new(base: u8, mask: u8, ext: Box<dyn IoExtension>) -> Self {
        Self { base, mask, ext }
    }

    pub fn matches(&self, port: u16) -> bool {
        (port as u8 & self.mask) == self.base
    }

    pub fn name(&self) -> &str {
        self.ext.name()
    }

    pub fn read(&mut self, port: u16) -> Option<u8> {
        if self.matches(port) {
            self.ext.read(port)
        } else {
            None
        }
    }

    pub fn write(&mut self, port: u16, value: u8) -> bool {
        self.matches(port) && self.ext.write(port, value)
    }

    pub fn reset(&mut self, power_on: bool) {
        self.ext.reset(power_on);
    }

    pub fn tick(&mut self, tstates: u32) {
        self.ext.tick(tstates);
    }
}

impl std::fmt::Debug for ExtensionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionSlot")
            .field("name", &self.ext.name())
            .field("base", &format_args!("{:#04x}", self.base))
            .field("mask", &format_args!("{:#04x}", self.mask))
            .finish()
    }
}
