//! Z80 peripheral chips and I/O cards shared by the emulated systems.
//!
//! The chips are plain state machines: the host system decodes the port
//! address, calls the register accessors and advances time through the
//! `*_update`/`tick` methods. Interrupts run through a daisy chain of
//! [`InterruptSource`]s in priority order.

pub mod ccj;
pub mod ctc;
pub mod extension;
pub mod keyboard;
pub mod pio;
pub mod ram_floppy;
pub mod rtc;
pub mod sio;

pub use ccj::GraphicCcj;
pub use ctc::Z80Ctc;
pub use extension::{ExtensionSlot, IoExtension};
pub use keyboard::{KeyMatrix8x8, SpecialKey, Z1013Keyboard};
pub use pio::{PioMode, Z80Pio};
pub use ram_floppy::{RamFloppy, RamFloppyType};
pub use rtc::Rtc72421;
pub use sio::Z80Sio;

/// One participant of the Z80 interrupt daisy chain (IEI/IEO).
pub trait InterruptSource {
    /// An interrupt is waiting to be accepted.
    fn interrupt_requested(&self) -> bool;

    /// An accepted interrupt has not been finished by RETI yet; blocks all
    /// sources of lower priority.
    fn interrupt_in_service(&self) -> bool;

    /// Interrupt acknowledge cycle; returns the vector byte.
    fn accept_interrupt(&mut self) -> u8;

    /// RETI seen on the bus. Returns `true` if this source finished its
    /// service routine.
    fn finish_interrupt(&mut self) -> bool;
}

/// Whether a source in `chain` may interrupt the CPU now.
pub fn interrupt_pending(chain: &[&dyn InterruptSource]) -> bool {
    for src in chain {
        if src.interrupt_in_service() {
            return false;
        }
        if src.interrupt_requested() {
            return true;
        }
    }
    false
}

/// Acknowledge the highest priority request.
pub fn accept_interrupt(chain: &mut [&mut dyn InterruptSource]) -> Option<u8> {
    for src in chain.iter_mut() {
        if src.interrupt_in_service() {
            return None;
        }
        if src.interrupt_requested() {
            return Some(src.accept_interrupt());
        }
    }
    None
}

/// RETI finishes the highest priority source in service.
pub fn finish_interrupt(chain: &mut [&mut dyn InterruptSource]) {
    for src in chain.iter_mut() {
        if src.finish_interrupt() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Src {
        vector: u8,
        requested: bool,
        in_service: bool,
    }

    impl InterruptSource for Src {
        fn interrupt_requested(&self) -> bool {
            self.requested
        }
        fn interrupt_in_service(&self) -> bool {
            self.in_service
        }
        fn accept_interrupt(&mut self) -> u8 {
            self.requested = false;
            self.in_service = true;
            self.vector
        }
        fn finish_interrupt(&mut self) -> bool {
            std::mem::replace(&mut self.in_service, false)
        }
    }

    #[test]
    fn test_priority_and_blocking() {
        let mut high = Src { vector: 0x10, ..Default::default() };
        let mut low = Src { vector: 0x20, requested: true, ..Default::default() };

        assert!(interrupt_pending(&[&high, &low]));
        assert_eq!(accept_interrupt(&mut [&mut high, &mut low]), Some(0x20));

        // the higher source may nest, the lower one is blocked by itself
        high.requested = true;
        low.requested = true;
        assert!(interrupt_pending(&[&high, &low]));
        assert_eq!(accept_interrupt(&mut [&mut high, &mut low]), Some(0x10));
        assert!(!interrupt_pending(&[&high, &low]));

        finish_interrupt(&mut [&mut high, &mut low]);
        assert!(!high.in_service);
        assert!(low.in_service);
        finish_interrupt(&mut [&mut high, &mut low]);
        assert!(interrupt_pending(&[&high, &low]));
    }
}
