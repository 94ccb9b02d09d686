//! Z1013 / Z9001 Home Computer Emulator Core
//!
//! This crate provides the core components for emulating the East German
//! 8-bit home computers:
//! - Bus dispatchers for the Z1013, the Z9001/KC85/1/KC87 family and the
//!   Huebler graphic computer, plus the KC85 floppy module D004
//! - Z80 peripheral chips (PIO, CTC, SIO), RAM floppies, RTC and graphics cards
//! - Floppy disk images (CPCEMU, AnaDisk, plain) with a disk station and 8272 FDC
//!
//! # Architecture
//!
//! The emulator uses a layered design:
//! - `Machine` trait: memory, I/O ports, timing and interrupts of one system
//! - `KcSystem` trait: keyboard, paste, screen text and settings on top of it
//! - `FloppyDisk` trait: sector access to a disk image
//! - `Emulator`: drives a Z80 against a `Machine` with PC intercepts

pub mod config;
pub mod devices;
pub mod disk;
pub mod emulator;
pub mod error;
pub mod fdc;
pub mod printer;
pub mod resources;
pub mod system;

pub use config::Properties;
pub use disk::{DiskStation, FloppyDisk};
pub use emulator::{Emulator, ExitInfo, ExitReason, Machine, ResetLevel};
pub use error::{KcError, KcResult};
pub use printer::{BufferedPrinter, NullPrinter, PrintSink};
pub use resources::RomResources;
pub use system::{AnySystem, KcSystem, SystemKind};
