//! Printer output of the emulated systems.
//!
//! Every print path of a system (intercepted ROM print calls, user port
//! Centronics, SIO printer module) ends in one [`PrintSink`].

use std::sync::{Arc, Mutex};

/// Receiver of the printed byte stream.
pub trait PrintSink: Send {
    fn print(&mut self, byte: u8);

    /// Printer reset (init call of the printer driver).
    fn reset(&mut self) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPrinter;

impl PrintSink for NullPrinter {
    fn print(&mut self, _byte: u8) {}
}

/// Collects the output in memory. Clones share the buffer, so a test can
/// keep one handle while the system owns another.
#[derive(Debug, Default, Clone)]
pub struct BufferedPrinter {
    data: Arc<Mutex<Vec<u8>>>,
    resets: Arc<Mutex<u32>>,
}

impl BufferedPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> Vec<u8> {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Output as string (lossy UTF-8 conversion).
    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output()).into_owned()
    }

    pub fn reset_count(&self) -> u32 {
        self.resets.lock().map(|r| *r).unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut d) = self.data.lock() {
            d.clear();
        }
    }
}

impl PrintSink for BufferedPrinter {
    fn print(&mut self, byte: u8) {
        if let Ok(mut d) = self.data.lock() {
            d.push(byte);
        }
    }

    fn reset(&mut self) {
        if let Ok(mut r) = self.resets.lock() {
            *r += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_printer_shares_buffer() {
        let printer = BufferedPrinter::new();
        let mut sink: Box<dyn PrintSink> = Box::new(printer.clone());
        sink.print(b'H');
        sink.print(b'i');
        sink.reset();
        assert_eq!(printer.output_string(), "Hi");
        assert_eq!(printer.reset_count(), 1);
        printer.clear();
        assert!(printer.output().is_empty());
    }
}
