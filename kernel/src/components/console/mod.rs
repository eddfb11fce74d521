//! Console component trait
//!
//! Provides a minimal console interface for kernel debug output.
//! This is NOT a full UART driver - just enough for `kprintln!` to work.
//!
//! Full UART drivers with interrupts and buffering live in user-space
//! servers; the kernel only needs a synchronous byte sink for its own log.

pub mod null;
pub mod serial16550;

/// Console trait for kernel debug output
///
/// Kernel components implement this trait to provide debug console
/// functionality. This is minimal by design - only `putc()` for character
/// output plus a default `puts()`.
pub trait Console: Send + Sync {
    /// Write a single character to the console
    ///
    /// This is a blocking operation. The implementation should wait for
    /// the hardware to be ready before writing.
    fn putc(&self, c: u8);

    /// Write a string to the console
    ///
    /// Default implementation writes character by character.
    fn puts(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.putc(b'\r'); // CRLF for terminals
            }
            self.putc(byte);
        }
    }
}
