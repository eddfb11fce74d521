//! 16550A serial console component (minimal)
//!
//! A MINIMAL implementation for kernel debug output only: polled writes to
//! a PC UART (COM1 by default). No interrupts, no RX path, no buffering -
//! those belong to a user-space serial driver.

use super::Console;
use core::sync::atomic::{AtomicBool, Ordering};
use x86_64::instructions::port::Port;

/// Serial console component configuration
#[derive(Clone, Copy)]
pub struct SerialConfig {
    /// IO port base (0x3f8 for COM1)
    pub io_base: u16,
}

/// 16550A minimal console (kernel component)
///
/// Assumes nothing about firmware state: `init()` programs 115200 8N1 with
/// FIFOs enabled. Writes poll the line-status register.
pub struct SerialConsole {
    io_base: u16,
    initialized: AtomicBool,
}

impl SerialConsole {
    /// Create a new serial console from configuration
    pub const fn new(config: SerialConfig) -> Self {
        Self {
            io_base: config.io_base,
            initialized: AtomicBool::new(false),
        }
    }

    /// Program the UART: 115200 baud, 8 data bits, no parity, one stop bit,
    /// FIFOs enabled and cleared.
    pub fn init(&self) {
        unsafe {
            let base = self.io_base;
            Port::<u8>::new(base + 1).write(0x00u8); // disable interrupts
            Port::<u8>::new(base + 3).write(0x80u8); // DLAB on
            Port::<u8>::new(base).write(0x01u8); // divisor low: 115200
            Port::<u8>::new(base + 1).write(0x00u8); // divisor high
            Port::<u8>::new(base + 3).write(0x03u8); // 8N1, DLAB off
            Port::<u8>::new(base + 2).write(0xc7u8); // FIFO on, clear, 14-byte trigger
            Port::<u8>::new(base + 4).write(0x0bu8); // DTR | RTS | OUT2
        }
        self.initialized.store(true, Ordering::Release);
    }

    #[inline]
    fn tx_ready(&self) -> bool {
        // LSR bit 5: transmitter holding register empty
        unsafe { Port::<u8>::new(self.io_base + 5).read() & 0x20 != 0 }
    }
}

impl Console for SerialConsole {
    fn putc(&self, c: u8) {
        if !self.initialized.load(Ordering::Acquire) {
            return;
        }
        while !self.tx_ready() {
            core::hint::spin_loop();
        }
        unsafe {
            Port::<u8>::new(self.io_base).write(c);
        }
    }
}
