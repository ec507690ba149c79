//! Kernel log sink.
//!
//! Subsystem code logs through the [`log`] macros. On the bare-metal target the
//! kernel installs [`SerialLogger`] at boot, which writes one line per record
//! to the COM1 serial port. Without a logger installed (e.g. host tests) the
//! macros compile down to a level check and nothing is written. Off the
//! bare-metal target the serial port is never touched.

use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

#[cfg(all(target_os = "none", any(target_arch = "x86", target_arch = "x86_64")))]
mod port {
    use core::arch::asm;

    const IO_BASE: u16 = 0x3f8;
    pub const RBR: u16 = IO_BASE; // Receiver Buffer Reg (read-only)
    pub const THR: u16 = IO_BASE; // Transmitter Holding Reg (write-only)
    pub const IER: u16 = IO_BASE + 1; // Interrupt Enable Reg
    pub const FCR: u16 = IO_BASE + 2; // FIFO Control Reg (write-only)
    pub const LCR: u16 = IO_BASE + 3; // Line Control Register
    pub const MCR: u16 = IO_BASE + 4; // MODEM Control Register
    pub const LSR: u16 = IO_BASE + 5; // Line Status Register (read-only)

    pub unsafe fn outb(port: u16, byte: u8) {
        asm!("out dx, al", in("dx") port, in("al") byte)
    }

    pub unsafe fn inb(port: u16) -> u8 {
        let res: u8;
        asm!("in al, dx", in("dx") port, out("al") res);
        res
    }
}

pub struct SerialWriter {
    #[cfg_attr(not(target_os = "none"), allow(dead_code))]
    initialized: bool,
}

impl SerialWriter {
    #[cfg(all(target_os = "none", any(target_arch = "x86", target_arch = "x86_64")))]
    fn ensure_initialized(&mut self) {
        use port::*;

        if self.initialized {
            return;
        }

        // SAFETY: Follows the correct proceedure for initializing serial ports.
        unsafe {
            // https://wiki.osdev.org/Serial_Ports#Initialization
            outb(IER, 0x00);
            outb(LCR, 0x80);
            outb(THR, 0x03);
            outb(IER, 0x00);
            outb(LCR, 0x03);
            outb(FCR, 0xC7);
            outb(MCR, 0x0B);

            outb(MCR, 0x1E); // Enable loopback.

            const EXPECTED: u8 = 0xAE;
            outb(THR, EXPECTED);
            let actual = inb(RBR);
            assert!(
                actual == EXPECTED,
                "faulty serial, expected {EXPECTED:#X}, got {actual:#X}"
            );

            outb(MCR, 0x0F); // Disable loopback.
        }
        self.initialized = true;
    }
}

impl Write for SerialWriter {
    #[cfg(all(target_os = "none", any(target_arch = "x86", target_arch = "x86_64")))]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        use port::*;

        self.ensure_initialized();
        for b in s.bytes() {
            // SAFETY: Correctly waits before outputting byte to serial port.
            unsafe {
                while inb(LSR) & 0x20 == 0 {}
                outb(THR, b);
            }
        }
        Ok(())
    }

    #[cfg(not(all(target_os = "none", any(target_arch = "x86", target_arch = "x86_64"))))]
    fn write_str(&mut self, _s: &str) -> fmt::Result {
        Err(fmt::Error)
    }
}

pub static mut SERIAL_WRITER: SerialWriter = SerialWriter { initialized: false };

/// Writes log records to the serial port, one `[LEVEL target] message` line each.
pub struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // SAFETY: Single core; records are emitted with the frame table or
        // swap lock held, never from interrupt context.
        let writer = unsafe { &mut *core::ptr::addr_of_mut!(SERIAL_WRITER) };
        let _ = writeln!(
            writer,
            "[{:<5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Installs [`SerialLogger`] as the global logger.
///
/// Fails if a logger was already installed.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
