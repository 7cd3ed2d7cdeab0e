//! Console output for the Rook kernel.
//!
//! Operator-visible diagnostics go through `print!`/`println!`; the noisier
//! paging traces use `dbgln!` and only compile in with the `mm_debug`
//! feature. Kernel builds write to the QEMU debug port; test builds capture
//! output into a buffer.

use core::fmt::{self, Write};
use spin::Mutex;

/// QEMU isa-debugcon port
#[cfg(all(target_arch = "x86", not(test)))]
const DEBUGCON_PORT: u16 = 0xe9;

/// Console writer interface
pub struct Console {
    #[cfg(test)]
    buffer: heapless::String<4096>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            #[cfg(test)]
            buffer: heapless::String::new(),
        }
    }

    /// Write a byte to the console
    pub fn write_byte(&mut self, byte: u8) {
        #[cfg(test)]
        {
            if byte.is_ascii() {
                let _ = self.buffer.push(byte as char);
            }
        }

        #[cfg(all(target_arch = "x86", not(test)))]
        // SAFETY: the debugcon port is write-only and side-effect free.
        unsafe {
            core::arch::asm!("out dx, al", in("dx") DEBUGCON_PORT, in("al") byte, options(nomem, nostack));
        }

        #[cfg(all(not(target_arch = "x86"), not(test)))]
        let _ = byte;
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
    }

    /// Clear the console
    pub fn clear(&mut self) {
        #[cfg(test)]
        self.buffer.clear();
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_str(s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Print macro for kernel use
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

/// Paging trace macro, compiled in only with the `mm_debug` feature.
#[macro_export]
macro_rules! dbgln {
    ($($arg:tt)*) => {{
        #[cfg(feature = "mm_debug")]
        {
            $crate::console::print(format_args!("{}\n", format_args!($($arg)*)));
        }
        #[cfg(not(feature = "mm_debug"))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_write() {
        let mut console = Console::new();
        console.write_str("Hello, Rook!");
        assert!(console.buffer.contains("Hello, Rook!"));
    }

    #[test]
    fn test_console_formatting() {
        let mut console = Console::new();
        write!(&mut console, "Test {}", 42).unwrap();
        assert!(console.buffer.contains("Test 42"));
    }
}
