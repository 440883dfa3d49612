//! Hypervisor print utilities.
//!
//! Output goes to the registered [`Console`]. Until a console is set, output
//! is dropped.

use alloc::boxed::Box;
use spin_lock::SpinLock;

/// A sink for console output, typically a UART driver.
pub trait Console: Send {
    /// Write `s` to the device.
    fn write_str(&mut self, s: &str);
}

struct Writer<'a>(&'a mut dyn Console);

impl core::fmt::Write for Writer<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

static CONSOLE: SpinLock<Option<Box<dyn Console>>> = SpinLock::new(None);

/// Install the console device, returning the previous one.
pub fn set_console(console: Box<dyn Console>) -> Option<Box<dyn Console>> {
    CONSOLE.lock().replace(console)
}

#[doc(hidden)]
#[no_mangle]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    if let Some(console) = CONSOLE.lock().as_deref_mut() {
        let _ = core::fmt::write(&mut Writer(console), fmt);
    }
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the console.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the console.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
