#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

pub mod boot;
pub mod descriptors;
pub mod gdt;
pub mod keyboard;
pub mod layout;
pub mod machine;
pub mod serial;
pub mod synth;
pub mod vga_buffer;

use core::panic::PanicInfo;

/// Exit codes for QEMU's isa-debug-exit device on port 0xf4. QEMU reports
/// (value << 1) | 1 as its own exit status, so neither of these can look
/// like a normal shutdown.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn exit_qemu(exit_code: QemuExitCode) {
    unsafe {
        // iobase and iosize for the device are set on the QEMU command line
        x86::io::outl(0xf4, exit_code as u32);
    }
}

pub trait Testable {
    fn run(&self) -> ();
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}

/// Runs every collected test and reports over serial; the VGA side is for
/// watching a test boot by hand.
pub fn test_runner(tests: &[&dyn Testable]) {
    serial_println!("running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failed);
    loop {}
}

/// Brings the engine to Ready. Interrupts stay off for good: the only
/// vectors with any meaning from here on are the cascade's own.
pub fn init() {
    machine::ENGINE
        .lock()
        .setup()
        .expect("engine setup failed");
}

// entry point for cargo test; ordinary runs enter through main.rs
#[cfg(test)]
#[unsafe(no_mangle)]
pub extern "C" fn kmain() -> ! {
    init();
    test_main();
    loop {}
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}
