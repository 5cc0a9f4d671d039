// Boot smoke test: the multiboot shim hands control over, both output
// channels work, and engine setup leaves the machine alive. Runs before
// any cascade is assembled.

#![no_main]
#![no_std]
#![feature(custom_test_frameworks)]
#![test_runner(faultvm::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use faultvm::machine::State;
use faultvm::{println, serial_println};

#[unsafe(no_mangle)]
pub extern "C" fn kmain() -> ! {
    faultvm::init();
    test_main();
    loop {}
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    faultvm::test_panic_handler(info)
}

//------------Tests-------------//

#[test_case]
fn vga_println_works() {
    println!("hello from the vga side");
}

#[test_case]
fn serial_println_works() {
    serial_println!("hello from the serial side");
}

#[test_case]
fn engine_is_ready_after_init() {
    assert_eq!(faultvm::machine::ENGINE.lock().state(), State::Ready);
}
