// Harness sanity: a failing assertion must reach the panic handler and
// report success through it. Runs without the test harness since the
// whole binary is a single expected panic.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use faultvm::{exit_qemu, serial_print, serial_println, QemuExitCode};

#[unsafe(no_mangle)]
pub extern "C" fn kmain() -> ! {
    should_fail();
    serial_println!("[test did not panic]");
    exit_qemu(QemuExitCode::Failed);
    loop {}
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    serial_println!("[ok]");
    exit_qemu(QemuExitCode::Success);
    loop {}
}

fn should_fail() {
    serial_print!("should_panic::should_fail...\t");
    assert_eq!(1, 0);
}
