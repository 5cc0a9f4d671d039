// Polling PS/2 keyboard input for the REPL.
//
// No interrupt-driven input here: the engine owns the IDT story outright,
// so the bridge reads the controller by hand between cascade runs. Status
// port 0x64 bit 0 says a byte is waiting on data port 0x60; scancode set 1
// is what QEMU talks by default.

use x86::io::inb;

const STATUS_PORT: u16 = 0x64;
const DATA_PORT: u16 = 0x60;
const OUTPUT_FULL: u8 = 1 << 0;

/// Set-1 make codes for the unshifted US layout, enough for the REPL.
static LAYOUT: [u8; 0x3A] = [
    0, 0x1B, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 0x08, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ',
];

/// Grabs one scancode if the controller has one, without blocking.
pub fn poll_scancode() -> Option<u8> {
    unsafe {
        if inb(STATUS_PORT) & OUTPUT_FULL == 0 {
            return None;
        }
        Some(inb(DATA_PORT))
    }
}

/// Spins until a key press produces a printable byte, newline or
/// backspace. Break codes and unmapped keys are swallowed.
pub fn read_key() -> u8 {
    loop {
        let Some(code) = poll_scancode() else {
            core::hint::spin_loop();
            continue;
        };
        if code & 0x80 != 0 {
            continue;
        }
        match LAYOUT.get(code as usize) {
            Some(&byte) if byte != 0 && byte != 0x1B && byte != b'\t' => return byte,
            _ => continue,
        }
    }
}

/// Reads one edited line into `buf`, echoing to the VGA console, and
/// returns the number of bytes. Backspace works; the newline is consumed
/// but not stored.
pub fn read_line(buf: &mut [u8]) -> usize {
    let mut len = 0;
    loop {
        match read_key() {
            b'\n' => {
                crate::println!();
                return len;
            }
            0x08 => {
                if len > 0 {
                    len -= 1;
                    crate::vga_buffer::WRITER.lock().backspace();
                }
            }
            byte => {
                if len < buf.len() {
                    buf[len] = byte;
                    len += 1;
                    crate::print!("{}", byte as char);
                }
            }
        }
    }
}
