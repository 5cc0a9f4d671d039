// Kernel entry: bring the engine up, assemble the saturated adder, and
// run a small console REPL over it.
//
// The adder is the canonical movdbz program. There is no add instruction
// anywhere, only decrement-and-branch, so addition runs on a biased
// accumulator: count an accumulator down once per unit of each operand,
// then count it back out into the result. Every arithmetic step in between
// is the CPU pushing a page-fault error code.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(faultvm::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;
use faultvm::machine::{Engine, EngineError, ENGINE};
use faultvm::synth::{Movdbz, Reg, Target};
use faultvm::{keyboard, print, println};

/// Operand bias. Sums above this saturate: the accumulator bottoms out
/// early and the result simply stops growing.
const BIAS: u32 = 1024;

struct Adder {
    a: Reg,
    b: Reg,
    sum: Reg,
}

/// Emits the eight-instruction adder. r2 counts down once per unit of a,
/// then of b, then drains back out into the sum.
fn build_adder(engine: &mut Engine) -> Result<Adder, EngineError> {
    let a = engine.alloc_register(0)?;
    let b = engine.alloc_register(0)?;
    let acc = engine.alloc_register(0)?;
    let sum = engine.alloc_register(0)?;
    // consumers of a constant see one less than the stored value
    let bias = engine.alloc_constant(BIAS + 1)?;

    let mv = |dst, src, nz, z| Movdbz { dst, src, nz, z };
    let i = Target::Inst;

    engine.emit(mv(acc, bias, i(1), i(1)))?;
    engine.emit(mv(a, a, i(2), i(3)))?;
    engine.emit(mv(acc, acc, i(1), i(1)))?;
    engine.emit(mv(b, b, i(4), i(5)))?;
    engine.emit(mv(acc, acc, i(3), i(3)))?;
    engine.emit(mv(sum, bias, i(6), i(6)))?;
    engine.emit(mv(acc, acc, i(7), Target::Exit))?;
    engine.emit(mv(sum, sum, i(6), i(6)))?;
    engine.finalise()?;

    Ok(Adder { a, b, sum })
}

impl Adder {
    /// One full cascade: roughly 25 task switches per unit of a + b + bias.
    fn run(&self, engine: &mut Engine, a: u32, b: u32) -> Result<u32, EngineError> {
        engine.write_register(self.a, a)?;
        engine.write_register(self.b, b)?;
        engine.launch()?;
        engine.read_register(self.sum)
    }
}

fn parse_pair(line: &[u8]) -> Option<(u32, u32)> {
    let text = core::str::from_utf8(line).ok()?;
    let mut parts = text.split_whitespace();
    let a = parts.next()?.parse().ok()?;
    let b = parts.next()?.parse().ok()?;
    if parts.next().is_some() || a > BIAS || b > BIAS {
        return None;
    }
    Some((a, b))
}

#[unsafe(no_mangle)]
pub extern "C" fn kmain() -> ! {
    println!("faultvm: a movdbz machine driven by page faults");
    faultvm::init();

    #[cfg(test)]
    test_main();

    let mut engine = ENGINE.lock();
    let adder = build_adder(&mut engine).expect("adder program did not assemble");

    let sum = adder.run(&mut engine, 3, 5).expect("demo cascade failed");
    println!("3 + 5 = {} (computed without executing an instruction)", sum);

    println!("enter two numbers up to {}, or q to halt", BIAS);
    let mut line = [0u8; 32];
    loop {
        print!("> ");
        let len = keyboard::read_line(&mut line);
        if &line[..len] == b"q" {
            break;
        }
        match parse_pair(&line[..len]) {
            Some((a, b)) => match adder.run(&mut engine, a, b) {
                Ok(sum) => println!("{} + {} = {}", a, b, sum),
                Err(err) => println!("cascade refused: {}", err),
            },
            None => println!("usage: <a> <b>, both at most {}", BIAS),
        }
    }

    println!("halted");
    loop {
        unsafe { x86::halt() };
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{}", info);
    loop {}
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    faultvm::test_panic_handler(info)
}

//------------------TESTS----------------------------//

#[test_case]
fn adder_assembles_cleanly() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    assert!(build_adder(&mut engine).is_ok());
}

#[test_case]
fn pair_parser_accepts_and_rejects() {
    assert_eq!(parse_pair(b"3 5"), Some((3, 5)));
    assert_eq!(parse_pair(b"  12   40 "), Some((12, 40)));
    assert_eq!(parse_pair(b"3"), None);
    assert_eq!(parse_pair(b"3 5 7"), None);
    assert_eq!(parse_pair(b"3 2000"), None);
}
