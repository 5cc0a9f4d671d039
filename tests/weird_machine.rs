// End-to-end cascades under QEMU. Every test here assembles a program,
// long-jumps into it, and lets real hardware task switches do the
// computing; if a cascade escapes its gates the machine triple-faults and
// the harness times out instead of reporting.
//
// Each test builds its own engine over the same program region, so they
// run strictly one after another and start from fresh pages.

#![no_main]
#![no_std]
#![feature(custom_test_frameworks)]
#![test_runner(faultvm::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use faultvm::machine::{Engine, EngineError};
use faultvm::synth::{Movdbz, Reg, Target};

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

fn mv(dst: Reg, src: Reg, nz: Target, z: Target) -> Movdbz {
    Movdbz { dst, src, nz, z }
}

struct Adder {
    a: Reg,
    b: Reg,
    sum: Reg,
}

/// The eight-instruction saturated adder on a 1024-biased accumulator.
fn build_adder(engine: &mut Engine) -> Result<Adder, EngineError> {
    let a = engine.alloc_register(0)?;
    let b = engine.alloc_register(0)?;
    let acc = engine.alloc_register(0)?;
    let sum = engine.alloc_register(0)?;
    let bias = engine.alloc_constant(1024 + 1)?;
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

//------------Tests-------------//

#[test_case]
fn three_plus_five_is_eight() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    let adder = build_adder(&mut engine).unwrap();
    engine.write_register(adder.a, 3).unwrap();
    engine.write_register(adder.b, 5).unwrap();
    engine.launch().unwrap();
    assert_eq!(engine.read_register(adder.sum).unwrap(), 8);
    // the operands were drained on the way through
    assert_eq!(engine.read_register(adder.a).unwrap(), 0);
    assert_eq!(engine.read_register(adder.b).unwrap(), 0);
}

#[test_case]
fn zero_plus_zero_is_zero() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    let adder = build_adder(&mut engine).unwrap();
    engine.write_register(adder.a, 0).unwrap();
    engine.write_register(adder.b, 0).unwrap();
    engine.launch().unwrap();
    assert_eq!(engine.read_register(adder.sum).unwrap(), 0);
}

#[test_case]
fn relaunching_reuses_the_program() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    let adder = build_adder(&mut engine).unwrap();
    for (a, b, want) in [(1, 0, 1), (40, 2, 42), (1000, 24, 1024)] {
        engine.write_register(adder.a, a).unwrap();
        engine.write_register(adder.b, b).unwrap();
        engine.launch().unwrap();
        assert_eq!(engine.read_register(adder.sum).unwrap(), want);
    }
}

#[test_case]
fn single_step_decrements_and_takes_the_nonzero_edge() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    let d = engine.alloc_register(0).unwrap();
    let c = engine.alloc_constant(1 + 1).unwrap();
    engine
        .emit(mv(d, c, Target::Exit, Target::Exit))
        .unwrap();
    engine.finalise().unwrap();
    engine.launch().unwrap();
    // the constant was allocated as 1 + 1, so its consumer reads 1
    assert_eq!(engine.read_register(d).unwrap(), 1);
    // and a source is never changed by its own use
    assert_eq!(engine.read_register(c).unwrap(), 2);
}

#[test_case]
fn countdown_loop_terminates_through_the_zero_edge() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    let r = engine.alloc_register(2).unwrap();
    // decrement in place, looping on the non-zero edge; the zero edge is
    // the only way out, so returning at all proves the branch fired
    engine
        .emit(mv(r, r, Target::Inst(0), Target::Exit))
        .unwrap();
    engine.finalise().unwrap();
    engine.launch().unwrap();
    assert_eq!(engine.read_register(r).unwrap(), 0);
}

#[test_case]
fn resume_walks_the_phase_labels() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    let cmd = engine.alloc_register(0).unwrap();
    let c1 = engine.alloc_constant(1 + 1).unwrap();
    let c3 = engine.alloc_constant(3 + 1).unwrap();
    let c4 = engine.alloc_constant(4 + 1).unwrap();
    let i = Target::Inst;

    // three set-command-then-exit pairs plus a loop-back to the first
    engine.emit(mv(cmd, c1, i(1), i(1))).unwrap();
    engine
        .emit(mv(Reg::Discard, Reg::ConstOne, Target::Exit, Target::Exit))
        .unwrap();
    engine.emit(mv(cmd, c3, i(3), i(3))).unwrap();
    engine
        .emit(mv(Reg::Discard, Reg::ConstOne, Target::Exit, Target::Exit))
        .unwrap();
    engine.emit(mv(cmd, c4, i(5), i(5))).unwrap();
    engine
        .emit(mv(Reg::Discard, Reg::ConstOne, Target::Exit, Target::Exit))
        .unwrap();
    engine
        .emit(mv(Reg::Discard, Reg::ConstOne, i(0), i(0)))
        .unwrap();
    engine.finalise().unwrap();

    engine.launch().unwrap();
    assert_eq!(engine.read_register(cmd).unwrap(), 1);
    engine.resume(2).unwrap();
    assert_eq!(engine.read_register(cmd).unwrap(), 3);
    engine.resume(4).unwrap();
    assert_eq!(engine.read_register(cmd).unwrap(), 4);
    engine.resume(6).unwrap();
    assert_eq!(engine.read_register(cmd).unwrap(), 1);
}

#[test_case]
fn discarded_moves_leave_user_registers_alone() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    let r0 = engine.alloc_register(7).unwrap();
    let r1 = engine.alloc_register(9).unwrap();
    engine
        .emit(mv(Reg::Discard, r0, Target::Inst(1), Target::Inst(1)))
        .unwrap();
    engine
        .emit(mv(Reg::Discard, Reg::ConstOne, Target::Exit, Target::Exit))
        .unwrap();
    engine.finalise().unwrap();
    engine.launch().unwrap();
    assert_eq!(engine.read_register(r0).unwrap(), 7);
    assert_eq!(engine.read_register(r1).unwrap(), 9);
}
