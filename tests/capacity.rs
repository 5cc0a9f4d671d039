// Capacity and precondition checks. Everything here must be rejected
// synchronously, before the engine writes a single descriptor; no cascade
// runs in this binary.

#![no_main]
#![no_std]
#![feature(custom_test_frameworks)]
#![test_runner(faultvm::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use faultvm::layout::{MAX_ASM_INSTS, MAX_CONSTANTS, MAX_REGISTERS};
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

fn loop_inst(src: Reg) -> Movdbz {
    Movdbz {
        dst: Reg::Discard,
        src,
        nz: Target::Exit,
        z: Target::Exit,
    }
}

//------------Tests-------------//

#[test_case]
fn one_register_too_many_is_refused() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    for _ in 0..MAX_REGISTERS {
        engine.alloc_register(0).unwrap();
    }
    assert_eq!(
        engine.alloc_register(0),
        Err(EngineError::CapacityExceeded("registers"))
    );
}

#[test_case]
fn one_constant_too_many_is_refused() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    for _ in 0..MAX_CONSTANTS {
        engine.alloc_constant(1).unwrap();
    }
    assert_eq!(
        engine.alloc_constant(1),
        Err(EngineError::CapacityExceeded("constants"))
    );
}

#[test_case]
fn one_instruction_too_many_is_refused() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    for _ in 0..MAX_ASM_INSTS {
        engine.emit(loop_inst(Reg::ConstOne)).unwrap();
    }
    assert_eq!(
        engine.emit(loop_inst(Reg::ConstOne)),
        Err(EngineError::CapacityExceeded("instructions"))
    );
}

#[test_case]
fn branches_beyond_the_program_limit_are_refused() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    let bad = Movdbz {
        dst: Reg::Discard,
        src: Reg::ConstOne,
        nz: Target::Inst(MAX_ASM_INSTS),
        z: Target::Exit,
    };
    assert_eq!(
        engine.emit(bad),
        Err(EngineError::PreconditionFailure("branch index out of range"))
    );
}

#[test_case]
fn launch_requires_a_finalised_program() {
    let mut engine = Engine::new();
    assert!(matches!(
        engine.launch(),
        Err(EngineError::PreconditionFailure(_))
    ));
    engine.setup().unwrap();
    engine.emit(loop_inst(Reg::ConstOne)).unwrap();
    assert!(matches!(
        engine.launch(),
        Err(EngineError::PreconditionFailure(_))
    ));
}

#[test_case]
fn resume_rejects_unknown_labels() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    engine.emit(loop_inst(Reg::ConstOne)).unwrap();
    engine.finalise().unwrap();
    assert_eq!(
        engine.resume(1),
        Err(EngineError::PreconditionFailure("resume index out of range"))
    );
}

#[test_case]
fn unknown_operands_are_refused() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    // no registers allocated, so id 0 does not exist yet
    assert_eq!(
        engine.emit(loop_inst(Reg::User(0))),
        Err(EngineError::PreconditionFailure("register id out of range"))
    );
}
