// The driver: owns the program region, assembles cascades and runs them.
//
// The public surface is small. setup() brings up paging, the GDT with the
// host-return TSS and the three rotating slots, the IDT base and the task
// register. alloc_register/alloc_constant hand out register pages, emit()
// lowers one movdbz into its three blocks, finalise() writes the rotating
// descriptors and the bootstrap directory, and launch()/resume() enter the
// cascade and come back when it reaches EXIT.
//
// While the cascade runs the host is simply suspended: the long jump into
// the first TSS saves the host context into the return TSS, and the task
// gate on selector 0x18 restores it. From Rust's point of view launch() is
// one long blocking call. There is nothing to poll and nothing to cancel;
// a program that never exits can only be stopped by resetting the machine.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::gdt;
use crate::layout::{
    self, PageArena, RegPage, MAX_ASM_INSTS, PG_CONST_ONE, PG_DISCARD, PG_GDT, PG_GDT_PT,
    PG_INITIAL_PD, PG_INITIAL_PT, PG_STACK, PG_STACK_PT, PTE_PRESENT, PTE_WRITE, REG_VALUE_MAX,
};
use crate::synth::{self, Movdbz, Reg, Successor, Target};

/// The engine reports misuse before it touches any descriptor; everything
/// that goes wrong later is a triple fault and nobody is left to report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    PreconditionFailure(&'static str),
    CapacityExceeded(&'static str),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::PreconditionFailure(what) => write!(f, "precondition failure: {}", what),
            EngineError::CapacityExceeded(what) => write!(f, "capacity exceeded: {}", what),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninit,
    Ready,
    Running,
    Exited,
}

pub struct Engine {
    arena: PageArena,
    insts: usize,
    finalised: bool,
    state: State,
}

lazy_static! {
    pub static ref ENGINE: Mutex<Engine> = Mutex::new(Engine::new());
}

impl Engine {
    pub const fn new() -> Engine {
        Engine {
            arena: PageArena::new(),
            insts: 0,
            finalised: false,
            state: State::Uninit,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Brings up the fixed plumbing: boot pages in the program region, the
    /// host page directory, GDT, IDT base and task register. After this the
    /// allocation and emit API is live.
    pub fn setup(&mut self) -> Result<(), EngineError> {
        if self.state != State::Uninit {
            return Err(EngineError::PreconditionFailure("setup called twice"));
        }

        // cascade stack: one present page at the bottom of the 4 MiB range,
        // nothing else, so a push below zero has nowhere to go
        layout::clear_page(PG_STACK);
        layout::clear_page(PG_STACK_PT);
        layout::write_dword(PG_STACK_PT, 0, PG_STACK.phys() | PTE_PRESENT | PTE_WRITE);

        // the four GDT pages and the page table that exposes them at the
        // GDT window under every directory
        layout::clear_page(PG_GDT_PT);
        for i in 0..4u32 {
            let page = layout::PageIx(PG_GDT.0 + i);
            layout::clear_page(page);
            layout::write_dword(
                PG_GDT_PT,
                (i as usize) * 4,
                page.phys() | PTE_PRESENT | PTE_WRITE,
            );
        }
        gdt::write_host_descriptors(PG_GDT);

        // the two built-in registers
        synth::init_register_page(RegPage(PG_CONST_ONE), 1);
        synth::init_register_page(RegPage(PG_DISCARD), 0);

        gdt::activate();
        self.state = State::Ready;
        Ok(())
    }

    fn require_building(&self) -> Result<(), EngineError> {
        match (self.state, self.finalised) {
            (State::Ready, false) => Ok(()),
            (State::Uninit, _) => Err(EngineError::PreconditionFailure("engine not set up")),
            _ => Err(EngineError::PreconditionFailure("program already finalised")),
        }
    }

    fn check_value(value: u32) -> Result<(), EngineError> {
        if value > REG_VALUE_MAX {
            return Err(EngineError::PreconditionFailure("register value too wide"));
        }
        Ok(())
    }

    pub fn alloc_register(&mut self, value: u32) -> Result<Reg, EngineError> {
        self.require_building()?;
        Self::check_value(value)?;
        let id = self.arena.registers() as u8;
        let page = self
            .arena
            .alloc_register()
            .ok_or(EngineError::CapacityExceeded("registers"))?;
        synth::init_register_page(page, value);
        Ok(Reg::User(id))
    }

    /// Like alloc_register but drawn from the constant pool. A consumer of
    /// the constant sees one less than `value`, because the move that reads
    /// it decrements on the way through; callers pass k + 1 to publish k.
    pub fn alloc_constant(&mut self, value: u32) -> Result<Reg, EngineError> {
        self.require_building()?;
        Self::check_value(value)?;
        let id = self.arena.constants() as u8;
        let page = self
            .arena
            .alloc_constant()
            .ok_or(EngineError::CapacityExceeded("constants"))?;
        synth::init_register_page(page, value);
        Ok(Reg::Const(id))
    }

    fn resolve(&self, reg: Reg) -> Result<RegPage, EngineError> {
        match reg {
            Reg::Discard => Ok(RegPage(PG_DISCARD)),
            Reg::ConstOne => Ok(RegPage(PG_CONST_ONE)),
            Reg::User(id) => self
                .arena
                .user_register(id as usize)
                .ok_or(EngineError::PreconditionFailure("register id out of range")),
            Reg::Const(id) => self
                .arena
                .constant(id as usize)
                .ok_or(EngineError::PreconditionFailure("constant id out of range")),
        }
    }

    fn check_target(&self, target: Target) -> Result<(), EngineError> {
        match target {
            Target::Exit => Ok(()),
            // forward branches are fine, block addresses are arithmetic
            Target::Inst(ix) if ix < MAX_ASM_INSTS => Ok(()),
            Target::Inst(_) => Err(EngineError::PreconditionFailure("branch index out of range")),
        }
    }

    /// Records abstract instruction `insts` and materialises its three real
    /// blocks. Branches land on the padding steps of their target, whose
    /// source is always the const-one register, so targets that have not
    /// been emitted yet cost nothing extra.
    pub fn emit(&mut self, inst: Movdbz) -> Result<usize, EngineError> {
        self.require_building()?;
        if self.insts == MAX_ASM_INSTS {
            return Err(EngineError::CapacityExceeded("instructions"));
        }
        match inst.dst {
            Reg::User(_) | Reg::Discard => {}
            _ => return Err(EngineError::PreconditionFailure("destination not writable")),
        }
        if inst.src == Reg::Discard {
            return Err(EngineError::PreconditionFailure("source reads the discard sink"));
        }
        let src = self.resolve(inst.src)?;
        let dst = self.resolve(inst.dst)?;
        self.check_target(inst.nz)?;
        self.check_target(inst.z)?;

        let ix = self.insts;
        for _ in 0..3 {
            self.arena
                .alloc_block()
                .ok_or(EngineError::CapacityExceeded("instruction blocks"))?;
        }

        let one = RegPage(PG_CONST_ONE);
        let discard = RegPage(PG_DISCARD);
        let lower = |t: Target, real_of: fn(usize) -> usize| match t {
            Target::Exit => Successor::Exit,
            Target::Inst(t) => Successor::Real {
                ix: real_of(t),
                src: one,
            },
        };

        // two padding steps, then the visible move
        let step = Successor::Real {
            ix: ix * 3 + 1,
            src: one,
        };
        synth::materialise_real(ix * 3, discard, step, step);
        let step = Successor::Real {
            ix: ix * 3 + 2,
            src,
        };
        synth::materialise_real(ix * 3 + 1, discard, step, step);
        synth::materialise_real(
            ix * 3 + 2,
            dst,
            lower(inst.nz, synth::nz_real),
            lower(inst.z, synth::z_real),
        );

        self.insts = ix + 1;
        Ok(ix)
    }

    /// Writes the rotating-slot descriptors and the bootstrap directory.
    /// After this the program is sealed: no more registers or instructions.
    pub fn finalise(&mut self) -> Result<(), EngineError> {
        self.require_building()?;
        if self.insts == 0 {
            return Err(EngineError::PreconditionFailure("program is empty"));
        }
        for k in 0..3 {
            let page = layout::PageIx(PG_GDT.0 + 1 + k as u32);
            let desc = crate::descriptors::SegmentDescriptor::tss(layout::tss_vaddr(k));
            layout::write_dword(page, 0xFF8, desc.lo());
            layout::write_dword(page, 0xFFC, desc.hi());
        }
        synth::write_directory(PG_INITIAL_PD, PG_INITIAL_PT);
        self.finalised = true;
        Ok(())
    }

    pub fn launch(&mut self) -> Result<(), EngineError> {
        self.resume(0)
    }

    /// Re-enters the cascade at the first real step of abstract instruction
    /// `inst_ix`. Returns once the program reaches an EXIT edge.
    pub fn resume(&mut self, inst_ix: usize) -> Result<(), EngineError> {
        if !self.finalised {
            return Err(EngineError::PreconditionFailure("program not finalised"));
        }
        if inst_ix >= self.insts {
            return Err(EngineError::PreconditionFailure("resume index out of range"));
        }
        let entry = inst_ix * 3;

        // point the bootstrap table at the entry block: its IDT, its TSS
        // head, and the tail it loads from. Entry steps are padding, so the
        // tail is always the const-one page.
        let block = PageArena::block_of(entry);
        layout::clear_page(PG_INITIAL_PT);
        let rw = PTE_PRESENT | PTE_WRITE;
        layout::write_dword(PG_INITIAL_PT, 0, block.idt().phys() | rw);
        let at = layout::tss_pt_index(synth::slot_of(entry));
        layout::write_dword(PG_INITIAL_PT, at * 4, block.tss_head().phys() | rw);
        layout::write_dword(PG_INITIAL_PT, (at + 1) * 4, PG_CONST_ONE.phys() | rw);

        self.state = State::Running;
        unsafe { enter_cascade(PG_INITIAL_PD.phys(), gdt::host_pd_phys()) };
        self.state = State::Exited;
        Ok(())
    }

    /// Reads a register's stored value. Only meaningful while the cascade
    /// is not running; reading the discard register is allowed but its
    /// content is whatever the padding last dumped there.
    pub fn read_register(&self, reg: Reg) -> Result<u32, EngineError> {
        Ok(synth::reg_read(self.resolve(reg)?))
    }

    pub fn write_register(&mut self, reg: Reg, value: u32) -> Result<(), EngineError> {
        Self::check_value(value)?;
        synth::reg_write(self.resolve(reg)?, value);
        Ok(())
    }
}

/// Switches to the bootstrap directory and long-jumps into the entry TSS.
/// The jump saves the host context into the return TSS; when some gate
/// names selector 0x18 the hardware restores it and execution continues
/// at the add, which drops the error code the exit fault pushed onto the
/// host stack.
unsafe fn enter_cascade(initial_pd: u32, host_pd: u32) {
    unsafe {
        core::arch::asm!(
            "mov cr3, {init}",
            ".byte 0xEA",
            ".long 0",
            ".word 0x1FF8",
            "add esp, 4",
            "mov cr3, {host}",
            init = in(reg) initial_pd,
            host = in(reg) host_pd,
        );
    }
}

#[test_case]
fn user_register_round_trip() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    let r = engine.alloc_register(5).unwrap();
    assert_eq!(engine.read_register(r).unwrap(), 5);
    engine.write_register(r, 123_456).unwrap();
    assert_eq!(engine.read_register(r).unwrap(), 123_456);
    engine.write_register(r, REG_VALUE_MAX).unwrap();
    assert_eq!(engine.read_register(r).unwrap(), REG_VALUE_MAX);
}

#[test_case]
fn constants_store_the_biased_value() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    let c = engine.alloc_constant(1024 + 1).unwrap();
    assert_eq!(engine.read_register(c).unwrap(), 1025);
}

#[test_case]
fn api_misuse_is_reported_before_any_write() {
    let mut engine = Engine::new();
    assert_eq!(
        engine.alloc_register(1),
        Err(EngineError::PreconditionFailure("engine not set up"))
    );
    engine.setup().unwrap();
    assert!(engine.launch().is_err());
    assert_eq!(
        engine.finalise(),
        Err(EngineError::PreconditionFailure("program is empty"))
    );
    assert!(engine
        .emit(Movdbz {
            dst: Reg::ConstOne,
            src: Reg::ConstOne,
            nz: Target::Exit,
            z: Target::Exit,
        })
        .is_err());
    assert!(engine
        .emit(Movdbz {
            dst: Reg::Discard,
            src: Reg::User(0),
            nz: Target::Exit,
            z: Target::Exit,
        })
        .is_err());
    assert_eq!(
        engine.write_register(Reg::User(0), REG_VALUE_MAX + 1),
        Err(EngineError::PreconditionFailure("register value too wide"))
    );
}

#[test_case]
fn window_pt_maps_exactly_the_advertised_pages() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    let r = engine.alloc_register(3).unwrap();
    // one self-loop: visible move at real 2, branches to real 0 and EXIT
    let ix = engine
        .emit(Movdbz {
            dst: r,
            src: r,
            nz: Target::Inst(0),
            z: Target::Exit,
        })
        .unwrap();
    assert_eq!(ix, 0);

    let visible = PageArena::block_of(2);
    let pt = visible.pt();
    let rw = PTE_PRESENT | PTE_WRITE;
    let r_page = layout::PageIx(layout::BOOT_PAGES);

    // own slot 2: the GDT page carrying 0x3FF8, then the destination
    let own = layout::tss_pt_index(2);
    assert_eq!(
        layout::read_dword(pt, own * 4),
        layout::PageIx(PG_GDT.0 + 3).phys() | rw
    );
    assert_eq!(layout::read_dword(pt, (own + 1) * 4), r_page.phys() | rw);

    // non-zero successor real 0: its head, then its source (const-one)
    let nz = layout::tss_pt_index(0);
    assert_eq!(
        layout::read_dword(pt, nz * 4),
        PageArena::block_of(0).tss_head().phys() | rw
    );
    assert_eq!(
        layout::read_dword(pt, (nz + 1) * 4),
        PG_CONST_ONE.phys() | rw
    );

    // the zero edge exits, so slot 1's pair stays unmapped
    let z = layout::tss_pt_index(1);
    assert_eq!(layout::read_dword(pt, z * 4), 0);
    assert_eq!(layout::read_dword(pt, (z + 1) * 4), 0);

    // entry 0 is the block's own IDT
    assert_eq!(layout::read_dword(pt, 0), visible.idt().phys() | rw);
}

#[test_case]
fn idt_gates_select_the_lowered_targets() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    let r = engine.alloc_register(3).unwrap();
    engine
        .emit(Movdbz {
            dst: r,
            src: r,
            nz: Target::Inst(1),
            z: Target::Inst(0),
        })
        .unwrap();

    let idt = PageArena::block_of(2).idt();
    // vector 14 -> real 3 (slot 0), vector 8 -> real 1 (slot 1)
    let pf = layout::read_dword(idt, 14 * 8) as u64 | (layout::read_dword(idt, 14 * 8 + 4) as u64) << 32;
    let df = layout::read_dword(idt, 8 * 8) as u64 | (layout::read_dword(idt, 8 * 8 + 4) as u64) << 32;
    assert_eq!(
        crate::descriptors::TaskGate::new(layout::rotating_selector(0)).raw(),
        pf
    );
    assert_eq!(
        crate::descriptors::TaskGate::new(layout::rotating_selector(1)).raw(),
        df
    );
}

#[test_case]
fn exit_gates_name_the_host_return_tss() {
    let mut engine = Engine::new();
    engine.setup().unwrap();
    let r = engine.alloc_register(1).unwrap();
    engine
        .emit(Movdbz {
            dst: r,
            src: r,
            nz: Target::Exit,
            z: Target::Exit,
        })
        .unwrap();
    let idt = PageArena::block_of(2).idt();
    let gate = crate::descriptors::TaskGate::new(layout::SEL_HOST_TSS).raw();
    let pf = layout::read_dword(idt, 14 * 8) as u64 | (layout::read_dword(idt, 14 * 8 + 4) as u64) << 32;
    let df = layout::read_dword(idt, 8 * 8) as u64 | (layout::read_dword(idt, 8 * 8 + 4) as u64) << 32;
    assert_eq!(pf, gate);
    assert_eq!(df, gate);
}
