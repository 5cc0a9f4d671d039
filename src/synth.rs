// The instruction synthesiser: turns abstract movdbz instructions into the
// page tables, TSS images and task gates that make the CPU execute them.
//
// No instruction of the guest program is ever fetched. Every TSS the
// cascade enters points EIP at an unmapped address, so the first fetch
// page-faults; the fault goes through a task gate, and the task switch
// itself is the computation:
//
//  * loading the new TSS pulls ESP out of whatever page the old directory
//    mapped as the TSS tail. That page is the instruction's source
//    register, so "current ESP" is now the source value shifted left by 2.
//  * delivering the fault pushes a 4-byte error code, so ESP drops by 4.
//    That push is the only arithmetic the machine ever does. If the source
//    value was zero the push wraps below the stack page and double-faults,
//    which is how the zero branch is taken.
//  * the next fault's task switch saves the (now decremented) ESP back
//    into the page the current directory maps as the outgoing TSS tail,
//    and that page is the destination register.
//
// Each abstract instruction becomes three real instructions. The first two
// are padding whose destination is the discard register and whose source
// is the const-one register (always positive, so the padding can never
// double-fault while a double fault is already being delivered). The third
// does the visible move. Abstract branch targets are rewritten so that a
// non-zero branch to t lands on real 3t and a zero branch on real 3t+1;
// with slots assigned as real index mod 3 this keeps every edge changing
// slot, and it means every branch lands on padding whose source register
// is known even when t is a forward reference.
//
// The busy-bit laundering rides on the TSS head layout. A head sits at
// offset 0xFD0 of its page, which puts the EAX/ECX slots on the page's
// last 8 bytes. The per-instruction window PT maps the head position of
// the *current* slot at the GDT page that carries that slot's descriptor,
// so when the CPU saves the outgoing context, the saved EAX:ECX land right
// on the descriptor. Heads are written with EAX:ECX preloaded to the fresh
// non-busy descriptor encoding, so every context save rewrites the
// descriptor the hardware just marked busy.

use crate::descriptors::{SegmentDescriptor, TaskGate};
use crate::layout::{
    self, BlockBase, PageIx, RegPage, FAULT_EIP, PDE_GDT, PDE_KERNEL, PDE_LARGE, PDE_REGION,
    PDE_STACK, PDE_WINDOW, PG_GDT, PG_GDT_PT, PG_STACK_PT, PTE_PRESENT, PTE_WRITE,
};

/// An operand of an abstract instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    /// Write sink; reading it back is not meaningful.
    Discard,
    /// Always holds 1. Feeds the padding instructions.
    ConstOne,
    /// Caller-allocated register, ids dense from 0.
    User(u8),
    /// Caller-allocated constant, ids dense from 0.
    Const(u8),
}

/// A branch target of an abstract instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Inst(usize),
    /// Leave the cascade through the host-return TSS.
    Exit,
}

/// `movdbz dst, src, nz, z`: store src - 1 into dst, branch to `nz` when
/// src was positive and to `z` when it was zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Movdbz {
    pub dst: Reg,
    pub src: Reg,
    pub nz: Target,
    pub z: Target,
}

/// A branch edge after lowering to real-instruction indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealTarget {
    Real(usize),
    Exit,
}

/// A successor edge plus the source register its TSS tail must load from.
#[derive(Debug, Clone, Copy)]
pub enum Successor {
    Exit,
    Real { ix: usize, src: RegPage },
}

pub const fn slot_of(real_ix: usize) -> usize {
    real_ix % 3
}

/// Non-zero branches enter the target's first padding instruction.
pub const fn nz_real(target: usize) -> usize {
    target * 3
}

/// Zero branches enter the second padding instruction: the double fault
/// that took the branch has already pushed one error code, so the zero
/// path crosses one fewer gate before the target's visible move.
pub const fn z_real(target: usize) -> usize {
    target * 3 + 1
}

fn selector_for(target: RealTarget) -> u16 {
    match target {
        RealTarget::Exit => layout::SEL_HOST_TSS,
        RealTarget::Real(ix) => layout::rotating_selector(slot_of(ix)),
    }
}

// Offsets of the TSS fields each page half carries. The head page holds
// TSS offsets 0x00..0x30 at page offsets 0xFD0..0x1000; the tail page
// holds offsets 0x30..0x68 from its start.
const HEAD_SS0: usize = 0xFD8;
const HEAD_CR3: usize = 0xFEC;
const HEAD_EIP: usize = 0xFF0;
const HEAD_EFLAGS: usize = 0xFF4;
const HEAD_EAX: usize = 0xFF8;
const HEAD_ECX: usize = 0xFFC;

pub const TAIL_ESP: usize = 0x08;
const TAIL_ES: usize = 0x18;
const TAIL_CS: usize = 0x1C;
const TAIL_SS: usize = 0x20;
const TAIL_DS: usize = 0x24;
const TAIL_FS: usize = 0x28;
const TAIL_GS: usize = 0x2C;
const TAIL_IOMB: usize = 0x34;

/// EFLAGS image every instruction runs with: interrupts off, reserved bit
/// set, nothing else.
const CASCADE_EFLAGS: u32 = 0x0000_0002;

/// IDT byte offsets of the two vectors the engine owns.
const IDT_DOUBLE_FAULT: usize = 8 * 8;
const IDT_PAGE_FAULT: usize = 14 * 8;

/// Writes a register tail. ESP carries the value shifted left by 2; the
/// segment slots are the flat host selectors so the task switch that loads
/// this tail lands in sane segments. The I/O map base points past the TSS
/// limit.
pub fn init_register_page(reg: RegPage, value: u32) {
    layout::clear_page(reg.0);
    layout::write_dword(reg.0, TAIL_ESP, value << 2);
    layout::write_dword(reg.0, TAIL_ES, layout::SEL_DATA as u32);
    layout::write_dword(reg.0, TAIL_CS, layout::SEL_CODE as u32);
    layout::write_dword(reg.0, TAIL_SS, layout::SEL_DATA as u32);
    layout::write_dword(reg.0, TAIL_DS, layout::SEL_DATA as u32);
    layout::write_dword(reg.0, TAIL_FS, layout::SEL_DATA as u32);
    layout::write_dword(reg.0, TAIL_GS, layout::SEL_DATA as u32);
    layout::write_dword(reg.0, TAIL_IOMB, 0x68 << 16);
}

pub fn reg_read(reg: RegPage) -> u32 {
    layout::read_dword(reg.0, TAIL_ESP) >> 2
}

pub fn reg_write(reg: RegPage, value: u32) {
    layout::write_dword(reg.0, TAIL_ESP, value << 2);
}

/// Writes the page directory shared shape: stack, window, kernel, GDT and
/// program-region mappings. Only the window PT varies per instruction.
pub fn write_directory(pd: PageIx, window_pt: PageIx) {
    layout::clear_page(pd);
    let rw = PTE_PRESENT | PTE_WRITE;
    layout::write_dword(pd, PDE_STACK * 4, PG_STACK_PT.phys() | rw);
    layout::write_dword(pd, PDE_WINDOW * 4, window_pt.phys() | rw);
    layout::write_dword(
        pd,
        PDE_KERNEL * 4,
        layout::KERNEL_WINDOW_BASE | rw | PDE_LARGE,
    );
    layout::write_dword(pd, PDE_GDT * 4, PG_GDT_PT.phys() | rw);
    layout::write_dword(pd, PDE_REGION * 4, layout::PROGRAM_BASE | rw | PDE_LARGE);
}

/// Writes the TSS head for a block: CR3 selects the block's directory, EIP
/// is the unmapped fetch address, and EAX:ECX carry the fresh descriptor
/// for this slot so the outgoing context save scrubs the busy bit.
fn write_tss_head(block: BlockBase, slot: usize) {
    let head = block.tss_head();
    layout::clear_page(head);
    let fresh = SegmentDescriptor::tss(layout::tss_vaddr(slot));
    layout::write_dword(head, HEAD_SS0, layout::SEL_DATA as u32);
    layout::write_dword(head, HEAD_CR3, block.pd().phys());
    layout::write_dword(head, HEAD_EIP, FAULT_EIP);
    layout::write_dword(head, HEAD_EFLAGS, CASCADE_EFLAGS);
    layout::write_dword(head, HEAD_EAX, fresh.lo());
    layout::write_dword(head, HEAD_ECX, fresh.hi());
}

/// Writes the block's IDT page. Vector 14 takes the branch for a positive
/// source (the first fetch page-faults), vector 8 the branch for a zero
/// source (the error-code push double-faults). Both entries are always
/// written, even when the two targets coincide.
fn write_idt(block: BlockBase, nz: RealTarget, z: RealTarget) {
    let idt = block.idt();
    layout::clear_page(idt);
    let pf = TaskGate::new(selector_for(nz)).raw();
    let df = TaskGate::new(selector_for(z)).raw();
    layout::write_dword(idt, IDT_PAGE_FAULT, pf as u32);
    layout::write_dword(idt, IDT_PAGE_FAULT + 4, (pf >> 32) as u32);
    layout::write_dword(idt, IDT_DOUBLE_FAULT, df as u32);
    layout::write_dword(idt, IDT_DOUBLE_FAULT + 4, (df >> 32) as u32);
}

/// Writes the instruction-window PT for one block.
///
/// The entry pair for this instruction's own slot maps the GDT page that
/// holds its selector (so the outgoing save refreshes the descriptor) and
/// the destination register (so the saved ESP lands in dst). The pair for
/// each live successor maps that successor's TSS head and source register
/// (so the incoming load reads src). Entry 0 is the block's own IDT.
fn write_window_pt(block: BlockBase, own_slot: usize, dst: RegPage, nz: Successor, z: Successor) {
    let pt = block.pt();
    layout::clear_page(pt);
    let rw = PTE_PRESENT | PTE_WRITE;

    layout::write_dword(pt, 0, block.idt().phys() | rw);

    let own = layout::tss_pt_index(own_slot);
    let gdt_page = PageIx(PG_GDT.0 + 1 + own_slot as u32);
    layout::write_dword(pt, own * 4, gdt_page.phys() | rw);
    layout::write_dword(pt, (own + 1) * 4, dst.0.phys() | rw);

    for succ in [nz, z] {
        if let Successor::Real { ix, src } = succ {
            // successor blocks may not be materialised yet; their page
            // numbers are arithmetic on the index, so that is fine
            let head = layout::PageArena::block_of(ix);
            let at = layout::tss_pt_index(slot_of(ix));
            layout::write_dword(pt, at * 4, head.tss_head().phys() | rw);
            layout::write_dword(pt, (at + 1) * 4, src.0.phys() | rw);
        }
    }
}

/// Materialises the full 4-page block for real instruction `real_ix`. The
/// instruction's own source register never appears here: it is mapped by
/// whichever blocks branch to this one.
pub fn materialise_real(real_ix: usize, dst: RegPage, nz: Successor, z: Successor) {
    let block = layout::PageArena::block_of(real_ix);
    let slot = slot_of(real_ix);
    // every edge must change slot, or the next switch would hit a TSS the
    // hardware still considers busy
    for succ in [nz, z] {
        if let Successor::Real { ix, .. } = succ {
            debug_assert!(slot_of(ix) != slot);
        }
    }
    write_directory(block.pd(), block.pt());
    write_window_pt(block, slot, dst, nz, z);
    write_tss_head(block, slot);
    write_idt(
        block,
        match nz {
            Successor::Exit => RealTarget::Exit,
            Successor::Real { ix, .. } => RealTarget::Real(ix),
        },
        match z {
            Successor::Exit => RealTarget::Exit,
            Successor::Real { ix, .. } => RealTarget::Real(ix),
        },
    );
}

#[test_case]
fn lowered_targets_keep_slots_rotating() {
    // an abstract edge can reach 3t or 3t+1 from a visible move at 3i+2,
    // and padding steps within a triple always advance by one
    for t in 0..8usize {
        assert_eq!(slot_of(nz_real(t)), 0);
        assert_eq!(slot_of(z_real(t)), 1);
    }
    for i in 0..8usize {
        let visible = i * 3 + 2;
        assert_eq!(slot_of(visible), 2);
        assert_ne!(slot_of(visible), slot_of(nz_real((i + 1) % 8)));
        assert_ne!(slot_of(visible), slot_of(z_real((i + 1) % 8)));
    }
}

#[test_case]
fn register_page_round_trips_values() {
    let page = RegPage(layout::PG_DISCARD);
    init_register_page(page, 0);
    for v in [0u32, 1, 2, 1024, layout::REG_VALUE_MAX] {
        reg_write(page, v);
        assert_eq!(reg_read(page), v);
    }
    init_register_page(page, 0);
}

#[test_case]
fn register_page_segments_are_flat() {
    let page = RegPage(layout::PG_DISCARD);
    init_register_page(page, 7);
    assert_eq!(layout::read_dword(page.0, TAIL_ES), layout::SEL_DATA as u32);
    assert_eq!(layout::read_dword(page.0, TAIL_CS), layout::SEL_CODE as u32);
    assert_eq!(layout::read_dword(page.0, TAIL_ESP), 7 << 2);
    init_register_page(page, 0);
}
