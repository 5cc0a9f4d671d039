// Host-side bring-up: paging, the GDT the cascade rotates through, the
// return TSS, and the descriptor-table registers.
//
// The host runs on a nearly flat page directory: 4 MiB identity mappings
// everywhere, except that the GDT window entry routes through the same
// small page table the cascade directories use. GDTR is loaded once with
// the window address and never changes, so descriptor fetches resolve to
// the same four physical pages whether the host or an instruction
// directory is active.
//
// The return TSS at selector 0x18 is an ordinary kernel static. It sits
// inside the kernel's 4 MiB identity page, which every instruction
// directory maps, so the exit gate can reach it from inside the cascade.
// Its CR3 field is set once to the host directory; everything else is
// filled in by the hardware when launch() jumps away.

use core::mem::size_of;

use spin::Once;
use x86::controlregs::{cr0, cr0_write, cr4, cr4_write, Cr0, Cr4};
use x86::dtables::{lgdt, lidt, DescriptorTablePointer};
use x86::segmentation::{load_ds, load_es, load_fs, load_gs, load_ss, SegmentSelector};
use x86::task::load_tr;

use crate::descriptors::SegmentDescriptor;
use crate::layout::{
    self, PageIx, GDT_WINDOW_BASE, PDE_GDT, PDE_LARGE, PG_GDT_PT, PTE_PRESENT, PTE_WRITE,
    SEL_CODE, SEL_DATA, SEL_HOST_TSS, WINDOW_BASE,
};

/// i386 TSS, all 104 bytes. Only the return TSS uses this type; the
/// cascade's TSSes are raw page bytes assembled by the synthesiser.
#[repr(C)]
struct TaskStateSegment {
    link: u16,
    _r0: u16,
    esp0: u32,
    ss0: u16,
    _r1: u16,
    esp1: u32,
    ss1: u16,
    _r2: u16,
    esp2: u32,
    ss2: u16,
    _r3: u16,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u16,
    _r4: u16,
    cs: u16,
    _r5: u16,
    ss: u16,
    _r6: u16,
    ds: u16,
    _r7: u16,
    fs: u16,
    _r8: u16,
    gs: u16,
    _r9: u16,
    ldt: u16,
    _r10: u16,
    trap: u16,
    iomap_base: u16,
}

const ZERO_TSS: TaskStateSegment = TaskStateSegment {
    link: 0,
    _r0: 0,
    esp0: 0,
    ss0: 0,
    _r1: 0,
    esp1: 0,
    ss1: 0,
    _r2: 0,
    esp2: 0,
    ss2: 0,
    _r3: 0,
    cr3: 0,
    eip: 0,
    eflags: 0,
    eax: 0,
    ecx: 0,
    edx: 0,
    ebx: 0,
    esp: 0,
    ebp: 0,
    esi: 0,
    edi: 0,
    es: 0,
    _r4: 0,
    cs: 0,
    _r5: 0,
    ss: 0,
    _r6: 0,
    ds: 0,
    _r7: 0,
    fs: 0,
    _r8: 0,
    gs: 0,
    _r9: 0,
    ldt: 0,
    _r10: 0,
    trap: 0,
    iomap_base: 0,
};

static mut HOST_TSS: TaskStateSegment = ZERO_TSS;

#[repr(C, align(4096))]
struct PageDirectory([u32; 1024]);

static mut HOST_PD: PageDirectory = PageDirectory([0; 1024]);

static ACTIVATED: Once<()> = Once::new();

pub fn host_pd_phys() -> u32 {
    (&raw const HOST_PD) as u32
}

fn host_tss_addr() -> u32 {
    (&raw const HOST_TSS) as u32
}

/// Writes the fixed descriptors into GDT page 0: null, flat code at 0x08,
/// flat data at 0x10, and the host-return TSS at 0x18. The rotating slots
/// on pages 1..3 are the program's business and get written at finalise.
pub fn write_host_descriptors(gdt_page: PageIx) {
    let entries = [
        (0usize, SegmentDescriptor::NULL),
        (SEL_CODE as usize, SegmentDescriptor::flat_code()),
        (SEL_DATA as usize, SegmentDescriptor::flat_data()),
        (SEL_HOST_TSS as usize, SegmentDescriptor::tss(host_tss_addr())),
    ];
    for (offset, desc) in entries {
        layout::write_dword(gdt_page, offset, desc.lo());
        layout::write_dword(gdt_page, offset + 4, desc.hi());
    }
}

/// Turns on PSE paging under the host directory, points GDTR at the window,
/// reloads the segment registers, sets IDTR to the instruction window and
/// loads the task register. Safe to call again; only the first call does
/// anything, later ones would trip over the now-busy return TSS.
pub fn activate() {
    ACTIVATED.call_once(|| unsafe {
        let pd = &mut *(&raw mut HOST_PD);
        for (i, entry) in pd.0.iter_mut().enumerate() {
            *entry = ((i as u32) << 22) | PTE_PRESENT | PTE_WRITE | PDE_LARGE;
        }
        pd.0[PDE_GDT] = PG_GDT_PT.phys() | PTE_PRESENT | PTE_WRITE;

        let tss = &mut *(&raw mut HOST_TSS);
        tss.cr3 = host_pd_phys();
        tss.ss0 = SEL_DATA;
        tss.iomap_base = size_of::<TaskStateSegment>() as u16;

        cr4_write(cr4() | Cr4::CR4_ENABLE_PSE);
        x86::controlregs::cr3_write(host_pd_phys() as u64);
        cr0_write(cr0() | Cr0::CR0_ENABLE_PAGING);

        lgdt(&DescriptorTablePointer {
            limit: 0x3FFF,
            base: GDT_WINDOW_BASE as *const u64,
        });

        // CS has to come back through a far return; the data segments are
        // plain moves
        core::arch::asm!(
            "push {code}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            code = const SEL_CODE as i32,
            tmp = out(reg) _,
        );
        load_ds(SegmentSelector::from_raw(SEL_DATA));
        load_es(SegmentSelector::from_raw(SEL_DATA));
        load_ss(SegmentSelector::from_raw(SEL_DATA));
        load_fs(SegmentSelector::from_raw(SEL_DATA));
        load_gs(SegmentSelector::from_raw(SEL_DATA));

        lidt(&DescriptorTablePointer {
            limit: 0x7F,
            base: WINDOW_BASE as *const u64,
        });

        load_tr(SegmentSelector::from_raw(SEL_HOST_TSS));
    });
}

#[test_case]
fn host_tss_is_one_hundred_and_four_bytes() {
    assert_eq!(size_of::<TaskStateSegment>(), 104);
}

#[test_case]
fn host_directory_is_identity_except_the_gdt_window() {
    // activate() ran during init, so the directory is filled in
    let pd = unsafe { &*(&raw const HOST_PD) };
    assert_eq!(pd.0[0], PTE_PRESENT | PTE_WRITE | PDE_LARGE);
    assert_eq!(
        pd.0[layout::PDE_REGION],
        layout::PROGRAM_BASE | PTE_PRESENT | PTE_WRITE | PDE_LARGE
    );
    assert_eq!(pd.0[PDE_GDT], PG_GDT_PT.phys() | PTE_PRESENT | PTE_WRITE);
}
