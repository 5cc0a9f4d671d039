// Encoders for the 8-byte x86 descriptor formats the cascade is built out of.
//
// The engine only ever needs four kinds of segment descriptor:
//  1. the null descriptor (selector 0x00, required by the CPU)
//  2. ring-0 flat code, access byte 0x9A, 4 KiB granularity, limit 0xFFFFF
//  3. ring-0 flat data, access byte 0x92, same granularity and limit
//  4. an available 32-bit TSS, access byte 0x89, byte granularity, limit 0x67
//
// and one kind of IDT entry: the 32-bit task gate (type 0x85). A task gate
// carries no handler address at all, only a TSS selector. When the exception
// fires, the CPU performs a full hardware task switch into that TSS instead
// of calling a handler, which is the whole trick this machine runs on.
//
// The busy variant of the TSS type (0x8B) is never produced here. Busy bits
// get cleared by the context-save aliasing in the instruction blocks, not by
// writing the GDT, so an encoder for 0x8B would only be a way to make
// mistakes.
//
// Layout of a segment descriptor (Intel SDM Vol. 3, 3.4.5), low dword first:
//
//  byte 0-1   limit[15:0]
//  byte 2-3   base[15:0]
//  byte 4     base[23:16]
//  byte 5     access (P | DPL | S | type)
//  byte 6     flags nibble (G | D/B | L | AVL) << 4 | limit[19:16]
//  byte 7     base[31:24]

/// Access byte for ring-0 flat code (present, DPL 0, code, readable).
pub const ACCESS_CODE: u8 = 0x9A;
/// Access byte for ring-0 flat data (present, DPL 0, data, writable).
pub const ACCESS_DATA: u8 = 0x92;
/// Access byte for an available (non-busy) 32-bit TSS.
pub const ACCESS_TSS: u8 = 0x89;

/// Flags nibble for flat segments: G=1 (4 KiB granularity), D/B=1 (32-bit).
const FLAGS_FLAT: u8 = 0xC;
/// Flags nibble for TSS descriptors: byte granularity, no D/B.
const FLAGS_TSS: u8 = 0x0;

/// An x86 TSS is 104 bytes, so its limit is always 0x67.
pub const TSS_LIMIT: u32 = 0x67;

/// One 8-byte GDT entry, kept as a raw u64 so it can be written as the
/// two dword halves the save/load machinery traffics in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    pub const NULL: SegmentDescriptor = SegmentDescriptor(0);

    /// Packs (base, limit, access, flags nibble) into descriptor bytes.
    pub const fn new(base: u32, limit: u32, access: u8, flags: u8) -> SegmentDescriptor {
        let mut raw = 0u64;
        raw |= (limit & 0xFFFF) as u64;
        raw |= ((base & 0xFFFF) as u64) << 16;
        raw |= (((base >> 16) & 0xFF) as u64) << 32;
        raw |= (access as u64) << 40;
        raw |= (((limit >> 16) & 0xF) as u64) << 48;
        raw |= (((flags & 0xF) as u64) << 4) << 48;
        raw |= (((base >> 24) & 0xFF) as u64) << 56;
        SegmentDescriptor(raw)
    }

    /// Ring-0 flat 4 GiB code segment.
    pub const fn flat_code() -> SegmentDescriptor {
        SegmentDescriptor::new(0, 0xFFFFF, ACCESS_CODE, FLAGS_FLAT)
    }

    /// Ring-0 flat 4 GiB data segment.
    pub const fn flat_data() -> SegmentDescriptor {
        SegmentDescriptor::new(0, 0xFFFFF, ACCESS_DATA, FLAGS_FLAT)
    }

    /// Available 32-bit TSS at `base`. Always encodes the non-busy type.
    pub const fn tss(base: u32) -> SegmentDescriptor {
        SegmentDescriptor::new(base, TSS_LIMIT, ACCESS_TSS, FLAGS_TSS)
    }

    /// Low dword, the half that lands in the EAX slot of a TSS head.
    pub const fn lo(self) -> u32 {
        self.0 as u32
    }

    /// High dword, the half that lands in the ECX slot of a TSS head.
    pub const fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    // Decoders. The engine never reads descriptors back at run time; these
    // exist so tests can check the bit packing against the manual.

    pub const fn access(self) -> u8 {
        (self.0 >> 40) as u8
    }

    pub const fn base(self) -> u32 {
        let low = (self.0 >> 16) as u32 & 0xFFFF;
        let mid = (self.0 >> 32) as u32 & 0xFF;
        let high = (self.0 >> 56) as u32 & 0xFF;
        low | (mid << 16) | (high << 24)
    }

    pub const fn limit(self) -> u32 {
        let low = self.0 as u32 & 0xFFFF;
        let high = (self.0 >> 48) as u32 & 0xF;
        low | (high << 16)
    }

    /// True when the granularity bit is set (limit counted in 4 KiB units).
    pub const fn gran4k(self) -> bool {
        (self.0 >> 55) & 1 == 1
    }
}

/// One 8-byte IDT task-gate entry. Bytes 0-1 and 6-7 (the handler offset in
/// an interrupt gate) are reserved in a task gate and stay zero; the selector
/// sits in bytes 2-3 and the access byte 0x85 marks a present 32-bit task
/// gate with DPL 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct TaskGate(u64);

impl TaskGate {
    const ACCESS: u8 = 0x85;

    pub const fn new(tss_selector: u16) -> TaskGate {
        TaskGate(((tss_selector as u64) << 16) | ((Self::ACCESS as u64) << 40))
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn selector(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn access(self) -> u8 {
        (self.0 >> 40) as u8
    }
}

#[test_case]
fn tss_descriptor_is_well_formed() {
    let d = SegmentDescriptor::tss(0x0041_0FD0);
    assert_eq!(d.access(), ACCESS_TSS);
    assert_eq!(d.base(), 0x0041_0FD0);
    assert_eq!(d.limit(), TSS_LIMIT);
    assert!(!d.gran4k());
}

#[test_case]
fn flat_descriptors_match_the_manual() {
    // 0x00CF9A000000FFFF and 0x00CF92000000FFFF are the classic flat-mode
    // pair, byte for byte.
    assert_eq!(SegmentDescriptor::flat_code().raw(), 0x00CF_9A00_0000_FFFF);
    assert_eq!(SegmentDescriptor::flat_data().raw(), 0x00CF_9200_0000_FFFF);
    assert_eq!(SegmentDescriptor::NULL.raw(), 0);
}

#[test_case]
fn descriptor_base_splits_across_all_three_fields() {
    let d = SegmentDescriptor::new(0xAABB_CCDD, 0x67, ACCESS_TSS, 0);
    assert_eq!(d.base(), 0xAABB_CCDD);
    assert_eq!(d.limit(), 0x67);
}

#[test_case]
fn task_gate_carries_selector_only() {
    let g = TaskGate::new(0x2FF8);
    assert_eq!(g.selector(), 0x2FF8);
    assert_eq!(g.access(), 0x85);
    // offset words must stay zero in a task gate
    assert_eq!(g.raw() & 0xFFFF, 0);
    assert_eq!(g.raw() >> 48, 0);
}
