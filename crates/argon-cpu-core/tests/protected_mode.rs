use argon_cpu_core::descriptors;
use argon_cpu_core::exceptions::Exception;
use argon_cpu_core::flags::{FLAG_IF, FLAG_TF};
use argon_cpu_core::interrupts::{deliver_pending_event, iret, CpuExit, PendingEventState};
use argon_cpu_core::mem::{CpuBus, FlatTestBus};
use argon_cpu_core::segment::{DescKind, Segment};
use argon_cpu_core::state::{gpr, CpuMode, CpuState};

const GDT_BASE: u32 = 0x1000;
const IDT_BASE: u32 = 0x2000;
const TSS_BASE: u32 = 0x3000;

const RING0_CODE: u16 = 0x08;
const RING0_DATA: u16 = 0x10;
const RING3_CODE: u16 = 0x1B;
const RING3_DATA: u16 = 0x23;
const CONFORMING_CODE: u16 = 0x28;

fn write_descriptor(bus: &mut FlatTestBus, selector: u16, base: u32, limit: u32, access: u8, flags: u8) {
    let index = (selector >> 3) as u32;
    let addr = GDT_BASE + index * 8;
    bus.write_u16(addr, (limit & 0xFFFF) as u16).unwrap();
    bus.write_u16(addr + 2, (base & 0xFFFF) as u16).unwrap();
    bus.write_u8(addr + 4, (base >> 16) as u8).unwrap();
    bus.write_u8(addr + 5, access).unwrap();
    bus.write_u8(addr + 6, (((limit >> 16) & 0xF) as u8) | (flags << 4))
        .unwrap();
    bus.write_u8(addr + 7, (base >> 24) as u8).unwrap();
}

fn write_idt_gate(bus: &mut FlatTestBus, vector: u8, selector: u16, offset: u32, type_attr: u8) {
    let addr = IDT_BASE + (vector as u32) * 8;
    bus.write_u16(addr, (offset & 0xFFFF) as u16).unwrap();
    bus.write_u16(addr + 2, selector).unwrap();
    bus.write_u8(addr + 4, 0).unwrap();
    bus.write_u8(addr + 5, type_attr).unwrap();
    bus.write_u16(addr + 6, (offset >> 16) as u16).unwrap();
}

/// Protected-mode machine with a flat 32-bit GDT, an empty IDT, and a
/// ring-0 stack published through a 32-bit TSS.
fn protected_cpu(bus: &mut FlatTestBus) -> CpuState {
    write_descriptor(bus, RING0_CODE, 0, 0xFFFFF, 0x9A, 0x4);
    write_descriptor(bus, RING0_DATA, 0, 0xFFFFF, 0x92, 0x4);
    write_descriptor(bus, RING3_CODE, 0, 0xFFFFF, 0xFA, 0x4);
    write_descriptor(bus, RING3_DATA, 0, 0xFFFFF, 0xF2, 0x4);
    write_descriptor(bus, CONFORMING_CODE, 0, 0xFFFFF, 0x9E, 0x4);

    let mut state = CpuState::new(CpuMode::Protected);
    state.gdtr = Segment::Table {
        base: GDT_BASE,
        limit: 0xFF,
    };
    state.idtr = Segment::Table {
        base: IDT_BASE,
        limit: 0x7FF,
    };

    // Current TSS: ring-0 stack at RING0_DATA:0x5000.
    state.tr = descriptors::decode(
        0x30,
        raw_descriptor(TSS_BASE, 0x67, 0x8B, 0x0),
    )
    .unwrap();
    bus.write_u32(TSS_BASE + 0x04, 0x5000).unwrap();
    bus.write_u16(TSS_BASE + 0x08, RING0_DATA).unwrap();
    state
}

fn raw_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let mut raw = 0u64;
    raw |= (limit & 0xFFFF) as u64;
    raw |= ((base & 0xFF_FFFF) as u64) << 16;
    raw |= (access as u64) << 40;
    raw |= (((limit >> 16) & 0xF) as u64) << 48;
    raw |= ((flags & 0xF) as u64) << 52;
    raw |= ((base >> 24) as u64) << 56;
    raw
}

fn enter_user_mode(state: &mut CpuState, bus: &mut FlatTestBus) {
    state.cs = descriptors::load_segment(bus, &state.gdtr, &state.ldtr, RING3_CODE).unwrap();
    state.ss =
        descriptors::load_stack_segment(bus, &state.gdtr, &state.ldtr, RING3_DATA, 3).unwrap();
    state.set_cpl(3);
    state.set_gpr32(gpr::ESP, 0x9000);
}

#[test]
fn page_fault_escalates_to_ring0_with_stack_switch() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);
    let mut pending = PendingEventState::default();

    write_idt_gate(&mut bus, 14, RING0_CODE, 0x4000, 0x8E);
    enter_user_mode(&mut state, &mut bus);
    state.eip = 0x1234;
    let old_flags = state.eflags();

    pending.raise_exception_fault(
        &mut state,
        Exception::pf(0x04),
        0x1234,
        Some(0xCAFE_F000),
    );
    deliver_pending_event(&mut state, &mut bus, &mut pending).unwrap();

    assert_eq!(state.cpl(), 0);
    assert_eq!(state.cr2, 0xCAFE_F000);
    assert_eq!(state.cs.selector(), RING0_CODE);
    assert_eq!(state.ss.selector(), RING0_DATA);
    assert_eq!(state.eip, 0x4000);

    // New stack, innermost first: error code, EIP, CS, EFLAGS, ESP, SS.
    let esp = state.gpr32(gpr::ESP);
    assert_eq!(esp, 0x5000 - 24);
    assert_eq!(bus.read_u32(esp).unwrap(), 0x04);
    assert_eq!(bus.read_u32(esp + 4).unwrap(), 0x1234);
    assert_eq!(bus.read_u32(esp + 8).unwrap(), RING3_CODE as u32);
    assert_eq!(bus.read_u32(esp + 12).unwrap(), old_flags);
    assert_eq!(bus.read_u32(esp + 16).unwrap(), 0x9000);
    assert_eq!(bus.read_u32(esp + 20).unwrap(), RING3_DATA as u32);

    // Interrupt gate: IF cleared; TF always cleared.
    assert!(!state.flags.get(FLAG_IF));
    assert!(!state.flags.get(FLAG_TF));
}

#[test]
fn iret_returns_to_the_outer_ring() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);
    let mut pending = PendingEventState::default();

    write_idt_gate(&mut bus, 0x80, RING0_CODE, 0x4000, 0xEE);
    enter_user_mode(&mut state, &mut bus);
    let _ = state.write_eflags(0x0202);

    pending.raise_software_interrupt(0x80, 0x2002, 2);
    deliver_pending_event(&mut state, &mut bus, &mut pending).unwrap();
    assert_eq!(state.cpl(), 0);

    iret(&mut state, &mut bus, true).unwrap();
    assert_eq!(state.cpl(), 3);
    assert_eq!(state.cs.selector(), RING3_CODE);
    assert_eq!(state.ss.selector(), RING3_DATA);
    assert_eq!(state.eip, 0x2002);
    assert_eq!(state.gpr32(gpr::ESP), 0x9000);
}

#[test]
fn software_int_through_a_privileged_gate_faults() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);
    let mut pending = PendingEventState::default();

    // Vector 0x80 is reachable only from ring 0; #GP lands on vector 13.
    write_idt_gate(&mut bus, 0x80, RING0_CODE, 0x4000, 0x8E);
    write_idt_gate(&mut bus, 13, RING0_CODE, 0x4800, 0x8E);
    enter_user_mode(&mut state, &mut bus);

    pending.raise_software_interrupt(0x80, 0x2002, 2);
    deliver_pending_event(&mut state, &mut bus, &mut pending).unwrap();

    assert_eq!(state.eip, 0x4800, "delivered #GP, not the requested vector");
    // #GP error code names the offending IDT slot.
    let esp = state.gpr32(gpr::ESP);
    assert_eq!(bus.read_u32(esp).unwrap(), (0x80 << 3) | 0x2);
    // The pushed return address is the INT itself, rewound by its length.
    assert_eq!(bus.read_u32(esp + 4).unwrap(), 0x2000);
}

#[test]
fn conforming_handler_runs_at_the_callers_privilege() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);
    let mut pending = PendingEventState::default();

    write_idt_gate(&mut bus, 0x40, CONFORMING_CODE, 0x4100, 0xEE);
    enter_user_mode(&mut state, &mut bus);

    pending.raise_software_interrupt(0x40, 0x2002, 2);
    deliver_pending_event(&mut state, &mut bus, &mut pending).unwrap();

    assert_eq!(state.cpl(), 3, "no escalation through conforming code");
    assert_eq!(state.ss.selector(), RING3_DATA, "no stack switch");
    assert_eq!(state.eip, 0x4100);
    // Frame on the caller's stack: EFLAGS, CS, EIP.
    assert_eq!(state.gpr32(gpr::ESP), 0x9000 - 12);
}

#[test]
fn trap_gate_preserves_if() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);
    let mut pending = PendingEventState::default();

    write_idt_gate(&mut bus, 0x41, RING0_CODE, 0x4200, 0x8F);
    state.cs = descriptors::load_segment(&mut bus, &state.gdtr, &state.ldtr, RING0_CODE).unwrap();
    state.ss =
        descriptors::load_stack_segment(&mut bus, &state.gdtr, &state.ldtr, RING0_DATA, 0).unwrap();
    state.set_gpr32(gpr::ESP, 0x5000);
    let _ = state.write_eflags(0x0202);

    pending.raise_software_interrupt(0x41, 0x1002, 2);
    deliver_pending_event(&mut state, &mut bus, &mut pending).unwrap();
    assert!(state.flags.get(FLAG_IF), "trap gates leave IF alone");
}

#[test]
fn sixteen_bit_gate_pushes_a_word_frame() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);
    let mut pending = PendingEventState::default();

    // 16-bit interrupt gate (type 0x6).
    write_idt_gate(&mut bus, 0x42, RING0_CODE, 0x4300, 0x86);
    state.cs = descriptors::load_segment(&mut bus, &state.gdtr, &state.ldtr, RING0_CODE).unwrap();
    state.ss =
        descriptors::load_stack_segment(&mut bus, &state.gdtr, &state.ldtr, RING0_DATA, 0).unwrap();
    state.set_gpr32(gpr::ESP, 0x5000);

    pending.raise_software_interrupt(0x42, 0x1002, 2);
    deliver_pending_event(&mut state, &mut bus, &mut pending).unwrap();

    assert_eq!(state.gpr32(gpr::ESP), 0x5000 - 6);
    assert_eq!(bus.read_u16(0x5000 - 6).unwrap(), 0x1002);
    assert_eq!(bus.read_u16(0x5000 - 4).unwrap(), RING0_CODE);
}

#[test]
fn contributory_fault_during_delivery_double_faults() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);
    let mut pending = PendingEventState::default();

    // Vector 11 (#NP) gate decodes to a reserved system type, so delivering
    // #NP raises #GP; #NP + #GP escalates to #DF on vector 8.
    write_idt_gate(&mut bus, 11, RING0_CODE, 0x4400, 0x80);
    write_idt_gate(&mut bus, 8, RING0_CODE, 0x4500, 0x8E);
    state.cs = descriptors::load_segment(&mut bus, &state.gdtr, &state.ldtr, RING0_CODE).unwrap();
    state.ss =
        descriptors::load_stack_segment(&mut bus, &state.gdtr, &state.ldtr, RING0_DATA, 0).unwrap();
    state.set_gpr32(gpr::ESP, 0x5000);

    pending.raise_exception_fault(&mut state, Exception::np(0x33), 0x1000, None);
    deliver_pending_event(&mut state, &mut bus, &mut pending).unwrap();

    assert_eq!(state.eip, 0x4500, "double-fault handler entered");
    // #DF always pushes error code 0.
    let esp = state.gpr32(gpr::ESP);
    assert_eq!(bus.read_u32(esp).unwrap(), 0);
    assert_eq!(bus.read_u32(esp + 4).unwrap(), 0x1000);
}

#[test]
fn fault_while_delivering_double_fault_is_fatal() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);
    let mut pending = PendingEventState::default();

    // Both the #NP gate and the #DF gate are broken.
    write_idt_gate(&mut bus, 11, RING0_CODE, 0x4400, 0x80);
    write_idt_gate(&mut bus, 8, RING0_CODE, 0x4500, 0x80);
    state.cs = descriptors::load_segment(&mut bus, &state.gdtr, &state.ldtr, RING0_CODE).unwrap();
    state.ss =
        descriptors::load_stack_segment(&mut bus, &state.gdtr, &state.ldtr, RING0_DATA, 0).unwrap();
    state.set_gpr32(gpr::ESP, 0x5000);

    pending.raise_exception_fault(&mut state, Exception::np(0x33), 0x1000, None);
    let err = deliver_pending_event(&mut state, &mut bus, &mut pending).unwrap_err();
    assert_eq!(err, CpuExit::TripleFault);
}

#[test]
fn failed_delivery_restores_the_interrupted_context() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);
    let mut pending = PendingEventState::default();

    // Vector 0x50's handler selector is not present; the #NP fault must see
    // the pre-delivery CS/SS/ESP, not a half-switched stack.
    write_descriptor(&mut bus, 0x38, 0, 0xFFFFF, 0x1A, 0x4); // P=0 code
    write_idt_gate(&mut bus, 0x50, 0x38, 0x4000, 0xEE);
    write_idt_gate(&mut bus, 11, RING0_CODE, 0x4600, 0x8E);
    enter_user_mode(&mut state, &mut bus);

    pending.raise_software_interrupt(0x50, 0x2002, 2);
    deliver_pending_event(&mut state, &mut bus, &mut pending).unwrap();

    assert_eq!(state.eip, 0x4600, "#NP handler entered");
    assert_eq!(state.cpl(), 0);
    let esp = state.gpr32(gpr::ESP);
    // #NP error code names the not-present selector.
    assert_eq!(bus.read_u32(esp).unwrap(), 0x38);
    // The frame's saved ESP is the user stack pointer, untouched by the
    // aborted first delivery.
    assert_eq!(bus.read_u32(esp + 16).unwrap(), 0x9000);
}

#[test]
fn task_gate_in_idt_is_a_fatal_exit() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);
    let mut pending = PendingEventState::default();

    write_idt_gate(&mut bus, 0x60, 0x30, 0, 0x85);
    state.cs = descriptors::load_segment(&mut bus, &state.gdtr, &state.ldtr, RING0_CODE).unwrap();
    state.ss =
        descriptors::load_stack_segment(&mut bus, &state.gdtr, &state.ldtr, RING0_DATA, 0).unwrap();
    state.set_gpr32(gpr::ESP, 0x5000);

    pending.raise_software_interrupt(0x60, 0x1002, 2);
    let err = deliver_pending_event(&mut state, &mut bus, &mut pending).unwrap_err();
    assert!(matches!(err, CpuExit::Unimplemented(_)));
}

#[test]
fn selectors_resolve_through_the_ldt() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = protected_cpu(&mut bus);

    // LDT at 0x6000 with one writable data descriptor in slot 0.
    const LDT_BASE: u32 = 0x6000;
    write_descriptor(&mut bus, 0x38, LDT_BASE, 0x17, 0x82, 0x0);
    bus.write_u16(LDT_BASE, 0xFFFF).unwrap();
    bus.write_u16(LDT_BASE + 2, 0).unwrap();
    bus.write_u8(LDT_BASE + 4, 0).unwrap();
    bus.write_u8(LDT_BASE + 5, 0x92).unwrap();
    bus.write_u8(LDT_BASE + 6, 0x40).unwrap();
    bus.write_u8(LDT_BASE + 7, 0).unwrap();

    state.ldtr = descriptors::load_segment(&mut bus, &state.gdtr, &Segment::Null, 0x38).unwrap();

    // Selector 0x04: index 0, TI=1, RPL 0.
    let seg = descriptors::load_data_segment(&mut bus, &state.gdtr, &state.ldtr, 0x04, 0).unwrap();
    assert!(seg.is_writable());
    assert_eq!(seg.limit(), 0xFFFF);

    // An LDT-relative selector past the LDT limit faults with its value.
    let err =
        descriptors::load_data_segment(&mut bus, &state.gdtr, &state.ldtr, 0x1C, 0).unwrap_err();
    assert_eq!(err, Exception::gp(0x1C));
}

#[test]
fn descriptor_round_trip_through_the_gdt() {
    let mut bus = FlatTestBus::new(0x10000);
    let state = protected_cpu(&mut bus);

    let seg = descriptors::load_segment(&mut bus, &state.gdtr, &state.ldtr, RING3_DATA).unwrap();
    assert!(seg.is_data());
    assert!(seg.is_writable());
    assert_eq!(seg.dpl(), 3);
    assert_eq!(seg.rpl(), 3);
    assert_eq!(seg.limit(), 0xFFFFF);

    let Segment::Desc(desc) = seg else {
        panic!("expected a descriptor segment");
    };
    assert_eq!(desc.kind, DescKind::Data);
}
