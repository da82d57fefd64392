//! Interrupt and exception delivery across the three operating modes, plus
//! IRET and external-interrupt polling.
//!
//! Faults raised *while delivering* another event never escape as Rust-level
//! control flow: each delivery runs against a snapshot of the transfer state
//! (CS/SS/EIP/ESP/CPL), and a fault inside the sequence restores the
//! snapshot and either redelivers, escalates to #DF per the compatibility
//! table, or exits with a triple fault. Mode switches (leaving v8086 to run
//! a handler, IRET back into v8086) are explicit outcomes, not exceptions.

use crate::descriptors::{self, load_stack_segment, mark_accessed};
use crate::exceptions::{should_double_fault, Exception, Vector};
use crate::flags::{FLAG_IF, FLAG_NT, FLAG_RF, FLAG_TF, FLAG_VM};
use crate::mem::{with_supervisor_access, CpuBus};
use crate::segment::{GateDescriptor, GateKind, Segment};
use crate::stack::{check_push_space, pop16, pop32, push16, push32, set_stack_ptr, stack_ptr};
use crate::state::{gpr, CpuMode, CpuState, SegReg};
use crate::tasking::{self, TaskSwitchSource};

/// Terminal outcomes that tear down the current execution environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuExit {
    /// A fault was raised while delivering #DF. The virtual machine resets.
    TripleFault,
    /// CR0.PE or EFLAGS.VM changed; the CPU must be rebuilt in the named
    /// mode (see [`crate::modes::apply_mode_switch`]).
    ModeSwitch(CpuMode),
    /// A guest behavior class this core intentionally does not model.
    Unimplemented(&'static str),
}

/// External interrupt controller. Polled, never pushed: the caller clears
/// pending state and fetches the vector atomically with respect to this
/// core's execution.
pub trait InterruptController {
    fn pending_vector(&mut self) -> Option<u8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    Software,
    External,
}

/// An event waiting for delivery at the next instruction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingEvent {
    /// Saved EIP is the faulting instruction.
    Fault { exception: Exception, saved_eip: u32 },
    /// Saved EIP is the return address; `inst_len` allows rewinding to the
    /// INT itself when delivery faults.
    Interrupt {
        vector: u8,
        return_eip: u32,
        inst_len: u32,
        source: InterruptSource,
    },
}

/// Dispatcher bookkeeping that is not architecturally visible.
#[derive(Debug, Default)]
pub struct PendingEventState {
    pending_event: Option<PendingEvent>,
    /// The fault currently being delivered, for #DF escalation.
    delivering: Option<Vector>,
    /// Interrupt shadow (STI / MOV SS / POP SS).
    interrupt_inhibit: u8,
}

impl PendingEventState {
    /// Queue a faulting exception. Page faults record the faulting linear
    /// address into CR2 here, regardless of mode.
    pub fn raise_exception_fault(
        &mut self,
        state: &mut CpuState,
        exception: Exception,
        faulting_eip: u32,
        linear_addr: Option<u32>,
    ) {
        if exception.vector == Vector::PageFault {
            if let Some(addr) = linear_addr {
                state.cr2 = addr;
            }
        }
        self.pending_event = Some(PendingEvent::Fault {
            exception,
            saved_eip: faulting_eip,
        });
    }

    /// Queue a software interrupt (`INT n`, `INT3`, `INTO`).
    pub fn raise_software_interrupt(&mut self, vector: u8, return_eip: u32, inst_len: u32) {
        self.pending_event = Some(PendingEvent::Interrupt {
            vector,
            return_eip,
            inst_len,
            source: InterruptSource::Software,
        });
    }

    pub fn has_pending_event(&self) -> bool {
        self.pending_event.is_some()
    }

    /// Inhibit maskable interrupts for exactly one instruction.
    pub fn inhibit_interrupts_for_one_instruction(&mut self) {
        self.interrupt_inhibit = 1;
    }

    /// Call after each retired instruction to age the interrupt shadow.
    pub fn retire_instruction(&mut self) {
        if self.interrupt_inhibit > 0 {
            self.interrupt_inhibit -= 1;
        }
    }
}

/// Deliver any queued event.
pub fn deliver_pending_event<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    pending: &mut PendingEventState,
) -> Result<(), CpuExit> {
    let Some(event) = pending.pending_event.take() else {
        return Ok(());
    };
    match event {
        PendingEvent::Fault {
            exception,
            saved_eip,
        } => deliver_fault(state, bus, pending, exception, saved_eip),
        PendingEvent::Interrupt {
            vector,
            return_eip,
            inst_len,
            source,
        } => dispatch(
            state,
            bus,
            pending,
            VectorDelivery {
                vector,
                saved_eip: return_eip,
                restart_eip: return_eip.wrapping_sub(inst_len),
                error_code: None,
                source,
            },
        ),
    }
}

/// Poll the interrupt controller and deliver, respecting IF, the interrupt
/// shadow, and queued-event priority. A delivered interrupt wakes `HLT`.
pub fn poll_and_deliver_external_interrupt<B: CpuBus, C: InterruptController>(
    state: &mut CpuState,
    bus: &mut B,
    pending: &mut PendingEventState,
    ctrl: &mut C,
) -> Result<(), CpuExit> {
    if pending.pending_event.is_some() {
        // Exceptions and INTn take priority.
        return Ok(());
    }
    if !state.flags.get(FLAG_IF) || pending.interrupt_inhibit > 0 {
        return Ok(());
    }
    let Some(vector) = ctrl.pending_vector() else {
        return Ok(());
    };

    state.halted = false;
    let eip = state.eip;
    dispatch(
        state,
        bus,
        pending,
        VectorDelivery {
            vector,
            saved_eip: eip,
            restart_eip: eip,
            error_code: None,
            source: InterruptSource::External,
        },
    )
}

#[derive(Debug, Clone, Copy)]
struct VectorDelivery {
    vector: u8,
    /// EIP pushed in the handler frame.
    saved_eip: u32,
    /// EIP a contained fault re-points at (the start of the faulting
    /// instruction; for software interrupts, the INT itself).
    restart_eip: u32,
    error_code: Option<u32>,
    source: InterruptSource,
}

impl VectorDelivery {
    fn software(&self) -> bool {
        self.source == InterruptSource::Software
    }

    /// EXT bit of error codes produced while delivering this event.
    fn ext_bit(&self) -> u32 {
        if self.software() {
            0
        } else {
            1
        }
    }

    /// IDT-format error code for faults on this vector's gate.
    fn idt_error_code(&self) -> u32 {
        ((self.vector as u32) << 3) | 0x2 | self.ext_bit()
    }
}

/// How a completed delivery leaves the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Done,
    ModeSwitch(CpuMode),
}

/// Internal result of a delivery sequence: an architectural fault to be
/// contained by the caller, or a fatal exit that propagates unchanged.
enum DeliveryError {
    Fault(Exception),
    Fatal(CpuExit),
}

impl From<Exception> for DeliveryError {
    fn from(e: Exception) -> Self {
        DeliveryError::Fault(e)
    }
}

/// The transfer state restored when delivery itself faults.
///
/// EFLAGS is included so a fault after the v8086 sequence clears VM
/// redelivers from the original mode.
struct TransferSnapshot {
    cs: Segment,
    ss: Segment,
    ds: Segment,
    es: Segment,
    fs: Segment,
    gs: Segment,
    eip: u32,
    esp: u32,
    eflags: u32,
    cpl: u8,
    mode: CpuMode,
}

impl TransferSnapshot {
    fn capture(state: &mut CpuState) -> Self {
        Self {
            cs: state.cs,
            ss: state.ss,
            ds: state.ds,
            es: state.es,
            fs: state.fs,
            gs: state.gs,
            eip: state.eip,
            esp: state.gpr32(gpr::ESP),
            eflags: state.eflags(),
            cpl: state.cpl(),
            mode: state.mode,
        }
    }

    fn restore(&self, state: &mut CpuState) {
        state.cs = self.cs;
        state.ss = self.ss;
        state.ds = self.ds;
        state.es = self.es;
        state.fs = self.fs;
        state.gs = self.gs;
        state.eip = self.eip;
        state.set_gpr32(gpr::ESP, self.esp);
        state.flags.write(self.eflags);
        state.mode = self.mode;
        state.set_cpl(self.cpl);
    }
}

/// Deliver one fault, escalating per the double-fault compatibility table.
fn deliver_fault<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    pending: &mut PendingEventState,
    exception: Exception,
    saved_eip: u32,
) -> Result<(), CpuExit> {
    if let Some(first) = pending.delivering {
        if first == Vector::DoubleFault {
            return Err(CpuExit::TripleFault);
        }
        if exception.vector != Vector::DoubleFault
            && should_double_fault(first, exception.vector)
        {
            return deliver_fault(
                state,
                bus,
                pending,
                Exception::new(Vector::DoubleFault, Some(0)),
                saved_eip,
            );
        }
    }

    let code = if exception.vector.pushes_error_code() {
        Some(exception.error_code.unwrap_or(0))
    } else {
        None
    };

    let prev = pending.delivering.replace(exception.vector);
    let res = dispatch(
        state,
        bus,
        pending,
        VectorDelivery {
            vector: exception.vector.number(),
            saved_eip,
            restart_eip: saved_eip,
            error_code: code,
            source: InterruptSource::External,
        },
    );
    pending.delivering = prev;
    res
}

/// Run the per-mode delivery sequence with fault containment.
fn dispatch<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    pending: &mut PendingEventState,
    delivery: VectorDelivery,
) -> Result<(), CpuExit> {
    let snapshot = TransferSnapshot::capture(state);
    let res = match state.mode {
        CpuMode::Real => real_mode_dispatch(state, bus, &delivery),
        CpuMode::Protected => protected_mode_dispatch(state, bus, &delivery),
        CpuMode::Vm86 => vm86_mode_dispatch(state, bus, &delivery),
    };
    match res {
        Ok(Transfer::Done) => Ok(()),
        Ok(Transfer::ModeSwitch(mode)) => Err(CpuExit::ModeSwitch(mode)),
        Err(DeliveryError::Fatal(exit)) => Err(exit),
        Err(DeliveryError::Fault(fault)) => {
            snapshot.restore(state);
            let eip = if fault.points_to_self {
                delivery.restart_eip
            } else {
                delivery.saved_eip
            };
            deliver_fault(state, bus, pending, fault, eip)
        }
    }
}

fn real_mode_dispatch<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    delivery: &VectorDelivery,
) -> Result<Transfer, DeliveryError> {
    let entry = (delivery.vector as u32) * 4;
    state
        .idtr
        .check_bounds(entry, 4)
        .map_err(|_| Exception::new(Vector::GeneralProtection, Some(entry)).pointing_to_self())?;

    let idtr = state.idtr;
    let offset = idtr.read_u16(bus, entry)?;
    let segment = idtr.read_u16(bus, entry + 2)?;

    let flags = state.eflags() as u16;
    let cs = state.cs.selector();
    push16(state, bus, flags)?;
    push16(state, bus, cs)?;
    push16(state, bus, delivery.saved_eip as u16)?;

    state.flags.set(FLAG_IF, false);
    state.flags.set(FLAG_TF, false);

    state.cs = Segment::real(segment, true);
    state.eip = offset as u32;
    Ok(Transfer::Done)
}

/// The target code segment of a gate, resolved and privilege-checked.
struct GateTarget {
    cs: Segment,
    new_cpl: u8,
    escalate: bool,
}

fn resolve_gate_target<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    selector: u16,
    ext: u32,
) -> Result<GateTarget, DeliveryError> {
    if descriptors::selector_index(selector) == 0 && !descriptors::selector_uses_ldt(selector) {
        return Err(Exception::new(Vector::GeneralProtection, Some(ext))
            .pointing_to_self()
            .into());
    }
    let cpl = state.cpl();
    let gdtr = state.gdtr;
    let ldtr = state.ldtr;
    let target = with_supervisor_access(bus, |bus| {
        descriptors::load_segment(bus, &gdtr, &ldtr, selector)
    })
    .map_err(|e| DeliveryError::Fault(e.pointing_to_self()))?;

    if !target.is_code() || target.is_system() {
        return Err(Exception::gp(selector).pointing_to_self().into());
    }
    if !target.present() {
        return Err(Exception::np(selector).pointing_to_self().into());
    }

    let dpl = target.dpl();
    if target.is_conforming() {
        // Conforming handlers run at the interrupted privilege level.
        if dpl > cpl {
            return Err(Exception::gp(selector).pointing_to_self().into());
        }
        Ok(GateTarget {
            cs: target,
            new_cpl: cpl,
            escalate: false,
        })
    } else if dpl == cpl {
        Ok(GateTarget {
            cs: target,
            new_cpl: cpl,
            escalate: false,
        })
    } else if dpl < cpl {
        Ok(GateTarget {
            cs: target,
            new_cpl: dpl,
            escalate: true,
        })
    } else {
        Err(Exception::gp(selector).pointing_to_self().into())
    }
}

/// Read the IDT gate for a vector; #GP on limit overflow or a non-gate
/// descriptor kind, fatal exit for task gates.
fn read_idt_gate<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    delivery: &VectorDelivery,
) -> Result<GateDescriptor, DeliveryError> {
    let entry = (delivery.vector as u32) * 8;
    let idtr = state.idtr;
    idtr.check_bounds(entry, 8).map_err(|_| {
        Exception::new(Vector::GeneralProtection, Some(delivery.idt_error_code()))
            .pointing_to_self()
    })?;
    let raw = with_supervisor_access(bus, |bus| idtr.read_u64(bus, entry))?;
    let gate = descriptors::decode(delivery.vector as u16 * 8, raw).map_err(|_| {
        Exception::new(Vector::GeneralProtection, Some(delivery.idt_error_code()))
            .pointing_to_self()
    })?;
    let Segment::Gate(gate) = gate else {
        return Err(
            Exception::new(Vector::GeneralProtection, Some(delivery.idt_error_code()))
                .pointing_to_self()
                .into(),
        );
    };
    match gate.kind {
        GateKind::Interrupt16 | GateKind::Interrupt32 | GateKind::Trap16 | GateKind::Trap32 => {}
        GateKind::Task => {
            return Err(DeliveryError::Fatal(CpuExit::Unimplemented(
                "task gate in IDT",
            )))
        }
        GateKind::Call16 | GateKind::Call32 => {
            return Err(
                Exception::new(Vector::GeneralProtection, Some(delivery.idt_error_code()))
                    .pointing_to_self()
                    .into(),
            )
        }
    }
    if !gate.present {
        return Err(
            Exception::new(Vector::SegmentNotPresent, Some(delivery.idt_error_code()))
                .pointing_to_self()
                .into(),
        );
    }
    // INT n honors the gate DPL; hardware interrupts and exceptions do not.
    if delivery.software() && state.cpl() > gate.dpl {
        return Err(
            Exception::new(Vector::GeneralProtection, Some(delivery.idt_error_code()))
                .pointing_to_self()
                .into(),
        );
    }
    Ok(gate)
}

fn protected_mode_dispatch<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    delivery: &VectorDelivery,
) -> Result<Transfer, DeliveryError> {
    let gate = read_idt_gate(state, bus, delivery)?;
    let gate32 = gate.kind.is_32bit();
    let ext = delivery.ext_bit();

    let target = resolve_gate_target(state, bus, gate.selector, ext)?;

    let old_cs = state.cs.selector();
    let old_eip = delivery.saved_eip;
    let old_flags = state.eflags();

    if target.escalate {
        let old_ss = state.ss.selector();
        let old_esp = stack_ptr(state);

        let (new_ss_sel, new_esp) = with_supervisor_access(bus, |bus| {
            tasking::ring_stack(state, bus, target.new_cpl)
        })
        .map_err(|e| DeliveryError::Fault(e.pointing_to_self()))?;

        let gdtr = state.gdtr;
        let ldtr = state.ldtr;
        let new_ss = with_supervisor_access(bus, |bus| {
            load_stack_segment(bus, &gdtr, &ldtr, new_ss_sel, target.new_cpl)
        })
        // Stack-segment problems found through the TSS surface as #TS.
        .map_err(|_| DeliveryError::Fault(Exception::ts(new_ss_sel).pointing_to_self()))?;

        state.ss = new_ss;
        set_stack_ptr(state, new_esp);
        state.set_cpl(target.new_cpl);

        let frame = if delivery.error_code.is_some() { 24 } else { 20 };
        let frame = if gate32 { frame } else { frame / 2 };
        check_push_space(state, frame).map_err(|e| DeliveryError::Fault(e.pointing_to_self()))?;

        if gate32 {
            push32(state, bus, old_ss as u32)?;
            push32(state, bus, old_esp)?;
        } else {
            push16(state, bus, old_ss)?;
            push16(state, bus, old_esp as u16)?;
        }
    }

    if gate32 {
        push32(state, bus, old_flags)?;
        push32(state, bus, old_cs as u32)?;
        push32(state, bus, old_eip)?;
        if let Some(code) = delivery.error_code {
            push32(state, bus, code)?;
        }
    } else {
        push16(state, bus, old_flags as u16)?;
        push16(state, bus, old_cs)?;
        push16(state, bus, old_eip as u16)?;
        if let Some(code) = delivery.error_code {
            push16(state, bus, code as u16)?;
        }
    }

    commit_handler_entry(state, bus, target, gate.kind, gate.offset)?;
    Ok(Transfer::Done)
}

/// Install CS:EIP and the entry flag state for a resolved gate target.
fn commit_handler_entry<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    target: GateTarget,
    gate_kind: GateKind,
    gate_offset: u32,
) -> Result<(), DeliveryError> {
    let offset = if gate_kind.is_32bit() {
        gate_offset
    } else {
        gate_offset & 0xFFFF
    };
    target
        .cs
        .check_bounds(offset, 1)
        .map_err(|_| Exception::gp0().pointing_to_self())?;

    let mut cs = target.cs;
    cs.set_rpl(target.new_cpl);
    if let Segment::Desc(d) = &cs {
        let gdtr = state.gdtr;
        let ldtr = state.ldtr;
        let (selector, raw) = (d.selector, d.raw);
        with_supervisor_access(bus, |bus| mark_accessed(bus, &gdtr, &ldtr, selector, raw))?;
    }
    state.cs = cs;
    state.eip = offset;
    state.set_cpl(target.new_cpl);

    if matches!(gate_kind, GateKind::Interrupt16 | GateKind::Interrupt32) {
        state.flags.set(FLAG_IF, false);
    }
    state.flags.set(FLAG_TF, false);
    state.flags.set(FLAG_NT, false);
    state.flags.set(FLAG_RF, false);
    Ok(())
}

fn vm86_mode_dispatch<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    delivery: &VectorDelivery,
) -> Result<Transfer, DeliveryError> {
    // INT n is an IOPL-sensitive instruction in v8086 mode.
    if delivery.software() {
        let iopl = (state.eflags() >> 12) & 0x3;
        if iopl != 3 {
            return Err(Exception::gp0().pointing_to_self().into());
        }
    }

    let gate = read_idt_gate(state, bus, delivery)?;
    let gate32 = gate.kind.is_32bit();

    let target = resolve_gate_target(state, bus, gate.selector, delivery.ext_bit())?;
    // Handlers for v8086 events must run in ring 0.
    if target.new_cpl != 0 {
        return Err(Exception::gp(gate.selector).pointing_to_self().into());
    }

    let old_flags = state.eflags();
    let old_cs = state.cs.selector();
    let old_ss = state.ss.selector();
    let old_esp = stack_ptr(state);
    let (old_gs, old_fs, old_ds, old_es) = (
        state.gs.selector(),
        state.fs.selector(),
        state.ds.selector(),
        state.es.selector(),
    );

    let (new_ss_sel, new_esp) =
        with_supervisor_access(bus, |bus| tasking::ring_stack(state, bus, 0))
            .map_err(|e| DeliveryError::Fault(e.pointing_to_self()))?;
    let gdtr = state.gdtr;
    let ldtr = state.ldtr;
    let new_ss =
        with_supervisor_access(bus, |bus| load_stack_segment(bus, &gdtr, &ldtr, new_ss_sel, 0))
            .map_err(|_| DeliveryError::Fault(Exception::ts(new_ss_sel).pointing_to_self()))?;

    // Leave v8086 before touching the ring-0 stack: CPL drops to 0 and VM
    // clears so the pushes observe supervisor semantics.
    state.mode = CpuMode::Protected;
    state.flags.set(FLAG_VM, false);
    state.ss = new_ss;
    set_stack_ptr(state, new_esp);
    state.set_cpl(0);

    // Nine dwords, ten with an error code (words for a 16-bit gate).
    let dwords = if delivery.error_code.is_some() { 10 } else { 9 };
    let frame = if gate32 { dwords * 4 } else { dwords * 2 };
    check_push_space(state, frame).map_err(|e| DeliveryError::Fault(e.pointing_to_self()))?;

    if gate32 {
        push32(state, bus, old_gs as u32)?;
        push32(state, bus, old_fs as u32)?;
        push32(state, bus, old_ds as u32)?;
        push32(state, bus, old_es as u32)?;
        push32(state, bus, old_ss as u32)?;
        push32(state, bus, old_esp)?;
        push32(state, bus, old_flags)?;
        push32(state, bus, old_cs as u32)?;
        push32(state, bus, delivery.saved_eip)?;
        if let Some(code) = delivery.error_code {
            push32(state, bus, code)?;
        }
    } else {
        push16(state, bus, old_gs)?;
        push16(state, bus, old_fs)?;
        push16(state, bus, old_ds)?;
        push16(state, bus, old_es)?;
        push16(state, bus, old_ss)?;
        push16(state, bus, old_esp as u16)?;
        push16(state, bus, old_flags as u16)?;
        push16(state, bus, old_cs)?;
        push16(state, bus, delivery.saved_eip as u16)?;
        if let Some(code) = delivery.error_code {
            push16(state, bus, code as u16)?;
        }
    }

    // The v8086 data segments are unusable in the handler.
    state.gs = Segment::Null;
    state.fs = Segment::Null;
    state.ds = Segment::Null;
    state.es = Segment::Null;

    commit_handler_entry(state, bus, target, gate.kind, gate.offset)?;
    Ok(Transfer::ModeSwitch(CpuMode::Protected))
}

/// IRET. `op32` is the instruction's operand size.
///
/// Returns the mode the CPU must be rebuilt in when the return re-enters
/// v8086 or resumes a nested task whose EFLAGS differ in VM.
pub fn iret<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    op32: bool,
) -> Result<Option<CpuMode>, Exception> {
    match state.mode {
        CpuMode::Real => iret_real(state, bus, op32).map(|_| None),
        CpuMode::Vm86 => iret_vm86(state, bus, op32),
        CpuMode::Protected => iret_protected(state, bus, op32),
    }
}

fn iret_real<B: CpuBus>(state: &mut CpuState, bus: &mut B, op32: bool) -> Result<(), Exception> {
    let code_segment = |state: &CpuState, selector| {
        if state.mode == CpuMode::Vm86 {
            Segment::vm86(selector, true)
        } else {
            Segment::real(selector, true)
        }
    };
    if op32 {
        let eip = pop32(state, bus)?;
        let cs = pop32(state, bus)? as u16;
        let eflags = pop32(state, bus)?;
        state.cs = code_segment(state, cs);
        state.eip = eip;
        // The upper word (VM and friends) is not writable from this form.
        let keep = state.eflags() & 0xFFFF_0000;
        let _ = state.write_eflags(keep | (eflags & 0xFFFF));
    } else {
        let ip = pop16(state, bus)?;
        let cs = pop16(state, bus)?;
        let flags = pop16(state, bus)?;
        state.cs = code_segment(state, cs);
        state.eip = ip as u32;
        let keep = state.eflags() & 0xFFFF_0000;
        let _ = state.write_eflags(keep | flags as u32);
    }
    Ok(())
}

fn iret_vm86<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    op32: bool,
) -> Result<Option<CpuMode>, Exception> {
    // Without IOPL 3 the instruction is privileged in v8086.
    let iopl = (state.eflags() >> 12) & 0x3;
    if iopl != 3 {
        return Err(Exception::gp0());
    }
    iret_real(state, bus, op32)?;
    Ok(None)
}

fn iret_protected<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    op32: bool,
) -> Result<Option<CpuMode>, Exception> {
    if state.flags.get(FLAG_NT) {
        return iret_task_return(state, bus);
    }

    let (new_eip, new_cs_sel, new_flags) = if op32 {
        let eip = pop32(state, bus)?;
        let cs = pop32(state, bus)? as u16;
        let flags = pop32(state, bus)?;
        (eip, cs, flags)
    } else {
        let ip = pop16(state, bus)? as u32;
        let cs = pop16(state, bus)? as u16;
        let flags = pop16(state, bus)? as u32;
        (ip, cs, flags)
    };

    if op32 && new_flags & FLAG_VM != 0 && state.cpl() == 0 {
        return iret_to_vm86(state, bus, new_eip, new_cs_sel, new_flags);
    }

    let cpl = state.cpl();
    let rpl = descriptors::selector_rpl(new_cs_sel);
    if rpl < cpl {
        return Err(Exception::gp(new_cs_sel));
    }

    let target = descriptors::load_segment(bus, &state.gdtr, &state.ldtr, new_cs_sel)?;
    if target.is_null() {
        return Err(Exception::gp0());
    }
    if !target.is_code() || target.is_system() {
        return Err(Exception::gp(new_cs_sel));
    }
    if target.is_conforming() {
        if target.dpl() > rpl {
            return Err(Exception::gp(new_cs_sel));
        }
    } else if target.dpl() != rpl {
        return Err(Exception::gp(new_cs_sel));
    }
    if !target.present() {
        return Err(Exception::np(new_cs_sel));
    }

    let outer = rpl > cpl;
    let (new_esp, new_ss) = if outer {
        let (esp, ss_sel) = if op32 {
            let esp = pop32(state, bus)?;
            let ss = pop32(state, bus)? as u16;
            (esp, ss)
        } else {
            let sp = pop16(state, bus)? as u32;
            let ss = pop16(state, bus)?;
            (sp, ss)
        };
        let ss = descriptors::load_stack_segment(bus, &state.gdtr, &state.ldtr, ss_sel, rpl)?;
        (Some(esp), Some(ss))
    } else {
        (None, None)
    };

    let mut cs = target;
    cs.set_rpl(rpl);
    state.cs = cs;
    state.eip = if op32 { new_eip } else { new_eip & 0xFFFF };

    apply_iret_flags(state, new_flags, op32, cpl);
    state.set_cpl(rpl);

    if let (Some(esp), Some(ss)) = (new_esp, new_ss) {
        state.ss = ss;
        set_stack_ptr(state, esp);
        // Data segments the outer ring may not touch are cleared on the way
        // out.
        for reg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            let seg = *state.segment(reg);
            if !seg.is_null()
                && !seg.is_conforming()
                && (seg.is_data() || seg.is_code())
                && seg.dpl() < rpl
            {
                state.set_segment(reg, Segment::Null);
            }
        }
    }
    Ok(None)
}

/// Merge popped EFLAGS under the POPF privilege gating.
fn apply_iret_flags(state: &mut CpuState, new_flags: u32, op32: bool, cpl: u8) {
    let cur = state.eflags();
    let iopl = (cur >> 12) & 0x3;

    let mut write_mask: u32 = if op32 { 0x0025_7FD5 } else { 0x0000_7FD5 };
    if cpl != 0 {
        write_mask &= !(0x3 << 12); // IOPL changes only at CPL 0
    }
    if cpl as u32 > iopl {
        write_mask &= !FLAG_IF;
    }
    write_mask &= !FLAG_VM;

    let merged = (cur & !write_mask) | (new_flags & write_mask);
    let _ = state.write_eflags(merged);
}

fn iret_to_vm86<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    new_eip: u32,
    new_cs: u16,
    new_flags: u32,
) -> Result<Option<CpuMode>, Exception> {
    let esp = pop32(state, bus)?;
    let ss = pop32(state, bus)? as u16;
    let es = pop32(state, bus)? as u16;
    let ds = pop32(state, bus)? as u16;
    let fs = pop32(state, bus)? as u16;
    let gs = pop32(state, bus)? as u16;

    let _ = state.write_eflags(new_flags | FLAG_VM);
    state.cs = Segment::vm86(new_cs, true);
    state.ss = Segment::vm86(ss, false);
    state.ds = Segment::vm86(ds, false);
    state.es = Segment::vm86(es, false);
    state.fs = Segment::vm86(fs, false);
    state.gs = Segment::vm86(gs, false);
    state.eip = new_eip & 0xFFFF;
    state.mode = CpuMode::Vm86;
    state.set_cpl(3);
    state.set_gpr32(gpr::ESP, esp);

    Ok(Some(CpuMode::Vm86))
}

/// IRET with NT set resumes the task named by the current TSS back-link.
fn iret_task_return<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
) -> Result<Option<CpuMode>, Exception> {
    let tr = state.tr;
    if tr.is_null() {
        return Err(Exception::ts(0));
    }
    let link = with_supervisor_access(bus, |bus| bus.read_u16(tr.base()))?;
    tasking::switch_task(state, bus, TaskSwitchSource::Iret, link, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_shadow_ages_out() {
        let mut pending = PendingEventState::default();
        pending.inhibit_interrupts_for_one_instruction();
        assert_eq!(pending.interrupt_inhibit, 1);
        pending.retire_instruction();
        pending.retire_instruction();
        assert_eq!(pending.interrupt_inhibit, 0);
    }

    #[test]
    fn page_fault_records_cr2() {
        let mut state = CpuState::default();
        let mut pending = PendingEventState::default();
        pending.raise_exception_fault(
            &mut state,
            Exception::pf(0x2),
            0x1000,
            Some(0xDEAD_0000),
        );
        assert_eq!(state.cr2, 0xDEAD_0000);
        assert!(pending.has_pending_event());
    }
}
