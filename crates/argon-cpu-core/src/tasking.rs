//! Hardware task switching through 16- and 32-bit task state segments.
//!
//! The TSS layouts are byte-exact; every field lives at a fixed offset from
//! the TSS base. All TSS traffic runs under supervisor access. Faults during
//! a switch surface as architectural exceptions (mostly #TS naming the
//! offending selector) and are contained by the dispatcher like any other.

use crate::descriptors::{
    self, load_data_segment, load_stack_segment, selector_index, selector_rpl, selector_uses_ldt,
    set_tss_busy,
};
use crate::exceptions::Exception;
use crate::flags::{FLAG_NT, FLAG_VM};
use crate::mem::{with_supervisor_access, CpuBus};
use crate::segment::{DescKind, Segment};
use crate::stack::{push16, push32};
use crate::state::{gpr, CpuMode, CpuState, SegReg};

/// 32-bit TSS field offsets.
mod tss32 {
    pub const LINK: u32 = 0x00;
    pub const ESP0: u32 = 0x04;
    pub const SS0: u32 = 0x08;
    pub const CR3: u32 = 0x1C;
    pub const EIP: u32 = 0x20;
    pub const EFLAGS: u32 = 0x24;
    pub const EAX: u32 = 0x28;
    pub const ECX: u32 = 0x2C;
    pub const EDX: u32 = 0x30;
    pub const EBX: u32 = 0x34;
    pub const ESP: u32 = 0x38;
    pub const EBP: u32 = 0x3C;
    pub const ESI: u32 = 0x40;
    pub const EDI: u32 = 0x44;
    pub const ES: u32 = 0x48;
    pub const CS: u32 = 0x4C;
    pub const SS: u32 = 0x50;
    pub const DS: u32 = 0x54;
    pub const FS: u32 = 0x58;
    pub const GS: u32 = 0x5C;
    pub const LDT: u32 = 0x60;

    /// Minimum limit to switch to / to save the outgoing state into.
    pub const MIN_LIMIT: u32 = 0x67;
    pub const MIN_SAVE_LIMIT: u32 = 0x5F;
}

/// 16-bit (80286) TSS field offsets.
mod tss16 {
    pub const LINK: u32 = 0x00;
    pub const SP0: u32 = 0x02;
    pub const SS0: u32 = 0x04;
    pub const IP: u32 = 0x0E;
    pub const FLAGS: u32 = 0x10;
    pub const AX: u32 = 0x12;
    pub const CX: u32 = 0x14;
    pub const DX: u32 = 0x16;
    pub const BX: u32 = 0x18;
    pub const SP: u32 = 0x1A;
    pub const BP: u32 = 0x1C;
    pub const SI: u32 = 0x1E;
    pub const DI: u32 = 0x20;
    pub const ES: u32 = 0x22;
    pub const CS: u32 = 0x24;
    pub const SS: u32 = 0x26;
    pub const DS: u32 = 0x28;
    pub const LDT: u32 = 0x2A;

    pub const MIN_LIMIT: u32 = 0x2B;
    pub const MIN_SAVE_LIMIT: u32 = 0x29;
}

/// What initiated the switch; controls busy-bit and back-link handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSwitchSource {
    Call,
    Interrupt,
    Iret,
    Jump,
}

/// Read the ring-`cpl` stack pointer pair out of the current TSS.
///
/// Used by the dispatcher for inter-privilege transitions. #TS on a missing
/// or undersized TSS.
pub fn ring_stack<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    cpl: u8,
) -> Result<(u16, u32), Exception> {
    let tr = state.tr;
    let Segment::Desc(desc) = tr else {
        return Err(Exception::ts(0));
    };
    let DescKind::Tss { bits32, .. } = desc.kind else {
        return Err(Exception::ts(tr.selector()));
    };
    if !tr.present() || cpl > 2 {
        return Err(Exception::ts(tr.selector()));
    }

    let base = tr.base();
    if bits32 {
        let esp_off = tss32::ESP0 + (cpl as u32) * 8;
        let ss_off = tss32::SS0 + (cpl as u32) * 8;
        tr.check_bounds(esp_off, 4)
            .and_then(|_| tr.check_bounds(ss_off, 2))
            .map_err(|_| Exception::ts(tr.selector()))?;
        let esp = bus.read_u32(base.wrapping_add(esp_off))?;
        let ss = bus.read_u16(base.wrapping_add(ss_off))?;
        Ok((ss, esp))
    } else {
        let sp_off = tss16::SP0 + (cpl as u32) * 4;
        let ss_off = tss16::SS0 + (cpl as u32) * 4;
        tr.check_bounds(sp_off, 2)
            .and_then(|_| tr.check_bounds(ss_off, 2))
            .map_err(|_| Exception::ts(tr.selector()))?;
        let sp = bus.read_u16(base.wrapping_add(sp_off))?;
        let ss = bus.read_u16(base.wrapping_add(ss_off))?;
        Ok((ss, sp as u32))
    }
}

/// Perform a hardware task switch to the TSS named by `selector`.
///
/// The outgoing task's dynamic state is saved into the current TSS, the
/// incoming task's state is loaded, and every segment register is reloaded
/// and revalidated under the incoming privilege level. Returns the mode the
/// CPU must be rebuilt in when the incoming EFLAGS flips VM.
pub fn switch_task<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    source: TaskSwitchSource,
    selector: u16,
    error_code: Option<u32>,
) -> Result<Option<CpuMode>, Exception> {
    if selector_uses_ldt(selector) || selector_index(selector) == 0 {
        return Err(Exception::gp(selector));
    }

    let gdtr = state.gdtr;
    let raw =
        with_supervisor_access(bus, |bus| descriptors::read_raw_descriptor(bus, &gdtr, selector))?;
    let incoming = descriptors::decode(selector, raw)?;
    let Segment::Desc(incoming_desc) = incoming else {
        return Err(Exception::gp(selector));
    };
    let DescKind::Tss { bits32, busy } = incoming_desc.kind else {
        return Err(Exception::gp(selector));
    };

    // IRET resumes a busy task; every other source requires an available one.
    if source == TaskSwitchSource::Iret {
        if !busy {
            return Err(Exception::ts(selector));
        }
    } else if busy {
        return Err(Exception::gp(selector));
    }
    if !incoming.present() {
        return Err(Exception::np(selector));
    }
    let min_limit = if bits32 {
        tss32::MIN_LIMIT
    } else {
        tss16::MIN_LIMIT
    };
    if incoming.limit() < min_limit {
        return Err(Exception::ts(selector));
    }

    // The outgoing TSS must be able to hold the saved state.
    let old_tr = state.tr;
    let Segment::Desc(old_desc) = old_tr else {
        return Err(Exception::ts(0));
    };
    let DescKind::Tss { bits32: old_bits32, .. } = old_desc.kind else {
        return Err(Exception::ts(old_tr.selector()));
    };
    let old_min = if old_bits32 {
        tss32::MIN_SAVE_LIMIT
    } else {
        tss16::MIN_SAVE_LIMIT
    };
    if old_tr.limit() < old_min {
        return Err(Exception::ts(old_tr.selector()));
    }

    // JMP and IRET leave the outgoing task; its descriptor becomes available.
    if matches!(source, TaskSwitchSource::Jump | TaskSwitchSource::Iret) {
        with_supervisor_access(bus, |bus| {
            set_tss_busy(bus, &gdtr, old_tr.selector(), false)
        })?;
    }

    let mut outgoing_flags = state.eflags();
    if source == TaskSwitchSource::Iret {
        outgoing_flags &= !FLAG_NT;
    }

    with_supervisor_access(bus, |bus| {
        save_task_state(state, bus, &old_tr, old_bits32, outgoing_flags)
    })?;

    if matches!(source, TaskSwitchSource::Call | TaskSwitchSource::Interrupt) {
        // Nest: the incoming TSS links back to the outgoing task.
        with_supervisor_access(bus, |bus| {
            bus.write_u16(
                incoming.base().wrapping_add(if bits32 { tss32::LINK } else { tss16::LINK }),
                old_tr.selector(),
            )
        })?;
    }
    if !matches!(source, TaskSwitchSource::Iret) {
        with_supervisor_access(bus, |bus| set_tss_busy(bus, &gdtr, selector, true))?;
    }

    // From here on the incoming task is current.
    let mut tr_desc = incoming_desc;
    tr_desc.kind = DescKind::Tss { bits32, busy: true };
    state.tr = Segment::Desc(tr_desc);
    state.cr0 |= crate::state::CR0_TS;

    let loaded = with_supervisor_access(bus, |bus| {
        load_task_state(bus, incoming.base(), bits32)
    })?;

    apply_task_state(state, bus, source, bits32, &loaded, error_code)
}

/// The dynamic fields read out of an incoming TSS.
struct TaskImage {
    eip: u32,
    eflags: u32,
    gprs: [u32; 8],
    es: u16,
    cs: u16,
    ss: u16,
    ds: u16,
    fs: u16,
    gs: u16,
    ldt: u16,
    cr3: Option<u32>,
}

fn save_task_state<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    tr: &Segment,
    bits32: bool,
    eflags: u32,
) -> Result<(), Exception> {
    let base = tr.base();
    if bits32 {
        bus.write_u32(base.wrapping_add(tss32::EIP), state.eip)?;
        bus.write_u32(base.wrapping_add(tss32::EFLAGS), eflags)?;
        for (off, reg) in [
            (tss32::EAX, gpr::EAX),
            (tss32::ECX, gpr::ECX),
            (tss32::EDX, gpr::EDX),
            (tss32::EBX, gpr::EBX),
            (tss32::ESP, gpr::ESP),
            (tss32::EBP, gpr::EBP),
            (tss32::ESI, gpr::ESI),
            (tss32::EDI, gpr::EDI),
        ] {
            bus.write_u32(base.wrapping_add(off), state.gpr32(reg))?;
        }
        bus.write_u16(base.wrapping_add(tss32::ES), state.es.selector())?;
        bus.write_u16(base.wrapping_add(tss32::CS), state.cs.selector())?;
        bus.write_u16(base.wrapping_add(tss32::SS), state.ss.selector())?;
        bus.write_u16(base.wrapping_add(tss32::DS), state.ds.selector())?;
        bus.write_u16(base.wrapping_add(tss32::FS), state.fs.selector())?;
        bus.write_u16(base.wrapping_add(tss32::GS), state.gs.selector())?;
    } else {
        bus.write_u16(base.wrapping_add(tss16::IP), state.eip as u16)?;
        bus.write_u16(base.wrapping_add(tss16::FLAGS), eflags as u16)?;
        for (off, reg) in [
            (tss16::AX, gpr::EAX),
            (tss16::CX, gpr::ECX),
            (tss16::DX, gpr::EDX),
            (tss16::BX, gpr::EBX),
            (tss16::SP, gpr::ESP),
            (tss16::BP, gpr::EBP),
            (tss16::SI, gpr::ESI),
            (tss16::DI, gpr::EDI),
        ] {
            bus.write_u16(base.wrapping_add(off), state.gpr16(reg))?;
        }
        bus.write_u16(base.wrapping_add(tss16::ES), state.es.selector())?;
        bus.write_u16(base.wrapping_add(tss16::CS), state.cs.selector())?;
        bus.write_u16(base.wrapping_add(tss16::SS), state.ss.selector())?;
        bus.write_u16(base.wrapping_add(tss16::DS), state.ds.selector())?;
    }
    Ok(())
}

fn load_task_state<B: CpuBus>(
    bus: &mut B,
    base: u32,
    bits32: bool,
) -> Result<TaskImage, Exception> {
    if bits32 {
        Ok(TaskImage {
            eip: bus.read_u32(base.wrapping_add(tss32::EIP))?,
            eflags: bus.read_u32(base.wrapping_add(tss32::EFLAGS))?,
            gprs: [
                bus.read_u32(base.wrapping_add(tss32::EAX))?,
                bus.read_u32(base.wrapping_add(tss32::ECX))?,
                bus.read_u32(base.wrapping_add(tss32::EDX))?,
                bus.read_u32(base.wrapping_add(tss32::EBX))?,
                bus.read_u32(base.wrapping_add(tss32::ESP))?,
                bus.read_u32(base.wrapping_add(tss32::EBP))?,
                bus.read_u32(base.wrapping_add(tss32::ESI))?,
                bus.read_u32(base.wrapping_add(tss32::EDI))?,
            ],
            es: bus.read_u16(base.wrapping_add(tss32::ES))?,
            cs: bus.read_u16(base.wrapping_add(tss32::CS))?,
            ss: bus.read_u16(base.wrapping_add(tss32::SS))?,
            ds: bus.read_u16(base.wrapping_add(tss32::DS))?,
            fs: bus.read_u16(base.wrapping_add(tss32::FS))?,
            gs: bus.read_u16(base.wrapping_add(tss32::GS))?,
            ldt: bus.read_u16(base.wrapping_add(tss32::LDT))?,
            cr3: Some(bus.read_u32(base.wrapping_add(tss32::CR3))?),
        })
    } else {
        Ok(TaskImage {
            eip: bus.read_u16(base.wrapping_add(tss16::IP))? as u32,
            eflags: bus.read_u16(base.wrapping_add(tss16::FLAGS))? as u32,
            gprs: [
                bus.read_u16(base.wrapping_add(tss16::AX))? as u32,
                bus.read_u16(base.wrapping_add(tss16::CX))? as u32,
                bus.read_u16(base.wrapping_add(tss16::DX))? as u32,
                bus.read_u16(base.wrapping_add(tss16::BX))? as u32,
                bus.read_u16(base.wrapping_add(tss16::SP))? as u32,
                bus.read_u16(base.wrapping_add(tss16::BP))? as u32,
                bus.read_u16(base.wrapping_add(tss16::SI))? as u32,
                bus.read_u16(base.wrapping_add(tss16::DI))? as u32,
            ],
            es: bus.read_u16(base.wrapping_add(tss16::ES))?,
            cs: bus.read_u16(base.wrapping_add(tss16::CS))?,
            ss: bus.read_u16(base.wrapping_add(tss16::SS))?,
            ds: bus.read_u16(base.wrapping_add(tss16::DS))?,
            fs: 0,
            gs: 0,
            ldt: bus.read_u16(base.wrapping_add(tss16::LDT))?,
            cr3: None,
        })
    }
}

fn apply_task_state<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    source: TaskSwitchSource,
    _bits32: bool,
    image: &TaskImage,
    error_code: Option<u32>,
) -> Result<Option<CpuMode>, Exception> {
    // CR3 reloads only when paging is on and the value actually changed;
    // the paging collaborator owns TLB invalidation.
    if let Some(cr3) = image.cr3 {
        if state.paging_enabled() && state.cr3 != cr3 {
            state.cr3 = cr3;
        }
    }

    for (reg, val) in image.gprs.iter().enumerate() {
        state.set_gpr32(reg, *val);
    }
    state.eip = image.eip;

    let mut eflags = image.eflags;
    if matches!(source, TaskSwitchSource::Call | TaskSwitchSource::Interrupt) {
        eflags |= FLAG_NT;
    }
    let mode_change = state.write_eflags(eflags);
    let entering_vm86 = eflags & FLAG_VM != 0;

    // LDTR first: the data-segment loads below may resolve through it.
    let gdtr = state.gdtr;
    if selector_index(image.ldt) == 0 && !selector_uses_ldt(image.ldt) {
        state.ldtr = Segment::Null;
    } else {
        let ldt = with_supervisor_access(bus, |bus| {
            descriptors::load_segment(bus, &gdtr, &Segment::Null, image.ldt)
        })
        .map_err(|_| Exception::ts(image.ldt))?;
        match &ldt {
            Segment::Desc(d) if d.kind == DescKind::Ldt && ldt.present() => state.ldtr = ldt,
            _ => return Err(Exception::ts(image.ldt)),
        }
    }

    if entering_vm86 {
        state.mode = CpuMode::Vm86;
        state.set_cpl(3);
        state.cs = Segment::vm86(image.cs, true);
        state.ss = Segment::vm86(image.ss, false);
        state.ds = Segment::vm86(image.ds, false);
        state.es = Segment::vm86(image.es, false);
        state.fs = Segment::vm86(image.fs, false);
        state.gs = Segment::vm86(image.gs, false);
    } else {
        state.mode = CpuMode::Protected;
        let rpl = selector_rpl(image.cs);

        // Force a full stack validation under the incoming privilege before
        // CPL settles: SS is loaded as if from ring 3 and must match the new
        // CS RPL exactly.
        state.set_cpl(3);
        let gdtr = state.gdtr;
        let ldtr = state.ldtr;
        let ss = with_supervisor_access(bus, |bus| {
            load_stack_segment(bus, &gdtr, &ldtr, image.ss, rpl)
        })
        .map_err(|e| match e.vector {
            crate::exceptions::Vector::StackFault => e,
            _ => Exception::ts(image.ss),
        })?;
        state.ss = ss;
        state.set_cpl(rpl);

        for (reg, sel) in [
            (SegReg::Ds, image.ds),
            (SegReg::Es, image.es),
            (SegReg::Fs, image.fs),
            (SegReg::Gs, image.gs),
        ] {
            let seg = with_supervisor_access(bus, |bus| {
                load_data_segment(bus, &gdtr, &ldtr, sel, rpl)
            })
            .map_err(|e| match e.vector {
                crate::exceptions::Vector::SegmentNotPresent => e,
                _ => Exception::ts(sel),
            })?;
            state.set_segment(reg, seg);
        }

        let cs = with_supervisor_access(bus, |bus| {
            descriptors::load_segment(bus, &gdtr, &ldtr, image.cs)
        })
        .map_err(|_| Exception::ts(image.cs))?;
        if cs.is_null() {
            return Err(Exception::ts(0));
        }
        if !cs.is_code() || cs.is_system() {
            return Err(Exception::ts(image.cs));
        }
        if cs.is_conforming() {
            if cs.dpl() > rpl {
                return Err(Exception::ts(image.cs));
            }
        } else if cs.dpl() != rpl {
            return Err(Exception::ts(image.cs));
        }
        if !cs.present() {
            return Err(Exception::np(image.cs));
        }
        state.cs = cs;
    }

    if let Some(code) = error_code {
        if state.cs.default_size_32() || entering_vm86 {
            push32(state, bus, code)?;
        } else {
            push16(state, bus, code as u16)?;
        }
    }

    state.cs.check_bounds(state.eip, 1).map_err(|_| Exception::gp0())?;

    match mode_change {
        Some(mode) => Ok(Some(mode)),
        None if entering_vm86 => Ok(Some(CpuMode::Vm86)),
        None => Ok(None),
    }
}
