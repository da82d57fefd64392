//! Operating-mode transitions.
//!
//! Setting CR0.PE or flipping EFLAGS.VM does not rewrite the machine in
//! place; the dispatcher reports a [`CpuExit::ModeSwitch`] and the host
//! rebuilds the CPU by converting each segment slot. The converters are pure
//! per-segment functions; the only state they consult is the segment value
//! itself.
//!
//! [`CpuExit::ModeSwitch`]: crate::interrupts::CpuExit

use crate::segment::{RealModeSegment, SegAccess, Segment};
use crate::state::{CpuMode, CpuState, SegReg};

/// Re-derive a real-mode segment from whatever currently occupies a slot.
///
/// The cached base/limit survive the transition (big-real addressing); only
/// the selector arithmetic changes on the next reload.
pub fn to_real_mode(seg: &Segment, code: bool) -> Segment {
    match seg {
        Segment::Null => Segment::real(0, code),
        Segment::Real(_) => *seg,
        Segment::Vm86 { selector, code } => Segment::real(*selector, *code),
        Segment::Table { .. } => *seg,
        Segment::Desc(desc) => Segment::Real(RealModeSegment {
            selector: desc.selector,
            base: desc.base,
            limit: desc.limit,
            code,
            access: desc.access,
        }),
        Segment::Gate(_) => Segment::real(0, code),
    }
}

/// Re-tag a real-mode segment for protected mode. The descriptor cache keeps
/// its real-mode base/limit until software reloads the register.
pub fn to_protected_mode(seg: &Segment) -> Segment {
    match seg {
        Segment::Real(real) => Segment::Desc(crate::segment::DescriptorSegment {
            selector: real.selector,
            raw: 0,
            base: real.base,
            limit: real.limit,
            access: real.access | SegAccess::NOT_SYSTEM | SegAccess::PRESENT,
            kind: if real.code {
                crate::segment::DescKind::Code
            } else {
                crate::segment::DescKind::Data
            },
            rpl: (real.selector & 0x3) as u8,
        }),
        other => *other,
    }
}

/// Apply a mode switch to the whole register file.
pub fn apply_mode_switch(state: &mut CpuState, to: CpuMode) {
    match to {
        CpuMode::Real => {
            for reg in SegReg::ALL {
                let code = reg == SegReg::Cs;
                let converted = to_real_mode(state.segment(reg), code);
                state.set_segment(reg, converted);
            }
            state.set_cpl(0);
        }
        CpuMode::Protected => {
            for reg in SegReg::ALL {
                let converted = to_protected_mode(state.segment(reg));
                state.set_segment(reg, converted);
            }
        }
        CpuMode::Vm86 => {
            for reg in SegReg::ALL {
                let selector = state.segment(reg).selector();
                let code = reg == SegReg::Cs;
                state.set_segment(reg, Segment::vm86(selector, code));
            }
            state.set_cpl(3);
        }
    }
    state.mode = to;
}
