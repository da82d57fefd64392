//! Descriptor decoding and selector resolution.
//!
//! [`decode`] is the single mapping from a raw 8-byte descriptor (plus the
//! selector that named it) to a [`Segment`] value; everything else in the
//! crate goes through it. Reserved system encodings are rejected with a
//! restartable #GP(0). The selector-resolution helpers walk the GDT/LDT with
//! table-limit checks and stamp accessed/busy bits back through the bus.

use crate::exceptions::Exception;
use crate::mem::CpuBus;
use crate::segment::{
    DescKind, DescriptorSegment, GateDescriptor, GateKind, SegAccess, Segment,
};

/// Selector convenience accessors (index / table-indicator / RPL).
pub fn selector_index(selector: u16) -> u16 {
    selector >> 3
}

pub fn selector_uses_ldt(selector: u16) -> bool {
    selector & 0x4 != 0
}

pub fn selector_rpl(selector: u16) -> u8 {
    (selector & 0x3) as u8
}

fn descriptor_base(raw: u64) -> u32 {
    let low = ((raw >> 16) & 0xFF_FFFF) as u32;
    let high = ((raw >> 56) & 0xFF) as u32;
    low | (high << 24)
}

fn descriptor_limit(raw: u64) -> u32 {
    let raw_limit = ((raw & 0xFFFF) as u32) | (((raw >> 48) & 0xF) as u32) << 16;
    if raw & (1 << 55) != 0 {
        (raw_limit << 12) | 0xFFF
    } else {
        raw_limit
    }
}

fn access_bits(raw: u64) -> SegAccess {
    let access_byte = ((raw >> 40) & 0xFF) as u16;
    let flags_nibble = ((raw >> 52) & 0xF) as u16;
    // Type/S/DPL/P map straight through; AVL/DB/G are renumbered into the
    // normalized set (the L bit is meaningless on a 32-bit part).
    let mut bits = access_byte & 0xFF;
    if flags_nibble & 0x1 != 0 {
        bits |= SegAccess::AVL.bits();
    }
    if flags_nibble & 0x4 != 0 {
        bits |= SegAccess::DEFAULT32.bits();
    }
    if flags_nibble & 0x8 != 0 {
        bits |= SegAccess::GRANULAR.bits();
    }
    SegAccess::from_bits_retain(bits)
}

/// Decode a raw descriptor into the segment variant it names.
///
/// Pure: no table walks, no side effects. Decoding the same pair twice
/// yields segments with identical observable state.
pub fn decode(selector: u16, raw: u64) -> Result<Segment, Exception> {
    let access = access_bits(raw);
    let type_bits = ((raw >> 40) & 0xF) as u8;
    let rpl = selector_rpl(selector);

    if access.contains(SegAccess::NOT_SYSTEM) {
        let kind = if type_bits & 0x8 != 0 {
            DescKind::Code
        } else {
            DescKind::Data
        };
        return Ok(Segment::Desc(DescriptorSegment {
            selector,
            raw,
            base: descriptor_base(raw),
            limit: descriptor_limit(raw),
            access,
            kind,
            rpl,
        }));
    }

    let gate_kind = match type_bits {
        // Reserved system encodings fault and point back at the instruction.
        0x0 | 0x8 | 0xA | 0xD => return Err(Exception::gp0().pointing_to_self()),
        0x1 | 0x3 | 0x9 | 0xB => {
            return Ok(Segment::Desc(DescriptorSegment {
                selector,
                raw,
                base: descriptor_base(raw),
                limit: descriptor_limit(raw),
                access,
                kind: DescKind::Tss {
                    bits32: type_bits & 0x8 != 0,
                    busy: type_bits & 0x2 != 0,
                },
                rpl,
            }))
        }
        0x2 => {
            return Ok(Segment::Desc(DescriptorSegment {
                selector,
                raw,
                base: descriptor_base(raw),
                limit: descriptor_limit(raw),
                access,
                kind: DescKind::Ldt,
                rpl,
            }))
        }
        0x4 => GateKind::Call16,
        0x5 => GateKind::Task,
        0x6 => GateKind::Interrupt16,
        0x7 => GateKind::Trap16,
        0xC => GateKind::Call32,
        0xE => GateKind::Interrupt32,
        _ => GateKind::Trap32,
    };

    let offset_low = (raw & 0xFFFF) as u32;
    let offset = if gate_kind.is_32bit() {
        offset_low | ((((raw >> 48) & 0xFFFF) as u32) << 16)
    } else {
        offset_low
    };

    Ok(Segment::Gate(GateDescriptor {
        kind: gate_kind,
        selector: ((raw >> 16) & 0xFFFF) as u16,
        offset,
        param_count: ((raw >> 32) & 0x1F) as u8,
        dpl: access.dpl(),
        present: access.contains(SegAccess::PRESENT),
    }))
}

/// Read the raw 8-byte descriptor named by `selector` out of `table`
/// (a GDTR/IDTR pseudo-segment or an LDT segment). #GP(selector) when the
/// entry does not fit inside the table limit.
pub fn read_raw_descriptor<B: CpuBus>(
    bus: &mut B,
    table: &Segment,
    selector: u16,
) -> Result<u64, Exception> {
    let offset = (selector_index(selector) as u32) * 8;
    table
        .check_bounds(offset, 8)
        .map_err(|_| Exception::gp(selector))?;
    bus.read_u64(table.base().wrapping_add(offset))
}

/// Resolve `selector` through GDT or LDT (by the TI bit) to its raw
/// descriptor. The LDT slot must hold a present LDT segment for TI=1.
pub fn fetch_raw_descriptor<B: CpuBus>(
    bus: &mut B,
    gdtr: &Segment,
    ldtr: &Segment,
    selector: u16,
) -> Result<u64, Exception> {
    if selector_uses_ldt(selector) {
        match ldtr {
            Segment::Desc(seg) if seg.kind == DescKind::Ldt && ldtr.present() => {
                read_raw_descriptor(bus, ldtr, selector)
            }
            _ => Err(Exception::gp(selector)),
        }
    } else {
        read_raw_descriptor(bus, gdtr, selector)
    }
}

/// Fetch and decode the segment named by `selector`. A null GDT selector
/// (index 0, TI=0) decodes to [`Segment::Null`].
pub fn load_segment<B: CpuBus>(
    bus: &mut B,
    gdtr: &Segment,
    ldtr: &Segment,
    selector: u16,
) -> Result<Segment, Exception> {
    if selector_index(selector) == 0 && !selector_uses_ldt(selector) {
        return Ok(Segment::Null);
    }
    let raw = fetch_raw_descriptor(bus, gdtr, ldtr, selector)?;
    decode(selector, raw)
}

/// Set the accessed bit of a code/data descriptor in its table.
pub fn mark_accessed<B: CpuBus>(
    bus: &mut B,
    gdtr: &Segment,
    ldtr: &Segment,
    selector: u16,
    raw: u64,
) -> Result<(), Exception> {
    if raw & (1 << 40) != 0 {
        return Ok(());
    }
    let table = if selector_uses_ldt(selector) { ldtr } else { gdtr };
    let offset = (selector_index(selector) as u32) * 8;
    let addr = table.base().wrapping_add(offset).wrapping_add(5);
    let access = bus.read_u8(addr)?;
    bus.write_u8(addr, access | 0x01)
}

/// Flip the busy bit of a TSS descriptor in the GDT.
pub fn set_tss_busy<B: CpuBus>(
    bus: &mut B,
    gdtr: &Segment,
    selector: u16,
    busy: bool,
) -> Result<(), Exception> {
    let offset = (selector_index(selector) as u32) * 8;
    gdtr.check_bounds(offset, 8)
        .map_err(|_| Exception::gp(selector))?;
    let addr = gdtr.base().wrapping_add(offset).wrapping_add(5);
    let access = bus.read_u8(addr)?;
    let updated = if busy { access | 0x02 } else { access & !0x02 };
    bus.write_u8(addr, updated)
}

/// MOV/POP-to-data-segment-register semantics for DS/ES/FS/GS.
///
/// Null selectors are accepted and clear the register; the segment must
/// otherwise be data or readable code, with DPL >= max(CPL, RPL) except for
/// conforming code.
pub fn load_data_segment<B: CpuBus>(
    bus: &mut B,
    gdtr: &Segment,
    ldtr: &Segment,
    selector: u16,
    cpl: u8,
) -> Result<Segment, Exception> {
    let seg = load_segment(bus, gdtr, ldtr, selector)?;
    if seg.is_null() {
        return Ok(Segment::Null);
    }
    if seg.is_system() || (!seg.is_data() && !seg.is_readable()) {
        return Err(Exception::gp(selector));
    }
    if !seg.is_conforming() {
        let eff = cpl.max(selector_rpl(selector));
        if seg.dpl() < eff {
            return Err(Exception::gp(selector));
        }
    }
    if !seg.present() {
        return Err(Exception::np(selector));
    }
    if let Segment::Desc(d) = &seg {
        mark_accessed(bus, gdtr, ldtr, selector, d.raw)?;
    }
    Ok(seg)
}

/// SS load semantics: writable data, DPL = RPL = `cpl`, never null.
pub fn load_stack_segment<B: CpuBus>(
    bus: &mut B,
    gdtr: &Segment,
    ldtr: &Segment,
    selector: u16,
    cpl: u8,
) -> Result<Segment, Exception> {
    if selector_index(selector) == 0 && !selector_uses_ldt(selector) {
        return Err(Exception::gp0());
    }
    let seg = load_segment(bus, gdtr, ldtr, selector)?;
    if seg.is_system() || !seg.is_data() || !seg.is_writable() {
        return Err(Exception::gp(selector));
    }
    if selector_rpl(selector) != cpl || seg.dpl() != cpl {
        return Err(Exception::gp(selector));
    }
    if !seg.present() {
        return Err(Exception::stack(selector));
    }
    if let Segment::Desc(d) = &seg {
        mark_accessed(bus, gdtr, ldtr, selector, d.raw)?;
    }
    Ok(seg)
}
