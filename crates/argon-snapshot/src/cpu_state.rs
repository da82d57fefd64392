//! CPU state <-> snapshot payload mapping.

use argon_cpu_core::descriptors;
use argon_cpu_core::segment::{RealModeSegment, SegAccess, Segment};
use argon_cpu_core::state::{CpuMode, CpuState};

use crate::codec::{Reader, Writer};
use crate::error::{Result, SnapshotError};
use crate::{SNAPSHOT_MAGIC, SNAPSHOT_VERSION_V1};

const TAG_REAL: u8 = 0;
const TAG_VM86: u8 = 1;
const TAG_TABLE: u8 = 2;
const TAG_PROTECTED: u8 = 3;
const TAG_NULL: u8 = 4;

const MODE_REAL: u8 = 0;
const MODE_PROTECTED: u8 = 1;
const MODE_VM86: u8 = 2;

/// The ten slots, in framing order.
fn slot_segments(state: &CpuState) -> [Segment; 10] {
    [
        state.cs, state.ds, state.ss, state.es, state.fs, state.gs, state.idtr, state.gdtr,
        state.ldtr, state.tr,
    ]
}

fn encode_segment(w: &mut Writer, seg: &Segment) -> Result<()> {
    match seg {
        Segment::Null => w.put_u8(TAG_NULL),
        Segment::Real(real) => {
            w.put_u8(TAG_REAL);
            w.put_u16(real.selector);
            w.put_u8((real.access.bits() & 0xFF) as u8);
            w.put_u8(real.selector as u8 & 0x3);
            w.put_u32(real.limit);
            w.put_bool(real.access.contains(SegAccess::DEFAULT32));
            w.put_bool(!real.code);
            w.put_bool(real.access.contains(SegAccess::PRESENT));
        }
        Segment::Vm86 { selector, code } => {
            w.put_u8(TAG_VM86);
            w.put_u16(*selector);
            w.put_bool(*code);
            w.put_u8(*selector as u8 & 0x3);
        }
        Segment::Table { base, limit } => {
            w.put_u8(TAG_TABLE);
            w.put_u32(*base);
            w.put_u32(*limit);
        }
        Segment::Desc(desc) => {
            w.put_u8(TAG_PROTECTED);
            w.put_u16(desc.selector);
            w.put_u64(desc.raw);
            w.put_u8(desc.rpl);
        }
        Segment::Gate(_) => return Err(SnapshotError::Corrupt("gate segment in register slot")),
    }
    Ok(())
}

fn decode_segment(r: &mut Reader<'_>) -> Result<Segment> {
    let tag = r.get_u8()?;
    match tag {
        TAG_NULL => Ok(Segment::Null),
        TAG_REAL => {
            let selector = r.get_u16()?;
            let type_byte = r.get_u8()?;
            let _rpl = r.get_u8()?;
            let limit = r.get_u32()?;
            let default32 = r.get_bool()?;
            let is_data = r.get_bool()?;
            let present = r.get_bool()?;

            let mut access = SegAccess::from_bits_retain(type_byte as u16);
            access.set(SegAccess::DEFAULT32, default32);
            access.set(SegAccess::PRESENT, present);
            Ok(Segment::Real(RealModeSegment {
                selector,
                base: (selector as u32) << 4,
                limit,
                code: !is_data,
                access,
            }))
        }
        TAG_VM86 => {
            let selector = r.get_u16()?;
            let code = r.get_bool()?;
            let _rpl = r.get_u8()?;
            Ok(Segment::vm86(selector, code))
        }
        TAG_TABLE => {
            let base = r.get_u32()?;
            let limit = r.get_u32()?;
            Ok(Segment::Table { base, limit })
        }
        TAG_PROTECTED => {
            let selector = r.get_u16()?;
            let raw = r.get_u64()?;
            let rpl = r.get_u8()?;
            let mut seg = descriptors::decode(selector, raw)
                .map_err(|_| SnapshotError::Corrupt("undecodable descriptor image"))?;
            seg.set_rpl(rpl);
            Ok(seg)
        }
        other => Err(SnapshotError::InvalidSegmentTag(other)),
    }
}

/// Encode the full architectural state. Lazy flags are materialized first;
/// the payload always carries an explicit EFLAGS word.
pub fn encode_cpu(state: &CpuState) -> Result<Vec<u8>> {
    let mut state = state.clone();
    let mut w = Writer::new();

    w.put_u8(SNAPSHOT_MAGIC[0]);
    w.put_u8(SNAPSHOT_MAGIC[1]);
    w.put_u8(SNAPSHOT_MAGIC[2]);
    w.put_u8(SNAPSHOT_MAGIC[3]);
    w.put_u16(SNAPSHOT_VERSION_V1);

    for reg in 0..8 {
        w.put_u32(state.gpr32(reg));
    }
    w.put_u32(state.eip);
    w.put_u32(state.eflags());
    w.put_u32(state.cr0);
    w.put_u32(state.cr2);
    w.put_u32(state.cr3);
    w.put_u32(state.cr4);
    for dr in state.dr {
        w.put_u32(dr);
    }
    w.put_u8(state.cpl());
    w.put_u8(match state.mode {
        CpuMode::Real => MODE_REAL,
        CpuMode::Protected => MODE_PROTECTED,
        CpuMode::Vm86 => MODE_VM86,
    });
    w.put_bool(state.halted);

    for seg in slot_segments(&state) {
        encode_segment(&mut w, &seg)?;
    }
    Ok(w.into_bytes())
}

/// Rebuild a [`CpuState`] from an encoded payload.
pub fn decode_cpu(bytes: &[u8]) -> Result<CpuState> {
    let mut r = Reader::new(bytes);
    let magic = [r.get_u8()?, r.get_u8()?, r.get_u8()?, r.get_u8()?];
    if &magic != SNAPSHOT_MAGIC {
        return Err(SnapshotError::InvalidMagic);
    }
    let version = r.get_u16()?;
    if version != SNAPSHOT_VERSION_V1 {
        return Err(SnapshotError::UnsupportedVersion(version));
    }

    let mut gprs = [0u32; 8];
    for slot in &mut gprs {
        *slot = r.get_u32()?;
    }
    let eip = r.get_u32()?;
    let eflags = r.get_u32()?;
    let cr0 = r.get_u32()?;
    let cr2 = r.get_u32()?;
    let cr3 = r.get_u32()?;
    let cr4 = r.get_u32()?;
    let mut dr = [0u32; 8];
    for slot in &mut dr {
        *slot = r.get_u32()?;
    }
    let cpl = r.get_u8()?;
    let mode = match r.get_u8()? {
        MODE_REAL => CpuMode::Real,
        MODE_PROTECTED => CpuMode::Protected,
        MODE_VM86 => CpuMode::Vm86,
        other => return Err(SnapshotError::InvalidModeTag(other)),
    };
    let halted = r.get_bool()?;

    let mut state = CpuState::new(mode);
    for reg in 0..8 {
        state.set_gpr32(reg, gprs[reg]);
    }
    state.eip = eip;
    state.cr0 = cr0;
    state.cr2 = cr2;
    state.cr3 = cr3;
    state.cr4 = cr4;
    state.dr = dr;
    state.halted = halted;
    state.set_cpl(cpl);
    // Derived state (alignment checking) recomputes from the explicit word.
    let _ = state.write_eflags(eflags);

    let mut segments = [Segment::Null; 10];
    for slot in &mut segments {
        let seg = decode_segment(&mut r)?;
        if matches!(seg, Segment::Gate(_)) {
            return Err(SnapshotError::Corrupt("gate segment in register slot"));
        }
        *slot = seg;
    }
    let [cs, ds, ss, es, fs, gs, idtr, gdtr, ldtr, tr] = segments;
    state.cs = cs;
    state.ds = ds;
    state.ss = ss;
    state.es = es;
    state.fs = fs;
    state.gs = gs;
    state.idtr = idtr;
    state.gdtr = gdtr;
    state.ldtr = ldtr;
    state.tr = tr;

    Ok(state)
}
