//! Segment values held in the register file.
//!
//! A segment is a view over a range of the address space: origin, effective
//! limit, access type, and privilege attributes. Rather than one type per
//! descriptor kind, the model is a small tagged union with capability flags
//! computed once at decode time; the expand-down bit selects the bounds
//! strategy. Segments are value-like and immutable except for the RPL, which
//! the task-switch engine adjusts in place on the slot's exclusive copy.

use bitflags::bitflags;

use crate::exceptions::Exception;
use crate::mem::CpuBus;

bitflags! {
    /// Access-rights bits, normalized from descriptor bits 40..47 and 52..55.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SegAccess: u16 {
        /// Accessed (type bit 0).
        const ACCESSED = 1 << 0;
        /// Writable for data, readable for code (type bit 1).
        const RW = 1 << 1;
        /// Expand-down for data, conforming for code (type bit 2).
        const DC = 1 << 2;
        /// Executable (type bit 3).
        const EXEC = 1 << 3;
        /// S bit: set for code/data, clear for system descriptors.
        const NOT_SYSTEM = 1 << 4;
        const DPL0 = 1 << 5;
        const DPL1 = 1 << 6;
        const PRESENT = 1 << 7;
        const AVL = 1 << 8;
        /// D/B: default operand/stack size 32.
        const DEFAULT32 = 1 << 9;
        /// G: limit scaled by 4 KiB.
        const GRANULAR = 1 << 10;
    }
}

impl SegAccess {
    pub fn dpl(self) -> u8 {
        ((self.bits() >> 5) & 0x3) as u8
    }

    pub fn with_dpl(self, dpl: u8) -> Self {
        let mut bits = self.bits() & !(Self::DPL0.bits() | Self::DPL1.bits());
        bits |= ((dpl as u16) & 0x3) << 5;
        Self::from_bits_retain(bits)
    }
}

/// Descriptor-backed segment kinds that occupy a register-file slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescKind {
    Data,
    Code,
    Ldt,
    Tss { bits32: bool, busy: bool },
}

/// Control-transfer gate kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Call16,
    Call32,
    Interrupt16,
    Interrupt32,
    Trap16,
    Trap32,
    Task,
}

impl GateKind {
    pub fn is_32bit(self) -> bool {
        matches!(self, GateKind::Call32 | GateKind::Interrupt32 | GateKind::Trap32)
    }
}

/// A protected-mode segment decoded from an 8-byte descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSegment {
    pub selector: u16,
    /// The raw descriptor image the segment was decoded from.
    pub raw: u64,
    pub base: u32,
    /// Effective limit, post granularity scaling.
    pub limit: u32,
    pub access: SegAccess,
    pub kind: DescKind,
    pub rpl: u8,
}

/// A gate descriptor: selector + offset (+ parameter count for call gates).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDescriptor {
    pub kind: GateKind,
    pub selector: u16,
    pub offset: u32,
    pub param_count: u8,
    pub dpl: u8,
    pub present: bool,
}

/// A real-mode (or big-real) segment: `base = selector << 4`, 64 KiB limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealModeSegment {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub code: bool,
    pub access: SegAccess,
}

impl RealModeSegment {
    pub fn new(selector: u16, code: bool) -> Self {
        let type_bits = if code {
            SegAccess::EXEC | SegAccess::RW
        } else {
            SegAccess::RW
        };
        Self {
            selector,
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            code,
            access: type_bits | SegAccess::ACCESSED | SegAccess::NOT_SYSTEM | SegAccess::PRESENT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Faults on every operation; the state of an unloaded slot.
    Null,
    Real(RealModeSegment),
    /// Same address arithmetic as real mode, CPL forced to 3.
    Vm86 { selector: u16, code: bool },
    /// Descriptor-table pseudo-segment backing GDTR/IDTR.
    Table { base: u32, limit: u32 },
    Desc(DescriptorSegment),
    Gate(GateDescriptor),
}

impl Segment {
    pub fn real(selector: u16, code: bool) -> Self {
        Segment::Real(RealModeSegment::new(selector, code))
    }

    pub fn vm86(selector: u16, code: bool) -> Self {
        Segment::Vm86 { selector, code }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Segment::Null)
    }

    pub fn selector(&self) -> u16 {
        match self {
            Segment::Null | Segment::Table { .. } => 0,
            Segment::Real(seg) => seg.selector,
            Segment::Vm86 { selector, .. } => *selector,
            Segment::Desc(seg) => seg.selector,
            Segment::Gate(gate) => gate.selector,
        }
    }

    pub fn base(&self) -> u32 {
        match self {
            Segment::Null | Segment::Gate(_) => 0,
            Segment::Real(seg) => seg.base,
            Segment::Vm86 { selector, .. } => (*selector as u32) << 4,
            Segment::Table { base, .. } => *base,
            Segment::Desc(seg) => seg.base,
        }
    }

    pub fn limit(&self) -> u32 {
        match self {
            Segment::Null | Segment::Gate(_) => 0,
            Segment::Real(seg) => seg.limit,
            Segment::Vm86 { .. } => 0xFFFF,
            Segment::Table { limit, .. } => *limit,
            Segment::Desc(seg) => seg.limit,
        }
    }

    pub fn dpl(&self) -> u8 {
        match self {
            Segment::Desc(seg) => seg.access.dpl(),
            Segment::Gate(gate) => gate.dpl,
            Segment::Vm86 { .. } => 3,
            _ => 0,
        }
    }

    pub fn rpl(&self) -> u8 {
        match self {
            Segment::Desc(seg) => seg.rpl,
            _ => (self.selector() & 0x3) as u8,
        }
    }

    /// Adjust the RPL in place. The slot holding this segment is its only
    /// owner, so the mutation cannot be observed elsewhere.
    pub fn set_rpl(&mut self, rpl: u8) {
        let rpl = rpl & 0x3;
        match self {
            Segment::Desc(seg) => {
                seg.rpl = rpl;
                seg.selector = (seg.selector & !0x3) | rpl as u16;
            }
            Segment::Real(seg) => seg.selector = (seg.selector & !0x3) | rpl as u16,
            Segment::Vm86 { selector, .. } => *selector = (*selector & !0x3) | rpl as u16,
            _ => {}
        }
    }

    pub fn present(&self) -> bool {
        match self {
            Segment::Null => false,
            Segment::Real(seg) => seg.access.contains(SegAccess::PRESENT),
            Segment::Vm86 { .. } | Segment::Table { .. } => true,
            Segment::Desc(seg) => seg.access.contains(SegAccess::PRESENT),
            Segment::Gate(gate) => gate.present,
        }
    }

    pub fn is_system(&self) -> bool {
        match self {
            Segment::Desc(seg) => !matches!(seg.kind, DescKind::Data | DescKind::Code),
            Segment::Gate(_) => true,
            _ => false,
        }
    }

    pub fn is_code(&self) -> bool {
        match self {
            Segment::Real(seg) => seg.code,
            Segment::Vm86 { code, .. } => *code,
            Segment::Desc(seg) => seg.kind == DescKind::Code,
            _ => false,
        }
    }

    pub fn is_data(&self) -> bool {
        match self {
            Segment::Real(seg) => !seg.code,
            Segment::Vm86 { code, .. } => !*code,
            Segment::Desc(seg) => seg.kind == DescKind::Data,
            _ => false,
        }
    }

    /// Writable data segment.
    pub fn is_writable(&self) -> bool {
        match self {
            Segment::Real(seg) => !seg.code,
            Segment::Vm86 { code, .. } => !*code,
            Segment::Desc(seg) => {
                seg.kind == DescKind::Data && seg.access.contains(SegAccess::RW)
            }
            Segment::Table { .. } => true,
            _ => false,
        }
    }

    /// Data segments are always readable; code segments only with the R bit.
    pub fn is_readable(&self) -> bool {
        match self {
            Segment::Real(_) | Segment::Vm86 { .. } | Segment::Table { .. } => true,
            Segment::Desc(seg) => match seg.kind {
                DescKind::Data => true,
                DescKind::Code => seg.access.contains(SegAccess::RW),
                _ => false,
            },
            _ => false,
        }
    }

    pub fn is_conforming(&self) -> bool {
        match self {
            Segment::Desc(seg) => {
                seg.kind == DescKind::Code && seg.access.contains(SegAccess::DC)
            }
            _ => false,
        }
    }

    pub fn is_expand_down(&self) -> bool {
        match self {
            Segment::Desc(seg) => {
                seg.kind == DescKind::Data && seg.access.contains(SegAccess::DC)
            }
            _ => false,
        }
    }

    pub fn is_accessed(&self) -> bool {
        match self {
            Segment::Desc(seg) => seg.access.contains(SegAccess::ACCESSED),
            Segment::Real(_) | Segment::Vm86 { .. } => true,
            _ => false,
        }
    }

    pub fn default_size_32(&self) -> bool {
        match self {
            Segment::Desc(seg) => seg.access.contains(SegAccess::DEFAULT32),
            Segment::Table { .. } => true,
            _ => false,
        }
    }

    /// Bounds-check `len` bytes starting at `offset`.
    ///
    /// Normal segments accept `offset + len - 1 <= limit`. Expand-down
    /// segments invert this: valid offsets lie strictly above the limit, up
    /// to 0xFFFF or 0xFFFFFFFF depending on the B bit.
    pub fn check_bounds(&self, offset: u32, len: u32) -> Result<(), Exception> {
        debug_assert!(len >= 1);
        if self.is_null() {
            return Err(Exception::gp0());
        }
        let last = match offset.checked_add(len - 1) {
            Some(last) => last,
            None => return Err(Exception::gp0()),
        };
        if self.is_expand_down() {
            let max = if self.default_size_32() {
                0xFFFF_FFFF
            } else {
                0xFFFF
            };
            if offset <= self.limit() || last > max {
                return Err(Exception::gp0());
            }
        } else if last > self.limit() {
            return Err(Exception::gp0());
        }
        Ok(())
    }

    /// Bounds + readability check, then linear address.
    pub fn translate_read(&self, offset: u32, len: u32) -> Result<u32, Exception> {
        if !self.is_readable() {
            return Err(Exception::gp0());
        }
        self.check_bounds(offset, len)?;
        Ok(self.base().wrapping_add(offset))
    }

    /// Bounds + writability check, then linear address.
    pub fn translate_write(&self, offset: u32, len: u32) -> Result<u32, Exception> {
        if !self.is_writable() {
            return Err(Exception::gp0());
        }
        self.check_bounds(offset, len)?;
        Ok(self.base().wrapping_add(offset))
    }

    pub fn read_u8<B: CpuBus>(&self, bus: &mut B, offset: u32) -> Result<u8, Exception> {
        let addr = self.translate_read(offset, 1)?;
        bus.read_u8(addr)
    }

    pub fn read_u16<B: CpuBus>(&self, bus: &mut B, offset: u32) -> Result<u16, Exception> {
        let addr = self.translate_read(offset, 2)?;
        bus.read_u16(addr)
    }

    pub fn read_u32<B: CpuBus>(&self, bus: &mut B, offset: u32) -> Result<u32, Exception> {
        let addr = self.translate_read(offset, 4)?;
        bus.read_u32(addr)
    }

    pub fn read_u64<B: CpuBus>(&self, bus: &mut B, offset: u32) -> Result<u64, Exception> {
        let addr = self.translate_read(offset, 8)?;
        bus.read_u64(addr)
    }

    pub fn write_u8<B: CpuBus>(&self, bus: &mut B, offset: u32, val: u8) -> Result<(), Exception> {
        let addr = self.translate_write(offset, 1)?;
        bus.write_u8(addr, val)
    }

    pub fn write_u16<B: CpuBus>(
        &self,
        bus: &mut B,
        offset: u32,
        val: u16,
    ) -> Result<(), Exception> {
        let addr = self.translate_write(offset, 2)?;
        bus.write_u16(addr, val)
    }

    pub fn write_u32<B: CpuBus>(
        &self,
        bus: &mut B,
        offset: u32,
        val: u32,
    ) -> Result<(), Exception> {
        let addr = self.translate_write(offset, 4)?;
        bus.write_u32(addr, val)
    }

    pub fn write_u64<B: CpuBus>(
        &self,
        bus: &mut B,
        offset: u32,
        val: u64,
    ) -> Result<(), Exception> {
        let addr = self.translate_write(offset, 8)?;
        bus.write_u64(addr, val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_segment(limit: u32, access: SegAccess) -> Segment {
        Segment::Desc(DescriptorSegment {
            selector: 0x08,
            raw: 0,
            base: 0x1000,
            limit,
            access: access | SegAccess::NOT_SYSTEM | SegAccess::PRESENT | SegAccess::RW,
            kind: DescKind::Data,
            rpl: 0,
        })
    }

    #[test]
    fn null_segment_faults_on_everything() {
        let seg = Segment::Null;
        assert!(seg.check_bounds(0, 1).is_err());
        assert!(seg.translate_read(0, 1).is_err());
        assert!(seg.translate_write(0, 1).is_err());
    }

    #[test]
    fn normal_limit_check() {
        let seg = data_segment(0xFFF, SegAccess::empty());
        assert!(seg.check_bounds(0, 1).is_ok());
        assert!(seg.check_bounds(0xFFF, 1).is_ok());
        assert!(seg.check_bounds(0xFFC, 4).is_ok());
        assert!(seg.check_bounds(0x1000, 1).is_err());
        assert!(seg.check_bounds(0xFFD, 4).is_err());
        assert_eq!(seg.translate_read(0x10, 1).unwrap(), 0x1010);
    }

    #[test]
    fn expand_down_inverts_the_check() {
        // 16-bit expand-down stack: valid range is (limit, 0xFFFF].
        let seg = data_segment(0x0FFF, SegAccess::DC);
        assert!(seg.check_bounds(0x0FFF, 1).is_err());
        assert!(seg.check_bounds(0x0000, 1).is_err());
        assert!(seg.check_bounds(0x1000, 1).is_ok());
        assert!(seg.check_bounds(0xFFFF, 1).is_ok());
        assert!(seg.check_bounds(0xFFFF, 2).is_err());

        // With B set the ceiling is 4 GiB.
        let big = data_segment(0x0FFF, SegAccess::DC | SegAccess::DEFAULT32);
        assert!(big.check_bounds(0x0001_0000, 4).is_ok());
        assert!(big.check_bounds(0xFFFF_FFFF, 1).is_ok());
    }

    #[test]
    fn real_mode_base_arithmetic() {
        let seg = Segment::real(0x2000, false);
        assert_eq!(seg.base(), 0x20000);
        assert_eq!(seg.limit(), 0xFFFF);
        assert!(seg.is_writable());
        assert_eq!(seg.translate_write(0x10, 2).unwrap(), 0x20010);
        assert!(seg.check_bounds(0x1_0000, 1).is_err());
    }

    #[test]
    fn rpl_adjustment_rewrites_selector() {
        let mut seg = data_segment(0xFFFF, SegAccess::empty());
        seg.set_rpl(3);
        assert_eq!(seg.rpl(), 3);
        assert_eq!(seg.selector() & 0x3, 3);
    }

    #[test]
    fn execute_only_code_is_not_readable() {
        let seg = Segment::Desc(DescriptorSegment {
            selector: 0x08,
            raw: 0,
            base: 0,
            limit: 0xFFFF,
            access: SegAccess::EXEC | SegAccess::NOT_SYSTEM | SegAccess::PRESENT,
            kind: DescKind::Code,
            rpl: 0,
        });
        assert!(seg.translate_read(0, 1).is_err());
        assert!(seg.translate_write(0, 1).is_err());
    }
}
