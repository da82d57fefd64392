//! Stack pushes and pops through the SS segment.
//!
//! The stack pointer width follows the B bit of the loaded SS (SP wraps at
//! 64 KiB, ESP at 4 GiB). Bounds violations surface as #SS(0); the stack
//! pointer only moves after the memory access succeeds, so a faulting push
//! leaves the stack intact for redelivery.

use crate::exceptions::Exception;
use crate::mem::CpuBus;
use crate::state::{gpr, CpuState};

pub fn stack_ptr(state: &CpuState) -> u32 {
    if state.ss.default_size_32() {
        state.gpr32(gpr::ESP)
    } else {
        state.gpr16(gpr::ESP) as u32
    }
}

pub fn set_stack_ptr(state: &mut CpuState, val: u32) {
    if state.ss.default_size_32() {
        state.set_gpr32(gpr::ESP, val);
    } else {
        state.set_gpr16(gpr::ESP, val as u16);
    }
}

fn sub_sp(state: &CpuState, bytes: u32) -> u32 {
    if state.ss.default_size_32() {
        stack_ptr(state).wrapping_sub(bytes)
    } else {
        (stack_ptr(state) as u16).wrapping_sub(bytes as u16) as u32
    }
}

fn add_sp(state: &CpuState, bytes: u32) -> u32 {
    if state.ss.default_size_32() {
        stack_ptr(state).wrapping_add(bytes)
    } else {
        (stack_ptr(state) as u16).wrapping_add(bytes as u16) as u32
    }
}

pub fn push16<B: CpuBus>(state: &mut CpuState, bus: &mut B, val: u16) -> Result<(), Exception> {
    let sp = sub_sp(state, 2);
    let addr = state
        .ss
        .translate_write(sp, 2)
        .map_err(|_| Exception::stack(0))?;
    bus.write_u16(addr, val)?;
    set_stack_ptr(state, sp);
    Ok(())
}

pub fn push32<B: CpuBus>(state: &mut CpuState, bus: &mut B, val: u32) -> Result<(), Exception> {
    let sp = sub_sp(state, 4);
    let addr = state
        .ss
        .translate_write(sp, 4)
        .map_err(|_| Exception::stack(0))?;
    bus.write_u32(addr, val)?;
    set_stack_ptr(state, sp);
    Ok(())
}

pub fn pop16<B: CpuBus>(state: &mut CpuState, bus: &mut B) -> Result<u16, Exception> {
    let sp = stack_ptr(state);
    let addr = state
        .ss
        .translate_read(sp, 2)
        .map_err(|_| Exception::stack(0))?;
    let val = bus.read_u16(addr)?;
    set_stack_ptr(state, add_sp(state, 2));
    Ok(val)
}

pub fn pop32<B: CpuBus>(state: &mut CpuState, bus: &mut B) -> Result<u32, Exception> {
    let sp = stack_ptr(state);
    let addr = state
        .ss
        .translate_read(sp, 4)
        .map_err(|_| Exception::stack(0))?;
    let val = bus.read_u32(addr)?;
    set_stack_ptr(state, add_sp(state, 4));
    Ok(val)
}

/// Verify the stack can absorb `bytes` more pushed bytes before any of them
/// land. #SS(0) when it cannot.
pub fn check_push_space(state: &CpuState, bytes: u32) -> Result<(), Exception> {
    let sp = sub_sp(state, bytes);
    state
        .ss
        .check_bounds(sp, bytes)
        .map_err(|_| Exception::stack(0))
}
