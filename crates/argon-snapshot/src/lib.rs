#![forbid(unsafe_code)]

//! Persisted-state framing for the CPU protection core.
//!
//! The payload is an ordered little-endian dump of the register/flag fields
//! followed by a tagged union per segment slot, in the fixed order CS, DS,
//! SS, ES, FS, GS, IDTR, GDTR, LDTR, TR. The outer container (sections,
//! compression, integrity) is owned by the caller's serialization layer.

mod codec;
mod cpu_state;
mod error;

pub use cpu_state::{decode_cpu, encode_cpu};
pub use error::{Result, SnapshotError};

pub const SNAPSHOT_MAGIC: &[u8; 4] = b"ARGC";
pub const SNAPSHOT_VERSION_V1: u16 = 1;
