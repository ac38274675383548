//! Fixed little-endian wire types for the plan bootstrap.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Copy raw bytes into a typed buffer of exactly matching length.
pub fn copy_into<T: Pod>(dst: &mut [T], raw: &[u8]) -> Result<(), String> {
    let bytes = cast_slice_mut(dst);
    expect_exact_len(raw.len(), bytes.len())?;
    bytes.copy_from_slice(raw);
    Ok(())
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected {expected} bytes, got {actual}"))
    }
}

/// Number of items one rank will send to another.
///
/// `u64::MAX` is reserved: it tells the peer that the sender failed to build
/// its plan and no count follows.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}

impl WireCount {
    const FAILED: u64 = u64::MAX;

    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }

    /// Marker sent in place of a count by a rank whose plan is invalid.
    pub fn failed() -> Self {
        Self {
            n_le: Self::FAILED.to_le(),
        }
    }

    pub fn is_failed(&self) -> bool {
        u64::from_le(self.n_le) == Self::FAILED
    }

    /// The count, or `None` for the failure marker or a count this target
    /// cannot address.
    pub fn get(&self) -> Option<usize> {
        if self.is_failed() {
            return None;
        }
        usize::try_from(u64::from_le(self.n_le)).ok()
    }
}

const_assert_eq!(size_of::<WireCount>(), 8);
