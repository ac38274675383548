//! Gather/scatter of message blocks between caller buffers and wire bytes.
//!
//! All positions here are in *elements*; callers multiply by the element
//! size once, at the byte-slicing boundary.

use std::ops::Range;

use super::plan::{BlockLayout, Side};

/// Elements carried by each item of a buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Stride {
    Uniform(usize),
    /// Exclusive prefix sums of per-item counts (`items + 1` entries).
    PerItem(Vec<usize>),
}

impl Stride {
    pub fn per_item(counts: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(counts.len() + 1);
        let mut acc = 0;
        offsets.push(0);
        for &c in counts {
            acc = usize::saturating_add(acc, c);
            offsets.push(acc);
        }
        Self::PerItem(offsets)
    }

    /// How many items have a known size (`None` = any).
    pub fn items(&self) -> Option<usize> {
        match self {
            Self::Uniform(_) => None,
            Self::PerItem(o) => Some(o.len() - 1),
        }
    }

    /// Elements spanned by items `first..first + n`.
    pub fn span(&self, first: usize, n: usize) -> Range<usize> {
        match self {
            Self::Uniform(k) => first * k..(first + n) * k,
            Self::PerItem(o) => o[first]..o[first + n],
        }
    }

    /// Elements a buffer of `items` items occupies, saturating at
    /// `usize::MAX`. Spans inside a buffer whose extent did not saturate
    /// cannot overflow.
    pub fn extent(&self, items: usize) -> usize {
        match self {
            Self::Uniform(k) => items.saturating_mul(*k),
            Self::PerItem(o) => o[items],
        }
    }

    /// [`Stride::extent`] if `items` items of `elem` bytes each are addressable.
    pub fn byte_checked_extent(&self, items: usize, elem: usize) -> Option<usize> {
        let n = self.extent(items);
        (n != usize::MAX && n.checked_mul(elem).is_some()).then_some(n)
    }
}

/// Elements carried by block `j` of `side`.
pub(crate) fn block_elems(side: &Side, j: usize, stride: &Stride) -> usize {
    let (start, len) = (side.starts[j], side.lengths[j]);
    match &side.layout {
        BlockLayout::Contiguous => stride.span(start, len).len(),
        BlockLayout::Indexed(idx) => idx[start..start + len]
            .iter()
            .map(|&i| stride.span(i, 1).len())
            .sum(),
    }
}

/// Bytes of block `j`: borrowed in place when contiguous, gathered into
/// `scratch` otherwise.
pub(crate) fn gather_block<'a>(
    side: &Side,
    j: usize,
    stride: &Stride,
    elem: usize,
    src: &'a [u8],
    scratch: &'a mut Vec<u8>,
) -> &'a [u8] {
    let (start, len) = (side.starts[j], side.lengths[j]);
    match &side.layout {
        BlockLayout::Contiguous => {
            let r = stride.span(start, len);
            &src[r.start * elem..r.end * elem]
        }
        BlockLayout::Indexed(idx) => {
            scratch.clear();
            for &i in &idx[start..start + len] {
                let r = stride.span(i, 1);
                scratch.extend_from_slice(&src[r.start * elem..r.end * elem]);
            }
            scratch.as_slice()
        }
    }
}

/// Write the bytes of block `j` into their place in `dst`.
pub(crate) fn scatter_block(side: &Side, j: usize, stride: &Stride, elem: usize, data: &[u8], dst: &mut [u8]) {
    let (start, len) = (side.starts[j], side.lengths[j]);
    match &side.layout {
        BlockLayout::Contiguous => {
            let r = stride.span(start, len);
            dst[r.start * elem..r.end * elem].copy_from_slice(data);
        }
        BlockLayout::Indexed(idx) => {
            let mut cursor = 0;
            for &i in &idx[start..start + len] {
                let r = stride.span(i, 1);
                let n = r.len() * elem;
                dst[r.start * elem..r.end * elem].copy_from_slice(&data[cursor..cursor + n]);
                cursor += n;
            }
        }
    }
}
