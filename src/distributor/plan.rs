//! Schedule construction: turning per-item ranks into per-rank message blocks.

use std::collections::BTreeMap;
use std::sync::Arc;

use itertools::Itertools;

use crate::dist_error::DistributorError;

/// How a side's blocks sit in the caller's flat buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BlockLayout {
    /// Block `j` is items `starts[j]..starts[j] + lengths[j]`.
    #[default]
    Contiguous,
    /// Block `j` is the items listed in `indices[starts[j]..starts[j] + lengths[j]]`.
    Indexed(Arc<[usize]>),
}

/// One direction (send or receive) of a plan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Side {
    pub ranks: Vec<usize>,
    pub starts: Vec<usize>,
    pub lengths: Vec<usize>,
    pub layout: BlockLayout,
    /// Items the caller's buffer must hold on this side.
    pub extent: usize,
}

impl Side {
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn total(&self) -> usize {
        self.lengths.iter().sum()
    }

    pub fn position(&self, rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == rank)
    }

    /// Longest block to anyone but `me`.
    pub fn max_length_excluding(&self, me: usize) -> usize {
        self.ranks
            .iter()
            .zip(&self.lengths)
            .filter(|&(&r, _)| r != me)
            .map(|(_, &l)| l)
            .max()
            .unwrap_or(0)
    }

    pub fn indices(&self) -> Option<&[usize]> {
        match &self.layout {
            BlockLayout::Contiguous => None,
            BlockLayout::Indexed(idx) => Some(idx),
        }
    }

    /// Receive side laid out back to back in ascending rank order.
    pub fn from_counts(counts: &BTreeMap<usize, usize>) -> Self {
        let mut side = Side::default();
        let mut offset = 0;
        for (&rank, &len) in counts.iter().filter(|&(_, &len)| len > 0) {
            side.ranks.push(rank);
            side.starts.push(offset);
            side.lengths.push(len);
            offset += len;
        }
        side.extent = offset;
        side
    }
}

/// Validate one rank entry; negative entries are skipped (`Ok(None)`).
pub(crate) fn checked_rank(rank: i32, index: usize, size: usize) -> Result<Option<usize>, DistributorError> {
    if rank < 0 {
        return Ok(None);
    }
    let r = rank as usize;
    if r >= size {
        return Err(DistributorError::InvalidProcessId {
            rank: rank as i64,
            index,
            size,
        });
    }
    Ok(Some(r))
}

/// Build the send side from the destination rank of every local item.
///
/// Blocks are ordered by first occurrence of each destination. When every
/// destination's items already form one gap-free run, the caller's buffer is
/// used in place (`Contiguous`); otherwise an index list gathers them.
pub(crate) fn plan_sends(export_ranks: &[i32], size: usize) -> Result<Side, DistributorError> {
    const NONE: usize = usize::MAX;
    let mut slot_of = vec![NONE; size];
    let mut side = Side {
        extent: export_ranks.len(),
        ..Side::default()
    };
    let mut first_seen = Vec::new();
    let mut last_seen = Vec::new();
    let mut slots = Vec::with_capacity(export_ranks.len());

    for (i, &rank) in export_ranks.iter().enumerate() {
        let Some(r) = checked_rank(rank, i, size)? else {
            slots.push(NONE);
            continue;
        };
        if slot_of[r] == NONE {
            slot_of[r] = side.ranks.len();
            side.ranks.push(r);
            side.lengths.push(0);
            first_seen.push(i);
            last_seen.push(i);
        }
        let s = slot_of[r];
        side.lengths[s] += 1;
        last_seen[s] = i;
        slots.push(s);
    }

    let grouped = (0..side.len()).all(|s| last_seen[s] - first_seen[s] + 1 == side.lengths[s]);
    if grouped {
        side.starts = first_seen;
        side.layout = BlockLayout::Contiguous;
        return Ok(side);
    }

    side.starts = exclusive_prefix_sum(&side.lengths);
    let mut cursor = side.starts.clone();
    let mut indices = vec![0usize; side.total()];
    for (i, &s) in slots.iter().enumerate().filter(|&(_, &s)| s != NONE) {
        indices[cursor[s]] = i;
        cursor[s] += 1;
    }
    side.layout = BlockLayout::Indexed(indices.into());
    Ok(side)
}

/// Count how many items come from each source rank.
pub(crate) fn count_sources(
    remote_ranks: &[i32],
    size: usize,
) -> Result<BTreeMap<usize, usize>, DistributorError> {
    let mut counts = BTreeMap::new();
    for (i, &rank) in remote_ranks.iter().enumerate() {
        if let Some(r) = checked_rank(rank, i, size)? {
            *counts.entry(r).or_insert(0) += 1;
        }
    }
    Ok(counts)
}

/// Both sides must agree on whether (and how much) this rank sends to itself.
pub(crate) fn check_self_message(send: &Side, recv: &Side, me: usize) -> Result<bool, DistributorError> {
    let sent = send.position(me).map_or(0, |j| send.lengths[j]);
    let received = recv.position(me).map_or(0, |k| recv.lengths[k]);
    if sent != received {
        return Err(DistributorError::CountMismatch {
            rank: me,
            expected: sent,
            got: received,
        });
    }
    Ok(sent > 0)
}

pub(crate) fn exclusive_prefix_sum(lengths: &[usize]) -> Vec<usize> {
    lengths
        .iter()
        .scan(0usize, |acc, &l| {
            let start = *acc;
            *acc += l;
            Some(start)
        })
        .collect_vec()
}
