//! Distributor: a reusable plan for irregular point-to-point data exchange.
//!
//! A plan is built once from a static scatter pattern (which rank each of my
//! items goes to, or which rank each item I want comes from) and then moves
//! flat buffers many times, forward or through its cached reverse plan.
//!
//! ```no_run
//! use sieve_distributor::prelude::*;
//!
//! let results = RayonComm::run(4, |comm| {
//!     let me = comm.rank();
//!     let next = ((me + 1) % comm.size()) as i32;
//!     let mut plan = Distributor::new(comm);
//!     plan.create_from_sends(&[next])?;
//!     let mut got = vec![0u64; plan.total_receive_length()];
//!     plan.exchange(&[me as u64], 1, &mut got)?;
//!     Ok::<_, DistributorError>(got)
//! })
//! .unwrap();
//! assert_eq!(results[1].as_ref().unwrap(), &vec![0]);
//! ```
//!
//! Every rank of the communicator must call the build and exchange
//! operations in the same order; a rank that does not participate leaves
//! its peers blocked in `wait`.

pub mod config;
mod exchange;
mod pack;
pub mod plan;
mod receives;

use std::fmt;

use bytemuck::Pod;
use once_cell::unsync::OnceCell;

use crate::algs::communicator::{CommTag, Communicator, DistributorCommTags};
use crate::dist_error::DistributorError;

pub use config::{DistributorConfig, SendType};
pub use plan::BlockLayout;

use exchange::InFlight;
use plan::Side;

/// How a plan got its schedule (informational).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum HowBuilt {
    #[default]
    NotBuilt,
    FromSends,
    FromRecvs,
    FromSendsAndRecvs,
    Reversed,
    Copied,
}

impl fmt::Display for HowBuilt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotBuilt => "not built",
            Self::FromSends => "built from sends",
            Self::FromRecvs => "built from receives",
            Self::FromSendsAndRecvs => "built from sends and receives",
            Self::Reversed => "reverse of another plan",
            Self::Copied => "copy of another plan",
        };
        f.write_str(s)
    }
}

/// Whether a posting phase is waiting to be completed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ExchangeState {
    #[default]
    Idle,
    PostedForward,
    PostedReverse,
}

/// Communication plan over the ranks of `comm`.
///
/// A plan is not meant to be driven from several threads at once; hold one
/// plan per thread if the communicator allows concurrent use.
pub struct Distributor<'c, C: Communicator> {
    comm: &'c C,
    config: DistributorConfig,
    tags: DistributorCommTags,
    how_built: HowBuilt,
    send: Side,
    recv: Side,
    self_message: bool,
    max_send_length: usize,
    reverse: OnceCell<Box<Distributor<'c, C>>>,
    in_flight: Option<InFlight<C>>,
}

impl<'c, C: Communicator> Distributor<'c, C> {
    pub const DEFAULT_TAG: CommTag = CommTag::new(0xD150);

    pub fn new(comm: &'c C) -> Self {
        Self::with_config(comm, DistributorConfig::default())
    }

    pub fn with_config(comm: &'c C, config: DistributorConfig) -> Self {
        let tags = Self::tags_for(&config, Self::DEFAULT_TAG);
        Self {
            comm,
            config,
            tags,
            how_built: HowBuilt::NotBuilt,
            send: Side::default(),
            recv: Side::default(),
            self_message: false,
            max_send_length: 0,
            reverse: OnceCell::new(),
            in_flight: None,
        }
    }

    /// Move this plan's messages to the tag family starting at `base`.
    ///
    /// Plans exchanging concurrently over one communicator need distinct
    /// bases at least six apart (three tags forward, three for the reverse).
    pub fn with_tags(mut self, base: CommTag) -> Self {
        self.tags = Self::tags_for(&self.config, base);
        self
    }

    fn tags_for(config: &DistributorConfig, base: CommTag) -> DistributorCommTags {
        if config.use_distinct_tags {
            DistributorCommTags::from_base(base)
        } else {
            DistributorCommTags::shared(base)
        }
    }

    fn ensure_unbuilt(&self) -> Result<(), DistributorError> {
        match self.how_built {
            HowBuilt::NotBuilt => Ok(()),
            how_built => Err(DistributorError::AlreadyBuilt { how_built }),
        }
    }

    fn ensure_built(&self) -> Result<(), DistributorError> {
        match self.how_built {
            HowBuilt::NotBuilt => Err(DistributorError::NotBuilt),
            _ => Ok(()),
        }
    }

    fn install(&mut self, send: Side, recv: Side, how_built: HowBuilt) -> Result<(), DistributorError> {
        let me = self.comm.rank();
        self.self_message = plan::check_self_message(&send, &recv, me)?;
        self.max_send_length = send.max_length_excluding(me);
        self.send = send;
        self.recv = recv;
        self.how_built = how_built;
        log::debug!(
            "[rank {me}] distributor {how_built}: {} sends, {} receives, self message: {}, {} path",
            self.num_sends(),
            self.num_receives(),
            self.self_message,
            if self.send.indices().is_some() { "gather" } else { "contiguous" },
        );
        Ok(())
    }

    /// Run the bootstrap for `send` and install the result.
    ///
    /// A rejected `send` still goes through the bootstrap so that the peers
    /// learn about the failure instead of waiting for this rank's counts.
    fn build_from_sends(
        &mut self,
        send: Result<Side, DistributorError>,
        how_built: HowBuilt,
    ) -> Result<(), DistributorError> {
        let counts = receives::compute_receives(send.as_ref().ok(), self.comm, self.tags.bootstrap);
        let send = send?;
        self.install(send, Side::from_counts(&counts?), how_built)
    }

    /// Build the plan from the destination rank of every local item.
    ///
    /// Negative entries mark items that are not sent. Returns the number of
    /// *other* ranks that will send to this one. Collective: every rank of
    /// the communicator must call it. If any rank passes an out-of-range
    /// rank, every rank returns an error.
    pub fn create_from_sends(&mut self, export_ranks: &[i32]) -> Result<usize, DistributorError> {
        self.ensure_unbuilt()?;
        let send = plan::plan_sends(export_ranks, self.comm.size());
        self.build_from_sends(send, HowBuilt::FromSends)?;
        Ok(self.num_receives())
    }

    /// Build the plan from the owner rank of every item this rank wants.
    ///
    /// `ids` travel to the owners untouched. Returns, for this rank as an
    /// owner, the rank each requested id must go to and the id itself; the
    /// plan is then built to move those items. Data arrives grouped by owner
    /// in ascending rank order, keeping request order within each owner.
    pub fn create_from_recvs<G: Pod>(
        &mut self,
        source_ranks: &[i32],
        ids: &[G],
    ) -> Result<(Vec<usize>, Vec<G>), DistributorError> {
        self.ensure_unbuilt()?;
        let routing = if source_ranks.len() != ids.len() {
            Err(DistributorError::SizeMismatch {
                what: "item ids",
                expected: source_ranks.len(),
                got: ids.len(),
            })
        } else {
            plan::plan_sends(source_ranks, self.comm.size())
        };

        // ship every requested id to its owner
        let mut requests = Distributor::with_config(self.comm, self.config.clone());
        requests.tags = self.tags;
        requests.build_from_sends(routing, HowBuilt::FromSends)?;
        let mut wanted = vec![<G as bytemuck::Zeroable>::zeroed(); requests.total_receive_length()];
        requests.exchange(ids, 1, &mut wanted)?;

        let mut export_ranks = Vec::with_capacity(wanted.len());
        for (&rank, &len) in requests.recv.ranks.iter().zip(&requests.recv.lengths) {
            export_ranks.extend(std::iter::repeat_n(rank, len));
        }
        let targets = export_ranks
            .iter()
            .enumerate()
            .map(|(index, &r)| {
                i32::try_from(r).map_err(|_| DistributorError::InvalidProcessId {
                    rank: r as i64,
                    index,
                    size: self.comm.size(),
                })
            })
            .collect::<Result<Vec<_>, _>>();
        let send = targets.and_then(|t| plan::plan_sends(&t, self.comm.size()));
        self.build_from_sends(send, HowBuilt::FromRecvs)?;
        Ok((export_ranks, wanted))
    }

    /// Build the plan when both directions are already known; no messages
    /// are exchanged. `remote_ranks` lists the source rank of every item
    /// this rank will receive.
    pub fn create_from_sends_and_recvs(
        &mut self,
        export_ranks: &[i32],
        remote_ranks: &[i32],
    ) -> Result<(), DistributorError> {
        self.ensure_unbuilt()?;
        let size = self.comm.size();
        let send = plan::plan_sends(export_ranks, size)?;
        let counts = plan::count_sources(remote_ranks, size)?;
        self.install(send, Side::from_counts(&counts), HowBuilt::FromSendsAndRecvs)
    }

    /// The plan moving data the other way, built on first use and cached.
    ///
    /// A reverse plan does not build a reverse of its own; use the forward
    /// plan for that direction.
    pub fn reverse(&self) -> Result<&Distributor<'c, C>, DistributorError> {
        self.ensure_built()?;
        if self.how_built == HowBuilt::Reversed {
            return Err(DistributorError::ReverseOfReverse);
        }
        Ok(&**self.reverse.get_or_init(|| Box::new(self.build_reverse())))
    }

    pub fn reverse_mut(&mut self) -> Result<&mut Distributor<'c, C>, DistributorError> {
        self.reverse()?;
        self.reverse
            .get_mut()
            .map(|plan| &mut **plan)
            .ok_or(DistributorError::NotBuilt)
    }

    /// Cached reverse plan, if one was built.
    pub fn cached_reverse(&self) -> Option<&Distributor<'c, C>> {
        self.reverse.get().map(|plan| &**plan)
    }

    fn build_reverse(&self) -> Self {
        let me = self.comm.rank();
        log::debug!("[rank {me}] building reverse distributor");
        Self {
            comm: self.comm,
            config: self.config.clone(),
            tags: self.tags.reversed(),
            how_built: HowBuilt::Reversed,
            send: self.recv.clone(),
            recv: self.send.clone(),
            self_message: self.self_message,
            max_send_length: self.recv.max_length_excluding(me),
            reverse: OnceCell::new(),
            in_flight: None,
        }
    }

    pub fn comm(&self) -> &'c C {
        self.comm
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    pub fn tags(&self) -> DistributorCommTags {
        self.tags
    }

    pub fn how_built(&self) -> HowBuilt {
        self.how_built
    }

    pub fn state(&self) -> ExchangeState {
        match (&self.in_flight, self.how_built) {
            (None, _) => ExchangeState::Idle,
            (Some(_), HowBuilt::Reversed) => ExchangeState::PostedReverse,
            (Some(_), _) => ExchangeState::PostedForward,
        }
    }

    pub fn has_self_message(&self) -> bool {
        self.self_message
    }

    /// Ranks other than this one that receive a message.
    pub fn num_sends(&self) -> usize {
        self.send.len() - usize::from(self.self_message)
    }

    /// Ranks other than this one that send a message.
    pub fn num_receives(&self) -> usize {
        self.recv.len() - usize::from(self.self_message)
    }

    /// Destinations in construction order, self included.
    pub fn send_targets(&self) -> &[usize] {
        &self.send.ranks
    }

    pub fn send_lengths(&self) -> &[usize] {
        &self.send.lengths
    }

    pub fn send_starts(&self) -> &[usize] {
        &self.send.starts
    }

    /// Gather list of the slow path; `None` when sends read the caller's
    /// buffer in place.
    pub fn send_indices(&self) -> Option<&[usize]> {
        self.send.indices()
    }

    pub fn send_layout(&self) -> &BlockLayout {
        &self.send.layout
    }

    pub fn recv_sources(&self) -> &[usize] {
        &self.recv.ranks
    }

    pub fn recv_lengths(&self) -> &[usize] {
        &self.recv.lengths
    }

    pub fn recv_starts(&self) -> &[usize] {
        &self.recv.starts
    }

    pub fn recv_layout(&self) -> &BlockLayout {
        &self.recv.layout
    }

    /// Longest message to another rank, in items.
    pub fn max_send_length(&self) -> usize {
        self.max_send_length
    }

    /// Items this rank receives, self message included.
    pub fn total_receive_length(&self) -> usize {
        self.recv.total()
    }

    /// Items this rank sends, self message included.
    pub fn total_send_length(&self) -> usize {
        self.send.total()
    }

    /// Items the import buffer must span (per unit of payload).
    pub fn import_extent(&self) -> usize {
        self.recv.extent
    }

    /// Items the export buffer must span (per unit of payload).
    pub fn export_extent(&self) -> usize {
        self.send.extent
    }
}

impl<C: Communicator> Clone for Distributor<'_, C> {
    /// Copies the schedule only: no cached reverse, nothing in flight.
    fn clone(&self) -> Self {
        Self {
            comm: self.comm,
            config: self.config.clone(),
            tags: self.tags,
            how_built: match self.how_built {
                HowBuilt::NotBuilt => HowBuilt::NotBuilt,
                _ => HowBuilt::Copied,
            },
            send: self.send.clone(),
            recv: self.recv.clone(),
            self_message: self.self_message,
            max_send_length: self.max_send_length,
            reverse: OnceCell::new(),
            in_flight: None,
        }
    }
}

impl<C: Communicator> fmt::Debug for Distributor<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Distributor")
            .field("rank", &self.comm.rank())
            .field("how_built", &self.how_built)
            .field("config", &self.config)
            .field("send", &self.send)
            .field("recv", &self.recv)
            .field("self_message", &self.self_message)
            .field("max_send_length", &self.max_send_length)
            .field("state", &self.state())
            .finish()
    }
}

impl<C: Communicator> fmt::Display for Distributor<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let me = self.comm.rank();
        writeln!(
            f,
            "Distributor on rank {me} of {} ({}, send type {})",
            self.comm.size(),
            self.how_built,
            self.config.send_type
        )?;
        for ((rank, start), len) in self.send.ranks.iter().zip(&self.send.starts).zip(&self.send.lengths) {
            writeln!(f, "  send {len:>8} items to   rank {rank} (start {start})")?;
        }
        for ((rank, start), len) in self.recv.ranks.iter().zip(&self.recv.starts).zip(&self.recv.lengths) {
            writeln!(f, "  recv {len:>8} items from rank {rank} (start {start})")?;
        }
        write!(
            f,
            "  total receive length {}, max send length {}",
            self.total_receive_length(),
            self.max_send_length
        )
    }
}

impl<C: Communicator> Drop for Distributor<'_, C> {
    fn drop(&mut self) {
        if self.in_flight.is_some() {
            log::warn!(
                "[rank {}] distributor dropped with an exchange still outstanding",
                self.comm.rank()
            );
        }
    }
}
