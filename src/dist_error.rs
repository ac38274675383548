//! DistributorError: unified error type for sieve-distributor public APIs
//!
//! Exchange-time failures are detected on the calling rank before anything
//! that would leave peers waiting is posted. Build-time input errors are
//! shared with the peers through the plan bootstrap, so every rank returns
//! (the failing rank with the cause, the others with
//! [`DistributorError::RemoteBuildFailure`]). [`DistributorError::CommError`]
//! reports a broken substrate after the fact.

use thiserror::Error;

use crate::distributor::ExchangeState;

/// Unified error type for plan construction and data exchange.
#[derive(Debug, Error)]
pub enum DistributorError {
    /// A destination or source rank is outside `[0, size)`.
    #[error("invalid process id {rank} at item {index} (communicator size is {size})")]
    InvalidProcessId {
        rank: i64,
        index: usize,
        size: usize,
    },
    /// The plan already carries a schedule; build a fresh instance instead.
    #[error("plan is already built ({how_built}); create a new Distributor to rebuild")]
    AlreadyBuilt { how_built: crate::distributor::HowBuilt },
    /// Another rank rejected its input during a collective build, so this
    /// rank's plan was not built either.
    #[error("rank {rank} failed to build its part of the plan")]
    RemoteBuildFailure { rank: usize },
    /// An exchange or reverse was requested before the plan was built.
    #[error("plan has not been built yet")]
    NotBuilt,
    /// A reverse plan was asked for its own reverse.
    #[error("a reverse plan does not build a reverse; use the forward plan instead")]
    ReverseOfReverse,
    /// Parallel input arrays have different lengths.
    #[error("size mismatch: {what} has length {got}, expected {expected}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// The caller's import buffer cannot hold everything the plan receives.
    #[error("import buffer too small: need {needed} elements, got {got}")]
    BufferTooSmall { needed: usize, got: usize },
    /// A posting phase is already in flight on this plan.
    #[error("an exchange is already outstanding on this plan ({state:?}); call wait first")]
    OutstandingExchange { state: ExchangeState },
    /// Per-item packet counts disagree with the plan's block structure.
    #[error("packet count mismatch for rank {rank}: expected {expected}, got {got}")]
    CountMismatch {
        rank: usize,
        expected: usize,
        got: usize,
    },
    /// `Rsend` was selected without the receive/send barrier.
    #[error("send type Rsend requires \"Barrier between receives and sends\" to be true")]
    ReadySendWithoutBarrier,
    /// A ready send found no posted receive on the peer.
    #[error("ready send to rank {peer} (tag {tag}) found no matching posted receive")]
    ReadySendUnmatched { peer: usize, tag: u16 },
    /// `wait` was called with a buffer whose element type differs from the posted one.
    #[error("element size mismatch: posted with {posted} bytes per element, waited with {waited}")]
    ElementSizeMismatch { posted: usize, waited: usize },
    /// A configuration option could not be applied.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A received message does not have the length its posted receive expected.
    #[error("buffer size mismatch from rank {neighbor}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },
    /// Communication with a neighbour failed.
    #[error("communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
