//! Thin façade over intra-process (Rayon) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable** but non-blocking: the distributor calls
//! `.wait()` before it trusts that a receive buffer is ready.
//!
//! Between one `(source, destination, tag)` triple messages are
//! non-overtaking: the k-th posted receive matches the k-th send.

use std::sync::{Arc, Barrier};

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::dist_error::DistributorError;

/// Typed message tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Raw base value (alias of [`CommTag::as_u16`]).
    pub const fn base(self) -> u16 {
        self.0
    }

    /// Tag `k` steps above this one (wrapping).
    pub const fn offset(self, k: u16) -> Self {
        Self(self.0.wrapping_add(k))
    }
}

/// Tag families used by one distributor.
///
/// Each code path gets its own tag so that the plan bootstrap, uniform and
/// variable-size exchanges never match each other's messages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DistributorCommTags {
    pub bootstrap: CommTag,
    pub uniform: CommTag,
    pub variable: CommTag,
}

impl DistributorCommTags {
    /// Offset between a plan's tags and its reverse plan's tags.
    pub const REVERSE_OFFSET: u16 = 3;

    /// Distinct consecutive tags starting at `base`.
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            bootstrap: base,
            uniform: base.offset(1),
            variable: base.offset(2),
        }
    }

    /// Every path on the same tag.
    pub const fn shared(base: CommTag) -> Self {
        Self {
            bootstrap: base,
            uniform: base,
            variable: base,
        }
    }

    /// Tags for the plan that moves data the other way.
    pub const fn reversed(self) -> Self {
        Self {
            bootstrap: self.bootstrap.offset(Self::REVERSE_OFFSET),
            uniform: self.uniform.offset(Self::REVERSE_OFFSET),
            variable: self.variable.offset(Self::REVERSE_OFFSET),
        }
    }
}

impl Default for DistributorCommTags {
    fn default() -> Self {
        Self::from_base(CommTag::new(0xD150))
    }
}

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive sized by `buf.len()`; the payload comes back from `wait`
    /// with the length the sender actually sent.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Standard blocking send.
    fn send(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), DistributorError> {
        let _ = self.isend(peer, tag, buf).wait();
        Ok(())
    }

    /// Synchronous send: returns once the peer has matched the message.
    fn ssend(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), DistributorError> {
        self.send(peer, tag, buf)
    }

    /// Ready send: only valid if the peer already posted the matching receive.
    fn rsend(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), DistributorError> {
        self.send(peer, tag, buf)
    }

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Block until every rank has reached the barrier.
    fn barrier(&self) {}

    fn is_no_comm(&self) -> bool {
        false
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Compile-time no-op comm for pure serial unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn is_no_comm(&self) -> bool {
        true
    }
}

// --- RayonComm: intra-process / multi-thread ---
type Key = (usize, usize, u16); // (src, dst, tag)

/// Shared state of one in-process world.
#[derive(Debug)]
struct Fabric {
    size: usize,
    mailbox: DashMap<(Key, u64), Bytes>,
    sent: DashMap<Key, u64>,
    posted: DashMap<Key, u64>,
    barrier: Barrier,
}

impl Fabric {
    fn new(size: usize) -> Self {
        Self {
            size,
            mailbox: DashMap::new(),
            sent: DashMap::new(),
            posted: DashMap::new(),
            barrier: Barrier::new(size.max(1)),
        }
    }

    fn next_seq(counter: &DashMap<Key, u64>, key: Key) -> u64 {
        let mut slot = counter.entry(key).or_insert(0);
        let seq = *slot;
        *slot += 1;
        seq
    }

    fn count(counter: &DashMap<Key, u64>, key: Key) -> u64 {
        counter.get(&key).map_or(0, |v| *v)
    }

    fn deliver(&self, key: Key, buf: &[u8]) -> u64 {
        let seq = Self::next_seq(&self.sent, key);
        self.mailbox.insert((key, seq), Bytes::copy_from_slice(buf));
        seq
    }
}

static WORLDS: Lazy<DashMap<usize, Arc<Fabric>>> = Lazy::new(DashMap::new);

/// Receive handle of [`RayonComm`]; `wait` spins until the matching message lands.
///
/// The message comes back whole, even when it is longer than the posted
/// buffer; comparing lengths is the caller's job.
pub struct LocalHandle {
    fabric: Arc<Fabric>,
    slot: (Key, u64),
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        loop {
            if let Some((_, bytes)) = self.fabric.mailbox.remove(&self.slot) {
                return Some(bytes.to_vec());
            }
            std::thread::yield_now();
        }
    }
}

/// `size` ranks living on threads of one process.
#[derive(Clone, Debug)]
pub struct RayonComm {
    rank: usize,
    fabric: Arc<Fabric>,
}

impl RayonComm {
    /// Attach to the process-global world of `size` ranks.
    ///
    /// All callers asking for the same `size` share one mailbox, so tests
    /// using this constructor should keep their tags apart or run serially.
    pub fn new(rank: usize, size: usize) -> Self {
        let fabric = WORLDS
            .entry(size)
            .or_insert_with(|| Arc::new(Fabric::new(size)))
            .clone();
        Self { rank, fabric }
    }

    /// A fresh, isolated world: one communicator per rank.
    pub fn world(size: usize) -> Vec<Self> {
        let fabric = Arc::new(Fabric::new(size));
        (0..size)
            .map(|rank| Self {
                rank,
                fabric: fabric.clone(),
            })
            .collect()
    }

    /// Run `f` once per rank of a fresh world, each rank on its own thread,
    /// and collect the results in rank order.
    pub fn run<R, F>(size: usize, f: F) -> Result<Vec<R>, DistributorError>
    where
        R: Send,
        F: Fn(&RayonComm) -> R + Sync,
    {
        if size == 0 {
            return Ok(Vec::new());
        }
        let comms = Self::world(size);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("rank-{i}"))
            .build()
            .map_err(|e| DistributorError::CommError {
                neighbor: 0,
                source: Box::new(e),
            })?;
        Ok(pool.broadcast(|ctx| f(&comms[ctx.index()])))
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        self.fabric.deliver((self.rank, peer, tag), buf);
    }

    fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> Self::RecvHandle {
        let key = (peer, self.rank, tag);
        let seq = Fabric::next_seq(&self.fabric.posted, key);
        LocalHandle {
            fabric: self.fabric.clone(),
            slot: (key, seq),
        }
    }

    fn ssend(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), DistributorError> {
        let key = (self.rank, peer, tag);
        let seq = self.fabric.deliver(key, buf);
        // matched once the peer has posted receive number `seq`
        while Fabric::count(&self.fabric.posted, key) <= seq {
            std::thread::yield_now();
        }
        Ok(())
    }

    fn rsend(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), DistributorError> {
        let key = (self.rank, peer, tag);
        // receive number `sent` must already be posted
        if Fabric::count(&self.fabric.posted, key) <= Fabric::count(&self.fabric.sent, key) {
            return Err(DistributorError::ReadySendUnmatched { peer, tag });
        }
        self.fabric.deliver(key, buf);
        Ok(())
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.fabric.size
    }

    fn barrier(&self) {
        self.fabric.barrier.wait();
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::environment::Universe;
    use mpi::datatype::Equivalence;
    use mpi::point_to_point::{Destination, Source};
    use mpi::request::{Request, StaticScope};
    use mpi::topology::{Communicator as _, SimpleCommunicator};
    use mpi::traits::CommunicatorCollectives;

    pub struct MpiComm {
        pub world: SimpleCommunicator,
        pub rank: usize,
        size: usize,
        _universe: Universe,
    }

    // SAFETY: MPI handles are process-wide; a distributor drives its
    // communicator from one thread at a time.
    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl MpiComm {
        pub fn new() -> Result<Self, DistributorError> {
            let universe = mpi::initialize().ok_or_else(|| DistributorError::CommError {
                neighbor: 0,
                source: "MPI was already initialized".into(),
            })?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                world,
                rank,
                size,
                _universe: universe,
            })
        }
    }

    /// Owns the leaked buffer of an in-flight request until it completes.
    pub struct MpiHandle {
        req: Option<Request<'static, [u8], StaticScope>>,
        buf: *mut [u8],
        is_recv: bool,
    }

    unsafe impl Send for MpiHandle {}

    impl Wait for MpiHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            let status = self.req.take().map(|req| req.wait());
            // SAFETY: `buf` came from `Box::leak` and the request using it has completed.
            let mut owned = unsafe { Box::from_raw(self.buf) }.into_vec();
            if !self.is_recv {
                return None;
            }
            // a longer message is an MPI truncation error; a shorter one shows in the count
            if let Some(status) = status {
                let got = status.count(u8::equivalent_datatype());
                owned.truncate(usize::try_from(got).unwrap_or(0));
            }
            Some(owned)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiHandle;
        type RecvHandle = MpiHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiHandle {
            let data: &'static mut [u8] = Box::leak(buf.to_vec().into_boxed_slice());
            let ptr: *mut [u8] = data;
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, &*data, tag as i32);
            MpiHandle {
                req: Some(req),
                buf: ptr,
                is_recv: false,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiHandle {
            let data: &'static mut [u8] = Box::leak(vec![0u8; buf.len()].into_boxed_slice());
            let ptr: *mut [u8] = data;
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, data, tag as i32);
            MpiHandle {
                req: Some(req),
                buf: ptr,
                is_recv: true,
            }
        }

        fn send(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), DistributorError> {
            self.world
                .process_at_rank(peer as i32)
                .send_with_tag(buf, tag as i32);
            Ok(())
        }

        fn ssend(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), DistributorError> {
            self.world
                .process_at_rank(peer as i32)
                .synchronous_send_with_tag(buf, tag as i32);
            Ok(())
        }

        fn rsend(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<(), DistributorError> {
            self.world
                .process_at_rank(peer as i32)
                .ready_send_with_tag(buf, tag as i32);
            Ok(())
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn barrier(&self) {
            self.world.barrier();
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::{MpiComm, MpiHandle};
