#![cfg_attr(docsrs, feature(doc_cfg))]
//! # sieve-distributor
//!
//! Reusable plans for irregular point-to-point data redistribution between
//! the ranks of a distributed job. A [`Distributor`](distributor::Distributor)
//! is built once from a scatter pattern and then moves flat buffers of plain
//! data as many times as needed, forward or through its cached reverse plan.
//!
//! ## Features
//! - Plan construction from destination ranks, from source ranks (routing
//!   opaque ids to their owners), or from both sides when already known
//! - Uniform and per-item variable payload sizes
//! - Split post/wait to overlap local work with communication
//! - Pluggable communication backends: serial ([`NoComm`](algs::communicator::NoComm)),
//!   in-process threads ([`RayonComm`](algs::communicator::RayonComm)) and MPI
//!   (feature `mpi-support`)
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! sieve-distributor = "0.1"
//! # features = ["mpi-support"]
//! ```
//!
//! All build and exchange operations are collective: every rank of the
//! communicator must call them in the same order.

pub mod algs;
pub mod dist_error;
pub mod distributor;

pub use dist_error::DistributorError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{
        CommTag, Communicator, DistributorCommTags, NoComm, RayonComm, Wait,
    };
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::dist_error::DistributorError;
    pub use crate::distributor::{
        BlockLayout, Distributor, DistributorConfig, ExchangeState, HowBuilt, SendType,
    };
}
