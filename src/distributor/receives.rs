//! Plan bootstrap: learn how many items every rank will send to me.
//!
//! Every rank tells every other rank how many items it is about to send
//! there (zero included), so each rank learns both *who* sends to it and
//! *how much*. A rank whose input was rejected still takes part and sends the
//! failure marker instead, so no peer is left waiting for its count.
//! Receives are posted before any count goes out and every handle is drained
//! before returning, even if an error occurs.

use std::collections::BTreeMap;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, cast_slice, cast_slice_mut, copy_into};
use crate::dist_error::DistributorError;

use super::plan::Side;

/// Returns `rank → item count` for every rank that sends to me (self included).
///
/// `send` is `None` when this rank's own plan failed; the marker goes to
/// every peer and the result is an error no matter what the peers say.
pub(crate) fn compute_receives<C>(
    send: Option<&Side>,
    comm: &C,
    tag: CommTag,
) -> Result<BTreeMap<usize, usize>, DistributorError>
where
    C: Communicator,
{
    let me = comm.rank();
    let size = comm.size();
    let peers = (1..size).map(|k| (me + k) % size);

    let mut outgoing = vec![0usize; size];
    if let Some(send) = send {
        for (&rank, &len) in send.ranks.iter().zip(&send.lengths) {
            outgoing[rank] = len;
        }
    }

    // 1) post all receives
    let mut recv_size = Vec::with_capacity(size.saturating_sub(1));
    for peer in peers.clone() {
        let mut cnt = WireCount::new(0);
        let h = comm.irecv(peer, tag.as_u16(), cast_slice_mut(std::slice::from_mut(&mut cnt)));
        recv_size.push((peer, h));
    }

    // 2) post all sends and keep buffers alive until completion
    let mut pending_sends = Vec::with_capacity(size.saturating_sub(1));
    let mut send_bufs = Vec::with_capacity(size.saturating_sub(1));
    for peer in peers {
        let count = match send {
            Some(_) => WireCount::new(outgoing[peer]),
            None => WireCount::failed(),
        };
        pending_sends.push(comm.isend(peer, tag.as_u16(), cast_slice(std::slice::from_ref(&count))));
        send_bufs.push(count);
    }

    // 3) wait for all recvs, collect counts (but do not early-return)
    let mut counts = BTreeMap::new();
    if outgoing.get(me).copied().unwrap_or(0) > 0 {
        counts.insert(me, outgoing[me]);
    }
    let mut maybe_err = None;
    for (peer, h) in recv_size {
        match h.wait() {
            Some(data) => {
                let mut cnt = WireCount::new(0);
                let decoded = copy_into(std::slice::from_mut(&mut cnt), &data).map(|()| cnt);
                match decoded {
                    Ok(cnt) => match cnt.get() {
                        Some(0) => {}
                        Some(n) => {
                            counts.insert(peer, n);
                        }
                        None if maybe_err.is_none() => {
                            maybe_err = Some(if cnt.is_failed() {
                                DistributorError::RemoteBuildFailure { rank: peer }
                            } else {
                                DistributorError::CommError {
                                    neighbor: peer,
                                    source: "send count does not fit in usize".into(),
                                }
                            });
                        }
                        None => {}
                    },
                    Err(_) if maybe_err.is_none() => {
                        maybe_err = Some(DistributorError::BufferSizeMismatch {
                            neighbor: peer,
                            expected: std::mem::size_of::<WireCount>(),
                            got: data.len(),
                        });
                    }
                    Err(_) => {}
                }
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(DistributorError::CommError {
                    neighbor: peer,
                    source: format!("failed to receive send count from rank {peer}").into(),
                });
            }
            _ => {} // already have an error; just drain
        }
    }

    // 4) always drain all send handles before returning
    for h in pending_sends {
        let _ = h.wait();
    }
    drop(send_bufs);

    match maybe_err {
        Some(err) => Err(err),
        None if send.is_none() => Err(DistributorError::RemoteBuildFailure { rank: me }),
        None => Ok(counts),
    }
}
