//! Executing a plan: post receives, (barrier), post sends, copy the self
//! message, then wait.
//!
//! Receives are always posted before any send. Sends start at the first
//! destination ranked above this rank and wrap around, so ranks do not all
//! hit rank 0 first. Every posted receive is drained in `wait`, even when an
//! earlier one failed.

use std::mem::size_of;

use bytemuck::Pod;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{cast_slice, cast_slice_mut};
use crate::dist_error::DistributorError;

use super::config::SendType;
use super::pack::{Stride, block_elems, gather_block, scatter_block};
use super::{Distributor, ExchangeState};

struct PendingRecv<H> {
    block: usize,
    source: usize,
    expected: usize,
    handle: H,
}

/// Operations posted by one `post_*` call and not yet waited on.
pub(crate) struct InFlight<C: Communicator> {
    elem: usize,
    stride: Stride,
    variable: bool,
    recvs: Vec<PendingRecv<C::RecvHandle>>,
    sends: Vec<C::SendHandle>,
    local: Option<(usize, Vec<u8>)>,
}

/// Elements `items` items occupy under `stride`, refusing extents whose byte
/// size would not fit in `usize`.
fn payload_extent(stride: &Stride, items: usize, elem: usize, what: &'static str) -> Result<usize, DistributorError> {
    stride
        .byte_checked_extent(items, elem)
        .ok_or(DistributorError::SizeMismatch {
            what,
            expected: usize::MAX / elem.max(1),
            got: stride.extent(items),
        })
}

/// Block visiting order: first destination ranked above `me`, then wrap.
pub(crate) fn send_order(ranks: &[usize], me: usize) -> impl Iterator<Item = usize> {
    let n = ranks.len();
    let first = ranks.iter().position(|&r| r > me).unwrap_or(0);
    (0..n).map(move |k| (first + k) % n)
}

impl<'c, C: Communicator> Distributor<'c, C> {
    fn ensure_idle(&self) -> Result<(), DistributorError> {
        match self.state() {
            ExchangeState::Idle => Ok(()),
            state => Err(DistributorError::OutstandingExchange { state }),
        }
    }

    /// Elements an import buffer needs under `stride`.
    fn import_needed(&self, stride: &Stride, elem: usize) -> Result<usize, DistributorError> {
        if let Some(n) = stride.items() {
            if n < self.recv.extent {
                return Err(DistributorError::SizeMismatch {
                    what: "import packet counts",
                    expected: self.recv.extent,
                    got: n,
                });
            }
        }
        payload_extent(stride, self.recv.extent, elem, "import payload elements")
    }

    fn post<T: Pod>(
        &mut self,
        export: &[T],
        send_stride: Stride,
        recv_stride: Stride,
        tag: CommTag,
        variable: bool,
    ) -> Result<(), DistributorError> {
        self.ensure_built()?;
        self.ensure_idle()?;
        self.config.validate()?;

        let me = self.comm.rank();
        let elem = size_of::<T>();
        if let Some(n) = send_stride.items() {
            if n < self.send.extent {
                return Err(DistributorError::SizeMismatch {
                    what: "export packet counts",
                    expected: self.send.extent,
                    got: n,
                });
            }
        }
        let export_needed = payload_extent(&send_stride, self.send.extent, elem, "export payload elements")?;
        if export.len() < export_needed {
            return Err(DistributorError::SizeMismatch {
                what: "export buffer",
                expected: export_needed,
                got: export.len(),
            });
        }
        self.import_needed(&recv_stride, elem)?;

        let self_blocks = match (self.send.position(me), self.recv.position(me)) {
            (Some(j), Some(k)) => {
                let sent = block_elems(&self.send, j, &send_stride);
                let expected = block_elems(&self.recv, k, &recv_stride);
                if sent != expected {
                    return Err(DistributorError::CountMismatch {
                        rank: me,
                        expected,
                        got: sent,
                    });
                }
                Some((j, k))
            }
            _ => None,
        };

        // 1) post all receives
        let mut recvs = Vec::with_capacity(self.recv.len());
        for k in (0..self.recv.len()).filter(|&k| self.recv.ranks[k] != me) {
            let source = self.recv.ranks[k];
            let expected = block_elems(&self.recv, k, &recv_stride) * elem;
            let mut buf = vec![0u8; expected];
            let handle = self.comm.irecv(source, tag.as_u16(), &mut buf);
            if self.config.debug {
                log::trace!("[rank {me}] posted receive of {expected} bytes from rank {source} (tag {})", tag.as_u16());
            }
            recvs.push(PendingRecv {
                block: k,
                source,
                expected,
                handle,
            });
        }

        // 2) nobody sends before everybody has posted
        if self.config.barrier_between_recvs_and_sends {
            self.comm.barrier();
        }

        // 3) post sends, gathering into one reused scratch buffer on the slow path
        let bytes = cast_slice(export);
        let mut scratch = match &send_stride {
            Stride::Uniform(k) if self.send.indices().is_some() => {
                Vec::with_capacity(self.max_send_length * k * elem)
            }
            _ => Vec::new(),
        };
        let mut sends = if self.config.send_type.is_immediate() {
            Vec::with_capacity(self.send.len())
        } else {
            Vec::new()
        };
        let mut send_err = None;
        for j in send_order(&self.send.ranks, me) {
            let dest = self.send.ranks[j];
            if dest == me {
                continue;
            }
            let payload = gather_block(&self.send, j, &send_stride, elem, bytes, &mut scratch);
            if self.config.debug {
                log::trace!(
                    "[rank {me}] {} of {} bytes to rank {dest} (tag {})",
                    self.config.send_type,
                    payload.len(),
                    tag.as_u16()
                );
            }
            let sent = match self.config.send_type {
                SendType::Isend => {
                    sends.push(self.comm.isend(dest, tag.as_u16(), payload));
                    Ok(())
                }
                SendType::Send => self.comm.send(dest, tag.as_u16(), payload),
                SendType::Rsend => self.comm.rsend(dest, tag.as_u16(), payload),
                SendType::Ssend => self.comm.ssend(dest, tag.as_u16(), payload),
            };
            // keep the first failure but still offer every peer its message
            if let Err(err) = sent {
                log::warn!("[rank {me}] {} to rank {dest} failed: {err}", self.config.send_type);
                send_err.get_or_insert(err);
            }
        }

        // a failed send ends the exchange here, after every handle completes
        if let Some(err) = send_err {
            for pending in recvs {
                let _ = pending.handle.wait();
            }
            for send in sends {
                let _ = send.wait();
            }
            return Err(err);
        }

        // 4) self message: a copy, never a message
        let local = self_blocks.map(|(j, k)| {
            let data = gather_block(&self.send, j, &send_stride, elem, bytes, &mut scratch).to_vec();
            (k, data)
        });

        self.in_flight = Some(InFlight {
            elem,
            stride: recv_stride,
            variable,
            recvs,
            sends,
            local,
        });
        Ok(())
    }

    /// Post the forward exchange of `items_per_unit` elements per item.
    ///
    /// `export` is read during the call only; it may be modified as soon as
    /// this returns. Complete with [`Distributor::wait`].
    pub fn post_forward<T: Pod>(&mut self, export: &[T], items_per_unit: usize) -> Result<(), DistributorError> {
        let stride = Stride::Uniform(items_per_unit);
        self.post(export, stride.clone(), stride, self.tags.uniform, false)
    }

    /// Post a forward exchange where item `i` of the export buffer carries
    /// `export_counts[i]` elements and item `i` of the import buffer
    /// `import_counts[i]`.
    pub fn post_forward_variable<T: Pod>(
        &mut self,
        export: &[T],
        export_counts: &[usize],
        import_counts: &[usize],
    ) -> Result<(), DistributorError> {
        self.post(
            export,
            Stride::per_item(export_counts),
            Stride::per_item(import_counts),
            self.tags.variable,
            true,
        )
    }

    /// Block until everything posted by the last `post_*` call has completed
    /// and unpack the received blocks into `import`.
    ///
    /// Does nothing when no exchange is outstanding. If `import` is too small
    /// or of the wrong element type the exchange stays outstanding and `wait`
    /// may be called again.
    pub fn wait<T: Pod>(&mut self, import: &mut [T]) -> Result<(), DistributorError> {
        let Some(fl) = self.in_flight.take() else {
            return Ok(());
        };
        let elem = size_of::<T>();
        if fl.elem != elem {
            let posted = fl.elem;
            self.in_flight = Some(fl);
            return Err(DistributorError::ElementSizeMismatch { posted, waited: elem });
        }
        let needed = fl.stride.extent(self.recv.extent);
        if import.len() < needed {
            self.in_flight = Some(fl);
            return Err(DistributorError::BufferTooSmall {
                needed,
                got: import.len(),
            });
        }

        let dst = cast_slice_mut(import);
        let mut maybe_err = None;
        for PendingRecv {
            block,
            source,
            expected,
            handle,
        } in fl.recvs
        {
            match handle.wait() {
                Some(data) if data.len() == expected => {
                    if maybe_err.is_none() {
                        scatter_block(&self.recv, block, &fl.stride, elem, &data, dst);
                    }
                }
                Some(data) if maybe_err.is_none() => {
                    maybe_err = Some(if fl.variable {
                        DistributorError::CountMismatch {
                            rank: source,
                            expected: expected / elem.max(1),
                            got: data.len() / elem.max(1),
                        }
                    } else {
                        DistributorError::BufferSizeMismatch {
                            neighbor: source,
                            expected,
                            got: data.len(),
                        }
                    });
                }
                None if maybe_err.is_none() => {
                    maybe_err = Some(DistributorError::CommError {
                        neighbor: source,
                        source: format!("no data received from rank {source}").into(),
                    });
                }
                _ => {} // already have an error; just drain
            }
        }
        if let Some((k, data)) = fl.local {
            scatter_block(&self.recv, k, &fl.stride, elem, &data, dst);
        }
        for send in fl.sends {
            let _ = send.wait();
        }

        match maybe_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Post and wait in one call.
    pub fn exchange<T: Pod>(
        &mut self,
        export: &[T],
        items_per_unit: usize,
        import: &mut [T],
    ) -> Result<(), DistributorError> {
        self.ensure_built()?;
        let needed = self.import_needed(&Stride::Uniform(items_per_unit), size_of::<T>())?;
        if import.len() < needed {
            return Err(DistributorError::BufferTooSmall {
                needed,
                got: import.len(),
            });
        }
        self.post_forward(export, items_per_unit)?;
        self.wait(import)
    }

    /// Variable-size [`Distributor::exchange`].
    pub fn exchange_variable<T: Pod>(
        &mut self,
        export: &[T],
        export_counts: &[usize],
        import: &mut [T],
        import_counts: &[usize],
    ) -> Result<(), DistributorError> {
        self.ensure_built()?;
        let needed = self.import_needed(&Stride::per_item(import_counts), size_of::<T>())?;
        if import.len() < needed {
            return Err(DistributorError::BufferTooSmall {
                needed,
                got: import.len(),
            });
        }
        self.post_forward_variable(export, export_counts, import_counts)?;
        self.wait(import)
    }

    /// Post through the cached reverse plan (built on first use).
    pub fn post_reverse<T: Pod>(&mut self, export: &[T], items_per_unit: usize) -> Result<(), DistributorError> {
        self.reverse_mut()?.post_forward(export, items_per_unit)
    }

    pub fn post_reverse_variable<T: Pod>(
        &mut self,
        export: &[T],
        export_counts: &[usize],
        import_counts: &[usize],
    ) -> Result<(), DistributorError> {
        self.reverse_mut()?
            .post_forward_variable(export, export_counts, import_counts)
    }

    /// Complete a reverse posting phase; a no-op if none is outstanding.
    pub fn reverse_wait<T: Pod>(&mut self, import: &mut [T]) -> Result<(), DistributorError> {
        match self.reverse.get_mut() {
            Some(rev) => rev.wait(import),
            None => Ok(()),
        }
    }

    pub fn reverse_state(&self) -> ExchangeState {
        self.cached_reverse()
            .map_or(ExchangeState::Idle, |rev| rev.state())
    }

    pub fn exchange_reverse<T: Pod>(
        &mut self,
        export: &[T],
        items_per_unit: usize,
        import: &mut [T],
    ) -> Result<(), DistributorError> {
        self.reverse_mut()?.exchange(export, items_per_unit, import)
    }

    pub fn exchange_reverse_variable<T: Pod>(
        &mut self,
        export: &[T],
        export_counts: &[usize],
        import: &mut [T],
        import_counts: &[usize],
    ) -> Result<(), DistributorError> {
        self.reverse_mut()?
            .exchange_variable(export, export_counts, import, import_counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::distributor::DistributorConfig;

    #[test]
    fn send_order_starts_above_me_and_wraps() {
        let order: Vec<_> = send_order(&[5, 1, 3, 0], 2).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        let order: Vec<_> = send_order(&[1, 0, 3, 2], 2).collect();
        assert_eq!(order, vec![2, 3, 0, 1]);
        let order: Vec<_> = send_order(&[0, 1], 4).collect();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn self_message_is_a_copy() {
        let comm = NoComm;
        let mut plan = Distributor::new(&comm);
        plan.create_from_sends(&[0, -1, 0]).unwrap();
        let mut export = vec![1u32, 2, 3];
        plan.post_forward(&export, 1).unwrap();
        export[0] = 99;
        let mut import = vec![0u32; 2];
        plan.wait(&mut import).unwrap();
        assert_eq!(import, vec![1, 3]);
        assert_eq!(plan.state(), ExchangeState::Idle);
    }

    #[test]
    fn second_post_is_rejected() {
        let comm = NoComm;
        let mut plan = Distributor::new(&comm);
        plan.create_from_sends(&[0]).unwrap();
        plan.post_forward(&[1u8], 1).unwrap();
        let err = plan.post_forward(&[1u8], 1).unwrap_err();
        assert!(matches!(
            err,
            DistributorError::OutstandingExchange {
                state: ExchangeState::PostedForward
            }
        ));
        let mut out = [0u8];
        plan.wait(&mut out).unwrap();
        assert_eq!(out, [1]);
    }

    #[test]
    fn small_import_keeps_exchange_outstanding() {
        let comm = NoComm;
        let mut plan = Distributor::new(&comm);
        plan.create_from_sends(&[0, 0]).unwrap();
        plan.post_forward(&[1u16, 2, 3, 4], 2).unwrap();
        let mut short = [0u16; 3];
        assert!(matches!(
            plan.wait(&mut short),
            Err(DistributorError::BufferTooSmall { needed: 4, got: 3 })
        ));
        let mut wrong_type = [0u32; 4];
        assert!(matches!(
            plan.wait(&mut wrong_type),
            Err(DistributorError::ElementSizeMismatch { posted: 2, waited: 4 })
        ));
        let mut ok = [0u16; 4];
        plan.wait(&mut ok).unwrap();
        assert_eq!(ok, [1, 2, 3, 4]);
    }

    #[test]
    fn exchange_checks_import_before_posting() {
        let comm = NoComm;
        let mut plan = Distributor::new(&comm);
        plan.create_from_sends(&[0, 0]).unwrap();
        let mut short = [0u8; 1];
        assert!(matches!(
            plan.exchange(&[1u8, 2], 1, &mut short),
            Err(DistributorError::BufferTooSmall { needed: 2, got: 1 })
        ));
        assert_eq!(plan.state(), ExchangeState::Idle);
    }

    #[test]
    fn overflowing_strides_fail_before_posting() {
        let comm = NoComm;
        let mut plan = Distributor::new(&comm);
        plan.create_from_sends(&[0]).unwrap();
        let mut out = [0u8; 1];
        assert!(matches!(
            plan.exchange(&[1u8], usize::MAX, &mut out),
            Err(DistributorError::SizeMismatch {
                what: "import payload elements",
                ..
            })
        ));
        assert!(matches!(
            plan.post_forward(&[1u8], usize::MAX),
            Err(DistributorError::SizeMismatch {
                what: "export payload elements",
                ..
            })
        ));
        assert!(matches!(
            plan.post_forward(&[1u64], usize::MAX / 4),
            Err(DistributorError::SizeMismatch { .. })
        ));
        let mut wide = [0u32; 1];
        assert!(matches!(
            plan.exchange_variable(&[1u32], &[1], &mut wide, &[usize::MAX]),
            Err(DistributorError::SizeMismatch {
                what: "import payload elements",
                ..
            })
        ));
        assert_eq!(plan.state(), ExchangeState::Idle);
    }

    #[test]
    fn unbuilt_plan_cannot_exchange() {
        let comm = NoComm;
        let mut plan = Distributor::new(&comm);
        let mut out = [0u8; 1];
        assert!(matches!(
            plan.exchange(&[1u8], 1, &mut out),
            Err(DistributorError::NotBuilt)
        ));
    }

    #[test]
    fn ready_send_without_barrier_fails_at_post() {
        let comm = NoComm;
        let cfg = DistributorConfig::default()
            .with_send_type(SendType::Rsend)
            .with_barrier(false);
        let mut plan = Distributor::with_config(&comm, cfg);
        plan.create_from_sends(&[0]).unwrap();
        assert!(matches!(
            plan.post_forward(&[1u8], 1),
            Err(DistributorError::ReadySendWithoutBarrier)
        ));
    }

    #[test]
    fn variable_self_counts_must_agree() {
        let comm = NoComm;
        let mut plan = Distributor::new(&comm);
        plan.create_from_sends(&[0, 0]).unwrap();
        let err = plan
            .post_forward_variable(&[1u8, 2, 3], &[1, 2], &[1, 1])
            .unwrap_err();
        assert!(matches!(
            err,
            DistributorError::CountMismatch {
                rank: 0,
                expected: 2,
                got: 3
            }
        ));
    }

    #[test]
    fn reverse_returns_items_to_their_origin() {
        let comm = NoComm;
        let mut plan = Distributor::new(&comm);
        // not grouped by destination: forces the gather path
        plan.create_from_sends(&[0, -1, 0]).unwrap();
        let mut fwd = [0i64; 2];
        plan.exchange(&[7i64, 8, 9], 1, &mut fwd).unwrap();
        assert_eq!(fwd, [7, 9]);

        let mut back = [0i64; 3];
        plan.exchange_reverse(&fwd, 1, &mut back).unwrap();
        assert_eq!(back, [7, 0, 9]);
        assert_eq!(plan.reverse_state(), ExchangeState::Idle);
    }
}
