use std::sync::Arc;

use super::checksum::log_checksum;
use super::handle::CollectiveHandle;
use crate::comm::Communicator;
use crate::error::{Result, RingError};
use crate::kernel::{self, Launch};
use crate::plan::PartitionPlan;
use crate::types::{DataType, Element, ReduceOp, as_bytes, as_bytes_mut};

impl Communicator {
    /// Ring reduce-scatter: reduce across all ranks, each rank gets its own
    /// block.
    ///
    /// `send` holds `recv_count * n_dev` elements of `dtype`, laid out as one
    /// block per rank; `recv` receives `recv_count` elements: the reduction of
    /// block `rank` across all ranks. Every rank must issue the same sequence
    /// of collectives with the same `recv_count`, `dtype` and `op`.
    pub fn reduce_scatter(
        &self,
        send: &[u8],
        recv: &mut [u8],
        recv_count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        let plan = self.plan_reduce_scatter(send.len(), recv.len(), recv_count, dtype)?;
        let op_index = self.next_op_index();
        self.run_reduce_scatter(&plan, op_index, send, recv, dtype, op)
    }

    /// Typed reduce-scatter; the element count comes from `recv.len()`.
    pub fn reduce_scatter_typed<T: Element>(
        &self,
        send: &[T],
        recv: &mut [T],
        op: ReduceOp,
    ) -> Result<()> {
        let recv_count = recv.len();
        self.reduce_scatter(as_bytes(send), as_bytes_mut(recv), recv_count, T::DTYPE, op)
    }

    /// Non-blocking reduce-scatter. The collective's position in this rank's
    /// sequence is fixed at call time; the returned handle yields the
    /// received bytes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn reduce_scatter_nb(
        self: &Arc<Self>,
        send: Vec<u8>,
        recv_count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> CollectiveHandle {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(rt) => rt,
            Err(e) => {
                return CollectiveHandle::failed(RingError::InvalidConfig(format!(
                    "non-blocking collective outside a tokio runtime: {e}"
                )));
            }
        };
        let recv_bytes = recv_count * dtype.size_in_bytes();
        let plan = match self.plan_reduce_scatter(send.len(), recv_bytes, recv_count, dtype) {
            Ok(plan) => plan,
            Err(e) => return CollectiveHandle::failed(e),
        };
        let op_index = self.next_op_index();
        let comm = Arc::clone(self);
        CollectiveHandle::spawn_blocking(&runtime, move || {
            let mut recv = vec![0u8; recv_bytes];
            comm.run_reduce_scatter(&plan, op_index, &send, &mut recv, dtype, op)?;
            Ok(recv)
        })
    }

    fn plan_reduce_scatter(
        &self,
        send_len: usize,
        recv_len: usize,
        recv_count: usize,
        dtype: DataType,
    ) -> Result<PartitionPlan> {
        let elem = dtype.size_in_bytes();
        let expected_send = recv_count * self.n_dev() * elem;
        if send_len != expected_send {
            return Err(RingError::BufferSizeMismatch {
                buffer: "send",
                expected: expected_send,
                actual: send_len,
            });
        }
        if recv_len != recv_count * elem {
            return Err(RingError::BufferSizeMismatch {
                buffer: "recv",
                expected: recv_count * elem,
                actual: recv_len,
            });
        }
        PartitionPlan::new(
            recv_count,
            self.n_dev(),
            self.n_rings(),
            self.buffer_size(),
            elem,
            self.config().producers,
        )
    }

    fn run_reduce_scatter(
        &self,
        plan: &PartitionPlan,
        op_index: u64,
        send: &[u8],
        recv: &mut [u8],
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        // Collectives on one communicator retire in issue order.
        self.op_counter().wait_for(op_index);

        let checksums = self.config().print_checksums;
        if checksums {
            log_checksum(self.rank(), op_index, "send", send);
        }

        if self.n_dev() == 1 {
            kernel::run_single(self.op_counter(), op_index, send, recv);
        } else {
            let launch = Launch {
                rank: self.rank(),
                rings: self.rings(),
                links: self.link_views(),
                op_counter: self.op_counter(),
                plan,
                dtype,
                op,
                op_index,
                producers: self.config().producers,
            };
            kernel::run(launch, send, recv)?;
        }

        if checksums {
            log_checksum(self.rank(), op_index, "recv", recv);
        }
        tracing::trace!(rank = self.rank(), op_index, %dtype, %op, "reduce-scatter done");
        Ok(())
    }
}
