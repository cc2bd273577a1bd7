use std::sync::Arc;

use crate::comm::Communicator;
use crate::config::RingConfig;
use crate::device::DeviceAdapter;
use crate::error::{Result, RingError};
use crate::types::{DataType, DeviceOrdinal, Element, Rank, ReduceOp};

/// All ranks of a communicator, driven from one process.
///
/// Every collective call runs on all ranks concurrently, one thread per rank.
#[derive(Debug)]
pub struct DeviceGroup {
    comms: Vec<Communicator>,
}

impl DeviceGroup {
    /// One communicator per listed device; rank `i` runs on `devices[i]`.
    pub fn new(
        devices: &[DeviceOrdinal],
        adapter: Arc<dyn DeviceAdapter>,
        config: RingConfig,
    ) -> Result<Self> {
        Ok(Self {
            comms: Communicator::init_all(devices, adapter, config)?,
        })
    }

    pub fn len(&self) -> usize {
        self.comms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comms.is_empty()
    }

    pub fn comms(&self) -> &[Communicator] {
        &self.comms
    }

    pub fn comm(&self, rank: Rank) -> Option<&Communicator> {
        self.comms.get(rank as usize)
    }

    /// Reduce-scatter with one send buffer per rank; returns one output per
    /// rank.
    ///
    /// Buffer lengths are checked for every rank before any rank starts, so a
    /// bad buffer cannot leave the others waiting.
    pub fn reduce_scatter(
        &self,
        sends: &[&[u8]],
        recv_count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<Vec<Vec<u8>>> {
        let n = self.comms.len();
        if sends.len() != n {
            return Err(RingError::BufferSizeMismatch {
                buffer: "send list",
                expected: n,
                actual: sends.len(),
            });
        }
        let elem = dtype.size_in_bytes();
        let expected = recv_count * n * elem;
        if let Some(bad) = sends.iter().find(|s| s.len() != expected) {
            return Err(RingError::BufferSizeMismatch {
                buffer: "send",
                expected,
                actual: bad.len(),
            });
        }

        self.run_all(|comm, rank| {
            let mut recv = vec![0u8; recv_count * elem];
            comm.reduce_scatter(sends[rank], &mut recv, recv_count, dtype, op)?;
            Ok(recv)
        })
    }

    /// Typed variant of [`reduce_scatter`](Self::reduce_scatter).
    pub fn reduce_scatter_typed<T: Element + Default>(
        &self,
        sends: &[Vec<T>],
        op: ReduceOp,
    ) -> Result<Vec<Vec<T>>> {
        let n = self.comms.len();
        if sends.len() != n || n == 0 {
            return Err(RingError::BufferSizeMismatch {
                buffer: "send list",
                expected: n,
                actual: sends.len(),
            });
        }
        let recv_count = sends[0].len() / n;
        if let Some(bad) = sends.iter().find(|s| s.len() != recv_count * n) {
            return Err(RingError::BufferSizeMismatch {
                buffer: "send",
                expected: recv_count * n * T::DTYPE.size_in_bytes(),
                actual: bad.len() * T::DTYPE.size_in_bytes(),
            });
        }

        self.run_all(|comm, rank| {
            let mut recv = vec![T::default(); recv_count];
            comm.reduce_scatter_typed(&sends[rank], &mut recv, op)?;
            Ok(recv)
        })
    }

    fn run_all<R, F>(&self, f: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(&Communicator, usize) -> Result<R> + Sync,
    {
        let results: Vec<Result<R>> = std::thread::scope(|s| {
            let f = &f;
            let handles: Vec<_> = self
                .comms
                .iter()
                .enumerate()
                .map(|(rank, comm)| s.spawn(move || f(comm, rank)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(RingError::device("rank thread panicked")))
                })
                .collect()
        });
        results.into_iter().collect()
    }

    /// Tear down every communicator, reporting the first failure.
    pub fn destroy(self) -> Result<()> {
        let mut first_err = None;
        for comm in self.comms {
            if let Err(e) = comm.destroy()
                && first_err.is_none()
            {
                first_err = Some(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
