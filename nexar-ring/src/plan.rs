//! Partitioning of one reduce-scatter into chunks and subchunks.
//!
//! Each device's input is `n_dev` blocks of `count` elements. Every block is
//! cut the same way: into chunks of `chunk_size` elements (the last may be
//! shorter), each chunk into up to [`NUM_SUBCHUNKS`] subchunks that are
//! pipelined independently. Chunk `c` is handled by ring `c % active_rings`.
//!
//! Every subchunk length is a multiple of the alignment unit, except one
//! terminal subchunk at the very end that carries the remainder.

use crate::error::{Result, RingError};
use crate::types::{NUM_BUFCHUNKS, NUM_SUBCHUNKS, UNROLL};

/// A slice of a chunk, in elements relative to the chunk start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subchunk {
    pub offset: usize,
    pub len: usize,
}

/// Geometry of one chunk, in elements relative to the block start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGeom {
    pub index: usize,
    pub offset: usize,
    pub len: usize,
    pub subchunks: Vec<Subchunk>,
}

/// How one collective's data is distributed over rings, chunks, and
/// subchunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    count: usize,
    n_dev: usize,
    align: usize,
    chunk_size: usize,
    n_chunks: usize,
    active_rings: usize,
}

fn div_ceil(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}

impl PartitionPlan {
    /// Plan a reduce-scatter of `count` elements per block.
    ///
    /// `buff_bytes` is the staging capacity of one ring; it must hold
    /// [`NUM_BUFCHUNKS`] slots of `n_dev - 1` aligned chunks.
    pub fn new(
        count: usize,
        n_dev: usize,
        n_rings: usize,
        buff_bytes: usize,
        elem_size: usize,
        producers: usize,
    ) -> Result<Self> {
        if n_dev == 0 || n_rings == 0 || elem_size == 0 || producers == 0 {
            return Err(RingError::InvalidConfig(format!(
                "cannot plan with n_dev={n_dev} n_rings={n_rings} \
                 elem_size={elem_size} producers={producers}"
            )));
        }
        let align = UNROLL * producers;
        let atom = NUM_SUBCHUNKS * align;

        let mut max_chunk = buff_bytes / NUM_BUFCHUNKS / (n_dev - 1).max(1) / elem_size;
        max_chunk -= max_chunk % atom;
        if max_chunk == 0 {
            return Err(RingError::InvalidConfig(format!(
                "staging buffer of {buff_bytes} bytes cannot hold one chunk of {atom} \
                 elements for {n_dev} devices"
            )));
        }

        if count == 0 {
            return Ok(Self {
                count,
                n_dev,
                align,
                chunk_size: 0,
                n_chunks: 0,
                active_rings: 0,
            });
        }

        let rings = n_rings.min(div_ceil(count, atom));
        let target = div_ceil(div_ceil(count, max_chunk), rings) * rings;
        let chunk_size = div_ceil(div_ceil(count, target), atom) * atom;
        let n_chunks = div_ceil(count, chunk_size);

        Ok(Self {
            count,
            n_dev,
            align,
            chunk_size,
            n_chunks,
            active_rings: rings.min(n_chunks),
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn n_dev(&self) -> usize {
        self.n_dev
    }

    /// Elements every non-terminal slice is a multiple of.
    pub fn align(&self) -> usize {
        self.align
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn n_chunks(&self) -> usize {
        self.n_chunks
    }

    /// Rings that receive at least one chunk.
    pub fn active_rings(&self) -> usize {
        self.active_rings
    }

    pub fn is_empty(&self) -> bool {
        self.n_chunks == 0
    }

    /// Chunks handled by ring `ring`, in execution order.
    pub fn chunks_of_ring(&self, ring: usize) -> impl Iterator<Item = usize> + use<> {
        let step = self.active_rings.max(1);
        let start = if ring < self.active_rings { ring } else { self.n_chunks };
        (start..self.n_chunks).step_by(step)
    }

    /// Staging elements one slot occupies: one chunk per forwarding step.
    pub fn slot_elems(&self) -> usize {
        self.n_dev.saturating_sub(1) * self.chunk_size
    }

    /// Element offset in a staging buffer for data of local chunk `local`,
    /// written at ring step `step`, at `sub_offset` within the chunk.
    pub fn staging_offset(&self, local: usize, step: usize, sub_offset: usize) -> usize {
        (local % NUM_BUFCHUNKS) * self.slot_elems() + step * self.chunk_size + sub_offset
    }

    /// Geometry of chunk `c`.
    pub fn chunk(&self, c: usize) -> ChunkGeom {
        let offset = c * self.chunk_size;
        let len = self.chunk_size.min(self.count.saturating_sub(offset));
        let subchunks = if len == self.chunk_size {
            let sub = self.chunk_size / NUM_SUBCHUNKS;
            (0..NUM_SUBCHUNKS)
                .map(|j| Subchunk {
                    offset: j * sub,
                    len: sub,
                })
                .collect()
        } else {
            self.tail_subchunks(len)
        };
        ChunkGeom {
            index: c,
            offset,
            len,
            subchunks,
        }
    }

    /// Split a short last chunk: aligned units spread over the subchunks,
    /// remainder in one extra terminal subchunk.
    fn tail_subchunks(&self, len: usize) -> Vec<Subchunk> {
        let units = len / self.align;
        let rem = len % self.align;
        let base = units / NUM_SUBCHUNKS;
        let extra = units % NUM_SUBCHUNKS;

        let mut subs = Vec::with_capacity(NUM_SUBCHUNKS + 1);
        let mut offset = 0;
        for j in 0..NUM_SUBCHUNKS {
            let n = (base + usize::from(j < extra)) * self.align;
            if n > 0 {
                subs.push(Subchunk { offset, len: n });
                offset += n;
            }
        }
        if rem > 0 {
            subs.push(Subchunk { offset, len: rem });
        }
        subs
    }
}
