use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use crate::types::Rank;

/// Cheap content fingerprint of a buffer, for debug logging only.
pub(crate) fn checksum(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

pub(crate) fn log_checksum(rank: Rank, op_index: u64, buffer: &'static str, bytes: &[u8]) {
    tracing::info!(
        rank,
        op_index,
        buffer,
        len = bytes.len(),
        checksum = format_args!("{:016x}", checksum(bytes)),
        "reduce-scatter buffer checksum"
    );
}
