mod checksum;
mod handle;
mod reduce_scatter;

pub use handle::{CollectiveGroup, CollectiveHandle};
