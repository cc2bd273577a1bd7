//! Ring-pipelined reduce-scatter across devices that share memory.
//!
//! Each device owns one transport region per ring; its ring predecessor
//! writes partial results into that region's staging buffer and signals
//! through monotonic flags. Data moves around every ring in chunks,
//! subchunks, and steps, and after `n_dev` steps each device holds the fully
//! reduced block matching its rank.

pub mod collective;
pub mod comm;
pub mod config;
pub mod device;
pub mod error;
pub mod flag;
pub mod group;
pub mod handle;
pub mod kernel;
pub mod plan;
pub(crate) mod reduce;
pub mod region;
pub mod rendezvous;
pub mod topology;
pub mod types;

pub use collective::{CollectiveGroup, CollectiveHandle};
pub use comm::Communicator;
pub use config::{DebugLevel, RingConfig};
pub use device::{DeviceAdapter, Fabric, FailPoint, HostAdapter, LinkClass, LiveResources};
pub use error::{ErrorKind, Result, RingError};
pub use group::DeviceGroup;
pub use handle::{HandleKind, RegionHandle};
pub use plan::PartitionPlan;
pub use rendezvous::UniqueId;
pub use topology::{Ring, TopologyId, TransportClass};
pub use types::{DataType, DeviceOrdinal, Element, ProcessId, Rank, ReduceOp};
