mod adapter;
mod host;

pub use adapter::{DeviceAdapter, IpcMemHandle, LinkClass, RegionRequest};
pub use host::{Fabric, FabricBuilder, FailPoint, HostAdapter, LiveResources};
