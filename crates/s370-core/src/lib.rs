//! Core S/370 architectural state shared by the CPU, channel subsystem and
//! runner crates: main store, the storage-key array, the discrete-event
//! scheduler, the device contract, and the channel subsystem itself.

pub mod channel;
pub mod device;
pub mod error;
pub mod lowmem;
pub mod scheduler;
pub mod store;

pub use channel::{ChannelState, ChannelSubsystem, ChannelType, DeviceTable};
pub use device::Device;
pub use error::{ExternalSource, ProgramException};
pub use scheduler::{Dispatch, EventScheduler};
pub use store::MainStore;
