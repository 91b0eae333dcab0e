//! The Core Runner and its master message queue (§4.6), the device
//! registry glue that turns a parsed configuration into live devices on
//! the channel subsystem (§6.1, §6.2), and the configuration-file parser
//! itself.

pub mod config;
pub mod registry;
pub mod runner;

pub use config::{ConfigError, ConfigLine, ConfigOption};
pub use registry::{ConnId, DeviceRegistry, ModelRegistry, RegistryError, RunnerDevice};
pub use runner::{Runner, RunnerMessage, StepOutcome};
