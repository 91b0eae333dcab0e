//! Device registry glue (§6.1, §6.2): resolving device numbers to
//! channel/subchannel slots and bootstrapping device instances from
//! parsed configuration lines.
//!
//! Like [`s370_core::channel::ChannelSubsystem`], the registry never lets
//! the channel subsystem or the CPU own a device directly — it is the
//! address-indexed lookup table a top-level runner owns instead, the
//! same backreference-cycle resolution `ChannelSubsystem` itself uses.

use std::collections::HashMap;
use std::fmt;

use s370_core::{ChannelSubsystem, ChannelType, Device, DeviceTable, MainStore};

use crate::config::ConfigLine;

/// Opaque per-connection identifier the telnet listener hands back on
/// connect; the runner and devices never interpret it beyond identity.
pub type ConnId = u32;

/// Host-side hooks the runner's master queue drives beyond the four core
/// `Device` operations (§4.6): telnet connectivity and resumption of a
/// scheduled event. Every device gets the no-op default; a device that
/// cares about one overrides it.
pub trait RunnerDevice: Device {
    fn telnet_connect(&mut self, _conn: ConnId) {}
    fn telnet_disconnect(&mut self) {}
    fn telnet_receive(&mut self, _bytes: &[u8]) {}
    fn on_event(&mut self, _selector: u32, _arg: i32, _channels: &mut ChannelSubsystem, _store: &mut MainStore) {}
}

type ModelFactory = fn() -> Box<dyn RunnerDevice>;

#[derive(Clone, Copy)]
struct ModelEntry {
    kind: ChannelType,
    nsubchan: usize,
    factory: ModelFactory,
}

/// Models registered at startup by each device implementation (§6.1:
/// "Model names are registered at startup by each device implementation;
/// unknown model is a fatal configuration error").
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelEntry>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, kind: ChannelType, nsubchan: usize, factory: ModelFactory) {
        self.models.insert(name.to_ascii_uppercase(), ModelEntry { kind, nsubchan, factory });
    }

    #[must_use]
    fn lookup(&self, name: &str) -> Option<ModelEntry> {
        self.models.get(&name.to_ascii_uppercase()).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    UnknownModel(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownModel(name) => write!(f, "unknown device model: {name:?}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Device-number decoding (§6.2): high 4 bits select the channel (0-11),
/// low 8 bits are a channel-relative slot whose meaning (direct
/// subchannel index, shared subchannel 0, or block-multiplexer group)
/// is resolved by the channel itself once attached. Exposed here only
/// so the registry glue can report the channel a configuration line
/// targets without reaching into channel internals.
#[must_use]
pub fn channel_of(devnum: u16) -> u8 {
    ((devnum >> 8) & 0x0F) as u8
}

/// Owns every attached device and is the [`DeviceTable`] the runner
/// threads through [`s370_cpu::Cpu::cycle`] and the channel subsystem's
/// CPU-facing operations.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<u16, Box<dyn RunnerDevice>>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, devnum: u16, device: Box<dyn RunnerDevice>) {
        self.devices.insert(devnum, device);
    }

    pub fn telnet_connect(&mut self, devnum: u16, conn: ConnId) {
        if let Some(dev) = self.devices.get_mut(&devnum) {
            dev.telnet_connect(conn);
        }
    }

    pub fn telnet_disconnect(&mut self, devnum: u16) {
        if let Some(dev) = self.devices.get_mut(&devnum) {
            dev.telnet_disconnect();
        }
    }

    pub fn telnet_receive(&mut self, devnum: u16, bytes: &[u8]) {
        if let Some(dev) = self.devices.get_mut(&devnum) {
            dev.telnet_receive(bytes);
        }
    }

    pub fn on_event(&mut self, devnum: u16, selector: u32, arg: i32, channels: &mut ChannelSubsystem, store: &mut MainStore) {
        if let Some(dev) = self.devices.get_mut(&devnum) {
            dev.on_event(selector, arg, channels, store);
        }
    }
}

impl DeviceTable for DeviceRegistry {
    fn device_mut(&mut self, devnum: u16) -> Option<&mut dyn Device> {
        self.devices.get_mut(&devnum).map(|d| d.as_mut() as &mut dyn Device)
    }
}

/// Attach every device line in a parsed configuration to the channel
/// subsystem and instantiate its device, per §6.1/§6.2. Non-device lines
/// (switches, bare options) are ignored here; the caller applies those
/// separately.
pub fn apply_config(
    lines: &[ConfigLine],
    models: &ModelRegistry,
    channels: &mut ChannelSubsystem,
    devices: &mut DeviceRegistry,
) -> Result<(), RegistryError> {
    for line in lines {
        if let ConfigLine::Device { model, address, .. } = line {
            let entry = models.lookup(model).ok_or_else(|| RegistryError::UnknownModel(model.clone()))?;
            channels.attach(*address, entry.kind, entry.nsubchan);
            devices.insert(*address, (entry.factory)());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use s370_core::device::status;

    struct StubDevice;

    impl Device for StubDevice {
        fn start_io(&mut self) -> u8 {
            0
        }
        fn start_cmd(&mut self, _cmd: u8) -> u8 {
            status::CHNEND_DEVEND
        }
        fn halt_io(&mut self) -> u8 {
            0
        }
        fn init_dev(&mut self) -> u8 {
            0
        }
    }

    impl RunnerDevice for StubDevice {}

    fn stub_factory() -> Box<dyn RunnerDevice> {
        Box::new(StubDevice)
    }

    #[test]
    fn unknown_model_is_rejected() {
        let models = ModelRegistry::new();
        let mut channels = ChannelSubsystem::new();
        let mut devices = DeviceRegistry::new();
        let lines = vec![ConfigLine::Device {
            model: "NOSUCH".to_string(),
            address: 0x0F0,
            options: vec![],
        }];
        let err = apply_config(&lines, &models, &mut channels, &mut devices).unwrap_err();
        assert_eq!(err, RegistryError::UnknownModel("NOSUCH".to_string()));
    }

    #[test]
    fn known_model_attaches_device_and_channel() {
        let mut models = ModelRegistry::new();
        models.register("3420", ChannelType::Selector, 1, stub_factory);
        let mut channels = ChannelSubsystem::new();
        let mut devices = DeviceRegistry::new();
        let lines = vec![ConfigLine::Device {
            model: "3420".to_string(),
            address: 0x0C0,
            options: vec![],
        }];
        apply_config(&lines, &models, &mut channels, &mut devices).unwrap();
        assert!(devices.device_mut(0x0C0).is_some());
        assert_eq!(channel_of(0x0C0), 0);
    }

    #[test]
    fn model_lookup_is_case_insensitive() {
        let mut models = ModelRegistry::new();
        models.register("3420", ChannelType::Selector, 1, stub_factory);
        let mut channels = ChannelSubsystem::new();
        let mut devices = DeviceRegistry::new();
        let lines = vec![ConfigLine::Device {
            model: "3420".to_string(),
            address: 0x0C1,
            options: vec![],
        }];
        assert!(apply_config(&lines, &models, &mut channels, &mut devices).is_ok());
    }
}
