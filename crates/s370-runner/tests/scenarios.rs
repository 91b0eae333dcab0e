//! End-to-end runner scenarios (§4.6, §4.4.4, §6.1, §6.2): configuration
//! parsing through device registration through IPL through normal CPU
//! execution, all driven the way a host embedding would — by posting
//! master-queue messages and calling `step`.

use s370_core::device::status;
use s370_core::{ChannelType, Device};
use s370_runner::{
    registry::{apply_config, channel_of, ModelRegistry, RunnerDevice},
    ConfigLine, DeviceRegistry, Runner, RunnerMessage,
};

/// A reader that completes its command synchronously and writes nothing
/// (the test pre-seeds the IPL record directly into storage, standing
/// in for "the device already wrote it"), grounded on the `TestDevice`
/// in `s370-core::channel`'s own tests.
struct StubReader;

impl Device for StubReader {
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

impl RunnerDevice for StubReader {}

fn stub_reader_factory() -> Box<dyn RunnerDevice> {
    Box::new(StubReader)
}

#[test]
fn config_parses_device_registers_and_boots_from_it() {
    let text = "# boot reader on channel 0\n2540 000\n";
    let lines = s370_runner::config::parse_config(text).unwrap();
    assert_eq!(
        lines,
        vec![ConfigLine::Device {
            model: "2540".to_string(),
            address: 0x000,
            options: vec![],
        }]
    );

    let mut models = ModelRegistry::new();
    models.register("2540", ChannelType::Selector, 1, stub_reader_factory);

    let mut channels = s370_core::ChannelSubsystem::new();
    let mut devices = DeviceRegistry::new();
    apply_config(&lines, &models, &mut channels, &mut devices).unwrap();
    assert_eq!(channel_of(0x000), 0);

    let mut runner = Runner::new(64 * 1024, devices);
    runner.channels = channels;

    // LR 3,1 then AR 3,2 at the address the IPL PSW will point at, so
    // that once the boot completes the CPU runs a normal instruction
    // stream (§8.4 scenario 1, reused here to prove IPL hands off into
    // ordinary execution rather than just loading a PSW and stopping).
    runner.store.put_word(0x400, 0x1831_1A32).unwrap();
    runner.cpu.regs.set_gpr(1, 0x1111_1111);
    runner.cpu.regs.set_gpr(2, 0x0000_0001);

    // The freshly-"loaded" IPL PSW: EC mode, all masks off, PC = 0x400.
    runner.store.put_word(s370_core::lowmem::IPLPSW, 0).unwrap();
    runner.store.put_word(s370_core::lowmem::IPLPSW + 4, 0x400).unwrap();

    runner.post(RunnerMessage::Ipl(0x000));
    runner.step();
    assert!(runner.is_running());
    assert_eq!(runner.cpu.psw.pc, 0x400);

    runner.step(); // LR 3,1
    assert_eq!(runner.cpu.regs.gpr(3), 0x1111_1111);
    runner.step(); // AR 3,2
    assert_eq!(runner.cpu.regs.gpr(3), 0x1111_1112);
    assert_eq!(runner.cpu.psw.pc, 0x404);
}

#[test]
fn device_end_message_posts_channel_attention() {
    let mut devices = DeviceRegistry::new();
    devices.insert(0x0A0, Box::new(StubReader));
    let mut runner = Runner::new(64 * 1024, devices);
    runner.channels.attach(0x0A0, ChannelType::Selector, 1);

    runner.post(RunnerMessage::DeviceEnd(0x0A0));
    runner.step();

    let devnum = runner.channels.chan_scan(0xFFFF, true, &mut runner.store);
    assert_eq!(devnum, Some(0x0A0));
}

#[test]
fn unknown_model_fails_configuration() {
    let models = ModelRegistry::new();
    let mut channels = s370_core::ChannelSubsystem::new();
    let mut devices = DeviceRegistry::new();
    let lines = vec![ConfigLine::Device {
        model: "UNKNOWN".to_string(),
        address: 0x0F0,
        options: vec![],
    }];
    assert!(apply_config(&lines, &models, &mut channels, &mut devices).is_err());
}
