//! The Core Runner and its master message queue (§4.6).
//!
//! The runner owns the CPU, main store, channel subsystem, event
//! scheduler and device registry, and drives them one iteration at a
//! time: run (or idle-advance) the scheduler, then drain whatever the
//! outside world (a telnet listener, a host timer thread) has posted to
//! the master queue since the last iteration. All external concurrency
//! (§5) funnels through that queue — nothing outside `step` ever touches
//! CPU or channel state directly.

use std::collections::VecDeque;

use s370_core::{lowmem, ChannelSubsystem, EventScheduler};
use s370_cpu::{Cpu, CycleResult, Psw};

use crate::registry::{ConnId, DeviceRegistry};

/// Messages the master queue accepts (§4.6). Anything outside the
/// runner's own iteration loop — a telnet listener thread, a host timer
/// — posts one of these rather than touching CPU or channel state.
#[derive(Debug)]
pub enum RunnerMessage {
    Start,
    Stop,
    Ipl(u16),
    DeviceEnd(u16),
    TimeClock(u32),
    TelnetConnect(u16, ConnId),
    TelnetDisconnect(u16),
    TelnetReceive(u16, Vec<u8>),
}

/// What happened on one call to [`Runner::step`].
#[derive(Debug)]
pub enum StepOutcome {
    Cpu(CycleResult),
    SchedulerOnly,
    Idle,
}

pub struct Runner {
    pub cpu: Cpu,
    pub store: s370_core::MainStore,
    pub channels: ChannelSubsystem,
    pub scheduler: EventScheduler,
    pub devices: DeviceRegistry,
    running: bool,
    queue: VecDeque<RunnerMessage>,
    pending_ipl: Option<u16>,
}

impl Runner {
    #[must_use]
    pub fn new(store_size_bytes: u32, devices: DeviceRegistry) -> Self {
        Self {
            cpu: Cpu::new(),
            store: s370_core::MainStore::new(store_size_bytes),
            channels: ChannelSubsystem::new(),
            scheduler: EventScheduler::new(),
            devices,
            running: false,
            queue: VecDeque::new(),
            pending_ipl: None,
        }
    }

    pub fn post(&mut self, message: RunnerMessage) {
        self.queue.push_back(message);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// One runner iteration (§4.6):
    /// 1. If running, execute one CPU cycle and advance the scheduler.
    /// 2. Else, if the scheduler has pending events, advance it anyway
    ///    so timed callbacks still fire while the CPU is stopped.
    /// 3. Drain every master-queue message posted since the last call.
    pub fn step(&mut self) -> StepOutcome {
        if self.pending_ipl.is_some() {
            self.try_complete_ipl();
        }

        let outcome = if self.running {
            let result = self.cpu.cycle(&mut self.store, &mut self.channels, &mut self.devices);
            self.advance_scheduler(1);
            StepOutcome::Cpu(result)
        } else if self.scheduler.is_empty() {
            StepOutcome::Idle
        } else {
            self.advance_scheduler(1);
            StepOutcome::SchedulerOnly
        };

        self.drain_queue();
        outcome
    }

    /// Advance the scheduler by `ticks`, routing each fired event to the
    /// owning device. `store`/`channels`/`devices` are split out of
    /// `self` as disjoint field borrows so the dispatch closure can hold
    /// them while `scheduler.advance` itself only borrows `scheduler`
    /// (the same split-borrow shape the channel subsystem uses to keep
    /// devices from being owned by the thing that calls back into them).
    fn advance_scheduler(&mut self, ticks: i64) {
        let Self {
            scheduler,
            devices,
            channels,
            store,
            ..
        } = self;
        let mut dispatch = |_s: &mut EventScheduler, owner: u16, selector: u32, arg: i32| {
            devices.on_event(owner, selector, arg, channels, store);
        };
        scheduler.advance(ticks, &mut dispatch);
    }

    fn drain_queue(&mut self) {
        while let Some(message) = self.queue.pop_front() {
            self.handle(message);
        }
    }

    fn handle(&mut self, message: RunnerMessage) {
        match message {
            RunnerMessage::Start => self.running = true,
            RunnerMessage::Stop => self.running = false,
            RunnerMessage::Ipl(devnum) => {
                self.running = false;
                if self.channels.boot_device(devnum, &mut self.devices).is_ok() {
                    self.pending_ipl = Some(devnum);
                    self.try_complete_ipl();
                }
            }
            RunnerMessage::DeviceEnd(devnum) => {
                self.channels.set_dev_attn(devnum, s370_core::device::status::DEVICE_END);
                self.try_complete_ipl();
            }
            RunnerMessage::TimeClock(increment) => self.cpu.tick(increment),
            RunnerMessage::TelnetConnect(devnum, conn) => self.devices.telnet_connect(devnum, conn),
            RunnerMessage::TelnetDisconnect(devnum) => self.devices.telnet_disconnect(devnum),
            RunnerMessage::TelnetReceive(devnum, bytes) => self.devices.telnet_receive(devnum, &bytes),
        }
    }

    /// If an IPL is outstanding and its boot device has posted
    /// completion, load the initial PSW straight from address 0 rather
    /// than through the normal I/O-interrupt vector (§4.4.4: IPL loads
    /// the PSW directly; it is not an I/O old/new PSW swap).
    fn try_complete_ipl(&mut self) {
        let Some(devnum) = self.pending_ipl else { return };
        let Some(completed) = self.channels.chan_scan(0xFFFF, true, &mut self.store) else {
            return;
        };
        if completed != devnum {
            return;
        }
        self.pending_ipl = None;
        let w0 = self.store.get_word(lowmem::IPLPSW).unwrap_or(0);
        let w1 = self.store.get_word(lowmem::IPLPSW + 4).unwrap_or(0);
        self.cpu.psw = Psw::decode([w0, w1], self.cpu.psw.ec_mode);
        self.running = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s370_core::{device::status, ChannelType, Device};

    /// A CCW reader that completes its read synchronously, grounded on
    /// the `TestDevice` in `s370-core::channel`'s own test module.
    struct ImageReader;

    impl Device for ImageReader {
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

    impl crate::registry::RunnerDevice for ImageReader {}

    fn runner_with_ipl_device() -> Runner {
        let mut devices = DeviceRegistry::new();
        devices.insert(0x000, Box::new(ImageReader));
        let mut runner = Runner::new(64 * 1024, devices);
        runner.channels.attach(0x000, ChannelType::Selector, 1);
        runner
    }

    #[test]
    fn start_and_stop_toggle_running() {
        let mut runner = runner_with_ipl_device();
        assert!(!runner.is_running());
        runner.post(RunnerMessage::Start);
        runner.step();
        assert!(runner.is_running());
        runner.post(RunnerMessage::Stop);
        runner.step();
        assert!(!runner.is_running());
    }

    #[test]
    fn idle_step_with_empty_scheduler_does_nothing() {
        let mut runner = runner_with_ipl_device();
        let outcome = runner.step();
        assert!(matches!(outcome, StepOutcome::Idle));
    }

    #[test]
    fn timeclock_message_advances_the_cpu_clock() {
        let mut runner = runner_with_ipl_device();
        let before = runner.cpu.tod_clock;
        runner.post(RunnerMessage::TimeClock(0x100));
        runner.step();
        assert_eq!(runner.cpu.tod_clock, before + 0x100);
    }

    #[test]
    fn ipl_loads_initial_psw_and_starts_running() {
        let mut runner = runner_with_ipl_device();
        // An EC-mode PSW with PC = 0x400, as if the boot record had
        // already been written to the IPL PSW slot (§4.4.4, §6.3).
        runner.store.put_word(lowmem::IPLPSW, 0).unwrap();
        runner.store.put_word(lowmem::IPLPSW + 4, 0x0000_0400).unwrap();
        runner.post(RunnerMessage::Ipl(0x000));
        runner.step();
        assert!(runner.is_running());
        assert_eq!(runner.cpu.psw.pc, 0x400);
    }
}
