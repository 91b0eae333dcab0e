//! The CPU engine: registers, PSW, DAT, PER state and the per-cycle
//! dispatch loop (§4.5).
//!
//! `Cpu` owns none of main store, the channel subsystem or the event
//! scheduler — those are threaded through each call, the same
//! backreference-avoidance pattern the channel subsystem uses for devices.

use s370_core::{ChannelSubsystem, DeviceTable, MainStore, ProgramException};

use crate::dat::Dat;
use crate::decode::{self, Step};
use crate::interrupt;
use crate::ops;
use crate::per::PerState;
use crate::psw::Psw;
use crate::registers::Registers;

/// What happened on one call to [`Cpu::cycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleResult {
    /// An instruction executed normally.
    Executed,
    /// An I/O, external, or program interruption was taken instead of
    /// (or after) executing an instruction.
    Interrupted,
    /// The PSW is in a disabled wait state; nothing ran.
    Waiting,
}

pub struct Cpu {
    pub regs: Registers,
    pub psw: Psw,
    pub dat: Dat,
    pub per: PerState,
    /// Decremented by 0x100 per external tick (§4.5.5); interrupt posted
    /// on crossing zero.
    pub interval_timer: i32,
    pub cpu_timer: i64,
    pub clock_comparator: u64,
    pub tod_clock: u64,
    timer_interrupt_pending: bool,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    #[must_use]
    pub fn new() -> Self {
        Self {
            regs: Registers::default(),
            psw: Psw::default(),
            dat: Dat::new(),
            per: PerState::new(),
            interval_timer: 0,
            cpu_timer: 0,
            clock_comparator: 0,
            tod_clock: 0,
            timer_interrupt_pending: false,
        }
    }

    /// Advance the TOD clock / interval timer / CPU timer by one external
    /// tick (§4.5.5). Called by the runner on `TimeClock` messages.
    pub fn tick(&mut self, increment: u32) {
        self.tod_clock = self.tod_clock.wrapping_add(u64::from(increment));
        self.cpu_timer = self.cpu_timer.wrapping_sub(i64::from(increment));
        let (next, overflowed) = self.interval_timer.overflowing_sub(0x100);
        self.interval_timer = next;
        if overflowed || next < 0 {
            self.timer_interrupt_pending = true;
        }
    }

    pub(crate) fn segment_table_base(&self) -> u32 {
        self.regs.cr(1) & 0x00FF_FFFF
    }

    /// Translate a virtual address through DAT if enabled (§4.5.3 step 1).
    fn translate(&mut self, vaddr: u32, store: &mut MainStore) -> Result<u32, ProgramException> {
        if self.psw.translation_enable {
            self.dat.translate(vaddr, self.segment_table_base(), store)
        } else {
            Ok(vaddr & 0x00FF_FFFF)
        }
    }

    fn check_protection(&self, store: &MainStore, paddr: u32, write: bool) -> Result<(), ProgramException> {
        if self.psw.key == 0 {
            return Ok(());
        }
        let block_key = store.get_key(paddr);
        let access_key = block_key & 0xF0;
        if access_key == 0 || access_key == (self.psw.key << 4) {
            return Ok(());
        }
        if write || block_key & s370_core::store::KEY_FETCH_PROTECT != 0 {
            return Err(ProgramException::Protection);
        }
        Ok(())
    }

    /// Resolve `vaddr` to a physical address with translation and
    /// protection applied (§4.5.3 steps 1-2).
    fn resolve(&mut self, vaddr: u32, store: &mut MainStore, write: bool) -> Result<u32, ProgramException> {
        let paddr = self.translate(vaddr, store)?;
        self.check_protection(store, paddr, write)?;
        Ok(paddr)
    }

    pub fn read_byte(&mut self, vaddr: u32, store: &mut MainStore) -> Result<u8, ProgramException> {
        let paddr = self.resolve(vaddr, store, false)?;
        let word = store.get_word(paddr & !0x3)?;
        Ok((word >> (8 * (3 - (paddr & 0x3)))) as u8)
    }

    pub fn write_byte(&mut self, vaddr: u32, value: u8, store: &mut MainStore) -> Result<(), ProgramException> {
        let paddr = self.resolve(vaddr, store, true)?;
        let mask = 0x08u8 >> (paddr & 0x3);
        store.put_word_mask(paddr & !0x3, u32::from(value) << (8 * (3 - (paddr & 0x3))), mask)?;
        self.per.note_storage_write(vaddr);
        Ok(())
    }

    pub fn read_half(&mut self, vaddr: u32, store: &mut MainStore) -> Result<i16, ProgramException> {
        let hi = self.read_byte(vaddr, store)?;
        let lo = self.read_byte(vaddr.wrapping_add(1), store)?;
        Ok(i16::from_be_bytes([hi, lo]))
    }

    pub fn write_half(&mut self, vaddr: u32, value: u16, store: &mut MainStore) -> Result<(), ProgramException> {
        let bytes = value.to_be_bytes();
        self.write_byte(vaddr, bytes[0], store)?;
        self.write_byte(vaddr.wrapping_add(1), bytes[1], store)
    }

    pub fn read_full(&mut self, vaddr: u32, store: &mut MainStore) -> Result<u32, ProgramException> {
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.read_byte(vaddr.wrapping_add(i as u32), store)?;
        }
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn write_full(&mut self, vaddr: u32, value: u32, store: &mut MainStore) -> Result<(), ProgramException> {
        for (i, b) in value.to_be_bytes().into_iter().enumerate() {
            self.write_byte(vaddr.wrapping_add(i as u32), b, store)?;
        }
        Ok(())
    }

    fn external_pending(&self) -> Option<s370_core::ExternalSource> {
        if !self.psw.external_enable {
            return None;
        }
        if self.timer_interrupt_pending {
            Some(s370_core::ExternalSource::IntervalTimer)
        } else if self.cpu_timer < 0 {
            Some(s370_core::ExternalSource::CpuTimer)
        } else if self.tod_clock >= self.clock_comparator && self.clock_comparator != 0 {
            Some(s370_core::ExternalSource::ClockComparator)
        } else {
            None
        }
    }

    /// One full instruction cycle, per §4.5 steps 1-8.
    pub fn cycle(
        &mut self,
        store: &mut MainStore,
        channels: &mut ChannelSubsystem,
        devices: &mut dyn DeviceTable,
    ) -> CycleResult {
        if let Some(devnum) = channels.chan_scan(u16::from(self.psw.system_mask), self.psw.io_enable, store) {
            interrupt::take_io(&mut self.psw, store, devnum);
            return CycleResult::Interrupted;
        }

        if let Some(source) = self.external_pending() {
            match source {
                s370_core::ExternalSource::IntervalTimer => self.timer_interrupt_pending = false,
                s370_core::ExternalSource::ClockComparator => self.clock_comparator = u64::MAX,
                _ => {}
            }
            interrupt::take_external(&mut self.psw, store, source);
            return CycleResult::Interrupted;
        }

        if self.psw.wait && !self.psw.external_enable && !self.psw.io_enable {
            return CycleResult::Waiting;
        }

        if self.psw.pc & 1 != 0 {
            interrupt::take_program(&mut self.psw, store, ProgramException::Specification, 0, 0, 0);
            return CycleResult::Interrupted;
        }

        self.per.begin_instruction();
        let start_pc = self.psw.pc;
        let mut bytes = [0u8; 6];
        let mut len_known = 2usize;
        for (i, b) in bytes.iter_mut().enumerate().take(len_known) {
            match self.read_byte(start_pc.wrapping_add(i as u32), store) {
                Ok(v) => *b = v,
                Err(e) => {
                    interrupt::take_program(&mut self.psw, store, e, 0, 0, 0);
                    return CycleResult::Interrupted;
                }
            }
        }
        let Some(fmt) = s370_asm::opcodes::format_of(bytes[0]) else {
            self.psw.pc = start_pc.wrapping_add(2) & 0x00FF_FFFF;
            interrupt::take_program(&mut self.psw, store, ProgramException::Operation, 1, 0, 0);
            return CycleResult::Interrupted;
        };
        len_known = fmt.len() as usize;
        for (i, b) in bytes.iter_mut().enumerate().take(len_known).skip(2) {
            match self.read_byte(start_pc.wrapping_add(i as u32), store) {
                Ok(v) => *b = v,
                Err(e) => {
                    interrupt::take_program(&mut self.psw, store, e, 0, 0, 0);
                    return CycleResult::Interrupted;
                }
            }
        }

        let Some(step) = decode::decode(&bytes[..len_known], &self.regs_snapshot()) else {
            self.psw.pc = start_pc.wrapping_add(2) & 0x00FF_FFFF;
            interrupt::take_program(&mut self.psw, store, ProgramException::Operation, 1, 0, 0);
            return CycleResult::Interrupted;
        };
        self.psw.pc = start_pc.wrapping_add(u32::from(step.ilc) * 2) & 0x00FF_FFFF;

        let result = ops::dispatch(self, &step, store, channels, devices);

        // A pending PER event only tags along on an actual program
        // interruption (its code is OR'd in by `take_program`); it never
        // raises one by itself (§4.5 step 7, design note).
        match result {
            Ok(()) => CycleResult::Executed,
            Err(exception) => {
                let (per_code, per_addr) = if self.per.pending() {
                    (self.per.code, self.per.addr)
                } else {
                    (0, 0)
                };
                interrupt::take_program(&mut self.psw, store, exception, step.ilc, per_code, per_addr);
                CycleResult::Interrupted
            }
        }
    }

    pub(crate) fn regs_snapshot(&self) -> [u32; 16] {
        let mut out = [0u32; 16];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.regs.gpr(i as u8);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s370_core::ChannelSubsystem;
    use std::collections::HashMap;

    fn blank_devices() -> HashMap<u16, Box<dyn s370_core::Device>> {
        HashMap::new()
    }

    #[test]
    fn lr_copies_register_and_advances_pc() {
        let mut cpu = Cpu::new();
        cpu.regs.set_gpr(2, 0xABCD_1234);
        cpu.psw.pc = 0x400;
        let mut store = MainStore::new(4096);
        store.put_word(0x400, 0x1812_0000).unwrap(); // LR 1,2
        let mut channels = ChannelSubsystem::new();
        let mut devices = blank_devices();
        let result = cpu.cycle(&mut store, &mut channels, &mut devices);
        assert_eq!(result, CycleResult::Executed);
        assert_eq!(cpu.regs.gpr(1), 0xABCD_1234);
        assert_eq!(cpu.psw.pc, 0x402);
    }

    #[test]
    fn odd_pc_raises_specification_exception() {
        let mut cpu = Cpu::new();
        cpu.psw.pc = 0x401;
        cpu.psw.ec_mode = true;
        let mut store = MainStore::new(4096);
        store.put_word(0x068, 0).unwrap();
        store.put_word(0x068 + 4, 0x0000_0600).unwrap();
        let mut channels = ChannelSubsystem::new();
        let mut devices = blank_devices();
        let result = cpu.cycle(&mut store, &mut channels, &mut devices);
        assert_eq!(result, CycleResult::Interrupted);
        assert_eq!(cpu.psw.pc, 0x0000_0600);
    }

    #[test]
    fn unknown_opcode_takes_operation_exception() {
        let mut cpu = Cpu::new();
        cpu.psw.pc = 0x400;
        cpu.psw.ec_mode = true;
        let mut store = MainStore::new(4096);
        store.put_word(0x400, 0x0200_0000).unwrap(); // opcode 0x02 is unassigned
        store.put_word(0x068, 0).unwrap();
        store.put_word(0x068 + 4, 0x0000_0700).unwrap();
        let mut channels = ChannelSubsystem::new();
        let mut devices = blank_devices();
        let result = cpu.cycle(&mut store, &mut channels, &mut devices);
        assert_eq!(result, CycleResult::Interrupted);
        assert_eq!(cpu.psw.pc, 0x0000_0700);
    }
}
