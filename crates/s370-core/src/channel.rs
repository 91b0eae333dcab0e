//! The Channel Subsystem (§3.3, §3.4, §4.4): CCW fetch/execute, byte
//! streaming, interrupt scanning and IPL.
//!
//! Devices are never owned by a [`ChannelSubsystem`] or its
//! [`Subchannel`]s — that would tie the channel's lifetime to every
//! peripheral's concrete type. Instead both are addressed through a
//! [`DeviceTable`] the caller supplies to every entry point, following the
//! "address-indexed lookup table owned by a top-level context" resolution
//! for the backreference cycle described in the design notes.

use crate::device::{chan_status, status, Device};
use crate::error::ProgramException;
use crate::lowmem;
use crate::store::MainStore;

/// CCW flag bits (CCW byte 4), high bit first.
pub mod ccw_flag {
    pub const CD: u8 = 0x80;
    pub const CC: u8 = 0x40;
    pub const SLI: u8 = 0x20;
    pub const SKIP: u8 = 0x10;
    pub const PCI: u8 = 0x08;
    pub const IDA: u8 = 0x04;
}

/// CCW command code, command byte: TIC (transfer in channel).
pub const CMD_TIC: u8 = 0x08;
/// Low nibble value for a read-backward command.
const RDBWD_LOW_NIBBLE: u8 = 0x0C;

/// CCW command-type classification (bits 2-0 of the command byte, §6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdType {
    ChannelOp,
    Write,
    Read,
    Control,
    Sense,
    Other,
}

#[must_use]
pub fn classify(cmd: u8) -> CmdType {
    match cmd & 0x07 {
        0 => CmdType::ChannelOp,
        1 => CmdType::Write,
        2 => CmdType::Read,
        3 => CmdType::Control,
        4 => CmdType::Sense,
        _ => CmdType::Other,
    }
}

#[must_use]
pub fn is_read_backward(cmd: u8) -> bool {
    cmd & 0x0F == RDBWD_LOW_NIBBLE && cmd != CMD_TIC
}

/// An 8-byte Channel Command Word (§6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ccw {
    pub cmd: u8,
    pub address: u32,
    pub flags: u8,
    pub count: u16,
}

impl Ccw {
    #[must_use]
    pub fn from_bytes(b: [u8; 8]) -> Self {
        Self {
            cmd: b[0],
            address: (u32::from(b[1]) << 16) | (u32::from(b[2]) << 8) | u32::from(b[3]),
            flags: b[4],
            count: (u16::from(b[6]) << 8) | u16::from(b[7]),
        }
    }
}

/// Channel program type (§3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelType {
    #[default]
    Disabled,
    Selector,
    Multiplexer,
    BlockMultiplexer,
}

/// Current state of the channel buffer byte pointer (§3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufPos {
    #[default]
    Empty,
    Pos(u8),
    ChanEnd,
}

/// Per-(channel, device-slot) active I/O state (§3.3).
#[derive(Debug, Clone, Default)]
pub struct Subchannel {
    pub device_addr: u16,
    pub command: u8,
    pub flags: u8,
    pub count: u16,
    pub address: u32,
    pub indirect_address: u32,
    /// Next-CCW pointer (the program counter of the channel program).
    pub caw: u32,
    pub key: u8,
    pub buffer: u32,
    pub buf_pos: BufPos,
    pub dirty: bool,
    pub unit_status: u8,
    pub chan_status: u8,
    pub chain_hold: bool,
    /// Count of 2KB pages consumed since the indirection word was last
    /// (re)loaded; used to know when IDA must fetch the next indirection
    /// word (§4.4.1 step 5, §4.4.2 "handle page-boundary reload").
    ida_pages: u32,
    is_first_ccw: bool,
    prev_was_tic: bool,
}

impl Subchannel {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.command != 0
            || self.flags & (ccw_flag::CD | ccw_flag::CC) != 0
            || self.unit_status != 0
            || self.chan_status != 0
    }

    fn clear(&mut self) {
        *self = Self {
            device_addr: self.device_addr,
            ..Default::default()
        };
    }

    fn data_pointer(&self) -> u32 {
        if self.flags & ccw_flag::IDA != 0 {
            self.indirect_address
        } else {
            self.address
        }
    }
}

/// One physical channel: its type, device table, and subchannels (§3.4).
pub struct ChannelState {
    pub kind: ChannelType,
    pub enabled: bool,
    pub nsubchan: usize,
    /// Which of the 256 possible device slots on this channel have an
    /// attached device (presence only — the device object itself lives in
    /// the caller's [`DeviceTable`]).
    pub devtab: [bool; 256],
    /// Pending asynchronous unit-status per device slot, for devices that
    /// are not bound to an active subchannel (e.g. "tape now ready").
    pub devstatus: [u8; 256],
    pub subchan: Vec<Subchannel>,
}

impl ChannelState {
    #[must_use]
    pub fn new(kind: ChannelType, nsubchan: usize) -> Self {
        Self {
            kind,
            enabled: kind != ChannelType::Disabled,
            nsubchan,
            devtab: [false; 256],
            devstatus: [0; 256],
            subchan: vec![Subchannel::default(); nsubchan.max(1)],
        }
    }

    fn subchannel_index(&self, devnum: u16) -> Option<usize> {
        let slot = device_slot(devnum);
        match self.kind {
            ChannelType::Disabled => None,
            ChannelType::Selector => Some(0),
            ChannelType::Multiplexer => {
                if slot < self.nsubchan {
                    Some(slot)
                } else {
                    None
                }
            }
            ChannelType::BlockMultiplexer => {
                let idx = (slot >> 3) & 0x1F;
                if idx < self.nsubchan {
                    Some(idx)
                } else {
                    None
                }
            }
        }
    }
}

#[must_use]
fn channel_num(devnum: u16) -> usize {
    usize::from((devnum >> 8) & 0x0F)
}

#[must_use]
fn device_slot(devnum: u16) -> usize {
    usize::from(devnum & 0xFF)
}

/// Resolves a 12-bit device number to a [`Device`] implementation. The
/// caller (a top-level system context) owns both the devices and this
/// lookup; the channel subsystem only ever sees devices through it.
pub trait DeviceTable {
    fn device_mut(&mut self, devnum: u16) -> Option<&mut dyn Device>;
}

/// The full channel subsystem: all physical channels and the global IRQ
/// latch (§4.4).
pub struct ChannelSubsystem {
    pub channels: Vec<ChannelState>,
    irq_pending: bool,
    ipl_loading: Option<u16>,
}

impl Default for ChannelSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelSubsystem {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: (0..16).map(|_| ChannelState::new(ChannelType::Disabled, 0)).collect(),
            irq_pending: false,
            ipl_loading: None,
        }
    }

    /// Configure channel `chan` (0-15) with a type and subchannel count,
    /// and mark `devnum` present on it. Configuration-time registration
    /// (§6.1/§6.2); not itself part of the CPU-facing operation set.
    pub fn attach(&mut self, devnum: u16, kind: ChannelType, nsubchan: usize) {
        let idx = channel_num(devnum);
        let chan = &mut self.channels[idx];
        if chan.kind == ChannelType::Disabled {
            *chan = ChannelState::new(kind, nsubchan);
        }
        chan.devtab[device_slot(devnum)] = true;
    }

    fn csw_bytes(key: u8, addr: u32, unit_status: u8, chan_status: u8, count: u16) -> (u32, u32) {
        let w1 = (u32::from(key) << 28) | (addr & 0x00FF_FFFF);
        let w2 = (u32::from(unit_status) << 24) | (u32::from(chan_status) << 16) | u32::from(count);
        (w1, w2)
    }

    fn store_csw(store: &mut MainStore, sc: &Subchannel) {
        let (w1, w2) = Self::csw_bytes(sc.key, sc.caw, sc.unit_status, sc.chan_status, sc.count);
        let _ = store.put_word(lowmem::CSW, w1);
        let _ = store.put_word(lowmem::CSW + 4, w2);
    }

    fn store_attn_csw(store: &mut MainStore, unit_status: u8) {
        let _ = store.put_word(lowmem::CSW, 0);
        let _ = store.put_word(lowmem::CSW + 4, u32::from(unit_status) << 24);
    }

    fn set_irq(&mut self) {
        self.irq_pending = true;
    }

    // -----------------------------------------------------------------
    // CPU-facing operations (§4.4 "CPU-facing operations")
    // -----------------------------------------------------------------

    /// `StartIO(devnum)` (§4.4, §4.4.1).
    pub fn start_io(&mut self, devnum: u16, store: &mut MainStore, devices: &mut dyn DeviceTable) -> u8 {
        let chan_idx = channel_num(devnum);
        let slot = device_slot(devnum);
        if chan_idx >= self.channels.len() {
            return 3;
        }
        if !self.channels[chan_idx].enabled || !self.channels[chan_idx].devtab[slot] {
            return 3;
        }
        let Some(sc_idx) = self.channels[chan_idx].subchannel_index(devnum) else {
            return 3;
        };
        if self.channels[chan_idx].subchan[sc_idx].is_active() {
            if self.channels[chan_idx].subchan[sc_idx].unit_status != 0
                || self.channels[chan_idx].subchan[sc_idx].chan_status != 0
            {
                Self::store_csw(store, &self.channels[chan_idx].subchan[sc_idx]);
                self.channels[chan_idx].subchan[sc_idx].clear();
                return 1;
            }
            return 2;
        }

        let Some(dev) = devices.device_mut(devnum) else {
            return 3;
        };
        let probe = dev.start_io();
        if probe != 0 {
            let sc = &mut self.channels[chan_idx].subchan[sc_idx];
            sc.device_addr = devnum;
            sc.unit_status = probe;
            Self::store_csw(store, sc);
            sc.clear();
            self.set_irq();
            return 1;
        }

        // Read the CAW (§4.4.1): high 4 bits = channel-program key, rest =
        // first CCW address.
        let caw_word = match store.get_word(lowmem::CAW) {
            Ok(w) => w,
            Err(_) => return 3,
        };
        let key = ((caw_word >> 24) & 0x0F) as u8;
        let first_ccw_addr = caw_word & 0x00FF_FFFF;

        {
            let sc = &mut self.channels[chan_idx].subchan[sc_idx];
            sc.device_addr = devnum;
            sc.key = key;
            sc.caw = first_ccw_addr;
            sc.is_first_ccw = true;
            sc.prev_was_tic = false;
        }

        self.run_chain(chan_idx, sc_idx, devnum, store, devices)
    }

    /// Execute CCWs starting from the subchannel's current `caw` until
    /// the chain blocks (async), completes with an error, or the initial
    /// fetch itself faults. Returns the condition code `StartIO` reports.
    fn run_chain(
        &mut self,
        chan_idx: usize,
        sc_idx: usize,
        devnum: u16,
        store: &mut MainStore,
        devices: &mut dyn DeviceTable,
    ) -> u8 {
        loop {
            let caw = self.channels[chan_idx].subchan[sc_idx].caw;
            if caw & 0x07 != 0 {
                return self.fail_program_check(chan_idx, sc_idx, store);
            }
            let w1 = match store.get_word(caw) {
                Ok(w) => w,
                Err(_) => return self.fail_program_check(chan_idx, sc_idx, store),
            };
            let w2 = match store.get_word(caw + 4) {
                Ok(w) => w,
                Err(_) => return self.fail_program_check(chan_idx, sc_idx, store),
            };
            let bytes = [
                (w1 >> 24) as u8,
                (w1 >> 16) as u8,
                (w1 >> 8) as u8,
                w1 as u8,
                (w2 >> 24) as u8,
                (w2 >> 16) as u8,
                (w2 >> 8) as u8,
                w2 as u8,
            ];
            let ccw = Ccw::from_bytes(bytes);

            if ccw.cmd == CMD_TIC {
                let sc = &self.channels[chan_idx].subchan[sc_idx];
                if sc.is_first_ccw || sc.prev_was_tic {
                    return self.fail_program_check(chan_idx, sc_idx, store);
                }
                let sc = &mut self.channels[chan_idx].subchan[sc_idx];
                sc.caw = ccw.address;
                sc.prev_was_tic = true;
                continue;
            }

            {
                let sc = &mut self.channels[chan_idx].subchan[sc_idx];
                sc.command = ccw.cmd;
                sc.flags = ccw.flags;
                sc.count = ccw.count;
                sc.address = ccw.address;
                sc.caw = caw.wrapping_add(8);
                sc.is_first_ccw = false;
                sc.prev_was_tic = false;
                sc.buf_pos = BufPos::Empty;
                sc.dirty = false;
                sc.ida_pages = 0;
            }

            if ccw.count == 0 {
                return self.fail_program_check(chan_idx, sc_idx, store);
            }

            if ccw.flags & ccw_flag::IDA != 0 {
                let ind = match store.get_word(ccw.address) {
                    Ok(w) => w,
                    Err(_) => return self.fail_program_check(chan_idx, sc_idx, store),
                };
                self.channels[chan_idx].subchan[sc_idx].indirect_address = ind & 0x00FF_FFFF;
            }

            let Some(dev) = devices.device_mut(devnum) else {
                return self.fail_program_check(chan_idx, sc_idx, store);
            };
            let ret = dev.start_cmd(ccw.cmd);

            if ret & status::BUSY != 0 {
                let sc = &mut self.channels[chan_idx].subchan[sc_idx];
                if !sc.is_first_ccw || sc.flags & ccw_flag::CC != 0 {
                    sc.chain_hold = true;
                    return 0;
                }
                sc.clear();
                return 2;
            }

            if ret & status::ERROR_MASK != 0 {
                let sc = &mut self.channels[chan_idx].subchan[sc_idx];
                sc.unit_status |= ret;
                Self::store_csw(store, sc);
                sc.clear();
                self.set_irq();
                return 1;
            }

            if ccw.flags & ccw_flag::PCI != 0 {
                self.channels[chan_idx].subchan[sc_idx].chan_status |= chan_status::PCI;
                self.set_irq();
            }

            if ret & status::CHNEND_DEVEND == status::CHNEND_DEVEND {
                let sc = &mut self.channels[chan_idx].subchan[sc_idx];
                sc.unit_status |= ret;
                if sc.flags & ccw_flag::CC != 0 {
                    continue;
                }
                self.set_irq();
                return 0;
            }

            // ret == 0: device will progress asynchronously via the
            // scheduler, pumping bytes through Chan*Byte and eventually
            // calling ChanEnd.
            return 0;
        }
    }

    fn fail_program_check(&mut self, chan_idx: usize, sc_idx: usize, store: &mut MainStore) -> u8 {
        let sc = &mut self.channels[chan_idx].subchan[sc_idx];
        sc.chan_status |= chan_status::PROGRAM_CHECK;
        Self::store_csw(store, sc);
        sc.clear();
        self.set_irq();
        1
    }

    /// `TestIO(devnum)` (§4.4).
    pub fn test_io(&mut self, devnum: u16, store: &mut MainStore, devices: &mut dyn DeviceTable) -> u8 {
        let chan_idx = channel_num(devnum);
        let slot = device_slot(devnum);
        if chan_idx >= self.channels.len() || !self.channels[chan_idx].enabled || !self.channels[chan_idx].devtab[slot] {
            return 3;
        }
        let Some(sc_idx) = self.channels[chan_idx].subchannel_index(devnum) else {
            return 3;
        };
        let sc = &self.channels[chan_idx].subchan[sc_idx];
        if sc.unit_status != 0 || sc.chan_status != 0 {
            Self::store_csw(store, sc);
            self.channels[chan_idx].subchan[sc_idx].clear();
            return 1;
        }
        if sc.is_active() {
            return 2;
        }
        if self.channels[chan_idx].devstatus[slot] != 0 {
            self.set_irq();
            return 2;
        }
        let Some(dev) = devices.device_mut(devnum) else {
            return 3;
        };
        let probe = dev.start_io();
        if probe == 0 {
            0
        } else if probe & status::BUSY != 0 {
            2
        } else {
            let sc = &mut self.channels[chan_idx].subchan[sc_idx];
            sc.device_addr = devnum;
            sc.unit_status = probe;
            Self::store_csw(store, sc);
            sc.clear();
            1
        }
    }

    /// `HaltIO(devnum)` (§4.4).
    pub fn halt_io(&mut self, devnum: u16, devices: &mut dyn DeviceTable) -> u8 {
        let chan_idx = channel_num(devnum);
        if chan_idx >= self.channels.len() {
            return 3;
        }
        let Some(sc_idx) = self.channels[chan_idx].subchannel_index(devnum) else {
            return 3;
        };
        let was_active = self.channels[chan_idx].subchan[sc_idx].is_active();
        if was_active {
            let sc = &mut self.channels[chan_idx].subchan[sc_idx];
            sc.buf_pos = BufPos::ChanEnd;
            sc.flags &= !(ccw_flag::CC | ccw_flag::CD);
            sc.chain_hold = false;
        }
        if let Some(dev) = devices.device_mut(devnum) {
            return dev.halt_io();
        }
        if was_active {
            0
        } else {
            3
        }
    }

    /// `TestChan(channel)` (§4.4).
    pub fn test_chan(&self, channel: u8) -> u8 {
        let idx = usize::from(channel & 0x0F);
        let Some(chan) = self.channels.get(idx) else {
            return 3;
        };
        if chan.kind == ChannelType::Disabled || !chan.enabled {
            return 3;
        }
        if chan.subchan.iter().any(|sc| sc.unit_status != 0 || sc.chan_status != 0) {
            return 1;
        }
        if chan.kind == ChannelType::Selector && chan.subchan[0].is_active() {
            return 2;
        }
        0
    }

    /// `Chan_scan(mask, irq_enable)` (§4.4.3).
    pub fn chan_scan(&mut self, sys_mask: u16, irq_enable: bool, store: &mut MainStore) -> Option<u16> {
        if !self.irq_pending {
            return None;
        }

        for chan_idx in 0..self.channels.len() {
            if sys_mask & (1 << chan_idx) == 0 {
                continue;
            }
            if let Some(ipl_dev) = self.ipl_loading {
                if channel_num(ipl_dev) != chan_idx {
                    continue;
                }
            }
            let chan = &self.channels[chan_idx];
            if !chan.enabled {
                continue;
            }
            for sc_idx in 0..chan.subchan.len() {
                let sc = &self.channels[chan_idx].subchan[sc_idx];
                let pci_ready = sc.chan_status & chan_status::PCI != 0 && irq_enable;
                let dend_ready = sc.unit_status & status::DEVICE_END != 0 && sc.flags & ccw_flag::CC == 0;
                let hold_ready = sc.chain_hold && sc.unit_status & status::DEVICE_END != 0;
                if pci_ready || dend_ready || hold_ready || sc.unit_status != 0 || sc.chan_status != 0 {
                    let devnum = self.channels[chan_idx].subchan[sc_idx].device_addr;
                    Self::store_csw(store, &self.channels[chan_idx].subchan[sc_idx]);
                    self.channels[chan_idx].subchan[sc_idx].clear();
                    self.recompute_irq_pending();
                    if self.ipl_loading == Some(devnum) {
                        self.ipl_loading = None;
                    }
                    return Some(devnum);
                }
            }
        }

        if self.ipl_loading.is_none() {
            for chan_idx in 0..self.channels.len() {
                if sys_mask & (1 << chan_idx) == 0 {
                    continue;
                }
                for slot in 0..256 {
                    if self.channels[chan_idx].devstatus[slot] != 0 {
                        let unit_status = self.channels[chan_idx].devstatus[slot];
                        self.channels[chan_idx].devstatus[slot] = 0;
                        Self::store_attn_csw(store, unit_status);
                        let devnum = ((chan_idx as u16) << 8) | slot as u16;
                        self.recompute_irq_pending();
                        return Some(devnum);
                    }
                }
            }
        }

        self.recompute_irq_pending();
        None
    }

    fn recompute_irq_pending(&mut self) {
        self.irq_pending = self.channels.iter().any(|c| {
            c.subchan.iter().any(|sc| sc.unit_status != 0 || sc.chan_status != 0)
                || c.devstatus.iter().any(|&s| s != 0)
        });
    }

    // -----------------------------------------------------------------
    // Device-facing operations (§4.4.2)
    // -----------------------------------------------------------------

    /// `ChanReadByte(devnum)`: a device pulls the next byte to write out,
    /// for write-family CCWs (memory -> channel -> device). Returns
    /// `(byte, is_last)`.
    pub fn chan_read_byte(&mut self, devnum: u16, store: &mut MainStore) -> (u8, bool) {
        let Some((chan_idx, sc_idx)) = self.locate(devnum) else {
            return (0, true);
        };
        if self.channels[chan_idx].subchan[sc_idx].chan_status != 0 {
            return (0, true);
        }
        if classify(self.channels[chan_idx].subchan[sc_idx].command) != CmdType::Write {
            return (0, true);
        }

        if self.channels[chan_idx].subchan[sc_idx].count == 0 {
            if self.channels[chan_idx].subchan[sc_idx].flags & ccw_flag::CD != 0 {
                if !self.chain_next_ccw(chan_idx, sc_idx, store) {
                    return (0, true);
                }
            } else {
                self.channels[chan_idx].subchan[sc_idx].unit_status |= status::CHANNEL_END;
                return (0, true);
            }
        }

        let sc = &mut self.channels[chan_idx].subchan[sc_idx];
        if matches!(sc.buf_pos, BufPos::Empty) {
            let ptr = sc.data_pointer();
            match store.get_word(ptr & !0x3) {
                Ok(w) => {
                    sc.buffer = w;
                    sc.buf_pos = BufPos::Pos((ptr & 0x3) as u8);
                }
                Err(_) => {
                    sc.chan_status |= chan_status::CHAN_DATA_CHECK;
                    sc.unit_status |= status::CHANNEL_END;
                    return (0, true);
                }
            }
        }

        let Some(pos) = (match sc.buf_pos {
            BufPos::Pos(p) => Some(p),
            _ => None,
        }) else {
            return (0, true);
        };
        let byte = (sc.buffer >> (8 * (3 - pos))) as u8;
        sc.count -= 1;
        self.advance_pointer(chan_idx, sc_idx, pos);

        let sc = &self.channels[chan_idx].subchan[sc_idx];
        let is_last = sc.count == 0 && sc.flags & ccw_flag::CD == 0;
        (byte, is_last)
    }

    /// `ChanWriteByte(devnum, byte)`: a device pushes the next byte read
    /// in, for read-family CCWs (device -> channel -> memory). Returns
    /// whether this was the last byte exchanged.
    pub fn chan_write_byte(&mut self, devnum: u16, byte: u8, store: &mut MainStore) -> bool {
        let Some((chan_idx, sc_idx)) = self.locate(devnum) else {
            return true;
        };
        if self.channels[chan_idx].subchan[sc_idx].chan_status != 0 {
            return true;
        }
        let cmd = self.channels[chan_idx].subchan[sc_idx].command;
        if classify(cmd) != CmdType::Read && !is_read_backward(cmd) {
            return true;
        }

        if self.channels[chan_idx].subchan[sc_idx].count == 0 {
            if self.channels[chan_idx].subchan[sc_idx].flags & ccw_flag::CD != 0 {
                if !self.chain_next_ccw(chan_idx, sc_idx, store) {
                    return true;
                }
            } else {
                self.channels[chan_idx].subchan[sc_idx].unit_status |= status::CHANNEL_END;
                return true;
            }
        }

        let skip = self.channels[chan_idx].subchan[sc_idx].flags & ccw_flag::SKIP != 0;
        let backward = is_read_backward(self.channels[chan_idx].subchan[sc_idx].command);

        if skip {
            self.channels[chan_idx].subchan[sc_idx].count -= 1;
            let sc = &self.channels[chan_idx].subchan[sc_idx];
            return sc.count == 0 && sc.flags & ccw_flag::CD == 0;
        }

        let sc = &mut self.channels[chan_idx].subchan[sc_idx];
        let pos = match sc.buf_pos {
            BufPos::Pos(p) => p,
            _ => {
                sc.buffer = 0;
                if backward { 3 } else { (sc.data_pointer() & 0x3) as u8 }
            }
        };
        let shift = 8 * (3 - pos);
        sc.buffer = (sc.buffer & !(0xFF << shift)) | (u32::from(byte) << shift);
        sc.dirty = true;
        sc.buf_pos = BufPos::Pos(pos);
        sc.count -= 1;

        let flush_now = backward && pos == 0 || !backward && pos == 3;
        if flush_now {
            self.flush_buffer(chan_idx, sc_idx, store);
        }
        self.advance_pointer(chan_idx, sc_idx, pos);

        let sc = &self.channels[chan_idx].subchan[sc_idx];
        let is_last = sc.count == 0 && sc.flags & ccw_flag::CD == 0;
        if is_last && sc.dirty {
            self.flush_buffer(chan_idx, sc_idx, store);
        }
        is_last
    }

    fn flush_buffer(&mut self, chan_idx: usize, sc_idx: usize, store: &mut MainStore) {
        let sc = &mut self.channels[chan_idx].subchan[sc_idx];
        if !sc.dirty {
            return;
        }
        let ptr = sc.data_pointer();
        let aligned = ptr & !0x3;
        let mask: u8 = match sc.buf_pos {
            BufPos::Pos(p) => 0x08 >> p,
            _ => 0x0F,
        };
        // A partial-word flush (mid-transfer on a chain boundary) writes
        // just the bytes touched so far; a full word writes all four.
        let mask = if sc.count == 0 || sc.flags & ccw_flag::CD == 0 {
            0x0F
        } else {
            mask | (mask.wrapping_sub(1) & 0x0F)
        };
        let _ = store.put_word_mask(aligned, sc.buffer, mask);
        sc.dirty = false;
        sc.buf_pos = BufPos::Empty;
    }

    fn advance_pointer(&mut self, chan_idx: usize, sc_idx: usize, pos: u8) {
        let sc = &mut self.channels[chan_idx].subchan[sc_idx];
        let backward = is_read_backward(sc.command);
        if backward {
            if pos == 0 {
                sc.buf_pos = BufPos::Empty;
                self.step_data_pointer(chan_idx, sc_idx, -4);
            } else {
                sc.buf_pos = BufPos::Pos(pos - 1);
            }
        } else if pos == 3 {
            sc.buf_pos = BufPos::Empty;
            self.step_data_pointer(chan_idx, sc_idx, 4);
        } else {
            sc.buf_pos = BufPos::Pos(pos + 1);
        }
    }

    fn step_data_pointer(&mut self, chan_idx: usize, sc_idx: usize, delta: i64) {
        let sc = &mut self.channels[chan_idx].subchan[sc_idx];
        if sc.flags & ccw_flag::IDA != 0 {
            let next = (i64::from(sc.indirect_address) + delta) as u32 & 0x00FF_FFFF;
            let crossed_page = next / crate::store::KEY_BLOCK_SIZE != sc.indirect_address / crate::store::KEY_BLOCK_SIZE;
            sc.indirect_address = next;
            if crossed_page {
                sc.ida_pages += 1;
            }
        } else {
            sc.address = (i64::from(sc.address) + delta) as u32 & 0x00FF_FFFF;
        }
    }

    /// Chain to the next CCW for a data-chained (CD) transfer. Returns
    /// false if the next CCW is invalid (ends the transfer with an
    /// error rather than continuing).
    fn chain_next_ccw(&mut self, chan_idx: usize, sc_idx: usize, store: &mut MainStore) -> bool {
        let caw = self.channels[chan_idx].subchan[sc_idx].caw;
        if caw & 0x07 != 0 {
            self.channels[chan_idx].subchan[sc_idx].chan_status |= chan_status::PROGRAM_CHECK;
            return false;
        }
        let (Ok(w1), Ok(w2)) = (store.get_word(caw), store.get_word(caw + 4)) else {
            self.channels[chan_idx].subchan[sc_idx].chan_status |= chan_status::PROGRAM_CHECK;
            return false;
        };
        let bytes = [
            (w1 >> 24) as u8,
            (w1 >> 16) as u8,
            (w1 >> 8) as u8,
            w1 as u8,
            (w2 >> 24) as u8,
            (w2 >> 16) as u8,
            (w2 >> 8) as u8,
            w2 as u8,
        ];
        let ccw = Ccw::from_bytes(bytes);
        if ccw.cmd == CMD_TIC {
            self.channels[chan_idx].subchan[sc_idx].chan_status |= chan_status::PROGRAM_CHECK;
            return false;
        }
        let sc = &mut self.channels[chan_idx].subchan[sc_idx];
        sc.flags = ccw.flags;
        sc.count = ccw.count;
        sc.address = ccw.address;
        sc.caw = caw.wrapping_add(8);
        sc.buf_pos = BufPos::Empty;
        true
    }

    fn locate(&self, devnum: u16) -> Option<(usize, usize)> {
        let chan_idx = channel_num(devnum);
        let chan = self.channels.get(chan_idx)?;
        let sc_idx = chan.subchannel_index(devnum)?;
        Some((chan_idx, sc_idx))
    }

    // -----------------------------------------------------------------
    // Callbacks devices invoke on themselves (§4.3, §4.4.2)
    // -----------------------------------------------------------------

    /// A device reports command completion (`ChanEnd(addr, flags)`).
    pub fn chan_end(&mut self, devnum: u16, flags: u8, store: &mut MainStore) {
        let Some((chan_idx, sc_idx)) = self.locate(devnum) else {
            return;
        };
        self.flush_buffer(chan_idx, sc_idx, store);
        let sc = &mut self.channels[chan_idx].subchan[sc_idx];
        sc.unit_status |= flags;
        sc.chain_hold = false;
        self.set_irq();
    }

    /// A device reports an asynchronous status change unrelated to an
    /// active command (`SetDevAttn(addr, flags)`), e.g. "tape now ready".
    pub fn set_dev_attn(&mut self, devnum: u16, flags: u8) {
        let chan_idx = channel_num(devnum);
        let slot = device_slot(devnum);
        if let Some(chan) = self.channels.get_mut(chan_idx) {
            chan.devstatus[slot] |= flags;
        }
        self.set_irq();
    }

    // -----------------------------------------------------------------
    // IPL (§4.4.4)
    // -----------------------------------------------------------------

    /// `Boot_device(devnum)`: synthesize the initial subchannel state and
    /// start the boot device's read command.
    pub fn boot_device(&mut self, devnum: u16, devices: &mut dyn DeviceTable) -> Result<(), ProgramException> {
        let chan_idx = channel_num(devnum);
        if chan_idx >= self.channels.len() {
            return Err(ProgramException::Addressing);
        }
        self.attach(devnum, self.channels[chan_idx].kind_or_selector(), self.channels[chan_idx].nsubchan.max(1));
        let Some(sc_idx) = self.channels[chan_idx].subchannel_index(devnum) else {
            return Err(ProgramException::Addressing);
        };
        {
            let sc = &mut self.channels[chan_idx].subchan[sc_idx];
            *sc = Subchannel {
                device_addr: devnum,
                command: 0x02, // read
                flags: ccw_flag::CC | ccw_flag::SLI,
                count: 24,
                address: 0,
                caw: 8,
                key: 0,
                is_first_ccw: false,
                ..Default::default()
            };
        }
        self.ipl_loading = Some(devnum);
        if let Some(dev) = devices.device_mut(devnum) {
            let ret = dev.start_cmd(0x02);
            if ret & status::CHNEND_DEVEND == status::CHNEND_DEVEND {
                self.channels[chan_idx].subchan[sc_idx].unit_status |= ret;
                self.set_irq();
            }
        }
        Ok(())
    }
}

impl ChannelState {
    fn kind_or_selector(&self) -> ChannelType {
        if self.kind == ChannelType::Disabled {
            ChannelType::Selector
        } else {
            self.kind
        }
    }
}

impl DeviceTable for std::collections::HashMap<u16, Box<dyn Device>> {
    fn device_mut(&mut self, devnum: u16) -> Option<&mut dyn Device> {
        self.get_mut(&devnum).map(std::convert::AsMut::as_mut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A FIFO byte-buffer device, grounded on `nec-upd765`'s
    /// command/result-buffer state machine, used only to drive the
    /// channel subsystem in tests.
    struct TestDevice {
        read_data: Vec<u8>,
        read_pos: usize,
        written: Vec<u8>,
        sense_byte: u8,
    }

    impl TestDevice {
        fn new(read_data: Vec<u8>) -> Self {
            Self {
                read_data,
                read_pos: 0,
                written: Vec::new(),
                sense_byte: 0,
            }
        }
    }

    impl Device for TestDevice {
        fn start_io(&mut self) -> u8 {
            0
        }

        fn start_cmd(&mut self, cmd: u8) -> u8 {
            match classify(cmd) {
                CmdType::Read => 0, // async: pumped via chan_write_byte by the test harness
                CmdType::Write => 0,
                CmdType::Sense => 0,
                _ => status::CHNEND_DEVEND,
            }
        }

        fn halt_io(&mut self) -> u8 {
            0
        }

        fn init_dev(&mut self) -> u8 {
            0
        }
    }

    fn pump_read(chan: &mut ChannelSubsystem, devnum: u16, store: &mut MainStore, data: &[u8]) {
        for &b in data {
            let last = chan.chan_write_byte(devnum, b, store);
            if last {
                break;
            }
        }
        chan.chan_end(devnum, status::CHNEND_DEVEND, store);
    }

    #[test]
    fn sio_read_transfers_bytes_into_memory() {
        let mut store = MainStore::new(4096);
        let mut chan = ChannelSubsystem::new();
        chan.attach(0x00F, ChannelType::Selector, 1);
        let mut devices: HashMap<u16, Box<dyn Device>> = HashMap::new();
        devices.insert(0x00F, Box::new(TestDevice::new(vec![])));

        store.put_word(lowmem::CAW, 0x0000_0500).unwrap();
        let data: [u8; 8] = [0x02, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x10];
        let w1 = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let w2 = u32::from_be_bytes(data[4..8].try_into().unwrap());
        store.put_word(0x500, w1).unwrap();
        store.put_word(0x504, w2).unwrap();

        let cc = chan.start_io(0x00F, &mut store, &mut devices);
        assert_eq!(cc, 0);

        let payload: Vec<u8> = (0xF0..=0xFF).collect();
        pump_read(&mut chan, 0x00F, &mut store, &payload);

        for (i, expected) in payload.iter().enumerate() {
            let w = store.get_word((0x600 + (i as u32 / 4) * 4) & !0x3).unwrap();
            let shift = 8 * (3 - (0x600 + i as u32) % 4);
            let got = (w >> shift) as u8;
            assert_eq!(got, *expected, "byte {i}");
        }

        let devnum = chan.chan_scan(0xFFFF, true, &mut store).expect("io interrupt pending");
        assert_eq!(devnum, 0x00F);
        let csw1 = store.get_word(lowmem::CSW).unwrap();
        let csw2 = store.get_word(lowmem::CSW + 4).unwrap();
        assert_eq!(csw1, 0x0000_0508);
        assert_eq!(csw2 & 0xFFFF_0000, 0x0C00_0000);
    }

    #[test]
    fn sio_zero_count_is_program_check() {
        let mut store = MainStore::new(4096);
        let mut chan = ChannelSubsystem::new();
        chan.attach(0x00F, ChannelType::Selector, 1);
        let mut devices: HashMap<u16, Box<dyn Device>> = HashMap::new();
        devices.insert(0x00F, Box::new(TestDevice::new(vec![])));

        store.put_word(lowmem::CAW, 0x0000_0500).unwrap();
        store.put_word(0x500, 0x0200_0600).unwrap();
        store.put_word(0x504, 0x0000_0000).unwrap(); // count = 0

        let cc = chan.start_io(0x00F, &mut store, &mut devices);
        assert_eq!(cc, 1);
        let csw2 = store.get_word(lowmem::CSW + 4).unwrap();
        assert_eq!((csw2 >> 16) & 0xFF, chan_status::PROGRAM_CHECK as u32);
    }

    #[test]
    fn tic_as_first_ccw_is_program_check() {
        let mut store = MainStore::new(4096);
        let mut chan = ChannelSubsystem::new();
        chan.attach(0x00F, ChannelType::Selector, 1);
        let mut devices: HashMap<u16, Box<dyn Device>> = HashMap::new();
        devices.insert(0x00F, Box::new(TestDevice::new(vec![])));

        store.put_word(lowmem::CAW, 0x0000_0500).unwrap();
        store.put_word(0x500, 0x0800_0000).unwrap(); // TIC
        store.put_word(0x504, 0x0000_0001).unwrap();

        let cc = chan.start_io(0x00F, &mut store, &mut devices);
        assert_eq!(cc, 1);
    }

    #[test]
    fn test_io_reports_pending_status() {
        let mut store = MainStore::new(4096);
        let mut chan = ChannelSubsystem::new();
        chan.attach(0x00F, ChannelType::Selector, 1);
        let mut devices: HashMap<u16, Box<dyn Device>> = HashMap::new();
        devices.insert(0x00F, Box::new(TestDevice::new(vec![])));

        chan.set_dev_attn(0x00F, status::ATTENTION);
        let cc = chan.test_io(0x00F, &mut store, &mut devices);
        assert_eq!(cc, 2);
    }

    #[test]
    fn absent_device_returns_cc3() {
        let mut store = MainStore::new(4096);
        let mut chan = ChannelSubsystem::new();
        let mut devices: HashMap<u16, Box<dyn Device>> = HashMap::new();
        assert_eq!(chan.start_io(0x123, &mut store, &mut devices), 3);
        assert_eq!(chan.test_io(0x123, &mut store, &mut devices), 3);
        assert_eq!(chan.test_chan(1), 3);
    }
}
