//! The Device contract (§4.3): the polymorphic interface every peripheral
//! implements. Individual peripherals (tape, card reader, disk, printer,
//! 1052 console, telnet terminal server) are out of scope (§1) — this
//! module specifies only the trait and the unit-status bits devices
//! combine into their return bytes.

/// Unit-status byte bits (CSW byte 4 / first byte of a device's return
/// value), high bit first per architecture order.
pub mod status {
    pub const ATTENTION: u8 = 0x80;
    pub const STATUS_MODIFIER: u8 = 0x40;
    pub const CONTROL_UNIT_END: u8 = 0x20;
    pub const BUSY: u8 = 0x10;
    pub const CHANNEL_END: u8 = 0x08;
    pub const DEVICE_END: u8 = 0x04;
    pub const UNIT_CHECK: u8 = 0x02;
    pub const UNIT_EXCEPTION: u8 = 0x01;

    /// Bits that indicate an immediate completion (§4.4.1 step 6).
    pub const CHNEND_DEVEND: u8 = CHANNEL_END | DEVICE_END;

    /// Bits that indicate an error/attention condition terminating the
    /// chain immediately (anything beyond plain channel/device end).
    pub const ERROR_MASK: u8 = ATTENTION | UNIT_CHECK | UNIT_EXCEPTION;
}

/// Channel-status byte bits (CSW byte 5), set by the channel itself, not
/// returned by devices.
pub mod chan_status {
    pub const PCI: u8 = 0x80;
    pub const INCORRECT_LENGTH: u8 = 0x40;
    pub const PROGRAM_CHECK: u8 = 0x20;
    pub const PROTECTION_CHECK: u8 = 0x10;
    pub const CHAN_DATA_CHECK: u8 = 0x08;
    pub const CHAN_CONTROL_CHECK: u8 = 0x04;
    pub const INTERFACE_CONTROL_CHECK: u8 = 0x02;
    pub const CHAINING_CHECK: u8 = 0x01;
}

/// Every peripheral implements this (§4.3). A device is registered on a
/// channel at a device address and is driven exclusively through these
/// four operations plus the `Chan*Byte`/`ChanEnd`/`SetDevAttn` calls the
/// channel subsystem exposes back to it (§4.4.2).
pub trait Device {
    /// Probed by `SIO` before the channel engages. Any non-zero value is
    /// returned to the CPU as the unit-status byte immediately.
    fn start_io(&mut self) -> u8;

    /// Begin executing `cmd`. The return combines [`status::BUSY`] (channel
    /// reports CC=2), error bits (immediate check), [`status::CHNEND_DEVEND`]
    /// (immediate completion), or `0` (asynchronous — the device will call
    /// back later via the scheduler to pump bytes).
    fn start_cmd(&mut self, cmd: u8) -> u8;

    /// Abort in-progress I/O. Returns the architected condition code for
    /// `HIO` (0, 1, or 2).
    fn halt_io(&mut self) -> u8;

    /// Reset to a clean, freshly-attached state.
    fn init_dev(&mut self) -> u8;
}
