//! Fixed low-memory layout (§6.3).
//!
//! All S/370 models dedicate the first 512 bytes of real storage to PSWs,
//! the CSW/CAW, interval timer, and interrupt-new-PSW slots. These never
//! move and every component that touches them references these constants
//! instead of a literal.

/// IPL-loaded PSW.
pub const IPLPSW: u32 = 0x000;
/// IPL-loaded CCW 1.
pub const IPLCCW1: u32 = 0x008;
/// IPL-loaded CCW 2.
pub const IPLCCW2: u32 = 0x010;
/// External old PSW.
pub const OEXT: u32 = 0x018;
/// SVC old PSW.
pub const OSVC: u32 = 0x020;
/// Program old PSW.
pub const OPPSW: u32 = 0x028;
/// Machine-check old PSW.
pub const OMCK: u32 = 0x030;
/// I/O old PSW.
pub const OIO: u32 = 0x038;
/// CSW (8 bytes).
pub const CSW: u32 = 0x040;
/// CAW (4 bytes).
pub const CAW: u32 = 0x048;
/// Interval timer (4 bytes, decremented by 0x100 per tick).
pub const TIMER: u32 = 0x050;
/// External new PSW.
pub const NEXT: u32 = 0x058;
/// SVC new PSW.
pub const NSVC: u32 = 0x060;
/// Program new PSW.
pub const NPPSW: u32 = 0x068;
/// Machine-check new PSW.
pub const NMCK: u32 = 0x070;
/// I/O new PSW.
pub const NIO: u32 = 0x078;
/// Diagnostic/interrupt-code area start.
pub const DIAG_AREA: u32 = 0x080;
/// Program-interrupt ILC + interruption code (EC mode).
pub const PGM_ILC_CODE: u32 = 0x08C;
/// Faulting virtual address for translation exceptions.
pub const TRANS_EXC_ADDR: u32 = 0x090;
/// PER event code.
pub const PER_CODE: u32 = 0x096;
/// PER faulting address.
pub const PER_ADDR: u32 = 0x098;
/// I/O interruption code (EC mode).
pub const IOCODE_EC: u32 = 0x0B8;

/// Offset from an interruption's old-PSW vector to its new-PSW vector.
pub const NEW_PSW_OFFSET: u32 = 0x040;
