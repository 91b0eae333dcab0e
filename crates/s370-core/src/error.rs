//! The S/370 program-interruption taxonomy (§7).
//!
//! Every CPU opcode handler and every memory operation reports failure by
//! value as one of these, rather than unwinding: the execute loop turns a
//! nonzero return into a `suppress()` (see `s370-cpu::interrupt`), exactly
//! as the architecture's "interruption code" maps 1:1 onto this enum.

use std::fmt;

/// A program-interruption code, matching the architected interruption-code
/// values stored in the low byte of the program old PSW's interruption
/// code field (§6.3, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramException {
    Operation,
    Privilege,
    Execute,
    Protection,
    Addressing,
    Specification,
    Data,
    FixedOverflow,
    FixedDivide,
    DecimalOverflow,
    DecimalDivide,
    ExponentOverflow,
    ExponentUnderflow,
    Significance,
    FloatingDivide,
    SegmentTranslation,
    PageTranslation,
    TranslationSpecification,
    SpecialOperation,
    MonitorEvent,
}

impl ProgramException {
    /// Architected interruption-code value (PoP table, §7).
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Operation => 0x01,
            Self::Privilege => 0x02,
            Self::Execute => 0x03,
            Self::Protection => 0x04,
            Self::Addressing => 0x05,
            Self::Specification => 0x06,
            Self::Data => 0x07,
            Self::FixedOverflow => 0x08,
            Self::FixedDivide => 0x09,
            Self::DecimalOverflow => 0x0A,
            Self::DecimalDivide => 0x0B,
            Self::ExponentOverflow => 0x0C,
            Self::ExponentUnderflow => 0x0D,
            Self::Significance => 0x0E,
            Self::FloatingDivide => 0x0F,
            Self::SegmentTranslation => 0x10,
            Self::PageTranslation => 0x11,
            Self::TranslationSpecification => 0x12,
            Self::SpecialOperation => 0x13,
            Self::MonitorEvent => 0x40,
        }
    }
}

impl fmt::Display for ProgramException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} (code {:#04x})", self.code())
    }
}

impl std::error::Error for ProgramException {}

/// External-interruption sources (§7), each gated by its own
/// control-register/PSW mask bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalSource {
    IntervalTimer,
    ClockComparator,
    CpuTimer,
    ExternalSignal,
}

impl ExternalSource {
    /// Interruption code stored at the external old PSW (0x18) per PoP.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::IntervalTimer => 0x1005,
            Self::ClockComparator => 0x1004,
            Self::CpuTimer => 0x1005,
            Self::ExternalSignal => 0x0040,
        }
    }
}
