//! Shared opcode byte/mnemonic table (§2, §4.5.1), consumed by both the
//! CPU's 256-entry dispatch table and the assembler/disassembler.

/// Instruction format, determining operand layout and halfword count
/// (§4.5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Rr,
    Rx,
    Rs,
    Si,
    Ss,
}

impl Format {
    /// Total instruction length in bytes.
    #[must_use]
    pub const fn len(self) -> u8 {
        match self {
            Self::Rr => 2,
            Self::Rx | Self::Rs | Self::Si => 4,
            Self::Ss => 6,
        }
    }
}

macro_rules! opcode_table {
    ($(($mnem:literal, $byte:expr, $fmt:expr)),* $(,)?) => {
        /// `(mnemonic, opcode byte, format)` for every instruction the
        /// CPU dispatch table and assembler/disassembler recognize.
        pub const TABLE: &[(&str, u8, Format)] = &[
            $(($mnem, $byte, $fmt)),*
        ];
    };
}

opcode_table! {
    // RR (0x00-0x3F)
    ("BALR", 0x05, Format::Rr), ("BCTR", 0x06, Format::Rr), ("BCR", 0x07, Format::Rr),
    ("SSK", 0x08, Format::Rr), ("ISK", 0x09, Format::Rr), ("SVC", 0x0A, Format::Rr),
    ("BASR", 0x0D, Format::Rr), ("MVCL", 0x0E, Format::Rr), ("CLCL", 0x0F, Format::Rr),
    ("LPR", 0x10, Format::Rr), ("LNR", 0x11, Format::Rr), ("LTR", 0x12, Format::Rr),
    ("LCR", 0x13, Format::Rr), ("NR", 0x14, Format::Rr), ("CLR", 0x15, Format::Rr),
    ("OR", 0x16, Format::Rr), ("XR", 0x17, Format::Rr), ("LR", 0x18, Format::Rr),
    ("CR", 0x19, Format::Rr), ("AR", 0x1A, Format::Rr), ("SR", 0x1B, Format::Rr),
    ("MR", 0x1C, Format::Rr), ("DR", 0x1D, Format::Rr), ("ALR", 0x1E, Format::Rr),
    ("SLR", 0x1F, Format::Rr), ("IPK", 0x20, Format::Rr), ("PTLB", 0x21, Format::Rr),
    ("CER", 0x29, Format::Rr), ("AER", 0x2A, Format::Rr), ("SER", 0x2B, Format::Rr),
    ("MER", 0x2C, Format::Rr), ("DER", 0x2D, Format::Rr), ("CDR", 0x31, Format::Rr),
    ("ADR", 0x32, Format::Rr), ("SDR", 0x33, Format::Rr), ("MDR", 0x34, Format::Rr),
    ("DDR", 0x35, Format::Rr), ("AXR", 0x36, Format::Rr), ("SXR", 0x37, Format::Rr),
    ("MXR", 0x38, Format::Rr), ("MXDR", 0x39, Format::Rr),

    // RX (0x40-0x7F)
    ("STH", 0x40, Format::Rx), ("LA", 0x41, Format::Rx), ("STC", 0x42, Format::Rx),
    ("IC", 0x43, Format::Rx), ("EX", 0x44, Format::Rx), ("BAL", 0x45, Format::Rx),
    ("BCT", 0x46, Format::Rx), ("BC", 0x47, Format::Rx), ("LH", 0x48, Format::Rx),
    ("CH", 0x49, Format::Rx), ("AH", 0x4A, Format::Rx), ("SH", 0x4B, Format::Rx),
    ("MH", 0x4C, Format::Rx), ("BAS", 0x4D, Format::Rx), ("CVD", 0x4E, Format::Rx),
    ("CVB", 0x4F, Format::Rx), ("ST", 0x50, Format::Rx), ("N", 0x54, Format::Rx),
    ("CL", 0x55, Format::Rx), ("O", 0x56, Format::Rx), ("X", 0x57, Format::Rx),
    ("L", 0x58, Format::Rx), ("C", 0x59, Format::Rx), ("A", 0x5A, Format::Rx),
    ("S", 0x5B, Format::Rx), ("M", 0x5C, Format::Rx), ("D", 0x5D, Format::Rx),
    ("AL", 0x5E, Format::Rx), ("SL", 0x5F, Format::Rx), ("LRA", 0x60, Format::Rx),
    ("CE", 0x69, Format::Rx), ("AE", 0x6A, Format::Rx), ("SE", 0x6B, Format::Rx),
    ("ME", 0x6C, Format::Rx), ("DE", 0x6D, Format::Rx), ("CD", 0x70, Format::Rx),
    ("AD", 0x71, Format::Rx), ("SD", 0x72, Format::Rx), ("MD", 0x73, Format::Rx),
    ("DD", 0x74, Format::Rx), ("MXD", 0x75, Format::Rx),

    // RS (0x80-0xAF)
    ("BXH", 0x80, Format::Rs), ("BXLE", 0x81, Format::Rs), ("SRL", 0x82, Format::Rs),
    ("SLL", 0x83, Format::Rs), ("SRA", 0x84, Format::Rs), ("SLA", 0x85, Format::Rs),
    ("SRDL", 0x86, Format::Rs), ("SLDL", 0x87, Format::Rs), ("SRDA", 0x88, Format::Rs),
    ("SLDA", 0x89, Format::Rs), ("STM", 0x90, Format::Rs), ("LM", 0x91, Format::Rs),
    ("ICM", 0x92, Format::Rs), ("STCM", 0x93, Format::Rs), ("DIAG", 0x94, Format::Rs),
    ("SIGP", 0x95, Format::Rs), ("LCTL", 0x96, Format::Rs), ("STCTL", 0x97, Format::Rs),
    ("CS", 0x98, Format::Rs), ("CDS", 0x99, Format::Rs), ("SIO", 0xA0, Format::Rs),
    ("TIO", 0xA1, Format::Rs), ("HIO", 0xA2, Format::Rs), ("TCH", 0xA3, Format::Rs),
    ("CLM", 0xA4, Format::Rs),

    // SI (0xB0-0xCF)
    ("SSM", 0xB0, Format::Si), ("LPSW", 0xB1, Format::Si), ("SPKA", 0xB2, Format::Si),
    ("STCK", 0xB3, Format::Si), ("SCK", 0xB4, Format::Si), ("SCKC", 0xB5, Format::Si),
    ("STCKC", 0xB6, Format::Si), ("SPT", 0xB7, Format::Si), ("STPT", 0xB8, Format::Si),
    ("STNSM", 0xB9, Format::Si), ("STOSM", 0xBA, Format::Si), ("MC", 0xBB, Format::Si),
    ("TS", 0xBC, Format::Si), ("CLI", 0xC0, Format::Si), ("NI", 0xC1, Format::Si),
    ("OI", 0xC2, Format::Si), ("XI", 0xC3, Format::Si),

    // SS (0xD0-0xFF)
    ("MVN", 0xD1, Format::Ss), ("MVC", 0xD2, Format::Ss), ("MVZ", 0xD3, Format::Ss),
    ("NC", 0xD4, Format::Ss), ("OC", 0xD5, Format::Ss), ("XC", 0xD6, Format::Ss),
    ("CLC", 0xD7, Format::Ss), ("TR", 0xDC, Format::Ss), ("TRT", 0xDD, Format::Ss),
    ("ED", 0xDE, Format::Ss), ("EDMK", 0xDF, Format::Ss), ("SRP", 0xF0, Format::Ss),
    ("MVO", 0xF1, Format::Ss), ("PACK", 0xF2, Format::Ss), ("UNPK", 0xF3, Format::Ss),
    ("ZAP", 0xF8, Format::Ss), ("CP", 0xF9, Format::Ss), ("AP", 0xFA, Format::Ss),
    ("SP", 0xFB, Format::Ss), ("MP", 0xFC, Format::Ss), ("DP", 0xFD, Format::Ss),
}

#[must_use]
pub fn mnemonic_of(byte: u8) -> Option<&'static str> {
    TABLE.iter().find(|(_, b, _)| *b == byte).map(|(m, ..)| *m)
}

#[must_use]
pub fn byte_of(mnemonic: &str) -> Option<u8> {
    let upper = mnemonic.to_ascii_uppercase();
    TABLE.iter().find(|(m, ..)| *m == upper).map(|(_, b, _)| *b)
}

#[must_use]
pub fn format_of(byte: u8) -> Option<Format> {
    TABLE.iter().find(|(_, b, _)| *b == byte).map(|(_, _, f)| *f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn opcode_bytes_are_unique() {
        let mut seen = HashSet::new();
        for (mnem, byte, _) in TABLE {
            assert!(seen.insert(*byte), "duplicate opcode byte {byte:#04x} ({mnem})");
        }
    }

    #[test]
    fn lookup_round_trips() {
        assert_eq!(byte_of("lr"), Some(0x18));
        assert_eq!(mnemonic_of(0x18), Some("LR"));
        assert_eq!(format_of(0x18), Some(Format::Rr));
        assert_eq!(format_of(0x58), Some(Format::Rx));
        assert_eq!(format_of(0xD2), Some(Format::Ss));
    }
}
