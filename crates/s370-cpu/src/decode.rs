//! Instruction fetch and operand formation (§4.5.1, §4.5.3 step 2).

use s370_asm::opcodes::{self, Format};

/// A decoded instruction: every operand field any handler might need,
/// populated according to the instruction's format. Unused fields are
/// left at their default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Step {
    pub opcode: u8,
    pub r1: u8,
    pub r2: u8,
    pub r3: u8,
    /// First operand address (RX/RS base+index+disp, SI/SS base+disp).
    pub address1: u32,
    /// Second operand address (RX base+index+disp is `address1`; SS's
    /// second operand lives here).
    pub address2: u32,
    pub immediate: u8,
    /// SS length byte, or the two nibble lengths packed as `(l1<<4)|l2`.
    pub length: u8,
    pub length2: u8,
    pub ilc: u8,
}

/// Decode the instruction at `bytes[0..]` (already fetched from storage),
/// given current general-register contents for base/index formation.
/// `gpr` indexes 0-15; register 0 reads as zero in address arithmetic
/// per architecture.
#[must_use]
pub fn decode(bytes: &[u8], gpr: &[u32; 16]) -> Option<Step> {
    let opcode = *bytes.first()?;
    let fmt = opcodes::format_of(opcode)?;
    let reg = |r: u8| if r == 0 { 0 } else { gpr[r as usize] };
    let len = fmt.len();
    if bytes.len() < len as usize {
        return None;
    }
    let ilc = match fmt {
        Format::Rr => 1,
        Format::Rx | Format::Rs | Format::Si => 2,
        Format::Ss => 3,
    };

    let mnem = opcodes::mnemonic_of(opcode).unwrap_or("");

    let step = match fmt {
        Format::Rr => {
            if mnem == "SVC" {
                Step {
                    opcode,
                    immediate: bytes[1],
                    ilc,
                    ..Step::default()
                }
            } else {
                Step {
                    opcode,
                    r1: bytes[1] >> 4,
                    r2: bytes[1] & 0x0F,
                    ilc,
                    ..Step::default()
                }
            }
        }
        Format::Rx => {
            let r1 = bytes[1] >> 4;
            let x2 = bytes[1] & 0x0F;
            let b2 = bytes[2] >> 4;
            let disp = u32::from(bytes[2] & 0x0F) << 8 | u32::from(bytes[3]);
            let addr = (reg(x2).wrapping_add(reg(b2)).wrapping_add(disp)) & 0x00FF_FFFF;
            Step {
                opcode,
                r1,
                address1: addr,
                ilc,
                ..Step::default()
            }
        }
        Format::Rs => {
            let r1 = bytes[1] >> 4;
            let r3 = bytes[1] & 0x0F;
            let b2 = bytes[2] >> 4;
            let disp = u32::from(bytes[2] & 0x0F) << 8 | u32::from(bytes[3]);
            let addr = (reg(b2).wrapping_add(disp)) & 0x00FF_FFFF;
            Step {
                opcode,
                r1,
                r3,
                address1: addr,
                ilc,
                ..Step::default()
            }
        }
        Format::Si => {
            let imm = bytes[1];
            let b1 = bytes[2] >> 4;
            let disp = u32::from(bytes[2] & 0x0F) << 8 | u32::from(bytes[3]);
            let addr = (reg(b1).wrapping_add(disp)) & 0x00FF_FFFF;
            Step {
                opcode,
                address1: addr,
                immediate: imm,
                ilc,
                ..Step::default()
            }
        }
        Format::Ss => {
            let len_byte = bytes[1];
            let b1 = bytes[2] >> 4;
            let d1 = u32::from(bytes[2] & 0x0F) << 8 | u32::from(bytes[3]);
            let b2 = bytes[4] >> 4;
            let d2 = u32::from(bytes[4] & 0x0F) << 8 | u32::from(bytes[5]);
            let addr1 = (reg(b1).wrapping_add(d1)) & 0x00FF_FFFF;
            let addr2 = (reg(b2).wrapping_add(d2)) & 0x00FF_FFFF;
            Step {
                opcode,
                address1: addr1,
                address2: addr2,
                length: len_byte >> 4,
                length2: len_byte & 0x0F,
                ilc,
                ..Step::default()
            }
        }
    };
    Some(step)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rr_decodes_register_pair() {
        let gpr = [0u32; 16];
        let step = decode(&[0x18, 0x12], &gpr).unwrap();
        assert_eq!(step.r1, 1);
        assert_eq!(step.r2, 2);
        assert_eq!(step.ilc, 1);
    }

    #[test]
    fn rx_resolves_base_index_displacement() {
        let mut gpr = [0u32; 16];
        gpr[2] = 0x100;
        gpr[4] = 0x1000;
        let step = decode(&[0x58, 0x32, 0x40, 0x08], &gpr).unwrap();
        assert_eq!(step.r1, 3);
        assert_eq!(step.address1, 0x1108);
    }

    #[test]
    fn register_zero_contributes_nothing_to_address() {
        let gpr = [0xFFFF_FFFFu32; 16];
        let step = decode(&[0x58, 0x30, 0x00, 0x10], &gpr).unwrap();
        assert_eq!(step.address1, 0x10);
    }

    #[test]
    fn ss_decodes_both_addresses_and_lengths() {
        let mut gpr = [0u32; 16];
        gpr[1] = 0x2000;
        gpr[2] = 0x3000;
        let step = decode(&[0xD2, 0x07, 0x10, 0x00, 0x20, 0x10], &gpr).unwrap();
        assert_eq!(step.address1, 0x2000);
        assert_eq!(step.address2, 0x3010);
        assert_eq!(step.length, 0);
        assert_eq!(step.length2, 7);
        assert_eq!(step.ilc, 3);
    }

    #[test]
    fn svc_takes_full_second_byte_as_immediate() {
        let gpr = [0u32; 16];
        let step = decode(&[0x0A, 0xFF], &gpr).unwrap();
        assert_eq!(step.immediate, 0xFF);
    }

    #[test]
    fn unknown_opcode_returns_none() {
        let gpr = [0u32; 16];
        assert!(decode(&[0x02], &gpr).is_none());
    }
}
