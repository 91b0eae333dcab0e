//! Opcode table, assembler and disassembler used for deposit/examine and
//! for loading test programs (§4.5.1, §4.6).

pub mod opcodes;

use opcodes::Format;

/// Mnemonics whose SS operands carry two independent lengths (packed
/// decimal instructions) rather than one shared length.
const TWO_LENGTH_SS: &[&str] = &["PACK", "UNPK", "ZAP", "MVO", "SRP"];

#[derive(Debug, PartialEq, Eq)]
pub enum AsmError {
    UnknownMnemonic(String),
    MalformedOperands(String),
    RegisterOutOfRange(String),
    DisplacementOutOfRange(i64),
}

impl std::fmt::Display for AsmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownMnemonic(m) => write!(f, "unknown mnemonic: {m}"),
            Self::MalformedOperands(line) => write!(f, "malformed operands: {line}"),
            Self::RegisterOutOfRange(r) => write!(f, "register out of range: {r}"),
            Self::DisplacementOutOfRange(d) => write!(f, "displacement out of range: {d}"),
        }
    }
}

impl std::error::Error for AsmError {}

fn parse_reg(s: &str) -> Result<u8, AsmError> {
    let s = s.trim();
    let n: u8 = s
        .parse()
        .map_err(|_| AsmError::RegisterOutOfRange(s.to_string()))?;
    if n > 15 {
        return Err(AsmError::RegisterOutOfRange(s.to_string()));
    }
    Ok(n)
}

fn parse_disp(s: &str) -> Result<u16, AsmError> {
    let s = s.trim();
    let n: i64 = if let Some(hex) = s.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).map_err(|_| AsmError::MalformedOperands(s.to_string()))?
    } else {
        s.parse()
            .map_err(|_| AsmError::MalformedOperands(s.to_string()))?
    };
    if !(0..=0x0FFF).contains(&n) {
        return Err(AsmError::DisplacementOutOfRange(n));
    }
    Ok(n as u16)
}

/// Parse a `D(X,B)` or `D(B)` storage operand.
fn parse_storage(s: &str) -> Result<(u16, u8, u8), AsmError> {
    let s = s.trim();
    let open = s.find('(').ok_or_else(|| AsmError::MalformedOperands(s.to_string()))?;
    let close = s.find(')').ok_or_else(|| AsmError::MalformedOperands(s.to_string()))?;
    let disp = parse_disp(&s[..open])?;
    let inner = &s[open + 1..close];
    if let Some((x, b)) = inner.split_once(',') {
        Ok((disp, parse_reg(x)?, parse_reg(b)?))
    } else {
        Ok((disp, 0, parse_reg(inner)?))
    }
}

/// Parse a `D(L,B)` SS storage operand, returning `(disp, length, base)`.
fn parse_storage_len(s: &str) -> Result<(u16, u8, u8), AsmError> {
    let s = s.trim();
    let open = s.find('(').ok_or_else(|| AsmError::MalformedOperands(s.to_string()))?;
    let close = s.find(')').ok_or_else(|| AsmError::MalformedOperands(s.to_string()))?;
    let disp = parse_disp(&s[..open])?;
    let inner = &s[open + 1..close];
    let (len, base) = inner
        .split_once(',')
        .ok_or_else(|| AsmError::MalformedOperands(s.to_string()))?;
    let length: u8 = len
        .trim()
        .parse()
        .map_err(|_| AsmError::MalformedOperands(s.to_string()))?;
    Ok((disp, length, parse_reg(base)?))
}

/// Parse a plain `D(B)` SS storage operand (no length field).
fn parse_storage_plain(s: &str) -> Result<(u16, u8), AsmError> {
    let s = s.trim();
    let open = s.find('(').ok_or_else(|| AsmError::MalformedOperands(s.to_string()))?;
    let close = s.find(')').ok_or_else(|| AsmError::MalformedOperands(s.to_string()))?;
    let disp = parse_disp(&s[..open])?;
    let base = parse_reg(&s[open + 1..close])?;
    Ok((disp, base))
}

fn assemble_one(line: &str) -> Result<Vec<u8>, AsmError> {
    let line = line.trim();
    let (mnem, rest) = line
        .split_once(char::is_whitespace)
        .unwrap_or((line, ""));
    let byte = opcodes::byte_of(mnem).ok_or_else(|| AsmError::UnknownMnemonic(mnem.to_string()))?;
    let fmt = opcodes::format_of(byte).expect("byte_of and format_of agree on TABLE");
    let operands: Vec<&str> = if rest.trim().is_empty() {
        Vec::new()
    } else {
        rest.split(',').collect()
    };

    match fmt {
        Format::Rr => {
            let r1 = operands.first().map(|s| parse_reg(s)).transpose()?.unwrap_or(0);
            let r2 = operands.get(1).map(|s| parse_reg(s)).transpose()?.unwrap_or(0);
            Ok(vec![byte, (r1 << 4) | r2])
        }
        Format::Rx => {
            let r1 = parse_reg(operands.first().ok_or_else(|| AsmError::MalformedOperands(line.to_string()))?)?;
            let storage = operands
                .get(1)
                .ok_or_else(|| AsmError::MalformedOperands(line.to_string()))?;
            // Re-join remaining comma-split pieces: the storage operand
            // itself may contain a comma inside its parens.
            let storage_full = operands[1..].join(",");
            let (disp, x2, b2) = parse_storage(storage_full.as_str())
                .or_else(|_| parse_storage(storage))?;
            Ok(vec![
                byte,
                (r1 << 4) | x2,
                (b2 << 4) | ((disp >> 8) as u8 & 0x0F),
                (disp & 0xFF) as u8,
            ])
        }
        Format::Rs => {
            // SIO/TIO/HIO/TCH take a single storage operand (no R1/R3);
            // everything else is R1,R3,D2(B2).
            if matches!(mnem.to_ascii_uppercase().as_str(), "SIO" | "TIO" | "HIO" | "TCH") {
                let storage_full = operands.join(",");
                let (disp, _, b2) = parse_storage(storage_full.as_str())?;
                return Ok(vec![byte, 0, (b2 << 4) | ((disp >> 8) as u8 & 0x0F), (disp & 0xFF) as u8]);
            }
            let r1 = parse_reg(operands.first().ok_or_else(|| AsmError::MalformedOperands(line.to_string()))?)?;
            let r3 = parse_reg(operands.get(1).ok_or_else(|| AsmError::MalformedOperands(line.to_string()))?)?;
            let storage_full = operands[2..].join(",");
            let (disp, _, b2) = parse_storage(storage_full.as_str())?;
            Ok(vec![byte, (r1 << 4) | r3, (b2 << 4) | ((disp >> 8) as u8 & 0x0F), (disp & 0xFF) as u8])
        }
        Format::Si => {
            let storage = operands.first().ok_or_else(|| AsmError::MalformedOperands(line.to_string()))?;
            let (disp, _, b1) = parse_storage(storage)?;
            let imm = operands.get(1).ok_or_else(|| AsmError::MalformedOperands(line.to_string()))?;
            let imm: u8 = if let Some(hex) = imm.trim().strip_prefix("0x") {
                u8::from_str_radix(hex, 16).map_err(|_| AsmError::MalformedOperands(line.to_string()))?
            } else {
                imm.trim().parse().map_err(|_| AsmError::MalformedOperands(line.to_string()))?
            };
            Ok(vec![byte, imm, (b1 << 4) | ((disp >> 8) as u8 & 0x0F), (disp & 0xFF) as u8])
        }
        Format::Ss => {
            let two_len = TWO_LENGTH_SS.contains(&mnem.to_ascii_uppercase().as_str());
            // operand 1 is always `D1(L,B1)` or `D1(L1,B1)`, which contains
            // a comma inside its parens; operand 2 is whatever remains.
            let op1 = operands
                .first()
                .ok_or_else(|| AsmError::MalformedOperands(line.to_string()))?;
            let op1_full = format!(
                "{},{}",
                op1,
                operands.get(1).copied().unwrap_or("")
            );
            let (d1, l1, b1) = parse_storage_len(op1_full.as_str())?;
            let op2_full = operands[2..].join(",");
            let (d2, l2, b2) = if two_len {
                parse_storage_len(op2_full.as_str())?
            } else {
                let (d, b) = parse_storage_plain(op2_full.as_str())?;
                (d, 0, b)
            };
            let len_byte = if two_len {
                ((l1 & 0x0F) << 4) | (l2 & 0x0F)
            } else {
                l1.saturating_sub(1) & 0xFF
            };
            Ok(vec![
                byte,
                len_byte,
                (b1 << 4) | ((d1 >> 8) as u8 & 0x0F),
                (d1 & 0xFF) as u8,
                (b2 << 4) | ((d2 >> 8) as u8 & 0x0F),
                (d2 & 0xFF) as u8,
            ])
        }
    }
}

/// Assemble newline-separated instructions into their object bytes
/// (§4.6, §8.2 round-trip law). Blank lines and `*`-prefixed comment
/// lines are skipped.
pub fn assemble(text: &str) -> Result<Vec<u8>, AsmError> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('*') {
            continue;
        }
        out.extend(assemble_one(line)?);
    }
    Ok(out)
}

fn disassemble_one(bytes: &[u8]) -> (String, u8) {
    let op = bytes[0];
    let Some(fmt) = opcodes::format_of(op) else {
        return (format!("DC X'{op:02X}'"), 1);
    };
    let mnem = opcodes::mnemonic_of(op).unwrap_or("?");
    let len = fmt.len();
    if bytes.len() < len as usize {
        return (format!("DC X'{op:02X}'"), 1);
    }
    let text = match fmt {
        Format::Rr => {
            let r1 = bytes[1] >> 4;
            let r2 = bytes[1] & 0x0F;
            format!("{mnem} {r1},{r2}")
        }
        Format::Rx => {
            let r1 = bytes[1] >> 4;
            let x2 = bytes[1] & 0x0F;
            let b2 = bytes[2] >> 4;
            let disp = (u16::from(bytes[2] & 0x0F) << 8) | u16::from(bytes[3]);
            if x2 == 0 {
                format!("{mnem} {r1},{disp}({b2})")
            } else {
                format!("{mnem} {r1},{disp}({x2},{b2})")
            }
        }
        Format::Rs => {
            let r1 = bytes[1] >> 4;
            let r3 = bytes[1] & 0x0F;
            let b2 = bytes[2] >> 4;
            let disp = (u16::from(bytes[2] & 0x0F) << 8) | u16::from(bytes[3]);
            if matches!(mnem, "SIO" | "TIO" | "HIO" | "TCH") {
                format!("{mnem} {disp}({b2})")
            } else {
                format!("{mnem} {r1},{r3},{disp}({b2})")
            }
        }
        Format::Si => {
            let imm = bytes[1];
            let b1 = bytes[2] >> 4;
            let disp = (u16::from(bytes[2] & 0x0F) << 8) | u16::from(bytes[3]);
            format!("{mnem} {disp}({b1}),{imm}")
        }
        Format::Ss => {
            let b1 = bytes[2] >> 4;
            let d1 = (u16::from(bytes[2] & 0x0F) << 8) | u16::from(bytes[3]);
            let b2 = bytes[4] >> 4;
            let d2 = (u16::from(bytes[4] & 0x0F) << 8) | u16::from(bytes[5]);
            if TWO_LENGTH_SS.contains(&mnem) {
                let l1 = bytes[1] >> 4;
                let l2 = bytes[1] & 0x0F;
                format!("{mnem} {d1}({l1},{b1}),{d2}({l2},{b2})")
            } else {
                let l = (bytes[1] as u16) + 1;
                format!("{mnem} {d1}({l},{b1}),{d2}({b2})")
            }
        }
    };
    (text, len)
}

/// Disassemble a byte stream into one mnemonic line per instruction
/// (§4.6, §8.2 round-trip law).
#[must_use]
pub fn disassemble(bytes: &[u8]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < bytes.len() {
        let (line, len) = disassemble_one(&bytes[i..]);
        out.push_str(&line);
        out.push('\n');
        i += len as usize;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rr_round_trips() {
        let bytes = assemble("LR 1,2").unwrap();
        assert_eq!(bytes, vec![0x18, 0x12]);
        assert_eq!(disassemble(&bytes).trim(), "LR 1,2");
    }

    #[test]
    fn rx_round_trips_with_and_without_index() {
        let bytes = assemble("L 3,100(2,4)").unwrap();
        assert_eq!(disassemble(&bytes).trim(), "L 3,100(2,4)");

        let bytes = assemble("L 3,100(4)").unwrap();
        assert_eq!(disassemble(&bytes).trim(), "L 3,100(4)");
    }

    #[test]
    fn si_round_trips() {
        let bytes = assemble("CLI 10(5),0x40").unwrap();
        assert_eq!(disassemble(&bytes).trim(), "CLI 10(5),64");
    }

    #[test]
    fn ss_single_length_round_trips() {
        let bytes = assemble("MVC 0(8,1),16(2)").unwrap();
        assert_eq!(disassemble(&bytes).trim(), "MVC 0(8,1),16(2)");
    }

    #[test]
    fn ss_two_length_round_trips() {
        let bytes = assemble("ZAP 0(4,1),8(3,2)").unwrap();
        assert_eq!(disassemble(&bytes).trim(), "ZAP 0(4,1),8(3,2)");
    }

    #[test]
    fn unknown_mnemonic_is_rejected() {
        assert_eq!(
            assemble("FROB 1,2"),
            Err(AsmError::UnknownMnemonic("FROB".to_string()))
        );
    }

    #[test]
    fn multi_instruction_program_assembles_in_order() {
        let bytes = assemble("LR 1,2\nAR 1,2\nBCR 15,14").unwrap();
        assert_eq!(bytes, vec![0x18, 0x12, 0x1A, 0x12, 0x07, 0xFE]);
    }
}
