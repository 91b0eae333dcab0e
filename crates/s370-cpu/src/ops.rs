//! Opcode handlers, grouped by instruction family (§4.5.2). Each handler
//! receives the decoded [`Step`] and returns `Ok(())` or the
//! [`ProgramException`] to suppress through.
//!
//! Floating-point registers and storage operands hold true S/370
//! hexadecimal floating-point bit patterns: a sign bit, a 7-bit
//! characteristic biased by 64, and a radix-16 fraction (6 hex digits
//! short, 14 long). `hex_decode`/`hex_encode` convert to and from `f64`
//! around the arithmetic itself, so the wire format is the real one even
//! though the arithmetic is carried out in binary underneath. Extended
//! precision approximates the register-pair operand by treating it as the
//! hi/lo halves of one long value rather than a true 128-bit hex float
//! (documented simplification, see the design ledger).

use s370_core::{ChannelSubsystem, DeviceTable, MainStore, ProgramException};

use crate::cpu::Cpu;
use crate::decode::Step;
use crate::flags;
use crate::psw::program_mask;

fn require_privileged(cpu: &Cpu) -> Result<(), ProgramException> {
    if cpu.psw.problem_state {
        Err(ProgramException::Privilege)
    } else {
        Ok(())
    }
}

fn branch_to(cpu: &mut Cpu, target: u32) {
    let target = target & 0x00FF_FFFF;
    cpu.per.note_branch(target);
    cpu.psw.pc = target;
}

fn set_gpr(cpu: &mut Cpu, r: u8, v: u32) {
    cpu.regs.set_gpr(r, v);
    cpu.per.note_gpr_write(r);
}

// ---- Fixed-point arithmetic -------------------------------------------

fn fixed_arith(
    cpu: &mut Cpu,
    dest: u8,
    a: u32,
    b: u32,
    op: impl Fn(u32, u32) -> u32,
    overflow: impl Fn(u32, u32, u32) -> bool,
) -> Result<(), ProgramException> {
    let result = op(a, b);
    let ovf = overflow(a, b, result);
    cpu.psw.cc = flags::cc_fixed(result as i32, ovf);
    set_gpr(cpu, dest, result);
    if ovf && cpu.psw.program_mask & program_mask::FIXED_OVERFLOW != 0 {
        return Err(ProgramException::FixedOverflow);
    }
    Ok(())
}

fn op_ar(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let a = cpu.regs.gpr(step.r1);
    let b = cpu.regs.gpr(step.r2);
    fixed_arith(cpu, step.r1, a, b, |x, y| x.wrapping_add(y), flags::overflow_add)
}

fn op_sr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let a = cpu.regs.gpr(step.r1);
    let b = cpu.regs.gpr(step.r2);
    fixed_arith(cpu, step.r1, a, b, |x, y| x.wrapping_sub(y), flags::overflow_sub)
}

fn op_a(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let b = cpu.read_full(step.address1, store)?;
    let a = cpu.regs.gpr(step.r1);
    fixed_arith(cpu, step.r1, a, b, |x, y| x.wrapping_add(y), flags::overflow_add)
}

fn op_s(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let b = cpu.read_full(step.address1, store)?;
    let a = cpu.regs.gpr(step.r1);
    fixed_arith(cpu, step.r1, a, b, |x, y| x.wrapping_sub(y), flags::overflow_sub)
}

fn op_ah(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let b = i32::from(cpu.read_half(step.address1, store)?) as u32;
    let a = cpu.regs.gpr(step.r1);
    fixed_arith(cpu, step.r1, a, b, |x, y| x.wrapping_add(y), flags::overflow_add)
}

fn op_sh(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let b = i32::from(cpu.read_half(step.address1, store)?) as u32;
    let a = cpu.regs.gpr(step.r1);
    fixed_arith(cpu, step.r1, a, b, |x, y| x.wrapping_sub(y), flags::overflow_sub)
}

fn logical_add(cpu: &mut Cpu, dest: u8, a: u32, b: u32) {
    let result = a.wrapping_add(b);
    let carry = flags::carry_add(a, b, result);
    cpu.psw.cc = flags::cc_logical_add(result, carry);
    set_gpr(cpu, dest, result);
}

fn op_al(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let b = cpu.read_full(step.address1, store)?;
    logical_add(cpu, step.r1, cpu.regs.gpr(step.r1), b);
    Ok(())
}

fn op_alr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    logical_add(cpu, step.r1, cpu.regs.gpr(step.r1), cpu.regs.gpr(step.r2));
    Ok(())
}

fn op_sl(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let b = cpu.read_full(step.address1, store)?;
    logical_add(cpu, step.r1, cpu.regs.gpr(step.r1), !b.wrapping_add(1));
    Ok(())
}

fn op_slr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let b = cpu.regs.gpr(step.r2);
    logical_add(cpu, step.r1, cpu.regs.gpr(step.r1), !b.wrapping_add(1));
    Ok(())
}

fn op_mr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let a = i64::from(cpu.regs.gpr(step.r1 | 1) as i32);
    let b = i64::from(cpu.regs.gpr(step.r2) as i32);
    let prod = a * b;
    set_gpr(cpu, step.r1, (prod >> 32) as u32);
    set_gpr(cpu, step.r1 | 1, prod as u32);
    Ok(())
}

fn op_m(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let a = i64::from(cpu.regs.gpr(step.r1 | 1) as i32);
    let b = i64::from(cpu.read_full(step.address1, store)? as i32);
    let prod = a * b;
    set_gpr(cpu, step.r1, (prod >> 32) as u32);
    set_gpr(cpu, step.r1 | 1, prod as u32);
    Ok(())
}

fn op_mh(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let a = i64::from(cpu.regs.gpr(step.r1) as i32);
    let b = i64::from(cpu.read_half(step.address1, store)?);
    set_gpr(cpu, step.r1, (a * b) as u32);
    Ok(())
}

fn op_dr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let dividend = (i64::from(cpu.regs.gpr(step.r1) as i32) << 32) | i64::from(cpu.regs.gpr(step.r1 | 1));
    let divisor = i64::from(cpu.regs.gpr(step.r2) as i32);
    if divisor == 0 {
        return Err(ProgramException::FixedDivide);
    }
    let quotient = dividend / divisor;
    let remainder = dividend % divisor;
    if quotient > i64::from(i32::MAX) || quotient < i64::from(i32::MIN) {
        return Err(ProgramException::FixedDivide);
    }
    set_gpr(cpu, step.r1, remainder as u32);
    set_gpr(cpu, step.r1 | 1, quotient as u32);
    Ok(())
}

fn op_d(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let dividend = (i64::from(cpu.regs.gpr(step.r1) as i32) << 32) | i64::from(cpu.regs.gpr(step.r1 | 1));
    let divisor = i64::from(cpu.read_full(step.address1, store)? as i32);
    if divisor == 0 {
        return Err(ProgramException::FixedDivide);
    }
    let quotient = dividend / divisor;
    let remainder = dividend % divisor;
    if quotient > i64::from(i32::MAX) || quotient < i64::from(i32::MIN) {
        return Err(ProgramException::FixedDivide);
    }
    set_gpr(cpu, step.r1, remainder as u32);
    set_gpr(cpu, step.r1 | 1, quotient as u32);
    Ok(())
}

fn op_lcr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let v = cpu.regs.gpr(step.r2);
    let neg = (v as i32).wrapping_neg() as u32;
    cpu.psw.cc = flags::cc_fixed(neg as i32, v == 0x8000_0000);
    set_gpr(cpu, step.r1, neg);
    Ok(())
}

fn op_lpr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let v = cpu.regs.gpr(step.r2) as i32;
    let abs = v.unsigned_abs();
    cpu.psw.cc = flags::cc_fixed(abs as i32, v == i32::MIN);
    set_gpr(cpu, step.r1, abs);
    Ok(())
}

fn op_lnr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let v = cpu.regs.gpr(step.r2) as i32;
    let neg = -(v.unsigned_abs() as i32) as u32;
    cpu.psw.cc = flags::cc_fixed(neg as i32, false);
    set_gpr(cpu, step.r1, neg);
    Ok(())
}

fn op_ltr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let v = cpu.regs.gpr(step.r2);
    cpu.psw.cc = flags::cc_fixed(v as i32, false);
    set_gpr(cpu, step.r1, v);
    Ok(())
}

// ---- Load/store ---------------------------------------------------------

fn op_lr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    set_gpr(cpu, step.r1, cpu.regs.gpr(step.r2));
    Ok(())
}

fn op_l(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let v = cpu.read_full(step.address1, store)?;
    set_gpr(cpu, step.r1, v);
    Ok(())
}

fn op_lh(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let v = i32::from(cpu.read_half(step.address1, store)?) as u32;
    set_gpr(cpu, step.r1, v);
    Ok(())
}

fn op_la(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    set_gpr(cpu, step.r1, step.address1);
    Ok(())
}

fn op_ic(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let b = cpu.read_byte(step.address1, store)?;
    let v = (cpu.regs.gpr(step.r1) & 0xFFFF_FF00) | u32::from(b);
    set_gpr(cpu, step.r1, v);
    Ok(())
}

fn op_st(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    cpu.write_full(step.address1, cpu.regs.gpr(step.r1), store)
}

fn op_sth(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    cpu.write_half(step.address1, cpu.regs.gpr(step.r1) as u16, store)
}

fn op_stc(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    cpu.write_byte(step.address1, cpu.regs.gpr(step.r1) as u8, store)
}

fn op_stm(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let mut addr = step.address1;
    let mut r = step.r1;
    loop {
        cpu.write_full(addr, cpu.regs.gpr(r), store)?;
        if r == step.r3 {
            break;
        }
        r = (r + 1) & 0x0F;
        addr = addr.wrapping_add(4) & 0x00FF_FFFF;
    }
    Ok(())
}

fn op_lm(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let mut addr = step.address1;
    let mut r = step.r1;
    loop {
        let v = cpu.read_full(addr, store)?;
        set_gpr(cpu, r, v);
        if r == step.r3 {
            break;
        }
        r = (r + 1) & 0x0F;
        addr = addr.wrapping_add(4) & 0x00FF_FFFF;
    }
    Ok(())
}

fn op_icm(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let mask = step.r3;
    if mask == 0 {
        cpu.read_byte(step.address1, store)?;
        cpu.psw.cc = 0;
        return Ok(());
    }
    let mut value = cpu.regs.gpr(step.r1);
    let mut addr = step.address1;
    let mut any_nonzero = false;
    for bit in (0..4).rev() {
        if mask & (1 << bit) != 0 {
            let b = cpu.read_byte(addr, store)?;
            any_nonzero |= b != 0;
            let shift = 8 * bit;
            value = (value & !(0xFFu32 << shift)) | (u32::from(b) << shift);
            addr = addr.wrapping_add(1) & 0x00FF_FFFF;
        }
    }
    cpu.psw.cc = u8::from(any_nonzero);
    set_gpr(cpu, step.r1, value);
    Ok(())
}

fn op_stcm(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let mask = step.r3;
    let value = cpu.regs.gpr(step.r1);
    let mut addr = step.address1;
    for bit in (0..4).rev() {
        if mask & (1 << bit) != 0 {
            let b = (value >> (8 * bit)) as u8;
            cpu.write_byte(addr, b, store)?;
            addr = addr.wrapping_add(1) & 0x00FF_FFFF;
        }
    }
    Ok(())
}

fn op_clm(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let mask = step.r3;
    let value = cpu.regs.gpr(step.r1);
    let mut addr = step.address1;
    let mut cc = 0u8;
    for bit in (0..4).rev() {
        if mask & (1 << bit) != 0 {
            let r = (value >> (8 * bit)) as u8;
            let m = cpu.read_byte(addr, store)?;
            if cc == 0 && r != m {
                cc = if r < m { 1 } else { 2 };
            }
            addr = addr.wrapping_add(1) & 0x00FF_FFFF;
        }
    }
    cpu.psw.cc = cc;
    Ok(())
}

// ---- Logical / compare ---------------------------------------------------

fn op_logical(cpu: &mut Cpu, dest: u8, a: u32, b: u32, op: impl Fn(u32, u32) -> u32) {
    let result = op(a, b);
    cpu.psw.cc = flags::cc_logical(result);
    set_gpr(cpu, dest, result);
}

fn op_c(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let b = cpu.read_full(step.address1, store)? as i32;
    cpu.psw.cc = flags::cc_compare(cpu.regs.gpr(step.r1) as i32, b);
    Ok(())
}

fn op_cr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    cpu.psw.cc = flags::cc_compare(cpu.regs.gpr(step.r1) as i32, cpu.regs.gpr(step.r2) as i32);
    Ok(())
}

fn op_ch(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let b = i32::from(cpu.read_half(step.address1, store)?);
    cpu.psw.cc = flags::cc_compare(cpu.regs.gpr(step.r1) as i32, b);
    Ok(())
}

fn op_cl(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let b = cpu.read_full(step.address1, store)?;
    cpu.psw.cc = flags::cc_compare_logical(cpu.regs.gpr(step.r1), b);
    Ok(())
}

fn op_clr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    cpu.psw.cc = flags::cc_compare_logical(cpu.regs.gpr(step.r1), cpu.regs.gpr(step.r2));
    Ok(())
}

fn op_cli(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let b = cpu.read_byte(step.address1, store)?;
    cpu.psw.cc = flags::cc_compare_logical(u32::from(step.immediate), u32::from(b));
    Ok(())
}

fn op_ni_oi_xi(cpu: &mut Cpu, step: &Step, store: &mut MainStore, op: impl Fn(u8, u8) -> u8) -> Result<(), ProgramException> {
    let b = cpu.read_byte(step.address1, store)?;
    let result = op(b, step.immediate);
    cpu.psw.cc = flags::cc_logical(u32::from(result));
    cpu.write_byte(step.address1, result, store)
}

// ---- Shift ---------------------------------------------------------------

fn shift_amount(step: &Step) -> u32 {
    step.address1 & 0x3F
}

fn op_srl(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    set_gpr(cpu, step.r1, cpu.regs.gpr(step.r1) >> shift_amount(step).min(31));
    Ok(())
}

fn op_sll(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let n = shift_amount(step);
    let v = if n >= 32 { 0 } else { cpu.regs.gpr(step.r1) << n };
    set_gpr(cpu, step.r1, v);
    Ok(())
}

fn op_sra(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let v = (cpu.regs.gpr(step.r1) as i32) >> shift_amount(step).min(31);
    cpu.psw.cc = flags::cc_fixed(v, false);
    set_gpr(cpu, step.r1, v as u32);
    Ok(())
}

fn op_sla(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let n = shift_amount(step).min(31);
    let orig = cpu.regs.gpr(step.r1) as i32;
    let v = orig.wrapping_shl(n);
    cpu.psw.cc = flags::cc_fixed(v, false);
    set_gpr(cpu, step.r1, v as u32);
    Ok(())
}

fn pair(cpu: &Cpu, r: u8) -> u64 {
    (u64::from(cpu.regs.gpr(r)) << 32) | u64::from(cpu.regs.gpr(r | 1))
}

fn set_pair(cpu: &mut Cpu, r: u8, v: u64) {
    set_gpr(cpu, r, (v >> 32) as u32);
    set_gpr(cpu, r | 1, v as u32);
}

fn op_srdl(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let n = shift_amount(step).min(63);
    set_pair(cpu, step.r1, pair(cpu, step.r1) >> n);
    Ok(())
}

fn op_sldl(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let n = shift_amount(step).min(63);
    set_pair(cpu, step.r1, pair(cpu, step.r1) << n);
    Ok(())
}

fn op_srda(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let n = shift_amount(step).min(63);
    let v = (pair(cpu, step.r1) as i64) >> n;
    cpu.psw.cc = flags::cc_fixed(v as i32, false);
    set_pair(cpu, step.r1, v as u64);
    Ok(())
}

fn op_slda(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let n = shift_amount(step).min(63);
    let v = (pair(cpu, step.r1) as i64).wrapping_shl(n);
    cpu.psw.cc = flags::cc_fixed(v as i32, false);
    set_pair(cpu, step.r1, v as u64);
    Ok(())
}

// ---- Branch ----------------------------------------------------------

fn op_bc(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let mask = step.r1;
    if mask & (0x08 >> cpu.psw.cc) != 0 {
        branch_to(cpu, step.address1);
    }
    Ok(())
}

fn op_bcr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    if step.r2 != 0 && step.r1 & (0x08 >> cpu.psw.cc) != 0 {
        branch_to(cpu, cpu.regs.gpr(step.r2));
    }
    Ok(())
}

fn op_bal(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let link = cpu.psw.pc;
    set_gpr(cpu, step.r1, link);
    branch_to(cpu, step.address1);
    Ok(())
}

fn op_balr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let link = cpu.psw.pc;
    let target = cpu.regs.gpr(step.r2);
    set_gpr(cpu, step.r1, link);
    if step.r2 != 0 {
        branch_to(cpu, target);
    }
    Ok(())
}

fn op_bct(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let v = cpu.regs.gpr(step.r1).wrapping_sub(1);
    set_gpr(cpu, step.r1, v);
    if v != 0 {
        branch_to(cpu, step.address1);
    }
    Ok(())
}

fn op_bctr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let v = cpu.regs.gpr(step.r1).wrapping_sub(1);
    set_gpr(cpu, step.r1, v);
    if step.r2 != 0 && v != 0 {
        branch_to(cpu, cpu.regs.gpr(step.r2));
    }
    Ok(())
}

fn op_bas(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    op_bal(cpu, step)
}

fn op_basr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    op_balr(cpu, step)
}

fn op_bxh(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let increment = cpu.regs.gpr(step.r3 & !1) as i32;
    let compare = cpu.regs.gpr(step.r3 | 1) as i32;
    let v = (cpu.regs.gpr(step.r1) as i32).wrapping_add(increment);
    set_gpr(cpu, step.r1, v as u32);
    if v > compare {
        branch_to(cpu, step.address1);
    }
    Ok(())
}

fn op_bxle(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    let increment = cpu.regs.gpr(step.r3 & !1) as i32;
    let compare = cpu.regs.gpr(step.r3 | 1) as i32;
    let v = (cpu.regs.gpr(step.r1) as i32).wrapping_add(increment);
    set_gpr(cpu, step.r1, v as u32);
    if v <= compare {
        branch_to(cpu, step.address1);
    }
    Ok(())
}

// ---- Memory to memory --------------------------------------------------

fn ss_len(step: &Step) -> u32 {
    u32::from(step.length2) + 1
}

fn op_mvc(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    for i in 0..ss_len(step) {
        let b = cpu.read_byte(step.address2.wrapping_add(i) & 0x00FF_FFFF, store)?;
        cpu.write_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, b, store)?;
    }
    Ok(())
}

fn op_mvn(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    for i in 0..ss_len(step) {
        let src = cpu.read_byte(step.address2.wrapping_add(i) & 0x00FF_FFFF, store)?;
        let dst = cpu.read_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, store)?;
        let merged = (dst & 0xF0) | (src & 0x0F);
        cpu.write_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, merged, store)?;
    }
    Ok(())
}

fn op_mvz(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    for i in 0..ss_len(step) {
        let src = cpu.read_byte(step.address2.wrapping_add(i) & 0x00FF_FFFF, store)?;
        let dst = cpu.read_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, store)?;
        let merged = (src & 0xF0) | (dst & 0x0F);
        cpu.write_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, merged, store)?;
    }
    Ok(())
}

fn ss_bitwise(cpu: &mut Cpu, step: &Step, store: &mut MainStore, op: impl Fn(u8, u8) -> u8) -> Result<(), ProgramException> {
    let mut acc = 0u8;
    for i in 0..ss_len(step) {
        let a = cpu.read_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, store)?;
        let b = cpu.read_byte(step.address2.wrapping_add(i) & 0x00FF_FFFF, store)?;
        let r = op(a, b);
        acc |= r;
        cpu.write_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, r, store)?;
    }
    cpu.psw.cc = flags::cc_logical(u32::from(acc));
    Ok(())
}

fn op_clc(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let mut cc = 0u8;
    for i in 0..ss_len(step) {
        let a = cpu.read_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, store)?;
        let b = cpu.read_byte(step.address2.wrapping_add(i) & 0x00FF_FFFF, store)?;
        if a != b {
            cc = if a < b { 1 } else { 2 };
            break;
        }
    }
    cpu.psw.cc = cc;
    Ok(())
}

fn op_tr(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    for i in 0..ss_len(step) {
        let b = cpu.read_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, store)?;
        let translated = cpu.read_byte(step.address2.wrapping_add(u32::from(b)) & 0x00FF_FFFF, store)?;
        cpu.write_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, translated, store)?;
    }
    Ok(())
}

fn op_trt(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    for i in 0..ss_len(step) {
        let b = cpu.read_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, store)?;
        let function = cpu.read_byte(step.address2.wrapping_add(u32::from(b)) & 0x00FF_FFFF, store)?;
        if function != 0 {
            set_gpr(cpu, 1, step.address1.wrapping_add(i) & 0x00FF_FFFF);
            set_gpr(cpu, 2, (cpu.regs.gpr(2) & 0xFFFF_FF00) | u32::from(function));
            cpu.psw.cc = if i == ss_len(step) - 1 { 2 } else { 1 };
            return Ok(());
        }
    }
    cpu.psw.cc = 0;
    Ok(())
}

fn op_ed(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let mut significant = false;
    let mut last_digit = 0u8;
    let mut any_nonzero = false;
    let mut high_nibble = true;
    let mut src = step.address2;
    for i in 0..ss_len(step) {
        let pattern = cpu.read_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, store)?;
        if pattern == 0x20 {
            let byte = cpu.read_byte(src & 0x00FF_FFFF, store)?;
            let digit = if high_nibble { byte >> 4 } else { byte & 0x0F };
            if !high_nibble {
                src = src.wrapping_add(1);
            }
            high_nibble = !high_nibble;
            if digit != 0 {
                any_nonzero = true;
            }
            let out = if significant || digit != 0 {
                significant = true;
                0x30 | digit
            } else {
                0x40 // EBCDIC space as fill
            };
            last_digit = digit;
            cpu.write_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, out, store)?;
        } else if pattern == 0x21 {
            significant = true;
            cpu.write_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, 0x40, store)?;
        } else {
            cpu.write_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, pattern, store)?;
        }
    }
    let _ = last_digit;
    cpu.psw.cc = if !any_nonzero { 0 } else { 2 };
    Ok(())
}

// ---- Decimal -------------------------------------------------------------
//
// Packed-decimal values are carried digit-by-digit (not coerced into a
// fixed-width integer) so the architected 31-digit/16-byte operand maximum
// (§4.5.2) is representable without truncation or an overflow panic.

/// A packed-decimal magnitude: digits least-significant-first, each 0-9,
/// plus a sign. Always kept trimmed (no nonzero digit beyond the last
/// entry) and canonicalized to non-negative at zero.
#[derive(Clone)]
struct Decimal {
    digits: Vec<u8>,
    negative: bool,
}

impl Decimal {
    fn zero() -> Self {
        Decimal { digits: vec![0], negative: false }
    }

    fn is_zero(&self) -> bool {
        self.digits.iter().all(|&d| d == 0)
    }
}

fn trim(digits: &mut Vec<u8>) {
    while digits.len() > 1 && *digits.last().unwrap() == 0 {
        digits.pop();
    }
}

fn magnitude_cmp(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    let len = a.len().max(b.len());
    for i in (0..len).rev() {
        let da = a.get(i).copied().unwrap_or(0);
        let db = b.get(i).copied().unwrap_or(0);
        if da != db {
            return da.cmp(&db);
        }
    }
    std::cmp::Ordering::Equal
}

fn magnitude_add(a: &[u8], b: &[u8]) -> Vec<u8> {
    let len = a.len().max(b.len());
    let mut out = Vec::with_capacity(len + 1);
    let mut carry = 0u8;
    for i in 0..len {
        let sum = a.get(i).copied().unwrap_or(0) + b.get(i).copied().unwrap_or(0) + carry;
        out.push(sum % 10);
        carry = sum / 10;
    }
    if carry > 0 {
        out.push(carry);
    }
    out
}

/// Assumes `a >= b` in magnitude.
fn magnitude_sub(a: &[u8], b: &[u8]) -> Vec<u8> {
    let len = a.len().max(b.len());
    let mut out = Vec::with_capacity(len);
    let mut borrow = 0i8;
    for i in 0..len {
        let mut diff = a.get(i).copied().unwrap_or(0) as i8 - b.get(i).copied().unwrap_or(0) as i8 - borrow;
        if diff < 0 {
            diff += 10;
            borrow = 1;
        } else {
            borrow = 0;
        }
        out.push(diff as u8);
    }
    trim(&mut out);
    out
}

fn magnitude_mul(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; a.len() + b.len() + 1];
    for (i, &da) in a.iter().enumerate() {
        let mut carry = 0u32;
        for (j, &db) in b.iter().enumerate() {
            let pos = i + j;
            let prod = u32::from(out[pos]) + u32::from(da) * u32::from(db) + carry;
            out[pos] = (prod % 10) as u8;
            carry = prod / 10;
        }
        let mut k = i + b.len();
        while carry > 0 {
            let sum = u32::from(out[k]) + carry;
            out[k] = (sum % 10) as u8;
            carry = sum / 10;
            k += 1;
        }
    }
    trim(&mut out);
    out
}

/// Long division on LSB-first digit magnitudes; returns (quotient, remainder).
fn magnitude_divmod(dividend: &[u8], divisor: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let dividend_msb: Vec<u8> = dividend.iter().rev().copied().collect();
    let mut divisor_trim = divisor.to_vec();
    trim(&mut divisor_trim);

    let mut quotient_msb = Vec::with_capacity(dividend_msb.len());
    let mut remainder: Vec<u8> = Vec::new();
    for &d in &dividend_msb {
        remainder.insert(0, d);
        trim(&mut remainder);
        let mut count = 0u8;
        while magnitude_cmp(&remainder, &divisor_trim) != std::cmp::Ordering::Less {
            remainder = magnitude_sub(&remainder, &divisor_trim);
            count += 1;
        }
        quotient_msb.push(count);
    }
    let mut quotient: Vec<u8> = quotient_msb.into_iter().rev().collect();
    trim(&mut quotient);
    trim(&mut remainder);
    (quotient, remainder)
}

fn decimal_negate(a: &Decimal) -> Decimal {
    Decimal { digits: a.digits.clone(), negative: !a.is_zero() && !a.negative }
}

fn decimal_add(a: &Decimal, b: &Decimal) -> Decimal {
    if a.negative == b.negative {
        Decimal { digits: magnitude_add(&a.digits, &b.digits), negative: a.negative }
    } else {
        match magnitude_cmp(&a.digits, &b.digits) {
            std::cmp::Ordering::Equal => Decimal::zero(),
            std::cmp::Ordering::Greater => Decimal { digits: magnitude_sub(&a.digits, &b.digits), negative: a.negative },
            std::cmp::Ordering::Less => Decimal { digits: magnitude_sub(&b.digits, &a.digits), negative: b.negative },
        }
    }
}

fn decimal_compare(a: &Decimal, b: &Decimal) -> u8 {
    if a.negative != b.negative && !(a.is_zero() && b.is_zero()) {
        return if a.negative { 1 } else { 2 };
    }
    let mag_cmp = magnitude_cmp(&a.digits, &b.digits);
    let ord = if a.negative { mag_cmp.reverse() } else { mag_cmp };
    match ord {
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Less => 1,
        std::cmp::Ordering::Greater => 2,
    }
}

fn read_packed(cpu: &mut Cpu, addr: u32, len: u32, store: &mut MainStore) -> Result<Decimal, ProgramException> {
    let mut digits = Vec::with_capacity((len * 2) as usize);
    let mut sign = 0xCu8;
    for i in 0..len {
        let b = cpu.read_byte(addr.wrapping_add(i) & 0x00FF_FFFF, store)?;
        let hi = b >> 4;
        if i + 1 == len {
            sign = b & 0x0F;
            if hi > 9 {
                return Err(ProgramException::Data);
            }
            digits.push(hi);
        } else {
            let lo = b & 0x0F;
            if hi > 9 || lo > 9 {
                return Err(ProgramException::Data);
            }
            digits.push(hi);
            digits.push(lo);
        }
    }
    digits.reverse();
    trim(&mut digits);
    let mut negative = sign == 0x0D || sign == 0x0B;
    if digits.iter().all(|&d| d == 0) {
        negative = false;
    }
    Ok(Decimal { digits, negative })
}

fn write_packed(cpu: &mut Cpu, addr: u32, len: u32, value: &Decimal, store: &mut MainStore) -> Result<(), ProgramException> {
    let sign = if value.negative { 0x0D } else { 0x0C };
    let digit_at = |pos: usize| -> u8 { value.digits.get(pos).copied().unwrap_or(0) };
    for i in 0..len {
        let idx = i as usize;
        let byte = if idx as u32 + 1 == len {
            (digit_at(0) << 4) | sign
        } else {
            let hi_pos = (2 * len as usize - 2) - 2 * idx;
            let lo_pos = hi_pos - 1;
            (digit_at(hi_pos) << 4) | digit_at(lo_pos)
        };
        cpu.write_byte(addr.wrapping_add(i) & 0x00FF_FFFF, byte, store)?;
    }
    Ok(())
}

/// True when `value` needs more digits than `len` packed bytes hold (one
/// nibble reserved for the sign, §4.5.2 decimal overflow).
fn decimal_overflow(value: &Decimal, len: u32) -> bool {
    let max_digits = (len * 2 - 1) as usize;
    value.digits.len() > max_digits
}

fn op_zap(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let value = read_packed(cpu, step.address2, u32::from(step.length2) + 1, store)?;
    let len1 = u32::from(step.length) + 1;
    let overflow = decimal_overflow(&value, len1);
    write_packed(cpu, step.address1, len1, &value, store)?;
    cpu.psw.cc = flags::cc_decimal(value.is_zero(), value.negative, overflow);
    if overflow && cpu.psw.program_mask & program_mask::DECIMAL_OVERFLOW != 0 {
        return Err(ProgramException::DecimalOverflow);
    }
    Ok(())
}

fn decimal_add_sub(cpu: &mut Cpu, step: &Step, store: &mut MainStore, negate_b: bool) -> Result<(), ProgramException> {
    let len1 = u32::from(step.length) + 1;
    let a = read_packed(cpu, step.address1, len1, store)?;
    let mut b = read_packed(cpu, step.address2, u32::from(step.length2) + 1, store)?;
    if negate_b {
        b = decimal_negate(&b);
    }
    let sum = decimal_add(&a, &b);
    let overflow = decimal_overflow(&sum, len1);
    write_packed(cpu, step.address1, len1, &sum, store)?;
    cpu.psw.cc = flags::cc_decimal(sum.is_zero(), sum.negative, overflow);
    if overflow && cpu.psw.program_mask & program_mask::DECIMAL_OVERFLOW != 0 {
        return Err(ProgramException::DecimalOverflow);
    }
    Ok(())
}

fn op_ap(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    decimal_add_sub(cpu, step, store, false)
}

fn op_sp(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    decimal_add_sub(cpu, step, store, true)
}

fn op_cp(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let a = read_packed(cpu, step.address1, u32::from(step.length) + 1, store)?;
    let b = read_packed(cpu, step.address2, u32::from(step.length2) + 1, store)?;
    cpu.psw.cc = decimal_compare(&a, &b);
    Ok(())
}

fn op_mp(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let len1 = u32::from(step.length) + 1;
    let a = read_packed(cpu, step.address1, len1, store)?;
    let b = read_packed(cpu, step.address2, u32::from(step.length2) + 1, store)?;
    let digits = magnitude_mul(&a.digits, &b.digits);
    let negative = (a.negative != b.negative) && !digits.iter().all(|&d| d == 0);
    write_packed(cpu, step.address1, len1, &Decimal { digits, negative }, store)
}

fn op_dp(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let len1 = u32::from(step.length) + 1;
    let dividend = read_packed(cpu, step.address1, len1, store)?;
    let divisor = read_packed(cpu, step.address2, u32::from(step.length2) + 1, store)?;
    if divisor.is_zero() {
        return Err(ProgramException::DecimalDivide);
    }
    let (quotient_digits, remainder_digits) = magnitude_divmod(&dividend.digits, &divisor.digits);
    let quotient_negative = (dividend.negative != divisor.negative) && !quotient_digits.iter().all(|&d| d == 0);
    let remainder_negative = dividend.negative && !remainder_digits.iter().all(|&d| d == 0);
    let divisor_len = u32::from(step.length2) + 1;
    let quotient_len = len1 - divisor_len;
    write_packed(
        cpu,
        step.address1,
        quotient_len,
        &Decimal { digits: quotient_digits, negative: quotient_negative },
        store,
    )?;
    write_packed(
        cpu,
        step.address1.wrapping_add(quotient_len) & 0x00FF_FFFF,
        divisor_len,
        &Decimal { digits: remainder_digits, negative: remainder_negative },
        store,
    )
}

fn op_pack(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let len2 = u32::from(step.length2) + 1;
    let len1 = u32::from(step.length) + 1;
    // Zoned decimal: every source byte's low nibble is a digit; the high
    // nibble of the rightmost byte is the sign, the rest is zone (ignored).
    let mut nibbles = Vec::new();
    let mut sign = 0x0C;
    for i in 0..len2 {
        let b = cpu.read_byte(step.address2.wrapping_add(i) & 0x00FF_FFFF, store)?;
        nibbles.push(b & 0x0F);
        if i + 1 == len2 {
            sign = b >> 4;
        }
    }
    nibbles.push(sign);
    if nibbles.len() % 2 != 0 {
        nibbles.insert(0, 0);
    }
    let mut packed = Vec::new();
    for pair in nibbles.chunks(2) {
        packed.push((pair[0] << 4) | pair[1]);
    }
    for i in 0..len1 {
        let idx = packed.len() as i64 - 1 - i as i64;
        let byte = if idx >= 0 { packed[idx as usize] } else { 0 };
        cpu.write_byte(step.address1.wrapping_add(len1 - 1 - i) & 0x00FF_FFFF, byte, store)?;
    }
    Ok(())
}

fn op_unpk(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let len2 = u32::from(step.length2) + 1;
    let len1 = u32::from(step.length) + 1;
    // Packed decimal: every source byte holds two digits, except the
    // rightmost byte whose low nibble is the sign.
    let mut digits = Vec::new();
    let mut sign = 0x0C;
    for i in 0..len2 {
        let b = cpu.read_byte(step.address2.wrapping_add(i) & 0x00FF_FFFF, store)?;
        digits.push(b >> 4);
        if i + 1 == len2 {
            sign = b & 0x0F;
        } else {
            digits.push(b & 0x0F);
        }
    }
    let ndigits = digits.len() as u32;
    for i in 0..len1 {
        let pos_from_right = len1 - 1 - i;
        let byte = if pos_from_right == 0 {
            let digit = if ndigits >= 1 { digits[(ndigits - 1) as usize] } else { 0 };
            (sign << 4) | digit
        } else if pos_from_right < ndigits {
            0xF0 | digits[(ndigits - 1 - pos_from_right) as usize]
        } else {
            0xF0
        };
        cpu.write_byte(step.address1.wrapping_add(i) & 0x00FF_FFFF, byte, store)?;
    }
    Ok(())
}

fn op_mvo(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let len1 = u32::from(step.length) + 1;
    let len2 = u32::from(step.length2) + 1;
    for i in 0..len1 {
        let dst_idx = len1 - 1 - i;
        let src_idx = i as i64 - (len1 as i64 - len2 as i64);
        let byte = if src_idx >= 0 && (src_idx as u32) < len2 {
            cpu.read_byte(step.address2.wrapping_add(len2 - 1 - src_idx as u32) & 0x00FF_FFFF, store)?
        } else {
            0
        };
        let existing = cpu.read_byte(step.address1.wrapping_add(dst_idx) & 0x00FF_FFFF, store)?;
        let merged = if i == 0 {
            (byte << 4) | (existing & 0x0F)
        } else {
            byte
        };
        cpu.write_byte(step.address1.wrapping_add(dst_idx) & 0x00FF_FFFF, merged, store)?;
    }
    Ok(())
}

/// CVD/CVB operands are a fixed 8 bytes (15 digits max), well within `i64`,
/// so these conversions don't need the digit-array representation.
fn decimal_from_i64(v: i64) -> Decimal {
    let negative = v < 0;
    let mut mag = v.unsigned_abs();
    let mut digits = Vec::new();
    if mag == 0 {
        digits.push(0);
    }
    while mag > 0 {
        digits.push((mag % 10) as u8);
        mag /= 10;
    }
    Decimal { digits, negative }
}

fn decimal_to_i64(value: &Decimal) -> i64 {
    let mut mag: i64 = 0;
    for &d in value.digits.iter().rev() {
        mag = mag * 10 + i64::from(d);
    }
    if value.negative {
        -mag
    } else {
        mag
    }
}

fn op_cvd(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let v = cpu.regs.gpr(step.r1) as i32;
    write_packed(cpu, step.address1, 8, &decimal_from_i64(i64::from(v)), store)
}

fn op_cvb(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let value = read_packed(cpu, step.address1, 8, store)?;
    let signed = decimal_to_i64(&value);
    if !(i64::from(i32::MIN)..=i64::from(i32::MAX)).contains(&signed) {
        return Err(ProgramException::FixedDivide);
    }
    set_gpr(cpu, step.r1, signed as i32 as u32);
    Ok(())
}

// ---- System control -------------------------------------------------------

fn op_ssm(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    let mask = cpu.read_byte(step.address1, store)?;
    cpu.psw.system_mask = mask;
    apply_system_mask(cpu);
    Ok(())
}

fn apply_system_mask(cpu: &mut Cpu) {
    cpu.psw.external_enable = cpu.psw.system_mask & 0x01 != 0;
    cpu.psw.io_enable = cpu.psw.system_mask & 0xFE != 0;
}

fn op_stnsm(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    cpu.write_byte(step.address1, cpu.psw.system_mask, store)?;
    cpu.psw.system_mask &= step.immediate;
    apply_system_mask(cpu);
    Ok(())
}

fn op_stosm(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    cpu.write_byte(step.address1, cpu.psw.system_mask, store)?;
    cpu.psw.system_mask |= step.immediate;
    apply_system_mask(cpu);
    Ok(())
}

fn op_lpsw(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    let w0 = cpu.read_full(step.address1, store)?;
    let w1 = cpu.read_full(step.address1.wrapping_add(4) & 0x00FF_FFFF, store)?;
    let ec_mode = cpu.psw.ec_mode;
    cpu.psw = crate::psw::Psw::decode([w0, w1], ec_mode);
    Ok(())
}

fn op_spka(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    cpu.psw.key = (step.address1 as u8 >> 4) & 0x0F;
    Ok(())
}

fn op_ipk(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    set_gpr(cpu, 2, (cpu.regs.gpr(2) & 0xFFFF_FF00) | u32::from(cpu.psw.key));
    let _ = step;
    Ok(())
}

fn op_ptlb(cpu: &mut Cpu) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    cpu.dat.purge();
    Ok(())
}

fn op_lra(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    let base = cpu.segment_table_base();
    match cpu.dat.translate(step.address1, base, store) {
        Ok(phys) => {
            set_gpr(cpu, step.r1, phys);
            cpu.psw.cc = 0;
        }
        Err(_) => cpu.psw.cc = 3,
    }
    Ok(())
}

fn op_lctl(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    let mut addr = step.address1;
    let mut r = step.r1;
    loop {
        let v = cpu.read_full(addr, store)?;
        cpu.regs.set_cr(r, v);
        if r == step.r3 {
            break;
        }
        r = (r + 1) & 0x0F;
        addr = addr.wrapping_add(4) & 0x00FF_FFFF;
    }
    Ok(())
}

fn op_stctl(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    let mut addr = step.address1;
    let mut r = step.r1;
    loop {
        cpu.write_full(addr, cpu.regs.cr(r), store)?;
        if r == step.r3 {
            break;
        }
        r = (r + 1) & 0x0F;
        addr = addr.wrapping_add(4) & 0x00FF_FFFF;
    }
    Ok(())
}

fn op_cs(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let current = cpu.read_full(step.address1, store)?;
    let expected = cpu.regs.gpr(step.r1);
    if current == expected {
        cpu.write_full(step.address1, cpu.regs.gpr(step.r3), store)?;
        cpu.psw.cc = 0;
    } else {
        set_gpr(cpu, step.r1, current);
        cpu.psw.cc = 1;
    }
    Ok(())
}

/// Doubleword compare-and-swap: compares storage against the `r1:r1+1`
/// pair and, on match, swaps in the `r3:r3+1` pair (§4.5.2).
fn op_cds(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let hi_addr = step.address1;
    let lo_addr = step.address1.wrapping_add(4) & 0x00FF_FFFF;
    let current_hi = cpu.read_full(hi_addr, store)?;
    let current_lo = cpu.read_full(lo_addr, store)?;
    let current = (u64::from(current_hi) << 32) | u64::from(current_lo);
    let expected = (u64::from(cpu.regs.gpr(step.r1)) << 32) | u64::from(cpu.regs.gpr(step.r1 | 1));
    if current == expected {
        let swap_hi = cpu.regs.gpr(step.r3);
        let swap_lo = cpu.regs.gpr(step.r3 | 1);
        cpu.write_full(hi_addr, swap_hi, store)?;
        cpu.write_full(lo_addr, swap_lo, store)?;
        cpu.psw.cc = 0;
    } else {
        set_gpr(cpu, step.r1, current_hi);
        set_gpr(cpu, step.r1 | 1, current_lo);
        cpu.psw.cc = 1;
    }
    Ok(())
}

fn op_ssk(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    store.put_key(step.address1, (cpu.regs.gpr(step.r1) as u8) & 0xFE);
    Ok(())
}

fn op_isk(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    let key = store.get_key(step.address1);
    set_gpr(cpu, step.r1, (cpu.regs.gpr(step.r1) & 0xFFFF_FF00) | u32::from(key));
    Ok(())
}

fn op_diag(cpu: &mut Cpu) -> Result<(), ProgramException> {
    require_privileged(cpu)
}

fn op_ts(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let b = cpu.read_byte(step.address1, store)?;
    cpu.psw.cc = u8::from(b & 0x80 != 0);
    cpu.write_byte(step.address1, 0xFF, store)
}

fn op_mc(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    let _ = step;
    Ok(())
}

fn op_stck(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    cpu.write_full(step.address1, (cpu.tod_clock >> 32) as u32, store)?;
    cpu.write_full(step.address1.wrapping_add(4) & 0x00FF_FFFF, cpu.tod_clock as u32, store)?;
    cpu.psw.cc = 0;
    Ok(())
}

fn op_sck(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    let hi = cpu.read_full(step.address1, store)?;
    cpu.tod_clock = (cpu.tod_clock & 0xFFFF_FFFF) | (u64::from(hi) << 32);
    Ok(())
}

fn op_sckc(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    cpu.clock_comparator = u64::from(cpu.read_full(step.address1, store)?);
    Ok(())
}

fn op_stckc(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    cpu.write_full(step.address1, cpu.clock_comparator as u32, store)
}

fn op_spt(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    cpu.cpu_timer = i64::from(cpu.read_full(step.address1, store)? as i32);
    Ok(())
}

fn op_stpt(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    cpu.write_full(step.address1, cpu.cpu_timer as u32, store)
}

fn op_sigp(cpu: &mut Cpu) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    cpu.psw.cc = 3; // single-CPU model: target never operational
    Ok(())
}

fn devnum_of(step: &Step) -> u16 {
    (step.address1 & 0xFFF) as u16
}

fn op_sio(cpu: &mut Cpu, step: &Step, store: &mut MainStore, channels: &mut ChannelSubsystem, devices: &mut dyn DeviceTable) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    cpu.psw.cc = channels.start_io(devnum_of(step), store, devices);
    Ok(())
}

fn op_tio(cpu: &mut Cpu, step: &Step, store: &mut MainStore, channels: &mut ChannelSubsystem, devices: &mut dyn DeviceTable) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    cpu.psw.cc = channels.test_io(devnum_of(step), store, devices);
    Ok(())
}

fn op_hio(cpu: &mut Cpu, step: &Step, channels: &mut ChannelSubsystem, devices: &mut dyn DeviceTable) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    cpu.psw.cc = channels.halt_io(devnum_of(step), devices);
    Ok(())
}

fn op_tch(cpu: &mut Cpu, step: &Step, channels: &mut ChannelSubsystem) -> Result<(), ProgramException> {
    require_privileged(cpu)?;
    let channel = (devnum_of(step) >> 8) as u8;
    cpu.psw.cc = channels.test_chan(channel);
    Ok(())
}

// ---- Long move/compare -------------------------------------------------

/// Half-open interval overlap, used for MVCL's destructive-overlap check.
/// Either length being 0 means no bytes are touched, so no overlap.
fn ranges_overlap(a_start: u32, a_len: u32, b_start: u32, b_len: u32) -> bool {
    if a_len == 0 || b_len == 0 {
        return false;
    }
    let a_end = u64::from(a_start) + u64::from(a_len);
    let b_end = u64::from(b_start) + u64::from(b_len);
    u64::from(a_start) < b_end && u64::from(b_start) < a_end
}

fn op_mvcl(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let mut dst_addr = cpu.regs.gpr(step.r1) & 0x00FF_FFFF;
    let mut dst_len = cpu.regs.gpr(step.r1 | 1) & 0x00FF_FFFF;
    let mut src_addr = cpu.regs.gpr(step.r2) & 0x00FF_FFFF;
    let mut src_len = cpu.regs.gpr(step.r2 | 1) & 0x00FF_FFFF;
    let fill = (cpu.regs.gpr(step.r2 | 1) >> 24) as u8;

    if ranges_overlap(dst_addr, dst_len, src_addr, src_len) {
        cpu.psw.cc = 3;
        return Ok(());
    }

    cpu.psw.cc = if dst_len == src_len {
        0
    } else if dst_len < src_len {
        1
    } else {
        2
    };

    while dst_len > 0 {
        let byte = if src_len > 0 {
            let b = cpu.read_byte(src_addr, store)?;
            src_addr = src_addr.wrapping_add(1) & 0x00FF_FFFF;
            src_len -= 1;
            b
        } else {
            fill
        };
        cpu.write_byte(dst_addr, byte, store)?;
        dst_addr = dst_addr.wrapping_add(1) & 0x00FF_FFFF;
        dst_len -= 1;
    }
    set_gpr(cpu, step.r1, dst_addr);
    set_gpr(cpu, step.r1 | 1, dst_len);
    set_gpr(cpu, step.r2, src_addr);
    set_gpr(cpu, step.r2 | 1, (cpu.regs.gpr(step.r2 | 1) & 0xFF00_0000) | src_len);
    Ok(())
}

fn op_clcl(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let mut addr1 = cpu.regs.gpr(step.r1) & 0x00FF_FFFF;
    let mut len1 = cpu.regs.gpr(step.r1 | 1) & 0x00FF_FFFF;
    let mut addr2 = cpu.regs.gpr(step.r2) & 0x00FF_FFFF;
    let mut len2 = cpu.regs.gpr(step.r2 | 1) & 0x00FF_FFFF;
    let fill2 = (cpu.regs.gpr(step.r2 | 1) >> 24) as u8;

    let mut cc = 0u8;
    while len1 > 0 || len2 > 0 {
        let a = if len1 > 0 {
            cpu.read_byte(addr1, store)?
        } else {
            fill2
        };
        let b = if len2 > 0 {
            cpu.read_byte(addr2, store)?
        } else {
            fill2
        };
        if a != b {
            cc = if a < b { 1 } else { 2 };
            break;
        }
        if len1 > 0 {
            addr1 = addr1.wrapping_add(1) & 0x00FF_FFFF;
            len1 -= 1;
        }
        if len2 > 0 {
            addr2 = addr2.wrapping_add(1) & 0x00FF_FFFF;
            len2 -= 1;
        }
    }
    cpu.psw.cc = cc;
    set_gpr(cpu, step.r1, addr1);
    set_gpr(cpu, step.r1 | 1, len1);
    set_gpr(cpu, step.r2, addr2);
    set_gpr(cpu, step.r2 | 1, (cpu.regs.gpr(step.r2 | 1) & 0xFF00_0000) | len2);
    Ok(())
}

// ---- Floating point (hexadecimal, see module doc) -----------------------

/// Decodes a hexadecimal floating-point bit pattern: sign at `total_bits-1`,
/// a 7-bit characteristic biased by 64 immediately below it, and a
/// radix-16 fraction in the low `frac_bits` bits (`frac_bits` always a
/// multiple of 4, one hex digit per nibble).
fn hex_decode(bits: u64, total_bits: u32, frac_bits: u32) -> f64 {
    let fraction = bits & ((1u64 << frac_bits) - 1);
    if fraction == 0 {
        return 0.0;
    }
    let sign = (bits >> (total_bits - 1)) & 1;
    let characteristic = i32::try_from((bits >> frac_bits) & 0x7F).unwrap() - 64;
    let hex_digits = (frac_bits / 4) as i32;
    let mantissa = fraction as f64 / 16f64.powi(hex_digits);
    let magnitude = mantissa * 16f64.powi(characteristic);
    if sign == 1 {
        -magnitude
    } else {
        magnitude
    }
}

/// Encodes `v` into a hexadecimal floating-point bit pattern of the given
/// width, normalizing the fraction into `[1/16, 1)` per digit (§4.5.2).
/// Characteristic overflow/underflow clamp instead of raising the
/// architected exception, since callers here never trap on it.
fn hex_encode(v: f64, total_bits: u32, frac_bits: u32) -> u64 {
    if v == 0.0 {
        return 0;
    }
    let sign = u64::from(v.is_sign_negative());
    let mut mag = v.abs();
    let mut characteristic = 64i32;
    while mag >= 1.0 {
        mag /= 16.0;
        characteristic += 1;
    }
    while mag < 1.0 / 16.0 {
        mag *= 16.0;
        characteristic -= 1;
    }
    let characteristic = characteristic.clamp(0, 127) as u64;
    let hex_digits = (frac_bits / 4) as i32;
    let scale = 16f64.powi(hex_digits);
    let fraction = (mag * scale).round() as u64 & ((1u64 << frac_bits) - 1);
    (sign << (total_bits - 1)) | (characteristic << frac_bits) | fraction
}

fn hex_decode32(bits: u32) -> f32 {
    hex_decode(u64::from(bits), 32, 24) as f32
}

fn hex_encode32(v: f32) -> u32 {
    hex_encode(f64::from(v), 32, 24) as u32
}

fn hex_decode64(hi: u32, lo: u32) -> f64 {
    hex_decode((u64::from(hi) << 32) | u64::from(lo), 64, 56)
}

fn load_f64(cpu: &Cpu, r: u8) -> f64 {
    hex_decode(cpu.regs.fpr(r), 64, 56)
}

fn store_f64(cpu: &mut Cpu, r: u8, v: f64) {
    cpu.regs.set_fpr(r, hex_encode(v, 64, 56));
}

fn check_fpr(r: u8) -> Result<(), ProgramException> {
    if crate::registers::Registers::fpr_misaligned(r) {
        Err(ProgramException::Specification)
    } else {
        Ok(())
    }
}

fn op_ldr_arith(
    cpu: &mut Cpu,
    step: &Step,
    op: impl Fn(f64, f64) -> f64,
) -> Result<(), ProgramException> {
    check_fpr(step.r1)?;
    check_fpr(step.r2)?;
    let a = load_f64(cpu, step.r1);
    let b = load_f64(cpu, step.r2);
    let r = op(a, b);
    cpu.psw.cc = flags::cc_float(r);
    store_f64(cpu, step.r1, r);
    Ok(())
}

fn op_adr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    op_ldr_arith(cpu, step, |a, b| a + b)
}

fn op_sdr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    op_ldr_arith(cpu, step, |a, b| a - b)
}

fn op_mdr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    op_ldr_arith(cpu, step, |a, b| a * b)
}

fn op_ddr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    check_fpr(step.r1)?;
    check_fpr(step.r2)?;
    let b = load_f64(cpu, step.r2);
    if b == 0.0 {
        return Err(ProgramException::FloatingDivide);
    }
    op_ldr_arith(cpu, step, |a, b| a / b)
}

fn op_cdr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    check_fpr(step.r1)?;
    check_fpr(step.r2)?;
    let a = load_f64(cpu, step.r1);
    let b = load_f64(cpu, step.r2);
    cpu.psw.cc = if a == b {
        0
    } else if a < b {
        1
    } else {
        2
    };
    Ok(())
}

fn load_f32(cpu: &Cpu, r: u8) -> f32 {
    hex_decode32(cpu.regs.fpr_short(r))
}

fn store_f32(cpu: &mut Cpu, r: u8, v: f32) {
    cpu.regs.set_fpr_short(r, hex_encode32(v));
}

fn op_er_arith(cpu: &mut Cpu, step: &Step, op: impl Fn(f32, f32) -> f32) -> Result<(), ProgramException> {
    check_fpr(step.r1)?;
    check_fpr(step.r2)?;
    let a = load_f32(cpu, step.r1);
    let b = load_f32(cpu, step.r2);
    let r = op(a, b);
    cpu.psw.cc = flags::cc_float(f64::from(r));
    store_f32(cpu, step.r1, r);
    Ok(())
}

fn op_aer(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    op_er_arith(cpu, step, |a, b| a + b)
}

fn op_ser(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    op_er_arith(cpu, step, |a, b| a - b)
}

fn op_mer(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    op_er_arith(cpu, step, |a, b| a * b)
}

fn op_der(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    check_fpr(step.r1)?;
    check_fpr(step.r2)?;
    let b = load_f32(cpu, step.r2);
    if b == 0.0 {
        return Err(ProgramException::FloatingDivide);
    }
    op_er_arith(cpu, step, |a, b| a / b)
}

fn op_cer(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    check_fpr(step.r1)?;
    check_fpr(step.r2)?;
    let a = load_f32(cpu, step.r1);
    let b = load_f32(cpu, step.r2);
    cpu.psw.cc = if a == b {
        0
    } else if a < b {
        1
    } else {
        2
    };
    Ok(())
}

fn op_ce_mem(cpu: &mut Cpu, step: &Step, store: &mut MainStore, op: impl Fn(f32, f32) -> f32) -> Result<(), ProgramException> {
    check_fpr(step.r1)?;
    let mem = cpu.read_full(step.address1, store)?;
    let b = hex_decode32(mem);
    let a = load_f32(cpu, step.r1);
    let r = op(a, b);
    cpu.psw.cc = flags::cc_float(f64::from(r));
    store_f32(cpu, step.r1, r);
    Ok(())
}

fn op_ae(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    op_ce_mem(cpu, step, store, |a, b| a + b)
}

fn op_se(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    op_ce_mem(cpu, step, store, |a, b| a - b)
}

fn op_me(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    op_ce_mem(cpu, step, store, |a, b| a * b)
}

fn op_de(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    check_fpr(step.r1)?;
    let mem = cpu.read_full(step.address1, store)?;
    if mem == 0 {
        return Err(ProgramException::FloatingDivide);
    }
    op_ce_mem(cpu, step, store, |a, b| a / b)
}

fn op_ce(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    check_fpr(step.r1)?;
    let mem = cpu.read_full(step.address1, store)?;
    let b = hex_decode32(mem);
    let a = load_f32(cpu, step.r1);
    cpu.psw.cc = if a == b {
        0
    } else if a < b {
        1
    } else {
        2
    };
    Ok(())
}

fn op_cd_mem(cpu: &mut Cpu, step: &Step, store: &mut MainStore, op: impl Fn(f64, f64) -> f64) -> Result<(), ProgramException> {
    check_fpr(step.r1)?;
    let hi = cpu.read_full(step.address1, store)?;
    let lo = cpu.read_full(step.address1.wrapping_add(4) & 0x00FF_FFFF, store)?;
    let b = hex_decode64(hi, lo);
    let a = load_f64(cpu, step.r1);
    let r = op(a, b);
    cpu.psw.cc = flags::cc_float(r);
    store_f64(cpu, step.r1, r);
    Ok(())
}

fn op_ad(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    op_cd_mem(cpu, step, store, |a, b| a + b)
}

fn op_sd(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    op_cd_mem(cpu, step, store, |a, b| a - b)
}

fn op_md(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    op_cd_mem(cpu, step, store, |a, b| a * b)
}

fn op_dd(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    check_fpr(step.r1)?;
    let hi = cpu.read_full(step.address1, store)?;
    let lo = cpu.read_full(step.address1.wrapping_add(4) & 0x00FF_FFFF, store)?;
    if hi == 0 && lo == 0 {
        return Err(ProgramException::FloatingDivide);
    }
    op_cd_mem(cpu, step, store, |a, b| a / b)
}

fn op_cd(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    check_fpr(step.r1)?;
    let hi = cpu.read_full(step.address1, store)?;
    let lo = cpu.read_full(step.address1.wrapping_add(4) & 0x00FF_FFFF, store)?;
    let b = hex_decode64(hi, lo);
    let a = load_f64(cpu, step.r1);
    cpu.psw.cc = if a == b {
        0
    } else if a < b {
        1
    } else {
        2
    };
    Ok(())
}

// extended precision: approximate by treating the register pair (r, r+2)
// as hi/lo halves of one f64, which is enough to exercise CC rules without
// claiming bit-exact 128-bit hex-float semantics.
fn op_axr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    op_adr(cpu, step)
}

fn op_sxr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    op_sdr(cpu, step)
}

fn op_mxr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    op_mdr(cpu, step)
}

fn op_mxdr(cpu: &mut Cpu, step: &Step) -> Result<(), ProgramException> {
    op_mdr(cpu, step)
}

fn op_mxd(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    op_md(cpu, step, store)
}

// ---- SVC / EXECUTE / EDMK / SRP -----------------------------------------

fn op_svc(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    crate::interrupt::take_svc(&mut cpu.psw, store, step.immediate, step.ilc);
    Ok(())
}

fn op_ex(cpu: &mut Cpu, step: &Step, store: &mut MainStore, channels: &mut ChannelSubsystem, devices: &mut dyn DeviceTable) -> Result<(), ProgramException> {
    let r1 = cpu.regs.gpr(step.r1);
    let mut bytes = [0u8; 6];
    for (i, b) in bytes.iter_mut().enumerate().take(2) {
        *b = cpu.read_byte(step.address1.wrapping_add(i as u32) & 0x00FF_FFFF, store)?;
    }
    if bytes[0] == 0x44 {
        return Err(ProgramException::Execute); // EXECUTE target must not itself be EXECUTE
    }
    let Some(fmt) = s370_asm::opcodes::format_of(bytes[0]) else {
        return Err(ProgramException::Operation);
    };
    for (i, b) in bytes.iter_mut().enumerate().take(fmt.len() as usize).skip(2) {
        *b = cpu.read_byte(step.address1.wrapping_add(i as u32) & 0x00FF_FFFF, store)?;
    }
    bytes[1] |= (r1 & 0xFF) as u8;
    let snapshot = cpu.regs_snapshot();
    let Some(inner) = crate::decode::decode(&bytes[..fmt.len() as usize], &snapshot) else {
        return Err(ProgramException::Operation);
    };
    dispatch_inner(cpu, &inner, store, channels, devices)
}

fn op_edmk(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    op_ed(cpu, step, store)
}

/// Shifts a packed-decimal magnitude by `shift` digit positions, positive
/// shifting left (multiply by 10^shift) and negative shifting right with
/// rounding on the highest dropped digit (§4.5.2 SRP).
fn decimal_shift(value: &Decimal, shift: i32) -> Decimal {
    if shift >= 0 {
        let mut digits = vec![0u8; shift as usize];
        digits.extend(value.digits.iter().copied());
        trim(&mut digits);
        let negative = value.negative && digits.iter().any(|&d| d != 0);
        Decimal { digits, negative }
    } else {
        let drop = (-shift) as usize;
        let round_up = drop > 0 && value.digits.get(drop - 1).copied().unwrap_or(0) >= 5;
        let mut digits = if drop >= value.digits.len() {
            vec![0]
        } else {
            value.digits[drop..].to_vec()
        };
        if round_up {
            digits = magnitude_add(&digits, &[1]);
        }
        trim(&mut digits);
        let negative = value.negative && digits.iter().any(|&d| d != 0);
        Decimal { digits, negative }
    }
}

fn op_srp(cpu: &mut Cpu, step: &Step, store: &mut MainStore) -> Result<(), ProgramException> {
    let len1 = u32::from(step.length) + 1;
    let value = read_packed(cpu, step.address1, len1, store)?;
    let shift = (step.address2 & 0x3F) as i32;
    let shift = if shift > 31 { shift - 64 } else { shift };
    let shifted = decimal_shift(&value, shift);
    write_packed(cpu, step.address1, len1, &shifted, store)?;
    cpu.psw.cc = flags::cc_decimal(shifted.is_zero(), shifted.negative, false);
    Ok(())
}

// ---- Dispatch -------------------------------------------------------------

fn dispatch_inner(
    cpu: &mut Cpu,
    step: &Step,
    store: &mut MainStore,
    channels: &mut ChannelSubsystem,
    devices: &mut dyn DeviceTable,
) -> Result<(), ProgramException> {
    let Some(mnem) = s370_asm::opcodes::mnemonic_of(step.opcode) else {
        return Err(ProgramException::Operation);
    };
    match mnem {
        "LR" => op_lr(cpu, step),
        "LTR" => op_ltr(cpu, step),
        "LCR" => op_lcr(cpu, step),
        "LPR" => op_lpr(cpu, step),
        "LNR" => op_lnr(cpu, step),
        "AR" => op_ar(cpu, step),
        "SR" => op_sr(cpu, step),
        "AH" => op_ah(cpu, step, store),
        "SH" => op_sh(cpu, step, store),
        "A" => op_a(cpu, step, store),
        "S" => op_s(cpu, step, store),
        "AL" => op_al(cpu, step, store),
        "ALR" => op_alr(cpu, step),
        "SL" => op_sl(cpu, step, store),
        "SLR" => op_slr(cpu, step),
        "MR" => op_mr(cpu, step),
        "M" => op_m(cpu, step, store),
        "MH" => op_mh(cpu, step, store),
        "DR" => op_dr(cpu, step),
        "D" => op_d(cpu, step, store),
        "C" => op_c(cpu, step, store),
        "CR" => op_cr(cpu, step),
        "CH" => op_ch(cpu, step, store),
        "CL" => op_cl(cpu, step, store),
        "CLR" => op_clr(cpu, step),
        "CLI" => op_cli(cpu, step, store),
        "CLM" => op_clm(cpu, step, store),
        "CLC" => op_clc(cpu, step, store),
        "N" => {
            let b = cpu.read_full(step.address1, store)?;
            op_logical(cpu, step.r1, cpu.regs.gpr(step.r1), b, |x, y| x & y);
            Ok(())
        }
        "NR" => {
            op_logical(cpu, step.r1, cpu.regs.gpr(step.r1), cpu.regs.gpr(step.r2), |x, y| x & y);
            Ok(())
        }
        "O" => {
            let b = cpu.read_full(step.address1, store)?;
            op_logical(cpu, step.r1, cpu.regs.gpr(step.r1), b, |x, y| x | y);
            Ok(())
        }
        "OR" => {
            op_logical(cpu, step.r1, cpu.regs.gpr(step.r1), cpu.regs.gpr(step.r2), |x, y| x | y);
            Ok(())
        }
        "X" => {
            let b = cpu.read_full(step.address1, store)?;
            op_logical(cpu, step.r1, cpu.regs.gpr(step.r1), b, |x, y| x ^ y);
            Ok(())
        }
        "XR" => {
            op_logical(cpu, step.r1, cpu.regs.gpr(step.r1), cpu.regs.gpr(step.r2), |x, y| x ^ y);
            Ok(())
        }
        "NI" => op_ni_oi_xi(cpu, step, store, |a, b| a & b),
        "OI" => op_ni_oi_xi(cpu, step, store, |a, b| a | b),
        "XI" => op_ni_oi_xi(cpu, step, store, |a, b| a ^ b),
        "L" => op_l(cpu, step, store),
        "LH" => op_lh(cpu, step, store),
        "LA" => op_la(cpu, step),
        "IC" => op_ic(cpu, step, store),
        "ICM" => op_icm(cpu, step, store),
        "ST" => op_st(cpu, step, store),
        "STH" => op_sth(cpu, step, store),
        "STC" => op_stc(cpu, step, store),
        "STCM" => op_stcm(cpu, step, store),
        "STM" => op_stm(cpu, step, store),
        "LM" => op_lm(cpu, step, store),
        "SRL" => op_srl(cpu, step),
        "SLL" => op_sll(cpu, step),
        "SRA" => op_sra(cpu, step),
        "SLA" => op_sla(cpu, step),
        "SRDL" => op_srdl(cpu, step),
        "SLDL" => op_sldl(cpu, step),
        "SRDA" => op_srda(cpu, step),
        "SLDA" => op_slda(cpu, step),
        "BC" => op_bc(cpu, step),
        "BCR" => op_bcr(cpu, step),
        "BAL" => op_bal(cpu, step),
        "BALR" => op_balr(cpu, step),
        "BCT" => op_bct(cpu, step),
        "BCTR" => op_bctr(cpu, step),
        "BAS" => op_bas(cpu, step),
        "BASR" => op_basr(cpu, step),
        "BXH" => op_bxh(cpu, step),
        "BXLE" => op_bxle(cpu, step),
        "MVC" => op_mvc(cpu, step, store),
        "MVN" => op_mvn(cpu, step, store),
        "MVZ" => op_mvz(cpu, step, store),
        "NC" => ss_bitwise(cpu, step, store, |a, b| a & b),
        "OC" => ss_bitwise(cpu, step, store, |a, b| a | b),
        "XC" => ss_bitwise(cpu, step, store, |a, b| a ^ b),
        "TR" => op_tr(cpu, step, store),
        "TRT" => op_trt(cpu, step, store),
        "ED" => op_ed(cpu, step, store),
        "EDMK" => op_edmk(cpu, step, store),
        "PACK" => op_pack(cpu, step, store),
        "UNPK" => op_unpk(cpu, step, store),
        "MVO" => op_mvo(cpu, step, store),
        "CVD" => op_cvd(cpu, step, store),
        "CVB" => op_cvb(cpu, step, store),
        "AP" => op_ap(cpu, step, store),
        "SP" => op_sp(cpu, step, store),
        "ZAP" => op_zap(cpu, step, store),
        "CP" => op_cp(cpu, step, store),
        "MP" => op_mp(cpu, step, store),
        "DP" => op_dp(cpu, step, store),
        "SRP" => op_srp(cpu, step, store),
        "MVCL" => op_mvcl(cpu, step, store),
        "CLCL" => op_clcl(cpu, step, store),
        "CE" => op_ce(cpu, step, store),
        "AE" => op_ae(cpu, step, store),
        "SE" => op_se(cpu, step, store),
        "ME" => op_me(cpu, step, store),
        "DE" => op_de(cpu, step, store),
        "CER" => op_cer(cpu, step),
        "AER" => op_aer(cpu, step),
        "SER" => op_ser(cpu, step),
        "MER" => op_mer(cpu, step),
        "DER" => op_der(cpu, step),
        "CD" => op_cd(cpu, step, store),
        "AD" => op_ad(cpu, step, store),
        "SD" => op_sd(cpu, step, store),
        "MD" => op_md(cpu, step, store),
        "DD" => op_dd(cpu, step, store),
        "CDR" => op_cdr(cpu, step),
        "ADR" => op_adr(cpu, step),
        "SDR" => op_sdr(cpu, step),
        "MDR" => op_mdr(cpu, step),
        "DDR" => op_ddr(cpu, step),
        "AXR" => op_axr(cpu, step),
        "SXR" => op_sxr(cpu, step),
        "MXR" => op_mxr(cpu, step),
        "MXDR" => op_mxdr(cpu, step),
        "MXD" => op_mxd(cpu, step, store),
        "SSM" => op_ssm(cpu, step, store),
        "LPSW" => op_lpsw(cpu, step, store),
        "SPKA" => op_spka(cpu, step),
        "IPK" => op_ipk(cpu, step),
        "PTLB" => op_ptlb(cpu),
        "LRA" => op_lra(cpu, step, store),
        "LCTL" => op_lctl(cpu, step, store),
        "STCTL" => op_stctl(cpu, step, store),
        "CS" => op_cs(cpu, step, store),
        "CDS" => op_cds(cpu, step, store),
        "DIAG" => op_diag(cpu),
        "SSK" => op_ssk(cpu, step, store),
        "ISK" => op_isk(cpu, step, store),
        "STNSM" => op_stnsm(cpu, step, store),
        "STOSM" => op_stosm(cpu, step, store),
        "SIO" => op_sio(cpu, step, store, channels, devices),
        "TIO" => op_tio(cpu, step, store, channels, devices),
        "HIO" => op_hio(cpu, step, channels, devices),
        "TCH" => op_tch(cpu, step, channels),
        "SIGP" => op_sigp(cpu),
        "MC" => op_mc(cpu, step),
        "TS" => op_ts(cpu, step, store),
        "STCK" => op_stck(cpu, step, store),
        "SCK" => op_sck(cpu, step, store),
        "SCKC" => op_sckc(cpu, step, store),
        "STCKC" => op_stckc(cpu, step, store),
        "SPT" => op_spt(cpu, step, store),
        "STPT" => op_stpt(cpu, step, store),
        "SVC" => op_svc(cpu, step, store),
        "EX" => op_ex(cpu, step, store, channels, devices),
        _ => Err(ProgramException::Operation),
    }
}

/// Dispatch one decoded instruction to its handler (§4.5 step 6).
pub fn dispatch(
    cpu: &mut Cpu,
    step: &Step,
    store: &mut MainStore,
    channels: &mut ChannelSubsystem,
    devices: &mut dyn DeviceTable,
) -> Result<(), ProgramException> {
    dispatch_inner(cpu, step, store, channels, devices)
}

