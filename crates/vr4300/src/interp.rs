//! One-instruction interpreter. This is both the fallback the recompiler
//! calls for deferred instructions and the reference implementation the
//! differential tests compare generated code against.

use crate::{
    Bus, Cop0Func, CopRs, Cpu, EXCEPTION_VECTOR, FpuFmt, Ins, Opcode, REG_LR, Regimm, Special,
    cop0,
};

const FCR31_CONDITION: u32 = 1 << 23;

fn sext32(value: u32) -> u64 {
    value as i32 as i64 as u64
}

/// Records an exception and returns the vector to resume at.
fn raise_exception(cpu: &mut Cpu, code: u32, pc: u32, in_delay: bool) -> u32 {
    let (epc, bd) = if in_delay {
        (pc.wrapping_sub(4), 1 << 31)
    } else {
        (pc, 0)
    };
    cpu.cop0.regs[cop0::EPC] = epc;
    cpu.cop0.regs[cop0::CAUSE] = (code << 2) | bd;
    cpu.cop0.regs[cop0::STATUS] |= 0x2; // EXL
    EXCEPTION_VECTOR
}

/// Executes the delay slot of a branch at `pc`. A branch in the delay slot
/// is a guest program bug; it is skipped with a warning.
fn run_delay_slot(cpu: &mut Cpu, bus: &mut impl Bus, pc: u32) {
    let slot = Ins(bus.read_u32(pc.wrapping_add(4)));
    if slot.is_branch() {
        tracing::warn!(pc = %crate::Address(pc), "branch in delay slot, skipping");
        return;
    }
    interp_one(cpu, bus, slot, pc.wrapping_add(4), true);
}

/// Shared implementation of every conditional branch form.
fn branch(
    cpu: &mut Cpu,
    bus: &mut impl Bus,
    pc: u32,
    taken: bool,
    offset: i32,
    link: bool,
    likely: bool,
) -> Option<u32> {
    if link {
        cpu.set_reg(REG_LR, sext32(pc.wrapping_add(8)));
    }
    if taken {
        run_delay_slot(cpu, bus, pc);
        Some(pc.wrapping_add(4).wrapping_add_signed(offset << 2))
    } else {
        if !likely {
            run_delay_slot(cpu, bus, pc);
        }
        Some(pc.wrapping_add(8))
    }
}

/// Interprets one instruction at `pc`.
///
/// Returns the address execution must resume at when the instruction
/// redirected control flow (every branch form returns here, taken or not,
/// because the delay slot has already been executed), or `None` when
/// execution falls through to `pc + 4`.
pub fn interp_one(cpu: &mut Cpu, bus: &mut impl Bus, ins: Ins, pc: u32, in_delay: bool) -> Option<u32> {
    let Some(op) = ins.opcode() else {
        tracing::warn!(word = ins.word(), "illegal opcode, raising reserved instruction");
        return Some(raise_exception(cpu, 10, pc, in_delay));
    };

    let rs = cpu.reg(ins.rs());
    let rt = cpu.reg(ins.rt());
    let rs32 = rs as u32;
    let rt32 = rt as u32;
    let simm = ins.simm();
    let ea = (rs as i64).wrapping_add(simm as i64) as u32;

    match op {
        Opcode::Special => return special(cpu, bus, ins, pc, in_delay),
        Opcode::Regimm => return regimm(cpu, bus, ins, pc, in_delay),

        Opcode::J => {
            run_delay_slot(cpu, bus, pc);
            return Some((ins.target() << 2) | (pc.wrapping_add(4) & 0xF000_0000));
        }
        Opcode::Jal => {
            cpu.set_reg(REG_LR, sext32(pc.wrapping_add(8)));
            run_delay_slot(cpu, bus, pc);
            return Some((ins.target() << 2) | (pc.wrapping_add(4) & 0xF000_0000));
        }
        Opcode::Beq => return branch(cpu, bus, pc, rs == rt, simm, false, false),
        Opcode::Bne => return branch(cpu, bus, pc, rs != rt, simm, false, false),
        Opcode::Blez => return branch(cpu, bus, pc, (rs as i64) <= 0, simm, false, false),
        Opcode::Bgtz => return branch(cpu, bus, pc, (rs as i64) > 0, simm, false, false),
        Opcode::Beql => return branch(cpu, bus, pc, rs == rt, simm, false, true),
        Opcode::Bnel => return branch(cpu, bus, pc, rs != rt, simm, false, true),
        Opcode::Blezl => return branch(cpu, bus, pc, (rs as i64) <= 0, simm, false, true),
        Opcode::Bgtzl => return branch(cpu, bus, pc, (rs as i64) > 0, simm, false, true),

        Opcode::Addi | Opcode::Addiu => {
            cpu.set_reg(ins.rt(), sext32(rs32.wrapping_add_signed(simm)));
        }
        Opcode::Slti => {
            cpu.set_reg(ins.rt(), ((rs as i64) < simm as i64) as u64);
        }
        Opcode::Sltiu => {
            cpu.set_reg(ins.rt(), (rs < simm as i64 as u64) as u64);
        }
        Opcode::Andi => cpu.set_reg(ins.rt(), rs & ins.imm() as u64),
        Opcode::Ori => cpu.set_reg(ins.rt(), rs | ins.imm() as u64),
        Opcode::Xori => cpu.set_reg(ins.rt(), rs ^ ins.imm() as u64),
        Opcode::Lui => cpu.set_reg(ins.rt(), sext32(ins.imm() << 16)),

        Opcode::Daddi | Opcode::Daddiu => {
            cpu.set_reg(ins.rt(), rs.wrapping_add_signed(simm as i64));
        }

        Opcode::Lb => cpu.set_reg(ins.rt(), bus.read_u8(ea) as i8 as i64 as u64),
        Opcode::Lbu => cpu.set_reg(ins.rt(), bus.read_u8(ea) as u64),
        Opcode::Lh => cpu.set_reg(ins.rt(), bus.read_u16(ea) as i16 as i64 as u64),
        Opcode::Lhu => cpu.set_reg(ins.rt(), bus.read_u16(ea) as u64),
        Opcode::Lw => cpu.set_reg(ins.rt(), sext32(bus.read_u32(ea))),
        Opcode::Lwu => cpu.set_reg(ins.rt(), bus.read_u32(ea) as u64),
        Opcode::Ld => cpu.set_reg(ins.rt(), bus.read_u64(ea)),
        Opcode::Ll => {
            cpu.ll_bit = 1;
            cpu.set_reg(ins.rt(), sext32(bus.read_u32(ea)));
        }
        Opcode::Lld => {
            cpu.ll_bit = 1;
            cpu.set_reg(ins.rt(), bus.read_u64(ea));
        }

        Opcode::Lwl => {
            let word = bus.read_u32(ea & !3);
            let n = ea & 3;
            let merged = (word << (8 * n)) | (rt32 & mask_low(8 * n));
            cpu.set_reg(ins.rt(), sext32(merged));
        }
        Opcode::Lwr => {
            let word = bus.read_u32(ea & !3);
            let n = ea & 3;
            let merged = (word >> (8 * (3 - n))) | (rt32 & !mask_low(8 * (n + 1)));
            cpu.set_reg(ins.rt(), sext32(merged));
        }
        Opcode::Ldl => {
            let word = bus.read_u64(ea & !7);
            let n = (ea & 7) as u64;
            let merged = (word << (8 * n)) | (rt & mask_low64(8 * n));
            cpu.set_reg(ins.rt(), merged);
        }
        Opcode::Ldr => {
            let word = bus.read_u64(ea & !7);
            let n = (ea & 7) as u64;
            let merged = (word >> (8 * (7 - n))) | (rt & !mask_low64(8 * (n + 1)));
            cpu.set_reg(ins.rt(), merged);
        }

        Opcode::Sb => bus.write_u8(ea, rt as u8),
        Opcode::Sh => bus.write_u16(ea, rt as u16),
        Opcode::Sw => bus.write_u32(ea, rt32),
        Opcode::Sd => bus.write_u64(ea, rt),
        Opcode::Sc => {
            if cpu.ll_bit != 0 {
                bus.write_u32(ea, rt32);
            }
            let success = cpu.ll_bit as u64;
            cpu.ll_bit = 0;
            cpu.set_reg(ins.rt(), success);
        }
        Opcode::Scd => {
            if cpu.ll_bit != 0 {
                bus.write_u64(ea, rt);
            }
            let success = cpu.ll_bit as u64;
            cpu.ll_bit = 0;
            cpu.set_reg(ins.rt(), success);
        }

        Opcode::Swl => {
            let aligned = ea & !3;
            let n = ea & 3;
            let word = bus.read_u32(aligned);
            let keep = word & !(!0u32 >> (8 * n));
            bus.write_u32(aligned, keep | (rt32 >> (8 * n)));
        }
        Opcode::Swr => {
            let aligned = ea & !3;
            let b = 8 * (3 - (ea & 3));
            let keep = bus.read_u32(aligned) & mask_low(b);
            bus.write_u32(aligned, keep | (rt32 << b));
        }
        Opcode::Sdl => {
            let aligned = ea & !7;
            let n = (ea & 7) as u64;
            let word = bus.read_u64(aligned);
            let keep = word & !(!0u64 >> (8 * n));
            bus.write_u64(aligned, keep | (rt >> (8 * n)));
        }
        Opcode::Sdr => {
            let aligned = ea & !7;
            let b = 8 * (7 - (ea & 7) as u64);
            let keep = bus.read_u64(aligned) & mask_low64(b);
            bus.write_u64(aligned, keep | (rt << b));
        }

        Opcode::Cache => (),
        Opcode::Cop2 => {
            return Some(raise_exception(cpu, 11, pc, in_delay));
        }

        Opcode::Cop0 => return cop0_op(cpu, ins, pc, in_delay),
        Opcode::Cop1 => return cop1(cpu, bus, ins, pc, in_delay),
        Opcode::Lwc1 => {
            let value = bus.read_u32(ea);
            cpu.fpr[ins.ft()] = value as u64;
        }
        Opcode::Ldc1 => cpu.fpr[ins.ft()] = bus.read_u64(ea),
        Opcode::Swc1 => bus.write_u32(ea, cpu.fpr[ins.ft()] as u32),
        Opcode::Sdc1 => bus.write_u64(ea, cpu.fpr[ins.ft()]),
    }

    None
}

fn mask_low(bits: u32) -> u32 {
    if bits >= 32 { !0 } else { (1u32 << bits) - 1 }
}

fn mask_low64(bits: u64) -> u64 {
    if bits >= 64 { !0 } else { (1u64 << bits) - 1 }
}

fn special(cpu: &mut Cpu, bus: &mut impl Bus, ins: Ins, pc: u32, in_delay: bool) -> Option<u32> {
    let Some(func) = ins.special() else {
        return Some(raise_exception(cpu, 10, pc, in_delay));
    };

    let rs = cpu.reg(ins.rs());
    let rt = cpu.reg(ins.rt());
    let rs32 = rs as u32;
    let rt32 = rt as u32;

    match func {
        Special::Sll => cpu.set_reg(ins.rd(), sext32(rt32 << ins.sa())),
        Special::Srl => cpu.set_reg(ins.rd(), sext32(rt32 >> ins.sa())),
        Special::Sra => cpu.set_reg(ins.rd(), sext32(((rt32 as i32) >> ins.sa()) as u32)),
        Special::Sllv => cpu.set_reg(ins.rd(), sext32(rt32 << (rs32 & 0x1F))),
        Special::Srlv => cpu.set_reg(ins.rd(), sext32(rt32 >> (rs32 & 0x1F))),
        Special::Srav => cpu.set_reg(ins.rd(), sext32(((rt32 as i32) >> (rs32 & 0x1F)) as u32)),

        Special::Jr => {
            run_delay_slot(cpu, bus, pc);
            return Some(rs32);
        }
        Special::Jalr => {
            cpu.set_reg(ins.rd(), sext32(pc.wrapping_add(8)));
            run_delay_slot(cpu, bus, pc);
            return Some(rs32);
        }

        Special::Movz => {
            if rt == 0 {
                cpu.set_reg(ins.rd(), rs);
            }
        }
        Special::Movn => {
            if rt != 0 {
                cpu.set_reg(ins.rd(), rs);
            }
        }

        Special::Syscall => return Some(raise_exception(cpu, 8, pc, in_delay)),
        Special::Break => return Some(raise_exception(cpu, 9, pc, in_delay)),
        Special::Sync => (),

        Special::Mfhi => cpu.set_reg(ins.rd(), cpu.hi),
        Special::Mthi => cpu.hi = rs,
        Special::Mflo => cpu.set_reg(ins.rd(), cpu.lo),
        Special::Mtlo => cpu.lo = rs,

        Special::Dsllv => cpu.set_reg(ins.rd(), rt << (rs & 0x3F)),
        Special::Dsrlv => cpu.set_reg(ins.rd(), rt >> (rs & 0x3F)),
        Special::Dsrav => cpu.set_reg(ins.rd(), ((rt as i64) >> (rs & 0x3F)) as u64),

        Special::Mult => {
            let prod = (rs32 as i32 as i64) * (rt32 as i32 as i64);
            cpu.lo = sext32(prod as u32);
            cpu.hi = sext32((prod >> 32) as u32);
        }
        Special::Multu => {
            let prod = (rs32 as u64) * (rt32 as u64);
            cpu.lo = sext32(prod as u32);
            cpu.hi = sext32((prod >> 32) as u32);
        }
        Special::Div => {
            let (n, d) = (rs32 as i32, rt32 as i32);
            if d == 0 {
                cpu.lo = if n >= 0 { u64::MAX } else { 1 };
                cpu.hi = sext32(n as u32);
            } else if n == i32::MIN && d == -1 {
                cpu.lo = sext32(i32::MIN as u32);
                cpu.hi = 0;
            } else {
                cpu.lo = sext32((n / d) as u32);
                cpu.hi = sext32((n % d) as u32);
            }
        }
        Special::Divu => {
            let (n, d) = (rs32, rt32);
            if d == 0 {
                cpu.lo = u64::MAX;
                cpu.hi = sext32(n);
            } else {
                cpu.lo = sext32(n / d);
                cpu.hi = sext32(n % d);
            }
        }
        Special::Dmult => {
            let prod = (rs as i64 as i128) * (rt as i64 as i128);
            cpu.lo = prod as u64;
            cpu.hi = (prod >> 64) as u64;
        }
        Special::Dmultu => {
            let prod = (rs as u128) * (rt as u128);
            cpu.lo = prod as u64;
            cpu.hi = (prod >> 64) as u64;
        }
        Special::Ddiv => {
            let (n, d) = (rs as i64, rt as i64);
            if d == 0 {
                cpu.lo = if n >= 0 { u64::MAX } else { 1 };
                cpu.hi = n as u64;
            } else if n == i64::MIN && d == -1 {
                cpu.lo = n as u64;
                cpu.hi = 0;
            } else {
                cpu.lo = (n / d) as u64;
                cpu.hi = (n % d) as u64;
            }
        }
        Special::Ddivu => {
            if rt == 0 {
                cpu.lo = u64::MAX;
                cpu.hi = rs;
            } else {
                cpu.lo = rs / rt;
                cpu.hi = rs % rt;
            }
        }

        Special::Add | Special::Addu => cpu.set_reg(ins.rd(), sext32(rs32.wrapping_add(rt32))),
        Special::Sub | Special::Subu => cpu.set_reg(ins.rd(), sext32(rs32.wrapping_sub(rt32))),
        Special::And => cpu.set_reg(ins.rd(), rs & rt),
        Special::Or => cpu.set_reg(ins.rd(), rs | rt),
        Special::Xor => cpu.set_reg(ins.rd(), rs ^ rt),
        Special::Nor => cpu.set_reg(ins.rd(), !(rs | rt)),
        Special::Slt => cpu.set_reg(ins.rd(), ((rs as i64) < rt as i64) as u64),
        Special::Sltu => cpu.set_reg(ins.rd(), (rs < rt) as u64),

        Special::Dadd | Special::Daddu => cpu.set_reg(ins.rd(), rs.wrapping_add(rt)),
        Special::Dsub | Special::Dsubu => cpu.set_reg(ins.rd(), rs.wrapping_sub(rt)),

        Special::Tge => {
            if (rs as i64) >= rt as i64 {
                return Some(raise_exception(cpu, 13, pc, in_delay));
            }
        }
        Special::Tgeu => {
            if rs >= rt {
                return Some(raise_exception(cpu, 13, pc, in_delay));
            }
        }
        Special::Tlt => {
            if (rs as i64) < rt as i64 {
                return Some(raise_exception(cpu, 13, pc, in_delay));
            }
        }
        Special::Tltu => {
            if rs < rt {
                return Some(raise_exception(cpu, 13, pc, in_delay));
            }
        }
        Special::Teq => {
            if rs == rt {
                return Some(raise_exception(cpu, 13, pc, in_delay));
            }
        }
        Special::Tne => {
            if rs != rt {
                return Some(raise_exception(cpu, 13, pc, in_delay));
            }
        }

        Special::Dsll => cpu.set_reg(ins.rd(), rt << ins.sa()),
        Special::Dsrl => cpu.set_reg(ins.rd(), rt >> ins.sa()),
        Special::Dsra => cpu.set_reg(ins.rd(), ((rt as i64) >> ins.sa()) as u64),
        Special::Dsll32 => cpu.set_reg(ins.rd(), rt << (ins.sa() + 32)),
        Special::Dsrl32 => cpu.set_reg(ins.rd(), rt >> (ins.sa() + 32)),
        Special::Dsra32 => cpu.set_reg(ins.rd(), ((rt as i64) >> (ins.sa() + 32)) as u64),
    }

    None
}

fn regimm(cpu: &mut Cpu, bus: &mut impl Bus, ins: Ins, pc: u32, in_delay: bool) -> Option<u32> {
    let Some(op) = ins.regimm() else {
        return Some(raise_exception(cpu, 10, pc, in_delay));
    };

    let rs = cpu.reg(ins.rs()) as i64;
    let simm = ins.simm();

    match op {
        Regimm::Bltz => branch(cpu, bus, pc, rs < 0, simm, false, false),
        Regimm::Bgez => branch(cpu, bus, pc, rs >= 0, simm, false, false),
        Regimm::Bltzl => branch(cpu, bus, pc, rs < 0, simm, false, true),
        Regimm::Bgezl => branch(cpu, bus, pc, rs >= 0, simm, false, true),
        Regimm::Bltzal => branch(cpu, bus, pc, rs < 0, simm, true, false),
        Regimm::Bgezal => branch(cpu, bus, pc, rs >= 0, simm, true, false),
        Regimm::Bltzall => branch(cpu, bus, pc, rs < 0, simm, true, true),
        Regimm::Bgezall => branch(cpu, bus, pc, rs >= 0, simm, true, true),
        Regimm::Tgei => (rs >= simm as i64).then(|| raise_exception(cpu, 13, pc, in_delay)),
        Regimm::Tgeiu => {
            ((rs as u64) >= simm as i64 as u64).then(|| raise_exception(cpu, 13, pc, in_delay))
        }
        Regimm::Tlti => (rs < simm as i64).then(|| raise_exception(cpu, 13, pc, in_delay)),
        Regimm::Tltiu => {
            ((rs as u64) < simm as i64 as u64).then(|| raise_exception(cpu, 13, pc, in_delay))
        }
        Regimm::Teqi => (rs == simm as i64).then(|| raise_exception(cpu, 13, pc, in_delay)),
        Regimm::Tnei => (rs != simm as i64).then(|| raise_exception(cpu, 13, pc, in_delay)),
    }
}

fn cop0_op(cpu: &mut Cpu, ins: Ins, pc: u32, in_delay: bool) -> Option<u32> {
    if ins.rs() & 0x10 != 0 {
        // CO space
        return match Cop0Func::from_repr(ins.funct()) {
            Some(Cop0Func::Eret) => {
                cpu.cop0.regs[cop0::STATUS] &= !0x2;
                cpu.ll_bit = 0;
                Some(cpu.cop0.regs[cop0::EPC])
            }
            // No TLB model; the direct-mapped segments never miss.
            Some(Cop0Func::Tlbr | Cop0Func::Tlbwi | Cop0Func::Tlbwr | Cop0Func::Tlbp) => None,
            None => Some(raise_exception(cpu, 10, pc, in_delay)),
        };
    }

    match ins.cop_rs() {
        Some(CopRs::Mf) => {
            let value = cpu.cop0.regs[ins.rd()];
            cpu.set_reg(ins.rt(), sext32(value));
            None
        }
        Some(CopRs::Dmf) => {
            let value = cpu.cop0.regs[ins.rd()];
            cpu.set_reg(ins.rt(), value as u64);
            None
        }
        Some(CopRs::Mt | CopRs::Dmt) => {
            cpu.cop0.regs[ins.rd()] = cpu.reg(ins.rt()) as u32;
            None
        }
        _ => Some(raise_exception(cpu, 10, pc, in_delay)),
    }
}

fn fpr_s(cpu: &Cpu, index: usize) -> f32 {
    f32::from_bits(cpu.fpr[index] as u32)
}

fn fpr_d(cpu: &Cpu, index: usize) -> f64 {
    f64::from_bits(cpu.fpr[index])
}

fn set_fpr_s(cpu: &mut Cpu, index: usize, value: f32) {
    cpu.fpr[index] = value.to_bits() as u64;
}

fn set_fpr_d(cpu: &mut Cpu, index: usize, value: f64) {
    cpu.fpr[index] = value.to_bits();
}

fn cop1(cpu: &mut Cpu, bus: &mut impl Bus, ins: Ins, pc: u32, in_delay: bool) -> Option<u32> {
    match ins.cop_rs() {
        Some(CopRs::Mf) => {
            cpu.set_reg(ins.rt(), sext32(cpu.fpr[ins.fs()] as u32));
            return None;
        }
        Some(CopRs::Dmf) => {
            cpu.set_reg(ins.rt(), cpu.fpr[ins.fs()]);
            return None;
        }
        Some(CopRs::Mt) => {
            cpu.fpr[ins.fs()] = cpu.reg(ins.rt()) as u32 as u64;
            return None;
        }
        Some(CopRs::Dmt) => {
            cpu.fpr[ins.fs()] = cpu.reg(ins.rt());
            return None;
        }
        Some(CopRs::Cf) => {
            let value = if ins.fs() == 31 { cpu.fcr31 } else { 0 };
            cpu.set_reg(ins.rt(), sext32(value));
            return None;
        }
        Some(CopRs::Ct) => {
            if ins.fs() == 31 {
                cpu.fcr31 = cpu.reg(ins.rt()) as u32;
            }
            return None;
        }
        Some(CopRs::Bc) => {
            let true_form = ins.rt() & 1 != 0;
            let likely = ins.rt() & 2 != 0;
            let cond = cpu.fcr31 & FCR31_CONDITION != 0;
            return branch(cpu, bus, pc, cond == true_form, ins.simm(), false, likely);
        }
        None => (),
    }

    let Some(fmt) = FpuFmt::from_repr(ins.rs() as u8) else {
        return Some(raise_exception(cpu, 10, pc, in_delay));
    };

    match fmt {
        FpuFmt::S => fpu_s(cpu, ins),
        FpuFmt::D => fpu_d(cpu, ins),
        FpuFmt::W => {
            let source = cpu.fpr[ins.fs()] as u32 as i32;
            match ins.funct() {
                32 => set_fpr_s(cpu, ins.fd(), source as f32),
                33 => set_fpr_d(cpu, ins.fd(), source as f64),
                _ => return Some(raise_exception(cpu, 10, pc, in_delay)),
            }
        }
        FpuFmt::L => {
            let source = cpu.fpr[ins.fs()] as i64;
            match ins.funct() {
                32 => set_fpr_s(cpu, ins.fd(), source as f32),
                33 => set_fpr_d(cpu, ins.fd(), source as f64),
                _ => return Some(raise_exception(cpu, 10, pc, in_delay)),
            }
        }
    }

    None
}

fn fpu_compare(cond: u8, less: bool, equal: bool, unordered: bool) -> bool {
    ((cond & 0b100 != 0) && less) || ((cond & 0b010 != 0) && equal) || ((cond & 0b001 != 0) && unordered)
}

fn fpu_s(cpu: &mut Cpu, ins: Ins) {
    let fs = fpr_s(cpu, ins.fs());
    let ft = fpr_s(cpu, ins.ft());
    match ins.funct() {
        0 => set_fpr_s(cpu, ins.fd(), fs + ft),
        1 => set_fpr_s(cpu, ins.fd(), fs - ft),
        2 => set_fpr_s(cpu, ins.fd(), fs * ft),
        3 => set_fpr_s(cpu, ins.fd(), fs / ft),
        4 => set_fpr_s(cpu, ins.fd(), fs.sqrt()),
        5 => set_fpr_s(cpu, ins.fd(), fs.abs()),
        6 => cpu.fpr[ins.fd()] = cpu.fpr[ins.fs()],
        7 => set_fpr_s(cpu, ins.fd(), -fs),
        8 => cpu.fpr[ins.fd()] = fs.round_ties_even() as i64 as u64,
        9 => cpu.fpr[ins.fd()] = fs.trunc() as i64 as u64,
        10 => cpu.fpr[ins.fd()] = fs.ceil() as i64 as u64,
        11 => cpu.fpr[ins.fd()] = fs.floor() as i64 as u64,
        12 => cpu.fpr[ins.fd()] = fs.round_ties_even() as i32 as u32 as u64,
        13 => cpu.fpr[ins.fd()] = fs.trunc() as i32 as u32 as u64,
        14 => cpu.fpr[ins.fd()] = fs.ceil() as i32 as u32 as u64,
        15 => cpu.fpr[ins.fd()] = fs.floor() as i32 as u32 as u64,
        33 => set_fpr_d(cpu, ins.fd(), fs as f64),
        36 => cpu.fpr[ins.fd()] = fs.trunc() as i32 as u32 as u64,
        37 => cpu.fpr[ins.fd()] = fs.trunc() as i64 as u64,
        f @ 48..=63 => {
            let cond = (f - 48) as u8;
            let unordered = fs.is_nan() || ft.is_nan();
            let result = fpu_compare(cond, fs < ft, fs == ft, unordered);
            cpu.fcr31 = (cpu.fcr31 & !FCR31_CONDITION) | ((result as u32) << 23);
        }
        _ => tracing::warn!(word = ins.word(), "unimplemented FPU.S function"),
    }
}

fn fpu_d(cpu: &mut Cpu, ins: Ins) {
    let fs = fpr_d(cpu, ins.fs());
    let ft = fpr_d(cpu, ins.ft());
    match ins.funct() {
        0 => set_fpr_d(cpu, ins.fd(), fs + ft),
        1 => set_fpr_d(cpu, ins.fd(), fs - ft),
        2 => set_fpr_d(cpu, ins.fd(), fs * ft),
        3 => set_fpr_d(cpu, ins.fd(), fs / ft),
        4 => set_fpr_d(cpu, ins.fd(), fs.sqrt()),
        5 => set_fpr_d(cpu, ins.fd(), fs.abs()),
        6 => cpu.fpr[ins.fd()] = cpu.fpr[ins.fs()],
        7 => set_fpr_d(cpu, ins.fd(), -fs),
        8 => cpu.fpr[ins.fd()] = fs.round_ties_even() as i64 as u64,
        9 => cpu.fpr[ins.fd()] = fs.trunc() as i64 as u64,
        10 => cpu.fpr[ins.fd()] = fs.ceil() as i64 as u64,
        11 => cpu.fpr[ins.fd()] = fs.floor() as i64 as u64,
        12 => cpu.fpr[ins.fd()] = fs.round_ties_even() as i32 as u32 as u64,
        13 => cpu.fpr[ins.fd()] = fs.trunc() as i32 as u32 as u64,
        14 => cpu.fpr[ins.fd()] = fs.ceil() as i32 as u32 as u64,
        15 => cpu.fpr[ins.fd()] = fs.floor() as i32 as u32 as u64,
        32 => set_fpr_s(cpu, ins.fd(), fs as f32),
        36 => cpu.fpr[ins.fd()] = fs.trunc() as i32 as u32 as u64,
        37 => cpu.fpr[ins.fd()] = fs.trunc() as i64 as u64,
        f @ 48..=63 => {
            let cond = (f - 48) as u8;
            let unordered = fs.is_nan() || ft.is_nan();
            let result = fpu_compare(cond, fs < ft, fs == ft, unordered);
            cpu.fcr31 = (cpu.fcr31 & !FCR31_CONDITION) | ((result as u32) << 23);
        }
        _ => tracing::warn!(word = ins.word(), "unimplemented FPU.D function"),
    }
}

/// Runs one instruction at `cpu.pc`, updating the PC. Returns the number of
/// guest instructions retired (delay slots count).
pub fn step(cpu: &mut Cpu, bus: &mut impl Bus) -> u32 {
    let pc = cpu.pc;
    let ins = Ins(bus.read_u32(pc));
    let retired = if ins.is_branch() { 2 } else { 1 };
    match interp_one(cpu, bus, ins, pc, false) {
        Some(next) => cpu.pc = next,
        None => cpu.pc = pc.wrapping_add(4),
    }
    cpu.gpr[0] = 0;
    retired
}
