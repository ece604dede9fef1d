use vr4300::{Address, Ins, REG_HI, REG_LO};

use super::{BlockBuilder, Outcome};
use crate::TranslateError;
use crate::emitter::{Alu, Cc, Reg};
use crate::regcache::{SCRATCH, SCRATCH2};

/// Integer arithmetic. All 32-bit results are kept as canonical
/// sign-extended values: the high half is synthesized at store-back.
impl BlockBuilder<'_> {
    pub(super) fn addiu(&mut self, ins: Ins) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map_new(&mut self.em, ins.rt());
        self.bin_imm(Alu::Add, rt, rs, ins.simm());
        Ok(Outcome::Success)
    }

    pub(super) fn slti(&mut self, ins: Ins, signed: bool) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map_new(&mut self.em, ins.rt());
        self.em.alu_ri(Alu::Cmp, rs, ins.simm());
        self.em.set_bool(if signed { Cc::L } else { Cc::B }, rt);
        Ok(Outcome::Success)
    }

    pub(super) fn addu(&mut self, ins: Ins) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map(&mut self.em, ins.rt());
        let rd = self.regs.map_new(&mut self.em, ins.rd());
        self.bin_commutative(Alu::Add, rd, rs, rt);
        Ok(Outcome::Success)
    }

    pub(super) fn subu(&mut self, ins: Ins) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map(&mut self.em, ins.rt());
        let rd = self.regs.map_new(&mut self.em, ins.rd());
        self.bin(Alu::Sub, rd, rs, rt);
        Ok(Outcome::Success)
    }

    pub(super) fn slt(&mut self, ins: Ins, signed: bool) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map(&mut self.em, ins.rt());
        let rd = self.regs.map_new(&mut self.em, ins.rd());
        self.em.alu_rr(Alu::Cmp, rs, rt);
        self.em.set_bool(if signed { Cc::L } else { Cc::B }, rd);
        Ok(Outcome::Success)
    }

    /// MOVZ/MOVN: the destination keeps its value when the condition
    /// fails, so its current value is loaded first.
    pub(super) fn movcc(&mut self, ins: Ins, on_zero: bool) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map(&mut self.em, ins.rt());
        self.regs.map(&mut self.em, ins.rd());
        let rd = self.regs.map_new(&mut self.em, ins.rd());
        self.em.test_rr(rt, rt);
        self.em.cmovcc(if on_zero { Cc::E } else { Cc::Ne }, rd, rs);
        Ok(Outcome::Success)
    }

    /// MULT/MULTU. The host widening multiply pins EDX:EAX, so EDX is
    /// claimed away from the cache first.
    pub(super) fn mult(
        &mut self,
        ins: Ins,
        pc: Address,
        signed: bool,
    ) -> Result<Outcome, TranslateError> {
        if self.settings.interpret_mult {
            return self.call_interp(ins, pc);
        }

        self.regs.claim(&mut self.em, Reg::Rdx);
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map(&mut self.em, ins.rt());
        let hi = self.regs.map_new(&mut self.em, REG_HI);
        let lo = self.regs.map_new(&mut self.em, REG_LO);

        if ins.rs() == 0 || ins.rt() == 0 {
            self.em.mov_ri(lo, 0);
            self.em.mov_ri(hi, 0);
        } else {
            self.em.mov_rr(Reg::Rax, rs);
            if signed {
                self.em.imul_r(rt);
            } else {
                self.em.mul_r(rt);
            }
            self.em.mov_rr(lo, Reg::Rax);
            self.em.mov_rr(hi, Reg::Rdx);
        }

        self.regs.release_host(Reg::Rdx);
        Ok(Outcome::Success)
    }

    pub(super) fn daddiu(&mut self, ins: Ins, pc: Address) -> Result<Outcome, TranslateError> {
        if self.settings.interpret_doubleword {
            return self.call_interp(ins, pc);
        }

        let rs = self.regs.map64(&mut self.em, ins.rs());
        let rt = self.regs.map64_new(&mut self.em, ins.rt());
        let imm = ins.simm();

        self.em.mov_rr(SCRATCH, rs.lo);
        self.em.alu_ri(Alu::Add, SCRATCH, imm);
        self.em.mov_rr(SCRATCH2, rs.hi);
        self.em.alu_ri(Alu::Adc, SCRATCH2, imm >> 31);
        self.em.mov_rr(rt.lo, SCRATCH);
        self.em.mov_rr(rt.hi, SCRATCH2);
        Ok(Outcome::Success)
    }

    pub(super) fn daddu(&mut self, ins: Ins, pc: Address) -> Result<Outcome, TranslateError> {
        if self.settings.interpret_doubleword {
            return self.call_interp(ins, pc);
        }

        let rs = self.regs.map64(&mut self.em, ins.rs());
        let rt = self.regs.map64(&mut self.em, ins.rt());
        let rd = self.regs.map64_new(&mut self.em, ins.rd());

        self.em.mov_rr(SCRATCH, rs.lo);
        self.em.alu_rr(Alu::Add, SCRATCH, rt.lo);
        self.em.mov_rr(SCRATCH2, rs.hi);
        self.em.alu_rr(Alu::Adc, SCRATCH2, rt.hi);
        self.em.mov_rr(rd.lo, SCRATCH);
        self.em.mov_rr(rd.hi, SCRATCH2);
        Ok(Outcome::Success)
    }

    pub(super) fn dsubu(&mut self, ins: Ins, pc: Address) -> Result<Outcome, TranslateError> {
        if self.settings.interpret_doubleword {
            return self.call_interp(ins, pc);
        }

        let rs = self.regs.map64(&mut self.em, ins.rs());
        let rt = self.regs.map64(&mut self.em, ins.rt());
        let rd = self.regs.map64_new(&mut self.em, ins.rd());

        self.em.mov_rr(SCRATCH, rs.lo);
        self.em.alu_rr(Alu::Sub, SCRATCH, rt.lo);
        self.em.mov_rr(SCRATCH2, rs.hi);
        self.em.alu_rr(Alu::Sbb, SCRATCH2, rt.hi);
        self.em.mov_rr(rd.lo, SCRATCH);
        self.em.mov_rr(rd.hi, SCRATCH2);
        Ok(Outcome::Success)
    }
}
