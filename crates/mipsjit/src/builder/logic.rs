use vr4300::Ins;

use super::{BlockBuilder, Outcome};
use crate::TranslateError;
use crate::emitter::Alu;

impl BlockBuilder<'_> {
    pub(super) fn andi(&mut self, ins: Ins) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map_new(&mut self.em, ins.rt());
        self.bin_imm(Alu::And, rt, rs, ins.imm() as i32);
        Ok(Outcome::Success)
    }

    pub(super) fn ori(&mut self, ins: Ins) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map_new(&mut self.em, ins.rt());
        self.bin_imm(Alu::Or, rt, rs, ins.imm() as i32);
        Ok(Outcome::Success)
    }

    pub(super) fn xori(&mut self, ins: Ins) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map_new(&mut self.em, ins.rt());
        self.bin_imm(Alu::Xor, rt, rs, ins.imm() as i32);
        Ok(Outcome::Success)
    }

    pub(super) fn lui(&mut self, ins: Ins) -> Result<Outcome, TranslateError> {
        let rt = self.regs.map_new(&mut self.em, ins.rt());
        self.em.mov_ri(rt, ins.imm() << 16);
        Ok(Outcome::Success)
    }

    pub(super) fn and(&mut self, ins: Ins) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map(&mut self.em, ins.rt());
        let rd = self.regs.map_new(&mut self.em, ins.rd());
        self.bin_commutative(Alu::And, rd, rs, rt);
        Ok(Outcome::Success)
    }

    pub(super) fn or(&mut self, ins: Ins) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map(&mut self.em, ins.rt());
        let rd = self.regs.map_new(&mut self.em, ins.rd());
        self.bin_commutative(Alu::Or, rd, rs, rt);
        Ok(Outcome::Success)
    }

    pub(super) fn xor(&mut self, ins: Ins) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map(&mut self.em, ins.rt());
        let rd = self.regs.map_new(&mut self.em, ins.rd());
        self.bin_commutative(Alu::Xor, rd, rs, rt);
        Ok(Outcome::Success)
    }

    pub(super) fn nor(&mut self, ins: Ins) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map(&mut self.em, ins.rt());
        let rd = self.regs.map_new(&mut self.em, ins.rd());
        self.bin_commutative(Alu::Or, rd, rs, rt);
        self.em.not(rd);
        Ok(Outcome::Success)
    }
}
