use vr4300::{Address, Ins};

use super::{BlockBuilder, DShift, Outcome};
use crate::TranslateError;
use crate::emitter::Shift;
use crate::regcache::{SCRATCH, SCRATCH2};

impl BlockBuilder<'_> {
    /// SLL/SRL/SRA.
    pub(super) fn shift_imm(&mut self, ins: Ins, op: Shift) -> Result<Outcome, TranslateError> {
        let rt = self.regs.map(&mut self.em, ins.rt());
        let rd = self.regs.map_new(&mut self.em, ins.rd());
        if rd != rt {
            self.em.mov_rr(rd, rt);
        }
        self.em.shift_ri(op, rd, ins.sa() as u8);
        Ok(Outcome::Success)
    }

    /// SLLV/SRLV/SRAV. The host masks the CL count to 5 bits, which is
    /// exactly the guest semantic.
    pub(super) fn shift_var(&mut self, ins: Ins, op: Shift) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map(&mut self.em, ins.rt());
        let rd = self.regs.map_new(&mut self.em, ins.rd());
        self.em.mov_rr(SCRATCH2, rs);
        if rd != rt {
            self.em.mov_rr(rd, rt);
        }
        self.em.shift_cl(op, rd);
        Ok(Outcome::Success)
    }

    /// Doubleword shifts by immediate, over the register pair. Reads go
    /// through the scratches before any half of the destination is
    /// written, so pair aliasing is a non-issue.
    pub(super) fn dshift_imm(
        &mut self,
        ins: Ins,
        pc: Address,
        kind: DShift,
    ) -> Result<Outcome, TranslateError> {
        if self.settings.interpret_doubleword {
            return self.call_interp(ins, pc);
        }

        let rt = self.regs.map64(&mut self.em, ins.rt());
        let rd = self.regs.map64_new(&mut self.em, ins.rd());
        let sa = ins.sa() as u8;

        match kind {
            DShift::Sll => {
                self.em.mov_rr(SCRATCH, rt.lo);
                self.em.mov_rr(SCRATCH2, rt.hi);
                self.em.shld_ri(SCRATCH2, SCRATCH, sa);
                self.em.shift_ri(Shift::Shl, SCRATCH, sa);
                self.em.mov_rr(rd.lo, SCRATCH);
                self.em.mov_rr(rd.hi, SCRATCH2);
            }
            DShift::Srl => {
                self.em.mov_rr(SCRATCH, rt.lo);
                self.em.mov_rr(SCRATCH2, rt.hi);
                self.em.shrd_ri(SCRATCH, SCRATCH2, sa);
                self.em.shift_ri(Shift::Shr, SCRATCH2, sa);
                self.em.mov_rr(rd.lo, SCRATCH);
                self.em.mov_rr(rd.hi, SCRATCH2);
            }
            DShift::Sra => {
                self.em.mov_rr(SCRATCH, rt.lo);
                self.em.mov_rr(SCRATCH2, rt.hi);
                self.em.shrd_ri(SCRATCH, SCRATCH2, sa);
                self.em.shift_ri(Shift::Sar, SCRATCH2, sa);
                self.em.mov_rr(rd.lo, SCRATCH);
                self.em.mov_rr(rd.hi, SCRATCH2);
            }
            DShift::Sll32 => {
                self.em.mov_rr(SCRATCH, rt.lo);
                self.em.shift_ri(Shift::Shl, SCRATCH, sa);
                self.em.mov_rr(rd.hi, SCRATCH);
                self.em.mov_ri(rd.lo, 0);
            }
            DShift::Srl32 => {
                self.em.mov_rr(SCRATCH, rt.hi);
                self.em.shift_ri(Shift::Shr, SCRATCH, sa);
                self.em.mov_rr(rd.lo, SCRATCH);
                self.em.mov_ri(rd.hi, 0);
            }
            DShift::Sra32 => {
                self.em.mov_rr(SCRATCH, rt.hi);
                self.em.shift_ri(Shift::Sar, SCRATCH, sa);
                self.em.mov_rr(SCRATCH2, rt.hi);
                self.em.shift_ri(Shift::Sar, SCRATCH2, 31);
                self.em.mov_rr(rd.lo, SCRATCH);
                self.em.mov_rr(rd.hi, SCRATCH2);
            }
        }

        Ok(Outcome::Success)
    }
}
