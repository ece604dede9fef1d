use vr4300::Ins;

use super::{BlockBuilder, Outcome};
use crate::TranslateError;

/// HI/LO moves. HI and LO live in the same 34-entry register model as the
/// GPRs, so these are plain 64-bit register-to-register copies.
impl BlockBuilder<'_> {
    pub(super) fn mfhilo(&mut self, ins: Ins, which: usize) -> Result<Outcome, TranslateError> {
        let src = self.regs.map64(&mut self.em, which);
        let rd = self.regs.map64_new(&mut self.em, ins.rd());
        self.em.mov_rr(rd.lo, src.lo);
        self.em.mov_rr(rd.hi, src.hi);
        Ok(Outcome::Success)
    }

    pub(super) fn mthilo(&mut self, ins: Ins, which: usize) -> Result<Outcome, TranslateError> {
        let rs = self.regs.map64(&mut self.em, ins.rs());
        let dst = self.regs.map64_new(&mut self.em, which);
        self.em.mov_rr(dst.lo, rs.lo);
        self.em.mov_rr(dst.hi, rs.hi);
        Ok(Outcome::Success)
    }
}
