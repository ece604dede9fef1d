use vr4300::{Address, Ins};

use super::{BlockBuilder, Outcome};
use crate::TranslateError;
use crate::emitter::{Alu, Cc, Reg};
use crate::hooks::{ENV_CTX, ENV_INTERP, ENV_UPDATE_COUNT};
use crate::jumps::JumpKind;
use crate::regcache::{ENV_BASE, SCRATCH};

impl BlockBuilder<'_> {
    /// `dst = a op b` for commutative operations; any operand may alias.
    pub(super) fn bin_commutative(&mut self, op: Alu, dst: Reg, a: Reg, b: Reg) {
        if dst == a {
            self.em.alu_rr(op, dst, b);
        } else if dst == b {
            self.em.alu_rr(op, dst, a);
        } else {
            self.em.mov_rr(dst, a);
            self.em.alu_rr(op, dst, b);
        }
    }

    /// `dst = a op b` for non-commutative operations; goes through the
    /// scratch when the destination aliases the right operand.
    pub(super) fn bin(&mut self, op: Alu, dst: Reg, a: Reg, b: Reg) {
        if dst == b && dst != a {
            self.em.mov_rr(SCRATCH, a);
            self.em.alu_rr(op, SCRATCH, b);
            self.em.mov_rr(dst, SCRATCH);
        } else if dst == a {
            self.em.alu_rr(op, dst, b);
        } else {
            self.em.mov_rr(dst, a);
            self.em.alu_rr(op, dst, b);
        }
    }

    /// `dst = src op imm`.
    pub(super) fn bin_imm(&mut self, op: Alu, dst: Reg, src: Reg, imm: i32) {
        if dst != src {
            self.em.mov_rr(dst, src);
        }
        self.em.alu_ri(op, dst, imm);
    }

    /// Unit-relative index of a guest address within this unit.
    pub(super) fn index_of(&self, pc: Address) -> usize {
        ((pc - self.start) / 4) as usize
    }

    /// Whether a branch's relative target lies outside the unit.
    /// `base` is the unit-relative index of the branch's delay slot.
    pub(super) fn is_j_out_rel(&self, base: usize, offset: i32) -> bool {
        let dst = base as i64 + offset as i64;
        dst < 0 || dst >= self.code_addr.len() as i64
    }

    /// Whether an absolute guest target lies outside the unit.
    pub(super) fn is_j_out_abs(&self, target: Address) -> bool {
        target.value() < self.start.value() || target.value() >= self.end.value()
    }

    /// Re-records the current instruction's entry point after a flush, so a
    /// jump landing on it does not replay stores that belong to the
    /// fall-in path.
    pub(super) fn reset_code_addr(&mut self) {
        let index = self.cursor.index() - 1;
        if let Some(slot) = self.code_addr.get_mut(index) {
            *slot = Some(self.em.len());
        }
    }

    /// Emits `jmp` to the unit's jump pad, recorded for fixup. The next
    /// guest address must already be in EAX.
    pub(super) fn add_exit_jump(&mut self) -> Result<(), TranslateError> {
        let patch = self.em.jmp();
        self.jumps.add(JumpKind::Call, patch.0)?;
        Ok(())
    }

    /// Calls the cycle-accounting hook. Afterwards EAX holds the cycles
    /// remaining until the next event (non-positive: interrupt due).
    /// All register mappings must have been flushed.
    pub(super) fn gen_update_count(&mut self, resume: Address) {
        self.em.load64(Reg::Rdi, ENV_BASE, ENV_CTX);
        self.em.mov_ri(Reg::Rsi, resume.value());
        self.em.call_mem(ENV_BASE, ENV_UPDATE_COUNT);
    }

    /// Emits a call into the interpreter fallback for `ins`. If the
    /// interpreter redirects control flow, the generated code exits through
    /// the jump pad with the returned address.
    pub(super) fn call_interp(&mut self, ins: Ins, pc: Address) -> Result<Outcome, TranslateError> {
        self.interpreted_loop = true;
        self.regs.flush_all(&mut self.em);
        self.reset_code_addr();

        self.em.load64(Reg::Rdi, ENV_BASE, ENV_CTX);
        self.em.mov_ri(Reg::Rsi, ins.word());
        self.em.mov_ri(Reg::Rdx, pc.value());
        self.em.mov_ri(Reg::Rcx, self.is_delay_slot as u32);
        self.em.call_mem(ENV_BASE, ENV_INTERP);

        self.em.test_rr(Reg::Rax, Reg::Rax);
        let fall_through = self.em.jcc(Cc::E);
        self.add_exit_jump()?;
        self.em.bind(fall_through);

        // an interpreted branch has run its delay slot already; the slot is
        // still re-translated in place in case something jumps into it
        if ins.is_branch() {
            self.delay_slot_next = true;
        }

        Ok(Outcome::Interpreted)
    }

    /// No handler exists for this encoding. The interpreter will raise the
    /// reserved-instruction exception at run time.
    pub(super) fn illegal(&mut self, ins: Ins, pc: Address) -> Result<Outcome, TranslateError> {
        tracing::warn!(word = ins.word(), pc = %pc, "illegal instruction");
        self.call_interp(ins, pc)?;
        Ok(Outcome::Error)
    }
}
