//! Branch and jump emission: the shared conditional-branch routine, the
//! absolute and register jumps, and the delay-slot protocol.

use vr4300::{Address, Ins, REG_LR};

use super::{BlockBuilder, Outcome};
use crate::TranslateError;
use crate::emitter::{Alu, Cc, Reg};
use crate::jumps::JumpKind;
use crate::regcache::{CONDITION, REG_BASE, SCRATCH2};

/// Guest branch conditions. Mapped to host condition codes after the
/// compare has been materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cond {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

fn cond_cc(cond: Cond) -> Cc {
    match cond {
        Cond::Eq => Cc::E,
        Cond::Ne => Cc::Ne,
        Cond::Lt => Cc::L,
        Cond::Gt => Cc::G,
        Cond::Le => Cc::Le,
        Cond::Ge => Cc::Ge,
    }
}

/// What the delay slot turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelaySlot {
    /// Real code, translated ahead of the control transfer.
    Code,
    /// The NOP encoding; no code needed.
    Nop,
    /// Past the unit's end (the scanner already flagged the overflow).
    Missing,
}

impl BlockBuilder<'_> {
    /// BEQ/BNE family: compare two registers, then branch.
    pub(super) fn branch_cmp(
        &mut self,
        ins: Ins,
        pc: Address,
        cond: Cond,
        likely: bool,
    ) -> Result<Outcome, TranslateError> {
        if self.settings.interpret_branches {
            return self.call_interp(ins, pc);
        }

        // `beq r, r, -1` spins in place forever; hand it to the interpreter
        // so the interrupt machinery sees it
        if ins.imm() == 0xFFFF && ins.rs() == ins.rt() && cond == Cond::Eq {
            return self.call_interp(ins, pc);
        }

        let rs = self.regs.map(&mut self.em, ins.rs());
        let rt = self.regs.map(&mut self.em, ins.rt());
        self.em.alu_rr(Alu::Cmp, rs, rt);
        self.branch(ins, pc, ins.simm(), Some(cond), false, likely)
    }

    /// BLEZ/BGTZ and the REGIMM forms: compare one register against zero.
    pub(super) fn branch_zero(
        &mut self,
        ins: Ins,
        pc: Address,
        cond: Cond,
        link: bool,
        likely: bool,
    ) -> Result<Outcome, TranslateError> {
        if self.settings.interpret_branches {
            return self.call_interp(ins, pc);
        }

        let rs = self.regs.map(&mut self.em, ins.rs());
        self.em.alu_ri(Alu::Cmp, rs, 0);
        self.branch(ins, pc, ins.simm(), Some(cond), link, likely)
    }

    /// Shared branch emission. The caller has already emitted the compare;
    /// `offset` is in guest instruction words relative to the delay slot.
    fn branch(
        &mut self,
        ins: Ins,
        pc: Address,
        offset: i32,
        cond: Option<Cond>,
        link: bool,
        likely: bool,
    ) -> Result<Outcome, TranslateError> {
        // a branch in the delay slot is a guest program bug; translate the
        // whole thing conservatively through the interpreter
        if self.cursor.peek().is_some_and(|slot| slot.is_branch()) {
            tracing::warn!(pc = %pc, "branch in delay slot, interpreting");
            self.call_interp(ins, pc)?;
            return Ok(Outcome::Warning);
        }

        // materialize the condition while the compare flags are live
        if let Some(cond) = cond {
            self.em.set_bool(cond_cc(cond), CONDITION);
        }

        self.regs.flush_all(&mut self.em);

        // the link register is written before the likely skip, so the skip
        // distance never includes the link stores
        if link {
            let lr = self.regs.map_new(&mut self.em, REG_LR);
            self.em.mov_ri(lr, (pc + 8u32).value());
            self.regs.flush_all(&mut self.em);
        }

        // a likely branch runs its delay slot only when taken
        let likely_skip = if likely {
            self.em.test_rr(CONDITION, CONDITION);
            let patch = self.em.jcc(Cc::E);
            Some(self.jumps.add(JumpKind::Special { landing: 0 }, patch.0)?)
        } else {
            None
        };

        let slot = self.check_delay_slot()?;

        if let Some(id) = likely_skip {
            self.jumps.set_special(id, self.em.len());
        }

        self.gen_update_count(pc + 8u32);

        let base = self.index_of(pc) + 1;
        let target = pc + 4u32 + (offset << 2);
        let resume = pc + 8u32;

        if self.is_j_out_rel(base, offset) {
            // the target is beyond this unit: exit through the jump pad
            match cond {
                Some(_) => {
                    self.em.test_rr(CONDITION, CONDITION);
                    let not_taken = self.em.jcc(Cc::E);
                    self.em.mov_ri(Reg::Rax, target.value());
                    self.add_exit_jump()?;
                    self.em.bind(not_taken);

                    // not taken, but leave anyway if an interrupt came due
                    self.em.test_rr(Reg::Rax, Reg::Rax);
                    let keep_going = self.em.jcc(Cc::G);
                    self.em.mov_ri(Reg::Rax, resume.value());
                    self.add_exit_jump()?;
                    self.em.bind(keep_going);
                }
                None => {
                    self.em.mov_ri(Reg::Rax, target.value());
                    self.add_exit_jump()?;
                }
            }
        } else {
            // resolve the would-be destination, exit if an interrupt is due
            match cond {
                Some(_) => {
                    self.em.test_rr(CONDITION, CONDITION);
                    let taken = self.em.jcc(Cc::Ne);
                    self.em.mov_ri(SCRATCH2, resume.value());
                    let join = self.em.jmp();
                    self.em.bind(taken);
                    self.em.mov_ri(SCRATCH2, target.value());
                    self.em.bind(join);
                }
                None => self.em.mov_ri(SCRATCH2, target.value()),
            }
            self.em.test_rr(Reg::Rax, Reg::Rax);
            let no_interrupt = self.em.jcc(Cc::G);
            self.em.mov_rr(Reg::Rax, SCRATCH2);
            self.add_exit_jump()?;
            self.em.bind(no_interrupt);

            // the branch itself, patched in the fixup pass
            let patch = match cond {
                Some(_) => {
                    self.em.test_rr(CONDITION, CONDITION);
                    self.em.jcc(Cc::Ne)
                }
                None => self.em.jmp(),
            };
            self.jumps.add(
                JumpKind::Branch {
                    base: base as u32,
                    offset,
                },
                patch.0,
            )?;
        }

        self.finish_delay_slot(slot, base, true);
        Ok(Outcome::Success)
    }

    /// J and JAL.
    pub(super) fn jump(
        &mut self,
        ins: Ins,
        pc: Address,
        link: bool,
    ) -> Result<Outcome, TranslateError> {
        if self.settings.interpret_branches {
            return self.call_interp(ins, pc);
        }

        let target = Address((ins.target() << 2) | ((pc + 4u32).value() & 0xF000_0000));

        // a backward jump that has not touched the interpreter since the
        // last merge point could spin without ever seeing an interrupt
        if !link && !self.interpreted_loop && target.value() <= pc.value() {
            return self.call_interp(ins, pc);
        }

        if self.cursor.peek().is_some_and(|slot| slot.is_branch()) {
            tracing::warn!(pc = %pc, "branch in delay slot, interpreting");
            self.call_interp(ins, pc)?;
            return Ok(Outcome::Warning);
        }

        self.regs.flush_all(&mut self.em);
        self.reset_code_addr();

        let slot = self.check_delay_slot()?;

        if link {
            let lr = self.regs.map_new(&mut self.em, REG_LR);
            self.em.mov_ri(lr, (pc + 8u32).value());
            self.regs.flush_all(&mut self.em);
        }

        self.gen_update_count(pc + 8u32);

        if self.is_j_out_abs(target) {
            self.em.mov_ri(Reg::Rax, target.value());
            self.add_exit_jump()?;
        } else {
            self.em.test_rr(Reg::Rax, Reg::Rax);
            let no_interrupt = self.em.jcc(Cc::G);
            self.em.mov_ri(Reg::Rax, target.value());
            self.add_exit_jump()?;
            self.em.bind(no_interrupt);

            let patch = self.em.jmp();
            self.jumps.add(JumpKind::Jump { target }, patch.0)?;
        }

        let base = self.index_of(pc) + 1;
        self.finish_delay_slot(slot, base, false);
        Ok(Outcome::Success)
    }

    /// JR and JALR. Register targets always leave through the jump pad.
    pub(super) fn jump_register(
        &mut self,
        ins: Ins,
        pc: Address,
        link: bool,
    ) -> Result<Outcome, TranslateError> {
        if self.settings.interpret_branches {
            return self.call_interp(ins, pc);
        }

        if self.cursor.peek().is_some_and(|slot| slot.is_branch()) {
            tracing::warn!(pc = %pc, "branch in delay slot, interpreting");
            self.call_interp(ins, pc)?;
            return Ok(Outcome::Warning);
        }

        self.regs.flush_all(&mut self.em);
        self.reset_code_addr();

        // capture the jump target before the delay slot (or the link store,
        // when rd aliases rs) can overwrite it; the condition register is
        // free here and survives the hook calls in between
        self.em
            .load(CONDITION, REG_BASE, (ins.rs() * 8) as i32);

        let slot = self.check_delay_slot()?;

        if link {
            let rd = self.regs.map_new(&mut self.em, ins.rd());
            self.em.mov_ri(rd, (pc + 8u32).value());
            self.regs.flush_all(&mut self.em);
        }

        self.gen_update_count(pc + 8u32);

        self.em.mov_rr(Reg::Rax, CONDITION);
        self.add_exit_jump()?;

        let base = self.index_of(pc) + 1;
        self.finish_delay_slot(slot, base, false);
        Ok(Outcome::Success)
    }

    /// Peeks at the delay slot and, when it holds real code, translates it
    /// ahead of the branch's control transfer.
    fn check_delay_slot(&mut self) -> Result<DelaySlot, TranslateError> {
        self.interpreted_loop = false;
        match self.cursor.peek() {
            None => Ok(DelaySlot::Missing),
            Some(slot) if slot.is_nop() => {
                self.cursor.next();
                Ok(DelaySlot::Nop)
            }
            Some(_) => {
                self.delay_slot_next = true;
                self.translate_one()?;
                Ok(DelaySlot::Code)
            }
        }
    }

    /// After the transfer code: arrange for the delay slot to also exist in
    /// place (in case the guest jumps straight into it), stepped over on
    /// the fall-through path.
    fn finish_delay_slot(&mut self, slot: DelaySlot, slot_index: usize, skip: bool) {
        match slot {
            DelaySlot::Code => {
                if skip {
                    self.pending_skip = Some(self.em.jmp());
                }
                self.cursor.unget();
                self.delay_slot_next = true;
            }
            DelaySlot::Nop => {
                // a jump into the NOP slot resumes right after the branch
                if let Some(entry) = self.code_addr.get_mut(slot_index) {
                    *entry = Some(self.em.len());
                }
            }
            DelaySlot::Missing => (),
        }
    }
}
