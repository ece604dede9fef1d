mod arithmetic;
mod branches;
mod hilo;
mod logic;
mod shift;
mod util;

use vr4300::{Address, Ins, Opcode, Regimm, Special};

use crate::TranslateError;
use crate::block::{CompiledUnit, UnitStats};
use crate::builder::branches::Cond;
use crate::cursor::Cursor;
use crate::emitter::{Emitter, Patch, Reg};
use crate::jumps::JumpTable;
use crate::regcache::RegCache;
use crate::scan::{Scan, TargetBitmap};
use crate::{CodegenSettings, TranslateRequest};

/// Per-instruction translation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Translated to native code.
    Success,
    /// Deliberately routed through the interpreter.
    Interpreted,
    /// Recoverable anomaly (branch in a delay slot); translation continued
    /// conservatively.
    Warning,
    /// No handler for the decoded instruction; it will be interpreted and
    /// the interpreter raises whatever exception applies.
    Error,
}

/// Walks one unit's guest instructions and emits host code.
pub(crate) struct BlockBuilder<'a> {
    em: Emitter,
    regs: RegCache,
    cursor: Cursor<'a>,
    jumps: JumpTable,
    code_addr: Vec<Option<u32>>,
    targets: &'a TargetBitmap,
    settings: &'a CodegenSettings,
    /// Guest range `[start, end)` of the unit.
    start: Address,
    end: Address,
    /// Page-relative index of the unit's first instruction.
    start_index: usize,
    need_pad: bool,
    /// The next translated instruction sits in a delay slot and must have
    /// its registers flushed after it.
    delay_slot_next: bool,
    /// The instruction currently being translated is a delay slot.
    is_delay_slot: bool,
    /// Whether the interpreter has been called since the last merge point
    /// (breaks otherwise uninterruptible idle loops).
    interpreted_loop: bool,
    /// Forward skip over an in-place delay-slot copy, bound by the build
    /// loop once the copy has been re-translated.
    pending_skip: Option<Patch>,
    stats: UnitStats,
}

impl<'a> BlockBuilder<'a> {
    pub fn new(
        req: &TranslateRequest<'a>,
        scan: &'a Scan,
        settings: &'a CodegenSettings,
        start_index: usize,
    ) -> Self {
        let unit_words = &req.words[start_index..scan.end_index];
        let len = unit_words.len();

        let mut builder = Self {
            em: Emitter::new(),
            regs: RegCache::new(),
            cursor: Cursor::new(unit_words, req.start),
            jumps: JumpTable::new(),
            code_addr: vec![None; len],
            targets: &scan.targets,
            settings,
            start: req.start,
            end: req.start + (len * 4) as u32,
            start_index,
            need_pad: scan.need_pad,
            delay_slot_next: false,
            is_delay_slot: false,
            interpreted_loop: false,
            pending_skip: None,
            stats: UnitStats::default(),
        };

        // start from a canonical empty mapping; in-flight values from any
        // abandoned translation are meaningless here
        builder.regs.invalidate_all();

        // the unit may begin inside a delay slot (a jump straight into one)
        if start_index > 0 && Ins(req.words[start_index - 1]).is_branch() {
            builder.delay_slot_next = true;
        }

        builder
    }

    pub fn build(mut self) -> Result<CompiledUnit, TranslateError> {
        let mut pending: Option<Patch> = None;

        while self.cursor.has_next() {
            let index = self.cursor.index();
            if self.targets.get(self.start_index + index) {
                // merge point: any branch landing here must see an empty,
                // canonical register mapping
                self.regs.flush_all(&mut self.em);
                self.interpreted_loop = false;
            }
            self.code_addr[index] = Some(self.em.len());

            match self.translate_one()? {
                Outcome::Success => (),
                Outcome::Warning => self.stats.warnings += 1,
                Outcome::Interpreted | Outcome::Error => self.stats.interpreted += 1,
            }

            // a skip recorded by the previous instruction (a branch) covers
            // exactly the in-place delay-slot copy translated just now
            if let Some(patch) = pending.take() {
                self.em.bind(patch);
            }
            pending = self.pending_skip.take();
        }
        if let Some(patch) = pending {
            self.em.bind(patch);
        }

        self.regs.flush_all(&mut self.em);

        // the jump pad: every exit funnels through the shared return with
        // the next guest address in EAX; falling off the unit's end lands
        // on the entry that reports the first address past the unit
        let pad_fall = self.em.len();
        self.em.mov_ri(Reg::Rax, self.end.value());
        let pad_ret = self.em.len();
        self.em.ret();

        let mut code = self.em.into_bytes();
        self.jumps.resolve(&mut code, &self.code_addr, self.start, pad_ret)?;

        Ok(CompiledUnit {
            start: self.start,
            end: self.end,
            need_pad: self.need_pad,
            code,
            code_addr: self.code_addr.into_boxed_slice(),
            pad_fall,
            pad_ret,
            stats: self.stats,
        })
    }

    /// Translates the next instruction.
    fn translate_one(&mut self) -> Result<Outcome, TranslateError> {
        let ins = self.cursor.next();
        let pc = self.cursor.pc();
        let in_delay = std::mem::take(&mut self.delay_slot_next);
        self.is_delay_slot = in_delay;
        self.stats.instructions += 1;

        let outcome = self.dispatch(ins, pc)?;

        // delay-slot effects must be in memory before the transfer
        if in_delay {
            self.regs.flush_all(&mut self.em);
        }

        Ok(outcome)
    }

    fn dispatch(&mut self, ins: Ins, pc: Address) -> Result<Outcome, TranslateError> {
        let Some(op) = ins.opcode() else {
            return self.illegal(ins, pc);
        };

        match op {
            Opcode::Special => self.dispatch_special(ins, pc),
            Opcode::Regimm => self.dispatch_regimm(ins, pc),

            Opcode::J => self.jump(ins, pc, false),
            Opcode::Jal => self.jump(ins, pc, true),
            Opcode::Beq => self.branch_cmp(ins, pc, Cond::Eq, false),
            Opcode::Bne => self.branch_cmp(ins, pc, Cond::Ne, false),
            Opcode::Blez => self.branch_zero(ins, pc, Cond::Le, false, false),
            Opcode::Bgtz => self.branch_zero(ins, pc, Cond::Gt, false, false),
            Opcode::Beql => self.branch_cmp(ins, pc, Cond::Eq, true),
            Opcode::Bnel => self.branch_cmp(ins, pc, Cond::Ne, true),
            Opcode::Blezl => self.branch_zero(ins, pc, Cond::Le, false, true),
            Opcode::Bgtzl => self.branch_zero(ins, pc, Cond::Gt, false, true),

            Opcode::Addi | Opcode::Addiu => self.addiu(ins),
            Opcode::Slti => self.slti(ins, true),
            Opcode::Sltiu => self.slti(ins, false),
            Opcode::Andi => self.andi(ins),
            Opcode::Ori => self.ori(ins),
            Opcode::Xori => self.xori(ins),
            Opcode::Lui => self.lui(ins),
            Opcode::Daddi | Opcode::Daddiu => self.daddiu(ins, pc),

            // coprocessor work runs in the interpreter (BC1 included; it is
            // a branch, which the fallback call site accounts for)
            Opcode::Cop0 | Opcode::Cop1 | Opcode::Cop2 => self.call_interp(ins, pc),

            // loads and stores go through the guest bus in the interpreter
            // in this configuration
            Opcode::Lb
            | Opcode::Lbu
            | Opcode::Lh
            | Opcode::Lhu
            | Opcode::Lw
            | Opcode::Lwu
            | Opcode::Lwl
            | Opcode::Lwr
            | Opcode::Ld
            | Opcode::Ldl
            | Opcode::Ldr
            | Opcode::Ll
            | Opcode::Lld
            | Opcode::Sb
            | Opcode::Sh
            | Opcode::Sw
            | Opcode::Swl
            | Opcode::Swr
            | Opcode::Sd
            | Opcode::Sdl
            | Opcode::Sdr
            | Opcode::Sc
            | Opcode::Scd
            | Opcode::Cache
            | Opcode::Lwc1
            | Opcode::Ldc1
            | Opcode::Swc1
            | Opcode::Sdc1 => self.call_interp(ins, pc),
        }
    }

    fn dispatch_special(&mut self, ins: Ins, pc: Address) -> Result<Outcome, TranslateError> {
        let Some(func) = ins.special() else {
            return self.illegal(ins, pc);
        };

        match func {
            Special::Sll => self.shift_imm(ins, crate::emitter::Shift::Shl),
            Special::Srl => self.shift_imm(ins, crate::emitter::Shift::Shr),
            Special::Sra => self.shift_imm(ins, crate::emitter::Shift::Sar),
            Special::Sllv => self.shift_var(ins, crate::emitter::Shift::Shl),
            Special::Srlv => self.shift_var(ins, crate::emitter::Shift::Shr),
            Special::Srav => self.shift_var(ins, crate::emitter::Shift::Sar),

            Special::Jr => self.jump_register(ins, pc, false),
            Special::Jalr => self.jump_register(ins, pc, true),

            Special::Movz => self.movcc(ins, true),
            Special::Movn => self.movcc(ins, false),

            Special::Mfhi => self.mfhilo(ins, vr4300::REG_HI),
            Special::Mthi => self.mthilo(ins, vr4300::REG_HI),
            Special::Mflo => self.mfhilo(ins, vr4300::REG_LO),
            Special::Mtlo => self.mthilo(ins, vr4300::REG_LO),

            Special::Mult => self.mult(ins, pc, true),
            Special::Multu => self.mult(ins, pc, false),

            Special::Add | Special::Addu => self.addu(ins),
            Special::Sub | Special::Subu => self.subu(ins),
            Special::And => self.and(ins),
            Special::Or => self.or(ins),
            Special::Xor => self.xor(ins),
            Special::Nor => self.nor(ins),
            Special::Slt => self.slt(ins, true),
            Special::Sltu => self.slt(ins, false),

            Special::Dadd | Special::Daddu => self.daddu(ins, pc),
            Special::Dsub | Special::Dsubu => self.dsubu(ins, pc),
            Special::Dsll => self.dshift_imm(ins, pc, DShift::Sll),
            Special::Dsrl => self.dshift_imm(ins, pc, DShift::Srl),
            Special::Dsra => self.dshift_imm(ins, pc, DShift::Sra),
            Special::Dsll32 => self.dshift_imm(ins, pc, DShift::Sll32),
            Special::Dsrl32 => self.dshift_imm(ins, pc, DShift::Srl32),
            Special::Dsra32 => self.dshift_imm(ins, pc, DShift::Sra32),

            // division has trapping corner cases on the host; the variable
            // doubleword shifts and wide multiplies are not worth the
            // branch-free sequences they would need
            Special::Div
            | Special::Divu
            | Special::Dmult
            | Special::Dmultu
            | Special::Ddiv
            | Special::Ddivu
            | Special::Dsllv
            | Special::Dsrlv
            | Special::Dsrav => self.call_interp(ins, pc),

            Special::Syscall
            | Special::Break
            | Special::Sync
            | Special::Tge
            | Special::Tgeu
            | Special::Tlt
            | Special::Tltu
            | Special::Teq
            | Special::Tne => self.call_interp(ins, pc),
        }
    }

    fn dispatch_regimm(&mut self, ins: Ins, pc: Address) -> Result<Outcome, TranslateError> {
        let Some(op) = ins.regimm() else {
            return self.illegal(ins, pc);
        };

        match op {
            Regimm::Bltz => self.branch_zero(ins, pc, Cond::Lt, false, false),
            Regimm::Bgez => self.branch_zero(ins, pc, Cond::Ge, false, false),
            Regimm::Bltzl => self.branch_zero(ins, pc, Cond::Lt, false, true),
            Regimm::Bgezl => self.branch_zero(ins, pc, Cond::Ge, false, true),
            Regimm::Bltzal => self.branch_zero(ins, pc, Cond::Lt, true, false),
            Regimm::Bgezal => self.branch_zero(ins, pc, Cond::Ge, true, false),
            Regimm::Bltzall => self.branch_zero(ins, pc, Cond::Lt, true, true),
            Regimm::Bgezall => self.branch_zero(ins, pc, Cond::Ge, true, true),

            Regimm::Tgei
            | Regimm::Tgeiu
            | Regimm::Tlti
            | Regimm::Tltiu
            | Regimm::Teqi
            | Regimm::Tnei => self.call_interp(ins, pc),
        }
    }
}

/// Doubleword shift-by-immediate variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DShift {
    Sll,
    Srl,
    Sra,
    Sll32,
    Srl32,
    Sra32,
}
