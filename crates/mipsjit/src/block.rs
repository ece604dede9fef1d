use jitcache::{CacheError, ExecAlloc};
use vr4300::Address;

use crate::emitter::{Emitter, Reg};
use crate::hooks::JitEnv;

/// Counters filled during translation of one unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitStats {
    pub instructions: u32,
    pub interpreted: u32,
    pub warnings: u32,
}

/// One translated span of guest code, finalized but not yet placed in
/// executable memory.
pub struct CompiledUnit {
    /// Guest address range `[start, end)` this unit covers.
    pub start: Address,
    pub end: Address,
    /// Whether the unit ran off the page without a terminator and falls
    /// through into the jump pad.
    pub need_pad: bool,
    /// Finalized host code (displacements already resolved).
    pub code: Vec<u8>,
    /// Host offset of each guest instruction's first emitted instruction.
    /// `None` for slots no control flow can enter (consumed NOP delay slots
    /// keep the offset of the code after their branch).
    pub code_addr: Box<[Option<u32>]>,
    /// Offset of the fall-through pad entry (`mov eax, end`).
    pub pad_fall: u32,
    /// Offset of the shared return all exits funnel through.
    pub pad_ret: u32,
    pub stats: UnitStats,
}

impl CompiledUnit {
    pub fn len_instrs(&self) -> usize {
        self.code_addr.len()
    }

    /// Host offset for entering the unit at `addr`, if that slot has code.
    pub fn entry_offset(&self, addr: Address) -> Option<u32> {
        if addr.value() < self.start.value() || addr.value() >= self.end.value() {
            return None;
        }
        let index = ((addr - self.start) / 4) as usize;
        self.code_addr.get(index).copied().flatten()
    }
}

/// Signature of a unit body: called with the pinned registers established
/// by the [`Trampoline`], returns the next guest address (0 means "fell
/// through, compute the address normally").
type TrampolineFn = extern "C" fn(*mut JitEnv, *mut u64, *const u8) -> u32;

/// The generated thunk that enters translated code: saves the callee-saved
/// registers generated code uses, pins the environment and register-file
/// base registers, and keeps hook call sites 16-byte aligned.
pub struct Trampoline {
    alloc: ExecAlloc,
}

impl Trampoline {
    pub(crate) fn new() -> Result<Self, CacheError> {
        let mut em = Emitter::new();
        em.push_r(Reg::Rbx);
        em.push_r(Reg::Rbp);
        em.push_r(Reg::R12);
        em.push_r(Reg::R13); // alignment padding for the inner call
        em.mov_rr64(Reg::Rbp, Reg::Rdi);
        em.mov_rr64(Reg::Rbx, Reg::Rsi);
        em.call_r(Reg::Rdx);
        em.pop_r(Reg::R13);
        em.pop_r(Reg::R12);
        em.pop_r(Reg::Rbp);
        em.pop_r(Reg::Rbx);
        em.ret();

        let alloc = ExecAlloc::new(em.bytes())?;
        Ok(Self { alloc })
    }

    /// Runs a unit body.
    ///
    /// # Safety
    /// `entry` must point into live, finalized unit code produced by this
    /// crate, `gpr` at the 34-entry guest register model, and `env`'s hooks
    /// must be valid for the duration of the call.
    pub unsafe fn call(&self, env: &mut JitEnv, gpr: *mut u64, entry: *const u8) -> u32 {
        // SAFETY: the thunk was generated with exactly this signature
        let thunk: TrampolineFn = unsafe { std::mem::transmute(self.alloc.entry(0)) };
        thunk(env, gpr, entry)
    }
}
