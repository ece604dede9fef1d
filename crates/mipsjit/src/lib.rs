//! Dynamic recompiler for VR4300 (MIPS R4300i) guest code, targeting
//! x86-64 hosts.
//!
//! Translation of a unit runs in three passes: a boundary scan that finds
//! every local branch target and the unit's extent, the instruction-by-
//! instruction emission pass, and a displacement fixup pass over the
//! recorded jump table. Units are finalized as position-independent bytes;
//! the caller places them in executable memory and enters them through the
//! [`Trampoline`].

mod block;
mod builder;
mod cursor;
mod emitter;
mod jumps;
mod regcache;
mod scan;

#[cfg(test)]
mod test;

pub mod hooks;

use easyerr::Error;
use jitcache::CacheError;
use vr4300::Address;

use crate::block::Trampoline;
use crate::builder::BlockBuilder;
use crate::hooks::JitEnv;

#[rustfmt::skip]
pub use crate::{
    block::{CompiledUnit, UnitStats},
    builder::Outcome,
    scan::{PAGE_INSTRS, Scan, TargetBitmap, scan},
};

/// Code generation toggles. Each mirrors a deferral switch of the original
/// design: a set flag routes that instruction group through the
/// interpreter instead of translating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodegenSettings {
    /// Force every branch and jump through the interpreter.
    pub interpret_branches: bool,
    /// Defer MULT/MULTU.
    pub interpret_mult: bool,
    /// Defer the translatable doubleword operations.
    pub interpret_doubleword: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub codegen: CodegenSettings,
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("jump record table overflow")]
    JumpTableFull,
    #[error("unresolved jump record (rel32 at host offset {f0})")]
    UnresolvedJump(u32),
}

/// One translation request: a unit starting at `start` within the 4 KiB
/// guest page whose instruction words are `words`.
pub struct TranslateRequest<'a> {
    /// First address of the page (`start & !0xFFF`).
    pub page_start: Address,
    /// The page's instruction words, `words[i]` at `page_start + 4 * i`.
    pub words: &'a [u32],
    /// Unit entry address.
    pub start: Address,
    /// Starts of sub-ranges owned by other, overlapping units.
    pub holes: &'a [Address],
}

/// The recompiler. Owns the entry trampoline and the translation settings;
/// produces [`CompiledUnit`]s.
pub struct Jit {
    settings: Settings,
    trampoline: Trampoline,
    translated: u64,
}

impl Jit {
    pub fn new(settings: Settings) -> Result<Self, CacheError> {
        Ok(Self {
            settings,
            trampoline: Trampoline::new()?,
            translated: 0,
        })
    }

    /// Number of units translated so far.
    pub fn translated(&self) -> u64 {
        self.translated
    }

    /// Translates one unit of guest code.
    pub fn translate(&mut self, req: &TranslateRequest) -> Result<CompiledUnit, TranslateError> {
        let _span = tracing::trace_span!("translate", start = %req.start).entered();

        let start_index = ((req.start.value() & 0xFFF) >> 2) as usize;
        let holes: Vec<usize> = req
            .holes
            .iter()
            .filter(|hole| hole.page() == req.page_start.page())
            .map(|hole| ((hole.value() & 0xFFF) >> 2) as usize)
            .collect();

        let scan = scan::scan(req.page_start, req.words, start_index, &holes);
        let unit = BlockBuilder::new(req, &scan, &self.settings.codegen, start_index).build()?;

        tracing::trace!(
            instructions = unit.stats.instructions,
            interpreted = unit.stats.interpreted,
            bytes = unit.code.len(),
            "unit translated"
        );
        self.translated += 1;

        Ok(unit)
    }

    /// Runs finalized unit code starting at `entry`.
    ///
    /// # Safety
    /// See [`Trampoline::call`]: `entry` must be live finalized code from
    /// this crate, `gpr` the 34-entry register model, and the hooks valid.
    pub unsafe fn call(&self, env: &mut JitEnv, gpr: *mut u64, entry: *const u8) -> u32 {
        // SAFETY: forwarded contract
        unsafe { self.trampoline.call(env, gpr, entry) }
    }
}
