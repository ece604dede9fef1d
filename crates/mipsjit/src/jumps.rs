//! Jump records and the second-pass displacement fixup.
//!
//! Every branch or jump whose destination is unknown at emission time is
//! recorded here with the host offset of its rel32 field; once the whole
//! unit is translated, [`JumpTable::resolve`] rewrites the displacements.

use vr4300::Address;

use crate::TranslateError;

/// Capacity of the jump table. Overflow is a fatal translation error.
pub const MAX_JUMPS: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub enum JumpKind {
    /// Conditional branch, guest-relative: resolves through the
    /// per-instruction offset table at `base + offset` (`base` is the
    /// unit-relative index of the delay slot).
    Branch { base: u32, offset: i32 },
    /// Jump to an absolute guest address within the unit.
    Jump { target: Address },
    /// Out-of-unit exit: resolves to the unit's jump pad.
    Call,
    /// Deferred skip whose landing offset was recorded once known
    /// (likely-branch delay-slot skips).
    Special { landing: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct JumpRecord {
    pub kind: JumpKind,
    /// Host offset of the rel32 displacement field to patch.
    pub patch: u32,
}

pub struct JumpTable {
    records: Vec<JumpRecord>,
}

impl JumpTable {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Records a jump whose rel32 field sits at `patch`. Returns its id.
    pub fn add(&mut self, kind: JumpKind, patch: u32) -> Result<usize, TranslateError> {
        if self.records.len() >= MAX_JUMPS {
            return Err(TranslateError::JumpTableFull);
        }
        self.records.push(JumpRecord { kind, patch });
        Ok(self.records.len() - 1)
    }

    /// Fills in a special record's landing offset once its distance is
    /// known.
    pub fn set_special(&mut self, id: usize, landing: u32) {
        if let JumpKind::Special {
            landing: ref mut slot,
        } = self.records[id].kind
        {
            *slot = landing;
        }
    }

    /// Pass 2: patches every record's displacement. Each record resolves
    /// exactly once; a destination with no emitted code is a translator bug.
    pub fn resolve(
        &self,
        code: &mut [u8],
        code_addr: &[Option<u32>],
        unit_start: Address,
        pad: u32,
    ) -> Result<(), TranslateError> {
        for record in &self.records {
            let target = match record.kind {
                JumpKind::Special { landing } => landing,
                JumpKind::Call => pad,
                JumpKind::Branch { base, offset } => {
                    let index = base as i64 + offset as i64;
                    code_addr
                        .get(index as usize)
                        .copied()
                        .flatten()
                        .ok_or(TranslateError::UnresolvedJump(record.patch))?
                }
                JumpKind::Jump { target } => {
                    let index = (target - unit_start) / 4;
                    code_addr
                        .get(index as usize)
                        .copied()
                        .flatten()
                        .ok_or(TranslateError::UnresolvedJump(record.patch))?
                }
            };

            let rel = target as i64 - (record.patch as i64 + 4);
            let at = record.patch as usize;
            code[at..at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }

        Ok(())
    }
}
