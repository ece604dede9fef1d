//! Pre-pass over a unit's guest code: finds every local branch target and
//! the unit's extent before any code is emitted. The register cache must
//! restart at every merge point, and a single forward pass during
//! translation could not know about a later backward branch into code it
//! has already emitted.

use vr4300::{Address, Cop0Func, Ins, Opcode, Special};

/// Instruction slots per translated page (4 KiB of guest code).
pub const PAGE_INSTRS: usize = 1024;

/// One bit per instruction slot in the page, set when some local branch or
/// jump targets that slot.
#[derive(Clone)]
pub struct TargetBitmap([u32; PAGE_INSTRS / 32]);

impl TargetBitmap {
    pub fn new() -> Self {
        Self([0; PAGE_INSTRS / 32])
    }

    #[inline(always)]
    pub fn set(&mut self, index: usize) {
        if index < PAGE_INSTRS {
            self.0[index / 32] |= 1 << (index % 32);
        }
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> bool {
        index < PAGE_INSTRS && self.0[index / 32] & (1 << (index % 32)) != 0
    }
}

pub struct Scan {
    pub targets: TargetBitmap,
    /// Page-relative index one past the unit's last instruction.
    pub end_index: usize,
    /// Set when the page ended before an unconditional terminator; the unit
    /// must fall through to the dispatch loop via its jump pad.
    pub need_pad: bool,
}

/// Scans guest code from `start_index` (page-relative) until an
/// unconditional terminator or the page end. `holes` are page-relative
/// indices owned by other units; they are pre-marked as merge points.
pub fn scan(page_start: Address, words: &[u32], start_index: usize, holes: &[usize]) -> Scan {
    let mut targets = TargetBitmap::new();
    targets.set(start_index);
    for &hole in holes {
        targets.set(hole);
    }

    let unit_start = page_start + (start_index * 4) as u32;
    let limit = words.len().min(PAGE_INSTRS);

    // during the scan the unit tentatively runs to the page end
    let in_unit_rel = |dst: i64| dst >= 0 && (dst as usize) < limit - start_index;
    let in_unit_abs = |addr: Address| {
        addr.value() >= unit_start.value() && addr.value() < (page_start + (limit * 4) as u32).value()
    };

    let mut idx = start_index;
    while idx < limit {
        let ins = Ins(words[idx]);
        match ins.opcode() {
            Some(Opcode::J | Opcode::Jal) => {
                let target =
                    Address((ins.target() << 2) | (unit_start.value() & 0xF000_0000));
                if in_unit_abs(target) {
                    targets.set(((target.value() >> 2) & 0x3FF) as usize);
                }
                if ins.opcode() == Some(Opcode::Jal) {
                    // the call returns past the delay slot
                    targets.set(idx + 2);
                    idx += 2;
                } else {
                    // unconditional: the unit ends after the delay slot
                    return Scan {
                        targets,
                        end_index: (idx + 2).min(limit),
                        need_pad: false,
                    };
                }
            }
            Some(
                Opcode::Beq
                | Opcode::Bne
                | Opcode::Blez
                | Opcode::Bgtz
                | Opcode::Beql
                | Opcode::Bnel
                | Opcode::Blezl
                | Opcode::Bgtzl
                | Opcode::Regimm,
            ) => {
                let offset = ins.simm();
                let rel = (idx - start_index) as i64 + 1 + offset as i64;
                if in_unit_rel(rel) {
                    targets.set((idx as i64 + 1 + offset as i64) as usize);
                }
                targets.set(idx + 2);
                idx += 2;
            }
            Some(Opcode::Cop1) if matches!(ins.cop_rs(), Some(vr4300::CopRs::Bc)) => {
                let offset = ins.simm();
                let rel = (idx - start_index) as i64 + 1 + offset as i64;
                if in_unit_rel(rel) {
                    targets.set((idx as i64 + 1 + offset as i64) as usize);
                }
                targets.set(idx + 2);
                idx += 2;
            }
            Some(Opcode::Special)
                if matches!(ins.special(), Some(Special::Jr | Special::Jalr)) =>
            {
                return Scan {
                    targets,
                    end_index: (idx + 2).min(limit),
                    need_pad: false,
                };
            }
            Some(Opcode::Cop0)
                if ins.rs() & 0x10 != 0
                    && Cop0Func::from_repr(ins.funct()) == Some(Cop0Func::Eret) =>
            {
                return Scan {
                    targets,
                    end_index: idx + 1,
                    need_pad: false,
                };
            }
            _ => idx += 1,
        }
    }

    Scan {
        targets,
        end_index: limit,
        need_pad: true,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn beq(rs: u32, rt: u32, offset: i16) -> u32 {
        (4 << 26) | (rs << 21) | (rt << 16) | (offset as u16 as u32)
    }

    fn jr(rs: u32) -> u32 {
        (rs << 21) | 8
    }

    #[test]
    fn backward_branch_marks_target() {
        // 0: addiu ; 1: addiu ; 2: beq -2 (target = 2+1-2 = 1) ; 3: nop ; 4: jr
        let words = [
            (9 << 26) | (8 << 16) | 5,
            (9 << 26) | (8 << 21) | (9 << 16) | 3,
            beq(0, 0, -2),
            0,
            jr(31),
            0,
        ];
        let scan = scan(Address(0x8000_0000), &words, 0, &[]);
        assert!(scan.targets.get(0)); // unit start
        assert!(scan.targets.get(1)); // branch target
        assert!(scan.targets.get(4)); // post-branch merge point
        assert!(!scan.need_pad);
        assert_eq!(scan.end_index, 6); // jr + delay slot
    }

    #[test]
    fn jump_terminates_unit() {
        // j <self page> at 0, delay slot at 1, dead code after
        let j = (2 << 26) | (0x8000_0000u32 >> 2) & 0x03FF_FFFF;
        let words = [j, 0, 0, 0];
        let scan = scan(Address(0x8000_0000), &words, 0, &[]);
        assert_eq!(scan.end_index, 2);
        assert!(!scan.need_pad);
        assert!(scan.targets.get(0)); // in-page jump target
    }

    #[test]
    fn overflow_requires_pad() {
        let words = [(9 << 26) | (8 << 16) | 1; 16];
        let scan = scan(Address(0x8000_0000), &words, 0, &[]);
        assert!(scan.need_pad);
        assert_eq!(scan.end_index, 16);
    }

    #[test]
    fn jal_marks_return_point() {
        let jal = (3 << 26) | 0x100;
        let words = [jal, 0, 0, 0, jr(31), 0];
        let scan = scan(Address(0x8000_0000), &words, 0, &[]);
        assert!(scan.targets.get(2));
    }

    #[test]
    fn out_of_range_targets_ignored() {
        // branch way forward, out of the page
        let words = [beq(0, 0, 0x7FF0u16 as i16), 0, jr(31), 0];
        let scan = scan(Address(0x8000_0000), &words, 0, &[]);
        for i in 4..PAGE_INSTRS {
            assert!(!scan.targets.get(i), "index {i} should not be marked");
        }
    }

    #[test]
    fn holes_are_merge_points() {
        let words = [(9 << 26) | (8 << 16) | 1; 8];
        let scan = scan(Address(0x8000_0000), &words, 0, &[3]);
        assert!(scan.targets.get(3));
    }
}
