use std::ffi::c_void;

use jitcache::ExecAlloc;
use vr4300::{Address, Bus, Cpu, Ins};

use crate::hooks::JitEnv;
use crate::{CompiledUnit, Jit, Settings, TranslateError, TranslateRequest};

const BASE: u32 = 0x8000_0000;

/// Hand assembler for the handful of encodings the tests need.
mod asm {
    pub fn addiu(rt: u32, rs: u32, imm: i16) -> u32 {
        (9 << 26) | (rs << 21) | (rt << 16) | (imm as u16 as u32)
    }
    pub fn ori(rt: u32, rs: u32, imm: u16) -> u32 {
        (13 << 26) | (rs << 21) | (rt << 16) | imm as u32
    }
    pub fn andi(rt: u32, rs: u32, imm: u16) -> u32 {
        (12 << 26) | (rs << 21) | (rt << 16) | imm as u32
    }
    pub fn xori(rt: u32, rs: u32, imm: u16) -> u32 {
        (14 << 26) | (rs << 21) | (rt << 16) | imm as u32
    }
    pub fn lui(rt: u32, imm: u16) -> u32 {
        (15 << 26) | (rt << 16) | imm as u32
    }
    pub fn slti(rt: u32, rs: u32, imm: i16) -> u32 {
        (10 << 26) | (rs << 21) | (rt << 16) | (imm as u16 as u32)
    }
    fn special(rs: u32, rt: u32, rd: u32, sa: u32, funct: u32) -> u32 {
        (rs << 21) | (rt << 16) | (rd << 11) | (sa << 6) | funct
    }
    pub fn addu(rd: u32, rs: u32, rt: u32) -> u32 {
        special(rs, rt, rd, 0, 33)
    }
    pub fn subu(rd: u32, rs: u32, rt: u32) -> u32 {
        special(rs, rt, rd, 0, 35)
    }
    pub fn and(rd: u32, rs: u32, rt: u32) -> u32 {
        special(rs, rt, rd, 0, 36)
    }
    pub fn or(rd: u32, rs: u32, rt: u32) -> u32 {
        special(rs, rt, rd, 0, 37)
    }
    pub fn xor(rd: u32, rs: u32, rt: u32) -> u32 {
        special(rs, rt, rd, 0, 38)
    }
    pub fn nor(rd: u32, rs: u32, rt: u32) -> u32 {
        special(rs, rt, rd, 0, 39)
    }
    pub fn slt(rd: u32, rs: u32, rt: u32) -> u32 {
        special(rs, rt, rd, 0, 42)
    }
    pub fn sltu(rd: u32, rs: u32, rt: u32) -> u32 {
        special(rs, rt, rd, 0, 43)
    }
    pub fn sll(rd: u32, rt: u32, sa: u32) -> u32 {
        special(0, rt, rd, sa, 0)
    }
    pub fn srl(rd: u32, rt: u32, sa: u32) -> u32 {
        special(0, rt, rd, sa, 2)
    }
    pub fn sra(rd: u32, rt: u32, sa: u32) -> u32 {
        special(0, rt, rd, sa, 3)
    }
    pub fn sllv(rd: u32, rt: u32, rs: u32) -> u32 {
        special(rs, rt, rd, 0, 4)
    }
    pub fn mult(rs: u32, rt: u32) -> u32 {
        special(rs, rt, 0, 0, 24)
    }
    pub fn mfhi(rd: u32) -> u32 {
        special(0, 0, rd, 0, 16)
    }
    pub fn mflo(rd: u32) -> u32 {
        special(0, 0, rd, 0, 18)
    }
    pub fn jr(rs: u32) -> u32 {
        special(rs, 0, 0, 0, 8)
    }
    pub fn jalr(rd: u32, rs: u32) -> u32 {
        special(rs, 0, rd, 0, 9)
    }
    pub fn beq(rs: u32, rt: u32, offset: i16) -> u32 {
        (4 << 26) | (rs << 21) | (rt << 16) | (offset as u16 as u32)
    }
    pub fn beql(rs: u32, rt: u32, offset: i16) -> u32 {
        (20 << 26) | (rs << 21) | (rt << 16) | (offset as u16 as u32)
    }
    pub fn bnel(rs: u32, rt: u32, offset: i16) -> u32 {
        (21 << 26) | (rs << 21) | (rt << 16) | (offset as u16 as u32)
    }
    pub fn jal(target: u32) -> u32 {
        (3 << 26) | ((target >> 2) & 0x03FF_FFFF)
    }
    pub fn lw(rt: u32, base: u32, imm: i16) -> u32 {
        (35 << 26) | (base << 21) | (rt << 16) | (imm as u16 as u32)
    }
    pub fn sw(rt: u32, base: u32, imm: i16) -> u32 {
        (43 << 26) | (base << 21) | (rt << 16) | (imm as u16 as u32)
    }
    pub const NOP: u32 = 0;
}

/// Big-endian test RAM.
struct Ram(Vec<u8>);

impl Ram {
    fn new() -> Self {
        Self(vec![0; 0x4000])
    }

    fn with_code(words: &[u32]) -> Self {
        let mut ram = Self::new();
        for (i, word) in words.iter().enumerate() {
            ram.write_u32(BASE + (i * 4) as u32, *word);
        }
        ram
    }

    fn index(&self, addr: u32) -> usize {
        addr as usize & 0x3FFF
    }
}

impl Bus for Ram {
    fn read_u8(&mut self, addr: u32) -> u8 {
        self.0[self.index(addr)]
    }
    fn read_u16(&mut self, addr: u32) -> u16 {
        let i = self.index(addr);
        u16::from_be_bytes(self.0[i..i + 2].try_into().unwrap())
    }
    fn read_u32(&mut self, addr: u32) -> u32 {
        let i = self.index(addr);
        u32::from_be_bytes(self.0[i..i + 4].try_into().unwrap())
    }
    fn read_u64(&mut self, addr: u32) -> u64 {
        let i = self.index(addr);
        u64::from_be_bytes(self.0[i..i + 8].try_into().unwrap())
    }
    fn write_u8(&mut self, addr: u32, value: u8) {
        let i = self.index(addr);
        self.0[i] = value;
    }
    fn write_u16(&mut self, addr: u32, value: u16) {
        let i = self.index(addr);
        self.0[i..i + 2].copy_from_slice(&value.to_be_bytes());
    }
    fn write_u32(&mut self, addr: u32, value: u32) {
        let i = self.index(addr);
        self.0[i..i + 4].copy_from_slice(&value.to_be_bytes());
    }
    fn write_u64(&mut self, addr: u32, value: u64) {
        let i = self.index(addr);
        self.0[i..i + 8].copy_from_slice(&value.to_be_bytes());
    }
}

struct TestCtx {
    cpu: *mut Cpu,
    ram: *mut Ram,
}

extern "C" fn test_interp(ctx: *mut c_void, word: u32, pc: u32, in_delay: u32) -> u32 {
    let ctx = unsafe { &mut *ctx.cast::<TestCtx>() };
    let (cpu, ram) = unsafe { (&mut *ctx.cpu, &mut *ctx.ram) };
    vr4300::interp_one(cpu, ram, Ins(word), pc, in_delay != 0).unwrap_or(0)
}

extern "C" fn no_event(_: *mut c_void, _: u32) -> i32 {
    i32::MAX
}

extern "C" fn event_due(_: *mut c_void, _: u32) -> i32 {
    0
}

/// A translated unit placed in executable memory, ready to run.
struct Runner {
    jit: Jit,
    unit: CompiledUnit,
    alloc: ExecAlloc,
}

impl Runner {
    fn new(words: &[u32]) -> Self {
        let mut jit = Jit::new(Settings::default()).unwrap();
        let unit = jit
            .translate(&TranslateRequest {
                page_start: Address(BASE),
                words,
                start: Address(BASE),
                holes: &[],
            })
            .unwrap();
        let alloc = ExecAlloc::new(&unit.code).unwrap();
        Self { jit, unit, alloc }
    }

    fn entry(&self, at: u32) -> *const u8 {
        let offset = self
            .unit
            .entry_offset(Address(at))
            .expect("no entry point at requested address");
        self.alloc.entry(offset as usize)
    }

    /// Runs with stubbed hooks (no interpreter, no interrupts).
    fn run(&self, cpu: &mut Cpu, at: u32) -> u32 {
        let mut env = JitEnv::stub();
        unsafe { self.jit.call(&mut env, cpu.gpr_base(), self.entry(at)) }
    }

    /// Runs with the real interpreter as fallback.
    fn run_with(&self, cpu: &mut Cpu, ram: &mut Ram, at: u32) -> u32 {
        let gpr = cpu.gpr_base();
        let mut ctx = TestCtx { cpu, ram };
        let mut env = JitEnv::new(test_interp, no_event, (&raw mut ctx).cast());
        unsafe { self.jit.call(&mut env, gpr, self.entry(at)) }
    }

    /// Runs with every control transfer reporting a due interrupt.
    fn run_interrupted(&self, cpu: &mut Cpu, at: u32) -> u32 {
        extern "C" fn interp(_: *mut c_void, _: u32, _: u32, _: u32) -> u32 {
            0
        }
        let mut env = JitEnv::new(interp, event_due, std::ptr::null_mut());
        unsafe { self.jit.call(&mut env, cpu.gpr_base(), self.entry(at)) }
    }
}

fn canonical(value: i32) -> u64 {
    value as i64 as u64
}

/// Runs `words` through the interpreter as straight-line code.
fn reference(cpu: &mut Cpu, words: &[u32]) {
    let mut ram = Ram::new();
    for (i, word) in words.iter().enumerate() {
        let pc = BASE + (i * 4) as u32;
        assert!(
            vr4300::interp_one(cpu, &mut ram, Ins(*word), pc, false).is_none(),
            "reference program must be straight-line"
        );
    }
    cpu.gpr[0] = 0;
}

#[test]
fn straight_line_round_trip() {
    use asm::*;
    use nanorand::{Rng, WyRand};

    let program = [
        addu(10, 1, 2),
        subu(11, 3, 4),
        and(12, 1, 5),
        or(13, 2, 6),
        xor(14, 3, 7),
        nor(15, 4, 1),
        slt(16, 5, 2),
        sltu(17, 6, 3),
        sll(18, 7, 3),
        srl(19, 1, 5),
        sra(20, 2, 9),
        sllv(21, 3, 4),
        addiu(22, 5, -77),
        andi(23, 6, 0xF0F0),
        ori(24, 7, 0x1234),
        xori(25, 1, 0xFFFF),
        lui(26, 0xDEAD),
        slti(27, 2, 100),
        subu(1, 10, 11),
        addu(2, 1, 16),
    ];

    let runner = Runner::new(&program);
    let mut rng = WyRand::new_seed(0x1234_5678);

    for _ in 0..32 {
        let mut cpu = Cpu::default();
        for r in 1..8 {
            cpu.gpr[r] = canonical(rng.generate::<u32>() as i32);
        }
        let mut expected = cpu.clone();
        reference(&mut expected, &program);

        let next = runner.run(&mut cpu, BASE);
        cpu.gpr[0] = 0;

        assert_eq!(next, BASE + (program.len() * 4) as u32);
        for r in 0..32 {
            assert_eq!(cpu.gpr[r], expected.gpr[r], "gpr {r} differs");
        }
    }
}

#[test]
fn spec_scenario_backward_branch() {
    use asm::*;

    // addiu $t0, $zero, 5 ; addiu $t1, $t0, 3 ; beq $t0, $t1, -2 ; nop
    let program = [addiu(8, 0, 5), addiu(9, 8, 3), beq(8, 9, -2), NOP];

    // the loop back-edge is a marked merge point
    let scan = crate::scan(Address(BASE), &program, 0, &[]);
    assert!(scan.targets.get(1));

    let runner = Runner::new(&program);
    let mut cpu = Cpu::default();
    let next = runner.run(&mut cpu, BASE);

    assert_eq!(cpu.gpr[9], 8);
    assert_eq!(cpu.gpr[8], 5);
    assert_eq!(next, BASE + 16);
}

#[test]
fn taken_branch_runs_delay_slot_once() {
    use asm::*;

    // beq taken: slot runs, the skipped instruction does not
    let program = [
        beq(0, 0, 2),
        addiu(8, 8, 1),  // delay slot
        addiu(9, 9, 1),  // skipped
        addiu(10, 10, 1) // target
    ];
    let runner = Runner::new(&program);
    let mut cpu = Cpu::default();
    let next = runner.run(&mut cpu, BASE);

    assert_eq!(cpu.gpr[8], 1);
    assert_eq!(cpu.gpr[9], 0);
    assert_eq!(cpu.gpr[10], 1);
    assert_eq!(next, BASE + 16);
}

#[test]
fn untaken_branch_runs_delay_slot_once() {
    use asm::*;

    let program = [
        beq(1, 2, 2),
        addiu(8, 8, 1),  // delay slot
        addiu(9, 9, 1),
        addiu(10, 10, 1),
    ];
    let runner = Runner::new(&program);
    let mut cpu = Cpu::default();
    cpu.gpr[1] = 1;
    cpu.gpr[2] = 2;
    let next = runner.run(&mut cpu, BASE);

    // the delay slot ran exactly once even though a second copy exists in
    // place for direct entry
    assert_eq!(cpu.gpr[8], 1);
    assert_eq!(cpu.gpr[9], 1);
    assert_eq!(cpu.gpr[10], 1);
    assert_eq!(next, BASE + 16);
}

#[test]
fn entering_at_the_delay_slot_is_safe() {
    use asm::*;

    let program = [
        beq(1, 2, 2),
        addiu(8, 8, 1),
        addiu(9, 9, 1),
        addiu(10, 10, 1),
    ];
    let runner = Runner::new(&program);
    let mut cpu = Cpu::default();
    cpu.gpr[1] = 1;
    cpu.gpr[2] = 2;

    // jump straight into the delay slot: it executes as a plain
    // instruction and execution continues past the branch
    let next = runner.run(&mut cpu, BASE + 4);
    assert_eq!(cpu.gpr[8], 1);
    assert_eq!(cpu.gpr[9], 1);
    assert_eq!(cpu.gpr[10], 1);
    assert_eq!(next, BASE + 16);
}

#[test]
fn nop_delay_slot_emits_no_slot_code() {
    use asm::*;

    let program = [beq(0, 0, 1), NOP, addiu(8, 8, 1)];
    let runner = Runner::new(&program);

    // the consumed NOP's entry point collapses onto the following
    // instruction's code
    assert_eq!(runner.unit.code_addr[1], runner.unit.code_addr[2]);

    let with_code = [beq(0, 0, 1), addiu(9, 9, 1), addiu(8, 8, 1)];
    let runner = Runner::new(&with_code);
    assert!(runner.unit.code_addr[1] < runner.unit.code_addr[2]);
}

#[test]
fn likely_branch_skips_slot_when_not_taken() {
    use asm::*;

    let program = [
        bnel(1, 2, 2),
        addiu(8, 8, 1),
        addiu(9, 9, 1),
        addiu(10, 10, 1),
    ];
    let runner = Runner::new(&program);

    // not taken: the slot must not execute
    let mut cpu = Cpu::default();
    let next = runner.run(&mut cpu, BASE);
    assert_eq!(cpu.gpr[8], 0);
    assert_eq!(cpu.gpr[9], 1);
    assert_eq!(cpu.gpr[10], 1);
    assert_eq!(next, BASE + 16);

    // taken: the slot executes and the branch lands on its target
    let mut cpu = Cpu::default();
    cpu.gpr[1] = 1;
    let next = runner.run(&mut cpu, BASE);
    assert_eq!(cpu.gpr[8], 1);
    assert_eq!(cpu.gpr[9], 0);
    assert_eq!(cpu.gpr[10], 1);
    assert_eq!(next, BASE + 16);
}

#[test]
fn jal_links_and_leaves_the_unit() {
    use asm::*;

    let target = 0x8010_0000;
    let program = [jal(target), addiu(8, 8, 1)];
    let runner = Runner::new(&program);
    let mut cpu = Cpu::default();
    let next = runner.run(&mut cpu, BASE);

    assert_eq!(next, target);
    assert_eq!(cpu.gpr[31], canonical((BASE + 8) as i32));
    assert_eq!(cpu.gpr[8], 1);
}

#[test]
fn jr_uses_the_pre_slot_register_value() {
    use asm::*;

    // the delay slot overwrites $4; the jump must use the old value
    let program = [jr(4), addiu(4, 0, 0x100)];
    let runner = Runner::new(&program);
    let mut cpu = Cpu::default();
    cpu.gpr[4] = canonical(0x8020_0040u32 as i32);
    let next = runner.run(&mut cpu, BASE);

    assert_eq!(next, 0x8020_0040);
    assert_eq!(cpu.gpr[4], 0x100);
}

#[test]
fn jalr_links() {
    use asm::*;

    let program = [jalr(31, 4), NOP];
    let runner = Runner::new(&program);
    let mut cpu = Cpu::default();
    cpu.gpr[4] = canonical(0x8030_0000u32 as i32);
    let next = runner.run(&mut cpu, BASE);

    assert_eq!(next, 0x8030_0000);
    assert_eq!(cpu.gpr[31], canonical((BASE + 8) as i32));
}

#[test]
fn mult_and_hilo_moves() {
    use asm::*;

    let program = [mult(4, 5), mfhi(8), mflo(9)];
    let runner = Runner::new(&program);
    let mut cpu = Cpu::default();
    cpu.gpr[4] = canonical(-123_456);
    cpu.gpr[5] = canonical(789_123);

    let mut expected = cpu.clone();
    reference(&mut expected, &program);

    runner.run(&mut cpu, BASE);
    assert_eq!(cpu.gpr[8], expected.gpr[8]);
    assert_eq!(cpu.gpr[9], expected.gpr[9]);
    assert_eq!(cpu.hi, expected.hi);
    assert_eq!(cpu.lo, expected.lo);
}

#[test]
fn loads_go_through_the_interpreter() {
    use asm::*;

    let program = [lw(8, 4, 0), addiu(9, 8, 1), sw(9, 4, 4)];
    let runner = Runner::new(&program);
    assert!(runner.unit.stats.interpreted >= 2);

    let mut cpu = Cpu::default();
    let mut ram = Ram::with_code(&program);
    ram.write_u32(0x2000, 41);
    cpu.gpr[4] = 0x2000;

    let next = runner.run_with(&mut cpu, &mut ram, BASE);
    assert_eq!(cpu.gpr[8], 41);
    assert_eq!(cpu.gpr[9], 42);
    assert_eq!(ram.read_u32(0x2004), 42);
    assert_eq!(next, BASE + 12);
}

#[test]
fn due_interrupt_exits_at_the_branch() {
    use asm::*;

    // a tight counting loop; with an interrupt due at every transfer, each
    // run retires exactly one iteration and resumes at the loop head
    let program = [addiu(8, 8, 1), beq(0, 0, -2), NOP];
    let runner = Runner::new(&program);
    let mut cpu = Cpu::default();

    let next = runner.run_interrupted(&mut cpu, BASE);
    assert_eq!(cpu.gpr[8], 1);
    assert_eq!(next, BASE);

    let next = runner.run_interrupted(&mut cpu, BASE);
    assert_eq!(cpu.gpr[8], 2);
    assert_eq!(next, BASE);
}

#[test]
fn backward_jump_breaks_through_the_interpreter() {
    use asm::*;

    // j back to the unit start: translated as an interpreter call so the
    // dispatch loop regains control every iteration
    let program = [addiu(8, 8, 1), (2 << 26) | ((BASE >> 2) & 0x03FF_FFFF), NOP];
    let runner = Runner::new(&program);
    assert!(runner.unit.stats.interpreted >= 1);

    let mut cpu = Cpu::default();
    let mut ram = Ram::with_code(&program);
    let next = runner.run_with(&mut cpu, &mut ram, BASE);
    assert_eq!(next, BASE);
    assert_eq!(cpu.gpr[8], 1);
}

#[test]
fn jump_table_overflows_fatally() {
    use asm::*;

    // a page full of likely branches jumping out of the unit produces
    // three records each, blowing the fixed table
    let mut program = Vec::new();
    for _ in 0..512 {
        program.push(beql(0, 0, 0x400));
        program.push(NOP);
    }

    let mut jit = Jit::new(Settings::default()).unwrap();
    let result = jit.translate(&TranslateRequest {
        page_start: Address(BASE),
        words: &program,
        start: Address(BASE),
        holes: &[],
    });
    assert!(matches!(result, Err(TranslateError::JumpTableFull)));
}

#[test]
fn interpret_branches_setting_defers_control_flow() {
    use asm::*;

    let program = [beq(0, 0, 1), NOP, addiu(8, 8, 1)];
    let mut jit = Jit::new(Settings {
        codegen: crate::CodegenSettings {
            interpret_branches: true,
            ..Default::default()
        },
    })
    .unwrap();
    let unit = jit
        .translate(&TranslateRequest {
            page_start: Address(BASE),
            words: &program,
            start: Address(BASE),
            holes: &[],
        })
        .unwrap();
    assert!(unit.stats.interpreted >= 1);
}
