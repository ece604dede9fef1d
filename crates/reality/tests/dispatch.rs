//! End-to-end dispatch tests: guest programs run through translation, the
//! interpreter fallback, invalidation and eviction.

use reality::{Config, Core, System};
use vr4300::{Address, Bus, Cycles, cop0};

const BASE: u32 = 0x8000_0000;

/// Big-endian guest RAM.
struct Ram(Vec<u8>);

impl Ram {
    fn new() -> Self {
        Self(vec![0; 0x8000])
    }

    fn with_code(words: &[u32]) -> Self {
        let mut ram = Self::new();
        for (i, word) in words.iter().enumerate() {
            ram.write_u32(BASE + (i * 4) as u32, *word);
        }
        ram
    }

    fn index(&self, addr: u32) -> usize {
        addr as usize & 0x7FFF
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

fn addiu(rt: u32, rs: u32, imm: i16) -> u32 {
    (9 << 26) | (rs << 21) | (rt << 16) | (imm as u16 as u32)
}

fn addu(rd: u32, rs: u32, rt: u32) -> u32 {
    (rs << 21) | (rt << 16) | (rd << 11) | 33
}

fn ori(rt: u32, rs: u32, imm: u16) -> u32 {
    (13 << 26) | (rs << 21) | (rt << 16) | imm as u32
}

fn lui(rt: u32, imm: u16) -> u32 {
    (15 << 26) | (rt << 16) | imm as u32
}

fn sw(rt: u32, base: u32, imm: i16) -> u32 {
    (43 << 26) | (base << 21) | (rt << 16) | (imm as u16 as u32)
}

fn bne(rs: u32, rt: u32, offset: i16) -> u32 {
    (5 << 26) | (rs << 21) | (rt << 16) | (offset as u16 as u32)
}

fn j(target: u32) -> u32 {
    (2 << 26) | ((target >> 2) & 0x03FF_FFFF)
}

const SPIN: [u32; 2] = [
    // beq $zero, $zero, -1 ; nop
    (4 << 26) | 0xFFFF,
    0,
];

fn run(words: &[u32], cycles: u64) -> System<Ram> {
    let mut core = Core::new(Config::default()).unwrap();
    let mut sys = System::new(Ram::with_code(words));
    sys.cpu.pc = BASE;
    core.exec(&mut sys, Cycles(cycles)).unwrap();
    sys
}

#[test]
fn counting_loop_runs_to_completion() {
    // sum = 10 + 9 + ... + 1, then spin
    let mut program = vec![
        addiu(2, 0, 0),
        addiu(3, 0, 10),
        addu(2, 2, 3),     // loop head
        addiu(3, 3, -1),
        bne(3, 0, -3),
        0,                 // delay slot
    ];
    program.extend_from_slice(&SPIN);

    let sys = run(&program, 50_000);
    assert_eq!(sys.cpu.gpr[2], 55);
    assert_eq!(sys.cpu.gpr[3], 0);
}

#[test]
fn guest_store_invalidates_its_own_page() {
    // the guest rewrites the instruction at BASE+0x18 from
    // `addiu $2, $zero, 0xBAD` to `addiu $2, $zero, 0xDE`, then jumps there
    let patched = addiu(2, 0, 0xDE);
    let mut program = vec![
        lui(4, 0x8000),                       // $4 = BASE
        lui(5, (patched >> 16) as u16),
        ori(5, 5, patched as u16),
        sw(5, 4, 0x18),
        j(BASE + 0x18),
        0,
        addiu(2, 0, 0xBAD),                   // at BASE+0x18, overwritten
    ];
    program.extend_from_slice(&SPIN);

    let sys = run(&program, 20_000);
    assert_eq!(sys.cpu.gpr[2], 0xDE);
}

#[test]
fn external_invalidation_forces_retranslation() {
    let mut program = vec![addiu(2, 0, 111)];
    program.extend_from_slice(&SPIN);

    let mut core = Core::new(Config::default()).unwrap();
    let mut sys = System::new(Ram::with_code(&program));
    sys.cpu.pc = BASE;
    core.exec(&mut sys, Cycles(1_000)).unwrap();
    assert_eq!(sys.cpu.gpr[2], 111);

    // a bus master rewrites the code behind the core's back
    sys.bus.write_u32(BASE, addiu(2, 0, 222));
    core.invalidate(Address(BASE));

    sys.cpu.pc = BASE;
    core.exec(&mut sys, Cycles(1_000)).unwrap();
    assert_eq!(sys.cpu.gpr[2], 222);
}

#[test]
fn stale_translation_survives_without_invalidation() {
    // the counterpart: without the invalidation hook the stale unit keeps
    // running, which is exactly what the invalidation flag exists to fix
    let mut program = vec![addiu(2, 0, 111)];
    program.extend_from_slice(&SPIN);

    let mut core = Core::new(Config::default()).unwrap();
    let mut sys = System::new(Ram::with_code(&program));
    sys.cpu.pc = BASE;
    core.exec(&mut sys, Cycles(1_000)).unwrap();

    sys.bus.write_u32(BASE, addiu(2, 0, 222));
    sys.cpu.pc = BASE;
    sys.cpu.gpr[2] = 0;
    core.exec(&mut sys, Cycles(1_000)).unwrap();
    assert_eq!(sys.cpu.gpr[2], 111);
}

#[test]
fn ping_pong_across_pages_with_tiny_cache() {
    // two units on different pages jumping at each other; a cache budget
    // smaller than one unit forces eviction on every translation, and
    // execution must still be correct
    let page1 = BASE + 0x1000;
    let mut program = vec![
        addiu(2, 2, 1),
        j(page1),
        0,
    ];
    program.resize(0x1000 / 4, 0);
    // page 1: increment $3 and jump back (a backward jump, so it breaks
    // through the interpreter and the loop stays interruptible)
    program.push(addiu(3, 3, 1));
    program.push(j(BASE));
    program.push(0);

    let mut core = Core::new(Config {
        cache_budget: 64,
        ..Config::default()
    })
    .unwrap();
    let mut sys = System::new(Ram::with_code(&program));
    sys.cpu.pc = BASE;
    core.exec(&mut sys, Cycles(5_000)).unwrap();

    let (ping, pong) = (sys.cpu.gpr[2], sys.cpu.gpr[3]);
    assert!(ping > 1);
    assert!(pong > 1);
    // execution stopped either right after a ping or right after a pong
    assert!(ping == pong || ping == pong + 1);
}

#[test]
fn timer_interrupt_vectors_between_units() {
    let mut program = Vec::new();
    program.extend_from_slice(&SPIN);

    let mut core = Core::new(Config::default()).unwrap();
    let mut sys = System::new(Ram::with_code(&program));
    sys.cpu.pc = BASE;
    sys.cpu.cop0.regs[cop0::STATUS] = 0x8001; // IE | IM7
    sys.cpu.cop0.regs[cop0::COMPARE] = 50;
    core.exec(&mut sys, Cycles(10_000)).unwrap();

    // the interrupt was taken: EPC recorded, EXL set, IP7 pending
    assert!(sys.cpu.cop0.regs[cop0::STATUS] & 0x2 != 0);
    assert!(sys.cpu.cop0.regs[cop0::CAUSE] & (1 << 15) != 0);
    assert_eq!(sys.cpu.cop0.regs[cop0::EPC] & 0xFFFF_F000, BASE);
}
