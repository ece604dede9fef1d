//! The dispatch loop: alternates between running translated code and
//! looking up or creating translations when a trampoline exit reaches an
//! unresolved guest address.

use std::ffi::c_void;

use easyerr::{Error, ResultExt};
use jitcache::{CacheError, CodeCache, ExecAlloc};
use mipsjit::hooks::JitEnv;
use mipsjit::{Jit, TranslateError, TranslateRequest};
use vr4300::{Address, Bus, Cpu, Cycles, Ins, cop0};

use crate::blocks::{Blocks, Prepared};
use crate::{Executed, System};

pub struct Config {
    /// Total byte budget for resident translated code.
    pub cache_budget: usize,
    pub jit: mipsjit::Settings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_budget: jitcache::DEFAULT_BUDGET,
            jit: mipsjit::Settings::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Translate { source: TranslateError },
    #[error(transparent)]
    Cache { source: CacheError },
    #[error("no entry point at {f0} after translation")]
    NoEntry(Address),
}

/// Cycle accounting shared with generated code through the update-count
/// hook. `last_addr` is the guest address up to which `count` is accurate.
struct Timing {
    count: u32,
    last_addr: u32,
    next_event: u32,
}

/// State handed (as an opaque pointer) to the hooks generated code calls.
struct HookCtx<'a, B: Bus> {
    cpu: *mut Cpu,
    bus: *mut RecordingBus<'a, B>,
    timing: *mut Timing,
}

/// Wraps the guest bus so stores from interpreted instructions are
/// observed; written pages invalidate any covering translations.
struct RecordingBus<'a, B: Bus> {
    inner: &'a mut B,
    written: Vec<u32>,
}

impl<'a, B: Bus> RecordingBus<'a, B> {
    fn new(inner: &'a mut B) -> Self {
        Self {
            inner,
            written: Vec::new(),
        }
    }

    fn record(&mut self, addr: u32) {
        let page = addr >> 12;
        if self.written.last() != Some(&page) {
            self.written.push(page);
        }
    }
}

impl<B: Bus> Bus for RecordingBus<'_, B> {
    fn read_u8(&mut self, addr: u32) -> u8 {
        self.inner.read_u8(addr)
    }
    fn read_u16(&mut self, addr: u32) -> u16 {
        self.inner.read_u16(addr)
    }
    fn read_u32(&mut self, addr: u32) -> u32 {
        self.inner.read_u32(addr)
    }
    fn read_u64(&mut self, addr: u32) -> u64 {
        self.inner.read_u64(addr)
    }
    fn write_u8(&mut self, addr: u32, value: u8) {
        self.record(addr);
        self.inner.write_u8(addr, value);
    }
    fn write_u16(&mut self, addr: u32, value: u16) {
        self.record(addr);
        self.inner.write_u16(addr, value);
    }
    fn write_u32(&mut self, addr: u32, value: u32) {
        self.record(addr);
        self.inner.write_u32(addr, value);
    }
    fn write_u64(&mut self, addr: u32, value: u64) {
        self.record(addr);
        self.inner.write_u64(addr, value);
    }
}

extern "C" fn interp_hook<B: Bus>(ctx: *mut c_void, word: u32, pc: u32, in_delay: u32) -> u32 {
    // SAFETY: the dispatch loop passed a live HookCtx for this run
    let ctx = unsafe { &mut *ctx.cast::<HookCtx<B>>() };
    let (cpu, bus) = unsafe { (&mut *ctx.cpu, &mut *ctx.bus) };
    vr4300::interp_one(cpu, bus, Ins(word), pc, in_delay != 0).unwrap_or(0)
}

extern "C" fn update_count_hook<B: Bus>(ctx: *mut c_void, pc: u32) -> i32 {
    // SAFETY: as above
    let ctx = unsafe { &mut *ctx.cast::<HookCtx<B>>() };
    let timing = unsafe { &mut *ctx.timing };
    timing.count = timing
        .count
        .wrapping_add(pc.wrapping_sub(timing.last_addr) >> 2);
    timing.last_addr = pc;
    timing.next_event.wrapping_sub(timing.count) as i32
}

pub struct Core {
    pub config: Config,
    jit: Jit,
    cache: CodeCache,
    blocks: Blocks,
    timing: Timing,
    stop: bool,
}

impl Core {
    pub fn new(config: Config) -> Result<Self, CacheError> {
        let jit = Jit::new(config.jit.clone())?;
        let cache = CodeCache::new(config.cache_budget);
        Ok(Self {
            config,
            jit,
            cache,
            blocks: Blocks::new(),
            timing: Timing {
                count: 0,
                last_addr: 0,
                next_event: 0,
            },
            stop: false,
        })
    }

    /// Requests that `exec` return before dispatching another unit.
    pub fn request_stop(&mut self) {
        self.stop = true;
    }

    /// External invalidation hook: a DMA engine or any other bus master
    /// wrote guest memory at `addr`.
    pub fn invalidate(&mut self, addr: Address) {
        self.blocks.invalidate(addr);
    }

    pub fn invalidate_range(&mut self, start: Address, len: u32) {
        let mut page = start.align_down(0x1000);
        while page.value() < start.value().wrapping_add(len) {
            self.blocks.invalidate(page);
            page += 0x1000u32;
        }
    }

    /// Guest cycles accounted so far.
    pub fn count(&self) -> u32 {
        self.timing.count
    }

    /// Runs translated guest code for roughly `cycles` cycles.
    pub fn exec<B: Bus>(
        &mut self,
        sys: &mut System<B>,
        cycles: Cycles,
    ) -> Result<Executed, CoreError> {
        let start_count = self.timing.count;
        let budget = cycles.value().min(i32::MAX as u64 - 1) as u32;
        let mut executed = Executed::default();
        self.stop = false;

        while !self.stop && self.timing.count.wrapping_sub(start_count) < budget {
            self.check_interrupts(&mut sys.cpu);
            self.schedule(&sys.cpu, start_count.wrapping_add(budget));

            let pc = Address(sys.cpu.pc);
            let (entry, unit_end) = self.prepare(sys, pc)?;

            self.timing.last_addr = pc.value();
            let next = {
                let mut bus = RecordingBus::new(&mut sys.bus);
                let mut ctx = HookCtx::<B> {
                    cpu: &mut sys.cpu,
                    bus: &mut bus,
                    timing: &mut self.timing,
                };
                let mut env = JitEnv::new(
                    interp_hook::<B>,
                    update_count_hook::<B>,
                    (&raw mut ctx).cast(),
                );

                // SAFETY: entry points into live finalized unit code; the
                // register model and hooks outlive the call
                let next = unsafe { self.jit.call(&mut env, sys.cpu.gpr_base(), entry) };

                for page in bus.written.drain(..) {
                    self.blocks.invalidate(Address(page << 12));
                }
                next
            };

            // the architectural zero register is unwritable; translated
            // code relies on its slot staying zero
            sys.cpu.gpr[0] = 0;

            // straight-line fall-through never reached the counting hook
            if self.timing.last_addr == pc.value() {
                self.timing.count = self
                    .timing
                    .count
                    .wrapping_add(unit_end.value().wrapping_sub(pc.value()) >> 2);
                self.timing.last_addr = unit_end.value();
            }

            sys.cpu.pc = if next == 0 { unit_end.value() } else { next };
            executed.units += 1;
        }

        executed.cycles = Cycles(self.timing.count.wrapping_sub(start_count) as u64);
        Ok(executed)
    }

    /// Finds or creates the translation covering `addr` and returns its
    /// entry pointer plus the unit's end address.
    fn prepare<B: Bus>(
        &mut self,
        sys: &mut System<B>,
        addr: Address,
    ) -> Result<(*const u8, Address), CoreError> {
        let mut freed = Vec::new();
        let page = self.blocks.ensure_page(addr, &mut sys.bus, &mut freed);
        let page_start = page.start;

        if let Some(unit) = page.covering(addr)
            && let Some(entry) = unit.entry(addr)
        {
            let (key, end) = (unit.start.value(), unit.end);
            self.cache.touch(key);
            self.free_keys(&freed);
            return Ok((entry, end));
        }

        // no live translation covers this address: scan for the new unit's
        // extent, resolve overlaps, then translate
        let start_index = ((addr.value() & 0xFFF) >> 2) as usize;
        let scan = mipsjit::scan(page_start, &page.words, start_index, &[]);
        let end = page_start + (scan.end_index * 4) as u32;

        let (start, holes) = match page.resolve_overlap(addr, end, &mut freed) {
            Prepared::New { holes } => (addr, holes),
            Prepared::Retranslate { outer } => {
                let unit = &page.funcs[&outer.value()];
                (outer, unit.holes.clone())
            }
        };

        let _span = tracing::debug_span!("recompile", %start).entered();
        let compiled = self
            .jit
            .translate(&TranslateRequest {
                page_start,
                words: &page.words,
                start,
                holes: &holes,
            })
            .context(CoreCtx::Translate)?;

        let size = compiled.code.len();
        let alloc = ExecAlloc::new(&compiled.code).context(CoreCtx::Cache)?;
        let key = start.value();
        // a unit re-translated under its own key keeps its cache entry
        freed.retain(|k| *k != key);
        let unit = crate::blocks::Unit::new(compiled, alloc, holes);
        let entry = unit.entry(addr).ok_or(CoreError::NoEntry(addr))?;
        let unit_end = unit.end;
        page.funcs.insert(key, unit);

        // cache accounting happens after the page borrow ends; the unit
        // being entered is protected from its own eviction pass
        let evicted = if self.cache.contains(key) {
            self.cache.realloc(key, size)
        } else {
            self.cache.alloc(size, key, Some(key))
        };
        for victim in &evicted {
            tracing::trace!(key = victim, "translation evicted");
            self.blocks.drop_unit_code(*victim);
        }
        self.free_keys(&freed);

        Ok((entry, unit_end))
    }

    fn free_keys(&mut self, keys: &[u32]) {
        for &key in keys {
            self.cache.free(key);
        }
    }

    /// Takes a pending timer interrupt, if any. Interrupts are only ever
    /// delivered between units, never mid-block.
    fn check_interrupts(&mut self, cpu: &mut Cpu) {
        cpu.cop0.regs[cop0::COUNT] = self.timing.count;

        let status = cpu.cop0.regs[cop0::STATUS];
        let compare = cpu.cop0.regs[cop0::COMPARE];
        let timer_armed = compare != 0 && status & 0x8000 != 0; // IM7

        if timer_armed && (self.timing.count.wrapping_sub(compare) as i32) >= 0 {
            cpu.cop0.regs[cop0::CAUSE] |= 1 << 15; // IP7
        }

        let pending = cpu.cop0.regs[cop0::CAUSE] & status & 0xFF00;
        let enabled = status & 0x1 != 0 && status & 0x2 == 0; // IE, !EXL
        if enabled && pending != 0 {
            cpu.cop0.regs[cop0::EPC] = cpu.pc;
            cpu.cop0.regs[cop0::STATUS] |= 0x2;
            cpu.cop0.regs[cop0::CAUSE] &= !0x7C; // ExcCode = Int
            cpu.pc = vr4300::EXCEPTION_VECTOR;
        }
    }

    /// Picks the next event the translated code must come home for.
    fn schedule(&mut self, cpu: &Cpu, budget_end: u32) {
        let mut next = budget_end;
        let compare = cpu.cop0.regs[cop0::COMPARE];
        let status = cpu.cop0.regs[cop0::STATUS];
        if compare != 0 && status & 0x8000 != 0 && status & 0x1 != 0 {
            let to_compare = compare.wrapping_sub(self.timing.count);
            let to_budget = budget_end.wrapping_sub(self.timing.count);
            if to_compare < to_budget {
                next = compare;
            }
        }
        self.timing.next_event = next;
    }
}
