//! Per-page registry of translated units, including the bookkeeping for
//! overlapping units and holes.

use std::collections::BTreeMap;

use jitcache::ExecAlloc;
use mipsjit::CompiledUnit;
use rustc_hash::{FxHashMap, FxHashSet};
use vr4300::{Address, Bus};

use crate::PAGE_BYTES;

/// One translated span of guest code, placed in executable memory.
///
/// The metadata outlives the code: eviction drops the allocation but keeps
/// the unit, so a later translation overlapping its range still sees the
/// hole structure.
pub struct Unit {
    pub start: Address,
    pub end: Address,
    /// Starts of sub-ranges owned by different, overlapping units.
    pub holes: Vec<Address>,
    pub need_pad: bool,
    code_addr: Box<[Option<u32>]>,
    alloc: Option<ExecAlloc>,
    size: usize,
}

impl Unit {
    pub fn new(compiled: CompiledUnit, alloc: ExecAlloc, holes: Vec<Address>) -> Self {
        Self {
            start: compiled.start,
            end: compiled.end,
            holes,
            need_pad: compiled.need_pad,
            code_addr: compiled.code_addr,
            size: compiled.code.len(),
            alloc: Some(alloc),
        }
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr.value() >= self.start.value() && addr.value() < self.end.value()
    }

    pub fn has_code(&self) -> bool {
        self.alloc.is_some()
    }

    /// Bytes of host code this unit occupies.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Entry pointer for resuming at `addr`, when this unit has live code
    /// covering it.
    pub fn entry(&self, addr: Address) -> Option<*const u8> {
        let alloc = self.alloc.as_ref()?;
        if !self.contains(addr) {
            return None;
        }
        let index = ((addr - self.start) / 4) as usize;
        let offset = self.code_addr.get(index).copied().flatten()?;
        Some(alloc.entry(offset as usize))
    }

    /// Drops the executable allocation, keeping the metadata.
    pub fn drop_code(&mut self) {
        self.alloc = None;
    }
}

/// How a translation request interacts with the units already present.
pub enum Prepared {
    /// Translate a fresh unit with the given holes.
    New { holes: Vec<Address> },
    /// The request lies inside the live unit starting at `outer`; a hole
    /// has been recorded there and the outer unit is re-translated in
    /// place.
    Retranslate { outer: Address },
}

/// One 4 KiB page of guest code and the units translated out of it.
pub struct PageBlock {
    pub start: Address,
    pub words: Vec<u32>,
    pub funcs: BTreeMap<u32, Unit>,
}

impl PageBlock {
    fn fetch(start: Address, bus: &mut impl Bus) -> Self {
        let words = (0..PAGE_BYTES / 4)
            .map(|i| bus.read_u32(start.value() + (i * 4) as u32))
            .collect();
        Self {
            start,
            words,
            funcs: BTreeMap::new(),
        }
    }

    /// The unit whose range covers `addr`, if any.
    pub fn covering(&self, addr: Address) -> Option<&Unit> {
        let (_, unit) = self.funcs.range(..=addr.value()).next_back()?;
        unit.contains(addr).then_some(unit)
    }

    /// Resolves overlaps between a new unit `[start, end)` and the existing
    /// ones. Containment turns one side into a hole of the other; any
    /// partial overlap frees the stale unit. Keys whose code allocation
    /// must be released are pushed to `freed`.
    pub fn resolve_overlap(
        &mut self,
        start: Address,
        end: Address,
        freed: &mut Vec<u32>,
    ) -> Prepared {
        let overlapping: Vec<u32> = self
            .funcs
            .iter()
            .filter(|(_, unit)| unit.start.value() < end.value() && unit.end.value() > start.value())
            .map(|(key, _)| *key)
            .collect();

        let mut holes = Vec::new();
        for key in overlapping {
            let unit = &self.funcs[&key];
            if unit.start.value() > start.value() && unit.end.value() <= end.value() {
                // the existing unit becomes a hole in the new, larger one,
                // and its own holes are inherited
                holes.push(unit.start);
                let unit = self.funcs.remove(&key).unwrap();
                holes.extend(unit.holes);
                freed.push(key);
            } else if start.value() > unit.start.value() && end.value() <= unit.end.value() {
                // the new request is a hole inside a live unit; nothing of
                // the outer unit is freed
                let outer = unit.start;
                let unit = self.funcs.get_mut(&key).unwrap();
                if !unit.holes.contains(&start) {
                    unit.holes.push(start);
                }
                return Prepared::Retranslate { outer };
            } else {
                // partial (or exact) overlap: the old unit is stale
                self.funcs.remove(&key);
                self.forget_hole(Address(key));
                freed.push(key);
            }
        }

        Prepared::New { holes }
    }

    /// Removes hole bookkeeping pointing at a unit whose metadata is gone,
    /// so no surviving unit references the freed range.
    fn forget_hole(&mut self, hole: Address) {
        for unit in self.funcs.values_mut() {
            unit.holes.retain(|h| *h != hole);
        }
    }
}

/// All known pages, plus the invalidation flags self-modifying code sets.
pub struct Blocks {
    pages: FxHashMap<u32, PageBlock>,
    invalid: FxHashSet<u32>,
}

impl Blocks {
    pub fn new() -> Self {
        Self {
            pages: FxHashMap::default(),
            invalid: FxHashSet::default(),
        }
    }

    /// The page covering `addr`, fetched from the bus on first sight and
    /// re-fetched (dropping every translated unit into `freed`) when it
    /// was invalidated.
    pub fn ensure_page(
        &mut self,
        addr: Address,
        bus: &mut impl Bus,
        freed: &mut Vec<u32>,
    ) -> &mut PageBlock {
        let page = addr.page();
        let start = addr.align_down(PAGE_BYTES as u32);

        if self.invalid.remove(&page) {
            if let Some(block) = self.pages.get_mut(&page) {
                tracing::debug!(page = %start, "retranslating invalidated page");
                freed.extend(block.funcs.keys().copied());
                *block = PageBlock::fetch(start, bus);
            }
        }

        self.pages
            .entry(page)
            .or_insert_with(|| PageBlock::fetch(start, bus))
    }

    pub fn page(&self, addr: Address) -> Option<&PageBlock> {
        self.pages.get(&addr.page())
    }

    pub fn page_mut(&mut self, addr: Address) -> Option<&mut PageBlock> {
        self.pages.get_mut(&addr.page())
    }

    /// Marks the page containing `addr` stale; its translations are
    /// discarded before the next dispatch into it.
    pub fn invalidate(&mut self, addr: Address) {
        if self.pages.contains_key(&addr.page()) {
            self.invalid.insert(addr.page());
        }
    }

    pub fn is_invalid(&self, addr: Address) -> bool {
        self.invalid.contains(&addr.page())
    }

    /// Drops an evicted unit's code allocation, keeping its metadata so
    /// overlap resolution still sees it.
    pub fn drop_unit_code(&mut self, key: u32) {
        if let Some(page) = self.pages.get_mut(&(key >> 12))
            && let Some(unit) = page.funcs.get_mut(&key)
        {
            unit.drop_code();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn unit(start: u32, end: u32) -> Unit {
        let len = ((end - start) / 4) as usize;
        Unit {
            start: Address(start),
            end: Address(end),
            holes: Vec::new(),
            need_pad: false,
            code_addr: vec![Some(0); len].into_boxed_slice(),
            alloc: Some(ExecAlloc::new(&[0xC3]).unwrap()),
            size: 1,
        }
    }

    fn page() -> PageBlock {
        PageBlock {
            start: Address(0x8000_0000),
            words: vec![0; 1024],
            funcs: BTreeMap::new(),
        }
    }

    #[test]
    fn contained_request_becomes_hole_without_freeing_outer() {
        let mut page = page();
        // outer unit [A, Z)
        page.funcs.insert(0x8000_0000, unit(0x8000_0000, 0x8000_0100));

        let mut freed = Vec::new();
        // request [B, C) with A < B < C < Z
        let prepared =
            page.resolve_overlap(Address(0x8000_0040), Address(0x8000_0080), &mut freed);

        assert!(matches!(
            prepared,
            Prepared::Retranslate { outer } if outer == Address(0x8000_0000)
        ));
        assert!(freed.is_empty());
        let outer = &page.funcs[&0x8000_0000];
        assert!(outer.has_code());
        assert_eq!(outer.holes, vec![Address(0x8000_0040)]);
    }

    #[test]
    fn contained_existing_becomes_hole_of_new() {
        let mut page = page();
        page.funcs.insert(0x8000_0040, unit(0x8000_0040, 0x8000_0080));

        let mut freed = Vec::new();
        let prepared =
            page.resolve_overlap(Address(0x8000_0000), Address(0x8000_0100), &mut freed);

        let Prepared::New { holes } = prepared else {
            panic!("expected a fresh translation");
        };
        assert_eq!(holes, vec![Address(0x8000_0040)]);
        assert_eq!(freed, vec![0x8000_0040]);
        assert!(page.funcs.is_empty());
    }

    #[test]
    fn partial_overlap_frees_stale_unit() {
        let mut page = page();
        page.funcs.insert(0x8000_0040, unit(0x8000_0040, 0x8000_0100));

        let mut freed = Vec::new();
        let prepared =
            page.resolve_overlap(Address(0x8000_0000), Address(0x8000_0080), &mut freed);

        assert!(matches!(prepared, Prepared::New { ref holes } if holes.is_empty()));
        assert_eq!(freed, vec![0x8000_0040]);
    }
}
