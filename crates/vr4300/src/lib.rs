//! Guest model of the NEC VR4300, the N64's MIPS R4300i-family CPU.

mod decode;
mod interp;

use zerocopy::{FromBytes, Immutable, IntoBytes};

#[rustfmt::skip]
pub use crate::{
    decode::{Cop0Func, CopRs, FpuFmt, Ins, Opcode, Regimm, Special},
    interp::{interp_one, step},
};

/// An address in the guest's 32-bit address space. Thin wrapper around an [`u32`].
#[repr(transparent)]
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash, IntoBytes, FromBytes, Immutable,
)]
pub struct Address(pub u32);

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "0x{:04X}_{:04X}",
            (self.0 & 0xFFFF_0000) >> 16,
            self.0 & 0xFFFF
        )
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Address {
    /// Returns the value of this address. Equivalent to `self.0`.
    #[inline(always)]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// The 4 KiB guest page this address belongs to.
    #[inline(always)]
    pub const fn page(self) -> u32 {
        self.0 >> 12
    }

    /// Aligns this address down to the given alignment.
    pub const fn align_down(self, alignment: u32) -> Self {
        Self(self.0 - self.0 % alignment)
    }
}

impl std::ops::Add<u32> for Address {
    type Output = Self;

    #[inline(always)]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Add<i32> for Address {
    type Output = Self;

    #[inline(always)]
    fn add(self, rhs: i32) -> Self::Output {
        Self(self.0.wrapping_add_signed(rhs))
    }
}

impl std::ops::AddAssign<u32> for Address {
    #[inline(always)]
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub<u32> for Address {
    type Output = Self;

    #[inline(always)]
    fn sub(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl std::ops::Sub<Address> for Address {
    type Output = i64;

    #[inline(always)]
    fn sub(self, rhs: Address) -> Self::Output {
        self.0 as i64 - rhs.0 as i64
    }
}

impl From<u32> for Address {
    #[inline(always)]
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Address> for u32 {
    #[inline(always)]
    fn from(value: Address) -> Self {
        value.0
    }
}

/// An amount of cycles of the guest CPU. Thin wrapper around an [`u64`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash, IntoBytes, FromBytes,
    Immutable,
)]
pub struct Cycles(pub u64);

impl std::fmt::Display for Cycles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Cycles {
    #[inline(always)]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl std::ops::Add for Cycles {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Cycles {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for Cycles {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

/// Register-model index of HI. The general purpose registers occupy 0..32.
pub const REG_HI: usize = 32;
/// Register-model index of LO.
pub const REG_LO: usize = 33;
/// The link register of `JAL` and the linking branch forms.
pub const REG_LR: usize = 31;

/// COP0 register indices used by this model.
pub mod cop0 {
    pub const COUNT: usize = 9;
    pub const COMPARE: usize = 11;
    pub const STATUS: usize = 12;
    pub const CAUSE: usize = 13;
    pub const EPC: usize = 14;
}

/// The general exception vector.
pub const EXCEPTION_VECTOR: u32 = 0x8000_0180;

/// COP0 state. Only the registers the dispatch loop and interpreter need.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Cop0 {
    pub regs: [u32; 32],
}

impl Default for Cop0 {
    fn default() -> Self {
        Self { regs: [0; 32] }
    }
}

/// The guest CPU state.
///
/// Layout contract: `gpr` is immediately followed by `hi` and `lo`, so that
/// generated code can address any register of the 34-entry model as
/// `gpr_base + index * 8` with HI at index 32 and LO at index 33. Asserted
/// below; do not reorder these fields.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Cpu {
    pub gpr: [u64; 32],
    pub hi: u64,
    pub lo: u64,
    pub fpr: [u64; 32],
    pub pc: u32,
    pub fcr31: u32,
    pub ll_bit: u32,
    pub cop0: Cop0,
}

static_assertions::const_assert_eq!(std::mem::offset_of!(Cpu, hi), REG_HI * 8);
static_assertions::const_assert_eq!(std::mem::offset_of!(Cpu, lo), REG_LO * 8);

impl Default for Cpu {
    fn default() -> Self {
        Self {
            gpr: [0; 32],
            hi: 0,
            lo: 0,
            fpr: [0; 32],
            pc: 0,
            fcr31: 0,
            ll_bit: 0,
            cop0: Cop0::default(),
        }
    }
}

impl Cpu {
    /// Pointer to the 34-entry register model, for handing to generated code.
    #[inline(always)]
    pub fn gpr_base(&mut self) -> *mut u64 {
        self.gpr.as_mut_ptr()
    }

    /// Reads a general purpose register by model index (HI/LO included).
    pub fn reg(&self, index: usize) -> u64 {
        match index {
            REG_HI => self.hi,
            REG_LO => self.lo,
            _ => self.gpr[index],
        }
    }

    /// Writes a general purpose register by model index. Writes to `$zero`
    /// are discarded.
    pub fn set_reg(&mut self, index: usize, value: u64) {
        match index {
            0 => (),
            REG_HI => self.hi = value,
            REG_LO => self.lo = value,
            _ => self.gpr[index] = value,
        }
    }
}

/// Access to guest memory. The guest is big-endian.
pub trait Bus {
    fn read_u8(&mut self, addr: u32) -> u8;
    fn read_u16(&mut self, addr: u32) -> u16;
    fn read_u32(&mut self, addr: u32) -> u32;
    fn read_u64(&mut self, addr: u32) -> u64;
    fn write_u8(&mut self, addr: u32, value: u8);
    fn write_u16(&mut self, addr: u32, value: u16);
    fn write_u32(&mut self, addr: u32, value: u32);
    fn write_u64(&mut self, addr: u32, value: u64);
}
