//! The runtime services generated code can reach. A pointer to [`JitEnv`]
//! is pinned in a host register for the whole run of a unit; calls go
//! through its function-pointer fields, keeping unit code free of absolute
//! addresses.

use std::ffi::c_void;
use std::mem::offset_of;

/// Interpreter fallback: `(ctx, instruction word, guest pc, in delay slot)`.
/// Returns the guest address to redirect to, or 0 to fall through.
pub type InterpHook = extern "C" fn(*mut c_void, u32, u32, u32) -> u32;

/// Cycle accounting at control transfers: `(ctx, guest pc)`. Returns the
/// cycles remaining until the next scheduled event; a non-positive value
/// means an interrupt must be taken before continuing in translated code.
pub type UpdateCountHook = extern "C" fn(*mut c_void, u32) -> i32;

#[repr(C)]
pub struct JitEnv {
    pub interp: InterpHook,
    pub update_count: UpdateCountHook,
    /// Opaque context handed back to the hooks.
    pub ctx: *mut c_void,
}

pub(crate) const ENV_INTERP: i32 = offset_of!(JitEnv, interp) as i32;
pub(crate) const ENV_UPDATE_COUNT: i32 = offset_of!(JitEnv, update_count) as i32;
pub(crate) const ENV_CTX: i32 = offset_of!(JitEnv, ctx) as i32;

impl JitEnv {
    pub fn new(interp: InterpHook, update_count: UpdateCountHook, ctx: *mut c_void) -> Self {
        Self {
            interp,
            update_count,
            ctx,
        }
    }

    /// An environment whose hooks do nothing: the interpreter never
    /// redirects and no interrupt ever comes due. For tests.
    pub fn stub() -> Self {
        extern "C" fn interp(_: *mut c_void, _: u32, _: u32, _: u32) -> u32 {
            0
        }
        extern "C" fn update_count(_: *mut c_void, _: u32) -> i32 {
            i32::MAX
        }
        Self::new(interp, update_count, std::ptr::null_mut())
    }
}
