use rustix::mm::{self as mman, MapFlags, MprotectFlags, ProtFlags};

const PAGE_SIZE: usize = 4 * bytesize::KIB as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadExec,
    ReadWrite,
}

/// A memory mapped region. Unmapped on drop.
pub struct Region {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the region is exclusively owned
unsafe impl Send for Region {}

impl Region {
    /// Maps a new readable and writable region of at least `len` bytes.
    pub fn new(len: usize) -> rustix::io::Result<Self> {
        let len = len.max(1).next_multiple_of(PAGE_SIZE);

        // SAFETY: null hint, anonymous private mapping
        let ptr = unsafe {
            mman::mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        }?;

        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    /// Changes the protection of the whole region.
    pub fn protect(&self, protection: Protection) -> rustix::io::Result<()> {
        let flags = match protection {
            Protection::ReadExec => MprotectFlags::READ | MprotectFlags::EXEC,
            Protection::ReadWrite => MprotectFlags::READ | MprotectFlags::WRITE,
        };

        // SAFETY: the region was mapped by `new` and is still mapped
        unsafe { mman::mprotect(self.ptr.cast(), self.len, flags) }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: mapped by `new`, not yet unmapped
        unsafe {
            let _ = mman::munmap(self.ptr.cast(), self.len);
        }
    }
}
