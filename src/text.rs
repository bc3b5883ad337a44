//! Kernel text and stack access.
//!
//! The patch engine touches module text through [`KernelMemory`]:
//! whole-function reads for the scanner, single-byte stores for patching and
//! fault-tolerant word reads for argument extraction in trap context.

use core::sync::atomic::{AtomicU8, Ordering};

use axerrno::AxResult;

use crate::cache::flush_icache_range;

/// Memory primitives used by the scanner, patch engine and dispatcher.
pub trait KernelMemory: Send + Sync {
    /// Copy `buf.len()` bytes of text starting at `addr`.
    fn read_text(&self, addr: usize, buf: &mut [u8]) -> AxResult<()>;

    /// Store one byte into text at `addr`.
    ///
    /// The store must be observed atomically by instruction fetch on every
    /// CPU: no partially written state may exist.
    fn write_text_byte(&self, addr: usize, val: u8) -> AxResult<()>;

    /// Read one machine word at `addr`, returning `None` instead of faulting.
    ///
    /// Called from trap context: must not block or allocate.
    fn read_word_nofault(&self, addr: usize) -> Option<usize>;
}

/// Toggle write permission on a text range.
pub type TextWritableHook = fn(addr: usize, len: usize, writable: bool) -> AxResult<()>;

/// Guarded word read supplied by the host's fault fixup machinery.
pub type NofaultReadHook = fn(addr: usize) -> Option<usize>;

/// [`KernelMemory`] over the live kernel address space.
///
/// Text is accessed through raw pointers. The host supplies the permission
/// toggle and the guarded read, since both depend on its page table and
/// exception fixup code.
#[derive(Clone, Copy)]
pub struct DirectText {
    set_writable: Option<TextWritableHook>,
    nofault_read: NofaultReadHook,
}

impl DirectText {
    /// Create a direct accessor.
    ///
    /// # Safety
    /// Every address later passed to `read_text`/`write_text_byte` must be
    /// mapped kernel text, writable once `set_writable` (if any) has run.
    pub unsafe fn new(set_writable: Option<TextWritableHook>, nofault_read: NofaultReadHook) -> Self {
        Self {
            set_writable,
            nofault_read,
        }
    }
}

impl KernelMemory for DirectText {
    fn read_text(&self, addr: usize, buf: &mut [u8]) -> AxResult<()> {
        // SAFETY: `DirectText::new` contract: addr is mapped text.
        unsafe {
            core::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write_text_byte(&self, addr: usize, val: u8) -> AxResult<()> {
        if let Some(hook) = self.set_writable {
            hook(addr, 1, true)?;
        }

        // SAFETY: `DirectText::new` contract; a byte store is naturally aligned.
        let byte = unsafe { AtomicU8::from_ptr(addr as *mut u8) };
        byte.store(val, Ordering::SeqCst);

        if let Some(hook) = self.set_writable {
            hook(addr, 1, false)?;
        }
        flush_icache_range(addr, addr + 1);
        Ok(())
    }

    fn read_word_nofault(&self, addr: usize) -> Option<usize> {
        (self.nofault_read)(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn no_read(_addr: usize) -> Option<usize> {
        None
    }

    #[test]
    fn test_direct_text_patches_in_place() {
        let mut buf = vec![0x55u8, 0x48, 0x89, 0xe5];
        let base = buf.as_mut_ptr() as usize;
        let text = unsafe { DirectText::new(None, no_read) };

        text.write_text_byte(base, 0xcc).unwrap();
        let mut out = [0u8; 4];
        text.read_text(base, &mut out).unwrap();
        assert_eq!(out, [0xcc, 0x48, 0x89, 0xe5]);

        text.write_text_byte(base, 0x55).unwrap();
        assert_eq!(buf[0], 0x55);
        assert_eq!(text.read_word_nofault(base), None);
    }
}
