//! Executable code cache.
//!
//! A single mmap'd read+write+execute region with a monotone write cursor.
//! Translated blocks and stub regions are appended; the trace linker patches
//! words in place. Only the translator and linker ever hold `&mut CodeCache`.

pub mod block;
pub mod link;

use crate::error::EngineError;
use std::ptr::NonNull;

pub struct CodeCache {
    ptr: NonNull<u8>,
    capacity: usize,
    cursor: usize,
}

impl CodeCache {
    /// Map a fresh RWX region of `capacity` bytes (rounded up to pages).
    pub fn new(capacity: usize) -> Result<Self, EngineError> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let capacity = (capacity + page - 1) & !(page - 1);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(EngineError::CacheMap { errno });
        }
        Ok(CodeCache {
            ptr: NonNull::new(ptr as *mut u8).ok_or(EngineError::CacheMap { errno: 0 })?,
            capacity,
            cursor: 0,
        })
    }

    pub fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    /// Host address of a cache offset.
    pub fn addr_at(&self, offset: usize) -> u64 {
        debug_assert!(offset <= self.capacity);
        self.base() + offset as u64
    }

    /// Append a halfword. Callers reserve room up front; overrunning the
    /// region is an engine bug, not a recoverable condition.
    pub fn emit_u16(&mut self, value: u16) -> usize {
        assert!(self.cursor + 2 <= self.capacity, "code cache overrun");
        let off = self.cursor;
        unsafe {
            std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), self.at_mut(off), 2);
        }
        self.cursor += 2;
        off
    }

    /// Append a full instruction word.
    pub fn emit_u32(&mut self, value: u32) -> usize {
        assert!(self.cursor + 4 <= self.capacity, "code cache overrun");
        let off = self.cursor;
        unsafe {
            std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), self.at_mut(off), 4);
        }
        self.cursor += 4;
        off
    }

    /// Rewrite one already-emitted word (trace linking, stub redirection).
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.cursor, "patch outside emitted range");
        unsafe {
            std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), self.at_mut(offset), 4);
        }
    }

    /// Read back an emitted word (tests, block dumps).
    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.cursor);
        let mut bytes = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), bytes.as_mut_ptr(), 4);
        }
        u32::from_le_bytes(bytes)
    }

    /// Reset the cursor. The caller is responsible for clearing every table
    /// that references cache offsets; all such references are invalid after
    /// this returns.
    pub fn flush(&mut self) {
        self.cursor = 0;
    }

    /// Make newly written instructions visible to instruction fetch.
    pub fn sync_icache(&self) {
        #[cfg(target_arch = "riscv64")]
        unsafe {
            core::arch::asm!("fence.i");
        }
    }

    fn at_mut(&mut self, offset: usize) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(offset) }
    }
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_read() {
        let mut cache = CodeCache::new(4096).unwrap();
        let a = cache.emit_u32(0xdead_beef);
        let b = cache.emit_u16(0x1234);
        assert_eq!(a, 0);
        assert_eq!(b, 4);
        assert_eq!(cache.cursor(), 6);
        assert_eq!(cache.read_u32(0), 0xdead_beef);
    }

    #[test]
    fn test_patch() {
        let mut cache = CodeCache::new(4096).unwrap();
        cache.emit_u32(0);
        cache.patch_u32(0, 0x0000_0013);
        assert_eq!(cache.read_u32(0), 0x0000_0013);
    }

    #[test]
    fn test_flush_resets_cursor() {
        let mut cache = CodeCache::new(4096).unwrap();
        cache.emit_u32(1);
        cache.emit_u32(2);
        cache.flush();
        assert_eq!(cache.cursor(), 0);
        assert_eq!(cache.remaining(), cache.capacity());
    }

    #[test]
    fn test_capacity_page_rounded() {
        let cache = CodeCache::new(100).unwrap();
        assert!(cache.capacity() >= 4096);
        assert_eq!(cache.capacity() % 4096, 0);
    }
}
