// This module owns the executable-memory arena that compiled units are published into. The
// arena is one anonymous mapping reserved up front and handed out by a bump pointer in whole
// pages, so that protection changes on one unit never touch another. The mapping starts
// read/write; commit copies a unit's bytes into fresh pages under the arena lock, issues a
// release fence and then flips those pages to read/execute, so no other thread can observe
// the region before its bytes are complete. A full arena reports AllocationExhaustion and
// leaves the bump pointer untouched. patch reopens a committed region for writing under the
// same lock; it exists for the garbage collector rewriting embedded object references.
// Dropping the arena unmaps it. The arena is passed explicitly to whoever commits code.

//! Executable memory arena.

use crate::core::error::{CompileError, CompileResult};
use crate::core::operand::CodePtr;
use std::sync::atomic::{fence, Ordering};
use std::sync::Mutex;

/// A committed, page-aligned piece of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeRegion {
    addr: usize,
    len: usize,
    /// Bytes reserved, a multiple of the page size.
    reserved: usize,
}

impl CodeRegion {
    pub fn start(&self) -> CodePtr {
        CodePtr::new(self.addr)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer `offset` bytes into the region.
    pub fn at(&self, offset: usize) -> Option<CodePtr> {
        (offset < self.len).then(|| CodePtr::new(self.addr + offset))
    }
}

#[derive(Debug)]
struct ArenaState {
    used: usize,
}

/// Anonymous mapping shared by every compilation.
#[derive(Debug)]
pub struct ExecArena {
    base: *mut u8,
    size: usize,
    page_size: usize,
    state: Mutex<ArenaState>,
}

// The raw mapping is only written under `state`'s lock.
unsafe impl Send for ExecArena {}
unsafe impl Sync for ExecArena {}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn os_error(what: &str) -> CompileError {
    CompileError::ExecMemory {
        reason: format!("{what} failed: {}", std::io::Error::last_os_error()),
    }
}

impl ExecArena {
    /// Map an arena of at least `bytes` bytes.
    pub fn new(bytes: usize) -> CompileResult<Self> {
        if bytes == 0 {
            return Err(CompileError::ExecMemory {
                reason: "arena size must be non-zero".to_string(),
            });
        }
        let page_size = page_size();
        let size = bytes.div_ceil(page_size) * page_size;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(os_error("mmap"));
        }

        log::debug!("mapped {size} byte executable arena at {ptr:p}");
        Ok(Self {
            base: ptr as *mut u8,
            size,
            page_size,
            state: Mutex::new(ArenaState { used: 0 }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ArenaState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn used(&self) -> usize {
        self.lock().used
    }

    fn protect(&self, addr: usize, len: usize, prot: libc::c_int, what: &str) -> CompileResult<()> {
        let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) };
        if rc != 0 {
            return Err(os_error(what));
        }
        Ok(())
    }

    /// Copy `code` into fresh pages and make them executable.
    pub fn commit(&self, code: &[u8]) -> CompileResult<CodeRegion> {
        let mut state = self.lock();
        let addr = self.base as usize + state.used;
        if code.is_empty() {
            return Ok(CodeRegion {
                addr,
                len: 0,
                reserved: 0,
            });
        }

        let reserved = code.len().div_ceil(self.page_size) * self.page_size;
        let available = self.size - state.used;
        if reserved > available {
            return Err(CompileError::AllocationExhaustion {
                requested: code.len(),
                available,
            });
        }

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), addr as *mut u8, code.len());
        }
        fence(Ordering::Release);
        self.protect(addr, reserved, libc::PROT_READ | libc::PROT_EXEC, "mprotect(PROT_READ|PROT_EXEC)")?;
        state.used += reserved;

        log::trace!("committed {} bytes at {addr:#x}", code.len());
        Ok(CodeRegion {
            addr,
            len: code.len(),
            reserved,
        })
    }

    /// Overwrite `bytes` at `offset` inside a committed region.
    pub fn patch(&self, region: &CodeRegion, offset: usize, bytes: &[u8]) -> CompileResult<()> {
        if offset + bytes.len() > region.len {
            return Err(CompileError::ExecMemory {
                reason: format!(
                    "patch of {} bytes at {offset} outside {} byte region",
                    bytes.len(),
                    region.len
                ),
            });
        }
        let _state = self.lock();
        self.protect(region.addr, region.reserved, libc::PROT_READ | libc::PROT_WRITE, "mprotect(PROT_READ|PROT_WRITE)")?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), (region.addr + offset) as *mut u8, bytes.len());
        }
        fence(Ordering::Release);
        self.protect(region.addr, region.reserved, libc::PROT_READ | libc::PROT_EXEC, "mprotect(PROT_READ|PROT_EXEC)")
    }

    /// Copy of the bytes committed to `region`.
    pub fn read(&self, region: &CodeRegion) -> Vec<u8> {
        let _state = self.lock();
        if region.len == 0 {
            return Vec::new();
        }
        unsafe { std::slice::from_raw_parts(region.addr as *const u8, region.len) }.to_vec()
    }
}

impl Drop for ExecArena {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base as *mut libc::c_void, self.size) };
        if rc != 0 {
            log::warn!("munmap failed: {}", std::io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_and_read_back() {
        let arena = ExecArena::new(1 << 16).unwrap();
        let region = arena.commit(&[0x90, 0x90, 0xC3]).unwrap();
        assert_eq!(region.len(), 3);
        assert_eq!(arena.read(&region), vec![0x90, 0x90, 0xC3]);
        assert_eq!(arena.used() % page_size(), 0);
        assert!(region.at(3).is_none());
    }

    #[test]
    fn test_regions_do_not_share_pages() {
        let arena = ExecArena::new(1 << 16).unwrap();
        let a = arena.commit(&[0xC3]).unwrap();
        let b = arena.commit(&[0xC3]).unwrap();
        assert!(b.start().addr() - a.start().addr() >= page_size());
    }

    #[test]
    fn test_exhaustion_leaves_arena_untouched() {
        let arena = ExecArena::new(1).unwrap();
        let code = vec![0x90; arena.capacity() + 1];
        let err = arena.commit(&code).unwrap_err();
        assert!(matches!(err, CompileError::AllocationExhaustion { .. }));
        assert_eq!(arena.used(), 0);
        assert!(arena.commit(&[0xC3]).is_ok());
    }

    #[test]
    fn test_empty_commit() {
        let arena = ExecArena::new(4096).unwrap();
        let region = arena.commit(&[]).unwrap();
        assert!(region.is_empty());
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_patch_in_place() {
        let arena = ExecArena::new(4096).unwrap();
        let region = arena.commit(&[0x90, 0x90, 0xC3]).unwrap();
        arena.patch(&region, 1, &[0xCC]).unwrap();
        assert_eq!(arena.read(&region), vec![0x90, 0xCC, 0xC3]);
        assert!(arena.patch(&region, 3, &[0x90]).is_err());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            ExecArena::new(0),
            Err(CompileError::ExecMemory { .. })
        ));
    }
}
