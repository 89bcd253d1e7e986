//! Executable memory for generated code
//!
//! mmap-backed buffers with a strict lifecycle: pages start readable and
//! writable, are sealed to readable and executable exactly once, and are
//! unmapped on drop. No page is ever writable and executable at the same
//! time, and writes after sealing are refused.

use std::ptr::NonNull;
use thiserror::Error;

/// Failures from the executable-memory layer
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("executable memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("write rejected: buffer is sealed")]
    Sealed,
    #[error("invalid executable memory size")]
    InvalidSize,
    #[error("executable memory is not supported on this platform")]
    Unsupported,
}

/// A page-aligned block of code memory
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    sealed: bool,
}

impl ExecutableMemory {
    /// Map a writable, non-executable block of at least `size` bytes
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let page = page_size();
        let size = (size + page - 1) & !(page - 1);
        let ptr = map_pages(size)?;
        Ok(Self {
            ptr,
            size,
            sealed: false,
        })
    }

    /// Size of the mapping, page-rounded
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the block has been sealed to read-and-execute
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Copy code into the block. Refused once sealed.
    pub fn write(&mut self, offset: usize, code: &[u8]) -> Result<(), MemoryError> {
        if self.sealed {
            return Err(MemoryError::Sealed);
        }
        if offset.checked_add(code.len()).is_none_or(|end| end > self.size) {
            return Err(MemoryError::InvalidSize);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr().add(offset), code.len());
        }
        Ok(())
    }

    /// Flip the block from RW to RX. Idempotent.
    #[cfg(unix)]
    pub fn seal(&mut self) -> Result<(), MemoryError> {
        if self.sealed {
            return Ok(());
        }
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        self.sealed = true;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn seal(&mut self) -> Result<(), MemoryError> {
        Err(MemoryError::Unsupported)
    }

    /// Entry point of the generated code. Only available once sealed, so a
    /// caller can never execute writable pages.
    ///
    /// # Safety
    /// The block must contain valid machine code for this target with the
    /// expected calling convention.
    pub unsafe fn entry(&self) -> Option<extern "C" fn(*mut i64)> {
        if !self.sealed {
            return None;
        }
        Some(unsafe { std::mem::transmute::<*const u8, extern "C" fn(*mut i64)>(self.ptr.as_ptr()) })
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

#[cfg(unix)]
fn map_pages(size: usize) -> Result<NonNull<u8>, MemoryError> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed);
    }
    NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
}

#[cfg(not(unix))]
fn map_pages(_size: usize) -> Result<NonNull<u8>, MemoryError> {
    Err(MemoryError::Unsupported)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_page_size() {
        let mem = ExecutableMemory::new(1).unwrap();
        assert!(mem.size() >= page_size());
        assert_eq!(mem.size() % page_size(), 0);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(
            ExecutableMemory::new(0),
            Err(MemoryError::InvalidSize)
        ));
    }

    #[test]
    fn write_then_seal() {
        let mut mem = ExecutableMemory::new(64).unwrap();
        mem.write(0, &[0xC3]).unwrap(); // ret
        assert!(!mem.is_sealed());
        mem.seal().unwrap();
        assert!(mem.is_sealed());
    }

    #[test]
    fn write_after_seal_is_refused() {
        let mut mem = ExecutableMemory::new(64).unwrap();
        mem.seal().unwrap();
        assert_eq!(mem.write(0, &[0x90]), Err(MemoryError::Sealed));
    }

    #[test]
    fn out_of_bounds_write_is_refused() {
        let mut mem = ExecutableMemory::new(64).unwrap();
        let size = mem.size();
        assert_eq!(
            mem.write(size, &[0x90]),
            Err(MemoryError::InvalidSize)
        );
    }

    #[test]
    fn entry_requires_seal() {
        let mut mem = ExecutableMemory::new(64).unwrap();
        mem.write(0, &[0xC3]).unwrap();
        assert!(unsafe { mem.entry() }.is_none());
        mem.seal().unwrap();
        assert!(unsafe { mem.entry() }.is_some());
    }
}
