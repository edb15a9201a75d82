// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Owned memory mappings of device regions.

use std::os::unix::io::AsRawFd;
use std::ptr::null_mut;

use libc::c_int;
use libc::PROT_READ;
use libc::PROT_WRITE;

use crate::errno::SysError;

/// Memory access type for a mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
}

impl Protection {
    /// Returns Protection allowing read/write access.
    pub fn read_write() -> Protection {
        Protection {
            read: true,
            write: true,
        }
    }

    /// Returns Protection allowing read access.
    pub fn read() -> Protection {
        Protection {
            read: true,
            write: false,
        }
    }
}

impl From<Protection> for c_int {
    #[inline(always)]
    fn from(p: Protection) -> Self {
        let mut value = 0;
        if p.read {
            value |= PROT_READ
        }
        if p.write {
            value |= PROT_WRITE;
        }
        value
    }
}

/// A shared memory mapping that is unmapped when dropped.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: *mut u8,
    size: usize,
}

// SAFETY: the mapping is plain memory owned by this object; access to its contents goes through
// raw pointers whose users uphold their own synchronization.
unsafe impl Send for MemoryMapping {}
// SAFETY: see above.
unsafe impl Sync for MemoryMapping {}

impl MemoryMapping {
    /// Creates an anonymous shared mapping of `size` bytes.
    pub fn new_anonymous(size: usize, prot: Protection) -> Result<MemoryMapping, SysError> {
        // SAFETY: a new anonymous mapping does not alias any existing memory.
        unsafe { MemoryMapping::try_mmap(size, prot.into(), None) }
    }

    /// Maps `size` bytes of `fd` starting at `offset`.
    pub fn from_descriptor_offset(
        fd: &dyn AsRawFd,
        size: usize,
        offset: u64,
        prot: Protection,
    ) -> Result<MemoryMapping, SysError> {
        // SAFETY: the kernel picks the address, so no existing memory is replaced.
        unsafe { MemoryMapping::try_mmap(size, prot.into(), Some((fd.as_raw_fd(), offset))) }
    }

    unsafe fn try_mmap(
        size: usize,
        prot: c_int,
        fd: Option<(c_int, u64)>,
    ) -> Result<MemoryMapping, SysError> {
        let mut flags = libc::MAP_SHARED;
        if fd.is_none() {
            flags |= libc::MAP_ANONYMOUS;
        }
        let (raw_fd, offset) = fd.unwrap_or((-1, 0));
        let offset: libc::off_t = offset
            .try_into()
            .map_err(|_| SysError::new(libc::EOVERFLOW))?;
        let addr = libc::mmap(null_mut(), size, prot, flags, raw_fd, offset);
        if addr == libc::MAP_FAILED {
            return Err(SysError::last());
        }
        Ok(MemoryMapping {
            addr: addr as *mut u8,
            size,
        })
    }

    /// Returns a pointer to the beginning of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // SAFETY: addr and size describe a mapping created by this object that nothing else
        // unmaps.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
    }
}

/// Returns the host page size.
pub fn pagesize() -> usize {
    // SAFETY: sysconf has no side effects.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_mapping_is_usable() {
        let m = MemoryMapping::new_anonymous(pagesize(), Protection::read_write()).unwrap();
        assert_eq!(m.size(), pagesize());
        // SAFETY: the mapping is read/write and at least one byte long.
        unsafe {
            m.as_ptr().write(0x5a);
            assert_eq!(m.as_ptr().read(), 0x5a);
        }
    }

    #[test]
    fn protection_bits() {
        assert_eq!(c_int::from(Protection::read()), PROT_READ);
        assert_eq!(
            c_int::from(Protection::read_write()),
            PROT_READ | PROT_WRITE
        );
        assert_eq!(c_int::from(Protection::default()), 0);
    }
}
