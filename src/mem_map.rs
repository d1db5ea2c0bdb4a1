//! Virtual memory reservations backing the spaces and their side tables.

use super::utils::*;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

pub use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};

/// A contiguous range of reserved address space. The map owns
/// `[begin, begin + size)` and unmaps it on drop.
pub struct MemMap {
    name: String,
    begin: Address,
    size: usize,
}

impl MemMap {
    fn target_mmap(
        start: Address,
        len: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        off: libc::off_t,
    ) -> io::Result<Address> {
        let result = unsafe { libc::mmap(start.to_mut_ptr(), len, prot, flags, fd, off) };
        if result == MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(Address::from_ptr(result))
        }
    }

    fn target_munmap(start: Address, len: usize) -> io::Result<()> {
        wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), len) }, 0)
    }

    /// Reserves `byte_count` bytes (rounded up to the page size) of private anonymous memory.
    /// `requested_begin` is only a hint; callers must look at `begin()` to see where the
    /// reservation actually landed.
    pub fn map_anonymous(
        name: &str,
        requested_begin: Option<Address>,
        byte_count: usize,
        prot: i32,
    ) -> io::Result<Self> {
        if byte_count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot reserve an empty mapping",
            ));
        }
        let page_aligned_byte_count = mem::checked_page_align(byte_count).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping size overflows the address space",
            )
        })?;
        let flags = MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE;
        let addr = requested_begin.unwrap_or_else(Address::null);
        let actual = Self::target_mmap(addr, page_aligned_byte_count, prot, flags, -1, 0)?;
        if requested_begin.is_some() && actual != addr {
            log::debug!(
                "{}: requested begin {} not granted, mapped at {}",
                name,
                addr,
                actual
            );
        }
        Ok(Self::new(name, actual, page_aligned_byte_count))
    }

    /// Maps the first `byte_count` bytes of `file` privately: writes stay in this process and
    /// are never written back.
    pub fn map_file(
        name: &str,
        file: &File,
        byte_count: usize,
        requested_begin: Option<Address>,
        prot: i32,
    ) -> io::Result<Self> {
        let page_aligned_byte_count = mem::page_align(byte_count);
        let addr = requested_begin.unwrap_or_else(Address::null);
        let actual = Self::target_mmap(
            addr,
            page_aligned_byte_count,
            prot,
            MAP_PRIVATE,
            file.as_raw_fd(),
            0,
        )?;
        Ok(Self::new(name, actual, page_aligned_byte_count))
    }

    fn new(name: &str, begin: Address, size: usize) -> Self {
        Self {
            name: name.to_string(),
            begin,
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn begin(&self) -> Address {
        self.begin
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn end(&self) -> Address {
        self.begin().offset(self.size())
    }

    pub fn has_address(&self, addr: Address) -> bool {
        self.begin() <= addr && addr < self.end()
    }

    fn check_range(&self, start: Address, len: usize) {
        assert!(
            start >= self.begin() && start.offset(len) <= self.end(),
            "range {}+{} outside of {} ({}-{})",
            start,
            len,
            self.name,
            self.begin(),
            self.end()
        );
    }

    /// Changes the protection of `[start, start + len)`, which must lie inside this map.
    pub fn protect(&self, start: Address, len: usize, prot: i32) -> io::Result<()> {
        self.check_range(start, len);
        if len == 0 {
            return Ok(());
        }
        wrap_libc_call(
            &|| unsafe { libc::mprotect(start.to_mut_ptr(), len, prot) },
            0,
        )
    }

    /// Hands the physical pages of `[start, start + len)` back to the kernel. On Linux the
    /// range reads back as zeroes afterwards.
    pub fn madvise_dontneed(&self, start: Address, len: usize) -> io::Result<()> {
        self.check_range(start, len);
        if len == 0 {
            return Ok(());
        }
        wrap_libc_call(
            &|| unsafe { libc::madvise(start.to_mut_ptr(), len, libc::MADV_DONTNEED) },
            0,
        )
    }

    pub fn madvise_dontneed_and_zero(&self) -> io::Result<()> {
        self.madvise_dontneed(self.begin, self.size)?;
        if !MADVISE_ZEROES {
            unsafe { core::ptr::write_bytes(self.begin.to_mut_ptr::<u8>(), 0, self.size) };
        }
        Ok(())
    }

    /// Splits this map at `new_end`. `self` keeps `[begin, new_end)`, the returned map owns
    /// `[new_end, end)` with its pages discarded and protection set to `tail_prot`.
    pub fn remap_at_end(
        &mut self,
        new_end: Address,
        tail_name: &str,
        tail_prot: i32,
    ) -> io::Result<MemMap> {
        assert!(new_end.is_page_aligned());
        assert!(
            self.begin() <= new_end && new_end <= self.end(),
            "split point {} outside of {}",
            new_end,
            self.name
        );
        let tail_size = self.end().offset_from(new_end);
        self.madvise_dontneed(new_end, tail_size)?;
        self.protect(new_end, tail_size, tail_prot)?;
        self.size = new_end.offset_from(self.begin);
        Ok(Self::new(tail_name, new_end, tail_size))
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        if self.size == 0 {
            return;
        }
        if let Err(err) = Self::target_munmap(self.begin, self.size) {
            log::error!("munmap of {} ({}) failed: {}", self.name, self.begin, err);
        }
    }
}

// Each map owns a disjoint address range; nothing is shared through the struct itself.
unsafe impl Send for MemMap {}
unsafe impl Sync for MemMap {}

#[cfg(target_os = "linux")]
pub const MADVISE_ZEROES: bool = true;
#[cfg(not(target_os = "linux"))]
pub const MADVISE_ZEROES: bool = false;

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> io::Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
