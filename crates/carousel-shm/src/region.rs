//! Anonymous shared-memory regions backed by `memfd_create`.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

/// A shared mapping of an anonymous memory file.
///
/// Create it in one process, send the memfd to the peer, and rebuild the
/// mapping there with [`SharedRegion::from_fd`]. The virtual address differs
/// between the two mappings; anything stored inside the region must use
/// offsets, never pointers.
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    memfd: OwnedFd,
}

// SAFETY: the region is plain shared memory; what the bytes mean and who may
// touch them concurrently is the caller's protocol, exactly as with the raw
// mapping.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create an anonymous memory file of `len` bytes and map it shared.
    ///
    /// The name only shows up in `/proc` for debugging; it creates no
    /// filesystem entry. The memfd is close-on-exec: pass it to the peer
    /// explicitly (see [`crate::scm`]).
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let cname = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "region name contains NUL"))?;

        // SAFETY: cname is a valid NUL-terminated string.
        let raw = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: freshly created descriptor, owned by no one else.
        let memfd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: memfd is a valid file descriptor.
        if unsafe { libc::ftruncate(memfd.as_raw_fd(), len as libc::off_t) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Self::map(memfd, len)
    }

    /// Map a memory file received from the creating process.
    ///
    /// `len` must not exceed the file's size; the creating side normally
    /// transmits it alongside the descriptor.
    pub fn from_fd(memfd: OwnedFd, len: usize) -> io::Result<Self> {
        Self::map(memfd, len)
    }

    fn map(memfd: OwnedFd, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty region",
            ));
        }
        // SAFETY: no address hint; the kernel validates fd and length.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                memfd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            // SAFETY: a successful mmap never returns null.
            ptr: unsafe { NonNull::new_unchecked(addr as *mut u8) },
            len,
            memfd,
        })
    }

    /// Base address of this process's mapping.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The backing memory file, for passing to the peer.
    #[inline]
    pub fn memfd(&self) -> BorrowedFd<'_> {
        self.memfd.as_fd()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a mapping we own.
        if unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) } < 0 {
            tracing::warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_write() {
        let region = SharedRegion::create("carousel-test", 4096).unwrap();
        assert_eq!(region.len(), 4096);

        // SAFETY: exclusive mapping of 4096 bytes.
        unsafe {
            std::ptr::write_bytes(region.as_mut_ptr(), 0x5a, 4096);
            assert_eq!(*region.as_mut_ptr().add(4095), 0x5a);
        }
    }

    #[test]
    fn second_mapping_sees_writes() {
        let region = SharedRegion::create("carousel-test", 4096).unwrap();
        let dup = region.memfd().try_clone_to_owned().unwrap();
        let peer = SharedRegion::from_fd(dup, 4096).unwrap();
        assert_ne!(region.as_mut_ptr(), peer.as_mut_ptr());

        // SAFETY: both mappings cover the same 4096-byte file.
        unsafe {
            region.as_mut_ptr().write(42);
            assert_eq!(peer.as_mut_ptr().read(), 42);
        }
    }

    #[test]
    fn rejects_nul_in_name() {
        assert!(SharedRegion::create("bad\0name", 4096).is_err());
    }
}
