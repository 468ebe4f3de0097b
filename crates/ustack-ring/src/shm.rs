//! POSIX shared-memory segments
//!
//! Thin owner/attacher wrapper over `shm_open` + `mmap`. The creator gets a
//! kernel-zeroed mapping and unlinks the name on drop; attachers map the
//! existing object and never re-initialize it. Unmapping order beyond
//! process exit is unspecified.
//!
//! NUMA placement is first-touch: the creator faults the pages in, so
//! callers pin the creating thread to a core on the target node before
//! constructing segments.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use ustack_common::{StackError, StackResult};

/// A mapped POSIX shared-memory object.
pub struct SharedSegment {
    name: CString,
    ptr: NonNull<u8>,
    len: usize,
    /// Owner created the object and unlinks the name on drop.
    owner: bool,
}

// The segment hands out raw memory; concurrent access discipline is the
// caller's (the ring protocol's) responsibility.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create a new segment of `len` bytes. Fails if the name exists.
    pub fn create(name: &str, len: usize) -> StackResult<Self> {
        Self::open(name, len, true)
    }

    /// Map an existing segment of `len` bytes.
    pub fn attach(name: &str, len: usize) -> StackResult<Self> {
        Self::open(name, len, false)
    }

    fn open(name: &str, len: usize, create: bool) -> StackResult<Self> {
        let c_name = CString::new(name)
            .map_err(|_| StackError::Shm(format!("bad segment name: {name}")))?;

        let flags = if create {
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR
        } else {
            libc::O_RDWR
        };

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o600) };
        if fd < 0 {
            return Err(StackError::Shm(format!(
                "shm_open({name}): {}",
                io::Error::last_os_error()
            )));
        }

        if create && unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(StackError::Shm(format!("ftruncate({name}): {err}")));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            if create {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
            return Err(StackError::Shm(format!("mmap({name}): {err}")));
        }

        tracing::debug!(name, len, create, "mapped shared segment");

        Ok(Self {
            name: c_name,
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned null"),
            len,
            owner: create,
        })
    }

    /// Base of the mapping.
    #[inline(always)]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Mapping length in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True for the creating endpoint.
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}
