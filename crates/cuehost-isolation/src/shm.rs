//! POSIX shared memory regions.
//!
//! The host creates one region per isolated instance and the worker opens it
//! by name. Only the creator unlinks the name on drop.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::IsolationError;

/// Per-process counter so concurrent instances get distinct names
static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a region name unique to this process and instance.
///
/// macOS/BSD limit shared memory names to ~31 characters, so the format is
/// `/cuehost_{pid}_{instance}_{ts}` with only the lower 32 bits of the
/// timestamp.
pub fn unique_name() -> String {
    let instance = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| (d.as_nanos() & 0xFFFF_FFFF) as u32)
        .unwrap_or(0);
    format!("/cuehost_{}_{instance}_{timestamp:x}", std::process::id())
}

/// Mapped shared memory region
pub struct SharedMemory {
    #[cfg(unix)]
    fd: libc::c_int,
    ptr: NonNull<u8>,
    size: usize,
    name: String,
    /// Whether this side created (and therefore unlinks) the region
    owner: bool,
}

impl SharedMemory {
    /// Create a zero-filled region of `size` bytes.
    pub fn create(name: &str, size: usize) -> Result<Self, IsolationError> {
        #[cfg(unix)]
        {
            Self::map_posix(name, size, true)
        }

        #[cfg(not(unix))]
        {
            let _ = (name, size);
            Err(IsolationError::SharedMemory(
                "Shared memory not implemented for this platform".to_string(),
            ))
        }
    }

    /// Open a region created by another process.
    ///
    /// Fails if the region is smaller than `size`.
    pub fn open(name: &str, size: usize) -> Result<Self, IsolationError> {
        #[cfg(unix)]
        {
            Self::map_posix(name, size, false)
        }

        #[cfg(not(unix))]
        {
            let _ = (name, size);
            Err(IsolationError::SharedMemory(
                "Shared memory not implemented for this platform".to_string(),
            ))
        }
    }

    #[cfg(unix)]
    #[allow(unsafe_code)]
    fn map_posix(name: &str, size: usize, create: bool) -> Result<Self, IsolationError> {
        let c_name = CString::new(name)
            .map_err(|e| IsolationError::SharedMemory(format!("Invalid name {name:?}: {e}")))?;
        let os_error = |what: &str| {
            IsolationError::SharedMemory(format!("{what} {name}: {}", io::Error::last_os_error()))
        };

        let flags = if create {
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR
        } else {
            libc::O_RDWR
        };
        // Owner read/write only
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o600) };
        if fd < 0 {
            return Err(os_error(if create {
                "Failed to create"
            } else {
                "Failed to open"
            }));
        }

        let fail = |error: IsolationError| {
            unsafe {
                libc::close(fd);
                if create {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
            Err(error)
        };

        let length = libc::off_t::try_from(size)
            .map_err(|_| IsolationError::SharedMemory(format!("Region too large: {size}")));
        let length = match length {
            Ok(length) => length,
            Err(e) => return fail(e),
        };

        if create {
            // ftruncate zero-fills the new region.
            if unsafe { libc::ftruncate(fd, length) } != 0 {
                return fail(os_error("Failed to size"));
            }
        } else {
            let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
            if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
                return fail(os_error("Failed to stat"));
            }
            let actual = unsafe { stat.assume_init() }.st_size;
            if actual < length {
                return fail(IsolationError::SharedMemory(format!(
                    "Region {name} is {actual} bytes, expected {size}"
                )));
            }
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return fail(os_error("Failed to map"));
        }
        let Some(ptr) = NonNull::new(ptr.cast::<u8>()) else {
            return fail(IsolationError::SharedMemory(format!("{name} mapped at null")));
        };

        tracing::debug!("Mapped shared memory {name} ({size} bytes, owner: {create})");
        Ok(Self {
            fd,
            ptr,
            size,
            name: name.to_string(),
            owner: create,
        })
    }

    /// Get a typed reference to the shared memory
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - The region is at least `size_of::<T>()` bytes and suitably aligned
    /// - The current contents are a valid `T`
    /// - Mutation by the other process goes through atomics or `UnsafeCell`
    #[allow(unsafe_code)]
    pub unsafe fn as_ref<T>(&self) -> &T {
        debug_assert!(std::mem::size_of::<T>() <= self.size);
        unsafe { &*self.ptr.as_ptr().cast::<T>() }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedMemory {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.size);
            libc::close(self.fd);

            if self.owner
                && let Ok(c_name) = CString::new(self.name.as_str())
            {
                libc::shm_unlink(c_name.as_ptr());
            }
        }
    }
}

// The mapping is process-wide and outlives any thread; cross-process
// synchronization is the caller's concern.
#[allow(unsafe_code)]
unsafe impl Send for SharedMemory {}
#[allow(unsafe_code)]
unsafe impl Sync for SharedMemory {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::AtomicU32;

    #[test]
    #[serial]
    #[allow(unsafe_code)]
    fn test_create_and_open() {
        let name = unique_name();
        let creator = SharedMemory::create(&name, 4096).expect("Failed to create shm");
        assert_eq!(creator.size(), 4096);

        // Fresh regions are zero-filled.
        let word = unsafe { creator.as_ref::<AtomicU32>() };
        assert_eq!(word.load(Ordering::Acquire), 0);
        word.store(42, Ordering::Release);

        // Open from another "process" (same process for testing)
        let reader = SharedMemory::open(&name, 4096).expect("Failed to open shm");
        let seen = unsafe { reader.as_ref::<AtomicU32>() };
        assert_eq!(seen.load(Ordering::Acquire), 42);

        // The reader must not unlink the creator's region.
        drop(reader);
        assert!(SharedMemory::open(&name, 4096).is_ok());
    }

    #[test]
    #[serial]
    fn test_open_rejects_small_or_missing_regions() {
        let name = unique_name();
        assert!(SharedMemory::open(&name, 4096).is_err());

        let _creator = SharedMemory::create(&name, 1024).unwrap();
        assert!(matches!(
            SharedMemory::open(&name, 4096),
            Err(IsolationError::SharedMemory(_))
        ));
        // Exclusive create: the name is taken.
        assert!(SharedMemory::create(&name, 1024).is_err());
    }

    #[test]
    fn test_unique_names_fit_macos_limit() {
        let a = unique_name();
        let b = unique_name();
        assert_ne!(a, b);
        assert!(a.starts_with("/cuehost_"));
        assert!(a.len() <= 31, "{a} is too long");
    }
}
