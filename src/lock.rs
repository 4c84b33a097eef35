//! Named cross-process mutual exclusion.
//!
//! Both sides of a channel open the lock by name before their first
//! transaction; whichever process gets there first creates it. Unix uses a
//! POSIX named semaphore with an initial count of one, Windows a named
//! mutex. Acquisition hands out an RAII [`LockGuard`] so the lock is
//! released on every exit path, including early returns and panics.

use tracing::warn;

use crate::Result;

/// Named lock shared by the producer and consumer processes.
#[derive(Debug)]
pub struct NamedLock {
    name: String,
    handle: imp::LockHandle,
    /// Whether this process unlinks the name on drop.
    is_creator: bool,
}

impl NamedLock {
    /// Create the named lock, or attach to it if the peer got there first.
    /// The side created with `is_creator` unlinks the name on drop.
    pub fn open_or_create(name: impl Into<String>, is_creator: bool) -> Result<Self> {
        let name = name.into();
        let handle = imp::open_or_create(&name)?;

        Ok(Self {
            name,
            handle,
            is_creator,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the lock is held. The critical sections guarded by this
    /// lock are a few word accesses and one bounded copy, so waits stay
    /// short.
    pub fn acquire(&self) -> Result<LockGuard<'_>> {
        imp::acquire(&self.handle)?;
        Ok(LockGuard { lock: self })
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        if let Err(e) = imp::close(&self.handle, &self.name, self.is_creator) {
            warn!("failed to close lock {}: {}", self.name, e);
        }
    }
}

/// Holds the lock from [`NamedLock::acquire`] until drop.
pub struct LockGuard<'a> {
    lock: &'a NamedLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = imp::release(&self.lock.handle) {
            warn!("failed to release lock {}: {}", self.lock.name, e);
        }
    }
}

#[cfg(unix)]
mod imp {
    use std::ffi::CString;

    use crate::{ChannelError, Result};

    #[derive(Debug)]
    pub struct LockHandle {
        sem: *mut libc::sem_t,
    }

    // Safety: sem_wait/sem_post on a process-shared named semaphore may be
    // called from any thread of the owning process.
    unsafe impl Send for LockHandle {}
    unsafe impl Sync for LockHandle {}

    /// Named semaphores share the slash-prefixed POSIX object namespace.
    fn sem_name(name: &str) -> Result<CString> {
        let path = if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{name}")
        };
        CString::new(path)
            .map_err(|_| ChannelError::Lock("lock name contains null byte".to_string()))
    }

    fn last_errno() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    pub fn open_or_create(name: &str) -> Result<LockHandle> {
        let c_name = sem_name(name)?;

        // Initial count of one: the lock starts released. If the semaphore
        // already exists the mode and count arguments are ignored.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(ChannelError::from_platform_error(
                last_errno(),
                "sem_open failed",
            ));
        }

        Ok(LockHandle { sem })
    }

    pub fn acquire(handle: &LockHandle) -> Result<()> {
        loop {
            if unsafe { libc::sem_wait(handle.sem) } == 0 {
                return Ok(());
            }
            let errno = last_errno();
            if errno != libc::EINTR {
                return Err(ChannelError::from_platform_error(errno, "sem_wait failed"));
            }
            // Interrupted by a signal; wait again.
        }
    }

    pub fn release(handle: &LockHandle) -> Result<()> {
        if unsafe { libc::sem_post(handle.sem) } != 0 {
            return Err(ChannelError::from_platform_error(
                last_errno(),
                "sem_post failed",
            ));
        }
        Ok(())
    }

    pub fn close(handle: &LockHandle, name: &str, unlink: bool) -> Result<()> {
        unsafe { libc::sem_close(handle.sem) };
        if unlink {
            if let Ok(c_name) = sem_name(name) {
                unsafe { libc::sem_unlink(c_name.as_ptr()) };
            }
        }
        Ok(())
    }
}

#[cfg(windows)]
mod imp {
    use std::ffi::CString;

    use winapi::um::handleapi::CloseHandle;
    use winapi::um::synchapi::{CreateMutexA, ReleaseMutex, WaitForSingleObject};
    use winapi::um::winbase::{INFINITE, WAIT_ABANDONED, WAIT_OBJECT_0};
    use winapi::um::winnt::HANDLE;

    use crate::{ChannelError, Result};

    #[derive(Debug)]
    pub struct LockHandle {
        mutex: HANDLE,
    }

    unsafe impl Send for LockHandle {}
    unsafe impl Sync for LockHandle {}

    pub fn open_or_create(name: &str) -> Result<LockHandle> {
        let c_name = CString::new(name)
            .map_err(|_| ChannelError::Lock("lock name contains null byte".to_string()))?;

        // Opens the existing mutex when the peer created it first.
        let mutex = unsafe { CreateMutexA(std::ptr::null_mut(), 0, c_name.as_ptr()) };
        if mutex.is_null() {
            return Err(ChannelError::Lock("CreateMutex failed".to_string()));
        }

        Ok(LockHandle { mutex })
    }

    pub fn acquire(handle: &LockHandle) -> Result<()> {
        match unsafe { WaitForSingleObject(handle.mutex, INFINITE) } {
            // An abandoned mutex is still owned by the caller afterwards.
            WAIT_OBJECT_0 | WAIT_ABANDONED => Ok(()),
            other => Err(ChannelError::Lock(format!(
                "WaitForSingleObject returned {other}"
            ))),
        }
    }

    pub fn release(handle: &LockHandle) -> Result<()> {
        if unsafe { ReleaseMutex(handle.mutex) } == 0 {
            return Err(ChannelError::Lock("ReleaseMutex failed".to_string()));
        }
        Ok(())
    }

    pub fn close(handle: &LockHandle, _name: &str, _unlink: bool) -> Result<()> {
        unsafe { CloseHandle(handle.mutex) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn unique_name(tag: &str) -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!(
            "shm-channel-lock-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn acquire_release_cycles() {
        let lock = NamedLock::open_or_create(unique_name("cycle"), true).unwrap();
        // A second acquisition only succeeds if the first guard released.
        drop(lock.acquire().unwrap());
        drop(lock.acquire().unwrap());
    }

    #[test]
    fn excludes_across_handles() {
        let name = unique_name("excl");
        let a = Arc::new(NamedLock::open_or_create(&name, true).unwrap());
        let b = NamedLock::open_or_create(&name, false).unwrap();

        let guard = a.acquire().unwrap();
        let flag = Arc::new(AtomicUsize::new(0));
        let worker = {
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || {
                let _guard = b.acquire().unwrap();
                flag.store(1, Ordering::SeqCst);
            })
        };

        // The worker must stay parked while the guard is live.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(flag.load(Ordering::SeqCst), 0);

        drop(guard);
        worker.join().unwrap();
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }
}
