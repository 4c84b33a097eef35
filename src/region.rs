//! Named shared memory segments.
//!
//! A [`Segment`] is a fixed-size block of memory shared between processes
//! under a well-known name. Each process maps it at whatever address the
//! kernel hands out, so everything stored inside is addressed by offset,
//! never by pointer.

use std::ptr::NonNull;

use tracing::warn;

use crate::{ChannelError, Result};

/// Mapped shared memory segment.
#[derive(Debug)]
pub struct Segment {
    /// Segment name/identifier
    name: String,
    /// Mapped length in bytes
    len: usize,
    /// Base of the mapping in this process
    ptr: NonNull<u8>,
    /// Platform-specific handle kept alive for the mapping's lifetime
    handle: PlatformHandle,
    /// Whether this process created the segment
    is_creator: bool,
}

/// Platform-specific handle types
#[derive(Debug)]
pub enum PlatformHandle {
    #[cfg(unix)]
    Unix { fd: std::os::fd::OwnedFd },
    #[cfg(windows)]
    Windows { handle: *mut std::ffi::c_void },
}

impl Segment {
    /// Create the named segment with the given length, or attach to it if it
    /// already exists. The creating side unlinks the name on drop, so the
    /// underlying object disappears once the last attached process releases
    /// it.
    pub fn create(name: impl Into<String>, len: usize) -> Result<Self> {
        let name = name.into();
        validate_segment_name(&name)?;

        let (ptr, handle) = imp::create_region(&name, len)?;

        Ok(Self {
            name,
            len,
            ptr,
            handle,
            is_creator: true,
        })
    }

    /// Attach to an existing named segment, taking the length from the
    /// underlying object. Fails if no such segment exists.
    pub fn open(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_segment_name(&name)?;

        let (ptr, len, handle) = imp::open_region(&name)?;

        Ok(Self {
            name,
            len,
            ptr,
            handle,
            is_creator: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base pointer of the mapping in this process. Offsets into the segment
    /// are stable across processes; this pointer is not.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Err(e) = imp::release_region(&self.handle, self.ptr, self.len, &self.name, self.is_creator) {
            warn!("failed to release segment {}: {}", self.name, e);
        }
    }
}

// Safety: the mapping stays valid wherever the handle moves; consistency of
// the shared contents is the control block's concern, not the mapping's.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

/// Validate segment name
fn validate_segment_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(ChannelError::Platform(
            "Invalid segment name length".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(ChannelError::Platform(
            "Segment name contains null byte".to_string(),
        ));
    }

    Ok(())
}

// Platform-specific implementations

#[cfg(unix)]
mod imp {
    use std::num::NonZeroUsize;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::ptr::NonNull;

    use nix::fcntl::OFlag;
    use nix::sys::mman::{self, MapFlags, ProtFlags};
    use nix::sys::stat::Mode;

    use super::PlatformHandle;
    use crate::{ChannelError, Result};

    /// POSIX shared object names live in a single flat namespace and must
    /// start with a slash.
    fn object_name(name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{name}")
        }
    }

    fn map_fd(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>> {
        let length = NonZeroUsize::new(len).ok_or_else(|| {
            ChannelError::MappingFailed("cannot map a zero-length segment".to_string())
        })?;

        let ptr = unsafe {
            mman::mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                Some(fd),
                0,
            )
        }
        .map_err(|e| ChannelError::from_platform_error(e as i32, "mmap failed"))?;

        NonNull::new(ptr as *mut u8)
            .ok_or_else(|| ChannelError::MappingFailed("mmap returned null".to_string()))
    }

    pub fn create_region(name: &str, len: usize) -> Result<(NonNull<u8>, PlatformHandle)> {
        let path = object_name(name);

        let fd = mman::shm_open(
            path.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| ChannelError::from_platform_error(e as i32, "shm_open failed"))?;

        nix::unistd::ftruncate(&fd, len as libc::off_t)
            .map_err(|e| ChannelError::from_platform_error(e as i32, "ftruncate failed"))?;

        let ptr = map_fd(&fd, len)?;

        Ok((ptr, PlatformHandle::Unix { fd }))
    }

    pub fn open_region(name: &str) -> Result<(NonNull<u8>, usize, PlatformHandle)> {
        let path = object_name(name);

        let fd = mman::shm_open(path.as_str(), OFlag::O_RDWR, Mode::empty()).map_err(|e| {
            match e {
                nix::errno::Errno::ENOENT => ChannelError::SegmentNotFound(name.to_string()),
                _ => ChannelError::from_platform_error(e as i32, "shm_open failed"),
            }
        })?;

        let stat = nix::sys::stat::fstat(fd.as_raw_fd())
            .map_err(|e| ChannelError::from_platform_error(e as i32, "fstat failed"))?;
        let len = stat.st_size as usize;

        let ptr = map_fd(&fd, len)?;

        Ok((ptr, len, PlatformHandle::Unix { fd }))
    }

    pub fn release_region(
        _handle: &PlatformHandle,
        ptr: NonNull<u8>,
        len: usize,
        name: &str,
        is_creator: bool,
    ) -> Result<()> {
        // The fd inside the handle closes when the segment drops.
        unsafe { mman::munmap(ptr.as_ptr() as *mut _, len) }
            .map_err(|e| ChannelError::from_platform_error(e as i32, "munmap failed"))?;

        if is_creator {
            let _ = mman::shm_unlink(object_name(name).as_str());
        }

        Ok(())
    }
}

#[cfg(windows)]
mod imp {
    use std::ffi::CString;
    use std::ptr::NonNull;

    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::memoryapi::{MapViewOfFile, UnmapViewOfFile, VirtualQuery};
    use winapi::um::winbase::{CreateFileMappingA, OpenFileMappingA};
    use winapi::um::winnt::{FILE_MAP_ALL_ACCESS, PAGE_READWRITE};

    use super::PlatformHandle;
    use crate::{ChannelError, Result};

    fn c_name(name: &str) -> Result<CString> {
        CString::new(name)
            .map_err(|_| ChannelError::Platform("Invalid segment name".to_string()))
    }

    pub fn create_region(name: &str, len: usize) -> Result<(NonNull<u8>, PlatformHandle)> {
        let c_name = c_name(name)?;

        let handle = unsafe {
            CreateFileMappingA(
                INVALID_HANDLE_VALUE,
                std::ptr::null_mut(),
                PAGE_READWRITE,
                (len >> 32) as u32,
                (len & 0xFFFF_FFFF) as u32,
                c_name.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(ChannelError::Platform("CreateFileMapping failed".to_string()));
        }

        let ptr = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, len) };
        if ptr.is_null() {
            unsafe { CloseHandle(handle) };
            return Err(ChannelError::MappingFailed("MapViewOfFile failed".to_string()));
        }

        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| ChannelError::MappingFailed("MapViewOfFile returned null".to_string()))?;

        Ok((ptr, PlatformHandle::Windows { handle }))
    }

    pub fn open_region(name: &str) -> Result<(NonNull<u8>, usize, PlatformHandle)> {
        let c_name = c_name(name)?;

        let handle = unsafe { OpenFileMappingA(FILE_MAP_ALL_ACCESS, 0, c_name.as_ptr()) };
        if handle.is_null() {
            return Err(ChannelError::SegmentNotFound(name.to_string()));
        }

        // Map the whole object, then ask the kernel how large it is.
        let ptr = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        if ptr.is_null() {
            unsafe { CloseHandle(handle) };
            return Err(ChannelError::MappingFailed("MapViewOfFile failed".to_string()));
        }

        let mut mbi = unsafe { std::mem::zeroed() };
        let queried = unsafe { VirtualQuery(ptr, &mut mbi, std::mem::size_of_val(&mbi)) };
        if queried == 0 {
            unsafe {
                UnmapViewOfFile(ptr);
                CloseHandle(handle);
            }
            return Err(ChannelError::Platform("VirtualQuery failed".to_string()));
        }

        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| ChannelError::MappingFailed("MapViewOfFile returned null".to_string()))?;

        Ok((ptr, mbi.RegionSize, PlatformHandle::Windows { handle }))
    }

    pub fn release_region(
        handle: &PlatformHandle,
        ptr: NonNull<u8>,
        _len: usize,
        _name: &str,
        _is_creator: bool,
    ) -> Result<()> {
        let PlatformHandle::Windows { handle } = handle;
        unsafe {
            UnmapViewOfFile(ptr.as_ptr() as *const _);
            CloseHandle(*handle);
        }
        Ok(())
    }
}
