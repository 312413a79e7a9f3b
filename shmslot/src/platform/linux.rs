//! Linux-specific shared memory operations

use crate::error::{ShmError, ShmResult};
use crate::header::SegmentLayout;
use memmap2::{Mmap, MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::{Mode, fstat};
use nix::unistd::{ftruncate, geteuid};
use shmslot_common::consts::{HUGE_PAGE_SHIFT, SHM_NAME_MAX};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

/// Permission bits for newly created objects (owner and group read/write).
const SHM_MODE: u32 = 0o660;

/// Outcome of an exclusive create.
#[derive(Debug)]
pub enum CreateOutcome {
    /// This process owns the new object.
    Created(OwnedFd),
    /// Another process got there first.
    AlreadyExists,
}

/// Normalize a segment name into a POSIX shared memory object name.
///
/// A missing leading slash is added. Empty names, interior slashes, NUL
/// bytes and names over 255 bytes are rejected.
pub fn shm_name(name: &str) -> ShmResult<String> {
    let invalid = |reason| ShmError::InvalidName {
        name: name.to_string(),
        reason,
    };

    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() {
        return Err(invalid("name is empty"));
    }
    if bare.contains('/') {
        return Err(invalid("name may not contain '/' after the leading one"));
    }
    if bare.contains('\0') {
        return Err(invalid("name may not contain NUL"));
    }
    if bare.len() > SHM_NAME_MAX {
        return Err(invalid("name is longer than 255 bytes"));
    }
    Ok(format!("/{bare}"))
}

/// Fail fast unless the effective uid is root (when required).
pub fn check_privilege(required: bool) -> ShmResult<()> {
    if !required {
        return Ok(());
    }
    let euid = geteuid();
    if euid.is_root() {
        Ok(())
    } else {
        Err(ShmError::InsufficientPrivilege {
            euid: euid.as_raw(),
        })
    }
}

/// Open an existing object read/write. `Ok(None)` if it does not exist.
pub fn open_existing(name: &str) -> ShmResult<Option<OwnedFd>> {
    open_with(name, OFlag::O_RDWR)
}

/// Open an existing object read-only. `Ok(None)` if it does not exist.
pub fn open_read_only(name: &str) -> ShmResult<Option<OwnedFd>> {
    open_with(name, OFlag::O_RDONLY)
}

fn open_with(name: &str, flags: OFlag) -> ShmResult<Option<OwnedFd>> {
    match shm_open(name, flags, Mode::empty()) {
        Ok(fd) => Ok(Some(fd)),
        Err(Errno::ENOENT) => Ok(None),
        Err(e) => Err(ShmError::os("shm_open", name, e)),
    }
}

/// Create the object, failing if it already exists (`O_CREAT | O_EXCL`).
pub fn create_exclusive(name: &str) -> ShmResult<CreateOutcome> {
    let flags = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
    match shm_open(name, flags, Mode::from_bits_truncate(SHM_MODE)) {
        Ok(fd) => Ok(CreateOutcome::Created(fd)),
        Err(Errno::EEXIST) => Ok(CreateOutcome::AlreadyExists),
        Err(e) => Err(ShmError::os("shm_open(O_EXCL)", name, e)),
    }
}

/// Remove the name. Returns `false` if it was already gone.
pub fn unlink(name: &str) -> ShmResult<bool> {
    match shm_unlink(name) {
        Ok(()) => Ok(true),
        Err(Errno::ENOENT) => Ok(false),
        Err(e) => Err(ShmError::os("shm_unlink", name, e)),
    }
}

/// Current size of the object in bytes.
pub fn object_len<Fd: AsFd>(fd: Fd, name: &str) -> ShmResult<u64> {
    let stat = fstat(fd).map_err(|e| ShmError::os("fstat", name, e))?;
    Ok(stat.st_size.max(0) as u64)
}

/// Set the object size.
pub fn resize<Fd: AsFd>(fd: Fd, name: &str, len: usize) -> ShmResult<()> {
    let len = libc::off_t::try_from(len).map_err(|_| ShmError::os("ftruncate", name, Errno::EFBIG))?;
    ftruncate(fd, len).map_err(|e| ShmError::os("ftruncate", name, e))
}

/// Map only the header, read-only, with ordinary pages.
pub fn map_header(fd: &OwnedFd, name: &str) -> ShmResult<Mmap> {
    let mapped = unsafe {
        MmapOptions::new()
            .len(SegmentLayout::HEADER_SIZE)
            .map(fd.as_raw_fd())
    };
    mapped.map_err(|e| ShmError::os("mmap(header)", name, io_errno(&e)))
}

/// Map `len` bytes shared, read/write, optionally with `MAP_HUGETLB`.
pub fn map_shared(fd: &OwnedFd, len: usize, huge: bool) -> std::io::Result<MmapMut> {
    let mut options = MmapOptions::new();
    options.len(len);
    if huge {
        options.huge(Some(HUGE_PAGE_SHIFT));
    }
    unsafe { options.map_mut(fd.as_raw_fd()) }
}

/// Map the full segment, trying huge pages first when asked to.
///
/// A refused huge-page mapping is a logged downgrade, not an error; only a
/// failing ordinary-page mapping is fatal. Returns the mapping and whether
/// huge pages were obtained.
pub fn map_with_fallback(
    fd: &OwnedFd,
    name: &str,
    len: usize,
    want_huge: bool,
) -> ShmResult<(MmapMut, bool)> {
    if want_huge {
        match map_shared(fd, len, true) {
            Ok(mmap) => return Ok((mmap, true)),
            Err(e) => {
                tracing::warn!(
                    segment = name,
                    error = %e,
                    "HugePage mmap failed, falling back to 4KB pages"
                );
            }
        }
    }

    let mmap = map_shared(fd, len, false).map_err(|e| ShmError::os("mmap", name, io_errno(&e)))?;
    Ok((mmap, false))
}

fn io_errno(err: &std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    nix::unistd::getpid().as_raw() as u32
}
