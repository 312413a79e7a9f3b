//! Segment manager: attach-or-create protocol for named slot segments
//!
//! Any number of processes may call [`SharedStore::open`] with the same name
//! at the same time. Exactly one of them wins the exclusive create and
//! initializes the segment; every other caller joins it once the readiness
//! marker is published. No external coordinator is involved: the only
//! arbiter is the kernel's `O_CREAT | O_EXCL`.
//!
//! ```text
//!            ┌──────────────┐  missing   ┌────────────────┐  EEXIST
//!  open() ──►│   try_join   ├───────────►│   try_create   ├──────────┐
//!            └──┬────────┬──┘            └───────┬────────┘          │
//!        ready  │        │ never ready           │ published         │
//!               ▼        ▼                       ▼                   │
//!            Joined   unlink ──► try_create   Created     sleep, next round
//! ```

use crate::cell::{PaddedCell, ShmSafe};
use crate::error::{ShmError, ShmResult};
use crate::header::{SegmentHeader, SegmentLayout};
use crate::platform::{self, CreateOutcome};
use crate::view::SlotView;
use memmap2::MmapMut;
use serde::Serialize;
use shmslot_common::config::StoreOptions;
use std::fmt;
use std::marker::PhantomData;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MIB: usize = 1024 * 1024;

/// How this process ended up attached to a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    /// Attached to a segment another process initialized.
    Joined,
    /// Won the exclusive create and initialized the segment.
    Created,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Joined => f.write_str("joined"),
            Role::Created => f.write_str("created"),
        }
    }
}

/// One process's attachment to a named slot segment.
///
/// Owns the descriptor and the mapping; dropping it unmaps and closes but
/// never removes the name, which outlives every process until
/// [`SharedStore::unlink`] is called.
pub struct SharedStore<T: ShmSafe> {
    name: String,
    role: Role,
    layout: SegmentLayout,
    huge_pages: bool,
    base: NonNull<u8>,
    _mmap: MmapMut,
    _fd: OwnedFd,
    _marker: PhantomData<T>,
}

// SAFETY: the mapping is shared memory accessed only through cell locks and
// atomics; `base` stays valid as long as `_mmap` lives.
unsafe impl<T: ShmSafe> Send for SharedStore<T> {}
unsafe impl<T: ShmSafe> Sync for SharedStore<T> {}

enum JoinOutcome<T: ShmSafe> {
    Joined(SharedStore<T>),
    NotFound,
    Stale,
}

/// Unlinks a freshly created object unless initialization completes.
struct CreationGuard<'a> {
    name: &'a str,
    armed: bool,
}

impl<'a> CreationGuard<'a> {
    fn new(name: &'a str) -> Self {
        Self { name, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Initialization of {} failed, removing the object", self.name);
            if let Err(e) = platform::unlink(self.name) {
                warn!("Cleanup of {} failed: {}", self.name, e);
            }
        }
    }
}

/// Backoff before the next join/create round; none after the final round.
fn retry_pause(attempt: u32, options: &StoreOptions) -> Option<Duration> {
    (attempt < options.max_attempts).then(|| options.retry_backoff())
}

impl<T: ShmSafe> SharedStore<T> {
    /// Attach to `name`, creating it with `capacity` slots if it does not
    /// exist, using the default [`StoreOptions`].
    ///
    /// `capacity` only matters to the creator; joiners get the capacity
    /// recorded in the header.
    pub fn open(name: &str, capacity: usize) -> ShmResult<(Self, Role)> {
        Self::open_with(name, capacity, &StoreOptions::default())
    }

    /// [`open`](Self::open) with explicit bounds and policy.
    ///
    /// # Errors
    ///
    /// Fatal conditions only: [`ShmError::InsufficientPrivilege`],
    /// [`ShmError::InvalidName`], [`ShmError::InvalidCapacity`],
    /// [`ShmError::TypeMismatch`], [`ShmError::CorruptSegment`],
    /// [`ShmError::Os`] and [`ShmError::Contention`]. Missing objects, lost
    /// creation races, stale segments and refused huge pages are handled
    /// here.
    pub fn open_with(name: &str, capacity: usize, options: &StoreOptions) -> ShmResult<(Self, Role)> {
        options.validate()?;
        platform::check_privilege(options.require_root)?;
        let name = platform::shm_name(name)?;

        for attempt in 1..=options.max_attempts {
            match Self::try_join(&name, options)? {
                JoinOutcome::Joined(store) => return Ok((store, Role::Joined)),
                JoinOutcome::Stale => {
                    warn!("Removed stale segment {}, retrying as creator", name);
                }
                JoinOutcome::NotFound => {}
            }

            let layout = SegmentLayout::for_type::<T>(capacity)?;
            if let Some(store) = Self::try_create(&name, layout, options)? {
                return Ok((store, Role::Created));
            }

            if let Some(pause) = retry_pause(attempt, options) {
                warn!(
                    "Concurrent creation of {} detected (EEXIST), retrying join (attempt {}/{})",
                    name, attempt, options.max_attempts
                );
                std::thread::sleep(pause);
            }
        }

        Err(ShmError::Contention {
            name,
            attempts: options.max_attempts,
        })
    }

    fn try_join(name: &str, options: &StoreOptions) -> ShmResult<JoinOutcome<T>> {
        let Some(fd) = platform::open_existing(name)? else {
            return Ok(JoinOutcome::NotFound);
        };
        let deadline = Instant::now() + options.ready_timeout();

        // the creator sizes the object after creating it; mapping before
        // that would fault on first touch
        while platform::object_len(&fd, name)? < SegmentLayout::HEADER_SIZE as u64 {
            if Instant::now() >= deadline {
                warn!("Segment {} was never sized (creator hung or crashed)", name);
                return Self::discard_stale(name, fd);
            }
            std::thread::sleep(options.ready_poll());
        }

        let header_map = platform::map_header(&fd, name)?;
        let published = {
            // SAFETY: the mapping is at least one header long and page aligned.
            let header = unsafe { &*(header_map.as_ptr() as *const SegmentHeader) };
            loop {
                if header.is_ready() {
                    let object_len = platform::object_len(&fd, name)?;
                    break Some(header.validate_for::<T>(name, object_len)?);
                }
                if Instant::now() >= deadline {
                    break None;
                }
                std::thread::sleep(options.ready_poll());
            }
        };
        drop(header_map);

        let Some(layout) = published else {
            warn!("Readiness marker of {} timed out (corrupt or initialization hung)", name);
            return Self::discard_stale(name, fd);
        };

        let (mmap, huge_pages) =
            platform::map_with_fallback(&fd, name, layout.aligned_total_size, options.huge_pages)?;
        info!(
            "Joined {}: {} slots, {} MB{}",
            name,
            layout.element_count,
            layout.aligned_total_size / MIB,
            if huge_pages { ", huge pages" } else { "" }
        );

        Ok(JoinOutcome::Joined(Self::from_parts(
            name,
            Role::Joined,
            layout,
            huge_pages,
            mmap,
            fd,
        )))
    }

    fn discard_stale(name: &str, fd: OwnedFd) -> ShmResult<JoinOutcome<T>> {
        drop(fd);
        platform::unlink(name)?;
        Ok(JoinOutcome::Stale)
    }

    fn try_create(
        name: &str,
        layout: SegmentLayout,
        options: &StoreOptions,
    ) -> ShmResult<Option<Self>> {
        let fd = match platform::create_exclusive(name)? {
            CreateOutcome::Created(fd) => fd,
            CreateOutcome::AlreadyExists => return Ok(None),
        };
        let guard = CreationGuard::new(name);

        platform::resize(&fd, name, layout.aligned_total_size)?;
        let (mut mmap, huge_pages) =
            platform::map_with_fallback(&fd, name, layout.aligned_total_size, options.huge_pages)?;

        // SAFETY: the mapping spans `aligned_total_size` bytes, enough for the
        // header and every cell, and nobody else can read it before `publish`.
        unsafe {
            let base = mmap.as_mut_ptr();
            let cells = base.add(SegmentLayout::HEADER_SIZE) as *mut PaddedCell<T>;
            for index in 0..layout.element_count {
                cells.add(index).write(PaddedCell::default());
            }
            SegmentHeader::publish(base as *mut SegmentHeader, &layout);
        }
        guard.disarm();

        info!(
            "Created {}: {} slots requested, {} MB after alignment{}",
            name,
            layout.element_count,
            layout.aligned_total_size / MIB,
            if huge_pages { ", huge pages" } else { "" }
        );

        Ok(Some(Self::from_parts(
            name,
            Role::Created,
            layout,
            huge_pages,
            mmap,
            fd,
        )))
    }

    fn from_parts(
        name: &str,
        role: Role,
        layout: SegmentLayout,
        huge_pages: bool,
        mut mmap: MmapMut,
        fd: OwnedFd,
    ) -> Self {
        let base = NonNull::new(mmap.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            name: name.to_string(),
            role,
            layout,
            huge_pages,
            base,
            _mmap: mmap,
            _fd: fd,
            _marker: PhantomData,
        }
    }

    /// Bounds-checked locked access to the slots.
    pub fn view(&self) -> SlotView<'_, T> {
        // SAFETY: the mapping holds a published header and `element_count`
        // initialized cells, and lives as long as `self`.
        unsafe { SlotView::attach(self.base.as_ptr(), self.layout.element_count) }
    }

    /// Object name, with its leading slash.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this attachment created or joined the segment.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of slots recorded in the header.
    pub fn capacity(&self) -> usize {
        self.layout.element_count
    }

    /// Bytes mapped (the 2 MiB aligned object size).
    pub fn mapped_size(&self) -> usize {
        self.layout.aligned_total_size
    }

    /// Whether the mapping is backed by huge pages.
    pub fn huge_pages(&self) -> bool {
        self.huge_pages
    }

    /// Layout shared by every attached process.
    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    /// Remove a named object. Attached processes keep their mappings; the
    /// next `open` creates a fresh segment. Returns `false` if it did not exist.
    pub fn unlink(name: &str) -> ShmResult<bool> {
        let name = platform::shm_name(name)?;
        let removed = platform::unlink(&name)?;
        if removed {
            info!("Unlinked {}", name);
        }
        Ok(removed)
    }
}

impl<T: ShmSafe> Drop for SharedStore<T> {
    fn drop(&mut self) {
        debug!("Memory mapping of {} released ({})", self.name, self.role);
    }
}

impl<T: ShmSafe> fmt::Debug for SharedStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStore")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("layout", &self.layout)
            .field("huge_pages", &self.huge_pages)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> StoreOptions {
        StoreOptions::default()
            .with_require_root(false)
            .with_ready_timeout(Duration::from_millis(200))
    }

    fn unique(tag: &str) -> String {
        format!("shmslot_mgr_{}_{}", tag, platform::get_current_pid())
    }

    #[test]
    fn test_create_then_join_same_process() {
        let name = unique("create_join");
        let _ = SharedStore::<u64>::unlink(&name);

        let (first, role) = SharedStore::<u64>::open_with(&name, 16, &options()).unwrap();
        assert_eq!(role, Role::Created);
        assert_eq!(first.capacity(), 16);
        assert_eq!(first.name(), format!("/{name}"));
        assert_eq!(first.mapped_size() % (2 * MIB), 0);

        let (second, role) = SharedStore::<u64>::open_with(&name, 999, &options()).unwrap();
        assert_eq!(role, Role::Joined);
        assert_eq!(second.capacity(), 16);

        first.view().access(3, |v| *v = 42).unwrap();
        assert_eq!(second.view().access(3, |v| *v).unwrap(), 42);

        drop(first);
        assert_eq!(second.view().access(3, |v| *v).unwrap(), 42);

        assert!(SharedStore::<u64>::unlink(&name).unwrap());
    }

    #[test]
    fn test_zero_capacity_never_creates() {
        let name = unique("zero");
        let _ = SharedStore::<u64>::unlink(&name);

        let err = SharedStore::<u64>::open_with(&name, 0, &options()).unwrap_err();
        assert!(matches!(err, ShmError::InvalidCapacity { capacity: 0, .. }));
        assert!(platform::open_existing(&format!("/{name}")).unwrap().is_none());
    }

    #[test]
    fn test_invalid_options_rejected() {
        let mut bad = options();
        bad.max_attempts = 0;
        let err = SharedStore::<u64>::open_with(&unique("opts"), 1, &bad).unwrap_err();
        assert!(matches!(err, ShmError::Config { .. }));
    }

    #[test]
    fn test_creation_guard_unlinks_when_armed() {
        let name = format!("/{}", unique("guard"));
        let _ = platform::unlink(&name);
        let fd = match platform::create_exclusive(&name).unwrap() {
            CreateOutcome::Created(fd) => fd,
            CreateOutcome::AlreadyExists => panic!("fresh name reported as existing"),
        };
        drop(CreationGuard::new(&name));
        drop(fd);
        assert!(platform::open_existing(&name).unwrap().is_none());
    }

    #[test]
    fn test_no_pause_after_final_round() {
        let opts = options();
        assert_eq!(opts.max_attempts, 3);
        assert_eq!(retry_pause(1, &opts), Some(opts.retry_backoff()));
        assert_eq!(retry_pause(2, &opts), Some(opts.retry_backoff()));
        assert_eq!(retry_pause(3, &opts), None);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Created.to_string(), "created");
        assert_eq!(Role::Joined.to_string(), "joined");
    }
}
