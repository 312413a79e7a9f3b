//! Cache-line padded slot cell with a bounded-spin lock
//!
//! Each cell pairs one value with a busy flag. Acquisition spins with
//! exponential backoff and, once the backoff reaches [`SPIN_CEILING`], stops
//! waiting and grants access anyway. That forced grant is reported as
//! [`LockOutcome::Forced`] so a lock left behind by a crashed or stalled
//! process never wedges every later accessor.

use shmslot_common::consts::{CACHE_LINE_SIZE, SPIN_CEILING};
use static_assertions::const_assert_eq;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Types that may live inside a shared slot segment.
///
/// # Safety
///
/// Implementers must guarantee that the type:
/// - has a stable layout (`#[repr(C)]` or `#[repr(transparent)]`), since
///   separately compiled processes map the same bytes;
/// - holds no pointers or references (`Box`, `Vec`, `String`, `&T`, ...),
///   which are meaningless in another address space;
/// - stays valid if `Drop` never runs;
/// - tolerates torn writes: a [`LockOutcome::Forced`] access may overlap the
///   genuine holder's writes.
///
/// `Default` supplies the value every slot starts with when a segment is
/// created.
pub unsafe trait ShmSafe: Default + Send + Sync + 'static {}

macro_rules! impl_shm_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl ShmSafe for $t {}
        )*
    };
}

impl_shm_safe!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char,
);

impl_shm_safe!(
    std::sync::atomic::AtomicU8,
    std::sync::atomic::AtomicU16,
    std::sync::atomic::AtomicU32,
    std::sync::atomic::AtomicU64,
    std::sync::atomic::AtomicUsize,
    std::sync::atomic::AtomicI32,
    std::sync::atomic::AtomicI64,
    std::sync::atomic::AtomicBool,
);

unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] where [T; N]: Default {}

/// Result of acquiring a cell lock.
#[must_use = "a forced acquisition is not exclusive and must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The busy flag was taken; access is exclusive.
    Acquired,
    /// The spin budget ran out while another holder kept the flag.
    ///
    /// Access is granted without exclusion. The caller should treat what it
    /// reads as untrusted and avoid acting on it blindly.
    Forced,
}

impl LockOutcome {
    /// Whether exclusion was bypassed.
    #[inline]
    pub fn is_forced(self) -> bool {
        matches!(self, LockOutcome::Forced)
    }
}

/// One slot: busy flag plus value, alone on its cache line(s).
///
/// Only [`ShmSafe`] values can be locked, because a forced guard may alias
/// the holder's access:
///
/// ```compile_fail
/// use shmslot::PaddedCell;
///
/// let cell = PaddedCell::new(vec![0u64; 4]);
/// let _guard = cell.lock();
/// ```
#[repr(C, align(64))]
pub struct PaddedCell<T> {
    busy: AtomicBool,
    value: UnsafeCell<T>,
}

const_assert_eq!(core::mem::align_of::<PaddedCell<u8>>(), CACHE_LINE_SIZE);
const_assert_eq!(core::mem::size_of::<PaddedCell<u64>>(), CACHE_LINE_SIZE);

// SAFETY: access to `value` is mediated by the busy flag. Forced access is
// the documented exception that `ShmSafe` implementers accept.
unsafe impl<T: ShmSafe> Sync for PaddedCell<T> {}

impl<T: ShmSafe> PaddedCell<T> {
    /// New unlocked cell.
    pub const fn new(value: T) -> Self {
        Self {
            busy: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the cell with bounded exponential backoff.
    ///
    /// Polls the flag with relaxed loads, pausing 1, 2, 4, ... times between
    /// polls. When the flag reads clear a compare-and-set (acquire ordering)
    /// is attempted; losing it counts as one more backoff step. Once the
    /// pause count reaches [`SPIN_CEILING`] the wait is abandoned and
    /// [`LockOutcome::Forced`] is returned without touching the flag.
    #[inline]
    pub fn acquire(&self) -> LockOutcome {
        let mut delay: u32 = 1;
        loop {
            while self.busy.load(Ordering::Relaxed) {
                for _ in 0..delay {
                    std::hint::spin_loop();
                }
                if delay >= SPIN_CEILING {
                    return LockOutcome::Forced;
                }
                delay <<= 1;
            }

            if self
                .busy
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return LockOutcome::Acquired;
            }

            if delay >= SPIN_CEILING {
                return LockOutcome::Forced;
            }
            delay <<= 1;
        }
    }

    /// Acquire and wrap the outcome in a guard that releases on drop.
    #[inline]
    pub fn lock(&self) -> SlotGuard<'_, T> {
        let outcome = self.acquire();
        SlotGuard {
            cell: self,
            outcome,
            _marker: PhantomData,
        }
    }
}

impl<T> PaddedCell<T> {
    /// Clear the busy flag with release ordering.
    ///
    /// Unconditional: it also clears a flag this caller never took. Guards
    /// only call it after [`LockOutcome::Acquired`].
    #[inline]
    pub fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Clear a flag believed to belong to a dead holder.
    ///
    /// Operator recovery only. If the holder is in fact alive, its critical
    /// section is opened to the next accessor.
    pub fn force_release(&self) {
        if self.is_locked() {
            tracing::warn!("Force-releasing a held slot lock");
        }
        self.release();
    }

    /// Whether some accessor currently holds the flag.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }
}

impl<T: ShmSafe> Default for PaddedCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Scoped access to one slot.
///
/// Dropping a guard obtained with [`LockOutcome::Acquired`] clears the busy
/// flag, on every exit path including unwinding. A [`LockOutcome::Forced`]
/// guard leaves the flag untouched: it still belongs to the holder that set
/// it, and clearing it here would open that holder's critical section to a
/// third accessor.
pub struct SlotGuard<'a, T> {
    cell: &'a PaddedCell<T>,
    outcome: LockOutcome,
    _marker: PhantomData<&'a mut T>,
}

impl<T: ShmSafe> SlotGuard<'_, T> {
    /// How the lock was obtained.
    #[inline]
    pub fn outcome(&self) -> LockOutcome {
        self.outcome
    }

    /// Shorthand for `outcome().is_forced()`.
    #[inline]
    pub fn was_forced(&self) -> bool {
        self.outcome.is_forced()
    }
}

impl<T: ShmSafe> Deref for SlotGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the flag (or was forced, see ShmSafe).
        unsafe { &*self.cell.value.get() }
    }
}

impl<T: ShmSafe> DerefMut for SlotGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as in `deref`.
        unsafe { &mut *self.cell.value.get() }
    }
}

impl<T> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        if self.outcome == LockOutcome::Acquired {
            self.cell.release();
        }
    }
}
