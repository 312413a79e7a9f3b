//! Typed, bounds-checked view over the slot array of a mapped segment

use crate::cell::{LockOutcome, PaddedCell, ShmSafe, SlotGuard};
use crate::error::{ShmError, ShmResult};
use crate::header::SegmentLayout;

/// Indexed access to the cells that follow a segment header.
///
/// The cell array is located once, at attach time; every access checks the
/// index against the capacity before touching memory. Views are cheap to
/// copy and borrow the mapping they were created from.
pub struct SlotView<'a, T> {
    cells: &'a [PaddedCell<T>],
}

impl<T> Clone for SlotView<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlotView<'_, T> {}

impl<'a, T: ShmSafe> SlotView<'a, T> {
    /// Locate the cell array of a segment mapped at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the start of a mapping, valid for `'a`, that holds a
    /// [`SegmentHeader`](crate::header::SegmentHeader) followed by `capacity`
    /// initialized `PaddedCell<T>` values.
    pub unsafe fn attach(base: *const u8, capacity: usize) -> Self {
        let first = unsafe { base.add(SegmentLayout::HEADER_SIZE) } as *const PaddedCell<T>;
        let cells = unsafe { std::slice::from_raw_parts(first, capacity) };
        Self { cells }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Same as [`capacity`](Self::capacity).
    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Always false for a view obtained from a store.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Raw cell at `index`.
    #[inline]
    pub fn cell(&self, index: usize) -> ShmResult<&'a PaddedCell<T>> {
        self.cells.get(index).ok_or(ShmError::IndexOutOfRange {
            index,
            capacity: self.cells.len(),
        })
    }

    /// Lock slot `index` and return a guard.
    #[inline]
    pub fn lock(&self, index: usize) -> ShmResult<SlotGuard<'a, T>> {
        Ok(self.cell(index)?.lock())
    }

    /// Run `f` on slot `index` under its lock.
    ///
    /// A forced acquisition is not reported to `f`; use
    /// [`access_checked`](Self::access_checked) when it matters.
    pub fn access<R>(&self, index: usize, f: impl FnOnce(&mut T) -> R) -> ShmResult<R> {
        let mut guard = self.lock(index)?;
        Ok(f(&mut *guard))
    }

    /// Run `f` on slot `index` under its lock, telling it how the lock was
    /// obtained.
    pub fn access_checked<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut T, LockOutcome) -> R,
    ) -> ShmResult<R> {
        let mut guard = self.lock(index)?;
        let outcome = guard.outcome();
        Ok(f(&mut *guard, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stand-in for a mapped segment: header bytes then four cells.
    #[repr(C, align(64))]
    struct FakeSegment {
        _header: [u8; SegmentLayout::HEADER_SIZE],
        cells: [PaddedCell<u64>; 4],
    }

    fn fake_segment() -> Box<FakeSegment> {
        Box::new(FakeSegment {
            _header: [0; SegmentLayout::HEADER_SIZE],
            cells: [
                PaddedCell::new(10),
                PaddedCell::new(11),
                PaddedCell::new(12),
                PaddedCell::new(13),
            ],
        })
    }

    #[test]
    fn test_attach_locates_cells() {
        let segment = fake_segment();
        let view: SlotView<'_, u64> =
            unsafe { SlotView::attach(&*segment as *const FakeSegment as *const u8, 4) };

        assert_eq!(view.capacity(), 4);
        assert!(!view.is_empty());
        for i in 0..4 {
            assert_eq!(view.access(i, |v| *v).unwrap(), 10 + i as u64);
            assert!(std::ptr::eq(view.cell(i).unwrap(), &segment.cells[i]));
        }
    }

    #[test]
    fn test_out_of_range_is_reported() {
        let segment = fake_segment();
        let view: SlotView<'_, u64> =
            unsafe { SlotView::attach(&*segment as *const FakeSegment as *const u8, 4) };

        assert!(matches!(
            view.access(4, |v| *v += 1),
            Err(ShmError::IndexOutOfRange {
                index: 4,
                capacity: 4
            })
        ));
        assert!(view.lock(usize::MAX).is_err());
    }

    #[test]
    fn test_access_checked_reports_outcome() {
        let segment = fake_segment();
        let view: SlotView<'_, u64> =
            unsafe { SlotView::attach(&*segment as *const FakeSegment as *const u8, 4) };

        let outcome = view
            .access_checked(1, |v, outcome| {
                *v += 1;
                outcome
            })
            .unwrap();
        assert_eq!(outcome, LockOutcome::Acquired);

        let _held = view.lock(2).unwrap();
        let forced = view.access_checked(2, |_, outcome| outcome).unwrap();
        assert!(forced.is_forced());
        // neighbours are unaffected
        assert_eq!(view.access(1, |v| *v).unwrap(), 12);
        assert!(!segment.cells[3].is_locked());
    }

    #[test]
    fn test_release_after_callback() {
        let segment = fake_segment();
        let view: SlotView<'_, u64> =
            unsafe { SlotView::attach(&*segment as *const FakeSegment as *const u8, 4) };

        view.access(0, |v| *v = 99).unwrap();
        assert!(!segment.cells[0].is_locked());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = view.access(0, |_| panic!("callback failed"));
        }));
        assert!(result.is_err());
        assert!(!segment.cells[0].is_locked());
    }
}
