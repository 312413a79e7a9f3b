//! Shared slot segment constants.
//!
//! Single source of truth for layout sizes, the readiness marker and the
//! compiled-in wait bounds. The `DEFAULT_*` timing values are what
//! [`StoreOptions::default`](crate::config::StoreOptions) hands out.

/// CPU cache line size in bytes.
///
/// Every slot cell and the segment header are aligned to this so that two
/// cells never share a line.
pub const CACHE_LINE_SIZE: usize = 64;

/// Huge page size (2 MiB). Segment sizes are always rounded up to this,
/// whether or not a huge-page mapping is actually obtained.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// log2 of [`HUGE_PAGE_SIZE`], as expected by `MAP_HUGETLB` size encodings.
pub const HUGE_PAGE_SHIFT: u8 = 21;

/// Readiness marker published by the creator once the header is complete.
pub const SEGMENT_READY_MAGIC: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Pause-count ceiling of the per-cell backoff (1, 2, 4, ... 128).
///
/// Reaching it means the lock is forcibly broken.
pub const SPIN_CEILING: u32 = 128;

/// Default upper bound on waiting for a segment's readiness marker.
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 2_000;

/// Default interval between readiness polls.
pub const DEFAULT_READY_POLL_MS: u64 = 1;

/// Default number of join/create rounds before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default sleep after losing an exclusive-creation race.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 10;

/// Directory where Linux exposes POSIX shared memory objects.
pub const SHM_ROOT: &str = "/dev/shm";

/// Longest accepted object name (without the leading slash).
pub const SHM_NAME_MAX: usize = 255;

/// Round `size` up to the next multiple of [`HUGE_PAGE_SIZE`].
///
/// Returns `None` on overflow.
#[inline]
pub const fn align_to_huge_page(size: usize) -> Option<usize> {
    match size.checked_add(HUGE_PAGE_SIZE - 1) {
        Some(padded) => Some(padded & !(HUGE_PAGE_SIZE - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_line_size() {
        assert_eq!(CACHE_LINE_SIZE, 64);
        assert!(CACHE_LINE_SIZE.is_power_of_two());
    }

    #[test]
    fn test_huge_page_shift_matches_size() {
        assert_eq!(1usize << HUGE_PAGE_SHIFT, HUGE_PAGE_SIZE);
    }

    #[test]
    fn test_spin_ceiling_is_power_of_two() {
        assert!(SPIN_CEILING.is_power_of_two());
    }

    #[test]
    fn test_align_to_huge_page() {
        assert_eq!(align_to_huge_page(0), Some(0));
        assert_eq!(align_to_huge_page(1), Some(HUGE_PAGE_SIZE));
        assert_eq!(align_to_huge_page(HUGE_PAGE_SIZE), Some(HUGE_PAGE_SIZE));
        assert_eq!(align_to_huge_page(HUGE_PAGE_SIZE + 1), Some(2 * HUGE_PAGE_SIZE));
        assert_eq!(align_to_huge_page(usize::MAX), None);
    }

    #[test]
    fn test_default_bounds_are_nonzero() {
        assert!(DEFAULT_READY_TIMEOUT_MS > 0);
        assert!(DEFAULT_READY_POLL_MS > 0);
        assert!(DEFAULT_MAX_ATTEMPTS > 0);
        assert!(DEFAULT_READY_POLL_MS < DEFAULT_READY_TIMEOUT_MS);
    }
}
