//! Segment header and layout arithmetic

use crate::cell::PaddedCell;
use crate::error::{ShmError, ShmResult};
use shmslot_common::consts::{CACHE_LINE_SIZE, SEGMENT_READY_MAGIC, align_to_huge_page};
use static_assertions::const_assert_eq;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicU64, Ordering, fence};

/// Metadata block at offset 0 of every segment.
///
/// Written once by the creator. Joiners must not trust any field until
/// [`is_ready`](Self::is_ready) returns true.
#[repr(C, align(64))]
pub struct SegmentHeader {
    magic: AtomicU64,
    /// Number of slots
    pub element_count: u64,
    /// `size_of::<T>()` as compiled by the creator
    pub element_size: u64,
    /// Object size, header plus cells rounded up to the huge page size
    pub aligned_total_size: u64,
}

const_assert_eq!(size_of::<SegmentHeader>(), CACHE_LINE_SIZE);
const_assert_eq!(align_of::<SegmentHeader>(), CACHE_LINE_SIZE);

/// Plain copy of a header, readable without knowing the element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSnapshot {
    /// Raw readiness marker
    pub magic: u64,
    /// Number of slots
    pub element_count: u64,
    /// Element size in bytes
    pub element_size: u64,
    /// Object size claimed by the header
    pub aligned_total_size: u64,
}

impl HeaderSnapshot {
    /// Whether the readiness marker is set.
    pub fn is_ready(&self) -> bool {
        self.magic == SEGMENT_READY_MAGIC
    }
}

impl SegmentHeader {
    /// Whether the creator has published the header (acquire load).
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.magic.load(Ordering::Acquire) == SEGMENT_READY_MAGIC
    }

    /// Copy the fields out. Only meaningful after [`is_ready`](Self::is_ready).
    pub fn snapshot(&self) -> HeaderSnapshot {
        HeaderSnapshot {
            magic: self.magic.load(Ordering::Acquire),
            element_count: self.element_count,
            element_size: self.element_size,
            aligned_total_size: self.aligned_total_size,
        }
    }

    /// Write the metadata fields, fence, then publish the readiness marker.
    ///
    /// # Safety
    ///
    /// `header` must point into a writable mapping at least one header long,
    /// and the caller must be the only process initializing it (the winner of
    /// the exclusive create). Everything else the creator wants joiners to see
    /// must be written before this call.
    pub(crate) unsafe fn publish(header: *mut SegmentHeader, layout: &SegmentLayout) {
        unsafe {
            std::ptr::addr_of_mut!((*header).element_count).write(layout.element_count as u64);
            std::ptr::addr_of_mut!((*header).element_size).write(layout.element_size as u64);
            std::ptr::addr_of_mut!((*header).aligned_total_size)
                .write(layout.aligned_total_size as u64);

            // no joiner may see the marker before the fields above
            fence(Ordering::Release);
            (*header).magic.store(SEGMENT_READY_MAGIC, Ordering::Release);
        }
    }

    /// Check a published header against the local element type and the
    /// actual object size.
    ///
    /// An element size disagreement is a [`ShmError::TypeMismatch`]; any other
    /// inconsistency is [`ShmError::CorruptSegment`].
    pub fn validate_for<T>(&self, name: &str, object_len: u64) -> ShmResult<SegmentLayout> {
        let expected = size_of::<T>() as u64;
        if self.element_size != expected {
            return Err(ShmError::TypeMismatch {
                name: name.to_string(),
                expected,
                found: self.element_size,
            });
        }

        let corrupt = |reason: String| ShmError::CorruptSegment {
            name: name.to_string(),
            reason,
        };

        let count = usize::try_from(self.element_count)
            .map_err(|_| corrupt(format!("element count {} overflows", self.element_count)))?;
        let layout = SegmentLayout::for_type::<T>(count).map_err(|e| corrupt(e.to_string()))?;

        if layout.aligned_total_size as u64 != self.aligned_total_size {
            return Err(corrupt(format!(
                "header claims {} bytes, layout of {} slots needs {}",
                self.aligned_total_size, count, layout.aligned_total_size
            )));
        }
        if object_len < self.aligned_total_size {
            return Err(corrupt(format!(
                "object is {} bytes, header claims {}",
                object_len, self.aligned_total_size
            )));
        }

        Ok(layout)
    }
}

/// Byte layout of a segment holding `element_count` values of one type.
///
/// `Header ++ [PaddedCell<T>; element_count]`, total rounded up to 2 MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    /// Number of slots
    pub element_count: usize,
    /// `size_of::<T>()`
    pub element_size: usize,
    /// `size_of::<PaddedCell<T>>()`
    pub cell_size: usize,
    /// Header plus cells, rounded up to the huge page size
    pub aligned_total_size: usize,
}

impl SegmentLayout {
    /// Size of the header, which is also the offset of cell 0.
    pub const HEADER_SIZE: usize = size_of::<SegmentHeader>();

    /// Layout for `element_count` values of `T`.
    ///
    /// Rejects a zero count, sizes that overflow, and element types whose
    /// alignment would put cell 0 off its boundary.
    pub fn for_type<T>(element_count: usize) -> ShmResult<Self> {
        let cell_size = size_of::<PaddedCell<T>>();
        let cell_align = align_of::<PaddedCell<T>>();
        if Self::HEADER_SIZE % cell_align != 0 {
            return Err(ShmError::UnsupportedAlignment { align: cell_align });
        }

        let invalid = || ShmError::InvalidCapacity {
            capacity: element_count,
            cell_size,
        };
        if element_count == 0 {
            return Err(invalid());
        }

        let aligned_total_size = element_count
            .checked_mul(cell_size)
            .and_then(|cells| cells.checked_add(Self::HEADER_SIZE))
            .and_then(align_to_huge_page)
            .ok_or_else(invalid)?;

        Ok(Self {
            element_count,
            element_size: size_of::<T>(),
            cell_size,
            aligned_total_size,
        })
    }

    /// Header plus cells before rounding.
    pub fn raw_size(&self) -> usize {
        Self::HEADER_SIZE + self.element_count * self.cell_size
    }
}
