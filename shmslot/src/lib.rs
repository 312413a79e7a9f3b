//! # Shared Slot Store
//!
//! Named, fixed-capacity arrays of plain-data records placed in POSIX shared
//! memory, which several unrelated processes open by name and access
//! concurrently. Every slot carries its own cache-line padded busy flag.
//!
//! ## Features
//!
//! - **Attach-or-create**: the first opener creates and initializes the
//!   segment, every later or concurrent opener joins it. No coordinator.
//! - **Per-slot locking**: bounded spin with exponential backoff; a lock held
//!   past the spin budget is bypassed and the access reported as forced.
//! - **Huge pages**: segments are sized in 2 MiB units and mapped with
//!   `MAP_HUGETLB` when the kernel allows it, ordinary pages otherwise.
//! - **Crash recovery**: a segment whose creator died before publishing is
//!   detected after a bounded wait, removed, and recreated.
//!
//! ## Segment layout
//!
//! ```text
//! offset 0          64                64 + S          64 + N*S
//! ┌─────────────────┬─────────────────┬─────┬─────────────────┬──────────┐
//! │ Header          │ PaddedCell<T>   │ ... │ PaddedCell<T>   │ padding  │
//! │ magic, N, size  │ busy | value    │     │ busy | value    │ to 2 MiB │
//! └─────────────────┴─────────────────┴─────┴─────────────────┴──────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shmslot::{Role, SharedStore, ShmResult};
//!
//! # fn main() -> ShmResult<()> {
//! let (store, role) = SharedStore::<u64>::open("counters", 1024)?;
//! if role == Role::Created {
//!     println!("initialized {} slots", store.capacity());
//! }
//!
//! let view = store.view();
//! view.access_checked(7, |count, outcome| {
//!     if outcome.is_forced() {
//!         eprintln!("slot 7 lock was stale, value may be torn");
//!     }
//!     *count += 1;
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! Records must implement [`ShmSafe`]; see its safety contract.
//!
//! ## Lifetime
//!
//! Segments persist after every process detaches. Dropping a
//! [`SharedStore`] only unmaps; removal is explicit through
//! [`SharedStore::unlink`].

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod cell;
pub mod discovery;
pub mod error;
pub mod header;
pub mod manager;
pub mod platform;
pub mod view;

pub use cell::{LockOutcome, PaddedCell, ShmSafe, SlotGuard};
pub use discovery::{SegmentDiscovery, SegmentInfo, SegmentState, inspect};
pub use error::{ShmError, ShmResult};
pub use header::{HeaderSnapshot, SegmentHeader, SegmentLayout};
pub use manager::{Role, SharedStore};
pub use shmslot_common::config::StoreOptions;
pub use view::SlotView;
