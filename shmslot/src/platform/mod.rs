//! Platform layer: POSIX shared memory objects and mappings

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::*;
