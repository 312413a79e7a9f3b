//! shmslot Common Library
//!
//! This crate provides shared constants and configuration loading utilities
//! for all shmslot workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Layout and timing constants for shared slot segments
//! - [`config`] - Configuration loading traits and types
//!
//! # Usage
//!
//! ```rust
//! use shmslot_common::consts::*;
//! use shmslot_common::config::{ConfigLoader, StoreOptions};
//! ```

pub mod config;
pub mod consts;
