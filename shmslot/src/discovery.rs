//! Segment discovery and header inspection
//!
//! Reads segment headers without knowing the element type, for operators
//! and tooling. Nothing here takes a cell lock or modifies a segment.

use crate::error::{ShmError, ShmResult};
use crate::header::{HeaderSnapshot, SegmentHeader, SegmentLayout};
use crate::platform;
use serde::Serialize;
use shmslot_common::consts::SHM_ROOT;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Initialization state of a shared memory object.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SegmentState {
    /// Readiness marker published, header fields valid
    Ready,
    /// Large enough for a header, marker not set (initializing or abandoned)
    Pending,
    /// Smaller than a header (never sized, or not a slot segment)
    Undersized,
}

/// Segment metadata information
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Segment name, with its leading slash
    pub name: String,
    /// Initialization state
    pub state: SegmentState,
    /// Object size in bytes
    pub file_size: u64,
    /// Number of slots (0 unless ready)
    pub element_count: u64,
    /// Element size in bytes (0 unless ready)
    pub element_size: u64,
    /// Object size claimed by the header (0 unless ready)
    pub aligned_total_size: u64,
}

impl SegmentInfo {
    fn from_header(name: String, file_size: u64, header: Option<HeaderSnapshot>) -> Self {
        let (state, header) = match header {
            None => (SegmentState::Undersized, None),
            Some(h) if h.is_ready() => (SegmentState::Ready, Some(h)),
            Some(_) => (SegmentState::Pending, None),
        };
        Self {
            name,
            state,
            file_size,
            element_count: header.map_or(0, |h| h.element_count),
            element_size: header.map_or(0, |h| h.element_size),
            aligned_total_size: header.map_or(0, |h| h.aligned_total_size),
        }
    }

    /// Whether the readiness marker is published.
    pub fn is_ready(&self) -> bool {
        self.state == SegmentState::Ready
    }
}

/// Inspect one named object through the shared memory API.
///
/// Returns `Ok(None)` if the object does not exist.
pub fn inspect(name: &str) -> ShmResult<Option<SegmentInfo>> {
    let name = platform::shm_name(name)?;
    let Some(fd) = platform::open_read_only(&name)? else {
        return Ok(None);
    };

    let file_size = platform::object_len(&fd, &name)?;
    if file_size < SegmentLayout::HEADER_SIZE as u64 {
        return Ok(Some(SegmentInfo::from_header(name, file_size, None)));
    }

    let header_map = platform::map_header(&fd, &name)?;
    // SAFETY: the mapping is one header long, page aligned, and the object
    // is at least that large.
    let snapshot = unsafe { &*(header_map.as_ptr() as *const SegmentHeader) }.snapshot();
    Ok(Some(SegmentInfo::from_header(name, file_size, Some(snapshot))))
}

/// Enumerates objects under a shared memory filesystem mount.
pub struct SegmentDiscovery {
    root: PathBuf,
}

impl Default for SegmentDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentDiscovery {
    /// Discovery over `/dev/shm`.
    pub fn new() -> Self {
        Self::with_root(SHM_ROOT)
    }

    /// Discovery over another directory (a different tmpfs mount, or tests).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory being scanned.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Inspect every regular file under the root, sorted by name.
    ///
    /// Objects that vanish or cannot be read mid-scan are skipped.
    pub fn list_segments(&self) -> ShmResult<Vec<SegmentInfo>> {
        let mut segments = Vec::new();

        if !self.root.exists() {
            return Ok(segments);
        }

        for entry in std::fs::read_dir(&self.root)?.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            match self.inspect_file(&entry.path(), &file_name) {
                Ok(info) => segments.push(info),
                Err(e) => tracing::debug!("Skipping {}: {}", file_name, e),
            }
        }

        segments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(segments)
    }

    /// Only segments whose readiness marker is published.
    pub fn list_ready(&self) -> ShmResult<Vec<SegmentInfo>> {
        Ok(self
            .list_segments()?
            .into_iter()
            .filter(SegmentInfo::is_ready)
            .collect())
    }

    /// Inspect one object under the root. `Ok(None)` if it does not exist.
    pub fn find_segment(&self, name: &str) -> ShmResult<Option<SegmentInfo>> {
        let name = platform::shm_name(name)?;
        let path = self.root.join(&name[1..]);
        match self.inspect_file(&path, &name[1..]) {
            Ok(info) => Ok(Some(info)),
            Err(ShmError::Io { source }) if source.kind() == std::io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn inspect_file(&self, path: &Path, file_name: &str) -> ShmResult<SegmentInfo> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let name = format!("/{file_name}");

        if file_size < SegmentLayout::HEADER_SIZE as u64 {
            return Ok(SegmentInfo::from_header(name, file_size, None));
        }

        let mut raw = [0u8; SegmentLayout::HEADER_SIZE];
        file.read_exact(&mut raw)?;
        Ok(SegmentInfo::from_header(name, file_size, Some(parse_header(&raw))))
    }
}

/// Decode the header fields in native byte order.
fn parse_header(raw: &[u8; SegmentLayout::HEADER_SIZE]) -> HeaderSnapshot {
    let field = |offset: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw[offset..offset + 8]);
        u64::from_ne_bytes(bytes)
    };
    HeaderSnapshot {
        magic: field(0),
        element_count: field(8),
        element_size: field(16),
        aligned_total_size: field(24),
    }
}
