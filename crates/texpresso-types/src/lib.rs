//! Core value types shared across the texpresso workspace.
//!
//! These are the plain data atoms of the engine: worker-side file ids,
//! access levels, journal marks, graphics memos, and the cached `stat`
//! record used for change detection. Wire-encoding helpers live in
//! [`encoding`], protocol and engine limits in [`limits`].

pub mod encoding;
pub mod limits;

use std::fmt;

/// A worker-side open-file identifier.
///
/// Workers pick the slot; the engine validates it against
/// [`limits::MAX_OPEN_FILES`]. The special value `-1` on a write query
/// redirects to the stdout singleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct FileId(i32);

impl FileId {
    /// Sentinel used by workers to write to stdout without opening it.
    pub const STDOUT_REDIRECT: Self = Self(-1);

    #[inline]
    #[must_use]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Raw wire value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Table index, if this id addresses a regular open-file slot.
    #[inline]
    #[must_use]
    pub fn index(self) -> Option<usize> {
        if self.0 >= 0 && (self.0 as usize) < limits::MAX_OPEN_FILES {
            Some(self.0 as usize)
        } else {
            None
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How far a worker has been granted access to a file entry.
///
/// Ordered: `None < Read < Write`. A `Read` entry has its disk contents
/// cached; a `Write` entry owns a worker-produced output buffer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum AccessLevel {
    #[default]
    None,
    Read,
    Write,
}

/// An opaque position in the undo journal.
///
/// Produced by `Journal::snapshot` and consumed by `Journal::rollback`.
/// Marks are totally ordered; rolling back to a mark undoes every
/// mutation recorded after it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Mark(usize);

impl Mark {
    #[inline]
    #[must_use]
    pub const fn new(pos: usize) -> Self {
        Self(pos)
    }

    #[inline]
    #[must_use]
    pub const fn position(self) -> usize {
        self.0
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Cached bounding box of a graphics inclusion.
///
/// Workers probe the cache with `GPIC` and fill it with `SPIC` so that
/// re-executed workers skip re-measuring unchanged images.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PicCache {
    /// Decoder-specific image kind discriminant.
    pub kind: i32,
    /// Page of a multi-page inclusion.
    pub page: i32,
    /// Bounding box, in the worker's units.
    pub bounds: [f32; 4],
}

/// Seconds/nanoseconds pair from a file timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatTime {
    pub sec: i64,
    pub nsec: i64,
}

/// Snapshot of the `stat(2)` fields used for change detection.
///
/// `ino == 0` means the entry has never been statted (or the file was
/// removed); see [`FsStat::is_set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FsStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub mtime: StatTime,
    pub ctime: StatTime,
}

impl FsStat {
    /// Whether this record holds a real stat result.
    #[inline]
    #[must_use]
    pub const fn is_set(&self) -> bool {
        self.ino != 0
    }

    /// Forget the cached stat, marking the file as never-seen/removed.
    #[inline]
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Field-wise equality used by the edit scanner. A change in any field
    /// triggers a content diff.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        self == other
    }
}
