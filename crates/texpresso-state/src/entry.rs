//! Per-path file entries.

use texpresso_types::{AccessLevel, FsStat, Mark, PicCache};

/// Stable index of a [`FileEntry`] in the filesystem arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct EntryId(u32);

impl EntryId {
    #[inline]
    #[must_use]
    pub(crate) const fn new(index: usize) -> Self {
        Self(index as u32)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Worker-observed state of an entry: the produced output buffer (for
/// writes) or the promoted-read marker, plus the journal stamp that
/// dedups undo records within one generation.
#[derive(Debug, Clone, Default)]
pub struct Saved {
    pub data: Option<Vec<u8>>,
    pub level: AccessLevel,
    pub(crate) stamp: Option<Mark>,
}

/// Everything known about one path.
///
/// Created lazily on first mention, never destroyed. The effective
/// contents a worker sees are given by [`FileEntry::data`].
#[derive(Debug)]
pub struct FileEntry {
    path: String,
    /// Last-known on-disk contents.
    pub fs_data: Option<Vec<u8>>,
    /// Stat fields cached for change detection; cleared when the file
    /// disappears.
    pub fs_stat: FsStat,
    /// Editor-provided overlay, authoritative while present.
    pub edit_data: Option<Vec<u8>>,
    /// Worker-produced contents and access level.
    pub saved: Saved,
    /// Highest byte offset any worker has observed from the effective
    /// data. −1 = never seen, `i32::MAX` = resolved to "not found".
    pub seen: i32,
    /// Graphics bounding-box memo.
    pub pic_cache: Option<PicCache>,
    /// Test hook: reads at or past this offset after a rollback are a
    /// bug. −1 when unset.
    pub debug_rollback_invalidation: i32,
}

impl FileEntry {
    pub(crate) fn new(path: String) -> Self {
        Self {
            path,
            fs_data: None,
            fs_stat: FsStat::default(),
            edit_data: None,
            saved: Saved::default(),
            seen: -1,
            pic_cache: None,
            debug_rollback_invalidation: -1,
        }
    }

    /// Normalized path of this entry.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The effective contents: worker-produced output, else the editor
    /// overlay, else the on-disk cache. This precedence is what workers
    /// observe; nothing may bypass it.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        self.saved
            .data
            .as_deref()
            .or(self.edit_data.as_deref())
            .or(self.fs_data.as_deref())
    }

    /// Worker-produced output bytes only (stdout/log/document mirrors).
    #[must_use]
    pub fn output(&self) -> Option<&[u8]> {
        self.saved.data.as_deref()
    }

    /// Length of the worker-produced output, 0 when there is none.
    #[must_use]
    pub fn output_len(&self) -> usize {
        self.saved.data.as_ref().map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_data_prefers_saved_then_edit_then_fs() {
        let mut e = FileEntry::new("x.tex".to_owned());
        assert_eq!(e.data(), None);
        e.fs_data = Some(b"disk".to_vec());
        assert_eq!(e.data(), Some(&b"disk"[..]));
        e.edit_data = Some(b"edit".to_vec());
        assert_eq!(e.data(), Some(&b"edit"[..]));
        e.saved.data = Some(b"work".to_vec());
        assert_eq!(e.data(), Some(&b"work"[..]));
    }

    #[test]
    fn new_entries_start_unseen() {
        let e = FileEntry::new("y.sty".to_owned());
        assert_eq!(e.seen, -1);
        assert_eq!(e.debug_rollback_invalidation, -1);
        assert_eq!(e.saved.level, texpresso_types::AccessLevel::None);
    }
}
