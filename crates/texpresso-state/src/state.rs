//! Open-file tables and the well-known singleton slots.

use std::fmt;

use texpresso_types::limits::MAX_OPEN_FILES;
use texpresso_types::Mark;

use crate::entry::EntryId;

/// Address of a state cell: a numbered open-file slot or one of the
/// singletons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRef {
    Table(usize),
    Stdout,
    Document,
    Synctex,
    Log,
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table(i) => write!(f, "slot {i}"),
            Self::Stdout => f.write_str("stdout"),
            Self::Document => f.write_str("document"),
            Self::Synctex => f.write_str("synctex"),
            Self::Log => f.write_str("log"),
        }
    }
}

/// One state cell: which entry currently fills the slot, plus the
/// journal stamp that dedups undo records within a generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCell {
    pub entry: Option<EntryId>,
    pub(crate) stamp: Option<Mark>,
}

/// The per-worker open-file table and the four singletons.
///
/// Only one entry may occupy each singleton at a time; claiming an
/// occupied singleton is a protocol violation handled by the engine.
pub struct StateTables {
    table: Vec<FileCell>,
    stdout: FileCell,
    document: FileCell,
    synctex: FileCell,
    log: FileCell,
}

impl Default for StateTables {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTables {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: vec![FileCell::default(); MAX_OPEN_FILES],
            stdout: FileCell::default(),
            document: FileCell::default(),
            synctex: FileCell::default(),
            log: FileCell::default(),
        }
    }

    /// Borrow a cell. Panics on an out-of-range table index; the engine
    /// validates worker-supplied ids before constructing a [`SlotRef`].
    #[must_use]
    pub fn cell(&self, slot: SlotRef) -> &FileCell {
        match slot {
            SlotRef::Table(i) => &self.table[i],
            SlotRef::Stdout => &self.stdout,
            SlotRef::Document => &self.document,
            SlotRef::Synctex => &self.synctex,
            SlotRef::Log => &self.log,
        }
    }

    pub fn cell_mut(&mut self, slot: SlotRef) -> &mut FileCell {
        match slot {
            SlotRef::Table(i) => &mut self.table[i],
            SlotRef::Stdout => &mut self.stdout,
            SlotRef::Document => &mut self.document,
            SlotRef::Synctex => &mut self.synctex,
            SlotRef::Log => &mut self.log,
        }
    }

    /// Entry currently occupying a slot, if any.
    #[must_use]
    pub fn entry_at(&self, slot: SlotRef) -> Option<EntryId> {
        self.cell(slot).entry
    }

    /// The singleton slots, for invariant checks.
    #[must_use]
    pub fn singletons(&self) -> [(SlotRef, Option<EntryId>); 4] {
        [
            (SlotRef::Stdout, self.stdout.entry),
            (SlotRef::Document, self.document.entry),
            (SlotRef::Synctex, self.synctex.entry),
            (SlotRef::Log, self.log.entry),
        ]
    }
}
