//! Append-only undo journal over entries and state cells.
//!
//! Each op records the minimum inverse of one mutation: the previous
//! `saved` triple of an entry, or the previous contents of a cell.
//! Rollback pops ops in LIFO order until the tail equals the requested
//! mark. Generation stamps (stored inside the snapshotted values, so they
//! round-trip through undo) ensure each entry/cell is recorded at most
//! once between consecutive snapshots, which bounds journal growth even
//! under write-heavy workers.

use texpresso_types::Mark;
use tracing::trace;

use crate::entry::EntryId;
use crate::filesystem::Filesystem;
use crate::state::{SlotRef, StateTables};

enum UndoOp {
    Entry {
        id: EntryId,
        saved: crate::entry::Saved,
    },
    Cell {
        slot: SlotRef,
        cell: crate::state::FileCell,
    },
}

/// The undo journal. See the module docs.
#[derive(Default)]
pub struct Journal {
    ops: Vec<UndoOp>,
    generation: Mark,
}

impl Journal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            generation: Mark::new(0),
        }
    }

    /// Current tail position, without opening a new generation.
    #[must_use]
    pub fn mark(&self) -> Mark {
        Mark::new(self.ops.len())
    }

    /// Take a snapshot: returns the current tail and opens a new
    /// generation, so subsequent mutations are recorded again.
    pub fn snapshot(&mut self) -> Mark {
        self.generation = Mark::new(self.ops.len());
        self.generation
    }

    /// Record an entry's `saved` state before the caller mutates it.
    /// Deduplicated per generation.
    pub fn record_entry(&mut self, fs: &mut Filesystem, id: EntryId) {
        let generation = self.generation;
        let entry = fs.entry_mut(id);
        if entry.saved.stamp == Some(generation) {
            return;
        }
        trace!(entry = %id, path = entry.path(), "journal entry");
        let saved = entry.saved.clone();
        entry.saved.stamp = Some(generation);
        self.ops.push(UndoOp::Entry { id, saved });
    }

    /// Record a cell's contents before the caller reassigns it.
    /// Deduplicated per generation.
    pub fn record_cell(&mut self, state: &mut StateTables, slot: SlotRef) {
        let generation = self.generation;
        let cell = state.cell_mut(slot);
        if cell.stamp == Some(generation) {
            return;
        }
        trace!(%slot, "journal cell");
        let old = *cell;
        cell.stamp = Some(generation);
        self.ops.push(UndoOp::Cell { slot, cell: old });
    }

    /// Undo every op recorded after `mark`, restoring entries and cells
    /// in LIFO order.
    ///
    /// Rolling back past the current generation is an engine bug: marks
    /// only come from the process ladder, whose snapshots are always at
    /// or before the live generation.
    pub fn rollback(&mut self, mark: Mark, fs: &mut Filesystem, state: &mut StateTables) {
        assert!(
            mark <= self.generation,
            "journal rollback to {mark} past the current generation {}",
            self.generation
        );
        while self.ops.len() > mark.position() {
            match self.ops.pop().expect("journal op") {
                UndoOp::Entry { id, saved } => fs.entry_mut(id).saved = saved,
                UndoOp::Cell { slot, cell } => *state.cell_mut(slot) = cell,
            }
        }
        self.generation = mark;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use texpresso_types::AccessLevel;

    fn fixture() -> (Journal, Filesystem, StateTables) {
        (Journal::new(), Filesystem::new(), StateTables::new())
    }

    #[test]
    fn rollback_restores_entry_saved_state() {
        let (mut journal, mut fs, mut state) = fixture();
        let id = fs.lookup_or_create("out.log");

        let mark = journal.snapshot();
        journal.record_entry(&mut fs, id);
        let e = fs.entry_mut(id);
        e.saved.data = Some(b"partial output".to_vec());
        e.saved.level = AccessLevel::Write;

        journal.rollback(mark, &mut fs, &mut state);
        let e = fs.entry(id);
        assert_eq!(e.saved.data, None);
        assert_eq!(e.saved.level, AccessLevel::None);
    }

    #[test]
    fn rollback_restores_cells_in_lifo_order() {
        let (mut journal, mut fs, mut state) = fixture();
        let a = fs.lookup_or_create("a");
        let b = fs.lookup_or_create("b");

        let mark = journal.snapshot();
        journal.record_cell(&mut state, SlotRef::Table(0));
        state.cell_mut(SlotRef::Table(0)).entry = Some(a);
        journal.record_cell(&mut state, SlotRef::Document);
        state.cell_mut(SlotRef::Document).entry = Some(b);

        journal.rollback(mark, &mut fs, &mut state);
        assert!(state.entry_at(SlotRef::Table(0)).is_none());
        assert!(state.entry_at(SlotRef::Document).is_none());
    }

    #[test]
    fn mutations_within_a_generation_are_recorded_once() {
        let (mut journal, mut fs, _state) = fixture();
        let id = fs.lookup_or_create("x");

        journal.snapshot();
        journal.record_entry(&mut fs, id);
        fs.entry_mut(id).saved.data = Some(b"1".to_vec());
        journal.record_entry(&mut fs, id);
        fs.entry_mut(id).saved.data = Some(b"2".to_vec());
        assert_eq!(journal.mark().position(), 1);
    }

    #[test]
    fn nested_snapshots_roll_back_incrementally() {
        let (mut journal, mut fs, mut state) = fixture();
        let id = fs.lookup_or_create("doc.xdv");

        let m1 = journal.snapshot();
        journal.record_entry(&mut fs, id);
        fs.entry_mut(id).saved.data = Some(b"one".to_vec());

        let m2 = journal.snapshot();
        journal.record_entry(&mut fs, id);
        fs.entry_mut(id).saved.data = Some(b"one two".to_vec());

        journal.rollback(m2, &mut fs, &mut state);
        assert_eq!(fs.entry(id).saved.data.as_deref(), Some(&b"one"[..]));

        journal.rollback(m1, &mut fs, &mut state);
        assert_eq!(fs.entry(id).saved.data, None);

        // P6: the tail now equals the mark and later snapshots are >= it.
        assert_eq!(journal.mark(), m1);
        assert!(journal.snapshot() >= m1);
    }

    #[test]
    fn stamps_round_trip_through_rollback() {
        let (mut journal, mut fs, mut state) = fixture();
        let id = fs.lookup_or_create("x");

        let m1 = journal.snapshot();
        journal.record_entry(&mut fs, id);
        fs.entry_mut(id).saved.data = Some(b"gen1".to_vec());

        journal.snapshot();
        journal.record_entry(&mut fs, id);
        fs.entry_mut(id).saved.data = Some(b"gen2".to_vec());

        journal.rollback(m1, &mut fs, &mut state);
        // After rolling back both generations, the entry must be
        // journalable again in a fresh generation.
        journal.snapshot();
        journal.record_entry(&mut fs, id);
        fs.entry_mut(id).saved.data = Some(b"gen3".to_vec());
        assert_eq!(fs.entry(id).saved.data.as_deref(), Some(&b"gen3"[..]));
    }

    #[test]
    #[should_panic(expected = "past the current generation")]
    fn rollback_past_generation_is_a_bug() {
        let (mut journal, mut fs, mut state) = fixture();
        let id = fs.lookup_or_create("x");
        journal.snapshot();
        journal.record_entry(&mut fs, id);
        let late = journal.mark();
        journal.rollback(late, &mut fs, &mut state);
    }
}
