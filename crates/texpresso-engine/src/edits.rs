//! Edit transaction: change detection, trace rewind, fences, rollback.
//!
//! The UI drives edits through a three-phase protocol:
//! `begin_changes` opens the transaction, `detect_changes` (or direct
//! `notify_file_change` calls from the editor) walks the trace back past
//! every invalidated observation, and `end_changes` places fences, pops
//! invalidated snapshots, and resynchronizes the decoder, synctex, and
//! editor mirrors.

use texpresso_error::Result;
use texpresso_protocol::{Ask, QueryTag};
use texpresso_state::{EntryId, SlotRef};
use texpresso_types::limits::{
    FENCE_BLOCK, FENCE_INITIAL_GAP_MS, FENCE_TIME_SLACK_MS, MAX_FENCES, WORKER_POLL_MS,
};
use texpresso_types::AccessLevel;
use tracing::{debug, info, warn};

use crate::engine::{EditTransaction, Engine};
use crate::fence::Fence;
use crate::hooks::EditorChannel;
use crate::trace::TraceRecord;

impl Engine {
    /// Open an edit transaction. Reentry is a caller bug.
    pub fn begin_changes(&mut self) {
        assert!(self.txn.is_none(), "nested edit transaction");
        self.txn = Some(EditTransaction {
            trace_len: self.ladder.top().trace_len,
            offset: -1,
            flush: false,
        });
    }

    /// Scan the VFS for on-disk changes and fold each one into the open
    /// transaction.
    pub fn detect_changes(&mut self) -> Result<()> {
        let ids: Vec<EntryId> = self.fs.ids().collect();
        for id in ids {
            if let Some(changed) = self.scan_entry(id) {
                self.notify_file_change(id, changed)?;
            }
        }
        Ok(())
    }

    /// Record that `entry`'s contents diverge from what workers saw at
    /// byte `changed`, rewinding the trace past every observation of the
    /// divergent suffix.
    pub fn notify_file_change(&mut self, id: EntryId, changed: i32) -> Result<()> {
        assert!(
            self.txn.is_some(),
            "file change notified outside an edit transaction"
        );
        let current = self.ladder.top().trace_len;
        let txn_trace_len = self.txn.as_ref().expect("transaction").trace_len;

        if self.fs.entry(id).seen < changed && txn_trace_len == current {
            // The worker may not have observed the divergent byte yet,
            // but its SEEN notifications could still be in flight.
            if self.process_pending_messages()? {
                return Ok(());
            }
            let current = self.ladder.top().trace_len;
            self.txn.as_mut().expect("transaction").trace_len = current;
            if self.fs.entry(id).seen < changed {
                return Ok(());
            }
        }

        let mut t = self.txn.as_ref().expect("transaction").trace_len;
        while self.fs.entry(id).seen >= changed {
            assert!(t > 0, "rollback walked off the start of the trace");
            t -= 1;
            let record = self.trace.get(t);
            self.revert_record(record);
        }

        let record = self.trace.get(t);
        assert!(
            record.entry == id,
            "rollback inconsistency: trace record {t} names {}, expected '{}'",
            record.entry,
            self.fs.entry(id).path()
        );

        let txn = self.txn.as_mut().expect("transaction");
        txn.trace_len = t;
        txn.offset = changed;
        Ok(())
    }

    /// Close the transaction. Returns whether a rollback took place.
    pub fn end_changes(&mut self) -> Result<bool> {
        let txn = self
            .txn
            .take()
            .expect("end_changes outside an edit transaction");
        let mut trace_len = txn.trace_len;
        let mut offset = txn.offset;

        let current = self.ladder.top().trace_len;
        if trace_len == current {
            if !txn.flush {
                return Ok(false);
            }
            if self.ladder.top().raw_fd().is_some() {
                // The drain consumed nothing: ask the worker to flush its
                // buffered SEEN notifications and try again later.
                self.channel.set_fd(self.ladder.top().raw_fd());
                self.channel.write_ask(Ask::Flush)?;
                self.channel.flush()?;
                return Ok(false);
            }
            // The worker died during the drain; resume one observation
            // earlier since its final view is unknown.
            if trace_len > 0 {
                trace_len -= 1;
                let record = self.trace.get(trace_len);
                self.revert_record(record);
                if trace_len > 0 {
                    offset = self.trace.get(trace_len).seen;
                }
            }
        }

        info!(from = current, to = trace_len, "rewound trace");

        let resume = self.compute_fences(trace_len, offset);
        self.rollback_processes(trace_len, resume);
        Ok(true)
    }

    // -- change detection ---------------------------------------------------

    /// Compare an entry against the disk. Returns the first divergent
    /// offset when the content changed.
    fn scan_entry(&mut self, id: EntryId) -> Option<i32> {
        {
            let e = self.fs.entry(id);
            if e.saved.level < AccessLevel::Read || !e.fs_stat.is_set() || e.edit_data.is_some() {
                return None;
            }
        }
        let path = self.fs.entry(id).path().to_owned();
        debug!(path = %path, "scanning");

        let Some((fs_path, st)) = self.config.inclusion_path.resolve(&path) else {
            debug!(path = %path, "file removed");
            self.fs.entry_mut(id).fs_stat.clear();
            return None;
        };
        if st.same(&self.fs.entry(id).fs_stat) {
            return None;
        }
        self.fs.entry_mut(id).fs_stat = st;
        info!(path = %path, "file changed on disk");

        let Ok(new_data) = std::fs::read(&fs_path) else {
            // Unreadable right now; keep the stale cache until a later
            // successful read reinstates it.
            return None;
        };

        self.fs.entry_mut(id).pic_cache = None;

        let (first_diff, identical) = {
            let old = self.fs.entry(id).fs_data.as_deref().unwrap_or(&[]);
            let shared = old.len().min(new_data.len());
            let mut i = 0;
            while i < shared && old[i] == new_data[i] {
                i += 1;
            }
            (i, i == shared && old.len() == new_data.len())
        };
        if identical {
            debug!(path = %path, "stat changed but content identical");
            return None;
        }
        debug!(path = %path, first_diff, new_len = new_data.len(), "content diff");
        self.fs.entry_mut(id).fs_data = Some(new_data);
        Some(first_diff as i32)
    }

    /// Drain pending `SEEN` queries so the engine's view of the worker
    /// is current before deciding that no rollback is needed.
    ///
    /// Returns true when nothing relevant was drained (the caller may
    /// trust `seen`); kills the worker if it does not respond within the
    /// poll window.
    fn process_pending_messages(&mut self) -> Result<bool> {
        if self.txn.as_ref().expect("transaction").flush {
            return Ok(true);
        }
        let Some(fd) = self.ladder.top().raw_fd() else {
            return Ok(true);
        };
        self.channel.set_fd(Some(fd));

        let mut nothing_seen = true;
        let mut first_poll = true;
        loop {
            if !self.channel.has_pending_query(WORKER_POLL_MS)? {
                if first_poll {
                    // Not a single message within the window: the worker
                    // may be stuck in a long computation or a loop. Kill
                    // it and resume from the previous snapshot instead
                    // of waiting.
                    warn!("worker unresponsive during edit drain, killing it");
                    self.ladder.top_mut().close();
                }
                break;
            }
            first_poll = false;
            match self.channel.peek_query() {
                Ok(QueryTag::Seen) => match self.read_current_query()? {
                    Some(query) => {
                        self.answer_query(query)?;
                        nothing_seen = false;
                    }
                    None => break,
                },
                Ok(_) => break,
                Err(_) => {
                    self.ladder.top_mut().close();
                    break;
                }
            }
        }

        self.txn.as_mut().expect("transaction").flush = true;
        Ok(nothing_seen)
    }

    // -- fences -------------------------------------------------------------

    /// Place up to [`MAX_FENCES`] fences descending from the rollback
    /// point and return the trace index to resume from.
    pub(crate) fn compute_fences(&mut self, trace_point: usize, offset: i32) -> usize {
        self.fences.clear();
        if trace_point == 0 {
            return 0;
        }
        assert!(
            self.ladder.top().trace_len > trace_point,
            "fence point {trace_point} is not inside the live trace"
        );

        let record = self.trace.get(trace_point);
        let mut position = (offset - FENCE_BLOCK) & !(FENCE_BLOCK - 1);
        if position < record.seen {
            position = record.seen;
        }
        if position == -1 {
            position = 0;
        }
        self.fences.place(Fence {
            entry: record.entry,
            position,
        });
        info!(
            trace = trace_point,
            path = self.fs.entry(record.entry).path(),
            position,
            "placed fence 0"
        );

        // Never fence inside an older snapshot's territory: those
        // observations are already paid for.
        let boundary = (0..self.ladder.len())
            .rev()
            .map(|i| self.ladder.get(i).trace_len)
            .find(|&len| len <= trace_point)
            .expect("no snapshot below the fence point");

        let mut gap = FENCE_INITIAL_GAP_MS;
        let mut horizon = record.time - FENCE_TIME_SLACK_MS;
        let mut t = trace_point;
        while t > boundary && self.fences.len() < MAX_FENCES {
            let r = self.trace.get(t);
            if r.time <= horizon && self.possible_fence(r) {
                let position = r.seen.max(0);
                self.fences.place(Fence {
                    entry: r.entry,
                    position,
                });
                info!(
                    trace = t,
                    path = self.fs.entry(r.entry).path(),
                    position,
                    count = self.fences.len(),
                    "placed fence"
                );
                horizon -= gap;
                gap *= 2;
            }
            t -= 1;
        }
        t
    }

    fn possible_fence(&self, record: TraceRecord) -> bool {
        record.seen != i32::MAX
            && record.seen != -1
            && self.fs.entry(record.entry).saved.level <= AccessLevel::Read
    }

    // -- process rollback ---------------------------------------------------

    /// Pop snapshots past the resume point, revert the trace records
    /// between `reverted` and the surviving top, and resynchronize the
    /// collaborators with the rolled-back outputs.
    pub(crate) fn rollback_processes(&mut self, reverted: usize, resume: usize) {
        info!(
            resume,
            output_bytes = self
                .state
                .entry_at(SlotRef::Document)
                .map_or(0, |id| self.fs.entry(id).output_len()),
            "rolling back processes"
        );
        if self.fences.is_empty() {
            debug!("no fences, assuming the worker had finished");
        }

        while !self.ladder.is_empty() && self.ladder.top().trace_len > resume {
            self.pop_process();
        }

        let floor = self.current_trace_len();
        let mut reverted = reverted;
        while reverted > floor {
            reverted -= 1;
            let record = self.trace.get(reverted);
            self.revert_record(record);
        }

        match self.state.entry_at(SlotRef::Document) {
            Some(id) => {
                self.decoder
                    .update(self.fs.entry(id).output().unwrap_or(&[]));
                info!(pages = self.decoder.page_count(), "document after rollback");
            }
            None => self.decoder.reset(),
        }
        match self.state.entry_at(SlotRef::Synctex) {
            Some(id) => self
                .synctex
                .update(self.fs.entry(id).output().unwrap_or(&[])),
            None => self.synctex.reset(),
        }
        let stdout_len = self
            .state
            .entry_at(SlotRef::Stdout)
            .map_or(0, |id| self.fs.entry(id).output_len());
        let log_len = self
            .state
            .entry_at(SlotRef::Log)
            .map_or(0, |id| self.fs.entry(id).output_len());
        self.editor.truncate(EditorChannel::Stdout, stdout_len);
        self.editor.truncate(EditorChannel::Log, log_len);
    }

    /// Terminate and remove the active worker, rolling the journal back
    /// to the new top's mark (or the restart mark when the ladder
    /// drains).
    pub(crate) fn pop_process(&mut self) {
        self.ladder.pop();
        self.channel.reset();
        let mark = if self.ladder.is_empty() {
            self.restart
        } else {
            self.ladder.top().snap
        };
        self.journal.rollback(mark, &mut self.fs, &mut self.state);
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{Engine, EngineConfig};
    use crate::hooks::{NullDecoder, NullEditor, NullSyncTex, WorkerHandle, WorkerSpawner};
    use crate::ladder::Snapshot;
    use texpresso_error::Result;
    use texpresso_state::SearchPath;
    use texpresso_types::{AccessLevel, Mark};

    struct NeverSpawn;
    impl WorkerSpawner for NeverSpawn {
        fn spawn(&mut self, _doc_name: &str) -> Result<WorkerHandle> {
            panic!("tests never spawn workers");
        }
    }

    fn engine_with(config: EngineConfig) -> Engine {
        let mut engine = Engine::new(
            "main.tex",
            config,
            Box::new(NeverSpawn),
            Box::new(NullDecoder),
            Box::new(NullSyncTex),
            Box::new(NullEditor),
        );
        // A fake root worker so trace and ladder operations have a top.
        engine.ladder.push(Snapshot {
            pid: 0,
            fd: None,
            trace_len: 0,
            snap: Mark::new(0),
        });
        engine
    }

    #[test]
    fn record_seen_coalesces_within_a_snapshot() {
        let mut engine = engine_with(EngineConfig::default());
        let a = engine.find_file("a.tex");

        engine.record_seen(a, 10, 100);
        engine.record_seen(a, 20, 200);
        assert_eq!(engine.current_trace_len(), 1);
        assert_eq!(engine.trace_record(0).seen, -1);
        assert_eq!(engine.trace_record(0).time, 200);
        assert_eq!(engine.entry(a).seen, 20);
    }

    #[test]
    fn record_seen_does_not_coalesce_across_a_fork() {
        let mut engine = engine_with(EngineConfig::default());
        let a = engine.find_file("a.tex");

        engine.record_seen(a, 10, 100);
        let trace_len = engine.ladder.top().trace_len;
        engine.ladder.push(Snapshot {
            pid: 1,
            fd: None,
            trace_len,
            snap: Mark::new(0),
        });
        // Same entry again, but the previous record belongs to the
        // parent snapshot now.
        engine.record_seen(a, 20, 600);
        assert_eq!(engine.current_trace_len(), 2);
        assert_eq!(engine.trace_record(1).seen, 10);
    }

    #[test]
    fn compute_fences_aligns_and_clamps_to_observed() {
        let mut engine = engine_with(EngineConfig::default());
        let a = engine.find_file("a.tex");
        let b = engine.find_file("b.tex");
        engine.entry_mut(a).saved.level = AccessLevel::Read;
        engine.entry_mut(b).saved.level = AccessLevel::Read;

        engine.record_seen(a, 100, 100);
        engine.record_seen(b, 200, 400);
        engine.record_seen(a, 300, 900);
        assert_eq!(engine.current_trace_len(), 3);

        let resume = engine.compute_fences(2, 135);
        // (135-64) rounded down to 64 is 64, below the record's stored
        // seen of 100, so the fence clamps up to 100.
        let fence = engine.fences().active().expect("fence");
        assert_eq!(fence.entry, a);
        assert_eq!(fence.position, 100);
        assert_eq!(resume, 0);
    }

    #[test]
    fn compute_fences_spaces_backward_in_time() {
        let mut engine = engine_with(EngineConfig::default());
        let a = engine.find_file("a.tex");
        let b = engine.find_file("b.tex");
        for id in [a, b] {
            engine.entry_mut(id).saved.level = AccessLevel::Read;
        }

        engine.record_seen(a, 64, 100);
        engine.record_seen(b, 128, 200);
        engine.record_seen(a, 256, 400);
        engine.record_seen(b, 512, 900);

        let resume = engine.compute_fences(3, 512);
        // Fence 0 sits at trace[3] (entry b, aligned offset 448). The
        // walk skips trace[3] itself (900 is inside the 10 ms slack) and
        // fences trace[2] at its stored seen; trace[1] stored -1 and is
        // not a candidate.
        assert_eq!(engine.fences().len(), 2);
        let active = engine.fences().active().expect("fence");
        assert_eq!(active.entry, a);
        assert_eq!(active.position, 64);
        assert_eq!(resume, 0);
    }

    #[test]
    fn compute_fences_stops_at_snapshot_boundary() {
        let mut engine = engine_with(EngineConfig::default());
        let a = engine.find_file("a.tex");
        let b = engine.find_file("b.tex");
        engine.entry_mut(a).saved.level = AccessLevel::Read;
        engine.entry_mut(b).saved.level = AccessLevel::Read;

        engine.record_seen(a, 64, 100);
        engine.record_seen(b, 128, 200);
        let trace_len = engine.ladder.top().trace_len;
        engine.ladder.push(Snapshot {
            pid: 1,
            fd: None,
            trace_len,
            snap: Mark::new(0),
        });
        engine.record_seen(a, 256, 800);
        engine.record_seen(b, 512, 900);

        let resume = engine.compute_fences(3, 512);
        // The child snapshot starts at trace index 2; fences may not be
        // placed below it, and the resume point stops right there.
        assert_eq!(resume, 2);
        assert_eq!(engine.fences().len(), 1);
    }

    #[test]
    fn scan_entry_reports_first_divergent_byte() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("main.tex");
        std::fs::write(&path, b"Hello, \\LaTeX!\n").expect("write");

        let config = EngineConfig {
            inclusion_path: SearchPath::new(vec![dir.path().to_owned()]),
            ..EngineConfig::default()
        };
        let mut engine = engine_with(config);
        let id = engine.find_file("main.tex");
        {
            let st = texpresso_state::stat_path(&path).expect("stat");
            let e = engine.entry_mut(id);
            e.saved.level = AccessLevel::Read;
            e.fs_data = Some(b"Hello, \\LaTeX!\n".to_vec());
            e.fs_stat = st;
        }

        // Unchanged file: no diff.
        assert_eq!(engine.scan_entry(id), None);

        // Rewrite byte 7 onward.
        std::fs::write(&path, b"Hello, \\TeX!\n").expect("write");
        assert_eq!(engine.scan_entry(id), Some(8));
        assert_eq!(
            engine.entry(id).fs_data.as_deref(),
            Some(&b"Hello, \\TeX!\n"[..])
        );
    }

    #[test]
    fn scan_entry_treats_removal_as_stat_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gone.tex");
        std::fs::write(&path, b"data").expect("write");

        let config = EngineConfig {
            inclusion_path: SearchPath::new(vec![dir.path().to_owned()]),
            ..EngineConfig::default()
        };
        let mut engine = engine_with(config);
        let id = engine.find_file("gone.tex");
        {
            let st = texpresso_state::stat_path(&path).expect("stat");
            let e = engine.entry_mut(id);
            e.saved.level = AccessLevel::Read;
            e.fs_data = Some(b"data".to_vec());
            e.fs_stat = st;
        }

        std::fs::remove_file(&path).expect("remove");
        assert_eq!(engine.scan_entry(id), None);
        let e = engine.entry(id);
        assert!(!e.fs_stat.is_set());
        // The cached bytes are deliberately kept.
        assert_eq!(e.fs_data.as_deref(), Some(&b"data"[..]));
    }
}
