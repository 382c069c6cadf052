//! The engine proper: query answering and snapshot policy.
//!
//! Every mutation of a file entry or state cell is preceded by a journal
//! record, so the whole query stream is undoable back to any snapshot's
//! mark. Protocol violations by the worker are unrecoverable and panic
//! with context; worker death is recoverable and retires the top of the
//! ladder.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use texpresso_error::Result;
use texpresso_protocol::{Answer, Channel, Query, QueryKind};
use texpresso_state::{
    read_file, stat_path, EntryId, FileEntry, Filesystem, Journal, SearchPath, SlotRef,
    StateTables,
};
use texpresso_types::limits::{SNAPSHOT_HYSTERESIS_MS, WORKER_POLL_MS};
use texpresso_types::{AccessLevel, FileId, Mark, PicCache};
use tracing::{debug, info};

use crate::fence::Fences;
use crate::hooks::{DocDecoder, EditorChannel, EditorSink, SyncTexSink, WorkerSpawner};
use crate::ladder::{Ladder, Snapshot};
use crate::trace::{Trace, TraceRecord};

/// Engine configuration.
#[derive(Default)]
pub struct EngineConfig {
    /// Directories searched when a worker opens a relative name.
    pub inclusion_path: SearchPath,
    /// Delay the first snapshot until the decoder reports output. Useful
    /// on platforms where forking before fonts are loaded is unsafe.
    pub wait_for_output_before_fork: bool,
}

/// Liveness of the active worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Running,
    Terminated,
}

/// An open edit transaction (`begin_changes` .. `end_changes`).
pub(crate) struct EditTransaction {
    /// Trace length the rollback has been walked back to.
    pub(crate) trace_len: usize,
    /// First invalidated offset, −1 while no change was recorded.
    pub(crate) offset: i32,
    /// Whether pending worker messages were already drained (or a
    /// `FLSH` ask is owed).
    pub(crate) flush: bool,
}

/// The interactive recompilation engine.
pub struct Engine {
    pub(crate) doc_name: String,
    pub(crate) config: EngineConfig,
    pub(crate) fs: Filesystem,
    pub(crate) state: StateTables,
    pub(crate) journal: Journal,
    pub(crate) channel: Channel,
    pub(crate) ladder: Ladder,
    pub(crate) trace: Trace,
    pub(crate) fences: Fences,
    /// Journal mark to restart from when the ladder drains completely.
    pub(crate) restart: Mark,
    pub(crate) txn: Option<EditTransaction>,
    pub(crate) decoder: Box<dyn DocDecoder>,
    pub(crate) synctex: Box<dyn SyncTexSink>,
    pub(crate) editor: Box<dyn EditorSink>,
    pub(crate) spawner: Box<dyn WorkerSpawner>,
}

impl Engine {
    pub fn new(
        doc_name: impl Into<String>,
        config: EngineConfig,
        spawner: Box<dyn WorkerSpawner>,
        decoder: Box<dyn DocDecoder>,
        synctex: Box<dyn SyncTexSink>,
        editor: Box<dyn EditorSink>,
    ) -> Self {
        texpresso_protocol::sys::ignore_child_exits();
        let mut journal = Journal::new();
        let restart = journal.snapshot();
        Self {
            doc_name: doc_name.into(),
            config,
            fs: Filesystem::new(),
            state: StateTables::new(),
            journal,
            channel: Channel::new(),
            ladder: Ladder::new(),
            trace: Trace::new(),
            fences: Fences::new(),
            restart,
            txn: None,
            decoder,
            synctex,
            editor,
            spawner,
        }
    }

    // -- public surface -----------------------------------------------------

    #[must_use]
    pub fn status(&self) -> EngineStatus {
        if !self.ladder.is_empty() && self.ladder.top().raw_fd().is_some() {
            EngineStatus::Running
        } else {
            EngineStatus::Terminated
        }
    }

    /// Pump at most one query/answer round-trip with the active worker.
    ///
    /// With `restart_if_needed`, an empty ladder is first refilled by
    /// rolling the journal back to the restart mark and spawning a fresh
    /// worker. Returns whether a query was processed.
    pub fn step(&mut self, restart_if_needed: bool) -> Result<bool> {
        if restart_if_needed {
            self.prepare_process()?;
        }
        if self.status() != EngineStatus::Running {
            return Ok(false);
        }
        self.channel.set_fd(self.ladder.top().raw_fd());
        if !self.channel.has_pending_query(WORKER_POLL_MS)? {
            return Ok(false);
        }
        let Some(query) = self.read_current_query()? else {
            return Ok(false);
        };
        self.answer_query(query)?;
        self.channel.flush()?;
        Ok(true)
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.decoder.page_count()
    }

    #[must_use]
    pub fn scale_factor(&self) -> f32 {
        self.decoder.tex_scale_factor()
    }

    /// Dimensions of a produced page, when a document is bound.
    #[must_use]
    pub fn page_dim(&self, page: usize) -> Option<(f32, f32, bool)> {
        let id = self.state.entry_at(SlotRef::Document)?;
        let data = self.fs.entry(id).output()?;
        Some(self.decoder.page_dim(data, page))
    }

    /// Entry for a path, created on first mention.
    pub fn find_file(&mut self, path: &str) -> EntryId {
        self.fs.lookup_or_create(path)
    }

    #[must_use]
    pub fn entry(&self, id: EntryId) -> &FileEntry {
        self.fs.entry(id)
    }

    pub fn entry_mut(&mut self, id: EntryId) -> &mut FileEntry {
        self.fs.entry_mut(id)
    }

    /// Effective data of an entry.
    #[must_use]
    pub fn entry_data(&self, id: EntryId) -> Option<&[u8]> {
        self.fs.data(id)
    }

    /// Effective data of the synctex output, when bound.
    #[must_use]
    pub fn synctex_data(&self) -> Option<&[u8]> {
        self.state
            .entry_at(SlotRef::Synctex)
            .and_then(|id| self.fs.data(id))
    }

    #[must_use]
    pub fn filesystem(&self) -> &Filesystem {
        &self.fs
    }

    #[must_use]
    pub fn state(&self) -> &StateTables {
        &self.state
    }

    #[must_use]
    pub fn fences(&self) -> &Fences {
        &self.fences
    }

    #[must_use]
    pub fn ladder_depth(&self) -> usize {
        self.ladder.len()
    }

    /// Trace lengths of the snapshots, root first.
    #[must_use]
    pub fn snapshot_trace_lens(&self) -> Vec<usize> {
        self.ladder.trace_lens()
    }

    /// Worker pids of the snapshots, root first.
    #[must_use]
    pub fn snapshot_pids(&self) -> Vec<i32> {
        self.ladder.pids()
    }

    /// Trace length of the active worker (0 with an empty ladder).
    #[must_use]
    pub fn current_trace_len(&self) -> usize {
        if self.ladder.is_empty() {
            0
        } else {
            self.ladder.top().trace_len
        }
    }

    #[must_use]
    pub fn trace_record(&self, index: usize) -> TraceRecord {
        self.trace.get(index)
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    // -- worker lifecycle ---------------------------------------------------

    fn prepare_process(&mut self) -> Result<()> {
        if !self.ladder.is_empty() {
            return Ok(());
        }
        self.journal
            .rollback(self.restart, &mut self.fs, &mut self.state);
        let handle = self.spawner.spawn(&self.doc_name)?;
        info!(pid = handle.pid, doc = %self.doc_name, "launched worker");
        self.ladder.push(Snapshot {
            pid: handle.pid,
            fd: Some(handle.socket),
            trace_len: 0,
            snap: self.restart,
        });
        self.channel.set_fd(self.ladder.top().raw_fd());
        assert!(
            self.channel.handshake()?,
            "handshake failed: incompatible worker"
        );
        Ok(())
    }

    /// Read one query from the active worker; a closed stream retires
    /// the worker and reads as `None`.
    pub(crate) fn read_current_query(&mut self) -> Result<Option<Query>> {
        self.channel.set_fd(self.ladder.top().raw_fd());
        let query = self.channel.read_query()?;
        if query.is_none() {
            info!("worker stream closed, terminating process");
            self.ladder.top_mut().close();
        }
        Ok(query)
    }

    // -- query answering ----------------------------------------------------

    pub(crate) fn answer_query(&mut self, query: Query) -> Result<()> {
        let time = query.time;
        match query.kind {
            QueryKind::Open { fid, path, mode } => self.on_open(time, fid, &path, &mode),
            QueryKind::Read { fid, pos, size } => self.on_read(time, fid, pos, size),
            QueryKind::Write { fid, pos, data } => self.on_write(fid, pos, &data),
            QueryKind::Close { fid } => self.on_close(fid),
            QueryKind::Size { fid } => self.on_size(fid),
            QueryKind::Seen { fid, pos } => self.on_seen(time, fid, pos),
            QueryKind::Gpic { path, kind, page } => self.on_gpic(&path, kind, page),
            QueryKind::Spic { path, cache } => self.on_spic(&path, cache),
            QueryKind::Chld { pid, fd } => self.on_chld(pid, fd),
        }
    }

    fn checked_slot(&self, fid: FileId) -> SlotRef {
        match fid.index() {
            Some(i) => SlotRef::Table(i),
            None => panic!("protocol violation: file id {fid} out of range"),
        }
    }

    fn slot_entry(&self, slot: SlotRef) -> EntryId {
        self.state
            .entry_at(slot)
            .unwrap_or_else(|| panic!("protocol violation: {slot} is not open"))
    }

    fn on_open(&mut self, time: i32, fid: FileId, path: &str, mode: &str) -> Result<()> {
        let slot = self.checked_slot(fid);
        assert!(
            self.state.entry_at(slot).is_none(),
            "protocol violation: {slot} is already open"
        );

        let read_mode = mode.starts_with('r');
        let write_mode = mode.starts_with('w');

        let known = self.fs.lookup(path);
        let mut resolved: Option<PathBuf> = None;

        if read_mode {
            let needs_disk = known.map_or(true, |id| self.fs.entry(id).data().is_none());
            if needs_disk {
                match self.config.inclusion_path.resolve(path) {
                    Some((p, _)) => resolved = Some(p),
                    None => {
                        // Nothing to serve. Remember that "not found" was
                        // observed, then let the worker fall back to its
                        // own resolution.
                        let id = self.fs.lookup_or_create(path);
                        self.journal.record_entry(&mut self.fs, id);
                        self.record_seen(id, i32::MAX, time);
                        return self.channel.write_answer(&Answer::Pass);
                    }
                }
            }
        }

        let id = known.unwrap_or_else(|| self.fs.lookup_or_create(path));

        self.journal.record_cell(&mut self.state, slot);
        self.journal.record_entry(&mut self.fs, id);
        self.state.cell_mut(slot).entry = Some(id);
        if self.fs.entry(id).seen < 0 {
            self.record_seen(id, 0, time);
        }

        if write_mode {
            {
                let e = self.fs.entry_mut(id);
                e.saved.data = Some(Vec::new());
                e.saved.level = AccessLevel::Write;
            }
            info!(path, "worker writes");
            self.adopt_singleton(id, path);
        } else if self.fs.entry(id).saved.level < AccessLevel::Read {
            let resolved = resolved
                .or_else(|| self.config.inclusion_path.resolve(path).map(|(p, _)| p));
            match resolved {
                None => {
                    // Editor-only file: no on-disk counterpart.
                    let e = self.fs.entry_mut(id);
                    assert!(
                        e.edit_data.is_some(),
                        "protocol violation: no backing data for '{path}' opened with mode {mode:?}"
                    );
                    e.saved.level = AccessLevel::Read;
                    e.fs_stat.clear();
                }
                Some(p) => {
                    let data = read_file(&p)?;
                    let st = stat_path(&p).unwrap_or_default();
                    let e = self.fs.entry_mut(id);
                    e.fs_data = Some(data);
                    e.fs_stat = st;
                    e.saved.level = AccessLevel::Read;
                }
            }
        }

        self.channel.write_answer(&Answer::Open(path.to_owned()))
    }

    /// Bind a freshly write-opened entry to the singleton its name or
    /// extension designates, resetting the attached consumer.
    fn adopt_singleton(&mut self, id: EntryId, path: &str) {
        if path == "stdout" {
            self.claim_singleton(SlotRef::Stdout, id);
            return;
        }
        let ext = path.rsplit_once('.').map_or(path, |(_, ext)| ext);
        match ext {
            "xdv" | "dvi" | "pdf" => {
                self.claim_singleton(SlotRef::Document, id);
                self.decoder.reset();
                info!(path, "this is the output document");
            }
            "synctex" => {
                self.claim_singleton(SlotRef::Synctex, id);
                self.synctex.reset();
                info!(path, "this is the synctex index");
            }
            "log" => {
                self.claim_singleton(SlotRef::Log, id);
                info!(path, "this is the log file");
            }
            _ => {}
        }
    }

    fn claim_singleton(&mut self, slot: SlotRef, id: EntryId) {
        assert!(
            self.state.entry_at(slot).is_none(),
            "protocol violation: second claim of the {slot} singleton"
        );
        self.journal.record_cell(&mut self.state, slot);
        self.state.cell_mut(slot).entry = Some(id);
    }

    fn on_read(&mut self, time: i32, fid: FileId, pos: i32, size: i32) -> Result<()> {
        let slot = self.checked_slot(fid);
        let id = self.slot_entry(slot);

        let invalidation = self.fs.entry(id).debug_rollback_invalidation;
        if invalidation > -1 {
            assert!(
                pos <= invalidation,
                "read at {pos} past rollback invalidation point {invalidation}"
            );
            self.fs.entry_mut(id).debug_rollback_invalidation = -1;
        }

        enum Outcome {
            Fork { retire: bool },
            Data(Vec<u8>),
        }

        let outcome = {
            let e = self.fs.entry(id);
            assert!(
                e.saved.level >= AccessLevel::Read,
                "protocol violation: read from '{}' without read access",
                e.path()
            );
            let data = e
                .data()
                .unwrap_or_else(|| panic!("protocol violation: read from dataless '{}'", e.path()));
            let len = data.len() as i32;
            assert!(
                pos >= 0 && pos <= len,
                "protocol violation: read at {pos} outside '{}' of length {len}",
                e.path()
            );
            let mut n = size.min(len - pos);
            let mut fork = false;
            if let Some(fence) = self.fences.active() {
                if fence.entry == id && fence.position < pos + n {
                    assert!(n >= 0, "protocol violation: negative read clamp");
                    n = fence.position - pos;
                    fork = n == 0;
                    assert!(
                        n >= 0,
                        "fence at {} is behind read position {pos} in '{}'",
                        fence.position,
                        e.path()
                    );
                }
            }
            if fork {
                Outcome::Fork { retire: true }
            } else if self.need_snapshot(time) {
                Outcome::Fork { retire: false }
            } else {
                Outcome::Data(data[pos as usize..(pos + n) as usize].to_vec())
            }
        };

        match outcome {
            Outcome::Fork { retire } => {
                if retire {
                    debug!(fence = ?self.fences.active(), "fence reached, forking");
                    self.fences.retire();
                }
                self.channel.write_answer(&Answer::Fork)
            }
            Outcome::Data(bytes) => self.channel.write_answer(&Answer::Read(bytes)),
        }
    }

    /// Snapshot policy: fork when the worker has been running for a
    /// while past the previous snapshot's last observation, never while
    /// fences are pending, and never when the trace has not advanced
    /// (which would loop forever forking at the same spot).
    fn need_snapshot(&self, time: i32) -> bool {
        if self.fences.active().is_some() {
            return false;
        }
        let depth = self.ladder.len();
        let last_time = if depth > 1 {
            let current = self.ladder.top();
            let previous = self.ladder.get(depth - 2);
            if current.trace_len == previous.trace_len {
                return false;
            }
            self.trace.last_time(previous.trace_len)
        } else {
            if self.config.wait_for_output_before_fork && !self.decoder.output_started() {
                return false;
            }
            0
        };
        time > SNAPSHOT_HYSTERESIS_MS + last_time
    }

    fn on_write(&mut self, fid: FileId, pos: i32, data: &[u8]) -> Result<()> {
        let (id, pos) = if fid == FileId::STDOUT_REDIRECT {
            let id = match self.state.entry_at(SlotRef::Stdout) {
                Some(id) => id,
                None => {
                    let id = self.fs.lookup_or_create("stdout");
                    self.journal.record_entry(&mut self.fs, id);
                    self.journal.record_cell(&mut self.state, SlotRef::Stdout);
                    self.state.cell_mut(SlotRef::Stdout).entry = Some(id);
                    let e = self.fs.entry_mut(id);
                    if e.saved.data.is_none() {
                        e.saved.data = Some(Vec::new());
                        e.saved.level = AccessLevel::Write;
                    }
                    id
                }
            };
            assert!(
                pos == 0,
                "protocol violation: stdout redirect with explicit position {pos}"
            );
            (id, self.fs.entry(id).output_len())
        } else {
            let slot = self.checked_slot(fid);
            let id = self.slot_entry(slot);
            let pos = usize::try_from(pos)
                .unwrap_or_else(|_| panic!("protocol violation: negative write position {pos}"));
            (id, pos)
        };

        assert!(
            self.fs.entry(id).saved.level == AccessLevel::Write,
            "protocol violation: write to '{}' without write access",
            self.fs.entry(id).path()
        );
        self.journal.record_entry(&mut self.fs, id);

        {
            let e = self.fs.entry_mut(id);
            let buf = e.saved.data.as_mut().expect("write-level entry has a buffer");
            if pos + data.len() > buf.len() {
                buf.truncate(pos);
                if buf.len() < pos {
                    buf.resize(pos, 0);
                }
                buf.extend_from_slice(data);
            } else {
                buf[pos..pos + data.len()].copy_from_slice(data);
            }
        }

        if self.state.entry_at(SlotRef::Document) == Some(id) {
            let before = self.decoder.page_count();
            self.decoder.update(self.fs.entry(id).output().unwrap_or(&[]));
            let after = self.decoder.page_count();
            if before != after {
                info!(pages = after, "document output updated");
            }
        } else if self.state.entry_at(SlotRef::Synctex) == Some(id) {
            self.synctex.update(self.fs.entry(id).output().unwrap_or(&[]));
        } else if self.state.entry_at(SlotRef::Log) == Some(id) {
            self.editor.append(
                EditorChannel::Log,
                self.fs.entry(id).output().unwrap_or(&[]),
                pos,
            );
        } else if self.state.entry_at(SlotRef::Stdout) == Some(id) {
            self.editor.append(
                EditorChannel::Stdout,
                self.fs.entry(id).output().unwrap_or(&[]),
                pos,
            );
        }

        self.channel.write_answer(&Answer::Done)
    }

    fn on_close(&mut self, fid: FileId) -> Result<()> {
        let slot = self.checked_slot(fid);
        let id = self.slot_entry(slot);
        self.journal.record_cell(&mut self.state, slot);
        self.state.cell_mut(slot).entry = None;
        debug!(path = self.fs.entry(id).path(), "closed");

        if self.state.entry_at(SlotRef::Stdout) == Some(id) {
            self.journal.record_cell(&mut self.state, SlotRef::Stdout);
            self.state.cell_mut(SlotRef::Stdout).entry = None;
        }
        if self.state.entry_at(SlotRef::Document) == Some(id) {
            // The document singleton deliberately stays bound: pages are
            // rendered and rolled back after the worker closed the file.
            info!("finished document output");
        }
        if self.state.entry_at(SlotRef::Synctex) == Some(id) {
            self.journal.record_cell(&mut self.state, SlotRef::Synctex);
            self.state.cell_mut(SlotRef::Synctex).entry = None;
        }
        if self.state.entry_at(SlotRef::Log) == Some(id) {
            self.journal.record_cell(&mut self.state, SlotRef::Log);
            self.state.cell_mut(SlotRef::Log).entry = None;
        }

        self.channel.write_answer(&Answer::Done)
    }

    fn on_size(&mut self, fid: FileId) -> Result<()> {
        let slot = self.checked_slot(fid);
        let id = self.slot_entry(slot);
        let e = self.fs.entry(id);
        assert!(
            e.saved.level >= AccessLevel::Read,
            "protocol violation: size of '{}' without read access",
            e.path()
        );
        let len = e
            .data()
            .unwrap_or_else(|| panic!("protocol violation: size of dataless '{}'", e.path()))
            .len();
        self.channel.write_answer(&Answer::Size(len as i32))
    }

    fn on_seen(&mut self, time: i32, fid: FileId, pos: i32) -> Result<()> {
        let slot = self.checked_slot(fid);
        let id = self.slot_entry(slot);
        let e = self.fs.entry(id);
        assert!(
            e.saved.level >= AccessLevel::Read,
            "protocol violation: seen on '{}' without read access",
            e.path()
        );
        debug!(path = e.path(), from = e.seen, to = pos, "seen");

        if let Some(fence) = self.fences.active() {
            assert!(
                !(fence.entry == id && fence.position < pos),
                "protocol violation: seen position {pos} in '{}' crosses the fence at {}",
                e.path(),
                fence.position
            );
        }
        assert!(
            e.debug_rollback_invalidation == -1 || pos < e.debug_rollback_invalidation,
            "seen position {pos} reaches rollback invalidation point {}",
            e.debug_rollback_invalidation
        );

        if pos <= e.seen {
            // Reopening a file legitimately lowers the position; drop it.
            return Ok(());
        }
        self.journal.record_entry(&mut self.fs, id);
        self.record_seen(id, pos, time);
        Ok(())
    }

    fn on_chld(&mut self, pid: i32, fd: RawFd) -> Result<()> {
        if self.ladder.is_full() {
            self.ladder.decimate();
        }
        self.channel.reset();
        let mark = self.journal.snapshot();
        self.ladder.top_mut().snap = mark;
        let trace_len = self.ladder.top().trace_len;
        // SAFETY: the descriptor arrived via SCM_RIGHTS; the engine is
        // its sole owner from here on.
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };
        info!(
            pid,
            trace_len,
            depth = self.ladder.len() + 1,
            "pushed worker snapshot"
        );
        self.ladder.push(Snapshot {
            pid,
            fd: Some(socket),
            trace_len,
            snap: mark,
        });
        // The answer goes to the parent, which sent the query.
        self.channel.write_answer(&Answer::Done)
    }

    fn on_gpic(&mut self, path: &str, kind: i32, page: i32) -> Result<()> {
        let answer = match self.fs.lookup(path) {
            Some(id) => {
                let e = self.fs.entry(id);
                match e.pic_cache {
                    Some(c)
                        if e.saved.level == AccessLevel::Read
                            && c.kind == kind
                            && c.page == page =>
                    {
                        Answer::Gpic(c.bounds)
                    }
                    _ => Answer::Pass,
                }
            }
            None => Answer::Pass,
        };
        self.channel.write_answer(&answer)
    }

    fn on_spic(&mut self, path: &str, cache: PicCache) -> Result<()> {
        if let Some(id) = self.fs.lookup(path) {
            if self.fs.entry(id).saved.level == AccessLevel::Read {
                self.fs.entry_mut(id).pic_cache = Some(cache);
            }
        }
        self.channel.write_answer(&Answer::Done)
    }

    // -- trace --------------------------------------------------------------

    /// Advance an entry's `seen`, recording the previous value in the
    /// trace. Consecutive advancements of the same entry within the
    /// current snapshot coalesce into one record.
    pub(crate) fn record_seen(&mut self, id: EntryId, new_seen: i32, time: i32) {
        let trace_len = self.ladder.top().trace_len;
        let depth = self.ladder.len();
        let coalesce = trace_len > 0
            && self.trace.get(trace_len - 1).entry == id
            && (depth <= 1 || self.ladder.get(depth - 2).trace_len != trace_len);

        if coalesce {
            self.trace.update_time(trace_len - 1, time);
            self.fs.entry_mut(id).seen = new_seen;
            return;
        }

        let previous = self.fs.entry(id).seen;
        self.trace.set(
            trace_len,
            TraceRecord {
                entry: id,
                seen: previous,
                time,
            },
        );
        self.fs.entry_mut(id).seen = new_seen;
        self.ladder.top_mut().trace_len += 1;
    }

    /// Undo one trace record.
    pub(crate) fn revert_record(&mut self, record: TraceRecord) {
        self.fs.entry_mut(record.entry).seen = record.seen;
    }
}
