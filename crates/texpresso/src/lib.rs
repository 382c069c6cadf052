//! # texpresso
//!
//! Incremental-compilation core of an interactive TeX document compiler.
//!
//! A user edits source files in an editor; this crate maintains a set of
//! long-running compiler worker processes, observes their filesystem and
//! I/O requests through a private protocol, and uses that observation
//! stream to:
//!
//! - serve reads from in-memory document buffers instead of disk,
//! - snapshot workers at carefully chosen points (by asking them to
//!   fork) so that later edits only reprocess the tail of the document,
//! - roll back to the oldest still-valid snapshot whenever an edit
//!   invalidates previously delivered bytes.
//!
//! The top-level type is [`Engine`]; a UI event loop drives it with
//! [`Engine::step`] and the `begin_changes` / `detect_changes` /
//! `end_changes` edit transaction. Rendering, SyncTeX queries, and the
//! editor protocol live behind the [`DocDecoder`], [`SyncTexSink`] and
//! [`EditorSink`] traits.

pub use texpresso_engine::{
    DocDecoder, EditorChannel, EditorSink, Engine, EngineConfig, EngineStatus, Fence, Fences,
    Ladder, NullDecoder, NullEditor, NullSyncTex, Snapshot, SyncTexSink, TectonicSpawner, Trace,
    TraceRecord, WorkerHandle, WorkerSpawner,
};
pub use texpresso_error::{EngineError, Result};
pub use texpresso_protocol::{
    sys, Answer, AnswerTag, Ask, Channel, Query, QueryKind, QueryTag, CLIENT_HANDSHAKE,
    SERVER_HANDSHAKE,
};
pub use texpresso_state::{
    normalize_path, read_file, stat_path, EntryId, FileCell, FileEntry, Filesystem, Journal,
    Saved, SearchPath, SlotRef, StateTables,
};
pub use texpresso_types::{
    encoding, limits, AccessLevel, FileId, FsStat, Mark, PicCache, StatTime,
};
