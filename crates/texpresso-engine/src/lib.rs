//! The interactive recompilation engine.
//!
//! A set of long-running TeX worker processes is observed through the
//! query protocol of `texpresso-protocol`. The engine serves their reads
//! from the in-memory VFS, snapshots them at quiet points by asking them
//! to fork, and rolls the whole system back to the deepest still-valid
//! snapshot whenever an edit invalidates bytes a worker has already seen.
//!
//! Concurrency model: single-threaded and cooperative. [`Engine::step`]
//! performs at most one query/answer round-trip with the worker at the
//! top of the snapshot ladder and returns to the caller's event loop.

mod edits;
mod engine;
mod fence;
mod hooks;
mod ladder;
mod spawn;
mod trace;

pub use engine::{Engine, EngineConfig, EngineStatus};
pub use fence::{Fence, Fences};
pub use hooks::{
    DocDecoder, EditorChannel, EditorSink, NullDecoder, NullEditor, NullSyncTex, SyncTexSink,
    WorkerHandle, WorkerSpawner,
};
pub use ladder::{Ladder, Snapshot};
pub use spawn::TectonicSpawner;
pub use trace::{Trace, TraceRecord};
