//! Collaborator interfaces.
//!
//! The engine drives four external subsystems through these traits: the
//! document decoder that parses worker output into pages, the SyncTeX
//! index, the editor-side mirror of stdout/log text, and the spawner
//! that launches worker executables. Null implementations are provided
//! for embeddings (and tests) that do not care about a given seam.

use std::os::fd::OwnedFd;

use texpresso_error::Result;

/// Decoder of the produced document (XDV/DVI/PDF stream).
///
/// `update` is called with the *entire* output buffer after every write
/// to the document singleton and after every rollback; the decoder is
/// expected to reparse incrementally from its own high-water mark and to
/// cope with the buffer having shrunk.
pub trait DocDecoder {
    fn update(&mut self, data: &[u8]);
    fn reset(&mut self);
    fn page_count(&self) -> usize;
    /// Dimensions of a page: width, height, landscape.
    fn page_dim(&self, data: &[u8], page: usize) -> (f32, f32, bool);
    /// Whether the worker has begun producing output. Consulted before
    /// the first snapshot when the engine is configured to wait for it.
    fn output_started(&self) -> bool;
    fn tex_scale_factor(&self) -> f32;
}

/// The SyncTeX index built from the worker's `.synctex` output.
pub trait SyncTexSink {
    /// Reparse from the full synctex buffer.
    fn update(&mut self, data: &[u8]);
    /// Drop the index (the synctex file was reopened or rolled away).
    fn reset(&mut self);
}

/// Which editor mirror a piece of worker output belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditorChannel {
    /// Worker stdout.
    Stdout,
    /// The TeX log file.
    Log,
}

/// Editor-side mirror of stdout and log text.
///
/// `append` hands over the whole output buffer plus the offset where new
/// bytes start. Rollback truncates and later re-appends, so the mirror
/// must tolerate `truncate` followed by `append` at the same offset.
pub trait EditorSink {
    fn append(&mut self, channel: EditorChannel, buffer: &[u8], start: usize);
    fn truncate(&mut self, channel: EditorChannel, len: usize);
}

/// A freshly spawned worker: its pid and the engine's end of the
/// connected socketpair.
#[derive(Debug)]
pub struct WorkerHandle {
    pub pid: i32,
    pub socket: OwnedFd,
}

/// Launches worker executables.
///
/// The contract mirrors the worker side: the spawner creates a connected
/// socketpair, publishes the worker's end in the `TEXPRESSO_FD`
/// environment variable, and execs the worker on the given document.
pub trait WorkerSpawner {
    fn spawn(&mut self, doc_name: &str) -> Result<WorkerHandle>;
}

// ---------------------------------------------------------------------------
// Null implementations
// ---------------------------------------------------------------------------

/// Decoder that ignores everything and reports zero pages.
#[derive(Debug, Default)]
pub struct NullDecoder;

impl DocDecoder for NullDecoder {
    fn update(&mut self, _data: &[u8]) {}
    fn reset(&mut self) {}
    fn page_count(&self) -> usize {
        0
    }
    fn page_dim(&self, _data: &[u8], _page: usize) -> (f32, f32, bool) {
        (0.0, 0.0, false)
    }
    fn output_started(&self) -> bool {
        true
    }
    fn tex_scale_factor(&self) -> f32 {
        1.0
    }
}

/// SyncTeX sink that discards its input.
#[derive(Debug, Default)]
pub struct NullSyncTex;

impl SyncTexSink for NullSyncTex {
    fn update(&mut self, _data: &[u8]) {}
    fn reset(&mut self) {}
}

/// Editor sink that discards its input.
#[derive(Debug, Default)]
pub struct NullEditor;

impl EditorSink for NullEditor {
    fn append(&mut self, _channel: EditorChannel, _buffer: &[u8], _start: usize) {}
    fn truncate(&mut self, _channel: EditorChannel, _len: usize) {}
}
