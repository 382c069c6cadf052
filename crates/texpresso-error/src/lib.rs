use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for the incremental compilation engine.
///
/// Recoverable conditions travel through these variants; protocol invariant
/// violations (a worker sending a nonsensical query) are bugs in the worker
/// or the engine and panic with context instead of returning an error.
#[derive(Error, Debug)]
pub enum EngineError {
    // === Worker channel ===
    /// The worker closed its end of the channel mid-conversation.
    #[error("worker channel closed unexpectedly")]
    ChannelClosed,

    /// The worker replied to the handshake with the wrong magic.
    #[error("handshake mismatch: worker replied {reply:?}")]
    HandshakeMismatch { reply: Vec<u8> },

    /// A frame ended before all of its fields arrived.
    #[error("truncated {tag} frame from worker")]
    TruncatedFrame { tag: &'static str },

    // === Worker lifecycle ===
    /// Spawning a worker process failed.
    #[error("failed to spawn worker for '{doc}': {detail}")]
    SpawnFailed { doc: String, detail: String },

    /// An operation that needs a live worker found none.
    #[error("no running worker process")]
    NoWorker,

    // === Filesystem ===
    /// Reading a file into the VFS failed.
    #[error("failed to read '{path}'")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // === I/O ===
    /// Underlying socket or file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenient result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = EngineError::SpawnFailed {
            doc: "main.tex".to_owned(),
            detail: "no such file".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "failed to spawn worker for 'main.tex': no such file"
        );
    }

    #[test]
    fn io_error_converts() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(EngineError::Io(_))));
    }
}
