//! The bounded stack of worker snapshots.
//!
//! The deepest snapshot is the currently active worker; everything below
//! it is a suspended fork that can be resumed by popping back to it.
//! When the ladder fills up, decimation collapses the middle of the
//! stack, preserving the root, the tail, and every other snapshot in
//! between so that coverage degrades gracefully.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use texpresso_protocol::sys;
use texpresso_types::limits::MAX_SNAPSHOTS;
use texpresso_types::Mark;
use tracing::{debug, info};

/// One stored worker process.
pub struct Snapshot {
    pub pid: i32,
    /// Channel to the worker; `None` once the worker was terminated.
    pub fd: Option<OwnedFd>,
    /// Trace length at the moment this worker was forked.
    pub trace_len: usize,
    /// Journal position at that same moment. Written into the outgoing
    /// top-of-stack when its child is pushed.
    pub snap: Mark,
}

impl Snapshot {
    #[must_use]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Terminate the worker and close its channel. Idempotent.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            sys::terminate(self.pid);
            drop(fd);
            debug!(pid = self.pid, "terminated worker");
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.close();
    }
}

/// The snapshot stack, at most [`MAX_SNAPSHOTS`] deep.
#[derive(Default)]
pub struct Ladder {
    snapshots: Vec<Snapshot>,
}

impl Ladder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.snapshots.len() == MAX_SNAPSHOTS
    }

    #[must_use]
    pub fn get(&self, index: usize) -> &Snapshot {
        &self.snapshots[index]
    }

    /// The active worker. The ladder being empty here is an engine bug.
    #[must_use]
    pub fn top(&self) -> &Snapshot {
        self.snapshots.last().expect("no worker process on the ladder")
    }

    pub fn top_mut(&mut self) -> &mut Snapshot {
        self.snapshots
            .last_mut()
            .expect("no worker process on the ladder")
    }

    pub fn push(&mut self, snapshot: Snapshot) {
        debug_assert!(!self.is_full());
        self.snapshots.push(snapshot);
    }

    /// Terminate and remove the top snapshot.
    pub fn pop(&mut self) {
        let mut top = self.snapshots.pop().expect("no worker process to pop");
        top.close();
    }

    /// Collapse the middle of a full ladder: keep the root snapshot,
    /// every odd-indexed snapshot up to `2·((len−8)/2)`, and the tail
    /// beyond that cutoff verbatim. Culled workers are terminated.
    pub fn decimate(&mut self) {
        let count = self.snapshots.len();
        let cutoff = (count.saturating_sub(8) / 2) * 2;
        info!(count, cutoff, "decimating snapshot ladder");

        let old = std::mem::take(&mut self.snapshots);
        for (i, mut snapshot) in old.into_iter().enumerate() {
            if i == 0 || i % 2 == 1 || i > cutoff {
                self.snapshots.push(snapshot);
            } else {
                snapshot.close();
            }
        }

        for (i, p) in self.snapshots.iter().enumerate() {
            debug!(
                position = i,
                trace_len = p.trace_len,
                pid = p.pid,
                "surviving snapshot"
            );
        }
    }

    /// Trace lengths from root to top, for invariant checks (P2).
    #[must_use]
    pub fn trace_lens(&self) -> Vec<usize> {
        self.snapshots.iter().map(|p| p.trace_len).collect()
    }

    /// Worker pids from root to top.
    #[must_use]
    pub fn pids(&self) -> Vec<i32> {
        self.snapshots.iter().map(|p| p.pid).collect()
    }
}
