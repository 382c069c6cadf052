//! Launching real worker executables.

use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use texpresso_error::{EngineError, Result};
use tracing::info;

use crate::hooks::{WorkerHandle, WorkerSpawner};

/// Spawns `tectonic`-style workers connected by a socketpair.
///
/// The worker's end of the pair is published through the `TEXPRESSO_FD`
/// environment variable. The resource bundle server is reached through
/// three inherited descriptors encoded in a `texpresso-bundle://` URL.
pub struct TectonicSpawner {
    exec_path: PathBuf,
    bundle_input: RawFd,
    bundle_output: RawFd,
    bundle_lock: RawFd,
}

impl TectonicSpawner {
    #[must_use]
    pub fn new(
        exec_path: PathBuf,
        bundle_input: RawFd,
        bundle_output: RawFd,
        bundle_lock: RawFd,
    ) -> Self {
        Self {
            exec_path,
            bundle_input,
            bundle_output,
            bundle_lock,
        }
    }
}

impl WorkerSpawner for TectonicSpawner {
    fn spawn(&mut self, doc_name: &str) -> Result<WorkerHandle> {
        let (ours, theirs) = UnixStream::pair()?;
        let worker_fd = theirs.into_raw_fd();
        let bundle_url = format!(
            "texpresso-bundle://{},{},{}",
            self.bundle_input, self.bundle_output, self.bundle_lock
        );

        let mut command = Command::new(&self.exec_path);
        command
            .arg("-X")
            .arg("texpresso")
            .arg("--bundle")
            .arg(&bundle_url)
            .arg("--untrusted")
            .arg("--synctex")
            .arg("--outfmt")
            .arg("xdv")
            .arg("-Z")
            .arg("continue-on-errors")
            .arg(doc_name)
            .env("TEXPRESSO_FD", worker_fd.to_string());

        let inherited = [
            worker_fd,
            self.bundle_input,
            self.bundle_output,
            self.bundle_lock,
        ];
        // SAFETY: only async-signal-safe fcntl/dup2 calls run between
        // fork and exec.
        unsafe {
            command.pre_exec(move || {
                for fd in inherited {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                // The worker talks to us over the socket; its stdout is
                // redirected to stderr so stray prints stay diagnostic.
                if libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|e| EngineError::SpawnFailed {
            doc: doc_name.to_owned(),
            detail: e.to_string(),
        })?;
        texpresso_protocol::sys::close_fd(worker_fd);

        let pid = child.id() as i32;
        info!(pid, exec = %self.exec_path.display(), "launched worker");
        // No wait: terminated workers are reaped by the ignored SIGCHLD.
        drop(child);
        Ok(WorkerHandle {
            pid,
            socket: ours.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_executable_reports_spawn_failure() {
        let mut spawner =
            TectonicSpawner::new(PathBuf::from("/nonexistent/tectonic"), -1, -1, -1);
        match spawner.spawn("main.tex") {
            Err(EngineError::SpawnFailed { doc, .. }) => assert_eq!(doc, "main.tex"),
            other => panic!("expected SpawnFailed, got {other:?}"),
        }
    }
}
