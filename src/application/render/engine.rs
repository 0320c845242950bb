//! Scoped ownership of one rendering-engine process.
//!
//! The engine is spawned as the leader of its own process group so helper
//! processes (renderer, GPU, zygote) die together with it.

use std::{
    io::{self, ErrorKind},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, warn};

const STDERR_TAIL_BYTES: usize = 4 * 1024;
const STDERR_COLLECT_GRACE: Duration = Duration::from_millis(250);

pub(crate) struct EngineProcess {
    child: Child,
    pid: Option<u32>,
    reaped: bool,
    stderr: Option<JoinHandle<String>>,
}

impl EngineProcess {
    pub(crate) fn spawn(mut command: Command) -> io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let pid = child.id();
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut tail = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => {
                            tail.extend_from_slice(&chunk[..read]);
                            if tail.len() > STDERR_TAIL_BYTES {
                                let excess = tail.len() - STDERR_TAIL_BYTES;
                                tail.drain(..excess);
                            }
                        }
                    }
                }
                String::from_utf8_lossy(&tail).trim().to_string()
            })
        });

        debug!(
            target = "application::render::engine",
            op = "engine::spawn",
            pid = pid.unwrap_or_default(),
            "Rendering engine spawned"
        );

        Ok(Self {
            child,
            pid,
            reaped: false,
            stderr,
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the engine to exit on its own. Cancel safe.
    pub(crate) async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.reaped = true;
        Ok(status)
    }

    /// Last few kilobytes the engine wrote to stderr. Only meaningful once the
    /// process has exited.
    pub(crate) async fn stderr_tail(&mut self) -> String {
        let Some(handle) = self.stderr.take() else {
            return String::new();
        };
        match tokio::time::timeout(STDERR_COLLECT_GRACE, handle).await {
            Ok(Ok(tail)) => tail,
            Ok(Err(_)) => String::new(),
            Err(_) => String::from("<stderr still open>"),
        }
    }

    /// Kill the whole process group and reap the leader.
    ///
    /// The group is signalled even when the leader already exited on its own:
    /// helpers it forked keep the group alive and would otherwise outlive the
    /// render.
    pub(crate) async fn terminate(&mut self) {
        if let Some(handle) = self.stderr.take() {
            handle.abort();
        }

        self.signal_group();
        if self.reaped {
            return;
        }

        match self.child.start_kill() {
            Ok(()) => {}
            // Already exited but not yet reaped.
            Err(err) if err.kind() == ErrorKind::InvalidInput => {}
            Err(err) => warn!(
                target = "application::render::engine",
                op = "engine::terminate",
                pid = self.pid.unwrap_or_default(),
                error = %err,
                "Failed to signal rendering engine"
            ),
        }

        match self.child.wait().await {
            Ok(status) => {
                self.reaped = true;
                debug!(
                    target = "application::render::engine",
                    op = "engine::terminate",
                    pid = self.pid.unwrap_or_default(),
                    status = %status,
                    "Rendering engine terminated"
                );
            }
            Err(err) => warn!(
                target = "application::render::engine",
                op = "engine::terminate",
                pid = self.pid.unwrap_or_default(),
                error = %err,
                "Failed to reap rendering engine"
            ),
        }
    }

    // A group id is not handed out again while any member of the group is
    // alive, so after the leader is reaped this either reaches leftover
    // helpers or fails with ESRCH.
    fn signal_group(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) {
            // SAFETY: kill(2) has no memory-safety preconditions.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if let Some(handle) = self.stderr.take() {
            handle.abort();
        }
        // Teardown may not have run if the owning future was dropped. tokio
        // reaps a killed leader in the background.
        self.signal_group();
        if !self.reaped {
            let _ = self.child.start_kill();
        }
    }
}
