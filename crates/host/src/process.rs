//! Decoder child process: launch, liveness and guaranteed teardown.
//!
//! Teardown contract: [`DecoderProcess::terminate`] sends `SIGKILL`, then
//! waits for the child so it never lingers as a zombie. It is idempotent and
//! also runs on drop. On Linux the child additionally asks the kernel to kill
//! it if the host dies first (`PR_SET_PDEATHSIG`); on other platforms the
//! explicit teardown is the only guarantee.

use std::io;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use tracing::{debug, info, warn};

use crate::{PlayerError, Result};

/// A running decoder, owned by exactly one session.
#[derive(Debug)]
pub struct DecoderProcess {
    child: Option<Child>,
    pid: u32,
    exit_status: Option<ExitStatus>,
}

impl DecoderProcess {
    /// Launch `decoder <namespace_dir> <stream_size> --log-level <level>`.
    pub fn spawn(
        decoder: &Path,
        namespace_dir: &Path,
        stream_size: u64,
        log_level: &str,
    ) -> Result<Self> {
        let mut cmd = Command::new(decoder);
        cmd.arg(namespace_dir)
            .arg(stream_size.to_string())
            .arg("--log-level")
            .arg(log_level)
            .stdin(Stdio::null());

        set_parent_death_signal(&mut cmd);

        let child = cmd.spawn().map_err(|source| PlayerError::Spawn {
            path: decoder.to_path_buf(),
            source,
        })?;
        let pid = child.id();

        info!(pid, "Spawned decoder {}", decoder.display());

        Ok(Self {
            child: Some(child),
            pid,
            exit_status: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking liveness check. Returns the exit status once the child is gone.
    pub fn try_exited(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_some() {
            return self.exit_status;
        }

        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!(pid = self.pid, "Decoder exited: {}", status);
                self.exit_status = Some(status);
                self.exit_status
            }
            Ok(None) => None,
            Err(e) => {
                warn!(pid = self.pid, "Failed to poll decoder status: {}", e);
                None
            }
        }
    }

    /// Force-terminate and reap. Errors are logged, never returned.
    pub fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if self.exit_status.is_none() {
            match child.kill() {
                Ok(()) => debug!(pid = self.pid, "Sent SIGKILL to decoder"),
                // Already exited but not yet reaped
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
                Err(e) => warn!(pid = self.pid, "Failed to kill decoder: {}", e),
            }
        }

        match child.wait() {
            Ok(status) => {
                info!(pid = self.pid, "Decoder reaped: {}", status);
                self.exit_status = Some(status);
            }
            Err(e) => warn!(pid = self.pid, "Failed to reap decoder: {}", e),
        }
    }
}

impl Drop for DecoderProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: prctl and getppid are async-signal-safe and touch no shared state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(io::Error::last_os_error());
            }
            // The parent may have died between fork and prctl
            if libc::getppid() == 1 {
                return Err(io::Error::other("parent already exited"));
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn set_parent_death_signal(_cmd: &mut Command) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn spawn_sleeper() -> DecoderProcess {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let child = cmd.spawn().unwrap();
        let pid = child.id();
        DecoderProcess {
            child: Some(child),
            pid,
            exit_status: None,
        }
    }

    #[test]
    fn test_terminate_kills_and_reaps_once() {
        let mut process = spawn_sleeper();
        assert!(process.try_exited().is_none());

        process.terminate();
        assert!(process.child.is_none());

        // A reaped pid no longer exists
        let alive = unsafe { libc::kill(process.pid() as libc::pid_t, 0) } == 0;
        assert!(!alive);

        process.terminate();
    }

    #[test]
    fn test_try_exited_observes_crash() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 3");
        let child = cmd.spawn().unwrap();
        let pid = child.id();
        let mut process = DecoderProcess {
            child: Some(child),
            pid,
            exit_status: None,
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        let status = loop {
            if let Some(status) = process.try_exited() {
                break status;
            }
            assert!(Instant::now() < deadline, "child never exited");
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(status.code(), Some(3));

        process.terminate();
        assert!(process.child.is_none());
    }

    #[test]
    fn test_spawn_missing_executable() {
        let err = DecoderProcess::spawn(
            Path::new("/nonexistent/mb-decoder"),
            Path::new("/tmp"),
            0,
            "info",
        )
        .unwrap_err();

        assert!(matches!(err, PlayerError::Spawn { .. }));
    }
}
