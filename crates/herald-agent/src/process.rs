use std::{process::ExitStatus, time::Duration};

use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// Signal the observer delivers when a job is stopped from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM, escalated to SIGKILL after the grace period.
    Terminate,
    /// SIGKILL right away.
    Kill,
}

/// A spawned job process before it is handed to the registry.
#[derive(Debug)]
pub struct JobProcess {
    child: Child,
    pid: Option<u32>,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Children die with the server instead of running on unowned.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

impl JobProcess {
    /// Spawn with piped output, in a fresh session so the whole worker tree
    /// can be signalled at once.
    pub fn spawn(cmd: &mut Command) -> std::io::Result<Self> {
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        let pid = child.id();
        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_output(&mut self) -> (Option<ChildStdout>, Option<ChildStderr>) {
        (self.child.stdout.take(), self.child.stderr.take())
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Deliver `signal` and wait for the exit. Must only be called while the
    /// child is unreaped, so the pid cannot have been recycled.
    pub async fn stop(&mut self, signal: StopSignal, grace: Duration) -> std::io::Result<ExitStatus> {
        match signal {
            StopSignal::Kill => {
                self.send(StopSignal::Kill);
                self.child.wait().await
            }
            StopSignal::Terminate => {
                self.send(StopSignal::Terminate);
                match tokio::time::timeout(grace, self.child.wait()).await {
                    Ok(res) => res,
                    Err(_) => {
                        tracing::warn!(
                            pid = ?self.pid,
                            grace_ms = grace.as_millis() as u64,
                            "process ignored SIGTERM; sending SIGKILL"
                        );
                        self.send(StopSignal::Kill);
                        self.child.wait().await
                    }
                }
            }
        }
    }

    #[cfg(unix)]
    fn send(&mut self, signal: StopSignal) {
        let Some(pid) = self.pid else {
            return;
        };
        let sig = match signal {
            StopSignal::Terminate => libc::SIGTERM,
            StopSignal::Kill => libc::SIGKILL,
        };
        let pid = pid as libc::pid_t;
        // The job leads its own session, so its pid is also the group id.
        // Fall back to the pid if the group is already gone.
        let rc = unsafe { libc::kill(-pid, sig) };
        if rc == -1 {
            let rc = unsafe { libc::kill(pid, sig) };
            if rc == -1 {
                tracing::debug!(
                    pid,
                    error = %std::io::Error::last_os_error(),
                    "signal delivery failed"
                );
            }
        }
    }

    #[cfg(not(unix))]
    fn send(&mut self, _signal: StopSignal) {
        let _ = self.child.start_kill();
    }
}
