use anyhow::{Context, Result};
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Tail,
    Watchdog,
    Parser,
    Delivery,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Tail => "tail",
            Role::Watchdog => "watchdog",
            Role::Parser => "parser",
            Role::Delivery => "delivery",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running OS child as seen by the supervisor.
pub trait ManagedProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Exit code once the process is gone. Death by signal `n` reports `128 + n`.
    fn try_wait(&mut self) -> Result<Option<i32>>;

    /// Ask the process to stop.
    fn terminate(&mut self) -> Result<()>;

    fn kill(&mut self) -> Result<()>;
}

pub trait ProcessLauncher: Send {
    fn launch(&mut self, role: Role, command: &str) -> Result<Box<dyn ManagedProcess>>;
}

/// Runs commands through `sh -c`, each in its own process group so that signals
/// reach the whole pipeline the shell started (ssh and friends included).
#[derive(Debug, Clone, Default)]
pub struct ShellLauncher {
    verbose: bool,
}

impl ShellLauncher {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProcessLauncher for ShellLauncher {
    fn launch(&mut self, role: Role, command: &str) -> Result<Box<dyn ManagedProcess>> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .process_group(0)
            .stdin(Stdio::null());
        if !self.verbose {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {role} process"))?;
        Ok(Box::new(ShellProcess::new(child)))
    }
}

pub struct ShellProcess {
    child: Child,
    pgid: Option<i32>,
    exited: bool,
}

impl ShellProcess {
    fn new(child: Child) -> Self {
        let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());
        Self {
            child,
            pgid,
            exited: false,
        }
    }

    fn signal_group(&self, signal: libc::c_int) -> Result<()> {
        let Some(pgid) = self.pgid else {
            return Ok(());
        };
        // SAFETY: kill(2) with a negative pid only signals the group we created.
        let rc = unsafe { libc::kill(-pgid, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err).with_context(|| format!("failed to signal process group {pgid}"))
    }
}

impl ManagedProcess for ShellProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        match self.child.try_wait()? {
            Some(status) => {
                self.exited = true;
                Ok(Some(exit_code(status)))
            }
            None => Ok(None),
        }
    }

    fn terminate(&mut self) -> Result<()> {
        self.signal_group(libc::SIGTERM)
    }

    fn kill(&mut self) -> Result<()> {
        self.signal_group(libc::SIGKILL)
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        if let Err(err) = self.signal_group(libc::SIGKILL) {
            debug!(error = %err, "failed to kill process group on drop");
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}
