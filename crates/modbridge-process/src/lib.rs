//! Spawning and tearing down debug targets.
//!
//! The debug adapter owns its own stdio (DAP traffic), so targets are started
//! in a detached process group with every standard stream piped. This keeps
//! the target from competing with the adapter for the controlling terminal,
//! and lets termination reach the whole process tree (wrapper scripts, game
//! launchers that re-exec, ...).

use std::{
    collections::BTreeMap,
    fmt, io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// A full command invocation (cwd + program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub cwd: Option<PathBuf>,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: &Path, args: &[String]) -> Self {
        Self {
            cwd: None,
            program: program.to_path_buf(),
            args: args.to_vec(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Human readable program name, used for the DAP `process` event.
    pub fn display_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // We keep quoting simple; the goal is human-readable debugging output,
        // not round-trippable shell snippets.
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('\t') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// A running target with its stdio split out.
///
/// The pipes are `Option` so callers can move them into reader/writer tasks
/// while keeping the [`TargetProcess`] around for `wait`/termination.
pub struct TargetProcess {
    child: Child,
    pid: Option<u32>,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

impl fmt::Debug for TargetProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl TargetProcess {
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Ask the process tree to exit, then force-kill whatever is left after
    /// `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        terminate_process_tree(&mut self.child, self.pid, grace).await
    }
}

/// Spawn `spec` in its own process group with stdin/stdout/stderr piped.
pub fn spawn_detached(spec: &CommandSpec) -> io::Result<TargetProcess> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = spec.cwd.as_deref() {
        cmd.current_dir(cwd);
    }

    // Put the child into its own process group on Unix so it never fights the
    // adapter for the terminal and so termination can signal the whole tree.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            // SAFETY: `setpgid` is async-signal-safe and does not allocate.
            // This is executed after `fork` in the child process.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();
    tracing::debug!(target: "modbridge.process", pid, command = %spec, "spawned target");

    Ok(TargetProcess {
        stdin: child.stdin.take(),
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
        pid,
        child,
    })
}

async fn terminate_process_tree(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        let Some(pid) = pid else {
            return child.wait().await;
        };
        let pid = pid as i32;
        // Negative pid targets the process group, which we set to the child's pid via
        // `setpgid(0, 0)` in `pre_exec`.
        unsafe {
            let _ = libc::kill(-pid, libc::SIGTERM);
        }

        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }

        tracing::debug!(target: "modbridge.process", pid, "grace period elapsed; killing process group");
        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
        }
        child.wait().await
    }

    #[cfg(windows)]
    {
        let _ = grace;
        // `Child::kill()` only terminates the immediate process; `taskkill /T`
        // terminates the full tree rooted at the pid.
        if let Some(pid) = pid {
            let _ = std::process::Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }

        let _ = child.start_kill();
        child.wait().await
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (grace, pid);
        let _ = child.start_kill();
        child.wait().await
    }
}

/// Exit code to report in a DAP `exited` event.
///
/// Processes killed by a signal have no code; they are reported as `-1`.
pub fn exit_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
