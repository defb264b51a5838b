//! Child process execution with a wall-clock timeout.
//!
//! A run is finished once the child has exited and both output pipes are
//! closed. Anything the child left running in the background still holds the
//! pipes, so it keeps the run open until the deadline. At the deadline the
//! whole run is killed (its process group on unix, the process tree on every
//! platform) and reported as timed out with whatever output was read so far.

pub mod kill;

pub use kill::{kill_matching, kill_proc, kill_run, KillError};

use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::serde_util::nullable;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_DEFAULT_FAILURE: i32 = 1;
pub const EXIT_START_FAILED: i32 = 65;
pub const EXIT_TEMPFILE_FAILED: i32 = 85;
pub const EXIT_TIMED_OUT: i32 = 98;

const REAP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Cmd,
    PowerShell,
    Python,
    Sh,
}

impl Shell {
    pub fn as_str(self) -> &'static str {
        match self {
            Shell::Cmd => "cmd",
            Shell::PowerShell => "powershell",
            Shell::Python => "python",
            Shell::Sh => "shell",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Shell::Cmd => "bat",
            Shell::PowerShell => "ps1",
            Shell::Python => "py",
            Shell::Sh => "sh",
        }
    }
}

impl FromStr for Shell {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cmd" => Ok(Shell::Cmd),
            "powershell" => Ok(Shell::PowerShell),
            "python" => Ok(Shell::Python),
            "shell" | "sh" | "bash" => Ok(Shell::Sh),
            other => Err(RunnerError::UnknownShell(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("unknown shell {0:?}")]
    UnknownShell(String),
    #[error("failed to prepare script file: {0}")]
    TempFile(#[source] io::Error),
    #[error("failed to start {exe}: {source}")]
    Spawn {
        exe: String,
        #[source]
        source: io::Error,
    },
    #[error("failed waiting for {exe}: {source}")]
    Wait {
        exe: String,
        #[source]
        source: io::Error,
    },
    #[error("{exe} timed out after {} seconds", .timeout.as_secs())]
    TimedOut { exe: String, timeout: Duration },
    #[error("{exe} exited with code {code}: {stderr}")]
    ExitStatus {
        exe: String,
        code: i32,
        stderr: String,
    },
}

/// Script body as delivered by the controller for checks and tasks.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScriptBody {
    #[serde(default, deserialize_with = "nullable")]
    pub shell: String,
    #[serde(default, deserialize_with = "nullable")]
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stderr when present, stdout otherwise.
    pub fn preferred_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }

    /// Converts a timeout or a non-zero exit into an error.
    pub fn into_result(self, exe: &str, timeout: Duration) -> Result<Self, RunnerError> {
        if self.timed_out {
            return Err(RunnerError::TimedOut {
                exe: exe.to_string(),
                timeout,
            });
        }
        if self.exit_code != EXIT_SUCCESS {
            return Err(RunnerError::ExitStatus {
                exe: exe.to_string(),
                code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            });
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptOutcome {
    pub stdout: String,
    pub stderr: String,
    pub retcode: i32,
    pub execution_time: f64,
}

impl ScriptOutcome {
    fn failed(retcode: i32, stderr: String, started: Instant) -> Self {
        Self {
            stdout: String::new(),
            stderr,
            retcode,
            execution_time: started.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptRunner {
    python_bin: PathBuf,
}

impl ScriptRunner {
    pub fn new(python_bin: impl Into<PathBuf>) -> Self {
        Self {
            python_bin: python_bin.into(),
        }
    }

    /// Writes `code` to a fresh temporary file and runs it under `shell`.
    ///
    /// Never fails: start and tempfile problems are folded into the outcome
    /// with their dedicated exit codes.
    pub async fn run_script(
        &self,
        code: &str,
        shell: &str,
        args: &[String],
        timeout: Duration,
    ) -> ScriptOutcome {
        let started = Instant::now();
        let shell = match shell.parse::<Shell>() {
            Ok(shell) => shell,
            Err(err) => return ScriptOutcome::failed(EXIT_START_FAILED, err.to_string(), started),
        };

        let dir = match tempfile::Builder::new().prefix("rmm").tempdir() {
            Ok(dir) => dir,
            Err(err) => {
                warn!(error = %err, "failed to create script directory");
                return ScriptOutcome::failed(
                    EXIT_TEMPFILE_FAILED,
                    RunnerError::TempFile(err).to_string(),
                    started,
                );
            }
        };
        let path = dir.path().join(format!("script.{}", shell.extension()));
        if let Err(err) = tokio::fs::write(&path, code).await {
            warn!(error = %err, path = %path.display(), "failed to write script file");
            return ScriptOutcome::failed(
                EXIT_TEMPFILE_FAILED,
                RunnerError::TempFile(err).to_string(),
                started,
            );
        }

        let cmd = self.script_command(shell, &path, args);
        let outcome = match run_with_deadline(cmd, shell.as_str(), timeout).await {
            Ok(out) if out.timed_out => ScriptOutcome {
                stdout: out.stdout,
                stderr: format!("Script timed out after {} seconds", timeout.as_secs()),
                retcode: EXIT_TIMED_OUT,
                execution_time: started.elapsed().as_secs_f64(),
            },
            Ok(out) => ScriptOutcome {
                stdout: out.stdout,
                stderr: out.stderr,
                retcode: out.exit_code,
                execution_time: started.elapsed().as_secs_f64(),
            },
            Err(err @ RunnerError::Spawn { .. }) => {
                ScriptOutcome::failed(EXIT_START_FAILED, err.to_string(), started)
            }
            Err(err) => ScriptOutcome::failed(EXIT_DEFAULT_FAILURE, err.to_string(), started),
        };
        drop(dir);
        outcome
    }

    /// Runs a one-line command through `cmd` or `powershell`.
    pub async fn cmd_shell(
        &self,
        shell: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RunnerError> {
        let shell = shell.parse::<Shell>()?;
        let mut cmd = match shell {
            Shell::Cmd => {
                let mut cmd = Command::new("cmd.exe");
                cmd.arg("/C").arg(command);
                cmd
            }
            Shell::PowerShell => {
                let mut cmd = Command::new("powershell.exe");
                cmd.args(["-NonInteractive", "-NoProfile", "-Command"])
                    .arg(command);
                cmd
            }
            Shell::Python => {
                let mut cmd = Command::new(&self.python_bin);
                cmd.arg("-c").arg(command);
                cmd
            }
            Shell::Sh => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                cmd
            }
        };
        hide_window(&mut cmd);
        run_with_deadline(cmd, shell.as_str(), timeout).await
    }

    fn script_command(&self, shell: Shell, path: &Path, args: &[String]) -> Command {
        let mut cmd = match shell {
            Shell::Cmd => {
                let mut cmd = Command::new("cmd.exe");
                cmd.arg("/C").arg(path);
                cmd
            }
            Shell::PowerShell => {
                let mut cmd = Command::new("powershell.exe");
                cmd.args([
                    "-NonInteractive",
                    "-NoProfile",
                    "-ExecutionPolicy",
                    "Bypass",
                    "-File",
                ])
                .arg(path);
                cmd
            }
            Shell::Python => {
                let mut cmd = Command::new(&self.python_bin);
                cmd.arg(path);
                cmd
            }
            Shell::Sh => {
                let mut cmd = Command::new("sh");
                cmd.arg(path);
                cmd
            }
        };
        cmd.args(args);
        hide_window(&mut cmd);
        cmd
    }
}

/// Runs a program directly, without a shell.
pub async fn run_command<S: AsRef<OsStr>>(
    exe: &str,
    args: &[S],
    timeout: Duration,
) -> Result<CommandOutput, RunnerError> {
    let mut cmd = Command::new(exe);
    cmd.args(args);
    hide_window(&mut cmd);
    run_with_deadline(cmd, exe, timeout).await
}

async fn run_with_deadline(
    mut cmd: Command,
    exe: &str,
    timeout: Duration,
) -> Result<CommandOutput, RunnerError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    own_process_group(&mut cmd);

    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        exe: exe.to_string(),
        source,
    })?;
    let pid = child.id();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();

    let finished = tokio::time::timeout(timeout, async {
        let (status, (), ()) = tokio::join!(
            child.wait(),
            read_pipe(stdout.as_mut(), &mut out_buf),
            read_pipe(stderr.as_mut(), &mut err_buf),
        );
        status
    })
    .await;

    let (exit_code, timed_out) = match finished {
        Ok(status) => {
            let status = status.map_err(|source| RunnerError::Wait {
                exe: exe.to_string(),
                source,
            })?;
            (status.code().unwrap_or(EXIT_DEFAULT_FAILURE), false)
        }
        Err(_) => {
            if let Some(pid) = pid {
                debug!(pid, timeout_secs = timeout.as_secs(), "deadline passed, killing run");
                if let Err(err) = tokio::task::spawn_blocking(move || kill_run(pid)).await {
                    warn!(pid, error = %err, "kill task failed");
                }
            }
            let _ = child.start_kill();
            if tokio::time::timeout(REAP_GRACE, child.wait()).await.is_err() {
                warn!(exe, "child not reaped after kill");
            }
            (EXIT_TIMED_OUT, true)
        }
    };

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&out_buf).into_owned(),
        stderr: String::from_utf8_lossy(&err_buf).into_owned(),
        exit_code,
        timed_out,
    })
}

/// Reads `pipe` to EOF. Bytes read before a cancellation stay in `buf`.
async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<&mut R>, buf: &mut Vec<u8>) {
    if let Some(pipe) = pipe {
        if let Err(err) = pipe.read_to_end(buf).await {
            debug!(error = %err, "failed reading child output");
        }
    }
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

/// Starts a program that outlives the agent. The child is reaped in the
/// background and its pid returned.
pub fn spawn_detached<S: AsRef<OsStr>>(exe: impl AsRef<OsStr>, args: &[S]) -> Result<u32, RunnerError> {
    let exe = exe.as_ref();
    let mut cmd = std::process::Command::new(exe);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    detach(&mut cmd);
    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        exe: exe.to_string_lossy().into_owned(),
        source,
    })?;
    let pid = child.id();
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    Ok(pid)
}

/// Runs a raw command line through the platform shell, detached.
pub fn spawn_detached_shell(command_line: &str) -> Result<u32, RunnerError> {
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;

        let mut cmd = std::process::Command::new("cmd.exe");
        cmd.raw_arg(format!("/C {command_line}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut cmd);
        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            exe: "cmd.exe".to_string(),
            source,
        })?;
        let pid = child.id();
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(pid)
    }
    #[cfg(not(windows))]
    {
        spawn_detached("sh", &["-c", command_line])
    }
}

#[cfg(windows)]
fn detach(cmd: &mut std::process::Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(unix)]
fn detach(cmd: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(any(windows, unix)))]
fn detach(_cmd: &mut std::process::Command) {}

#[cfg(windows)]
fn hide_window(cmd: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_window(_cmd: &mut Command) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner() -> ScriptRunner {
        ScriptRunner::new("python3")
    }

    #[tokio::test]
    async fn script_exit_code_is_preserved() {
        let out = runner()
            .run_script("echo hello\nexit 3\n", "shell", &[], Duration::from_secs(10))
            .await;
        assert_eq!(out.retcode, 3);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn script_receives_arguments() {
        let args = vec!["one".to_string(), "two words".to_string()];
        let out = runner()
            .run_script("echo \"$1|$2\"\n", "shell", &args, Duration::from_secs(10))
            .await;
        assert_eq!(out.retcode, EXIT_SUCCESS);
        assert_eq!(out.stdout.trim(), "one|two words");
    }

    #[tokio::test]
    async fn timeout_returns_98_and_kills_descendants() {
        let marker = tempfile::tempdir().expect("tempdir");
        let pid_file = marker.path().join("child.pid");
        let code = format!("sleep 30 &\necho $! > {}\nwait\n", pid_file.display());

        let started = Instant::now();
        let out = runner()
            .run_script(&code, "shell", &[], Duration::from_secs(1))
            .await;

        assert_eq!(out.retcode, EXIT_TIMED_OUT);
        assert_eq!(out.stderr, "Script timed out after 1 seconds");
        assert!(started.elapsed() < Duration::from_secs(10));

        let child_pid: u32 = std::fs::read_to_string(&pid_file)
            .expect("child pid written")
            .trim()
            .parse()
            .expect("numeric pid");
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            use sysinfo::{Pid, PidExt, ProcessExt, ProcessStatus, System, SystemExt};
            let mut system = System::new();
            system.refresh_processes();
            let alive = system
                .process(Pid::from_u32(child_pid))
                .map(|p| p.status() != ProcessStatus::Zombie)
                .unwrap_or(false);
            if !alive {
                break;
            }
            assert!(Instant::now() < deadline, "grandchild {child_pid} survived timeout");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn background_child_cannot_outlive_timeout_after_script_exits() {
        let marker = tempfile::tempdir().expect("tempdir");
        let pid_file = marker.path().join("orphan.pid");
        let code = format!(
            "echo started\nsleep 30 &\necho $! > {}\nexit 0\n",
            pid_file.display()
        );

        let started = Instant::now();
        let out = runner()
            .run_script(&code, "shell", &[], Duration::from_secs(1))
            .await;

        assert!(started.elapsed() < Duration::from_secs(10), "run outlived its timeout");
        assert_eq!(out.retcode, EXIT_TIMED_OUT);
        assert_eq!(out.stdout.trim(), "started");

        let orphan: u32 = std::fs::read_to_string(&pid_file)
            .expect("orphan pid written")
            .trim()
            .parse()
            .expect("numeric pid");
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            use sysinfo::{Pid, PidExt, ProcessExt, ProcessStatus, System, SystemExt};
            let mut system = System::new();
            system.refresh_processes();
            let alive = system
                .process(Pid::from_u32(orphan))
                .map(|p| p.status() != ProcessStatus::Zombie)
                .unwrap_or(false);
            if !alive {
                break;
            }
            assert!(Instant::now() < deadline, "orphan {orphan} survived timeout");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn unknown_shell_is_start_failure() {
        let out = runner()
            .run_script("echo hi", "fish-and-chips", &[], Duration::from_secs(5))
            .await;
        assert_eq!(out.retcode, EXIT_START_FAILED);
        assert!(out.stderr.contains("unknown shell"));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let err = run_command("/definitely/not/here", &["x"], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn cmd_shell_captures_both_streams() {
        let out = runner()
            .cmd_shell("shell", "echo out; echo err 1>&2; exit 4", Duration::from_secs(5))
            .await
            .expect("runs");
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.preferred_text().trim(), "err");
        assert_eq!(out.exit_code, 4);
        assert!(matches!(
            out.into_result("sh", Duration::from_secs(5)),
            Err(RunnerError::ExitStatus { code: 4, .. })
        ));
    }

    #[test]
    fn shell_names_parse() {
        assert_eq!("PowerShell".parse::<Shell>().unwrap(), Shell::PowerShell);
        assert_eq!("cmd".parse::<Shell>().unwrap(), Shell::Cmd);
        assert_eq!("python".parse::<Shell>().unwrap(), Shell::Python);
        assert!("".parse::<Shell>().is_err());
    }
}
