//! Sandboxed execution of submitted source text.
//!
//! Each run stages the source into a uniquely named scratch file, starts the
//! interpreter on it with the scratch directory as working directory, and
//! races three things: the child exiting, the wall-clock deadline, and stdout
//! growing past the output cap. The latter two end in SIGKILL. The child
//! leads its own process group, and the whole group is killed when the run
//! ends, so anything it left in the background goes with it. The scratch
//! file is removed once the child is gone, whichever way it went.

use crate::config::ExecutorConfig;
use crate::error::ExecError;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// How long to keep reading after the child exits while something it started
/// still holds the pipes.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    OutputExceeded,
}

/// Captured output of one run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub termination: Termination,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }

    /// Stdout on a clean exit, otherwise the message a caller should see.
    pub fn into_output(self, config: &ExecutorConfig) -> Result<String, String> {
        if self.success() {
            return Ok(self.stdout);
        }
        if !self.stderr.is_empty() {
            return Err(self.stderr);
        }
        Err(match self.termination {
            Termination::TimedOut => {
                format!("Execution timed out after {} ms", config.timeout_ms)
            }
            Termination::OutputExceeded => {
                format!("Output limit of {} bytes exceeded", config.output_limit)
            }
            Termination::Exited => "Execution failed".to_string(),
        })
    }
}

/// A staged source file, removed from disk when dropped.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    /// Write `source` under a fresh name inside `dir`, creating `dir` if needed.
    pub async fn stage(dir: &Path, extension: &str, source: &str) -> Result<Self, ExecError> {
        tokio::fs::create_dir_all(dir).await.map_err(ExecError::Stage)?;
        let dir = tokio::fs::canonicalize(dir).await.map_err(ExecError::Stage)?;
        let path = dir.join(scratch_name(extension));
        tokio::fs::write(&path, source).await.map_err(ExecError::Stage)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(&self.path)
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = ?self.path, error = %e, "Scratch file cleanup failed");
        }
    }
}

/// `code_<millis>_<uuid>.<ext>`; the uuid keeps same-millisecond runs apart.
fn scratch_name(extension: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let token = uuid::Uuid::new_v4().simple();
    if extension.is_empty() {
        format!("code_{}_{}", millis, token)
    } else {
        format!("code_{}_{}.{}", millis, token, extension)
    }
}

/// Run `source` through the configured interpreter.
pub async fn run_source(config: &ExecutorConfig, source: &str) -> Result<RunResult, ExecError> {
    let scratch = ScratchFile::stage(&config.scratch_dir, &config.scratch_ext, source).await?;
    info!(path = ?scratch.path(), bytes = source.len(), "Staged scratch file");
    run_staged(config, &scratch).await
    // `scratch` drops here, after the child has been reaped.
}

async fn run_staged(config: &ExecutorConfig, scratch: &ScratchFile) -> Result<RunResult, ExecError> {
    let mut child = Command::new(&config.interpreter)
        .args(config.interpreter_args.iter().filter(|a| !a.is_empty()))
        .arg(scratch.path())
        .current_dir(scratch.dir())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            interpreter: config.interpreter.clone(),
            source,
        })?;
    info!(pid = ?child.id(), interpreter = %config.interpreter, "Child spawned");
    let mut group = ProcessGroup::of(&child);

    let start = Instant::now();
    let mut capture = Capture::new(config.output_limit);
    let (termination, status) =
        supervise(&mut child, &mut group, &mut capture, config.timeout()).await?;
    let elapsed = start.elapsed();

    let result = RunResult {
        stdout: String::from_utf8_lossy(&capture.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&capture.stderr).into_owned(),
        exit_code: status.code(),
        signal: status.signal(),
        termination,
    };
    info!(
        termination = ?result.termination,
        exit_code = ?result.exit_code,
        signal = ?result.signal,
        stdout_len = result.stdout.len(),
        stderr_len = result.stderr.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Child finished"
    );
    Ok(result)
}

/// Process group led by the child, killed at most once.
///
/// Dropping it kills the group too, so a cancelled run leaves nothing behind.
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self(child.id().map(|id| Pid::from_raw(id as i32)))
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            // ESRCH once every member is gone.
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                debug!(pgid = %pgid, error = %e, "Process group kill failed");
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Bounded stdout/stderr buffers.
struct Capture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stderr_full: bool,
    limit: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            stderr_full: false,
            limit,
        }
    }

    /// Append stdout; returns true once the cap has been crossed, leaving at
    /// most `limit` bytes that end on a character boundary.
    fn push_stdout(&mut self, data: &[u8]) -> bool {
        self.stdout.extend_from_slice(data);
        if self.stdout.len() > self.limit {
            let cut = char_boundary(&self.stdout, self.limit);
            self.stdout.truncate(cut);
            return true;
        }
        false
    }

    fn push_stderr(&mut self, data: &[u8]) {
        if self.stderr_full {
            return;
        }
        self.stderr.extend_from_slice(data);
        if self.stderr.len() > self.limit {
            let cut = char_boundary(&self.stderr, self.limit);
            self.stderr.truncate(cut);
            self.stderr_full = true;
        }
    }
}

/// Largest cut `<= at` that does not split a UTF-8 sequence. `buf` must be
/// longer than `at`.
fn char_boundary(buf: &[u8], at: usize) -> usize {
    let mut cut = at;
    while cut > 0 && buf[cut] & 0xC0 == 0x80 {
        cut -= 1;
    }
    cut
}

/// Pump both pipes until the child exits, the deadline fires, or stdout
/// overflows. Kills the process group and reaps the child before returning.
async fn supervise(
    child: &mut Child,
    group: &mut ProcessGroup,
    capture: &mut Capture,
    timeout: Duration,
) -> Result<(Termination, ExitStatus), ExecError> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = [0u8; READ_CHUNK];
    let mut err_buf = [0u8; READ_CHUNK];
    let mut exited: Option<ExitStatus> = None;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    // Armed when the child exits.
    let drain = tokio::time::sleep(timeout);
    tokio::pin!(drain);

    let termination = loop {
        if exited.is_some() && stdout.is_none() && stderr.is_none() {
            break Termination::Exited;
        }
        tokio::select! {
            read = read_some(&mut stdout, &mut out_buf), if stdout.is_some() => match read {
                Some(n) => {
                    if capture.push_stdout(&out_buf[..n]) {
                        warn!(limit = capture.limit, "Output limit exceeded, killing child");
                        break Termination::OutputExceeded;
                    }
                }
                None => stdout = None,
            },
            read = read_some(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
                Some(n) => capture.push_stderr(&err_buf[..n]),
                None => stderr = None,
            },
            status = child.wait(), if exited.is_none() => {
                exited = Some(status.map_err(ExecError::Wait)?);
                drain.as_mut().reset(tokio::time::Instant::now() + DRAIN_GRACE);
            }
            _ = &mut drain, if exited.is_some() => {
                debug!("Pipes held open after exit, stopping capture");
                break Termination::Exited;
            }
            _ = &mut deadline, if exited.is_none() => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Timed out, killing child");
                break Termination::TimedOut;
            }
        }
    };

    group.kill();
    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                // Already exited between the last read and the kill.
                debug!(error = %e, "Kill failed");
            }
            child.wait().await.map_err(ExecError::Wait)?
        }
    };
    Ok((termination, status))
}

/// Read one chunk from an optional pipe; `None` on EOF or read error.
async fn read_some<R: AsyncRead + Unpin>(pipe: &mut Option<R>, buf: &mut [u8]) -> Option<usize> {
    let reader = pipe.as_mut()?;
    match reader.read(buf).await {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(n),
    }
}
