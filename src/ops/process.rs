//! Subprocesses and their stdio pipes

use crate::error::OpResult;
use crate::runtime::Runtime;
use crate::table::{Handle, Payload};
use nix::sys::signal;
use nix::unistd::Pid;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};

/// How a child's stdio stream is set up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    #[default]
    Inherit,
    Piped,
    Null,
}

impl StdioMode {
    fn to_stdio(self) -> Stdio {
        match self {
            StdioMode::Inherit => Stdio::inherit(),
            StdioMode::Piped => Stdio::piped(),
            StdioMode::Null => Stdio::null(),
        }
    }
}

/// Options for `op_spawn`
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Start from an empty environment instead of inheriting ours
    pub clear_env: bool,
    pub cwd: Option<PathBuf>,
    pub stdin: StdioMode,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
}

impl SpawnOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn stdout(mut self, mode: StdioMode) -> Self {
        self.stdout = mode;
        self
    }

    pub fn stdin(mut self, mode: StdioMode) -> Self {
        self.stdin = mode;
        self
    }

    pub fn stderr(mut self, mode: StdioMode) -> Self {
        self.stderr = mode;
        self
    }
}

/// Handles created by `op_spawn`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildInfo {
    pub rid: Handle,
    pub pid: u32,
    pub stdin_rid: Option<Handle>,
    pub stdout_rid: Option<Handle>,
    pub stderr_rid: Option<Handle>,
}

/// How a child exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus {
    pub success: bool,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ProcessStatus {
    fn from(status: ExitStatus) -> Self {
        Self {
            success: status.success(),
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// A spawned child
pub struct ProcessResource {
    child: Child,
    pid: u32,
}

impl ProcessResource {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessStatus>> {
        Ok(self.child.try_wait()?.map(ProcessStatus::from))
    }
}

impl Drop for ProcessResource {
    /// A closed handle can no longer be waited on, so a child that is still
    /// running is killed and reaped here rather than left as a zombie
    fn drop(&mut self) {
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            Ok(None) => match self.child.kill().and_then(|_| self.child.wait()) {
                Ok(status) => log::debug!("process: pid {} killed on close ({})", self.pid, status),
                Err(e) => log::warn!("process: failed to reap pid {} on close: {}", self.pid, e),
            },
            Err(e) => log::warn!("process: failed to check pid {} on close: {}", self.pid, e),
        }
    }
}

/// One end of a child's stdio
pub enum PipeResource {
    Stdin(ChildStdin),
    Stdout(ChildStdout),
    Stderr(ChildStderr),
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl PipeResource {
    pub fn fd(&self) -> RawFd {
        match self {
            PipeResource::Stdin(p) => p.as_raw_fd(),
            PipeResource::Stdout(p) => p.as_raw_fd(),
            PipeResource::Stderr(p) => p.as_raw_fd(),
        }
    }

    pub(crate) fn read(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = match self {
            PipeResource::Stdout(p) => p.read(&mut buf)?,
            PipeResource::Stderr(p) => p.read(&mut buf)?,
            // Same failure the OS gives for reading a write-only descriptor
            PipeResource::Stdin(_) => return Err(io::Error::from_raw_os_error(libc::EBADF)),
        };
        buf.truncate(n);
        Ok(buf)
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            PipeResource::Stdin(p) => p.write(data),
            _ => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }
}

// =============================================================================
// Operations
// =============================================================================

fn register_pipe(rt: &Runtime, pipe: PipeResource) -> OpResult<Handle> {
    set_nonblocking(pipe.fd())?;
    rt.register(Payload::Pipe(pipe))
}

pub(crate) fn spawn(rt: &Runtime, options: &SpawnOptions) -> OpResult<ChildInfo> {
    let mut command = Command::new(&options.command);
    command.args(&options.args);
    if options.clear_env {
        command.env_clear();
    }
    command.envs(options.env.iter().map(|(k, v)| (k, v)));
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }
    command
        .stdin(options.stdin.to_stdio())
        .stdout(options.stdout.to_stdio())
        .stderr(options.stderr.to_stdio());

    let mut child = command.spawn()?;
    let pid = child.id();
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let rid = rt.register(Payload::Process(ProcessResource { child, pid }))?;
    let stdin_rid = stdin
        .map(|p| register_pipe(rt, PipeResource::Stdin(p)))
        .transpose()?;
    let stdout_rid = stdout
        .map(|p| register_pipe(rt, PipeResource::Stdout(p)))
        .transpose()?;
    let stderr_rid = stderr
        .map(|p| register_pipe(rt, PipeResource::Stderr(p)))
        .transpose()?;

    log::debug!("process: spawned '{}' pid {} as handle {}", options.command, pid, rid);
    Ok(ChildInfo {
        rid,
        pid,
        stdin_rid,
        stdout_rid,
        stderr_rid,
    })
}

/// Wait for the child to exit, re-checking at the configured interval
pub(crate) async fn status(rt: &Runtime, rid: Handle) -> OpResult<ProcessStatus> {
    let interval = rt.config().process.poll_interval();
    loop {
        let exited = rt.with_payload(rid, |payload| match payload {
            Payload::Process(p) => Ok(p.try_wait()?),
            other => Err(Runtime::wrong_kind(rid, other.kind(), "op_process_status")),
        })?;
        match exited {
            Some(status) => return Ok(status),
            None => rt.sleep(interval).await,
        }
    }
}

pub(crate) fn kill(pid: i32, signal_name: &str) -> OpResult<()> {
    let signal = super::signal::parse_signal(signal_name)?;
    signal::kill(Pid::from_raw(pid), signal)?;
    Ok(())
}
