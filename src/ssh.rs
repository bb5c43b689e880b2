use std::{io, process::ExitStatus, process::Stdio};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
};
use tracing::{debug, warn};

use crate::error::{TetherError, TetherResult};

/// Starts the external tunnel command
pub trait Launcher {
    type Process: TunnelProcess;

    /// Launch `args[0]` with the remaining arguments
    fn launch(&self, args: &[String]) -> TetherResult<Self::Process>;
}

/// Handle to one running tunnel process.
///
/// Output from stdout and stderr arrives as one stream of lines. The exit code is
/// `None` until the process has been reaped; a process killed by a signal reports
/// the negated signal number.
#[allow(async_fn_in_trait)]
pub trait TunnelProcess {
    /// Process identifier
    fn id(&self) -> Option<u32>;

    /// Next line of combined output, `None` once all output is closed.
    ///
    /// Must be cancel safe: dropping the future loses no data.
    async fn next_line(&mut self) -> io::Result<Option<String>>;

    /// Non-blocking exit check
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> io::Result<i32>;

    /// Kill the process outright
    fn kill(&mut self) -> io::Result<()>;

    /// Ask the process to exit
    fn terminate(&mut self) -> io::Result<()>;

    fn exit_code(&self) -> Option<i32>;
}

/// Launches real processes with tokio
#[derive(Debug, Clone, Default)]
pub struct SshLauncher;

impl Launcher for SshLauncher {
    type Process = SshProcess;

    fn launch(&self, args: &[String]) -> TetherResult<SshProcess> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| TetherError::Launch("empty command line".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Starting command: {:?}", cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| TetherError::Launch(format!("Failed to start {program}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TetherError::Launch("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TetherError::Launch("stderr was not captured".to_string()))?;

        Ok(SshProcess {
            pid: child.id(),
            child,
            stdout: LineReader::new(stdout),
            stderr: LineReader::new(stderr),
            exit_code: None,
        })
    }
}

/// Buffered line reader that keeps partial lines across cancelled reads
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    closed: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
            closed: false,
        }
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            self.closed = true;
            if self.buf.is_empty() {
                return Ok(None);
            }
        }
        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        Ok(Some(line))
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// A running ssh process with merged output
pub struct SshProcess {
    pid: Option<u32>,
    child: Child,
    stdout: LineReader<ChildStdout>,
    stderr: LineReader<ChildStderr>,
    exit_code: Option<i32>,
}

impl TunnelProcess for SshProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if self.stdout.closed && self.stderr.closed {
                return Ok(None);
            }
            let line = tokio::select! {
                line = self.stdout.next_line(), if !self.stdout.closed => line?,
                line = self.stderr.next_line(), if !self.stderr.closed => line?,
            };
            if line.is_some() {
                return Ok(line);
            }
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        if self.exit_code.is_none()
            && let Some(status) = self.child.try_wait()?
        {
            self.exit_code = Some(exit_code(status));
        }
        Ok(self.exit_code)
    }

    async fn wait(&mut self) -> io::Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let code = exit_code(self.child.wait().await?);
        self.exit_code = Some(code);
        Ok(code)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::{
            sys::signal::{Signal, kill},
            unistd::Pid,
        };

        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(io::Error::other)?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

impl Drop for SshProcess {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            // `kill_on_drop` follows up with SIGKILL
            let _ = self.terminate();
        }
    }
}

/// Run a command to completion with inherited output and return its exit code
pub async fn run_command(args: &[String]) -> TetherResult<i32> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| TetherError::Launch("empty command line".to_string()))?;

    debug!("Running command: {}", args.join(" "));

    let status = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| TetherError::Launch(format!("Failed to run {program}: {e}")))?;

    if !status.success() {
        warn!("{} exited with status: {}", program, status);
    }
    Ok(exit_code(status))
}
