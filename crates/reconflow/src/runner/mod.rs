//! Child process supervision for external tools.

use std::{
    collections::{BTreeMap, VecDeque},
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    sync::mpsc,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{error::LaunchError, parser::LineAssembler};

const LINE_CHANNEL_CAPACITY: usize = 1024;
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Written to the child's stdin, which is closed afterwards.
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, payload: Vec<u8>) -> Self {
        self.stdin = Some(payload);
        self
    }
}

/// A running (or finished) child process with its merged output stream.
///
/// Stdout and stderr are drained by dedicated reader tasks for the whole life
/// of the process, so a slow consumer can never leave the child blocked on a
/// full pipe while it is being terminated.
#[derive(Debug)]
pub struct ProcessHandle {
    program: String,
    pid: Option<u32>,
    child: Child,
    lines: mpsc::Receiver<(OutputStream, String)>,
    pending: VecDeque<(OutputStream, String)>,
    status: Option<ExitStatus>,
}

impl ProcessHandle {
    pub fn start(spec: &CommandSpec) -> Result<Self, LaunchError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group so termination reaches helpers the tool forks.
        #[cfg(unix)]
        cmd.process_group(0);

        info!(program = %spec.program, args = ?spec.args, "audit: launching external tool");
        let mut child = cmd
            .spawn()
            .map_err(|e| LaunchError::from_spawn(&spec.program, e))?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, OutputStream::Stderr, tx));
        }
        if let (Some(mut stdin), Some(payload)) = (child.stdin.take(), spec.stdin.clone()) {
            let program = spec.program.clone();
            tokio::spawn(async move {
                // The tool may exit before reading everything; that is its call.
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(%program, error = %e, "stdin closed early");
                }
                let _ = stdin.shutdown().await;
            });
        }

        Ok(Self {
            program: spec.program.clone(),
            pid,
            child,
            lines: rx,
            pending: VecDeque::new(),
            status: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next output line from either pipe; `None` once both pipes are closed.
    pub async fn next_line(&mut self) -> Option<(OutputStream, String)> {
        if let Some(line) = self.pending.pop_front() {
            return Some(line);
        }
        self.lines.recv().await
    }

    /// Waits for the process to exit. `None` means it was killed by a signal.
    pub async fn wait(&mut self) -> io::Result<Option<i32>> {
        if let Some(status) = self.status {
            return Ok(status.code());
        }
        let status = self.child.wait().await?;
        self.status = Some(status);
        Ok(status.code())
    }

    pub fn has_exited(&mut self) -> bool {
        if self.status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.status = Some(status);
                true
            }
            _ => false,
        }
    }

    /// Asks the process to stop, then kills it if it is still alive after
    /// `grace`. Output arriving meanwhile is kept for [`Self::next_line`].
    /// Calling this on an exited process is a no-op.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<Option<i32>> {
        if self.has_exited() {
            return Ok(self.status.and_then(|s| s.code()));
        }

        self.signal_graceful();
        let deadline = sleep(grace);
        tokio::pin!(deadline);
        let mut lines_open = true;

        loop {
            tokio::select! {
                status = self.child.wait() => {
                    let status = status?;
                    self.status = Some(status);
                    return Ok(status.code());
                }
                line = self.lines.recv(), if lines_open => match line {
                    Some(line) => self.pending.push_back(line),
                    None => lines_open = false,
                },
                _ = &mut deadline => break,
            }
        }

        warn!(program = %self.program, pid = ?self.pid, "grace period elapsed, killing");
        self.signal_kill();
        let status = match timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                self.child.start_kill()?;
                self.child.wait().await?
            }
        };
        self.status = Some(status);
        Ok(status.code())
    }

    #[cfg(unix)]
    fn signal_graceful(&mut self) {
        self.signal_group(nix::sys::signal::Signal::SIGTERM);
    }

    #[cfg(not(unix))]
    fn signal_graceful(&mut self) {
        let _ = self.child.start_kill();
    }

    #[cfg(unix)]
    fn signal_kill(&mut self) {
        self.signal_group(nix::sys::signal::Signal::SIGKILL);
        let _ = self.child.start_kill();
    }

    #[cfg(not(unix))]
    fn signal_kill(&mut self) {
        let _ = self.child.start_kill();
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) {
        use nix::{sys::signal::killpg, unistd::Pid};

        let Some(pid) = self.pid else { return };
        if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
            // ESRCH: the group is already gone.
            debug!(program = %self.program, pid, error = %e, ?signal, "signal not delivered");
        }
    }
}

async fn pump<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut assembler = LineAssembler::default();
    let mut chunk = vec![0u8; READ_CHUNK];
    // Keep reading after the receiver is gone so the child never blocks.
    let mut forwarding = true;

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(?stream, error = %e, "pipe read failed");
                break;
            }
        };
        for line in assembler.push(&chunk[..n]) {
            if forwarding && tx.send((stream, line)).await.is_err() {
                forwarding = false;
            }
        }
    }
    if let Some(line) = assembler.finish() {
        if forwarding {
            let _ = tx.send((stream, line)).await;
        }
    }
}
