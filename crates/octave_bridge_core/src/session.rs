//! Process session wrapper: owns the spawned REPL's stdin/stdout/stderr and its exit.
//!
//! A session that has no process yet ([`ProcessSession::dummy`]) behaves like a real
//! one whose input reports "used before initialized" and whose output stays silent,
//! so the multiplexer never branches on presence.

use crate::{BridgeError, Result};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::process::Command;
use tokio::sync::{watch, Notify};
use tracing::{info, warn, Instrument};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// How the REPL process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => write!(f, "exited with unknown status"),
        }
    }
}

/// Write side of the REPL's stdin.
pub enum SessionInput {
    Pipe(BoxedWriter),
    Dummy,
}

impl fmt::Debug for SessionInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe(_) => f.write_str("SessionInput::Pipe"),
            Self::Dummy => f.write_str("SessionInput::Dummy"),
        }
    }
}

impl SessionInput {
    pub fn pipe<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::Pipe(Box::new(writer))
    }

    /// Fails (and logs) when there is no process behind this input.
    pub fn ensure_live(&self) -> Result<()> {
        match self {
            Self::Pipe(_) => Ok(()),
            Self::Dummy => {
                warn!("Octave session is being used before initialized");
                Err(BridgeError::NotInitialized)
            }
        }
    }

    /// Write one command followed by a newline.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        match self {
            Self::Pipe(writer) => {
                let mut framed = String::with_capacity(line.len() + 1);
                framed.push_str(line);
                framed.push('\n');
                writer.write_all(framed.as_bytes()).await?;
                writer.flush().await?;
                Ok(())
            }
            Self::Dummy => self.ensure_live(),
        }
    }
}

/// Output of a session with no process: never yields, never closes.
struct Silent;

impl AsyncRead for Silent {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Pending
    }
}

/// The three raw handles, handed to the multiplexer exactly once.
pub struct SessionStreams {
    pub input: SessionInput,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
}

impl SessionStreams {
    pub fn new<W, R, E>(stdin: W, stdout: R, stderr: E) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            input: SessionInput::pipe(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }
}

/// Lifecycle handle that stays valid after the streams are taken.
#[derive(Debug, Clone)]
pub struct SessionControl {
    pid: Option<u32>,
    kill: Option<Arc<Notify>>,
    exit: watch::Receiver<Option<ExitReport>>,
}

impl SessionControl {
    /// Control for streams that have no process behind them (tests, dummy).
    pub fn detached() -> Self {
        let (_tx, exit) = watch::channel(None);
        Self {
            pid: None,
            kill: None,
            exit,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn kill(&self) {
        match &self.kill {
            Some(kill) => kill.notify_one(),
            None => warn!("Octave session is being used before initialized"),
        }
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitReport>> {
        self.exit.clone()
    }

    pub fn exit_report(&self) -> Option<ExitReport> {
        *self.exit.borrow()
    }
}

pub struct ProcessSession {
    input: Option<SessionInput>,
    stdout: Option<BoxedReader>,
    stderr: Option<BoxedReader>,
    control: SessionControl,
}

impl fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSession")
            .field("pid", &self.control.pid)
            .field("input", &self.input)
            .field("streams_taken", &self.stdout.is_none())
            .finish()
    }
}

impl ProcessSession {
    /// Start the REPL. Must be called inside a tokio runtime: a task watches for exit
    /// and reports the exit code and signal.
    pub fn spawn(
        executable: &str,
        args: &[String],
        options: SpawnOptions,
        span: tracing::Span,
    ) -> Result<Self> {
        let mut command = Command::new(executable);
        command
            .args(args)
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| BridgeError::Spawn {
            executable: executable.to_string(),
            source,
        })?;

        let missing = |name: &str| {
            BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("spawned process has no {name} pipe"),
            ))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let pid = child.id();
        if let Some(pid) = pid {
            span.record("pid", pid);
        }

        let kill = Arc::new(Notify::new());
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_signal = kill.clone();
        span.in_scope(|| info!(args = ?args, "Spawned octave session"));

        tokio::spawn(
            async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = kill_signal.notified() => {
                        if let Err(e) = child.start_kill() {
                            warn!("Failed to kill octave session: {e}");
                        }
                        child.wait().await
                    }
                };
                let report = match status {
                    Ok(status) => ExitReport::from(status),
                    Err(e) => {
                        warn!("Failed to wait for octave session: {e}");
                        ExitReport {
                            code: None,
                            signal: None,
                        }
                    }
                };
                info!(code = ?report.code, signal = ?report.signal, "Octave session {report}");
                exit_tx.send_replace(Some(report));
            }
            .instrument(span),
        );

        Ok(Self {
            input: Some(SessionInput::pipe(stdin)),
            stdout: Some(Box::new(stdout)),
            stderr: Some(Box::new(stderr)),
            control: SessionControl {
                pid,
                kill: Some(kill),
                exit: exit_rx,
            },
        })
    }

    /// A session with no process. Writes are reported and refused.
    pub fn dummy() -> Self {
        Self {
            input: Some(SessionInput::Dummy),
            stdout: Some(Box::new(Silent)),
            stderr: Some(Box::new(Silent)),
            control: SessionControl::detached(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    pub fn control(&self) -> &SessionControl {
        &self.control
    }

    pub fn kill(&self) {
        self.control.kill();
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitReport>> {
        self.control.exit_watch()
    }

    /// Write one line to the process input, while the session still owns it.
    pub async fn write(&mut self, line: &str) -> Result<()> {
        match self.input.as_mut() {
            Some(input) => input.write_line(line).await,
            None => Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "process input is owned by the multiplexer",
            ))),
        }
    }

    /// Hand the raw handles over. Fails if they were already taken.
    pub fn take_streams(&mut self) -> Result<SessionStreams> {
        match (self.input.take(), self.stdout.take(), self.stderr.take()) {
            (Some(input), Some(stdout), Some(stderr)) => Ok(SessionStreams {
                input,
                stdout,
                stderr,
            }),
            _ => Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "session streams were already taken",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    #[tokio::test]
    async fn dummy_session_refuses_writes() {
        let mut session = ProcessSession::dummy();
        assert_eq!(session.pid(), None);

        let err = session.write("x = 1").await.expect_err("dummy write must fail");
        assert!(matches!(err, BridgeError::NotInitialized));

        // kill is report-and-ignore
        session.kill();
    }

    #[tokio::test]
    async fn dummy_output_stays_silent() {
        let mut session = ProcessSession::dummy();
        let mut streams = session.take_streams().expect("streams available once");
        let mut buf = [0_u8; 8];
        let read = timeout(Duration::from_millis(20), streams.stdout.read(&mut buf)).await;
        assert!(read.is_err(), "dummy stdout must not yield or close");
        assert!(session.take_streams().is_err());
    }

    #[tokio::test]
    async fn write_line_appends_newline() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut input = SessionInput::pipe(client);
        input.write_line("dbstop foo 3").await.expect("write should succeed");

        let mut buf = vec![0_u8; 13];
        server.read_exact(&mut buf).await.expect("read should succeed");
        assert_eq!(buf, b"dbstop foo 3\n");
    }

    #[test]
    fn exit_report_display() {
        let exited = ExitReport {
            code: Some(1),
            signal: None,
        };
        assert_eq!(exited.to_string(), "exited with code 1");
        let killed = ExitReport {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.to_string(), "killed by signal 9");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_session_echoes_and_reports_exit() {
        let mut session = ProcessSession::spawn(
            "sh",
            &["-c".to_string(), "read line; echo \"got $line\"; exit 3".to_string()],
            SpawnOptions::default(),
            tracing::Span::none(),
        )
        .expect("should spawn test process");
        assert!(session.pid().is_some());

        session.write("hello").await.expect("write should succeed");
        let mut exit = session.exit_watch();
        let mut streams = session.take_streams().expect("streams available once");

        let mut out = String::new();
        streams
            .stdout
            .read_to_string(&mut out)
            .await
            .expect("stdout should be readable");
        assert_eq!(out, "got hello\n");

        let report = timeout(Duration::from_secs(5), exit.wait_for(Option::is_some))
            .await
            .expect("exit should be reported")
            .expect("watch sender alive until report")
            .expect("report present");
        assert_eq!(report.code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_terminates_process() {
        let session = ProcessSession::spawn(
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
            SpawnOptions::default(),
            tracing::Span::none(),
        )
        .expect("should spawn test process");

        let mut exit = session.control().exit_watch();
        session.kill();

        let report = timeout(Duration::from_secs(5), exit.wait_for(Option::is_some))
            .await
            .expect("exit should be reported")
            .expect("watch sender alive until report")
            .expect("report present");
        assert_eq!(report.code, None);
        assert_eq!(report.signal, Some(9));
    }

    #[test]
    fn spawn_failure_names_executable() {
        let runtime = tokio::runtime::Runtime::new().expect("runtime should initialize");
        runtime.block_on(async {
            let err = ProcessSession::spawn(
                "/definitely/not/octave",
                &[],
                SpawnOptions::default(),
                tracing::Span::none(),
            )
            .expect_err("spawn must fail");
            assert!(err.to_string().contains("/definitely/not/octave"));
        });
    }
}
