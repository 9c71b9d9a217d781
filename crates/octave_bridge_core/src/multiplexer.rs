//! Command/response multiplexer.
//!
//! Commands are written to the REPL one at a time, strictly in submission order. The
//! primary output is accumulated until the classifier sees a complete reply, which then
//! resolves the oldest outstanding request. The diagnostic stream is scanned separately
//! for stop banners, which are delivered as notifications and never touch the queue.

use crate::line_buffer::LineBuffer;
use crate::response::{is_complete, PromptMode, Reply};
use crate::session::{ExitReport, ProcessSession, SessionControl, SessionInput, SessionStreams};
use crate::stop_message::{is_stop_message, StopNotification};
use crate::{BridgeError, Result};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument};

const READ_CHUNK_SIZE: usize = 8 * 1024;
/// Diagnostic lines kept while waiting for a stop banner.
const MAX_DIAGNOSTIC_LINES: usize = 1024;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type Responder = oneshot::Sender<Result<Reply>>;

struct PendingRequest {
    command: Option<String>,
    responder: Responder,
}

/// Asynchronous events from the REPL, one channel per kind.
#[derive(Debug)]
pub struct Notifications {
    pub stops: mpsc::UnboundedReceiver<StopNotification>,
    pub exit: watch::Receiver<Option<ExitReport>>,
}

pub struct Multiplexer {
    requests: mpsc::UnboundedSender<PendingRequest>,
    mode: watch::Sender<PromptMode>,
    closed: watch::Receiver<Option<String>>,
    control: SessionControl,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("pid", &self.control.pid())
            .field("mode", &*self.mode.borrow())
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

impl Multiplexer {
    /// Take over a session's streams and start serving requests.
    pub fn attach(mut session: ProcessSession, span: tracing::Span) -> Result<(Self, Notifications)> {
        let streams = session.take_streams()?;
        Ok(Self::start(streams, session.control().clone(), span))
    }

    /// Serve requests over arbitrary streams with no process behind them.
    pub fn from_streams(streams: SessionStreams, span: tracing::Span) -> (Self, Notifications) {
        Self::start(streams, SessionControl::detached(), span)
    }

    fn start(
        streams: SessionStreams,
        control: SessionControl,
        span: tracing::Span,
    ) -> (Self, Notifications) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (mode_tx, mode_rx) = watch::channel(PromptMode::default());
        let (closed_tx, closed_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();

        let primary = PrimaryChannel {
            input: streams.input,
            requests: request_rx,
            mode: mode_rx,
            control: control.clone(),
            closed: closed_tx,
            queue: VecDeque::new(),
            in_flight: None,
            unclaimed: None,
            buffer: LineBuffer::new(),
            prompt_tail: false,
        };
        let primary_task = tokio::spawn(primary.run(streams.stdout).instrument(span.clone()));
        let diagnostic_task =
            tokio::spawn(diagnostic_loop(streams.stderr, stop_tx).instrument(span));

        let notifications = Notifications {
            stops: stop_rx,
            exit: control.exit_watch(),
        };
        let multiplexer = Self {
            requests: request_tx,
            mode: mode_tx,
            closed: closed_rx,
            control,
            tasks: vec![primary_task, diagnostic_task],
        };
        (multiplexer, notifications)
    }

    /// Queue a command and wait for its reply. `None` writes nothing and waits for
    /// whatever the REPL prints unprompted (its startup banner).
    pub async fn request(&self, command: Option<&str>) -> Result<Reply> {
        if let Some(reason) = self.closed_reason() {
            return Err(BridgeError::terminated(reason));
        }
        // One command, one prompt: an embedded line break would desynchronize the queue.
        if let Some(command) = command.filter(|c| c.contains(['\n', '\r'])) {
            return Err(BridgeError::InvalidCommand(format!(
                "command spans several lines: {command:?}"
            )));
        }
        debug!(command = command.unwrap_or("<flush>"), "Queueing request");

        let (responder, reply) = oneshot::channel();
        let pending = PendingRequest {
            command: command.map(str::to_string),
            responder,
        };
        self.requests
            .send(pending)
            .map_err(|_| BridgeError::terminated(self.closed_reason_or_default()))?;

        reply
            .await
            .map_err(|_| BridgeError::terminated(self.closed_reason_or_default()))?
    }

    pub async fn send(&self, command: &str) -> Result<Reply> {
        self.request(Some(command)).await
    }

    pub fn mode(&self) -> PromptMode {
        *self.mode.borrow()
    }

    /// Select which prompt completes the next replies.
    pub fn set_mode(&self, mode: PromptMode) {
        let previous = self.mode.send_replace(mode);
        if previous != mode {
            debug!(?previous, ?mode, "Prompt mode changed");
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    pub fn closed_reason(&self) -> Option<String> {
        self.closed.borrow().clone()
    }

    fn closed_reason_or_default(&self) -> String {
        self.closed_reason()
            .unwrap_or_else(|| "bridge stopped".to_string())
    }

    /// Kill the process and wait until every outstanding request has been rejected.
    ///
    /// Needs only a shared reference, so requests still awaiting a reply on other
    /// tasks cannot keep the process alive.
    pub async fn kill(&self) {
        if self.control.pid().is_none() {
            return;
        }
        self.control.kill();
        let mut closed = self.closed.clone();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, closed.wait_for(Option::is_some))
            .await
            .is_err()
        {
            warn!("Octave session did not close in time");
        }
    }

    /// [`Multiplexer::kill`], then stop the reader tasks.
    pub async fn shutdown(mut self) {
        self.kill().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if !self.tasks.is_empty() && self.control.pid().is_some() {
            self.control.kill();
        }
    }
}

/// Request queue plus primary-output state; owned by a single task.
struct PrimaryChannel {
    input: SessionInput,
    requests: mpsc::UnboundedReceiver<PendingRequest>,
    mode: watch::Receiver<PromptMode>,
    control: SessionControl,
    closed: watch::Sender<Option<String>>,
    queue: VecDeque<PendingRequest>,
    in_flight: Option<Responder>,
    /// Complete output that arrived while nothing was in flight.
    unclaimed: Option<Reply>,
    buffer: LineBuffer,
    /// The last reply ended on a prompt whose trailing blanks had not arrived yet.
    prompt_tail: bool,
}

impl PrimaryChannel {
    async fn run<R: AsyncRead + Unpin>(mut self, mut stdout: R) {
        let mut chunk = vec![0_u8; READ_CHUNK_SIZE];
        let mut accepting = true;

        let reason = loop {
            tokio::select! {
                request = self.requests.recv(), if accepting => match request {
                    Some(request) => {
                        self.queue.push_back(request);
                        self.dispatch().await;
                    }
                    None => accepting = false,
                },
                read = stdout.read(&mut chunk) => match read {
                    Ok(0) => break "output stream closed".to_string(),
                    Ok(n) => {
                        self.on_chunk(&chunk[..n]);
                        self.dispatch().await;
                    }
                    Err(e) => break format!("output stream failed: {e}"),
                },
            }
        };

        self.close(reason).await;
    }

    /// Send the next queued command if nothing is in flight.
    async fn dispatch(&mut self) {
        while self.in_flight.is_none() {
            let Some(request) = self.queue.pop_front() else {
                return;
            };

            if let Err(e) = self.input.ensure_live() {
                let _ = request.responder.send(Err(e));
                continue;
            }

            let written = match &request.command {
                // A flush claims output the REPL printed on its own, e.g. the banner.
                None => match self.unclaimed.take() {
                    Some(reply) => {
                        let _ = request.responder.send(Ok(reply));
                        continue;
                    }
                    None => Ok(()),
                },
                Some(command) => {
                    if self.unclaimed.take().is_some() {
                        debug!("Discarding unsolicited output");
                    }
                    debug!(command = %command, "Writing command");
                    self.input.write_line(command).await
                }
            };

            match written {
                Ok(()) => self.in_flight = Some(request.responder),
                Err(e) => {
                    warn!("Failed to dispatch command: {e}");
                    let _ = request.responder.send(Err(e));
                }
            }
        }
    }

    fn on_chunk(&mut self, chunk: &[u8]) {
        trace!(bytes = chunk.len(), raw = %String::from_utf8_lossy(chunk), "Primary chunk");
        let chunk = if self.prompt_tail {
            // Blanks still owed by the prompt that completed the previous reply.
            let start = chunk
                .iter()
                .position(|b| !matches!(b, b' ' | b'\t'))
                .unwrap_or(chunk.len());
            if start < chunk.len() {
                self.prompt_tail = false;
            }
            &chunk[start..]
        } else {
            chunk
        };
        if chunk.is_empty() {
            return;
        }
        self.buffer.push(chunk);

        let mode = *self.mode.borrow();
        let view = self.buffer.view();
        if !is_complete(&view, mode) {
            return;
        }
        self.prompt_tail = view
            .last()
            .is_some_and(|partial| !partial.is_empty() && !partial.ends_with(char::is_whitespace));

        let reply = Reply::new(self.buffer.take());
        debug!(?mode, lines = ?reply.lines, "Reply complete");
        match self.in_flight.take() {
            Some(responder) => {
                if responder.send(Ok(reply)).is_err() {
                    debug!("Requester went away before its reply arrived");
                }
            }
            None => {
                debug!("Holding unsolicited output for the next flush");
                self.unclaimed = Some(reply);
            }
        }
    }

    /// Reject everything outstanding and refuse new requests.
    async fn close(mut self, reason: String) {
        let reason = match self.control.exit_report() {
            Some(report) => format!("{reason}; process {report}"),
            None => reason,
        };
        warn!(%reason, "Octave session closed");
        if !self.buffer.is_empty() {
            debug!(lines = ?self.buffer.take(), "Discarding incomplete reply");
        }

        self.closed.send_replace(Some(reason.clone()));
        self.requests.close();

        let mut rejected = 0_usize;
        let in_flight = self.in_flight.take();
        let queued = self.queue.drain(..).map(|p| p.responder);
        let mut late = Vec::new();
        while let Ok(pending) = self.requests.try_recv() {
            late.push(pending.responder);
        }
        for responder in in_flight.into_iter().chain(queued).chain(late) {
            let _ = responder.send(Err(BridgeError::terminated(reason.clone())));
            rejected += 1;
        }
        if rejected > 0 {
            debug!(rejected, "Rejected outstanding requests");
        }
    }
}

async fn diagnostic_loop<R: AsyncRead + Unpin>(
    mut stderr: R,
    stops: mpsc::UnboundedSender<StopNotification>,
) {
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0_u8; READ_CHUNK_SIZE];

    loop {
        let n = match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Diagnostic stream failed: {e}");
                break;
            }
        };
        trace!(bytes = n, raw = %String::from_utf8_lossy(&chunk[..n]), "Diagnostic chunk");
        buffer.push(&chunk[..n]);

        if is_stop_message(&buffer.view()) {
            let mut lines = buffer.take();
            // The trailing blank line only marks the end of the banner.
            lines.pop();
            let stop = StopNotification::parse(&lines);
            debug!(kind = ?stop.kind, frames = stop.frames.len(), "Stop notification");
            if stops.send(stop).is_err() {
                debug!("No listener for stop notifications");
            }
        } else {
            buffer.keep_last(MAX_DIAGNOSTIC_LINES);
        }
    }
    debug!("Diagnostic stream closed");
}
