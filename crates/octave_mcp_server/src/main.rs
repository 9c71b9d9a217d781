use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use octave_bridge_core::{
    ops::{breakpoints, control, evaluate, setup, symbols, variables},
    BridgeConfig, BridgeError, ExitReport, Multiplexer, Notifications, Reply, StopNotification,
};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tracing_subscriber::EnvFilter;

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a stop banner may trail the debug prompt that announced it.
const WAIT_FOR_STOPPED_TIMEOUT: Duration = Duration::from_secs(2);
const STEP_STOPPED_TIMEOUT: Duration = Duration::from_millis(300);
const STOPPED_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct OctaveLaunchParams {
    #[serde(default)]
    executable: Option<String>,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct OctaveSetBreakpointsParams {
    function: String,
    lines: Vec<u32>,
    /// Clear the function's existing breakpoints first.
    #[serde(default = "default_true")]
    replace: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct OctaveClearBreakpointsParams {
    function: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct OctaveRunParams {
    /// Function or script to call, e.g. `main` or `solve(3)`.
    target: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct OctaveVariablesParams {
    #[serde(default = "default_true")]
    include_values: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct OctaveEvaluateParams {
    expression: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct OctaveWhichParams {
    names: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct OctaveCommandParams {
    /// Raw REPL input. Omit to wait for output the REPL prints on its own.
    #[serde(default)]
    command: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Shared handles to one running REPL. Tools work on a clone so the manager lock is
/// never held while a request is outstanding.
#[derive(Clone)]
struct OctaveSession {
    mux: Arc<Multiplexer>,
    last_stop: Arc<Mutex<Option<StopNotification>>>,
    stopped_seq: Arc<AtomicU64>,
    /// The last reply ended at the debug prompt, or a stop arrived since.
    debugging: Arc<AtomicBool>,
    exit: watch::Receiver<Option<ExitReport>>,
}

impl OctaveSession {
    async fn stop_info(&self) -> Option<Value> {
        let stopped = self.last_stop.lock().await;
        stopped.as_ref().map(stop_summary)
    }

    async fn clear_stop(&self) {
        let mut stopped = self.last_stop.lock().await;
        *stopped = None;
    }

    async fn wait_for_stop_after_seq(
        &self,
        before_seq: u64,
        wait_timeout: Duration,
    ) -> Result<StopNotification, String> {
        wait_for_stop_after_seq(&self.last_stop, &self.stopped_seq, before_seq, wait_timeout).await
    }

    fn note_reply(&self, reply: &Reply) {
        self.debugging.store(reply.in_debug_mode(), Ordering::SeqCst);
    }

    fn state(&self) -> &'static str {
        resolved_state(self.mux.is_closed(), self.debugging.load(Ordering::SeqCst))
    }

    fn exit_report(&self) -> Option<ExitReport> {
        *self.exit.borrow()
    }
}

struct SessionManager {
    session: Option<OctaveSession>,
    stop_task: Option<JoinHandle<()>>,
}

impl SessionManager {
    fn new() -> Self {
        Self {
            session: None,
            stop_task: None,
        }
    }
}

#[derive(Clone)]
struct OctaveMcpServer {
    tool_router: ToolRouter<Self>,
    session: Arc<Mutex<SessionManager>>,
}

/// Record each stop. The prompt mode is left alone: after a stop the next reply may
/// still end at either prompt, e.g. a raw `dbquit`.
async fn stop_loop(
    mut stops: mpsc::UnboundedReceiver<StopNotification>,
    debugging: Arc<AtomicBool>,
    last_stop: Arc<Mutex<Option<StopNotification>>>,
    stopped_seq: Arc<AtomicU64>,
) {
    while let Some(stop) = stops.recv().await {
        tracing::info!(
            kind = ?stop.kind,
            frame = ?stop.top_frame().map(|f| (&f.name, f.line)),
            "Octave stopped"
        );
        debugging.store(true, Ordering::SeqCst);
        {
            let mut stopped = last_stop.lock().await;
            *stopped = Some(stop);
        }
        stopped_seq.fetch_add(1, Ordering::SeqCst);
    }
    tracing::debug!("Stop notification stream closed");
}

async fn wait_for_stop_after_seq(
    last_stop: &Arc<Mutex<Option<StopNotification>>>,
    stopped_seq: &Arc<AtomicU64>,
    before_seq: u64,
    wait_timeout: Duration,
) -> Result<StopNotification, String> {
    let started_at = Instant::now();
    loop {
        if stopped_seq.load(Ordering::SeqCst) > before_seq {
            let stopped = last_stop.lock().await;
            if let Some(stop) = &*stopped {
                return Ok(stop.clone());
            }
        }

        if started_at.elapsed() >= wait_timeout {
            return Err("Timed out waiting for the next stop notification".to_string());
        }

        sleep(STOPPED_POLL_INTERVAL).await;
    }
}

fn to_mcp_error(message: impl Into<String>) -> McpError {
    McpError::internal_error(message.into(), None)
}

fn bridge_error(tool_name: &str, error: BridgeError) -> McpError {
    if error.is_terminal() {
        return to_mcp_error(format!(
            "{tool_name} failed: {error}. Call octave_terminate, then octave_launch to start a new session."
        ));
    }
    to_mcp_error(format!("{tool_name} failed: {error}"))
}

fn detached_session_error(tool_name: &str) -> McpError {
    to_mcp_error(format!(
        "{tool_name} requires a running Octave session. Call octave_launch first."
    ))
}

fn stop_summary(stop: &StopNotification) -> Value {
    json!({
        "reason": stop.kind,
        "frames": stop.frames,
        "top_frame": stop.top_frame(),
        "text": stop.lines.join("\n"),
    })
}

fn resolved_state(closed: bool, debugging: bool) -> &'static str {
    match (closed, debugging) {
        (true, _) => "exited",
        (false, true) => "stopped",
        (false, false) => "idle",
    }
}

fn reply_summary(reply: &Reply) -> Value {
    json!({
        "output": reply.body,
        "prompt": reply.prompt,
        "value": reply.shape(),
    })
}

fn launch_config(params: OctaveLaunchParams) -> BridgeConfig {
    let mut config = BridgeConfig::from_env();
    if let Some(executable) = params.executable {
        config.executable = executable;
    }
    if let Some(args) = params.args {
        config.args = args;
    }
    if let Some(cwd) = params.cwd {
        config.cwd = Some(PathBuf::from(cwd));
    }
    config
}

#[tool_router]
impl OctaveMcpServer {
    fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
            session: Arc::new(Mutex::new(SessionManager::new())),
        }
    }

    /// Clone the running session out of the manager; the lock is released on return.
    async fn session(&self, tool_name: &str) -> Result<OctaveSession, McpError> {
        let manager = self.session.lock().await;
        manager
            .session
            .clone()
            .ok_or_else(|| detached_session_error(tool_name))
    }

    fn install(
        manager: &mut SessionManager,
        mux: Multiplexer,
        notifications: Notifications,
    ) -> OctaveSession {
        let session = OctaveSession {
            mux: Arc::new(mux),
            last_stop: Arc::new(Mutex::new(None)),
            stopped_seq: Arc::new(AtomicU64::new(0)),
            debugging: Arc::new(AtomicBool::new(false)),
            exit: notifications.exit,
        };
        manager.stop_task = Some(tokio::spawn(stop_loop(
            notifications.stops,
            session.debugging.clone(),
            session.last_stop.clone(),
            session.stopped_seq.clone(),
        )));
        manager.session = Some(session.clone());
        session
    }

    #[tool(description = "Start an Octave REPL and prepare it for debugging")]
    async fn octave_launch(
        &self,
        params: Parameters<OctaveLaunchParams>,
    ) -> Result<CallToolResult, McpError> {
        let config = launch_config(params.0);
        let mut manager = self.session.lock().await;

        if manager.session.is_some() {
            return Err(to_mcp_error(
                "An Octave session is already running. Terminate it before launching again.",
            ));
        }

        // Dropping a launch that never reaches its prompt kills the process.
        let (mux, notifications) = tokio::time::timeout(LAUNCH_TIMEOUT, setup::launch(&config))
            .await
            .map_err(|_| {
                to_mcp_error(format!(
                    "octave_launch failed: no prompt from {} within {}s",
                    config.executable,
                    LAUNCH_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| bridge_error("octave_launch", e))?;
        let session = Self::install(&mut manager, mux, notifications);
        let pid = session.mux.pid();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": "idle",
            "pid": pid,
            "executable": config.executable,
        })))
    }

    #[tool(description = "Set line breakpoints in an Octave function")]
    async fn octave_set_breakpoints(
        &self,
        params: Parameters<OctaveSetBreakpointsParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.session("octave_set_breakpoints").await?;

        if params.replace {
            breakpoints::clear(&session.mux, &params.function)
                .await
                .map_err(|e| bridge_error("octave_set_breakpoints", e))?;
        }
        let accepted = breakpoints::set(&session.mux, &params.function, &params.lines)
            .await
            .map_err(|e| bridge_error("octave_set_breakpoints", e))?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "function": params.function,
            "requested": params.lines,
            "lines": accepted,
        })))
    }

    #[tool(description = "Remove all breakpoints from an Octave function")]
    async fn octave_clear_breakpoints(
        &self,
        params: Parameters<OctaveClearBreakpointsParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.session("octave_clear_breakpoints").await?;

        breakpoints::clear(&session.mux, &params.function)
            .await
            .map_err(|e| bridge_error("octave_clear_breakpoints", e))?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "function": params.function,
        })))
    }

    #[tool(description = "Call a function or script and wait until it stops or finishes")]
    async fn octave_run(
        &self,
        params: Parameters<OctaveRunParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.session("octave_run").await?;

        let before_seq = session.stopped_seq.load(Ordering::SeqCst);
        session.clear_stop().await;
        let reply = control::run(&session.mux, &params.target)
            .await
            .map_err(|e| bridge_error("octave_run", e))?;

        resume_result(&session, &reply, before_seq).await
    }

    #[tool(description = "Continue execution until the next stop or completion")]
    async fn octave_continue(&self) -> Result<CallToolResult, McpError> {
        let session = self.session("octave_continue").await?;

        let before_seq = session.stopped_seq.load(Ordering::SeqCst);
        let last_stop = session.stop_info().await;
        session.clear_stop().await;
        let reply = control::cont(&session.mux)
            .await
            .map_err(|e| bridge_error("octave_continue", e))?;

        let mut result = resume_result(&session, &reply, before_seq).await?;
        if let Some(Value::Object(map)) = result.structured_content.as_mut() {
            map.insert("last_stop".to_string(), json!(last_stop));
        }
        Ok(result)
    }

    #[tool(description = "Execute the next line in the current function")]
    async fn octave_step(&self) -> Result<CallToolResult, McpError> {
        let session = self.session("octave_step").await?;

        let before_seq = session.stopped_seq.load(Ordering::SeqCst);
        let previous = session.stop_info().await;
        let reply = control::step(&session.mux)
            .await
            .map_err(|e| bridge_error("octave_step", e))?;
        session.note_reply(&reply);

        let stop = if reply.in_debug_mode() {
            // Not every step prints a new banner; keep the previous stop in that case.
            match session
                .wait_for_stop_after_seq(before_seq, STEP_STOPPED_TIMEOUT)
                .await
            {
                Ok(stop) => Some(stop_summary(&stop)),
                Err(_) => previous,
            }
        } else {
            session.clear_stop().await;
            None
        };

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": session.state(),
            "stop": stop,
            "reply": reply_summary(&reply),
        })))
    }

    #[tool(description = "Show the call stack of the last stop")]
    async fn octave_stack(&self) -> Result<CallToolResult, McpError> {
        let session = self.session("octave_stack").await?;

        let stopped = session.last_stop.lock().await;
        let frames = stopped
            .as_ref()
            .map(|stop| json!(stop.frames))
            .unwrap_or_else(|| json!([]));

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": session.state(),
            "frames": frames,
        })))
    }

    #[tool(description = "List variables in the current scope")]
    async fn octave_variables(
        &self,
        params: Parameters<OctaveVariablesParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.session("octave_variables").await?;

        let listing = variables::list(&session.mux)
            .await
            .map_err(|e| bridge_error("octave_variables", e))?;

        let mut entries = Vec::with_capacity(listing.variables.len());
        for descriptor in &listing.variables {
            let value = if params.include_values {
                Some(
                    variables::value(&session.mux, descriptor)
                        .await
                        .map_err(|e| bridge_error("octave_variables", e))?,
                )
            } else {
                None
            };
            entries.push(json!({
                "name": descriptor.name,
                "size": descriptor.dims_text(),
                "class": descriptor.class,
                "bytes": descriptor.bytes,
                "attributes": descriptor.attributes,
                "value": value,
            }));
        }

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "variables": entries,
            "parse_error": listing.error.map(|e| e.to_string()),
        })))
    }

    #[tool(description = "Evaluate an expression in the current scope")]
    async fn octave_evaluate(
        &self,
        params: Parameters<OctaveEvaluateParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.session("octave_evaluate").await?;

        let shape = evaluate::evaluate(&session.mux, &params.expression)
            .await
            .map_err(|e| bridge_error("octave_evaluate", e))?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "result": shape.value_text(),
            "name": shape.name(),
            "value": shape,
        })))
    }

    #[tool(description = "Resolve function names to the files defining them")]
    async fn octave_which(
        &self,
        params: Parameters<OctaveWhichParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.session("octave_which").await?;

        let locations = symbols::which(&session.mux, &params.names)
            .await
            .map_err(|e| bridge_error("octave_which", e))?;
        let missing: Vec<&String> = params
            .names
            .iter()
            .filter(|name| !locations.contains_key(*name))
            .collect();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "locations": locations,
            "missing": missing,
        })))
    }

    #[tool(description = "Send one raw line to the Octave REPL and return its reply")]
    async fn octave_command(
        &self,
        params: Parameters<OctaveCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.session("octave_command").await?;

        let reply = session
            .mux
            .request(params.command.as_deref())
            .await
            .map_err(|e| bridge_error("octave_command", e))?;
        session.note_reply(&reply);

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "lines": reply.lines,
            "reply": reply_summary(&reply),
        })))
    }

    #[tool(description = "Stop the Octave REPL and end the session")]
    async fn octave_terminate(&self) -> Result<CallToolResult, McpError> {
        let (session, stop_task) = {
            let mut manager = self.session.lock().await;
            (manager.session.take(), manager.stop_task.take())
        };
        if let Some(stop_task) = stop_task {
            stop_task.abort();
        }
        let Some(session) = session else {
            return Ok(CallToolResult::structured(json!({
                "ok": true,
                "state": "detached",
            })));
        };

        // Tools still waiting on a reply hold their own handle; killing the process
        // rejects their requests.
        let mut exit = session.exit.clone();
        session.mux.kill().await;
        drop(session);
        let report = match tokio::time::timeout(
            WAIT_FOR_STOPPED_TIMEOUT,
            exit.wait_for(Option::is_some),
        )
        .await
        {
            Ok(Ok(report)) => *report,
            _ => None,
        };

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": "detached",
            "exit": report.map(|r| json!({
                "code": r.code,
                "signal": r.signal,
                "description": r.to_string(),
            })),
        })))
    }
}

/// Result of `run`/`continue`: stopped (with frames) or finished.
async fn resume_result(
    session: &OctaveSession,
    reply: &Reply,
    before_seq: u64,
) -> Result<CallToolResult, McpError> {
    session.note_reply(reply);
    if !reply.in_debug_mode() {
        session.clear_stop().await;
        return Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": session.state(),
            "reply": reply_summary(reply),
            "exit": session.exit_report().map(|r| r.to_string()),
        })));
    }

    let stop = session
        .wait_for_stop_after_seq(before_seq, WAIT_FOR_STOPPED_TIMEOUT)
        .await
        .map_err(to_mcp_error)?;

    Ok(CallToolResult::structured(json!({
        "ok": true,
        "state": "stopped",
        "stop": stop_summary(&stop),
        "reply": reply_summary(reply),
    })))
}

#[tool_handler]
impl ServerHandler for OctaveMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Octave MCP Server driving a single Octave REPL in debug mode".into(),
            ),
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("OCTAVE_BRIDGE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the MCP transport
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();

    let server = OctaveMcpServer::new();
    let transport = transport::stdio();

    tracing::info!("Starting Octave MCP Server on stdio...");

    server.serve(transport).await?.waiting().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use octave_bridge_core::{StackFrame, StopKind};

    fn breakpoint_stop(name: &str, line: u32) -> StopNotification {
        StopNotification {
            kind: StopKind::Breakpoint,
            frames: vec![StackFrame {
                id: 0,
                name: name.to_string(),
                function: name.to_string(),
                line,
                column: 0,
            }],
            lines: vec![format!("stopped in {name} at line {line}"), format!("{line}: x")],
        }
    }

    #[tokio::test]
    async fn stop_loop_records_stop_and_bumps_sequence() {
        let (tx, rx) = mpsc::unbounded_channel();
        let last_stop = Arc::new(Mutex::new(None));
        let stopped_seq = Arc::new(AtomicU64::new(0));
        let debugging = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(stop_loop(
            rx,
            debugging.clone(),
            last_stop.clone(),
            stopped_seq.clone(),
        ));

        tx.send(breakpoint_stop("foo", 3)).expect("send");
        tx.send(breakpoint_stop("bar", 8)).expect("send");
        drop(tx);
        task.await.expect("stop loop should end when the channel closes");

        assert_eq!(stopped_seq.load(Ordering::SeqCst), 2);
        assert!(debugging.load(Ordering::SeqCst));
        let stopped = last_stop.lock().await;
        assert_eq!(stopped.as_ref().map(|s| s.frames[0].line), Some(8));
    }

    #[tokio::test]
    async fn wait_for_stop_after_seq_returns_new_stop() {
        let last_stop = Arc::new(Mutex::new(Some(breakpoint_stop("foo", 3))));
        let stopped_seq = Arc::new(AtomicU64::new(3));

        let stop = wait_for_stop_after_seq(&last_stop, &stopped_seq, 2, Duration::from_millis(1))
            .await
            .expect("new stop should be returned");
        assert_eq!(stop, breakpoint_stop("foo", 3));
    }

    #[tokio::test]
    async fn wait_for_stop_after_seq_rejects_stale_stop() {
        let last_stop = Arc::new(Mutex::new(Some(breakpoint_stop("foo", 3))));
        let stopped_seq = Arc::new(AtomicU64::new(5));

        let err = wait_for_stop_after_seq(&last_stop, &stopped_seq, 5, Duration::ZERO)
            .await
            .expect_err("stale stop must not satisfy the wait");
        assert!(err.contains("Timed out"), "unexpected error: {err}");
    }

    #[test]
    fn stop_summary_reports_kind_and_top_frame() {
        let summary = stop_summary(&breakpoint_stop("solve", 12));
        assert_eq!(summary["reason"], "breakpoint");
        assert_eq!(summary["top_frame"]["name"], "solve");
        assert_eq!(summary["top_frame"]["line"], 12);
        assert_eq!(summary["frames"].as_array().map(Vec::len), Some(1));
        assert_eq!(summary["text"], "stopped in solve at line 12\n12: x");
    }

    #[test]
    fn resolved_state_follows_last_prompt() {
        assert_eq!(resolved_state(true, true), "exited");
        assert_eq!(resolved_state(false, true), "stopped");
        assert_eq!(resolved_state(false, false), "idle");
    }

    #[test]
    fn terminal_bridge_errors_suggest_relaunch() {
        let err = bridge_error("octave_step", BridgeError::terminated("output stream closed"));
        assert!(err.message.contains("octave_launch"), "{}", err.message);

        let err = bridge_error("octave_step", BridgeError::UnexpectedReply("x".to_string()));
        assert!(!err.message.contains("octave_launch"), "{}", err.message);
    }

    #[test]
    fn launch_params_override_config() {
        let config = launch_config(OctaveLaunchParams {
            executable: Some("/opt/octave/bin/octave-cli".to_string()),
            args: Some(vec!["--norc".to_string()]),
            cwd: Some("/work".to_string()),
        });
        assert_eq!(config.executable, "/opt/octave/bin/octave-cli");
        assert_eq!(config.args, vec!["--norc"]);
        assert_eq!(config.cwd, Some(PathBuf::from("/work")));
        assert_eq!(config.setup_commands.len(), 4);
    }

    #[test]
    fn command_params_schema_has_no_bare_true() {
        let schema = schemars::schema_for!(OctaveCommandParams);
        let json = serde_json::to_string(&schema).expect("schema serialization must succeed");
        assert!(
            !json.contains("\"command\":true") && !json.contains("\"command\": true"),
            "Schema contains bare 'true' for command field:\n{}",
            serde_json::to_string_pretty(&schema)
                .expect("pretty schema serialization must succeed")
        );
    }

    #[test]
    fn set_breakpoints_params_default_to_replace() {
        let params: OctaveSetBreakpointsParams =
            serde_json::from_value(json!({"function": "foo", "lines": [3, 7]}))
                .expect("params should deserialize");
        assert!(params.replace);
        assert_eq!(params.lines, vec![3, 7]);
    }

    #[tokio::test]
    async fn tools_require_a_launched_session() {
        let server = OctaveMcpServer::new();
        let err = server
            .octave_stack()
            .await
            .expect_err("stack without a session must fail");
        assert!(err.message.contains("octave_launch"), "{}", err.message);

        let result = server.octave_terminate().await.expect("terminate is idempotent");
        assert_eq!(
            result.structured_content.as_ref().map(|v| v["state"].clone()),
            Some(json!("detached"))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_is_not_blocked_by_a_hung_request() {
        use octave_bridge_core::{ProcessSession, SpawnOptions};

        // Reads commands forever and never prints a prompt.
        let process = ProcessSession::spawn(
            "sh",
            &["-c".to_string(), "while read -r line; do :; done".to_string()],
            SpawnOptions::default(),
            tracing::Span::none(),
        )
        .expect("should spawn test process");
        let (mux, notifications) =
            Multiplexer::attach(process, tracing::Span::none()).expect("streams available");

        let server = OctaveMcpServer::new();
        {
            let mut manager = server.session.lock().await;
            OctaveMcpServer::install(&mut manager, mux, notifications);
        }

        let hung = tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .octave_command(Parameters(OctaveCommandParams {
                        command: Some("x = 1".to_string()),
                    }))
                    .await
            }
        });
        sleep(Duration::from_millis(100)).await;
        assert!(!hung.is_finished());

        let result = tokio::time::timeout(Duration::from_secs(10), server.octave_terminate())
            .await
            .expect("terminate must not wait for the hung request")
            .expect("terminate");
        let content = result.structured_content.expect("structured result");
        assert_eq!(content["state"], "detached");

        let err = tokio::time::timeout(Duration::from_secs(2), hung)
            .await
            .expect("hung request should be released")
            .expect("task")
            .expect_err("request to a killed session must fail");
        assert!(err.message.contains("octave_launch"), "{}", err.message);
    }

    #[tokio::test]
    async fn step_past_last_line_reports_idle() {
        use octave_bridge_core::session::SessionStreams;
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let (stdin, repl_stdin) = tokio::io::duplex(4096);
        let (mut repl_stdout, stdout) = tokio::io::duplex(4096);
        let (_repl_stderr, stderr) = tokio::io::duplex(4096);
        let (mux, notifications) = Multiplexer::from_streams(
            SessionStreams::new(stdin, stdout, stderr),
            tracing::Span::none(),
        );
        let server = OctaveMcpServer::new();
        let session = {
            let mut manager = server.session.lock().await;
            OctaveMcpServer::install(&mut manager, mux, notifications)
        };
        session.debugging.store(true, Ordering::SeqCst);
        *session.last_stop.lock().await = Some(breakpoint_stop("foo", 9));

        let repl = tokio::spawn(async move {
            let mut lines = BufReader::new(repl_stdin).lines();
            let line = lines.next_line().await.expect("read").expect("command");
            repl_stdout.write_all(b"octave:7> ").await.expect("reply write");
            (line, repl_stdout)
        });

        let result = tokio::time::timeout(Duration::from_secs(2), server.octave_step())
            .await
            .expect("step must complete at the normal prompt")
            .expect("step");
        let content = result.structured_content.expect("structured result");
        assert_eq!(content["state"], "idle");
        assert_eq!(content["stop"], Value::Null);
        let (command, _stdout) = repl.await.expect("repl task");
        assert_eq!(command, "dbnext");
    }
}
