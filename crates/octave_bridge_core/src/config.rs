use std::path::PathBuf;

pub const DEFAULT_EXECUTABLE: &str = "octave-cli";

/// Commands sent after the startup banner has been drained.
pub const DEFAULT_SETUP_COMMANDS: [&str; 4] = [
    "debug_on_error(1)",
    "debug_on_warning(1)",
    "debug_on_interrupt(1)",
    "format compact",
];

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub executable: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub setup_commands: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            executable: DEFAULT_EXECUTABLE.to_string(),
            args: default_args(),
            cwd: None,
            setup_commands: DEFAULT_SETUP_COMMANDS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

fn default_args() -> Vec<String> {
    ["--no-gui", "--quiet", "--no-line-editing"]
        .iter()
        .map(|a| a.to_string())
        .collect()
}

impl BridgeConfig {
    pub fn new(executable: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
            ..Self::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn from_env() -> Self {
        let executable =
            std::env::var("OCTAVE_EXECUTABLE").unwrap_or_else(|_| DEFAULT_EXECUTABLE.to_string());

        let args = std::env::var("OCTAVE_ARGS")
            .ok()
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(default_args);

        let cwd = std::env::var("OCTAVE_CWD").ok().map(PathBuf::from);

        Self {
            executable,
            args,
            cwd,
            ..Self::default()
        }
    }

    /// Span every task of one bridge runs in. `pid` is recorded once the process exists.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "octave",
            executable = %self.executable,
            pid = tracing::field::Empty
        )
    }
}
