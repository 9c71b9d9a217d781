use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn '{executable}': {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Session terminated: {0}")]
    SessionTerminated(String),

    #[error("Octave session is being used before initialized")]
    NotInitialized,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Parse error at line {line}: {message}")]
    ListingParse { line: usize, message: String },
}

impl BridgeError {
    pub fn terminated(reason: impl Into<String>) -> Self {
        Self::SessionTerminated(reason.into())
    }

    pub fn listing_parse(line: usize, message: impl Into<String>) -> Self {
        Self::ListingParse {
            line,
            message: message.into(),
        }
    }

    /// True when the error means the REPL process is gone for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionTerminated(_) | Self::NotInitialized)
    }
}
