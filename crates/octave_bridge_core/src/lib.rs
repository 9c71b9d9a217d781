//! Octave Bridge Core
//!
//! A reusable async library that drives a line-buffered Octave REPL (in debug mode)
//! as if it were a structured debugging backend. Provides the prompt/reply patterns,
//! reply classification, stop-banner parsing, a process wrapper and a FIFO
//! command/response multiplexer, plus high-level operations built on top of them.

pub mod config;
pub mod error;
pub mod line_buffer;
pub mod multiplexer;
pub mod ops;
pub mod patterns;
pub mod response;
pub mod session;
pub mod stop_message;

// Re-export commonly used types
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use multiplexer::{Multiplexer, Notifications};
pub use response::{PromptMode, Reply, ReplyShape, VariableDescriptor};
pub use session::{ExitReport, ProcessSession, SpawnOptions};
pub use stop_message::{StackFrame, StopKind, StopNotification};

/// Result type alias using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;
