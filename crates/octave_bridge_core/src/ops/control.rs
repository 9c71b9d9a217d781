//! Execution control. Whether the REPL ends up stopped is only known from the reply,
//! so every operation accepts either prompt as the end of it.

use crate::multiplexer::Multiplexer;
use crate::response::{PromptMode, Reply};
use crate::Result;

/// Call `target` (a function or script name). The reply ends at the debug prompt if
/// a breakpoint or error stops it, at the normal prompt otherwise.
pub async fn run(mux: &Multiplexer, target: &str) -> Result<Reply> {
    mux.set_mode(PromptMode::Either);
    mux.send(target).await
}

pub async fn cont(mux: &Multiplexer) -> Result<Reply> {
    mux.set_mode(PromptMode::Either);
    mux.send("dbcont").await
}

/// Execute one line. Stepping past the last line returns to the normal prompt.
pub async fn step(mux: &Multiplexer) -> Result<Reply> {
    mux.set_mode(PromptMode::Either);
    mux.send("dbnext").await
}

/// Leave debug mode, abandoning the current call stack.
pub async fn quit(mux: &Multiplexer) -> Result<Reply> {
    mux.set_mode(PromptMode::Either);
    mux.send("dbquit").await
}
