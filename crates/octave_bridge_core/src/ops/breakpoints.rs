use crate::multiplexer::Multiplexer;
use crate::{BridgeError, Result};

/// Set breakpoints in `function` and return the lines the REPL actually accepted,
/// which may differ from the requested ones (it moves them to executable lines).
pub async fn set(mux: &Multiplexer, function: &str, lines: &[u32]) -> Result<Vec<u32>> {
    if lines.is_empty() {
        return Ok(Vec::new());
    }

    let requested: Vec<String> = lines.iter().map(u32::to_string).collect();
    let command = format!("dbstop {function} {}", requested.join(" "));
    let reply = mux.send(&command).await?;

    let accepted: Vec<u32> = reply
        .shape()
        .numbers()
        .into_iter()
        .filter(|n| *n >= 0.0 && n.fract() == 0.0 && *n <= f64::from(u32::MAX))
        .map(|n| n as u32)
        .collect();

    if accepted.is_empty() {
        return Err(BridgeError::UnexpectedReply(format!(
            "{command}: {}",
            reply.body.join(" | ")
        )));
    }
    Ok(accepted)
}

/// Remove every breakpoint in `function`.
pub async fn clear(mux: &Multiplexer, function: &str) -> Result<()> {
    mux.send(&format!("dbclear {function}")).await?;
    Ok(())
}
