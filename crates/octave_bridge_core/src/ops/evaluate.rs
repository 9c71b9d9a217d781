use crate::multiplexer::Multiplexer;
use crate::response::ReplyShape;
use crate::Result;

/// Evaluate one expression in the current scope and classify what it printed.
pub async fn evaluate(mux: &Multiplexer, expression: &str) -> Result<ReplyShape> {
    let reply = mux.send(expression.trim()).await?;
    Ok(reply.shape())
}
