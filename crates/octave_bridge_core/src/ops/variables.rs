use crate::multiplexer::Multiplexer;
use crate::response::{parse_variable_listing, variable_value, VariableDescriptor, VariableListing};
use crate::Result;

/// Variables visible in the current scope. A malformed listing row is reported in
/// [`VariableListing::error`] alongside the rows parsed before it.
pub async fn list(mux: &Multiplexer) -> Result<VariableListing> {
    let reply = mux.send("whos").await?;
    Ok(parse_variable_listing(&reply.lines))
}

/// Display value of one listed variable. Only scalars are fetched from the REPL.
pub async fn value(mux: &Multiplexer, descriptor: &VariableDescriptor) -> Result<String> {
    if !descriptor.is_scalar() {
        return Ok(descriptor.placeholder());
    }
    let reply = mux.send(&descriptor.name).await?;
    Ok(variable_value(descriptor, &reply))
}
