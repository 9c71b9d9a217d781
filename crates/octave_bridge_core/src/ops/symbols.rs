use crate::multiplexer::Multiplexer;
use crate::response::parse_symbol_locations;
use crate::Result;
use std::collections::HashMap;

/// Resolve function names to the files defining them. Names the REPL cannot find
/// are absent from the map.
pub async fn which<S: AsRef<str>>(mux: &Multiplexer, names: &[S]) -> Result<HashMap<String, String>> {
    if names.is_empty() {
        return Ok(HashMap::new());
    }
    let names: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
    let reply = mux.send(&format!("which {}", names.join(" "))).await?;
    Ok(parse_symbol_locations(&reply.lines))
}
