use crate::multiplexer::{Multiplexer, Notifications};
use crate::session::{ProcessSession, SpawnOptions};
use crate::{BridgeConfig, Result};
use tracing::{debug, info};

/// Drain the startup banner, then put the REPL into stop-on-condition mode.
/// Returns the banner lines.
pub async fn initialize(mux: &Multiplexer, config: &BridgeConfig) -> Result<Vec<String>> {
    let banner = mux.request(None).await?;
    debug!(lines = banner.body.len(), "Startup banner drained");

    for command in &config.setup_commands {
        mux.send(command).await?;
    }
    info!(
        commands = config.setup_commands.len(),
        "Octave session initialized"
    );
    Ok(banner.body)
}

/// Spawn the REPL described by `config`, attach a multiplexer and initialize it.
pub async fn launch(config: &BridgeConfig) -> Result<(Multiplexer, Notifications)> {
    let span = config.span();
    let options = SpawnOptions {
        cwd: config.cwd.clone(),
        env: Vec::new(),
    };
    let session = ProcessSession::spawn(&config.executable, &config.args, options, span.clone())?;
    let (mux, notifications) = Multiplexer::attach(session, span)?;
    initialize(&mux, config).await?;
    Ok((mux, notifications))
}
