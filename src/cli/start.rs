use crate::cli::{actions::Action, commands, dispatch::handler, telemetry};
use anyhow::Result;
use tracing::Level;

// 0 keeps the default (warn), so failed queries are visible out of the box
const fn get_verbosity_level(verbose_count: u8) -> Option<Level> {
    match verbose_count {
        0 => None,
        1 => Some(Level::INFO),
        2 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

/// Parse flags, install logging and return the action to run.
///
/// # Errors
///
/// Returns an error if telemetry initialization or flag handling fails
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    telemetry::init(get_verbosity_level(matches.get_count("verbose")))?;

    handler(&matches)
}
