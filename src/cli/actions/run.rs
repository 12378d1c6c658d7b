use crate::cli::actions::Action;
use crate::exporter::new;
use anyhow::Result;

/// Handle the run action
///
/// # Errors
///
/// Returns an error if the exporter cannot connect or bind.
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Run {
            port,
            listen,
            dsn,
            config,
            collectors,
        } => {
            new(port, listen, dsn, config, collectors).await?;
        }
    }

    Ok(())
}
