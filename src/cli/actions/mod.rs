pub mod run;

use crate::gauges::GaugesConfig;
use secrecy::SecretString;

#[derive(Debug)]
pub enum Action {
    Run {
        port: u16,
        listen: Option<String>,
        dsn: SecretString,
        config: GaugesConfig,
        collectors: Vec<String>,
    },
}
