use crate::{
    cli::actions::Action,
    collectors::{COLLECTOR_NAMES, Collector, all_factories},
    gauges::{GaugesConfig, QUERY_TIMEOUT},
};
use anyhow::{Result, anyhow, bail};
use clap::ArgMatches;
use secrecy::SecretString;
use std::{collections::HashMap, time::Duration};
use tracing::debug;

/// Build the run action from parsed flags.
///
/// # Errors
///
/// Returns an error if a required value is missing or a label is malformed.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    let port = matches
        .get_one::<u16>("port")
        .copied()
        .ok_or_else(|| anyhow!("Port is required. Please provide it using the --port flag."))?;

    // None means auto-detect
    let listen = matches.get_one::<String>("listen").cloned();

    let dsn = SecretString::from(
        matches
            .get_one::<String>("dsn")
            .cloned()
            .ok_or_else(|| anyhow!("DSN is required. Please provide it using the --dsn flag."))?,
    );

    let interval = matches
        .get_one::<u64>("interval")
        .copied()
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow!("Interval is required. Please provide it using the --interval flag."))?;

    let labels = parse_labels(
        matches
            .get_many::<String>("label")
            .into_iter()
            .flatten()
            .map(String::as_str),
    )?;

    debug!(?labels, interval_secs = interval.as_secs(), "parsed configuration");

    Ok(Action::Run {
        port,
        listen,
        dsn,
        config: GaugesConfig {
            labels,
            interval,
            timeout: QUERY_TIMEOUT,
        },
        collectors: get_enabled_collectors(matches),
    })
}

/// Parse `key=value` pairs into constant labels. Blank entries are ignored and
/// a repeated key keeps its last value.
///
/// # Errors
///
/// Returns an error for a pair without `=` or with an invalid label name.
pub fn parse_labels<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Result<HashMap<String, String>> {
    let mut labels = HashMap::new();

    for pair in pairs.into_iter().map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid label '{pair}', expected KEY=VALUE");
        };

        let key = key.trim();
        if !is_label_name(key) {
            bail!("invalid label name '{key}'");
        }

        labels.insert(key.to_string(), value.trim().to_string());
    }

    Ok(labels)
}

// [a-zA-Z_][a-zA-Z0-9_]*, not starting with the reserved "__"
fn is_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');

    valid_start
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("__")
}

pub fn get_enabled_collectors(matches: &ArgMatches) -> Vec<String> {
    let factories = all_factories();

    COLLECTOR_NAMES
        .iter()
        .filter(|&name| {
            if matches.get_flag(&format!("no-collector.{name}")) {
                return false;
            }

            if matches.get_flag(&format!("collector.{name}")) {
                return true;
            }

            factories
                .get(name)
                .is_some_and(|factory| factory().enabled_by_default())
        })
        .map(|&name| name.to_string())
        .collect()
}
