use crate::collectors::{COLLECTOR_NAMES, Collector, all_factories};
use clap::{Arg, ArgAction, Command};

// clap ids and long names must be 'static. Called once per collector at startup.
fn leak(s: String) -> &'static str {
    Box::leak(s.into_boxed_str())
}

/// Add a `--collector.<name>` / `--no-collector.<name>` pair for every collector.
pub fn add_collectors_args(mut cmd: Command) -> Command {
    let factories = all_factories();

    for &name in COLLECTOR_NAMES {
        let default_enabled = factories
            .get(name)
            .is_some_and(|factory| factory().enabled_by_default());

        let enable_flag = leak(format!("collector.{name}"));
        let disable_flag = leak(format!("no-collector.{name}"));

        let state = if default_enabled { "enabled" } else { "disabled" };

        cmd = cmd
            .arg(
                Arg::new(enable_flag)
                    .long(enable_flag)
                    .help(format!("Enable the {name} collector [default: {state}]"))
                    .action(ArgAction::SetTrue)
                    .default_value(if default_enabled { "true" } else { "false" }),
            )
            .arg(
                Arg::new(disable_flag)
                    .long(disable_flag)
                    .help(format!("Disable the {name} collector"))
                    .action(ArgAction::SetTrue)
                    .overrides_with(enable_flag),
            );
    }

    cmd
}
