//! Command-line interface handling for the cycle server daemon.
//!
//! This module provides command-line argument parsing using the `clap`
//! builder API. Every option overrides the matching configuration file
//! setting.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

/// What the process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// The cycle server itself.
    Server,
    /// An agent relay in front of a cycle server.
    Relay {
        listen: Option<String>,
        upstream: Option<String>,
        period_ms: Option<u64>,
    },
}

/// Command line arguments parsed from user input.
///
/// This structure holds all the command-line options that can be used to
/// override configuration file settings.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the agent bind address
    pub bind_address: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Force lock-step cycles
    pub sync: bool,
    /// Force sequential sense generation
    pub single_threaded: bool,
    pub mode: Mode,
}

fn command() -> Command {
    Command::new("cycled")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Cycle-synchronized agent server and relay")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml")
                .global(true),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Agent bind address (e.g., 127.0.0.1:3100)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .global(true),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("sync")
                .short('s')
                .long("sync")
                .help("Run lock-step cycles: wait for every agent's sync token")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("single-threaded")
                .long("single-threaded")
                .help("Generate sense payloads on the coordinator thread only")
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("relay")
                .about("Run a fixed-period agent relay in front of a cycle server")
                .arg(
                    Arg::new("listen")
                        .long("listen")
                        .value_name("ADDRESS")
                        .help("Address agents connect to"),
                )
                .arg(
                    Arg::new("upstream")
                        .long("upstream")
                        .value_name("ADDRESS")
                        .help("Cycle server address"),
                )
                .arg(
                    Arg::new("period")
                        .long("period")
                        .value_name("MILLISECONDS")
                        .help("Forwarding period")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
}

impl CliArgs {
    /// Parses the process arguments.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    /// Parses an explicit argument list; `args[0]` is the binary name.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(&command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        let mode = match matches.subcommand() {
            Some(("relay", relay)) => Mode::Relay {
                listen: relay.get_one::<String>("listen").cloned(),
                upstream: relay.get_one::<String>("upstream").cloned(),
                period_ms: relay.get_one::<u64>("period").copied(),
            },
            _ => Mode::Server,
        };

        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            sync: matches.get_flag("sync"),
            single_threaded: matches.get_flag("single-threaded"),
            mode,
        }
    }
}
