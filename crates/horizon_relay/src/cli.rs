//! Command-line interface handling for the relay.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

use crate::config::AppConfig;

/// Command line arguments that override the configuration file.
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub bind_address: Option<String>,
    pub auth_token: Option<String>,
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("relay.toml"),
            bind_address: None,
            auth_token: None,
            log_level: None,
            json_logs: false,
        }
    }
}

impl CliArgs {
    pub fn command() -> Command {
        Command::new("Horizon Relay")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Pub/sub relay for Horizon messengers")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("relay.toml"),
            )
            .arg(
                Arg::new("bind")
                    .short('b')
                    .long("bind")
                    .value_name("ADDRESS")
                    .help("Bind address (e.g., 127.0.0.1:9050)"),
            )
            .arg(
                Arg::new("token")
                    .short('t')
                    .long("token")
                    .value_name("TOKEN")
                    .help("Shared secret clients must present"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
    }

    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::from_matches(&Self::command().get_matches())
    }

    pub fn from_matches(matches: &ArgMatches) -> Self {
        let defaults = Self::default();
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            bind_address: matches.get_one::<String>("bind").cloned(),
            auth_token: matches.get_one::<String>("token").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }

    /// Applies every flag that was given on top of `config`.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(bind_address) = &self.bind_address {
            config.relay.bind_address = bind_address.clone();
        }
        if let Some(token) = &self.auth_token {
            config.relay.auth_token = Some(token.clone());
        }
        if let Some(log_level) = &self.log_level {
            config.logging.level = log_level.clone();
        }
        if self.json_logs {
            config.logging.json_format = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        let matches = CliArgs::command()
            .try_get_matches_from(args)
            .unwrap();
        CliArgs::from_matches(&matches)
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["horizon_relay"]);
        assert_eq!(args.config_path, PathBuf::from("relay.toml"));
        assert!(args.bind_address.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn test_flags_override_config() {
        let args = parse(&[
            "horizon_relay",
            "-c",
            "/etc/horizon/relay.toml",
            "--bind",
            "0.0.0.0:9999",
            "--token",
            "s3cret",
            "-l",
            "debug",
            "--json-logs",
        ]);
        assert_eq!(args.config_path, PathBuf::from("/etc/horizon/relay.toml"));

        let mut config = AppConfig::default();
        args.apply(&mut config);
        assert_eq!(config.relay.bind_address, "0.0.0.0:9999");
        assert_eq!(config.relay.auth_token.as_deref(), Some("s3cret"));
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_absent_flags_leave_config_alone() {
        let mut config = AppConfig::default();
        config.relay.auth_token = Some("from-file".into());
        CliArgs::default().apply(&mut config);
        assert_eq!(config.relay.auth_token.as_deref(), Some("from-file"));
        assert_eq!(config.relay.bind_address, "127.0.0.1:9050");
    }
}
