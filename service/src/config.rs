use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use std::time::Duration;

/// Bind address meaning "all interfaces".
pub const ALL_INTERFACES: &str = "*";

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// The host interface to listen for incoming connections ("*" binds all interfaces)
    #[arg(short, long, env, default_value = ALL_INTERFACES)]
    pub interface: String,

    /// The host TCP port to listen for incoming connections (1024-65535)
    #[arg(short, long, env, default_value_t = 5678)]
    pub port: u32,

    /// Maximum number of pending connections queued by the listening socket
    #[arg(long, env, default_value_t = 100)]
    pub max_queued_connections: u32,

    /// Seconds a subscriber may stay idle before it is sent a keep-alive ping
    #[arg(long, env, default_value_t = 90)]
    pub ping_interval_secs: u64,

    /// Milliseconds an ordinary response stays open after its body has been written
    #[arg(long, env, default_value_t = 333)]
    pub connection_linger_ms: u64,

    /// Seconds to wait for in-flight connections to drain when the server stops
    #[arg(long, env, default_value_t = 5)]
    pub server_linger_secs: u64,

    /// Emit a synthetic, incrementing "id:" line on events published without an id
    #[arg(long, env, default_value_t = true, action = clap::ArgAction::Set)]
    pub force_event_id: bool,

    /// The URL path subscribers use to open an event stream
    #[arg(long, env, default_value = "/restsse/")]
    pub sse_path: String,

    /// Event types allowed on the event stream path; empty allows all types
    #[arg(long, env, value_delimiter = ',', use_value_delimiter = true)]
    pub sse_event_types: Vec<String>,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn connection_linger(&self) -> Duration {
        Duration::from_millis(self.connection_linger_ms)
    }

    pub fn server_linger(&self) -> Duration {
        Duration::from_secs(self.server_linger_secs)
    }

    /// Event types for the stream path with blanks removed.
    pub fn sse_event_types(&self) -> Vec<String> {
        self.sse_event_types
            .iter()
            .map(|event_type| event_type.trim().to_string())
            .filter(|event_type| !event_type.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_tunables() {
        let config = Config::try_parse_from(["dai_rest_rs"]).unwrap();

        assert_eq!(config.interface, "*");
        assert_eq!(config.port, 5678);
        assert_eq!(config.max_queued_connections, 100);
        assert_eq!(config.ping_interval(), Duration::from_secs(90));
        assert_eq!(config.connection_linger(), Duration::from_millis(333));
        assert_eq!(config.server_linger(), Duration::from_secs(5));
        assert!(config.force_event_id);
        assert_eq!(config.sse_path, "/restsse/");
        assert!(config.sse_event_types().is_empty());
    }

    #[test]
    fn test_event_types_are_split_and_trimmed() {
        let config =
            Config::try_parse_from(["dai_rest_rs", "--sse-event-types", "ras, telemetry,,"]).unwrap();

        assert_eq!(config.sse_event_types(), vec!["ras", "telemetry"]);
    }

    #[test]
    fn test_force_event_id_can_be_disabled() {
        let config =
            Config::try_parse_from(["dai_rest_rs", "--force-event-id", "false"]).unwrap();

        assert!(!config.force_event_id);
    }
}
