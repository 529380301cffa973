use crate::config::Config;
use log::LevelFilter;
use log::SetLoggerError;
use simplelog::{self, ConfigBuilder};

/// HTTP transport crates that log every accepted socket and body frame. Below `Trace` they
/// would bury the route and subscriber lines the server itself emits.
const FILTERED_MODULES: &[&str] = &["hyper", "hyper_util", "axum", "tower", "reqwest", "mio"];

pub struct Logger {}

impl Logger {
    /// Installs a terminal logger at `config.log_level_filter`.
    ///
    /// `Trace` also lets the HTTP transport through. Returns an error when another global
    /// logger is already installed, so embedders that bring their own logger keep it.
    pub fn init_logger(config: &Config) -> Result<(), SetLoggerError> {
        let level = to_simplelog(config.log_level_filter);
        let log_config = Self::build_log_config(Self::hides_transport(config.log_level_filter));

        simplelog::TermLogger::init(
            level,
            log_config,
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        )
    }

    fn hides_transport(level: LevelFilter) -> bool {
        level != LevelFilter::Trace
    }

    /// RFC3339 timestamps, optionally ignoring [`FILTERED_MODULES`].
    fn build_log_config(hide_transport: bool) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder.set_time_format_rfc3339();

        if hide_transport {
            for module in FILTERED_MODULES {
                builder.add_filter_ignore_str(module);
            }
        }

        builder.build()
    }
}

fn to_simplelog(level: LevelFilter) -> simplelog::LevelFilter {
    match level {
        LevelFilter::Off => simplelog::LevelFilter::Off,
        LevelFilter::Error => simplelog::LevelFilter::Error,
        LevelFilter::Warn => simplelog::LevelFilter::Warn,
        LevelFilter::Info => simplelog::LevelFilter::Info,
        LevelFilter::Debug => simplelog::LevelFilter::Debug,
        LevelFilter::Trace => simplelog::LevelFilter::Trace,
    }
}
