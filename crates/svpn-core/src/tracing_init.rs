//! Shared tracing/logging initialization.
//!
//! The `svpn` binary sets up `tracing_subscriber` with an env-filter and
//! optional JSON output. Logs go to stderr so stdout stays free for command
//! output such as compiled configurations.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"svpn_daemon=info,svpn_core=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Build the default filter string for a log level.
pub fn default_filter(level: &str) -> String {
    format!("svpn={level},svpn_daemon={level},svpn_core={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_all_crates() {
        assert_eq!(
            default_filter("debug"),
            "svpn=debug,svpn_daemon=debug,svpn_core=debug"
        );
    }
}
