//! Console logging on top of `tracing-subscriber`.
//!
//! `RUST_LOG` wins when set; otherwise the level comes from the verbosity
//! flag. JSON output is meant for log shippers, plain text for terminals.

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Default filter when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "batchflow=debug,info" } else { "batchflow=warn" }
}

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(verbose: bool, format: LogFormat) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let layer = match format {
            LogFormat::Text => fmt::layer()
                .with_target(true)
                .with_ansi(std::io::stderr().is_terminal())
                .with_writer(std::io::stderr)
                .with_filter(filter(verbose))
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(filter(verbose))
                .boxed(),
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("global tracing subscriber already set, keeping it");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_selects_directive() {
        assert_eq!(default_directive(false), "batchflow=warn");
        assert!(default_directive(true).contains("batchflow=debug"));
    }

    #[test]
    fn init_twice_is_harmless() {
        init(false, LogFormat::Text);
        init(true, LogFormat::Json);
        tracing::info!("still logging");
    }
}
