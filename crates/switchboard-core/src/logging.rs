//! Structured logging bootstrap.
//!
//! Log context (session key, run id, lane) travels in tracing spans and
//! structured fields. Filter resolution follows the same precedence as
//! the settings env overrides: `SWITCHBOARD_LOG` wins, then `RUST_LOG`,
//! then the level the caller passes in. Output is compact, to stderr.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Returns `true` when this call installed it; later calls (or a
/// subscriber installed elsewhere, e.g. by a test harness) leave the
/// existing one in place and return `false`.
///
/// # Arguments
///
/// * `default_level` - Filter used when neither `SWITCHBOARD_LOG` nor
///   `RUST_LOG` is set (e.g. `"info"`).
pub fn init_subscriber(default_level: &str) -> bool {
    let filter = std::env::var("SWITCHBOARD_LOG")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .try_init()
        .is_ok()
}
