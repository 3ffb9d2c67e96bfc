use tracing_subscriber::EnvFilter;

/// Shown when `RUST_LOG` is absent: this crate's optimizer and evaluator
/// events, nothing else.
const DEFAULT_FILTER: &str = "teleprompt=info";

/// Installs a process-global subscriber for the crate's telemetry events
/// (`teleprompter/...`, `evaluate/...`).
///
/// `RUST_LOG` takes precedence over the default filter. Returns `false`
/// when a subscriber is already installed, either by an earlier call or by
/// the embedding application; that is not an error, the existing
/// subscriber simply keeps receiving the events.
pub fn init_tracing() -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
