//! Tracing subscriber initialization with structured logging.
//!
//! # Usage
//!
//! ```no_run
//! caseflow_observe::tracing_setup::init_tracing().unwrap();
//! ```

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Installs a structured `fmt` layer with target visibility and span close
/// timing. Respects `RUST_LOG` via `EnvFilter::from_default_env()`.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set.
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let env_filter = EnvFilter::from_default_env();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_an_error() {
        assert!(init_tracing().is_ok());
        assert!(init_tracing().is_err());
    }
}
