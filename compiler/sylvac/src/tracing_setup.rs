//! Tracing subscriber setup.
//!
//! Controlled by the `SYLVA_LOG` environment variable using the usual
//! `EnvFilter` syntax (`SYLVA_LOG=sylva_analysis=debug`). Off when the
//! variable is unset.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// A second call is a no-op (the first subscriber wins), so tests and
/// library consumers can call this freely.
pub fn init_tracing() {
    let Ok(filter) = EnvFilter::try_from_env("SYLVA_LOG") else {
        return;
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
