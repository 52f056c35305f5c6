//! Tracing setup for binaries and tests embedding shadowfs.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a global fmt subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. Calling this more than
/// once is harmless; later calls keep the first subscriber.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .is_ok()
}
