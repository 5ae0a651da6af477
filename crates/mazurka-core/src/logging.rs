//! Logging and tracing initialization.
//!
//! The log level is controlled via the `RUST_LOG` environment variable:
//!
//! ```bash
//! # Show all logs including per-connection traces
//! RUST_LOG=debug cargo run
//!
//! # Show only warnings and errors (production)
//! RUST_LOG=warn cargo run
//!
//! # Fine-grained control
//! RUST_LOG=mazurka_core=debug,mazurka_peer=info cargo run
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with sensible defaults.
///
/// Call once at startup, before binding any server. The level defaults to
/// `info` when `RUST_LOG` is not set.
///
/// # Panics
///
/// Panics if called more than once.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize JSON-formatted logging (recommended for production).
///
/// Outputs one JSON object per event, suitable for log aggregation.
///
/// # Panics
///
/// Panics if called more than once.
pub fn init_logging_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
