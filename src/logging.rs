//! # Structured Logging Module
//!
//! Console tracing initialization for binaries and tests embedding the
//! engine. The engine itself only emits `tracing` events; installing a
//! subscriber is the embedder's choice.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize a console tracing subscriber, filtered by `RUST_LOG`
/// (default `info`). Safe to call repeatedly; a subscriber installed by
/// the embedder is left in place.
pub fn init() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_filter(filter),
        );

        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }
    });
}
