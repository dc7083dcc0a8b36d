//! Tracing initialization.
//!
//! One place decides the subscriber format so the library's log lines look
//! the same from every tool that embeds it.

use crate::ColorWhen;
use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Directive used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info";

/// Installs the global fmt subscriber.
///
/// - `RUST_LOG` overrides [`DEFAULT_FILTER`], e.g. `RUST_LOG=sco=debug` to
///   see per-packet framing decisions.
/// - Output goes to stderr, colored per `color`.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(color: ColorWhen) -> Result<()> {
    // ---
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(color.for_stderr())
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
