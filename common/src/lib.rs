//! Shared plumbing for the HFP SCO workspace.
//!
//! Holds the observability stack (tracing setup, Prometheus metrics) and the
//! CLI color policy so the core library and the tools behave the same.

pub mod cli;
pub mod observability;

pub use cli::ColorWhen;
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
