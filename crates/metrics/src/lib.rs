//! Metrics for botbox, recorded through the `metrics` crate facade.
//!
//! Library crates record against the names in [`definitions`]; the binary
//! installs a recorder with [`init_metrics`]. Without the `prometheus`
//! feature every record call is a no-op.

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, init_metrics},
};

pub use metrics::{counter, gauge, histogram};
