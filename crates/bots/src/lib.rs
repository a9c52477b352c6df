//! Per-bot container lifecycle and version history.
//!
//! [`BotManager`] keeps exactly one container per bot on a
//! [`RuntimeService`](botbox_runtime::RuntimeService), checkpoints every exec
//! as a numbered version, and rolls containers back to earlier versions.

pub mod config;
pub mod error;
pub mod manager;
mod versioning;

pub use {
    config::ManagerConfig,
    error::{Error, Result},
    manager::{BotContainer, BotManager, ExecCommand},
};

#[cfg(test)]
mod testing;
