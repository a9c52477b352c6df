//! Shared error plumbing and the bot identifier format used across all botbox
//! crates.

pub mod bot_id;
pub mod error;

pub use {
    bot_id::{InvalidBotId, validate_bot_id},
    error::FromMessage,
};
