//! Bot identifier format.
//!
//! A bot ID names a directory under the data root and is embedded in the
//! container ID, so it is restricted to a conservative character set: 1–64
//! ASCII alphanumerics, `-` or `_`, starting with an alphanumeric.

/// Maximum length of a bot identifier.
pub const MAX_BOT_ID_LEN: usize = 64;

/// Reason a string was rejected as a bot identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidBotId {
    #[error("bot id is empty")]
    Empty,
    #[error("bot id exceeds {MAX_BOT_ID_LEN} characters")]
    TooLong,
    #[error("bot id must start with an ASCII letter or digit")]
    BadStart,
    #[error("bot id contains invalid character {0:?}")]
    BadChar(char),
}

/// Check `id` against the bot identifier format.
pub fn validate_bot_id(id: &str) -> Result<(), InvalidBotId> {
    let Some(first) = id.chars().next() else {
        return Err(InvalidBotId::Empty);
    };
    if id.len() > MAX_BOT_ID_LEN {
        return Err(InvalidBotId::TooLong);
    }
    if !first.is_ascii_alphanumeric() {
        return Err(InvalidBotId::BadStart);
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(InvalidBotId::BadChar(bad));
    }
    Ok(())
}
