use botbox_common::FromMessage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("bot not found: {bot_id}")]
    BotNotFound { bot_id: String },

    #[error("no container for bot {bot_id}")]
    ContainerNotFound { bot_id: String },

    #[error("version {version} not found for container {container_id}")]
    VersionNotFound { container_id: String, version: i64 },

    #[error("{operation} failed for {id}: {source}")]
    Runtime {
        operation: &'static str,
        id: String,
        #[source]
        source: botbox_runtime::Error,
    },

    #[error(transparent)]
    Store(#[from] botbox_store::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn runtime(operation: &'static str, id: impl Into<String>, source: botbox_runtime::Error) -> Self {
        Self::Runtime {
            operation,
            id: id.into(),
            source,
        }
    }

    /// The active backend lacks the capability this operation needs.
    #[must_use]
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::Runtime { source, .. } if source.is_not_supported())
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::BotNotFound { .. }
            | Self::ContainerNotFound { .. }
            | Self::VersionNotFound { .. } => true,
            Self::Runtime { source, .. } => source.is_not_found(),
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

botbox_common::impl_context!();

/// Wrap runtime errors with the operation name and the container or bot ID.
pub(crate) trait RuntimeResultExt<T> {
    fn op(self, operation: &'static str, id: &str) -> Result<T>;
}

impl<T> RuntimeResultExt<T> for botbox_runtime::Result<T> {
    fn op(self, operation: &'static str, id: &str) -> Result<T> {
        self.map_err(|source| Error::runtime(operation, id, source))
    }
}
