use botbox_common::FromMessage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{operation} is not supported by the {backend} backend")]
    NotSupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("`{program} {subcommand}` failed (exit {code:?}): {stderr}")]
    Command {
        program: String,
        subcommand: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("network: {message}")]
    Network { message: String },

    #[error("vm shell: {message}")]
    Vm { message: String },

    #[error("proxy unavailable: {message}")]
    ProxyUnavailable { message: String },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),

    #[error(transparent)]
    Grpc(#[from] tonic::Status),

    #[error("{message}")]
    Message { message: String },

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_supported(backend: &'static str, operation: &'static str) -> Self {
        Self::NotSupported { backend, operation }
    }

    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    #[must_use]
    pub fn already_exists(kind: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            id: id.into(),
        }
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn vm(message: impl Into<String>) -> Self {
        Self::Vm {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(operation: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            secs,
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Grpc(status) => status.code() == tonic::Code::NotFound,
            Self::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code, ..
            }) => *status_code == 404,
            _ => false,
        }
    }

    /// IPAM refused an address because one is already recorded for the
    /// container, typically left over from an unclean teardown.
    #[must_use]
    pub fn is_duplicate_allocation(&self) -> bool {
        match self {
            Self::Network { message } | Self::Vm { message } => {
                message.to_ascii_lowercase().contains("duplicate allocation")
            },
            Self::Command { stderr, .. } => {
                stderr.to_ascii_lowercase().contains("duplicate allocation")
            },
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

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_not_found() {
        assert!(Error::not_found("container", "botbox-t1").is_not_found());
        assert!(Error::Grpc(tonic::Status::not_found("gone")).is_not_found());
        assert!(!Error::message("boom").is_not_found());
    }

    #[test]
    fn detects_duplicate_allocation_case_insensitively() {
        let err = Error::network("host-local: Duplicate allocation is not allowed");
        assert!(err.is_duplicate_allocation());
        assert!(!Error::network("no route to host").is_duplicate_allocation());
    }

    #[test]
    fn not_supported_names_backend_and_operation() {
        let err = Error::not_supported("proxy", "commit snapshot");
        assert!(err.is_not_supported());
        assert_eq!(
            err.to_string(),
            "commit snapshot is not supported by the proxy backend"
        );
    }
}
