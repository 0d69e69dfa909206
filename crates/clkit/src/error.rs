use thiserror::Error;

/// A failure reported by the compute provider.
///
/// Native compute APIs usually report a bare status code, sometimes with a
/// terse message. Both are kept verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("provider error {code}: {message}")]
pub struct ProviderError {
    pub code: i32,
    pub message: String,
}

impl ProviderError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClError {
    #[error("{kind} '{name}' has already been released")]
    ResourceReleased { kind: &'static str, name: String },

    #[error("no {kind} named '{name}'")]
    UnresolvedName { kind: &'static str, name: String },

    #[error("unsupported argument type: expected {expected}, received {received}")]
    UnsupportedArgumentType { expected: String, received: String },

    #[error(transparent)]
    ExternalProvider(#[from] ProviderError),

    #[error("{owner}.{operation}: {source}")]
    Operation {
        owner: &'static str,
        operation: &'static str,
        #[source]
        source: Box<ClError>,
    },

    #[error("Invalid Arguments: Expecting {0}.")]
    InvalidArguments(String),

    #[error("[{vendor}] {message}\n{log}")]
    BuildFailed { vendor: String, message: String, log: String },

    #[error("failed to load source from '{uri}': {reason}")]
    SourceLoad { uri: String, reason: String },
}

impl ClError {
    /// Strips every `Operation` context layer and returns the original failure.
    #[must_use]
    pub fn root_cause(&self) -> &ClError {
        let mut err = self;
        while let ClError::Operation { source, .. } = err {
            err = source;
        }
        err
    }

    pub(crate) fn released(kind: &'static str, name: &str) -> Self {
        ClError::ResourceReleased { kind, name: name.to_owned() }
    }

    pub(crate) fn expecting(what: &str) -> Self {
        ClError::InvalidArguments(what.to_owned())
    }
}

pub type Result<T, E = ClError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_context_is_prepended() {
        let err = ClError::Operation {
            owner: "CommandQueue",
            operation: "finish",
            source: Box::new(ProviderError::new(-36, "INVALID_COMMAND_QUEUE").into()),
        };
        assert_eq!(
            err.to_string(),
            "CommandQueue.finish: provider error -36: INVALID_COMMAND_QUEUE"
        );
    }

    #[test]
    fn root_cause_peels_nested_context() {
        let inner = ClError::UnresolvedName { kind: "Buffer", name: "results".into() };
        let err = ClError::Operation {
            owner: "Context",
            operation: "build_kernel",
            source: Box::new(ClError::Operation {
                owner: "Program",
                operation: "build",
                source: Box::new(inner.clone()),
            }),
        };
        assert_eq!(err.root_cause(), &inner);
        assert!(err.to_string().starts_with("Context.build_kernel: Program.build: "));
    }

    #[test]
    fn invalid_arguments_message() {
        let err = ClError::expecting("a valid and available Device");
        assert_eq!(
            err.to_string(),
            "Invalid Arguments: Expecting a valid and available Device."
        );
    }
}
