//! Error taxonomy for the transfer engine.

use crate::client::ClientError;

/// Errors produced by a migration run.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Another run holds the job lock. Nothing was mutated.
    #[error("another process is already running this job")]
    AlreadyRunning,

    /// A source endpoint could not be reached or answered with a transport
    /// error. The current batch is aborted and safely retryable.
    #[error("source {endpoint} unavailable: {source}")]
    SourceUnavailable {
        /// Identity of the unreachable source (`host:port:db`).
        endpoint: String,
        #[source]
        source: ClientError,
    },

    /// A target endpoint could not be reached or answered with a transport
    /// error. The current batch is aborted and safely retryable.
    #[error("target {endpoint} unavailable: {source}")]
    TargetUnavailable {
        /// Identity of the unreachable target (`host:port:db`).
        endpoint: String,
        #[source]
        source: ClientError,
    },

    /// The source reported a value type outside the five supported ones.
    /// Fatal for the enclosing batch; data is never silently dropped.
    #[error("unsupported type {type_name:?} for key {key:?}")]
    UnsupportedType {
        /// The offending key, lossily decoded for diagnostics.
        key: String,
        /// The type string the source reported.
        type_name: String,
    },

    /// Invalid job configuration, surfaced before any run state is touched.
    #[error("configuration error: {0}")]
    Config(String),

    /// A transfer worker task ended without reporting a result. The batch is
    /// aborted and the checkpoint stays put, so a retry replays it.
    #[error("transfer worker failed: {0}")]
    Worker(String),
}

impl MigrateError {
    /// Wrap a client error as a source-side failure.
    pub fn source(endpoint: impl ToString, source: ClientError) -> Self {
        Self::SourceUnavailable {
            endpoint: endpoint.to_string(),
            source,
        }
    }

    /// Wrap a client error as a target-side failure.
    pub fn target(endpoint: impl ToString, source: ClientError) -> Self {
        Self::TargetUnavailable {
            endpoint: endpoint.to_string(),
            source,
        }
    }

    /// Whether the batch that produced this error can be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. } | Self::TargetUnavailable { .. }
        )
    }
}

/// Migration result type.
pub type Result<T> = std::result::Result<T, MigrateError>;
