use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("CRDS are not installed in cluster")]
    MissingCrds,

    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),

    #[error("secret {0} not found")]
    SecretNotFound(String),

    #[error("field {field} not found in secret {secret}")]
    CredentialsNotFound { secret: String, field: String },

    #[error("field {field} of secret {secret} is not valid UTF-8")]
    InvalidCredentials { secret: String, field: String },

    #[error("database {0} not found")]
    DatabaseNotFound(String),

    #[error("no address declared on the record and none found in secret field {0}")]
    MissingAddress(String),

    #[error("database {0} does not exist after creation")]
    DatabaseNotCreated(String),

    #[error("user {0} does not exist after creation")]
    UserNotCreated(String),

    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    #[error("invalid timeout {0:?}")]
    InvalidTimeout(String),

    #[error("reconcile timed out after {0:?}")]
    Timeout(Duration),

    #[error("leader election lease lost")]
    LeaseLost,

    #[error("postgresql client error: {0}")]
    PostgresqlClientError(#[from] tokio_postgres::Error),

    #[error("mongodb client error: {0}")]
    MongodbClientError(#[from] mongodb::error::Error),

    #[error("atlas client error: {0}")]
    AtlasClientError(#[from] crate::adapter::atlas::Error),

    #[error("tls error: {0}")]
    TlsError(#[from] native_tls::Error),

    #[error("{source}")]
    Step {
        reason: &'static str,
        #[source]
        source: Box<Error>,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::Step { source, .. } => source.metric_label(),
            _ => format!("{self:?}")
                .split(['(', ' ', '{'])
                .next()
                .unwrap_or_default()
                .to_lowercase(),
        }
    }

    /// Attaches a condition reason to an error raised by one provisioning step.
    pub fn with_reason(self, reason: &'static str) -> Error {
        match self {
            Error::Step { source, .. } => Error::Step { reason, source },
            source => Error::Step {
                reason,
                source: Box::new(source),
            },
        }
    }

    /// The condition reason this error is reported under, if it carries one.
    pub fn reason(&self) -> Option<&'static str> {
        use conditions::reasons;

        match self {
            Error::Step { reason, .. } => Some(*reason),
            Error::SecretNotFound(_) => Some(reasons::SECRET_NOT_FOUND),
            Error::CredentialsNotFound { .. } | Error::InvalidCredentials { .. } => {
                Some(reasons::CREDENTIALS_NOT_FOUND)
            }
            Error::DatabaseNotFound(_) => Some(reasons::DATABASE_NOT_FOUND),
            Error::MissingAddress(_) | Error::TlsError(_) => Some(reasons::CONNECTION_FAILED),
            Error::DatabaseNotCreated(_) => Some(reasons::CREATE_DATABASE_FAILED),
            Error::InvalidTimeout(_) => Some(reasons::INVALID_TIMEOUT),
            Error::Timeout(_) => Some(reasons::RECONCILE_TIMEOUT),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 404,
            Error::Step { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

/// Custom resources and their reconcilers
pub mod resources;

/// Database engine adapters
pub mod adapter;

/// Secret reference resolution
pub mod credentials;

/// Status conditions
pub mod conditions;

/// Cross-reference index over watched records
pub mod index;

/// Shared reconcile driver
pub mod reconcile;

/// Requeue backoff
mod backoff;
pub use backoff::Backoff;

/// Lease based leader election
pub mod leader;

/// Settings
mod settings;
pub use settings::{Args, LogFormat, Settings};

/// State
mod state;
pub use state::*;

/// Context
mod context;
pub use context::*;

#[cfg(test)]
pub mod fixtures;
