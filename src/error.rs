//! Error taxonomy shared by every pipeline stage.
//!
//! Repository and provider-auth failures are fatal for the operation that hit
//! them. Rate limits are transient and retried by [`crate::gateway::retry`].
//! Everything else is surfaced to the caller, which decides whether the unit
//! of work is skipped (one file, one tool call) or the operation aborts.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Repository {url} is not accessible: {reason}")]
    RepositoryAccess { url: String, reason: String },

    #[error("{service} rejected the credentials: {message}")]
    ProviderAuth { service: String, message: String },

    #[error("{service} rate limit exceeded")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error("{service} request failed: {message}")]
    Provider { service: String, message: String },

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Store operation failed: {operation}")]
    Store {
        operation: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn provider(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn repository(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RepositoryAccess {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn store(operation: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            source: None,
        }
    }

    pub fn store_with_source(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The only class of error the retry policy acts on.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Errors that make all further work for the operation meaningless.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RepositoryAccess { .. } | Self::ProviderAuth { .. } | Self::Config(_)
        )
    }

    /// Server-suggested wait before the next attempt, if the provider sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        Self::store_with_source("postgres", err)
    }
}
