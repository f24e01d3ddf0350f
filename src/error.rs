use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid subdomain: \"{0}\". Subdomain must contain only alphanumeric characters and hyphens.")]
    InvalidSubdomain(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),

    /// The provider accepted a webhook registration but left out a field we
    /// cannot operate without.
    #[error("Fellow API did not return a webhook {0}")]
    MissingWebhookField(&'static str),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for field: {0}")]
    InvalidField(&'static str),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("unknown trigger event: {0}")]
    UnknownEvent(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("server not initialized")]
    NotInitialized,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Fellow API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
