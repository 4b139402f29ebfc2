use thiserror::Error;
use uuid::Uuid;

/// Failures surfaced by the telephony provider adapter.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("telephony provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("invalid destination number: {0}")]
    InvalidDestination(String),
    /// The provider-side call already ended.  A benign race, never retried.
    #[error("provider session not found: {0}")]
    SessionNotFound(String),
}

/// Failures surfaced by the conversation engine.  All are retryable with
/// backoff; sentiment and intent failures additionally degrade to neutral
/// defaults at the call site.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("conversation upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("conversation upstream rate limited")]
    RateLimited,
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("persistence error: {0}")]
    Database(String),
    #[error("unknown call {0}")]
    UnknownCall(Uuid),
    #[error("unknown contact {0}")]
    UnknownContact(String),
}

/// Umbrella error for dispatcher-level operations.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}
