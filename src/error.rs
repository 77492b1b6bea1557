//! Error types for Avtomail.

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }
}

/// Mail transport errors (IMAP fetch, SMTP send).
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("IMAP connection failed: {0}")]
    Connect(String),

    #[error("IMAP fetch failed: {0}")]
    Fetch(String),

    #[error("SMTP send failed: {0}")]
    Send(String),

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Mail credentials not configured for {0}")]
    NotConfigured(&'static str),
}

/// LLM backend errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid LLM response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Dispatch gateway errors (queue submission, job execution).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Queue submission failed: {0}")]
    QueueSubmit(String),

    #[error("Queued job timed out after {seconds}s")]
    QueueTimeout { seconds: u64 },

    #[error("Job payload encoding failed: {0}")]
    Payload(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Mail(#[from] MailError),
}

/// Automation engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Conversation {0} not found")]
    ConversationNotFound(i64),

    #[error("Scenario {0} not found")]
    ScenarioNotFound(i64),

    #[error("Step {step_id} does not belong to scenario {scenario_id}")]
    StepNotInScenario { step_id: i64, scenario_id: i64 },

    #[error("No scenario assigned to conversation {0}")]
    NoScenarioAssigned(i64),

    #[error("Conversation {0} is closed")]
    ConversationClosed(i64),

    #[error("Delivery failed for conversation {conversation_id}: {reason}")]
    DeliveryFailed { conversation_id: i64, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
