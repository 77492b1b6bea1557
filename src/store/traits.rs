//! Unified `Store` trait, the single async interface for all persistence.
//!
//! The automation engine only talks to this trait. Backends: `LibSqlStore`
//! for production, `MemoryStore` for tests and ephemeral runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{
    Client, Conversation, ConversationStatus, LogEntry, Message, NewLogEntry, NewMessage,
    NewScenario, NewScenarioStep, Scenario, ScenarioState, ScenarioStep,
};

/// Backend-agnostic persistence trait covering clients, conversations,
/// messages, scenarios, scenario states, and the audit log.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Clients ─────────────────────────────────────────────────────

    /// Look up a client by normalized email address.
    async fn find_client_by_email(&self, email: &str) -> Result<Option<Client>, StoreError>;

    /// Create a client. `email` must already be normalized (lower-cased).
    async fn create_client(&self, email: &str, name: Option<&str>) -> Result<Client, StoreError>;

    async fn get_client(&self, id: i64) -> Result<Option<Client>, StoreError>;

    /// Back-fill a client's display name.
    async fn set_client_name(&self, client_id: i64, name: &str) -> Result<(), StoreError>;

    // ── Conversations ───────────────────────────────────────────────

    async fn create_conversation(
        &self,
        client_id: i64,
        topic: Option<&str>,
        status: ConversationStatus,
        last_message_at: Option<DateTime<Utc>>,
        preview: Option<&str>,
    ) -> Result<Conversation, StoreError>;

    async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, StoreError>;

    /// Non-closed conversations of a client, most recently updated first.
    async fn open_conversations_for_client(
        &self,
        client_id: i64,
    ) -> Result<Vec<Conversation>, StoreError>;

    async fn set_conversation_status(
        &self,
        id: i64,
        status: ConversationStatus,
    ) -> Result<(), StoreError>;

    async fn set_conversation_language(&self, id: i64, language: &str) -> Result<(), StoreError>;

    /// Update the activity timestamp and (optionally) the preview text.
    async fn touch_conversation(
        &self,
        id: i64,
        last_message_at: DateTime<Utc>,
        preview: Option<&str>,
    ) -> Result<(), StoreError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    async fn get_message(&self, id: i64) -> Result<Option<Message>, StoreError>;

    /// Look up a message by the RFC-5322 Message-ID it carried on the wire.
    async fn find_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError>;

    /// The last `limit` messages of a conversation, in chronological order.
    async fn recent_messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Flip the attention/draft flags of a persisted message.
    async fn set_message_flags(
        &self,
        id: i64,
        requires_attention: bool,
        is_draft: bool,
    ) -> Result<(), StoreError>;

    // ── Scenarios ───────────────────────────────────────────────────

    async fn create_scenario(&self, scenario: NewScenario) -> Result<Scenario, StoreError>;

    async fn add_scenario_step(
        &self,
        scenario_id: i64,
        step: NewScenarioStep,
    ) -> Result<ScenarioStep, StoreError>;

    /// Fetch a scenario with its steps ordered by `order_index`.
    async fn get_scenario(&self, id: i64) -> Result<Option<Scenario>, StoreError>;

    async fn get_step(&self, id: i64) -> Result<Option<ScenarioStep>, StoreError>;

    // ── Scenario state ──────────────────────────────────────────────

    async fn scenario_state(
        &self,
        conversation_id: i64,
    ) -> Result<Option<ScenarioState>, StoreError>;

    /// Create or replace the scenario attachment of a conversation.
    async fn upsert_scenario_state(&self, state: &ScenarioState) -> Result<(), StoreError>;

    async fn set_active_step(
        &self,
        conversation_id: i64,
        step_id: Option<i64>,
    ) -> Result<(), StoreError>;

    // ── Audit log ───────────────────────────────────────────────────

    /// Append an audit entry. Entries are never updated or deleted.
    async fn append_log(&self, entry: NewLogEntry) -> Result<LogEntry, StoreError>;

    /// All entries of a conversation in append order.
    async fn log_entries(&self, conversation_id: i64) -> Result<Vec<LogEntry>, StoreError>;
}
