//! Domain entities and state-machine enums.
//!
//! These mirror the persistence schema one to one. Mutation goes through the
//! `Store` trait; the engine treats the structs themselves as snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum stored length of a conversation's last-message preview.
pub const PREVIEW_MAX_CHARS: usize = 500;

// ── Status and role enums ───────────────────────────────────────────

/// Conversation lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    AwaitingResponse,
    AnsweredByLlm,
    NeedsHuman,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingResponse => "awaiting_response",
            Self::AnsweredByLlm => "answered_by_llm",
            Self::NeedsHuman => "needs_human",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "awaiting_response" => Some(Self::AwaitingResponse),
            "answered_by_llm" => Some(Self::AnsweredByLlm),
            "needs_human" => Some(Self::NeedsHuman),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    /// Nothing leaves `Closed`; everything else is reachable.
    pub fn accepts_transition(self, next: Self) -> bool {
        match self {
            Self::Closed => next == Self::Closed,
            _ => true,
        }
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Client,
    Assistant,
    AssistantDraft,
    Manager,
}

impl SenderRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Assistant => "assistant",
            Self::AssistantDraft => "assistant_draft",
            Self::Manager => "manager",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client" => Some(Self::Client),
            "assistant" => Some(Self::Assistant),
            "assistant_draft" => Some(Self::AssistantDraft),
            "manager" => Some(Self::Manager),
            _ => None,
        }
    }
}

/// Message direction relative to the support inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
    Draft,
}

impl MessageDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Draft => "draft",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            "draft" => Some(Self::Draft),
            _ => None,
        }
    }
}

// ── Audit log taxonomy ──────────────────────────────────────────────

/// Fixed set of audit-log event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    AutomationTriggered,
    LlmDraftCreated,
    HumanInterventionRequired,
    MessageSent,
    ScenarioStepChanged,
    ScenarioAssigned,
    Note,
}

impl LogEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutomationTriggered => "automation_triggered",
            Self::LlmDraftCreated => "llm_draft_created",
            Self::HumanInterventionRequired => "human_intervention_required",
            Self::MessageSent => "message_sent",
            Self::ScenarioStepChanged => "scenario_step_changed",
            Self::ScenarioAssigned => "scenario_assigned",
            Self::Note => "note",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "automation_triggered" => Some(Self::AutomationTriggered),
            "llm_draft_created" => Some(Self::LlmDraftCreated),
            "human_intervention_required" => Some(Self::HumanInterventionRequired),
            "message_sent" => Some(Self::MessageSent),
            "scenario_step_changed" => Some(Self::ScenarioStepChanged),
            "scenario_assigned" => Some(Self::ScenarioAssigned),
            "note" => Some(Self::Note),
            _ => None,
        }
    }
}

/// Who an audit-log entry is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogActor {
    System,
    Assistant,
    Manager,
    Client,
}

impl LogActor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::Manager => "manager",
            Self::Client => "client",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "assistant" => Some(Self::Assistant),
            "manager" => Some(Self::Manager),
            "client" => Some(Self::Client),
            _ => None,
        }
    }
}

// ── Entities ────────────────────────────────────────────────────────

/// A client, keyed by normalized (lower-cased) email address.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Client {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.email)
    }
}

/// A threaded exchange with one client.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: i64,
    pub client_id: i64,
    pub topic: Option<String>,
    pub status: ConversationStatus,
    pub language: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_preview: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted message inside a conversation.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    /// RFC-5322 Message-ID of the underlying email, when one exists.
    pub external_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub subject: Option<String>,
    pub sender: SenderRole,
    pub direction: MessageDirection,
    pub sender_address: Option<String>,
    pub sender_name: Option<String>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
    pub detected_language: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub requires_attention: bool,
    pub is_draft: bool,
    pub created_at: DateTime<Utc>,
}

/// Payload for inserting a message. The store assigns id and created_at.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub conversation_id: i64,
    pub external_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub subject: Option<String>,
    pub sender: Option<SenderRole>,
    pub direction: Option<MessageDirection>,
    pub sender_address: Option<String>,
    pub sender_name: Option<String>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
    pub detected_language: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub requires_attention: bool,
    pub is_draft: bool,
}

/// Payload for creating a scenario.
#[derive(Debug, Clone, Default)]
pub struct NewScenario {
    pub name: String,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub ai_preamble: Option<String>,
    pub operator_guidelines: Option<String>,
}

/// Payload for adding a scenario step.
#[derive(Debug, Clone, Default)]
pub struct NewScenarioStep {
    pub order_index: i64,
    pub title: Option<String>,
    pub description: Option<String>,
    pub ai_instructions: Option<String>,
    pub operator_hint: Option<String>,
}

/// Payload for appending an audit-log entry.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub conversation_id: i64,
    pub event: LogEvent,
    pub actor: LogActor,
    pub summary: String,
    pub details: Option<serde_json::Value>,
    pub context: Option<String>,
}

/// An operator-authored scripted playbook.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub id: i64,
    pub name: String,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub ai_preamble: Option<String>,
    pub operator_guidelines: Option<String>,
    /// Ordered by `order_index` ascending.
    pub steps: Vec<ScenarioStep>,
}

impl Scenario {
    pub fn step(&self, step_id: i64) -> Option<&ScenarioStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn first_step(&self) -> Option<&ScenarioStep> {
        self.steps.first()
    }
}

/// One stage of a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioStep {
    pub id: i64,
    pub scenario_id: i64,
    pub order_index: i64,
    pub title: Option<String>,
    pub description: Option<String>,
    pub ai_instructions: Option<String>,
    pub operator_hint: Option<String>,
}

/// Attachment of a scenario to a conversation, with the active-step cursor.
#[derive(Debug, Clone)]
pub struct ScenarioState {
    pub conversation_id: i64,
    pub scenario_id: i64,
    pub active_step_id: Option<i64>,
    pub notes: Option<String>,
}

/// Append-only audit record of one engine action on a conversation.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: i64,
    pub conversation_id: i64,
    pub event: LogEvent,
    pub actor: LogActor,
    pub summary: String,
    pub details: Option<serde_json::Value>,
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Truncate free text for a conversation preview, on a char boundary.
pub fn preview_of(text: &str) -> String {
    text.chars().take(PREVIEW_MAX_CHARS).collect()
}
