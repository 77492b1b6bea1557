//! In-memory `Store` backend.
//!
//! Backs unit and end-to-end tests, and short-lived runs that don't need a
//! database file. All state lives behind one mutex; ids are assigned from
//! monotonic counters the way the libSQL backend uses rowids.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{
    Client, Conversation, ConversationStatus, LogEntry, Message, MessageDirection, NewLogEntry,
    NewMessage, NewScenario, NewScenarioStep, Scenario, ScenarioState, ScenarioStep, SenderRole,
};
use crate::store::traits::Store;

#[derive(Default)]
struct Inner {
    clients: Vec<Client>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    scenarios: Vec<Scenario>,
    states: HashMap<i64, ScenarioState>,
    logs: Vec<LogEntry>,
    next_client_id: i64,
    next_conversation_id: i64,
    next_message_id: i64,
    next_scenario_id: i64,
    next_step_id: i64,
    next_log_id: i64,
}

impl Inner {
    fn next_id(counter: &mut i64) -> i64 {
        *counter += 1;
        *counter
    }
}

/// Mutex-backed store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Query("memory store mutex poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_client_by_email(&self, email: &str) -> Result<Option<Client>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.clients.iter().find(|c| c.email == email).cloned())
    }

    async fn create_client(&self, email: &str, name: Option<&str>) -> Result<Client, StoreError> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let client = Client {
            id: Inner::next_id(&mut inner.next_client_id),
            email: email.to_string(),
            name: name.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        inner.clients.push(client.clone());
        Ok(client)
    }

    async fn get_client(&self, id: i64) -> Result<Option<Client>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.clients.iter().find(|c| c.id == id).cloned())
    }

    async fn set_client_name(&self, client_id: i64, name: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let client = inner
            .clients
            .iter_mut()
            .find(|c| c.id == client_id)
            .ok_or_else(|| StoreError::not_found("client", client_id))?;
        client.name = Some(name.to_string());
        client.updated_at = Utc::now();
        Ok(())
    }

    async fn create_conversation(
        &self,
        client_id: i64,
        topic: Option<&str>,
        status: ConversationStatus,
        last_message_at: Option<DateTime<Utc>>,
        preview: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let conversation = Conversation {
            id: Inner::next_id(&mut inner.next_conversation_id),
            client_id,
            topic: topic.map(str::to_string),
            status,
            language: None,
            last_message_at,
            last_message_preview: preview.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        inner.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.conversations.iter().find(|c| c.id == id).cloned())
    }

    async fn open_conversations_for_client(
        &self,
        client_id: i64,
    ) -> Result<Vec<Conversation>, StoreError> {
        let inner = self.lock()?;
        let mut open: Vec<Conversation> = inner
            .conversations
            .iter()
            .filter(|c| c.client_id == client_id && !c.status.is_closed())
            .cloned()
            .collect();
        open.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(open)
    }

    async fn set_conversation_status(
        &self,
        id: i64,
        status: ConversationStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let conversation = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::not_found("conversation", id))?;
        conversation.status = status;
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn set_conversation_language(&self, id: i64, language: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let conversation = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::not_found("conversation", id))?;
        conversation.language = Some(language.to_string());
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn touch_conversation(
        &self,
        id: i64,
        last_message_at: DateTime<Utc>,
        preview: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let conversation = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::not_found("conversation", id))?;
        conversation.last_message_at = Some(last_message_at);
        if let Some(preview) = preview {
            conversation.last_message_preview = Some(preview.to_string());
        }
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let mut inner = self.lock()?;
        let stored = Message {
            id: Inner::next_id(&mut inner.next_message_id),
            conversation_id: message.conversation_id,
            external_id: message.external_id,
            in_reply_to: message.in_reply_to,
            subject: message.subject,
            sender: message.sender.unwrap_or(SenderRole::Client),
            direction: message.direction.unwrap_or(MessageDirection::Inbound),
            sender_address: message.sender_address,
            sender_name: message.sender_name,
            body_plain: message.body_plain,
            body_html: message.body_html,
            detected_language: message.detected_language,
            sent_at: message.sent_at,
            received_at: message.received_at,
            requires_attention: message.requires_attention,
            is_draft: message.is_draft,
            created_at: Utc::now(),
        };
        inner.messages.push(stored.clone());
        Ok(stored)
    }

    async fn get_message(&self, id: i64) -> Result<Option<Message>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn find_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .messages
            .iter()
            .find(|m| m.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn recent_messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.lock()?;
        let all: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn set_message_flags(
        &self,
        id: i64,
        requires_attention: bool,
        is_draft: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::not_found("message", id))?;
        message.requires_attention = requires_attention;
        message.is_draft = is_draft;
        Ok(())
    }

    async fn create_scenario(&self, scenario: NewScenario) -> Result<Scenario, StoreError> {
        let mut inner = self.lock()?;
        let stored = Scenario {
            id: Inner::next_id(&mut inner.next_scenario_id),
            name: scenario.name,
            subject: scenario.subject,
            description: scenario.description,
            ai_preamble: scenario.ai_preamble,
            operator_guidelines: scenario.operator_guidelines,
            steps: Vec::new(),
        };
        inner.scenarios.push(stored.clone());
        Ok(stored)
    }

    async fn add_scenario_step(
        &self,
        scenario_id: i64,
        step: NewScenarioStep,
    ) -> Result<ScenarioStep, StoreError> {
        let mut inner = self.lock()?;
        let id = Inner::next_id(&mut inner.next_step_id);
        let scenario = inner
            .scenarios
            .iter_mut()
            .find(|s| s.id == scenario_id)
            .ok_or_else(|| StoreError::not_found("scenario", scenario_id))?;
        let stored = ScenarioStep {
            id,
            scenario_id,
            order_index: step.order_index,
            title: step.title,
            description: step.description,
            ai_instructions: step.ai_instructions,
            operator_hint: step.operator_hint,
        };
        scenario.steps.push(stored.clone());
        scenario
            .steps
            .sort_by(|a, b| a.order_index.cmp(&b.order_index).then(a.id.cmp(&b.id)));
        Ok(stored)
    }

    async fn get_scenario(&self, id: i64) -> Result<Option<Scenario>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.scenarios.iter().find(|s| s.id == id).cloned())
    }

    async fn get_step(&self, id: i64) -> Result<Option<ScenarioStep>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .scenarios
            .iter()
            .flat_map(|s| s.steps.iter())
            .find(|s| s.id == id)
            .cloned())
    }

    async fn scenario_state(
        &self,
        conversation_id: i64,
    ) -> Result<Option<ScenarioState>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.states.get(&conversation_id).cloned())
    }

    async fn upsert_scenario_state(&self, state: &ScenarioState) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.states.insert(state.conversation_id, state.clone());
        Ok(())
    }

    async fn set_active_step(
        &self,
        conversation_id: i64,
        step_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let state = inner
            .states
            .get_mut(&conversation_id)
            .ok_or_else(|| StoreError::not_found("scenario_state", conversation_id))?;
        state.active_step_id = step_id;
        Ok(())
    }

    async fn append_log(&self, entry: NewLogEntry) -> Result<LogEntry, StoreError> {
        let mut inner = self.lock()?;
        let stored = LogEntry {
            id: Inner::next_id(&mut inner.next_log_id),
            conversation_id: entry.conversation_id,
            event: entry.event,
            actor: entry.actor,
            summary: entry.summary,
            details: entry.details,
            context: entry.context,
            created_at: Utc::now(),
        };
        inner.logs.push(stored.clone());
        Ok(stored)
    }

    async fn log_entries(&self, conversation_id: i64) -> Result<Vec<LogEntry>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .logs
            .iter()
            .filter(|l| l.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}
