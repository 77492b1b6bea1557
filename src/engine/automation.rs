//! Inbound-to-reply orchestration.
//!
//! `process_inbound` is the heart of the engine: resolve the thread, persist
//! the inbound message, generate a reply, then send it, hold it as a draft,
//! or escalate. Every path leaves a durable trace; escalation is a state
//! transition, not an error.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::dispatch::{Executor, Job};
use crate::engine::prompt::{PromptBuilder, HISTORY_LIMIT};
use crate::engine::scenario::ScenarioEngine;
use crate::engine::thread::{ThreadResolver, DEFAULT_TOPIC};
use crate::error::EngineError;
use crate::language::LanguageDetector;
use crate::llm::{classify, CompletionRequest};
use crate::mail::html::plain_to_html;
use crate::mail::{InboundEmail, OutboundEmail};
use crate::model::{
    preview_of, Conversation, ConversationStatus, LogActor, LogEvent, Message,
    MessageDirection, NewLogEntry, NewMessage, SenderRole,
};
use crate::store::Store;

/// Result of processing one inbound email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationOutcome {
    pub inbound_message_id: i64,
    /// Sent or drafted reply, when one was recorded.
    pub outbound_message_id: Option<i64>,
    pub requires_human: bool,
}

pub struct AutomationEngine {
    settings: Settings,
    store: Arc<dyn Store>,
    executor: Arc<dyn Executor>,
    detector: Arc<dyn LanguageDetector>,
    resolver: ThreadResolver,
    scenarios: ScenarioEngine,
    prompts: PromptBuilder,
}

impl AutomationEngine {
    pub fn new(
        settings: Settings,
        store: Arc<dyn Store>,
        executor: Arc<dyn Executor>,
        detector: Arc<dyn LanguageDetector>,
    ) -> Self {
        let prompts = PromptBuilder::new(settings.llm.confidence_marker.clone());
        Self {
            settings,
            store: Arc::clone(&store),
            executor,
            detector,
            resolver: ThreadResolver::new(Arc::clone(&store)),
            scenarios: ScenarioEngine::new(store),
            prompts,
        }
    }

    pub fn scenarios(&self) -> &ScenarioEngine {
        &self.scenarios
    }

    /// Run the full automation flow for one inbound email.
    pub async fn process_inbound(
        &self,
        email: &InboundEmail,
    ) -> Result<AutomationOutcome, EngineError> {
        let (_, mut conversation) = self.resolver.resolve(email).await?;

        let language = email.best_text().and_then(|t| self.detector.detect(&t));
        if let Some(language) = language {
            self.store
                .set_conversation_language(conversation.id, language)
                .await?;
            conversation.language = Some(language.to_string());
        }

        let inbound = self.store_inbound(&conversation, email).await?;
        info!(
            conversation_id = conversation.id,
            message_id = inbound.id,
            external_id = email.message_id.as_deref().unwrap_or(""),
            "Processing inbound email"
        );

        let completion = self.generate_reply(&conversation).await?;
        let classified = classify(&completion, &self.settings.llm.confidence_marker);
        self.store
            .append_log(NewLogEntry {
                conversation_id: conversation.id,
                event: LogEvent::LlmDraftCreated,
                actor: LogActor::Assistant,
                summary: "LLM draft created".to_string(),
                details: Some(json!({ "requires_human": classified.requires_human })),
                context: None,
            })
            .await?;

        if classified.is_empty() {
            self.escalate(conversation.id, "Empty completion").await?;
            return Ok(AutomationOutcome {
                inbound_message_id: inbound.id,
                outbound_message_id: None,
                requires_human: true,
            });
        }

        let subject = reply_subject(
            conversation
                .topic
                .as_deref()
                .or(email.subject.as_deref())
                .unwrap_or(""),
        );

        if classified.requires_human || !self.settings.auto_send_replies {
            let draft = self
                .store
                .insert_message(NewMessage {
                    conversation_id: conversation.id,
                    subject: Some(subject),
                    sender: Some(SenderRole::Assistant),
                    direction: Some(MessageDirection::Draft),
                    body_plain: Some(classified.content.clone()),
                    body_html: Some(plain_to_html(&classified.content)),
                    detected_language: conversation.language.clone(),
                    requires_attention: true,
                    is_draft: true,
                    ..Default::default()
                })
                .await?;
            self.escalate(conversation.id, "Reply held for manual review")
                .await?;
            info!(
                conversation_id = conversation.id,
                draft_id = draft.id,
                "Conversation flagged for manual review"
            );
            return Ok(AutomationOutcome {
                inbound_message_id: inbound.id,
                outbound_message_id: Some(draft.id),
                requires_human: true,
            });
        }

        let outbound = self
            .record_outbound(&conversation, &subject, &classified.content, SenderRole::Assistant)
            .await?;

        let mut references = email.references.clone();
        if let Some(message_id) = &email.message_id {
            references.push(message_id.clone());
        }
        let delivery = OutboundEmail {
            to_addresses: vec![email.from_address.trim().to_lowercase()],
            subject,
            body_plain: classified.content.clone(),
            body_html: Some(plain_to_html(&classified.content)),
            in_reply_to: email.message_id.clone().or_else(|| email.in_reply_to.clone()),
            references,
            attachments: Vec::new(),
        };

        if let Err(e) = self
            .executor
            .invoke(Job::DeliverEmail { email: delivery })
            .await
        {
            warn!(
                conversation_id = conversation.id,
                error = %e,
                "Auto-reply delivery failed"
            );
            self.store
                .set_message_flags(outbound.id, true, false)
                .await?;
            self.escalate(conversation.id, "Delivery failed").await?;
            return Ok(AutomationOutcome {
                inbound_message_id: inbound.id,
                outbound_message_id: None,
                requires_human: true,
            });
        }

        info!(conversation_id = conversation.id, "Auto reply sent");
        Ok(AutomationOutcome {
            inbound_message_id: inbound.id,
            outbound_message_id: Some(outbound.id),
            requires_human: false,
        })
    }

    /// Operator-initiated send. Unlike automation, a delivery failure here is
    /// a hard error: the message stays persisted and flagged, and the caller
    /// must treat the operation as failed.
    pub async fn send_manual(
        &self,
        conversation_id: i64,
        text: &str,
        subject: Option<&str>,
        sender: SenderRole,
    ) -> Result<Message, EngineError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(EngineError::ConversationNotFound(conversation_id))?;
        if conversation.status.is_closed() {
            return Err(EngineError::ConversationClosed(conversation_id));
        }
        let client = self
            .store
            .get_client(conversation.client_id)
            .await?
            .ok_or_else(|| {
                crate::error::StoreError::not_found("client", conversation.client_id)
            })
            .map_err(EngineError::from)?;

        let subject = subject
            .map(str::to_string)
            .or_else(|| conversation.topic.clone())
            .unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        let message = self
            .record_outbound(&conversation, &subject, text, sender)
            .await?;

        let delivery = OutboundEmail {
            to_addresses: vec![client.email.clone()],
            subject,
            body_plain: text.to_string(),
            body_html: Some(plain_to_html(text)),
            in_reply_to: None,
            references: Vec::new(),
            attachments: Vec::new(),
        };
        if let Err(e) = self
            .executor
            .invoke(Job::DeliverEmail { email: delivery })
            .await
        {
            error!(
                conversation_id,
                message_id = message.id,
                error = %e,
                "Manual send delivery failed"
            );
            self.store.set_message_flags(message.id, true, false).await?;
            return Err(EngineError::DeliveryFailed {
                conversation_id,
                reason: e.to_string(),
            });
        }

        Ok(message)
    }

    /// Explicitly close a conversation. Idempotent: closing an already
    /// closed conversation only appends the audit entry.
    pub async fn close(&self, conversation_id: i64) -> Result<Conversation, EngineError> {
        let mut conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(EngineError::ConversationNotFound(conversation_id))?;

        if !conversation.status.is_closed() {
            self.store
                .set_conversation_status(conversation_id, ConversationStatus::Closed)
                .await?;
            conversation.status = ConversationStatus::Closed;
        }
        self.store
            .append_log(NewLogEntry {
                conversation_id,
                event: LogEvent::Note,
                actor: LogActor::Manager,
                summary: "Conversation closed".to_string(),
                details: None,
                context: None,
            })
            .await?;
        Ok(conversation)
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn store_inbound(
        &self,
        conversation: &Conversation,
        email: &InboundEmail,
    ) -> Result<Message, EngineError> {
        let body_plain = email.body_plain.clone().or_else(|| {
            email
                .body_html
                .as_deref()
                .map(crate::mail::html::strip_html)
        });
        let received_at = email.date.unwrap_or_else(Utc::now);
        let message = self
            .store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                external_id: email.message_id.clone(),
                in_reply_to: email.in_reply_to.clone(),
                subject: email.subject.clone(),
                sender: Some(SenderRole::Client),
                direction: Some(MessageDirection::Inbound),
                sender_address: Some(email.from_address.clone()),
                sender_name: email.from_name.clone(),
                body_plain: body_plain.clone(),
                body_html: email.body_html.clone(),
                detected_language: conversation.language.clone(),
                received_at: Some(received_at),
                requires_attention: true,
                ..Default::default()
            })
            .await?;

        self.store
            .set_conversation_status(conversation.id, ConversationStatus::AwaitingResponse)
            .await?;
        let preview = body_plain
            .as_deref()
            .or(email.body_html.as_deref())
            .map(preview_of);
        self.store
            .touch_conversation(conversation.id, received_at, preview.as_deref())
            .await?;
        self.store
            .append_log(NewLogEntry {
                conversation_id: conversation.id,
                event: LogEvent::AutomationTriggered,
                actor: LogActor::Client,
                summary: "Inbound email received".to_string(),
                details: email
                    .message_id
                    .as_ref()
                    .map(|id| json!({ "external_id": id })),
                context: email.subject.clone(),
            })
            .await?;
        Ok(message)
    }

    async fn generate_reply(&self, conversation: &Conversation) -> Result<String, EngineError> {
        let history = self
            .store
            .recent_messages(conversation.id, HISTORY_LIMIT)
            .await?;
        let scenario = self.scenarios.active_scenario(conversation.id).await?;
        let messages = self.prompts.build(
            conversation,
            &history,
            scenario.as_ref().map(|(s, step)| (s, step.as_ref())),
        );

        let request = CompletionRequest::new(messages)
            .with_temperature(self.settings.llm.temperature)
            .with_max_tokens(self.settings.llm.max_tokens);
        let outcome = self
            .executor
            .invoke(Job::GenerateReply { request })
            .await?;
        Ok(outcome.into_completion()?.content)
    }

    async fn record_outbound(
        &self,
        conversation: &Conversation,
        subject: &str,
        text: &str,
        sender: SenderRole,
    ) -> Result<Message, EngineError> {
        let sent_at = Utc::now();
        let message = self
            .store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                subject: Some(subject.to_string()),
                sender: Some(sender),
                direction: Some(MessageDirection::Outbound),
                body_plain: Some(text.to_string()),
                body_html: Some(plain_to_html(text)),
                detected_language: conversation.language.clone(),
                sent_at: Some(sent_at),
                ..Default::default()
            })
            .await?;

        // An outbound message means "answered", whether it came from the
        // assistant or a manager.
        self.store
            .set_conversation_status(conversation.id, ConversationStatus::AnsweredByLlm)
            .await?;
        self.store
            .touch_conversation(conversation.id, sent_at, Some(&preview_of(text)))
            .await?;
        self.store
            .append_log(NewLogEntry {
                conversation_id: conversation.id,
                event: LogEvent::MessageSent,
                actor: match sender {
                    SenderRole::Manager => LogActor::Manager,
                    _ => LogActor::Assistant,
                },
                summary: "Outbound message recorded".to_string(),
                details: Some(json!({ "message_id": message.id })),
                context: None,
            })
            .await?;
        Ok(message)
    }

    async fn escalate(&self, conversation_id: i64, summary: &str) -> Result<(), EngineError> {
        self.store
            .set_conversation_status(conversation_id, ConversationStatus::NeedsHuman)
            .await?;
        self.store
            .append_log(NewLogEntry {
                conversation_id,
                event: LogEvent::HumanInterventionRequired,
                actor: LogActor::System,
                summary: summary.to_string(),
                details: None,
                context: None,
            })
            .await?;
        Ok(())
    }
}

/// Derive a reply subject from the conversation topic or inbound subject.
pub fn reply_subject(subject: &str) -> String {
    let normalized = subject.trim();
    if normalized.is_empty() {
        return "Re:".to_string();
    }
    if normalized.len() >= 3 && normalized.as_bytes()[..3].eq_ignore_ascii_case(b"re:") {
        return normalized.to_string();
    }
    format!("Re: {normalized}")
}
