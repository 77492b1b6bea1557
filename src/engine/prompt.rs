//! Prompt assembly for reply generation.
//!
//! Output is fully determined by the conversation snapshot passed in: one
//! language-selected system turn, an optional scenario turn, then the recent
//! message history as user/assistant turns.

use crate::mail::html::strip_html;
use crate::model::{Conversation, Message, Scenario, ScenarioStep, SenderRole};
use crate::llm::ChatMessage;

/// How many trailing messages of the conversation enter the prompt.
pub const HISTORY_LIMIT: usize = 6;

pub struct PromptBuilder {
    marker: String,
}

impl PromptBuilder {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    /// Build the transcript for one completion call. `history` is the
    /// conversation's messages in chronological order; only the last
    /// `HISTORY_LIMIT` are used.
    pub fn build(
        &self,
        conversation: &Conversation,
        history: &[Message],
        scenario: Option<(&Scenario, Option<&ScenarioStep>)>,
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(
            self.system_prompt(conversation.language.as_deref()),
        )];

        if let Some((scenario, step)) = scenario {
            messages.push(ChatMessage::system(scenario_turn(scenario, step)));
        }

        let start = history.len().saturating_sub(HISTORY_LIMIT);
        for message in &history[start..] {
            let Some(content) = message_text(message) else {
                continue;
            };
            messages.push(match message.sender {
                SenderRole::Client => ChatMessage::user(content),
                _ => ChatMessage::assistant(content),
            });
        }

        messages
    }

    fn system_prompt(&self, language: Option<&str>) -> String {
        if language.is_some_and(|l| l.starts_with("en")) {
            format!(
                "You are a sales manager assistant. Respond politely, professionally, and concisely. \
                 Always answer in the customer's language. If you are unsure, start the reply with \
                 the word '{}' and explain why human help is needed.",
                self.marker
            )
        } else {
            format!(
                "Ты виртуальный менеджер по продажам компании. \
                 Отвечай вежливо, кратко и по делу. \
                 Всегда отвечай на языке клиента. Если не уверен, начни ответ со слова '{}' \
                 и объясни, что требуется помощь менеджера.",
                self.marker
            )
        }
    }
}

/// Concatenate the scenario briefing, skipping absent fields.
fn scenario_turn(scenario: &Scenario, step: Option<&ScenarioStep>) -> String {
    let mut parts: Vec<String> = Vec::new();
    for field in [&scenario.subject, &scenario.description, &scenario.ai_preamble] {
        if let Some(text) = field.as_deref().filter(|t| !t.trim().is_empty()) {
            parts.push(text.to_string());
        }
    }
    if let Some(step) = step {
        parts.push(
            step.title
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| format!("Step {}", step.order_index)),
        );
        for field in [&step.description, &step.ai_instructions] {
            if let Some(text) = field.as_deref().filter(|t| !t.trim().is_empty()) {
                parts.push(text.to_string());
            }
        }
    }
    parts.join("\n")
}

fn message_text(message: &Message) -> Option<String> {
    if let Some(plain) = message.body_plain.as_deref().filter(|t| !t.trim().is_empty()) {
        return Some(plain.to_string());
    }
    message
        .body_html
        .as_deref()
        .map(strip_html)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::llm::ChatRole;
    use crate::model::{ConversationStatus, MessageDirection};

    fn conversation(language: Option<&str>) -> Conversation {
        Conversation {
            id: 1,
            client_id: 1,
            topic: Some("Заказ".to_string()),
            status: ConversationStatus::AwaitingResponse,
            language: language.map(str::to_string),
            last_message_at: None,
            last_message_preview: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn message(id: i64, sender: SenderRole, plain: Option<&str>, html: Option<&str>) -> Message {
        Message {
            id,
            conversation_id: 1,
            external_id: None,
            in_reply_to: None,
            subject: None,
            sender,
            direction: MessageDirection::Inbound,
            sender_address: None,
            sender_name: None,
            body_plain: plain.map(str::to_string),
            body_html: html.map(str::to_string),
            detected_language: None,
            sent_at: None,
            received_at: None,
            requires_attention: false,
            is_draft: false,
            created_at: Utc::now(),
        }
    }

    fn scenario_with_step() -> Scenario {
        Scenario {
            id: 1,
            name: "Возврат".to_string(),
            subject: Some("Возврат товара".to_string()),
            description: Some("Клиент хочет вернуть заказ".to_string()),
            ai_preamble: Some("Уточни номер заказа".to_string()),
            operator_guidelines: None,
            steps: vec![ScenarioStep {
                id: 10,
                scenario_id: 1,
                order_index: 1,
                title: None,
                description: Some("Запросить причину возврата".to_string()),
                ai_instructions: Some("Не обещай возврат денег".to_string()),
                operator_hint: None,
            }],
        }
    }

    #[test]
    fn russian_system_prompt_is_default() {
        let builder = PromptBuilder::new("MANAGER");
        let messages = builder.build(&conversation(None), &[], None);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.starts_with("Ты виртуальный менеджер"));
        assert!(messages[0].content.contains("'MANAGER'"));
    }

    #[test]
    fn english_language_selects_english_prompt() {
        let builder = PromptBuilder::new("MANAGER");
        let messages = builder.build(&conversation(Some("en")), &[], None);
        assert!(messages[0].content.starts_with("You are a sales manager"));
    }

    #[test]
    fn scenario_turn_concatenates_fields_with_step_fallback_title() {
        let builder = PromptBuilder::new("MANAGER");
        let scenario = scenario_with_step();
        let step = scenario.first_step();
        let messages = builder.build(&conversation(None), &[], Some((&scenario, step)));

        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[1].content,
            "Возврат товара\nКлиент хочет вернуть заказ\nУточни номер заказа\nStep 1\n\
             Запросить причину возврата\nНе обещай возврат денег"
        );
    }

    #[test]
    fn history_window_keeps_last_six_and_maps_roles() {
        let builder = PromptBuilder::new("MANAGER");
        let history: Vec<Message> = (0..8)
            .map(|i| {
                let sender = if i % 2 == 0 {
                    SenderRole::Client
                } else {
                    SenderRole::Assistant
                };
                message(i, sender, Some(&format!("msg {i}")), None)
            })
            .collect();

        let messages = builder.build(&conversation(None), &history, None);
        // System turn + six history turns.
        assert_eq!(messages.len(), 7);
        assert_eq!(messages[1].content, "msg 2");
        assert_eq!(messages[1].role, ChatRole::User);
        assert_eq!(messages[2].role, ChatRole::Assistant);
        assert_eq!(messages[6].content, "msg 7");
    }

    #[test]
    fn html_only_messages_are_stripped_and_empty_ones_skipped() {
        let builder = PromptBuilder::new("MANAGER");
        let history = vec![
            message(1, SenderRole::Client, None, Some("<p>вопрос</p>")),
            message(2, SenderRole::Assistant, None, None),
        ];
        let messages = builder.build(&conversation(None), &history, None);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "вопрос");
    }

    #[test]
    fn output_is_deterministic() {
        let builder = PromptBuilder::new("MANAGER");
        let history = vec![message(1, SenderRole::Client, Some("привет"), None)];
        let scenario = scenario_with_step();
        let first = builder.build(&conversation(None), &history, Some((&scenario, None)));
        let second = builder.build(&conversation(None), &history, Some((&scenario, None)));
        assert_eq!(
            first.iter().map(|m| &m.content).collect::<Vec<_>>(),
            second.iter().map(|m| &m.content).collect::<Vec<_>>()
        );
    }
}
