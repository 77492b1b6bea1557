//! Thread resolution: attach an inbound email to the right conversation.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::error::EngineError;
use crate::mail::InboundEmail;
use crate::model::{preview_of, Client, Conversation, ConversationStatus};
use crate::store::Store;

/// Topic used when an inbound email carries no subject.
pub const DEFAULT_TOPIC: &str = "Без темы";

/// Resolves inbound emails to `(Client, Conversation)` pairs, creating both
/// when nothing matches. Closed conversations are never picked, so a reply
/// to a closed thread starts a fresh conversation.
pub struct ThreadResolver {
    store: Arc<dyn Store>,
}

impl ThreadResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        email: &InboundEmail,
    ) -> Result<(Client, Conversation), EngineError> {
        let client = self.resolve_client(email).await?;

        // Strongest signal: the email replies to a message we already store.
        if let Some(in_reply_to) = &email.in_reply_to {
            if let Some(message) = self.store.find_message_by_external_id(in_reply_to).await? {
                if let Some(conversation) =
                    self.store.get_conversation(message.conversation_id).await?
                {
                    if !conversation.status.is_closed() {
                        debug!(
                            conversation_id = conversation.id,
                            in_reply_to = %in_reply_to,
                            "Thread resolved via In-Reply-To"
                        );
                        return Ok((client, conversation));
                    }
                }
            }
        }

        let topic = email
            .subject
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_TOPIC);
        let open = self.store.open_conversations_for_client(client.id).await?;

        if let Some(matching) = open.iter().find(|c| c.topic.as_deref() == Some(topic)) {
            return Ok((client, matching.clone()));
        }
        if let Some(most_recent) = open.into_iter().next() {
            return Ok((client, most_recent));
        }

        let preview = email.best_text().map(|t| preview_of(&t));
        let conversation = self
            .store
            .create_conversation(
                client.id,
                Some(topic),
                ConversationStatus::AwaitingResponse,
                Some(email.date.unwrap_or_else(Utc::now)),
                preview.as_deref(),
            )
            .await?;
        debug!(
            conversation_id = conversation.id,
            client_id = client.id,
            topic = %topic,
            "New conversation created"
        );
        Ok((client, conversation))
    }

    async fn resolve_client(&self, email: &InboundEmail) -> Result<Client, EngineError> {
        let address = email.from_address.trim().to_lowercase();
        if let Some(mut client) = self.store.find_client_by_email(&address).await? {
            if client.name.is_none() {
                if let Some(name) = &email.from_name {
                    self.store.set_client_name(client.id, name).await?;
                    client.name = Some(name.clone());
                }
            }
            return Ok(client);
        }
        Ok(self
            .store
            .create_client(&address, email.from_name.as_deref())
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewMessage;
    use crate::store::MemoryStore;

    fn email(from: &str, subject: Option<&str>, in_reply_to: Option<&str>) -> InboundEmail {
        InboundEmail {
            uid: 1,
            message_id: Some("<new@mail>".to_string()),
            subject: subject.map(str::to_string),
            from_address: from.to_string(),
            from_name: Some("Ivan".to_string()),
            to_addresses: vec!["support@shop.ru".to_string()],
            date: None,
            body_plain: Some("Добрый день, вопрос по заказу".to_string()),
            body_html: None,
            in_reply_to: in_reply_to.map(str::to_string),
            references: Vec::new(),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn creates_client_and_conversation_for_first_contact() {
        let store = Arc::new(MemoryStore::new());
        let resolver = ThreadResolver::new(store.clone());

        let (client, conversation) = resolver
            .resolve(&email("Ivan@Example.com", Some("Заказ 42"), None))
            .await
            .unwrap();

        assert_eq!(client.email, "ivan@example.com");
        assert_eq!(client.name.as_deref(), Some("Ivan"));
        assert_eq!(conversation.topic.as_deref(), Some("Заказ 42"));
        assert_eq!(conversation.status, ConversationStatus::AwaitingResponse);
        assert!(conversation.last_message_preview.is_some());
    }

    #[tokio::test]
    async fn in_reply_to_beats_topic_matching() {
        let store = Arc::new(MemoryStore::new());
        let resolver = ThreadResolver::new(store.clone());

        let client = store.create_client("ivan@example.com", None).await.unwrap();
        let by_reply = store
            .create_conversation(
                client.id,
                Some("Old thread"),
                ConversationStatus::AnsweredByLlm,
                None,
                None,
            )
            .await
            .unwrap();
        store
            .create_conversation(
                client.id,
                Some("Заказ 42"),
                ConversationStatus::AwaitingResponse,
                None,
                None,
            )
            .await
            .unwrap();
        store
            .insert_message(NewMessage {
                conversation_id: by_reply.id,
                external_id: Some("<sent@mail>".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let (_, conversation) = resolver
            .resolve(&email(
                "ivan@example.com",
                Some("Заказ 42"),
                Some("<sent@mail>"),
            ))
            .await
            .unwrap();
        assert_eq!(conversation.id, by_reply.id);
    }

    #[tokio::test]
    async fn topic_match_wins_over_most_recent() {
        let store = Arc::new(MemoryStore::new());
        let resolver = ThreadResolver::new(store.clone());

        let client = store.create_client("ivan@example.com", None).await.unwrap();
        let by_topic = store
            .create_conversation(
                client.id,
                Some("Доставка"),
                ConversationStatus::AwaitingResponse,
                None,
                None,
            )
            .await
            .unwrap();
        store
            .create_conversation(
                client.id,
                Some("Другое"),
                ConversationStatus::AwaitingResponse,
                None,
                None,
            )
            .await
            .unwrap();

        let (_, conversation) = resolver
            .resolve(&email("ivan@example.com", Some("Доставка"), None))
            .await
            .unwrap();
        assert_eq!(conversation.id, by_topic.id);
    }

    #[tokio::test]
    async fn missing_subject_falls_back_to_default_topic() {
        let store = Arc::new(MemoryStore::new());
        let resolver = ThreadResolver::new(store.clone());

        let (_, conversation) = resolver
            .resolve(&email("ivan@example.com", None, None))
            .await
            .unwrap();
        assert_eq!(conversation.topic.as_deref(), Some(DEFAULT_TOPIC));
    }

    #[tokio::test]
    async fn closed_conversations_are_never_reopened() {
        let store = Arc::new(MemoryStore::new());
        let resolver = ThreadResolver::new(store.clone());

        let client = store.create_client("ivan@example.com", None).await.unwrap();
        let closed = store
            .create_conversation(
                client.id,
                Some("Заказ 42"),
                ConversationStatus::AwaitingResponse,
                None,
                None,
            )
            .await
            .unwrap();
        store
            .insert_message(NewMessage {
                conversation_id: closed.id,
                external_id: Some("<sent@mail>".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .set_conversation_status(closed.id, ConversationStatus::Closed)
            .await
            .unwrap();

        let (_, conversation) = resolver
            .resolve(&email(
                "ivan@example.com",
                Some("Заказ 42"),
                Some("<sent@mail>"),
            ))
            .await
            .unwrap();
        assert_ne!(conversation.id, closed.id);
        assert_eq!(conversation.status, ConversationStatus::AwaitingResponse);
    }

    #[tokio::test]
    async fn name_backfill_only_when_missing() {
        let store = Arc::new(MemoryStore::new());
        let resolver = ThreadResolver::new(store.clone());

        store
            .create_client("ivan@example.com", Some("Иван Петров"))
            .await
            .unwrap();
        let (client, _) = resolver
            .resolve(&email("ivan@example.com", None, None))
            .await
            .unwrap();
        assert_eq!(client.name.as_deref(), Some("Иван Петров"));
    }
}
