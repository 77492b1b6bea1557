//! libSQL backend for the `Store` trait.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and
//! safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Connection, Database as LibSqlDatabase};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{
    Client, Conversation, ConversationStatus, LogActor, LogEntry, LogEvent, Message,
    MessageDirection, NewLogEntry, NewMessage, NewScenario, NewScenarioStep, Scenario,
    ScenarioState, ScenarioStep, SenderRole,
};
use crate::store::migrations;
use crate::store::traits::Store;

/// libSQL database backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests and ephemeral runs).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

/// Convert `Option<&str>` to a libsql value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

fn opt_i64(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

const CLIENT_COLUMNS: &str = "id, email, name, created_at, updated_at";

fn row_to_client(row: &libsql::Row) -> Result<Client, libsql::Error> {
    let created: String = row.get(3)?;
    let updated: String = row.get(4)?;
    Ok(Client {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

const CONVERSATION_COLUMNS: &str =
    "id, client_id, topic, status, language, last_message_at, last_message_preview, created_at, updated_at";

fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, libsql::Error> {
    let status_str: String = row.get(3)?;
    let last_at: Option<String> = row.get(5).ok();
    let created: String = row.get(7)?;
    let updated: String = row.get(8)?;
    Ok(Conversation {
        id: row.get(0)?,
        client_id: row.get(1)?,
        topic: row.get(2).ok(),
        status: ConversationStatus::parse(&status_str)
            .unwrap_or(ConversationStatus::AwaitingResponse),
        language: row.get(4).ok(),
        last_message_at: parse_optional_datetime(last_at),
        last_message_preview: row.get(6).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, external_id, in_reply_to, subject, sender, \
     direction, sender_address, sender_name, body_plain, body_html, detected_language, sent_at, \
     received_at, requires_attention, is_draft, created_at";

fn row_to_message(row: &libsql::Row) -> Result<Message, libsql::Error> {
    let sender_str: String = row.get(5)?;
    let direction_str: String = row.get(6)?;
    let sent_at: Option<String> = row.get(12).ok();
    let received_at: Option<String> = row.get(13).ok();
    let attention: i64 = row.get(14)?;
    let draft: i64 = row.get(15)?;
    let created: String = row.get(16)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        external_id: row.get(2).ok(),
        in_reply_to: row.get(3).ok(),
        subject: row.get(4).ok(),
        sender: SenderRole::parse(&sender_str).unwrap_or(SenderRole::Client),
        direction: MessageDirection::parse(&direction_str).unwrap_or(MessageDirection::Inbound),
        sender_address: row.get(7).ok(),
        sender_name: row.get(8).ok(),
        body_plain: row.get(9).ok(),
        body_html: row.get(10).ok(),
        detected_language: row.get(11).ok(),
        sent_at: parse_optional_datetime(sent_at),
        received_at: parse_optional_datetime(received_at),
        requires_attention: attention != 0,
        is_draft: draft != 0,
        created_at: parse_datetime(&created),
    })
}

const STEP_COLUMNS: &str =
    "id, scenario_id, order_index, title, description, ai_instructions, operator_hint";

fn row_to_step(row: &libsql::Row) -> Result<ScenarioStep, libsql::Error> {
    Ok(ScenarioStep {
        id: row.get(0)?,
        scenario_id: row.get(1)?,
        order_index: row.get(2)?,
        title: row.get(3).ok(),
        description: row.get(4).ok(),
        ai_instructions: row.get(5).ok(),
        operator_hint: row.get(6).ok(),
    })
}

const LOG_COLUMNS: &str = "id, conversation_id, event_type, actor, summary, details, context, created_at";

fn row_to_log(row: &libsql::Row) -> Result<LogEntry, libsql::Error> {
    let event_str: String = row.get(2)?;
    let actor_str: String = row.get(3)?;
    let details_str: Option<String> = row.get(5).ok();
    let created: String = row.get(7)?;
    Ok(LogEntry {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        event: LogEvent::parse(&event_str).unwrap_or(LogEvent::Note),
        actor: LogActor::parse(&actor_str).unwrap_or(LogActor::System),
        summary: row.get(4)?,
        details: details_str.and_then(|s| serde_json::from_str(&s).ok()),
        context: row.get(6).ok(),
        created_at: parse_datetime(&created),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn find_client_by_email(&self, email: &str) -> Result<Option<Client>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE email = ?1"),
                params![email],
            )
            .await
            .map_err(|e| StoreError::Query(format!("find_client_by_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_client(&row).map_err(|e| {
                StoreError::Query(format!("find_client_by_email row: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("find_client_by_email: {e}"))),
        }
    }

    async fn create_client(&self, email: &str, name: Option<&str>) -> Result<Client, StoreError> {
        let now = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO clients (email, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![email, opt_text(name), now.to_rfc3339(), now.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("create_client: {e}")))?;

        let id = self.conn().last_insert_rowid();
        debug!(client_id = id, email = %email, "Client created");
        Ok(Client {
            id,
            email: email.to_string(),
            name: name.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_client(&self, id: i64) -> Result<Option<Client>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_client: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_client(&row).map_err(|e| StoreError::Query(format!("get_client row: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_client: {e}"))),
        }
    }

    async fn set_client_name(&self, client_id: i64, name: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE clients SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, Utc::now().to_rfc3339(), client_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_client_name: {e}")))?;
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
        let now = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO conversations (client_id, topic, status, last_message_at, \
                 last_message_preview, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    client_id,
                    opt_text(topic),
                    status.as_str(),
                    opt_datetime(last_message_at),
                    opt_text(preview),
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("create_conversation: {e}")))?;

        let id = self.conn().last_insert_rowid();
        debug!(conversation_id = id, client_id, "Conversation created");
        Ok(Conversation {
            id,
            client_id,
            topic: topic.map(str::to_string),
            status,
            language: None,
            last_message_at,
            last_message_preview: preview.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_conversation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_conversation(&row).map_err(|e| {
                StoreError::Query(format!("get_conversation row: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_conversation: {e}"))),
        }
    }

    async fn open_conversations_for_client(
        &self,
        client_id: i64,
    ) -> Result<Vec<Conversation>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations \
                     WHERE client_id = ?1 AND status != 'closed' \
                     ORDER BY updated_at DESC, id DESC"
                ),
                params![client_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("open_conversations_for_client: {e}")))?;

        let mut conversations = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("open_conversations_for_client: {e}")))?
        {
            conversations.push(
                row_to_conversation(&row)
                    .map_err(|e| StoreError::Query(format!("open_conversations row: {e}")))?,
            );
        }
        Ok(conversations)
    }

    async fn set_conversation_status(
        &self,
        id: i64,
        status: ConversationStatus,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_conversation_status: {e}")))?;
        Ok(())
    }

    async fn set_conversation_language(&self, id: i64, language: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations SET language = ?1, updated_at = ?2 WHERE id = ?3",
                params![language, Utc::now().to_rfc3339(), id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_conversation_language: {e}")))?;
        Ok(())
    }

    async fn touch_conversation(
        &self,
        id: i64,
        last_message_at: DateTime<Utc>,
        preview: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        match preview {
            Some(preview) => self
                .conn()
                .execute(
                    "UPDATE conversations SET last_message_at = ?1, last_message_preview = ?2, \
                     updated_at = ?3 WHERE id = ?4",
                    params![last_message_at.to_rfc3339(), preview, now, id],
                )
                .await ,
            None => self
                .conn()
                .execute(
                    "UPDATE conversations SET last_message_at = ?1, updated_at = ?2 WHERE id = ?3",
                    params![last_message_at.to_rfc3339(), now, id],
                )
                .await,
        }
        .map_err(|e| StoreError::Query(format!("touch_conversation: {e}")))?;
        Ok(())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let now = Utc::now();
        let sender = message.sender.unwrap_or(SenderRole::Client);
        let direction = message.direction.unwrap_or(MessageDirection::Inbound);
        self.conn()
            .execute(
                "INSERT INTO messages (conversation_id, external_id, in_reply_to, subject, sender, \
                 direction, sender_address, sender_name, body_plain, body_html, detected_language, \
                 sent_at, received_at, requires_attention, is_draft, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    message.conversation_id,
                    opt_text_owned(message.external_id.clone()),
                    opt_text_owned(message.in_reply_to.clone()),
                    opt_text_owned(message.subject.clone()),
                    sender.as_str(),
                    direction.as_str(),
                    opt_text_owned(message.sender_address.clone()),
                    opt_text_owned(message.sender_name.clone()),
                    opt_text_owned(message.body_plain.clone()),
                    opt_text_owned(message.body_html.clone()),
                    opt_text_owned(message.detected_language.clone()),
                    opt_datetime(message.sent_at),
                    opt_datetime(message.received_at),
                    i64::from(message.requires_attention),
                    i64::from(message.is_draft),
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_message: {e}")))?;

        let id = self.conn().last_insert_rowid();
        debug!(
            message_id = id,
            conversation_id = message.conversation_id,
            direction = direction.as_str(),
            "Message inserted"
        );
        Ok(Message {
            id,
            conversation_id: message.conversation_id,
            external_id: message.external_id,
            in_reply_to: message.in_reply_to,
            subject: message.subject,
            sender,
            direction,
            sender_address: message.sender_address,
            sender_name: message.sender_name,
            body_plain: message.body_plain,
            body_html: message.body_html,
            detected_language: message.detected_language,
            sent_at: message.sent_at,
            received_at: message.received_at,
            requires_attention: message.requires_attention,
            is_draft: message.is_draft,
            created_at: now,
        })
    }

    async fn get_message(&self, id: i64) -> Result<Option<Message>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_message(&row)
                    .map_err(|e| StoreError::Query(format!("get_message row: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_message: {e}"))),
        }
    }

    async fn find_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE external_id = ?1 \
                     ORDER BY id LIMIT 1"
                ),
                params![external_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("find_message_by_external_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row).map_err(|e| {
                StoreError::Query(format!("find_message_by_external_id row: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("find_message_by_external_id: {e}"))),
        }
    }

    async fn recent_messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        // Fetch the newest `limit` rows, then restore chronological order.
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 \
                     ORDER BY id DESC LIMIT ?2"
                ),
                params![conversation_id, limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("recent_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("recent_messages: {e}")))?
        {
            messages.push(
                row_to_message(&row)
                    .map_err(|e| StoreError::Query(format!("recent_messages row: {e}")))?,
            );
        }
        messages.reverse();
        Ok(messages)
    }

    async fn set_message_flags(
        &self,
        id: i64,
        requires_attention: bool,
        is_draft: bool,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE messages SET requires_attention = ?1, is_draft = ?2 WHERE id = ?3",
                params![i64::from(requires_attention), i64::from(is_draft), id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_message_flags: {e}")))?;
        Ok(())
    }

    async fn create_scenario(&self, scenario: NewScenario) -> Result<Scenario, StoreError> {
        let now = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO scenarios (name, subject, description, ai_preamble, \
                 operator_guidelines, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    scenario.name.clone(),
                    opt_text_owned(scenario.subject.clone()),
                    opt_text_owned(scenario.description.clone()),
                    opt_text_owned(scenario.ai_preamble.clone()),
                    opt_text_owned(scenario.operator_guidelines.clone()),
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("create_scenario: {e}")))?;

        let id = self.conn().last_insert_rowid();
        Ok(Scenario {
            id,
            name: scenario.name,
            subject: scenario.subject,
            description: scenario.description,
            ai_preamble: scenario.ai_preamble,
            operator_guidelines: scenario.operator_guidelines,
            steps: Vec::new(),
        })
    }

    async fn add_scenario_step(
        &self,
        scenario_id: i64,
        step: NewScenarioStep,
    ) -> Result<ScenarioStep, StoreError> {
        self.conn()
            .execute(
                "INSERT INTO scenario_steps (scenario_id, order_index, title, description, \
                 ai_instructions, operator_hint, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    scenario_id,
                    step.order_index,
                    opt_text_owned(step.title.clone()),
                    opt_text_owned(step.description.clone()),
                    opt_text_owned(step.ai_instructions.clone()),
                    opt_text_owned(step.operator_hint.clone()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("add_scenario_step: {e}")))?;

        let id = self.conn().last_insert_rowid();
        Ok(ScenarioStep {
            id,
            scenario_id,
            order_index: step.order_index,
            title: step.title,
            description: step.description,
            ai_instructions: step.ai_instructions,
            operator_hint: step.operator_hint,
        })
    }

    async fn get_scenario(&self, id: i64) -> Result<Option<Scenario>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, subject, description, ai_preamble, operator_guidelines \
                 FROM scenarios WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_scenario: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(StoreError::Query(format!("get_scenario: {e}"))),
        };

        let mut scenario = Scenario {
            id: row
                .get(0)
                .map_err(|e| StoreError::Query(format!("get_scenario row: {e}")))?,
            name: row
                .get(1)
                .map_err(|e| StoreError::Query(format!("get_scenario row: {e}")))?,
            subject: row.get(2).ok(),
            description: row.get(3).ok(),
            ai_preamble: row.get(4).ok(),
            operator_guidelines: row.get(5).ok(),
            steps: Vec::new(),
        };

        let mut step_rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM scenario_steps WHERE scenario_id = ?1 \
                     ORDER BY order_index, id"
                ),
                params![id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_scenario steps: {e}")))?;

        while let Some(row) = step_rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_scenario steps: {e}")))?
        {
            scenario.steps.push(
                row_to_step(&row)
                    .map_err(|e| StoreError::Query(format!("get_scenario step row: {e}")))?,
            );
        }

        Ok(Some(scenario))
    }

    async fn get_step(&self, id: i64) -> Result<Option<ScenarioStep>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {STEP_COLUMNS} FROM scenario_steps WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_step: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_step(&row).map_err(|e| StoreError::Query(format!("get_step row: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_step: {e}"))),
        }
    }

    async fn scenario_state(
        &self,
        conversation_id: i64,
    ) -> Result<Option<ScenarioState>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT conversation_id, scenario_id, active_step_id, notes \
                 FROM conversation_scenario_states WHERE conversation_id = ?1",
                params![conversation_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("scenario_state: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(ScenarioState {
                conversation_id: row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("scenario_state row: {e}")))?,
                scenario_id: row
                    .get(1)
                    .map_err(|e| StoreError::Query(format!("scenario_state row: {e}")))?,
                active_step_id: row.get(2).ok(),
                notes: row.get(3).ok(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("scenario_state: {e}"))),
        }
    }

    async fn upsert_scenario_state(&self, state: &ScenarioState) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO conversation_scenario_states \
                 (conversation_id, scenario_id, active_step_id, notes, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(conversation_id) DO UPDATE SET scenario_id = excluded.scenario_id, \
                 active_step_id = excluded.active_step_id, notes = excluded.notes, \
                 updated_at = excluded.updated_at",
                params![
                    state.conversation_id,
                    state.scenario_id,
                    opt_i64(state.active_step_id),
                    opt_text(state.notes.as_deref()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert_scenario_state: {e}")))?;
        Ok(())
    }

    async fn set_active_step(
        &self,
        conversation_id: i64,
        step_id: Option<i64>,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversation_scenario_states SET active_step_id = ?1, updated_at = ?2 \
                 WHERE conversation_id = ?3",
                params![opt_i64(step_id), Utc::now().to_rfc3339(), conversation_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_active_step: {e}")))?;
        Ok(())
    }

    async fn append_log(&self, entry: NewLogEntry) -> Result<LogEntry, StoreError> {
        let now = Utc::now();
        let details_str = entry
            .details
            .as_ref()
            .map(|d| serde_json::to_string(d).map_err(|e| StoreError::Serialization(e.to_string())))
            .transpose()?;

        self.conn()
            .execute(
                "INSERT INTO conversation_logs (conversation_id, event_type, actor, summary, \
                 details, context, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.conversation_id,
                    entry.event.as_str(),
                    entry.actor.as_str(),
                    entry.summary.clone(),
                    opt_text_owned(details_str),
                    opt_text_owned(entry.context.clone()),
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_log: {e}")))?;

        let id = self.conn().last_insert_rowid();
        Ok(LogEntry {
            id,
            conversation_id: entry.conversation_id,
            event: entry.event,
            actor: entry.actor,
            summary: entry.summary,
            details: entry.details,
            context: entry.context,
            created_at: now,
        })
    }

    async fn log_entries(&self, conversation_id: i64) -> Result<Vec<LogEntry>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM conversation_logs WHERE conversation_id = ?1 \
                     ORDER BY id"
                ),
                params![conversation_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("log_entries: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("log_entries: {e}")))?
        {
            entries.push(
                row_to_log(&row).map_err(|e| StoreError::Query(format!("log_entries row: {e}")))?,
            );
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewMessage;

    async fn store() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn local_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("avtomail.db");

        {
            let store = LibSqlStore::new_local(&path).await.unwrap();
            store
                .create_client("ivan@example.com", Some("Ivan"))
                .await
                .unwrap();
        }

        let reopened = LibSqlStore::new_local(&path).await.unwrap();
        let client = reopened
            .find_client_by_email("ivan@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.name.as_deref(), Some("Ivan"));
    }

    #[tokio::test]
    async fn client_round_trip() {
        let store = store().await;
        assert!(store
            .find_client_by_email("ivan@example.com")
            .await
            .unwrap()
            .is_none());

        let client = store
            .create_client("ivan@example.com", Some("Ivan"))
            .await
            .unwrap();
        let found = store
            .find_client_by_email("ivan@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, client.id);
        assert_eq!(found.name.as_deref(), Some("Ivan"));
    }

    #[tokio::test]
    async fn open_conversations_exclude_closed() {
        let store = store().await;
        let client = store.create_client("a@x.com", None).await.unwrap();
        let open = store
            .create_conversation(
                client.id,
                Some("Delivery"),
                ConversationStatus::AwaitingResponse,
                None,
                None,
            )
            .await
            .unwrap();
        let closed = store
            .create_conversation(
                client.id,
                Some("Old"),
                ConversationStatus::AwaitingResponse,
                None,
                None,
            )
            .await
            .unwrap();
        store
            .set_conversation_status(closed.id, ConversationStatus::Closed)
            .await
            .unwrap();

        let result = store.open_conversations_for_client(client.id).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, open.id);
    }

    #[tokio::test]
    async fn message_lookup_by_external_id() {
        let store = store().await;
        let client = store.create_client("a@x.com", None).await.unwrap();
        let conversation = store
            .create_conversation(
                client.id,
                None,
                ConversationStatus::AwaitingResponse,
                None,
                None,
            )
            .await
            .unwrap();

        let inserted = store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                external_id: Some("<msg-1@mail>".to_string()),
                body_plain: Some("hello".to_string()),
                requires_attention: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let found = store
            .find_message_by_external_id("<msg-1@mail>")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, inserted.id);
        assert!(found.requires_attention);
        assert_eq!(found.conversation_id, conversation.id);
    }

    #[tokio::test]
    async fn recent_messages_window_is_chronological() {
        let store = store().await;
        let client = store.create_client("a@x.com", None).await.unwrap();
        let conversation = store
            .create_conversation(
                client.id,
                None,
                ConversationStatus::AwaitingResponse,
                None,
                None,
            )
            .await
            .unwrap();

        for i in 0..8 {
            store
                .insert_message(NewMessage {
                    conversation_id: conversation.id,
                    body_plain: Some(format!("message {i}")),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let recent = store.recent_messages(conversation.id, 6).await.unwrap();
        assert_eq!(recent.len(), 6);
        assert_eq!(recent[0].body_plain.as_deref(), Some("message 2"));
        assert_eq!(recent[5].body_plain.as_deref(), Some("message 7"));
    }

    #[tokio::test]
    async fn scenario_with_steps_round_trip() {
        let store = store().await;
        let scenario = store
            .create_scenario(NewScenario {
                name: "Refund flow".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .add_scenario_step(
                scenario.id,
                NewScenarioStep {
                    order_index: 2,
                    title: Some("Confirm order".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .add_scenario_step(
                scenario.id,
                NewScenarioStep {
                    order_index: 1,
                    title: Some("Greet".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let loaded = store.get_scenario(scenario.id).await.unwrap().unwrap();
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.steps[0].title.as_deref(), Some("Greet"));
        assert_eq!(loaded.steps[1].title.as_deref(), Some("Confirm order"));
    }

    #[tokio::test]
    async fn scenario_state_upsert_and_step_update() {
        let store = store().await;
        let client = store.create_client("a@x.com", None).await.unwrap();
        let conversation = store
            .create_conversation(
                client.id,
                None,
                ConversationStatus::AwaitingResponse,
                None,
                None,
            )
            .await
            .unwrap();
        let scenario = store
            .create_scenario(NewScenario {
                name: "Flow".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let step = store
            .add_scenario_step(scenario.id, NewScenarioStep::default())
            .await
            .unwrap();

        store
            .upsert_scenario_state(&ScenarioState {
                conversation_id: conversation.id,
                scenario_id: scenario.id,
                active_step_id: None,
                notes: Some("vip client".to_string()),
            })
            .await
            .unwrap();
        store
            .set_active_step(conversation.id, Some(step.id))
            .await
            .unwrap();

        let state = store
            .scenario_state(conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.scenario_id, scenario.id);
        assert_eq!(state.active_step_id, Some(step.id));
        assert_eq!(state.notes.as_deref(), Some("vip client"));
    }

    #[tokio::test]
    async fn log_entries_keep_append_order() {
        let store = store().await;
        let client = store.create_client("a@x.com", None).await.unwrap();
        let conversation = store
            .create_conversation(
                client.id,
                None,
                ConversationStatus::AwaitingResponse,
                None,
                None,
            )
            .await
            .unwrap();

        for (event, actor) in [
            (LogEvent::AutomationTriggered, LogActor::Client),
            (LogEvent::LlmDraftCreated, LogActor::Assistant),
            (LogEvent::MessageSent, LogActor::Assistant),
        ] {
            store
                .append_log(NewLogEntry {
                    conversation_id: conversation.id,
                    event,
                    actor,
                    summary: event.as_str().to_string(),
                    details: Some(serde_json::json!({"check": true})),
                    context: None,
                })
                .await
                .unwrap();
        }

        let entries = store.log_entries(conversation.id).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].event, LogEvent::AutomationTriggered);
        assert_eq!(entries[2].event, LogEvent::MessageSent);
        assert_eq!(entries[1].details.as_ref().unwrap()["check"], true);
    }
}
