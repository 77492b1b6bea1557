//! Wire-level email types shared by the transport and the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A decoded attachment. Bytes travel base64-encoded when a job payload is
/// serialized for the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// An email fetched from the inbox, already parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEmail {
    /// IMAP sequence/UID within the selected folder, used for mark-processed.
    pub uid: u32,
    /// RFC-5322 Message-ID, when the sender set one.
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from_address: String,
    pub from_name: Option<String>,
    pub to_addresses: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<EmailAttachment>,
}

impl InboundEmail {
    /// Best available text: plain body, else HTML flattened to text, else
    /// the subject line.
    pub fn best_text(&self) -> Option<String> {
        if let Some(plain) = self.body_plain.as_deref().filter(|t| !t.trim().is_empty()) {
            return Some(plain.to_string());
        }
        if let Some(html) = self.body_html.as_deref() {
            let stripped = crate::mail::html::strip_html(html);
            if !stripped.is_empty() {
                return Some(stripped);
            }
        }
        self.subject.clone().filter(|s| !s.trim().is_empty())
    }
}

/// An email to deliver via SMTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to_addresses: Vec<String>,
    pub subject: String,
    pub body_plain: String,
    pub body_html: Option<String>,
    /// Message-ID being answered, emitted as the In-Reply-To header.
    pub in_reply_to: Option<String>,
    /// Thread ancestry, emitted as the References header.
    pub references: Vec<String>,
    pub attachments: Vec<EmailAttachment>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_bytes_travel_as_base64() {
        let attachment = EmailAttachment {
            filename: "invoice.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            data: vec![0x25, 0x50, 0x44, 0x46],
        };
        let json = serde_json::to_value(&attachment).unwrap();
        assert_eq!(json["data"], "JVBERg==");

        let back: EmailAttachment = serde_json::from_value(json).unwrap();
        assert_eq!(back, attachment);
    }

    #[test]
    fn outbound_email_serializes_for_queue() {
        let email = OutboundEmail {
            to_addresses: vec!["ivan@example.com".to_string()],
            subject: "Re: Заказ".to_string(),
            body_plain: "Готово".to_string(),
            body_html: None,
            in_reply_to: Some("<abc@mail>".to_string()),
            references: vec!["<root@mail>".to_string(), "<abc@mail>".to_string()],
            attachments: Vec::new(),
        };
        let json = serde_json::to_string(&email).unwrap();
        let back: OutboundEmail = serde_json::from_str(&json).unwrap();
        assert_eq!(back.subject, "Re: Заказ");
        assert_eq!(back.references.len(), 2);
    }
}
