//! IMAP/SMTP transport.
//!
//! Inbound mail is fetched over a raw IMAP session on rustls (blocking, run
//! in `spawn_blocking`); outbound goes through lettre. Both sides are hidden
//! behind the `MailTransport` trait so the engine and tests never touch
//! sockets directly.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Body, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::config::{ImapSettings, SmtpSettings};
use crate::error::MailError;
use crate::mail::types::{EmailAttachment, InboundEmail, OutboundEmail};

/// Transport seam between the engine and the mail servers.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Fetch unseen emails from the inbox folder. Fetched emails are flagged
    /// `\Seen` so a crash mid-batch cannot replay them.
    async fn fetch_unseen(&self) -> Result<Vec<InboundEmail>, MailError>;

    /// Deliver an outbound email.
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError>;

    /// Move a handled email out of the inbox into the processed folder.
    async fn mark_processed(&self, uid: u32) -> Result<(), MailError>;
}

/// Production transport: IMAP for inbound, lettre SMTP for outbound.
pub struct SmtpImapTransport {
    imap: ImapSettings,
    smtp: SmtpSettings,
}

impl SmtpImapTransport {
    pub fn new(imap: ImapSettings, smtp: SmtpSettings) -> Self {
        Self { imap, smtp }
    }

    fn smtp_transport(&self) -> Result<SmtpTransport, MailError> {
        let (Some(username), Some(password)) = (&self.smtp.username, &self.smtp.password) else {
            return Err(MailError::NotConfigured("smtp"));
        };
        let creds = Credentials::new(
            username.clone(),
            password.expose_secret().to_string(),
        );

        let builder = if self.smtp.use_starttls {
            SmtpTransport::starttls_relay(&self.smtp.host)
        } else {
            SmtpTransport::relay(&self.smtp.host)
        }
        .map_err(|e| MailError::Send(format!("SMTP relay setup: {e}")))?;

        Ok(builder.port(self.smtp.port).credentials(creds).build())
    }

    fn build_message(&self, email: &OutboundEmail) -> Result<lettre::Message, MailError> {
        let from: Mailbox =
            self.smtp
                .from_address
                .parse()
                .map_err(|e| MailError::InvalidAddress {
                    address: self.smtp.from_address.clone(),
                    reason: format!("{e}"),
                })?;

        let mut builder = lettre::Message::builder()
            .from(from)
            .subject(email.subject.clone());

        for to in &email.to_addresses {
            let mailbox: Mailbox = to.parse().map_err(|e| MailError::InvalidAddress {
                address: to.clone(),
                reason: format!("{e}"),
            })?;
            builder = builder.to(mailbox);
        }

        if let Some(in_reply_to) = &email.in_reply_to {
            builder = builder.in_reply_to(in_reply_to.clone());
        }
        if !email.references.is_empty() {
            builder = builder.references(email.references.join(" "));
        }

        let body_part = match &email.body_html {
            Some(html) => {
                MultiPart::alternative_plain_html(email.body_plain.clone(), html.clone())
            }
            None => MultiPart::mixed().singlepart(SinglePart::plain(email.body_plain.clone())),
        };

        let message = if email.attachments.is_empty() {
            builder
                .multipart(body_part)
                .map_err(|e| MailError::Send(format!("Failed to build email: {e}")))?
        } else {
            let mut mixed = MultiPart::mixed().multipart(body_part);
            for attachment in &email.attachments {
                let content_type = ContentType::parse(&attachment.content_type)
                    .unwrap_or(ContentType::parse("application/octet-stream").map_err(|e| {
                        MailError::Send(format!("Invalid attachment content type: {e}"))
                    })?);
                mixed = mixed.singlepart(
                    Attachment::new(attachment.filename.clone())
                        .body(Body::new(attachment.data.clone()), content_type),
                );
            }
            builder
                .multipart(mixed)
                .map_err(|e| MailError::Send(format!("Failed to build email: {e}")))?
        };

        Ok(message)
    }
}

#[async_trait]
impl MailTransport for SmtpImapTransport {
    async fn fetch_unseen(&self) -> Result<Vec<InboundEmail>, MailError> {
        if !self.imap.is_configured() {
            return Err(MailError::NotConfigured("imap"));
        }
        let imap = self.imap.clone();
        let result = tokio::task::spawn_blocking(move || fetch_unseen_blocking(&imap))
            .await
            .map_err(|e| MailError::Fetch(format!("Fetch task panicked: {e}")))??;
        debug!(count = result.len(), "Fetched unseen emails");
        Ok(result)
    }

    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError> {
        let transport = self.smtp_transport()?;
        let message = self.build_message(email)?;
        let to = email.to_addresses.join(", ");

        tokio::task::spawn_blocking(move || {
            transport
                .send(&message)
                .map(|_| ())
                .map_err(|e| MailError::Send(format!("SMTP send failed: {e}")))
        })
        .await
        .map_err(|e| MailError::Send(format!("Send task panicked: {e}")))??;

        info!(to = %to, "Email sent");
        Ok(())
    }

    async fn mark_processed(&self, uid: u32) -> Result<(), MailError> {
        if !self.imap.is_configured() {
            return Err(MailError::NotConfigured("imap"));
        }
        let imap = self.imap.clone();
        tokio::task::spawn_blocking(move || mark_processed_blocking(&imap, uid))
            .await
            .map_err(|e| MailError::Fetch(format!("Mark task panicked: {e}")))??;
        Ok(())
    }
}

// ── Blocking IMAP session ───────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Minimal tagged-command IMAP session over rustls.
struct ImapSession {
    tls: TlsStream,
    tag_counter: u32,
}

impl ImapSession {
    fn connect(settings: &ImapSettings) -> Result<Self, MailError> {
        let tcp = TcpStream::connect((&*settings.host, settings.port))
            .map_err(|e| MailError::Connect(format!("TCP connect to {}: {e}", settings.host)))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))
            .map_err(|e| MailError::Connect(format!("Socket timeout: {e}")))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(settings.host.clone())
            .map_err(|e| MailError::Connect(format!("Invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailError::Connect(format!("TLS setup: {e}")))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            tag_counter: 0,
        };
        // Server greeting.
        session.read_line()?;
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, MailError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(&mut self.tls, &mut byte) {
                Ok(0) => return Err(MailError::Fetch("IMAP connection closed".to_string())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(MailError::Fetch(format!("IMAP read: {e}"))),
            }
        }
    }

    /// Send one tagged command and collect lines through the tagged reply.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, MailError> {
        self.tag_counter += 1;
        let tag = format!("A{}", self.tag_counter);
        let full = format!("{tag} {cmd}\r\n");
        IoWrite::write_all(&mut self.tls, full.as_bytes())
            .map_err(|e| MailError::Fetch(format!("IMAP write: {e}")))?;
        IoWrite::flush(&mut self.tls).map_err(|e| MailError::Fetch(format!("IMAP flush: {e}")))?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                return Ok(lines);
            }
        }
    }

    fn command_ok(&mut self, cmd: &str, what: &str) -> Result<Vec<String>, MailError> {
        let lines = self.command(cmd)?;
        if lines.last().is_some_and(|l| l.contains("OK")) {
            Ok(lines)
        } else {
            Err(MailError::Fetch(format!("IMAP {what} failed")))
        }
    }

    fn login(&mut self, settings: &ImapSettings) -> Result<(), MailError> {
        let (Some(username), Some(password)) = (&settings.username, &settings.password) else {
            return Err(MailError::NotConfigured("imap"));
        };
        self.command_ok(
            &format!("LOGIN \"{}\" \"{}\"", username, password.expose_secret()),
            "login",
        )?;
        Ok(())
    }

    fn select(&mut self, folder: &str) -> Result<(), MailError> {
        self.command_ok(&format!("SELECT \"{folder}\""), "select")?;
        Ok(())
    }

    fn search_unseen(&mut self) -> Result<Vec<u32>, MailError> {
        let lines = self.command("SEARCH UNSEEN")?;
        let mut uids = Vec::new();
        for line in &lines {
            if let Some(rest) = line.strip_prefix("* SEARCH") {
                uids.extend(rest.split_whitespace().filter_map(|s| s.parse::<u32>().ok()));
            }
        }
        Ok(uids)
    }

    /// Fetch the raw RFC822 source of one message.
    fn fetch_raw(&mut self, uid: u32) -> Result<String, MailError> {
        let lines = self.command(&format!("FETCH {uid} RFC822"))?;
        // First line is the untagged FETCH intro, last is the tagged reply.
        Ok(lines
            .iter()
            .skip(1)
            .take(lines.len().saturating_sub(2))
            .cloned()
            .collect())
    }

    fn mark_seen(&mut self, uid: u32) {
        let _ = self.command(&format!("STORE {uid} +FLAGS (\\Seen)"));
    }

    fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }
}

fn fetch_unseen_blocking(settings: &ImapSettings) -> Result<Vec<InboundEmail>, MailError> {
    let mut session = ImapSession::connect(settings)?;
    session.login(settings)?;
    session.select(&settings.folder)?;

    let uids = session.search_unseen()?;
    let mut results = Vec::new();
    for uid in uids {
        let raw = session.fetch_raw(uid)?;
        match parse_inbound(uid, raw.as_bytes()) {
            Some(email) => results.push(email),
            None => warn!(uid, "Skipping unparseable email"),
        }
        session.mark_seen(uid);
    }
    session.logout();
    Ok(results)
}

fn mark_processed_blocking(settings: &ImapSettings, uid: u32) -> Result<(), MailError> {
    let mut session = ImapSession::connect(settings)?;
    session.login(settings)?;
    session.select(&settings.folder)?;

    // Copy into the processed folder, then delete from the inbox. A missing
    // target folder aborts before the delete so the email is never lost.
    session.command_ok(
        &format!("COPY {uid} \"{}\"", settings.processed_folder),
        "copy",
    )?;
    session.command_ok(&format!("STORE {uid} +FLAGS (\\Deleted)"), "store")?;
    session.command_ok("EXPUNGE", "expunge")?;
    session.logout();
    Ok(())
}

// ── Parsing ─────────────────────────────────────────────────────────

/// Parse a raw RFC822 email into the engine's inbound type.
pub(crate) fn parse_inbound(uid: u32, raw: &[u8]) -> Option<InboundEmail> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed.from().and_then(|a| a.first());
    let from_address = from.and_then(|a| a.address()).map(str::to_string)?;
    let from_name = from
        .and_then(|a| a.name())
        .map(str::to_string)
        .filter(|n| !n.is_empty());

    let to_addresses = parsed
        .to()
        .map(|addrs| {
            addrs
                .iter()
                .filter_map(|a| a.address())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let in_reply_to = parsed
        .in_reply_to()
        .as_text_list()
        .and_then(|ids| ids.first().map(|s| s.to_string()));
    let references = parsed
        .header("References")
        .and_then(|h| h.as_text_list())
        .map(|ids| ids.iter().map(|s| s.to_string()).collect())
        .unwrap_or_default();

    let mut attachments = Vec::new();
    for part in parsed.attachments() {
        let filename = part.attachment_name().unwrap_or("attachment").to_string();
        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(subtype) => format!("{}/{subtype}", ct.ctype()),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        attachments.push(EmailAttachment {
            filename,
            content_type,
            data: part.contents().to_vec(),
        });
    }

    Some(InboundEmail {
        uid,
        message_id: parsed.message_id().map(str::to_string),
        subject: parsed.subject().map(str::to_string),
        from_address,
        from_name,
        to_addresses,
        date: parsed
            .date()
            .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0)),
        body_plain: parsed.body_text(0).map(|t| t.to_string()),
        body_html: parsed.body_html(0).map(|t| t.to_string()),
        in_reply_to,
        references,
        attachments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW_REPLY: &str = "From: Ivan Petrov <ivan@example.com>\r\n\
        To: support@shop.ru\r\n\
        Subject: Re: Order 42\r\n\
        Message-ID: <m2@mail.example.com>\r\n\
        In-Reply-To: <m1@mail.example.com>\r\n\
        References: <m0@mail.example.com> <m1@mail.example.com>\r\n\
        Date: Mon, 24 Aug 2026 10:00:00 +0000\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        \r\n\
        Where is my order?\r\n";

    #[test]
    fn parse_inbound_extracts_threading_headers() {
        let email = parse_inbound(7, RAW_REPLY.as_bytes()).unwrap();
        assert_eq!(email.uid, 7);
        assert_eq!(email.from_address, "ivan@example.com");
        assert_eq!(email.from_name.as_deref(), Some("Ivan Petrov"));
        assert_eq!(email.subject.as_deref(), Some("Re: Order 42"));
        assert_eq!(email.message_id.as_deref(), Some("m2@mail.example.com"));
        assert_eq!(email.in_reply_to.as_deref(), Some("m1@mail.example.com"));
        assert_eq!(
            email.references,
            vec!["m0@mail.example.com", "m1@mail.example.com"]
        );
        assert_eq!(email.body_plain.as_deref(), Some("Where is my order?\n"));
    }

    #[test]
    fn parse_inbound_requires_sender() {
        let raw = "Subject: no sender\r\n\r\nbody\r\n";
        assert!(parse_inbound(1, raw.as_bytes()).is_none());
    }

    #[test]
    fn build_message_includes_thread_headers() {
        let transport = SmtpImapTransport::new(
            crate::config::Settings::default().imap,
            crate::config::Settings::default().smtp,
        );
        let email = OutboundEmail {
            to_addresses: vec!["ivan@example.com".to_string()],
            subject: "Re: Order 42".to_string(),
            body_plain: "On its way".to_string(),
            body_html: Some("<p>On its way</p>".to_string()),
            in_reply_to: Some("<m2@mail.example.com>".to_string()),
            references: vec![
                "<m1@mail.example.com>".to_string(),
                "<m2@mail.example.com>".to_string(),
            ],
            attachments: Vec::new(),
        };
        let message = transport.build_message(&email).unwrap();
        let rendered = String::from_utf8(message.formatted()).unwrap();
        assert!(rendered.contains("In-Reply-To: <m2@mail.example.com>"));
        assert!(rendered.contains("References: <m1@mail.example.com> <m2@mail.example.com>"));
        assert!(rendered.contains("Subject: Re: Order 42"));
    }

    #[test]
    fn build_message_rejects_bad_address() {
        let transport = SmtpImapTransport::new(
            crate::config::Settings::default().imap,
            crate::config::Settings::default().smtp,
        );
        let email = OutboundEmail {
            to_addresses: vec!["not an address".to_string()],
            subject: "x".to_string(),
            body_plain: "x".to_string(),
            body_html: None,
            in_reply_to: None,
            references: Vec::new(),
            attachments: Vec::new(),
        };
        assert!(matches!(
            transport.build_message(&email),
            Err(MailError::InvalidAddress { .. })
        ));
    }
}
