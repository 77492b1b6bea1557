//! Mail layer: wire types, HTML helpers, and the IMAP/SMTP transport.

pub mod html;
pub mod transport;
pub mod types;

pub use transport::{MailTransport, SmtpImapTransport};
pub use types::{EmailAttachment, InboundEmail, OutboundEmail};
