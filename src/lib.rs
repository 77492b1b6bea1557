//! Avtomail, a support-inbox automation engine.
//!
//! Inbound client emails are threaded into conversations, optionally answered
//! by an LLM acting under a scripted scenario, and either sent automatically,
//! held as a draft, or escalated to a human operator.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod language;
pub mod llm;
pub mod mail;
pub mod model;
pub mod poller;
pub mod store;
