//! Conversation automation engine.
//!
//! `ThreadResolver` maps inbound emails to conversations, `PromptBuilder`
//! turns a conversation snapshot into a chat transcript, `ScenarioEngine`
//! manages scripted playbooks, and `AutomationEngine` orchestrates the whole
//! inbound-to-reply flow.

pub mod automation;
pub mod prompt;
pub mod scenario;
pub mod thread;

pub use automation::{AutomationEngine, AutomationOutcome};
pub use prompt::PromptBuilder;
pub use scenario::{Direction, ScenarioEngine};
pub use thread::ThreadResolver;
