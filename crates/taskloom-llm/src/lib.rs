//! Taskloom LLM - Provider adapters behind a single completion trait

pub mod anthropic;
pub mod mock;
pub mod provider;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use mock::{MockBehavior, MockProvider};
pub use provider::{LlmError, LlmProvider, LlmResult};
pub use types::*;
