//! taskloom — task-orchestration runtime for LLM-driven workflows
//!
//! The root crate carries the dispatcher and the `taskloom` CLI binary;
//! the runtime lives in the workspace crates (core, llm, tools, lang,
//! engine).

pub mod dispatcher;

pub use dispatcher::{Dispatcher, DispatchOutput};
