//! Taskloom Core - Task results, requests, templates, and error handling

pub mod error;
pub mod template;
pub mod types;

pub use error::{Error, Result};
pub use template::*;
pub use types::*;
