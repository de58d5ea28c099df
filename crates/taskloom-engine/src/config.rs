//! Engine configuration, read from the environment at startup

use std::path::PathBuf;

pub const DEFAULT_MAX_TURNS: u32 = 10;
pub const DEFAULT_MAX_DEPTH: usize = 5;
pub const DEFAULT_MAX_TOKENS_FRACTION: f64 = 0.8;

const DEFAULT_BASE_PROMPT: &str = "You are executing one atomic task. Follow the task \
     instructions exactly and answer with the task's result only.";

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub default_model: String,
    pub base_prompt: String,
    /// Assistant turns allowed per handler session (TASK_MAX_TURNS).
    pub max_turns: u32,
    /// Subtask nesting bound (TASK_MAX_DEPTH).
    pub max_depth: usize,
    /// Fraction of the model context budget a session may consume
    /// (TASK_MAX_TOKENS_FRACTION).
    pub max_tokens_fraction: f64,
    /// Base directory for relative file paths (TASK_WORKDIR).
    pub workdir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model: "claude-sonnet-4-20250514".to_string(),
            base_prompt: DEFAULT_BASE_PROMPT.to_string(),
            max_turns: DEFAULT_MAX_TURNS,
            max_depth: DEFAULT_MAX_DEPTH,
            max_tokens_fraction: DEFAULT_MAX_TOKENS_FRACTION,
            workdir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(turns) = env_parse::<u32>("TASK_MAX_TURNS") {
            config.max_turns = turns;
        }
        if let Some(depth) = env_parse::<usize>("TASK_MAX_DEPTH") {
            config.max_depth = depth;
        }
        if let Some(fraction) = env_parse::<f64>("TASK_MAX_TOKENS_FRACTION") {
            config.max_tokens_fraction = fraction.clamp(0.0, 1.0);
        }
        if let Ok(workdir) = std::env::var("TASK_WORKDIR") {
            if !workdir.is_empty() {
                config.workdir = PathBuf::from(workdir);
            }
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("ignoring unparseable {}={}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.max_turns, 10);
        assert_eq!(config.max_depth, 5);
        assert_eq!(config.max_tokens_fraction, 0.8);
    }
}
