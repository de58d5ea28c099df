//! Resource accounting for one handler session
//!
//! Turns and token counts only ever increase. Limits are checked before
//! the LLM call so an over-budget session never reaches the provider.

use taskloom_core::{ResourceKind, TaskError};
use taskloom_llm::Usage;
use tracing::warn;

const CHARS_PER_TOKEN: f32 = 4.0;
pub const WARN_THRESHOLD: f64 = 0.8;

#[derive(Debug)]
pub struct ResourceMeter {
    turns_used: u32,
    turns_limit: u32,
    tokens_used: u64,
    tokens_limit: u64,
    max_context_tokens: u64,
    context_fraction: f64,
    warn_threshold: f64,
    warnings: Vec<ResourceKind>,
}

impl ResourceMeter {
    pub fn new(turns_limit: u32, tokens_limit: u64, max_context_tokens: u64) -> Self {
        Self {
            turns_used: 0,
            turns_limit,
            tokens_used: 0,
            tokens_limit,
            max_context_tokens,
            context_fraction: 0.0,
            warn_threshold: WARN_THRESHOLD,
            warnings: Vec::new(),
        }
    }

    pub fn estimate_tokens(text: &str) -> u64 {
        (text.len() as f32 / CHARS_PER_TOKEN).ceil() as u64
    }

    pub fn turns_used(&self) -> u32 {
        self.turns_used
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    pub fn context_fraction(&self) -> f64 {
        self.context_fraction
    }

    pub fn warnings(&self) -> &[ResourceKind] {
        &self.warnings
    }

    /// Check that one more assistant turn fits.
    pub fn check_turn(&self) -> Result<(), TaskError> {
        if u64::from(self.turns_used) + 1 > u64::from(self.turns_limit) {
            return Err(TaskError::resource(
                ResourceKind::Turns,
                u64::from(self.turns_used) + 1,
                u64::from(self.turns_limit),
            ));
        }
        Ok(())
    }

    /// Check that the estimated prompt fits the token and context budgets.
    pub fn check_prompt(&mut self, estimated_prompt_tokens: u64) -> Result<(), TaskError> {
        if estimated_prompt_tokens > self.max_context_tokens {
            return Err(TaskError::resource(
                ResourceKind::ContextWindow,
                estimated_prompt_tokens,
                self.max_context_tokens,
            ));
        }
        if self.tokens_used + estimated_prompt_tokens > self.tokens_limit {
            return Err(TaskError::resource(
                ResourceKind::Tokens,
                self.tokens_used + estimated_prompt_tokens,
                self.tokens_limit,
            ));
        }
        self.context_fraction = estimated_prompt_tokens as f64 / self.max_context_tokens as f64;
        self.fire_warnings();
        Ok(())
    }

    /// Count one assistant turn.
    pub fn record_turn(&mut self) {
        self.turns_used += 1;
        self.fire_warnings();
    }

    /// Account for a completed call, preferring provider-reported usage
    /// over the estimate.
    pub fn record_usage(&mut self, usage: Option<Usage>, estimated_tokens: u64) {
        let spent = match usage {
            Some(u) => u64::from(u.input_tokens) + u64::from(u.output_tokens),
            None => estimated_tokens,
        };
        self.tokens_used += spent;
        self.fire_warnings();
    }

    fn fire_warnings(&mut self) {
        let turn_fraction = if self.turns_limit > 0 {
            f64::from(self.turns_used) / f64::from(self.turns_limit)
        } else {
            0.0
        };
        let token_fraction = if self.tokens_limit > 0 {
            self.tokens_used as f64 / self.tokens_limit as f64
        } else {
            0.0
        };

        for (kind, fraction) in [
            (ResourceKind::Turns, turn_fraction),
            (ResourceKind::Tokens, token_fraction),
            (ResourceKind::ContextWindow, self.context_fraction),
        ] {
            if fraction >= self.warn_threshold && !self.warnings.contains(&kind) {
                warn!("resource usage at {:.0}% of {:?} budget", fraction * 100.0, kind);
                self.warnings.push(kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimation_rounds_up() {
        assert_eq!(ResourceMeter::estimate_tokens(""), 0);
        assert_eq!(ResourceMeter::estimate_tokens("hi"), 1);
        assert_eq!(ResourceMeter::estimate_tokens("hello"), 2);
    }

    #[test]
    fn turn_limit_blocks_before_breach() {
        let mut meter = ResourceMeter::new(2, 1_000, 10_000);
        assert!(meter.check_turn().is_ok());
        meter.record_turn();
        assert!(meter.check_turn().is_ok());
        meter.record_turn();

        let err = meter.check_turn().unwrap_err();
        assert_eq!(err.resource_kind(), Some(taskloom_core::ResourceKind::Turns));
        assert_eq!(err.details.as_ref().unwrap()["limit"], 2);
    }

    #[test]
    fn token_limit_blocks_oversized_prompt() {
        let mut meter = ResourceMeter::new(10, 100, 10_000);
        assert!(meter.check_prompt(60).is_ok());
        meter.record_usage(None, 60);
        let err = meter.check_prompt(60).unwrap_err();
        assert_eq!(
            err.resource_kind(),
            Some(taskloom_core::ResourceKind::Tokens)
        );
    }

    #[test]
    fn context_window_blocks_independently() {
        let mut meter = ResourceMeter::new(10, 1_000_000, 100);
        let err = meter.check_prompt(200).unwrap_err();
        assert_eq!(
            err.resource_kind(),
            Some(taskloom_core::ResourceKind::ContextWindow)
        );
    }

    #[test]
    fn usage_is_monotonic() {
        let mut meter = ResourceMeter::new(10, 1_000, 10_000);
        let mut last_turns = 0;
        let mut last_tokens = 0;
        for _ in 0..5 {
            meter.record_turn();
            meter.record_usage(
                Some(Usage {
                    input_tokens: 5,
                    output_tokens: 7,
                }),
                0,
            );
            assert!(meter.turns_used() > last_turns);
            assert!(meter.tokens_used() > last_tokens);
            last_turns = meter.turns_used();
            last_tokens = meter.tokens_used();
        }
        assert_eq!(meter.tokens_used(), 60);
    }

    #[test]
    fn warning_fires_once_at_threshold() {
        let mut meter = ResourceMeter::new(10, 1_000, 10_000);
        for _ in 0..8 {
            meter.record_turn();
        }
        assert_eq!(meter.warnings(), &[taskloom_core::ResourceKind::Turns]);
        meter.record_turn();
        assert_eq!(meter.warnings().len(), 1);
    }
}
