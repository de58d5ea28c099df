//! Depth and cycle accounting for nested subtask execution
//!
//! One stack per top-level request, threaded through recursive
//! invocations. Signatures hash the task name with canonicalised inputs,
//! so re-requesting the same work while it is still running is rejected
//! before any LLM call.

use serde_json::json;
use taskloom_core::{FailureReason, SubtaskRequest, TaskError};

#[derive(Default)]
pub struct SubtaskStack {
    signatures: Vec<u64>,
}

impl SubtaskStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.signatures.len()
    }

    /// Check depth and cycle limits for a request about to run.
    pub fn check(
        &self,
        request: &SubtaskRequest,
        default_max_depth: usize,
    ) -> Result<(), TaskError> {
        let max_depth = request.max_depth.unwrap_or(default_max_depth);
        if self.depth() >= max_depth {
            return Err(TaskError::failure(
                FailureReason::ExecutionHalted,
                format!(
                    "maximum subtask depth {} reached for '{}'",
                    max_depth,
                    request.identifier()
                ),
            )
            .with_details(json!({ "depth": self.depth(), "max_depth": max_depth })));
        }
        if self.signatures.contains(&request.signature()) {
            return Err(TaskError::failure(
                FailureReason::ExecutionHalted,
                format!(
                    "cycle detected: '{}' with identical inputs is already executing",
                    request.identifier()
                ),
            )
            .with_details(json!({ "depth": self.depth() })));
        }
        Ok(())
    }

    pub fn push(&mut self, request: &SubtaskRequest) {
        self.signatures.push(request.signature());
    }

    pub fn pop(&mut self) {
        self.signatures.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn depth_limit_enforced() {
        let mut stack = SubtaskStack::new();
        for i in 0..3 {
            let request = SubtaskRequest::named("step").with_input("i", Value::from(i));
            assert!(stack.check(&request, 3).is_ok());
            stack.push(&request);
        }
        let next = SubtaskRequest::named("step").with_input("i", Value::from(99));
        let err = stack.check(&next, 3).unwrap_err();
        assert_eq!(err.failure_reason(), Some(FailureReason::ExecutionHalted));
        assert_eq!(err.details.unwrap()["depth"], 3);
    }

    #[test]
    fn request_max_depth_overrides_default() {
        let mut stack = SubtaskStack::new();
        let mut request = SubtaskRequest::named("step");
        request.max_depth = Some(1);
        assert!(stack.check(&request, 5).is_ok());
        stack.push(&request);

        let mut next = SubtaskRequest::named("other");
        next.max_depth = Some(1);
        assert!(stack.check(&next, 5).is_err());
    }

    #[test]
    fn identical_request_is_a_cycle() {
        let mut stack = SubtaskStack::new();
        let request = SubtaskRequest::named("recurse").with_input("x", Value::from(1));
        stack.push(&request);

        let same = SubtaskRequest::named("recurse").with_input("x", Value::from(1));
        let err = stack.check(&same, 10).unwrap_err();
        assert_eq!(err.failure_reason(), Some(FailureReason::ExecutionHalted));
        assert!(err.message.contains("cycle"));

        let different = SubtaskRequest::named("recurse").with_input("x", Value::from(2));
        assert!(stack.check(&different, 10).is_ok());
    }

    #[test]
    fn pop_unwinds() {
        let mut stack = SubtaskStack::new();
        let request = SubtaskRequest::named("t");
        stack.push(&request);
        assert!(stack.check(&request, 10).is_err());
        stack.pop();
        assert!(stack.check(&request, 10).is_ok());
        assert_eq!(stack.depth(), 0);
    }
}
