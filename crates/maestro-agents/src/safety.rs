//! Safety validation seam.
//!
//! Task text is checked by a [`SafetyValidator`] before it is ever handed
//! to an agent. The real guardrail is external; [`KeywordGuardrail`] is a
//! small in-process implementation for hosts without one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Verdict returned by a safety validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    /// Whether the text may be processed.
    pub is_valid: bool,
    /// Explanation, mostly useful on rejection.
    pub message: String,
}

impl SafetyVerdict {
    /// An accepting verdict.
    #[must_use]
    pub fn allow() -> Self {
        Self { is_valid: true, message: String::new() }
    }

    /// A rejecting verdict with `message`.
    #[must_use]
    pub fn reject(message: impl Into<String>) -> Self {
        Self { is_valid: false, message: message.into() }
    }
}

/// Policy check gating task assignment.
#[async_trait]
pub trait SafetyValidator: Send + Sync {
    /// Validates free text.
    async fn validate(&self, text: &str) -> SafetyVerdict;
}

/// Validator that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllValidator;

#[async_trait]
impl SafetyValidator for AllowAllValidator {
    async fn validate(&self, _text: &str) -> SafetyVerdict {
        SafetyVerdict::allow()
    }
}

/// Rejects text that is too long, is only control characters, or contains
/// a blocked phrase (case-insensitive).
#[derive(Debug, Clone)]
pub struct KeywordGuardrail {
    blocked: Vec<String>,
    max_length: usize,
}

impl KeywordGuardrail {
    /// Creates a guardrail blocking `phrases`.
    #[must_use]
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blocked: phrases.into_iter().map(|p| p.into().to_lowercase()).collect(),
            max_length: 100_000,
        }
    }

    /// Overrides the maximum accepted length in bytes.
    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }
}

impl Default for KeywordGuardrail {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

#[async_trait]
impl SafetyValidator for KeywordGuardrail {
    async fn validate(&self, text: &str) -> SafetyVerdict {
        if text.len() > self.max_length {
            return SafetyVerdict::reject("Input exceeds maximum length");
        }

        if !text.is_empty() && text.chars().all(char::is_control) {
            return SafetyVerdict::reject("Input contains only control characters");
        }

        let lowered = text.to_lowercase();
        if let Some(phrase) = self.blocked.iter().find(|p| lowered.contains(p.as_str())) {
            return SafetyVerdict::reject(format!("Input contains blocked phrase '{}'", phrase));
        }

        SafetyVerdict::allow()
    }
}
