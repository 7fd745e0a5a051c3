//! Retry classifier: maps an agent failure report to a retry policy.
//!
//! Classification is a pure function of the error text and the current
//! retry count -- no hidden state, no clock. The per-category policy
//! table is configuration ([`RetryPolicies`]); the reference values ship
//! as its `Default`.

use serde::{Deserialize, Serialize};

/// Failure category recognized by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network flake, API rate limit -- the work itself is fine.
    Transient,
    /// The verifier rejected the result.
    VerificationFailure,
    /// The agent ran out of time or memory.
    ResourceExhaustion,
    /// The specification is ambiguous; retrying cannot help.
    SpecAmbiguity,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::VerificationFailure => "verification_failure",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::SpecAmbiguity => "spec_ambiguity",
            Self::Unknown => "unknown",
        }
    }
}

/// Backoff plan for a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// `base_ms * 2^retry_count`, capped at `cap_ms`.
    Exponential { base_ms: u64, cap_ms: u64 },
    Constant { delay_ms: u64 },
    None,
}

impl Backoff {
    /// Advisory delay before the next attempt, given how many retries
    /// have already happened.
    pub fn delay_ms(self, retry_count: u32) -> u64 {
        match self {
            Self::Exponential { base_ms, cap_ms } => {
                let shift = retry_count.min(16);
                base_ms.saturating_mul(1u64 << shift).min(cap_ms)
            }
            Self::Constant { delay_ms } => delay_ms,
            Self::None => 0,
        }
    }
}

/// Per-category retry budget and backoff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

/// The policy table, one entry per category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicies {
    pub transient: RetryPolicy,
    pub verification_failure: RetryPolicy,
    pub resource_exhaustion: RetryPolicy,
    pub spec_ambiguity: RetryPolicy,
    pub unknown: RetryPolicy,
}

impl RetryPolicies {
    pub fn policy(&self, category: ErrorCategory) -> RetryPolicy {
        match category {
            ErrorCategory::Transient => self.transient,
            ErrorCategory::VerificationFailure => self.verification_failure,
            ErrorCategory::ResourceExhaustion => self.resource_exhaustion,
            ErrorCategory::SpecAmbiguity => self.spec_ambiguity,
            ErrorCategory::Unknown => self.unknown,
        }
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            transient: RetryPolicy {
                max_retries: 5,
                backoff: Backoff::Exponential {
                    base_ms: 1_000,
                    cap_ms: 60_000,
                },
            },
            verification_failure: RetryPolicy {
                max_retries: 3,
                backoff: Backoff::Constant { delay_ms: 5_000 },
            },
            resource_exhaustion: RetryPolicy {
                max_retries: 2,
                backoff: Backoff::Exponential {
                    base_ms: 10_000,
                    cap_ms: 120_000,
                },
            },
            spec_ambiguity: RetryPolicy {
                max_retries: 0,
                backoff: Backoff::None,
            },
            unknown: RetryPolicy {
                max_retries: 3,
                backoff: Backoff::Exponential {
                    base_ms: 2_000,
                    cap_ms: 60_000,
                },
            },
        }
    }
}

/// The classifier's verdict, persisted verbatim as the ticket's
/// `retry_strategy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDecision {
    pub category: ErrorCategory,
    pub subcategory: Option<String>,
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Advisory: the scheduler must not dispatch a retried ticket before
    /// this delay has passed, and may wait longer.
    pub next_delay_ms: u64,
    pub attempts_remaining: u32,
    pub should_retry: bool,
}

/// Classify a failure report.
///
/// Matching is ordered so that the most specific signals win: explicit
/// ambiguity first (never retriable), then timeouts and memory (the word
/// "timeout" alone must not read as a network flake), then rate limits
/// and network errors, then verifier rejections. Anything else is
/// `unknown`.
pub fn classify(policies: &RetryPolicies, error_text: &str, retry_count: u32) -> RetryDecision {
    let text = error_text.to_lowercase();

    let (category, subcategory) = if contains_any(
        &text,
        &["ambiguous", "ambiguity", "underspecified", "clarification needed", "conflicting requirements"],
    ) {
        (ErrorCategory::SpecAmbiguity, None)
    } else if contains_any(&text, &["timed out", "timeout", "deadline exceeded", "wall time"]) {
        (ErrorCategory::ResourceExhaustion, Some("timeout"))
    } else if contains_any(&text, &["out of memory", "oom", "memory limit", "killed (signal 9"]) {
        (ErrorCategory::ResourceExhaustion, Some("memory"))
    } else if contains_any(&text, &["rate limit", "too many requests", "429", "overloaded"]) {
        (ErrorCategory::Transient, Some("rate_limit"))
    } else if contains_any(
        &text,
        &[
            "connection refused",
            "connection reset",
            "network",
            "unreachable",
            "dns",
            "502",
            "503",
            "bad gateway",
            "service unavailable",
        ],
    ) {
        (ErrorCategory::Transient, Some("network"))
    } else if contains_any(
        &text,
        &["verification failed", "checks failed", "tests failed", "lint failed", "build failed"],
    ) {
        (ErrorCategory::VerificationFailure, None)
    } else {
        (ErrorCategory::Unknown, None)
    };

    let policy = policies.policy(category);
    let should_retry = retry_count < policy.max_retries && category != ErrorCategory::SpecAmbiguity;
    let attempts_remaining = policy.max_retries.saturating_sub(retry_count);

    RetryDecision {
        category,
        subcategory: subcategory.map(str::to_owned),
        max_retries: policy.max_retries,
        backoff: policy.backoff,
        next_delay_ms: policy.backoff.delay_ms(retry_count),
        attempts_remaining,
        should_retry,
    }
}

fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}
