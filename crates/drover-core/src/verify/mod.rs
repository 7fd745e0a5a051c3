//! Verification client: ships a completed ticket's branch to the external
//! multi-phase verifier and returns its verdict.
//!
//! The verifier's internals (check executors, sandboxes) are not drover's
//! business; the engine consumes a pass/fail verdict plus feedback.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The standard verification phases, in order.
pub const DEFAULT_PHASES: [&str; 3] = ["static", "automated", "sentinel"];

/// Request payload for one verification run.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationRequest {
    pub ticket_id: Uuid,
    pub branch_name: String,
    pub repo_url: String,
    /// 1-based attempt number.
    pub attempt: i32,
    pub acceptance_criteria: String,
    pub phases: Vec<String>,
}

/// Verdict status reported by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Passed,
    Failed,
}

/// The verifier's verdict for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    #[serde(default)]
    pub ready_for_pr: bool,
    /// Human-readable structured feedback, stored as a ticket artifact.
    #[serde(default)]
    pub feedback_for_agent: serde_json::Value,
    /// Opaque evidence blob (logs, check output digests).
    #[serde(default)]
    pub evidence: serde_json::Value,
}

impl Verdict {
    /// Whether this verdict promotes the ticket toward a PR.
    pub fn is_pass(&self) -> bool {
        self.status == VerdictStatus::Passed || self.ready_for_pr
    }
}

/// Trait for verifier backends.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Human-readable name of the backend.
    fn name(&self) -> &str;

    /// Run the verification phases for a ticket attempt.
    async fn verify(&self, request: &VerificationRequest) -> Result<Verdict>;
}

// Compile-time assertion: Verifier must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Verifier) {}
};

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Verifier reached over HTTP: `POST {base_url}/verify`.
pub struct HttpVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVerifier {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    fn name(&self) -> &str {
        "http"
    }

    async fn verify(&self, request: &VerificationRequest) -> Result<Verdict> {
        let url = format!("{}/verify", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("verifier unreachable at {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("verifier returned {status}: {body}");
        }

        let verdict = response
            .json::<Verdict>()
            .await
            .context("failed to decode verifier verdict")?;

        Ok(verdict)
    }
}
