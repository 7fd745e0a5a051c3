//! Pull-request creation against the project repository's hosting
//! provider.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Request to open a PR from a ticket's work branch.
#[derive(Debug, Clone, Serialize)]
pub struct PrRequest {
    pub repo_url: String,
    pub head_branch: String,
    pub base_branch: String,
    pub title: String,
    pub body: String,
}

/// Trait for PR-creation backends.
#[async_trait]
pub trait PrCreator: Send + Sync {
    /// Open a pull request and return its URL.
    async fn create_pr(&self, request: &PrRequest) -> Result<String>;
}

// Compile-time assertion: PrCreator must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn PrCreator) {}
};

// ---------------------------------------------------------------------------
// GitHub implementation
// ---------------------------------------------------------------------------

/// PR creator speaking the GitHub REST API.
pub struct GithubPrCreator {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct CreatePullBody<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    html_url: String,
}

impl GithubPrCreator {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_api_base("https://api.github.com", token)
    }

    /// Point at a non-default API host (GitHub Enterprise, test stubs).
    pub fn with_api_base(api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            token: token.into(),
        }
    }
}

/// Extract the `owner/repo` slug from a GitHub repository URL.
///
/// Accepts `https://github.com/owner/repo`, with or without a trailing
/// `.git`, and `git@github.com:owner/repo.git`.
pub fn repo_slug(repo_url: &str) -> Result<String> {
    let trimmed = repo_url.trim_end_matches('/').trim_end_matches(".git");

    let path = if let Some(rest) = trimmed.strip_prefix("git@") {
        // git@host:owner/repo
        match rest.split_once(':') {
            Some((_host, path)) => path,
            None => bail!("cannot parse repository URL {repo_url:?}"),
        }
    } else if let Some(idx) = trimmed.find("://") {
        // scheme://host/owner/repo
        let after_scheme = &trimmed[idx + 3..];
        match after_scheme.split_once('/') {
            Some((_host, path)) => path,
            None => bail!("cannot parse repository URL {repo_url:?}"),
        }
    } else {
        bail!("cannot parse repository URL {repo_url:?}");
    };

    let mut parts = path.split('/').filter(|s| !s.is_empty());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), None) => Ok(format!("{owner}/{repo}")),
        _ => bail!("repository URL {repo_url:?} is not an owner/repo path"),
    }
}

#[async_trait]
impl PrCreator for GithubPrCreator {
    async fn create_pr(&self, request: &PrRequest) -> Result<String> {
        let slug = repo_slug(&request.repo_url)?;
        let url = format!("{}/repos/{}/pulls", self.api_base.trim_end_matches('/'), slug);

        let body = CreatePullBody {
            title: &request.title,
            head: &request.head_branch,
            base: &request.base_branch,
            body: &request.body,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("User-Agent", "drover")
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("PR creation for {slug} returned {status}: {text}");
        }

        let pull = response
            .json::<PullResponse>()
            .await
            .context("failed to decode PR creation response")?;

        Ok(pull.html_url)
    }
}
