//! Code host client
//!
//! Git operations run through the `git` CLI; pull-request operations go
//! through the host's REST API.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::CodeHostConfig;
use crate::domain::PullRequestRef;

/// Errors from code host operations
#[derive(Debug, Error)]
pub enum CodeHostError {
    #[error("Git command failed: {0}")]
    Git(String),

    #[error("Repository not found: {0}")]
    NoSuchRepo(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid repository URL: {0}")]
    InvalidUrl(String),
}

impl CodeHostError {
    /// Whether retrying the call can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            CodeHostError::Api { status, .. } => *status >= 500,
            CodeHostError::Network(_) => true,
            CodeHostError::Io(_) => true,
            _ => false,
        }
    }
}

/// Operations the orchestrator performs against the code host
#[async_trait]
pub trait CodeHost: Send + Sync {
    /// Clone a repository; a valid existing clone is left in place
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), CodeHostError>;

    /// Create (or re-enter) a feature branch off the default branch
    async fn create_branch(&self, workdir: &Path, branch: &str) -> Result<(), CodeHostError>;

    /// Stage and commit everything; None when the tree is clean
    async fn commit_all(&self, workdir: &Path, message: &str) -> Result<Option<String>, CodeHostError>;

    /// Push a branch to origin
    async fn push(&self, workdir: &Path, branch: &str) -> Result<(), CodeHostError>;

    /// SHA of the current HEAD
    async fn latest_commit(&self, workdir: &Path) -> Result<String, CodeHostError>;

    /// Files changed relative to HEAD
    async fn changed_files(&self, workdir: &Path) -> Result<Vec<String>, CodeHostError>;

    /// Open a pull request; returns the existing one for the branch if any
    async fn open_pull_request(
        &self,
        repo_url: &str,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestRef, CodeHostError>;

    /// Open pull requests of a repository
    async fn list_pull_requests(&self, repo_url: &str) -> Result<Vec<PullRequestRef>, CodeHostError>;

    /// Merge a pull request
    async fn merge_pull_request(&self, repo_url: &str, pr: &PullRequestRef) -> Result<(), CodeHostError>;
}

/// Git CLI + REST API implementation of [`CodeHost`]
pub struct GitCliHost {
    api_base_url: String,
    api_token: Option<String>,
    #[allow(dead_code)]
    workdir_base: PathBuf,
    timeout: Duration,
    http: Client,
}

impl GitCliHost {
    pub fn from_config(config: &CodeHostConfig) -> Result<Self, CodeHostError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(CodeHostError::Network)?;

        Ok(Self {
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_token: std::env::var(&config.api_token_env).ok(),
            workdir_base: config.workdir_base.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            http,
        })
    }

    async fn git(&self, workdir: &Path, args: &[&str]) -> Result<String, CodeHostError> {
        debug!(?args, workdir = %workdir.display(), "Running git");
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("git")
                .args(args)
                .current_dir(workdir)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| CodeHostError::Git(format!("git {} timed out", args.join(" "))))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CodeHostError::Git(format!("git {}: {}", args.join(" "), stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// `owner/repo` slug from a clone URL
    fn repo_slug(repo_url: &str) -> Result<String, CodeHostError> {
        let trimmed = repo_url.trim_end_matches('/').trim_end_matches(".git");
        // Last ':' covers both scheme and scp-style URLs; empty segments
        // from '//' are filtered below
        let path = trimmed.rsplit_once(':').map(|(_, p)| p).unwrap_or(trimmed);

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 2 {
            return Err(CodeHostError::InvalidUrl(repo_url.to_string()));
        }
        Ok(format!(
            "{}/{}",
            segments[segments.len() - 2],
            segments[segments.len() - 1]
        ))
    }

    fn api_request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, url).header("user-agent", "boardflow");
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        request
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, CodeHostError> {
        let status = response.status().as_u16();
        if status == 404 {
            return Err(CodeHostError::NoSuchRepo(response.url().to_string()));
        }
        if status >= 400 {
            return Err(CodeHostError::Api {
                status,
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct ApiPullRequest {
    number: u64,
    html_url: String,
    #[serde(default)]
    merged: bool,
    head: ApiPrHead,
}

#[derive(Debug, Deserialize)]
struct ApiPrHead {
    #[serde(rename = "ref")]
    branch: String,
}

impl From<ApiPullRequest> for PullRequestRef {
    fn from(pr: ApiPullRequest) -> Self {
        PullRequestRef {
            number: pr.number,
            url: pr.html_url,
            branch: pr.head.branch,
            merged: pr.merged,
        }
    }
}

#[async_trait]
impl CodeHost for GitCliHost {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), CodeHostError> {
        if dest.join(".git").exists() {
            debug!(dest = %dest.display(), "Clone already present, fetching instead");
            self.git(dest, &["fetch", "origin"]).await?;
            return Ok(());
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let dest_str = dest.to_string_lossy().to_string();
        // Clone runs from the parent directory; dest may not exist yet
        let cwd = dest.parent().unwrap_or(Path::new("."));
        self.git(cwd, &["clone", url, &dest_str]).await?;
        info!(url, dest = %dest.display(), "Cloned repository");
        Ok(())
    }

    async fn create_branch(&self, workdir: &Path, branch: &str) -> Result<(), CodeHostError> {
        // Re-entering an existing branch keeps retries idempotent
        let existing = self.git(workdir, &["branch", "--list", branch]).await?;
        if existing.trim().is_empty() {
            self.git(workdir, &["checkout", "-b", branch]).await?;
            info!(branch, "Created feature branch");
        } else {
            self.git(workdir, &["checkout", branch]).await?;
        }
        Ok(())
    }

    async fn commit_all(&self, workdir: &Path, message: &str) -> Result<Option<String>, CodeHostError> {
        self.git(workdir, &["add", "-A"]).await?;

        let status = self.git(workdir, &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            debug!("Nothing to commit");
            return Ok(None);
        }

        self.git(workdir, &["commit", "-m", message]).await?;
        let sha = self.latest_commit(workdir).await?;
        Ok(Some(sha))
    }

    async fn push(&self, workdir: &Path, branch: &str) -> Result<(), CodeHostError> {
        self.git(workdir, &["push", "-u", "origin", branch]).await?;
        Ok(())
    }

    async fn latest_commit(&self, workdir: &Path) -> Result<String, CodeHostError> {
        let sha = self.git(workdir, &["rev-parse", "HEAD"]).await?;
        Ok(sha.trim().to_string())
    }

    async fn changed_files(&self, workdir: &Path) -> Result<Vec<String>, CodeHostError> {
        let output = self.git(workdir, &["status", "--porcelain"]).await?;
        Ok(output
            .lines()
            .filter_map(|line| {
                let trimmed = line.trim();
                if trimmed.len() > 3 {
                    Some(trimmed[3..].to_string())
                } else {
                    None
                }
            })
            .collect())
    }

    async fn open_pull_request(
        &self,
        repo_url: &str,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestRef, CodeHostError> {
        // Idempotent on retry: an open PR for the branch is returned as-is
        let existing = self.list_pull_requests(repo_url).await?;
        if let Some(pr) = existing.into_iter().find(|pr| pr.branch == branch) {
            debug!(branch, pr = pr.number, "Pull request already open for branch");
            return Ok(pr);
        }

        let slug = Self::repo_slug(repo_url)?;
        let url = format!("{}/repos/{}/pulls", self.api_base_url, slug);
        let response = self
            .api_request(reqwest::Method::POST, url)
            .json(&serde_json::json!({
                "title": title,
                "body": body,
                "head": branch,
                "base": "main",
            }))
            .send()
            .await?;
        let response = self.check(response).await?;

        let pr: ApiPullRequest = response
            .json()
            .await
            .map_err(|e| CodeHostError::Api {
                status: 0,
                message: e.to_string(),
            })?;
        info!(pr = pr.number, branch, "Opened pull request");
        Ok(pr.into())
    }

    async fn list_pull_requests(&self, repo_url: &str) -> Result<Vec<PullRequestRef>, CodeHostError> {
        let slug = Self::repo_slug(repo_url)?;
        let url = format!("{}/repos/{}/pulls?state=open", self.api_base_url, slug);
        let response = self.api_request(reqwest::Method::GET, url).send().await?;
        let response = self.check(response).await?;

        let prs: Vec<ApiPullRequest> = response
            .json()
            .await
            .map_err(|e| CodeHostError::Api {
                status: 0,
                message: e.to_string(),
            })?;
        Ok(prs.into_iter().map(Into::into).collect())
    }

    async fn merge_pull_request(&self, repo_url: &str, pr: &PullRequestRef) -> Result<(), CodeHostError> {
        let slug = Self::repo_slug(repo_url)?;
        let url = format!("{}/repos/{}/pulls/{}/merge", self.api_base_url, slug, pr.number);
        let response = self.api_request(reqwest::Method::PUT, url).send().await?;

        // Merging an already-merged PR reports a conflict; treat as done
        if response.status().as_u16() == 405 || response.status().as_u16() == 409 {
            debug!(pr = pr.number, "Pull request already merged");
            return Ok(());
        }
        self.check(response).await?;
        info!(pr = pr.number, "Merged pull request");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_slug_https() {
        assert_eq!(
            GitCliHost::repo_slug("https://example.com/acme/service.git").unwrap(),
            "acme/service"
        );
        assert_eq!(
            GitCliHost::repo_slug("https://example.com/acme/service/").unwrap(),
            "acme/service"
        );
    }

    #[test]
    fn test_repo_slug_ssh() {
        assert_eq!(
            GitCliHost::repo_slug("git@example.com:acme/service.git").unwrap(),
            "acme/service"
        );
    }

    #[test]
    fn test_repo_slug_invalid() {
        assert!(GitCliHost::repo_slug("not-a-url").is_err());
    }

    #[test]
    fn test_error_retryability() {
        assert!(
            CodeHostError::Api {
                status: 503,
                message: "".into()
            }
            .is_retryable()
        );
        assert!(!CodeHostError::Git("fatal".into()).is_retryable());
        assert!(!CodeHostError::NoSuchRepo("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_git_operations_in_temp_repo() {
        let temp = tempfile::tempdir().unwrap();
        let config = CodeHostConfig::default();
        let host = GitCliHost::from_config(&config).unwrap();

        // Initialize a repo manually; clone_repo needs a remote
        let init = Command::new("git")
            .args(["init", "-b", "main"])
            .current_dir(temp.path())
            .output()
            .await
            .unwrap();
        assert!(init.status.success());
        for args in [
            ["config", "user.email", "test@example.com"].as_slice(),
            ["config", "user.name", "Test"].as_slice(),
        ] {
            Command::new("git").args(args).current_dir(temp.path()).output().await.unwrap();
        }

        tokio::fs::write(temp.path().join("a.txt"), "hello").await.unwrap();
        let sha = host.commit_all(temp.path(), "initial").await.unwrap();
        assert!(sha.is_some());

        // Clean tree commits nothing
        let sha = host.commit_all(temp.path(), "empty").await.unwrap();
        assert!(sha.is_none());

        host.create_branch(temp.path(), "feature/x").await.unwrap();
        // Re-entering the same branch is fine
        host.create_branch(temp.path(), "feature/x").await.unwrap();

        tokio::fs::write(temp.path().join("b.txt"), "more").await.unwrap();
        let changed = host.changed_files(temp.path()).await.unwrap();
        assert_eq!(changed, vec!["b.txt".to_string()]);

        let head = host.latest_commit(temp.path()).await.unwrap();
        assert_eq!(head.len(), 40);
    }
}
