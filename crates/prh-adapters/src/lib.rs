//! Source-hosting API contract, the GitHub REST adapter and a fixture-backed host.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prh_core::{AuthorRef, DiffSegment, ExternalProfile, FileChange, FileStatus};
use prh_storage::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod fixture;
mod github;

pub use fixture::{load_fixture_bundle, FixtureBlob, FixtureBundle, FixtureRepository, FixtureSourceHost};
pub use github::{GitHubHost, GitHubHostConfig};

pub const CRATE_NAME: &str = "prh-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
    #[error("{0}")]
    Message(String),
}

impl SourceError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Fetch(err) => err.is_not_found(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullState {
    Open,
    Closed,
    #[default]
    All,
}

impl PullState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::All => "all",
        }
    }

    pub fn matches(&self, state: &str) -> bool {
        matches!(self, Self::All) || self.as_str() == state
    }
}

/// Account summary embedded in pull-request payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAccount {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRevision {
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePullRequest {
    #[serde(default)]
    pub id: Option<u64>,
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub html_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub user: Option<RemoteAccount>,
    #[serde(default)]
    pub base: Option<RemoteRevision>,
}

impl RemotePullRequest {
    pub fn author_ref(&self) -> AuthorRef {
        match &self.user {
            Some(user) => AuthorRef {
                github_id: user.id,
                login: user.login.clone(),
                github_url: user.html_url.clone(),
            },
            None => AuthorRef::default(),
        }
    }

    pub fn base_sha(&self) -> Option<&str> {
        self.base.as_ref().map(|b| b.sha.as_str()).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub filename: String,
    pub status: FileStatus,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default)]
    pub changes: u64,
    #[serde(default)]
    pub raw_url: Option<String>,
    #[serde(default)]
    pub patch: Option<String>,
}

impl RemoteFile {
    /// Metadata and patch lines; the content diff is filled in by the caller.
    pub fn to_file_change(&self) -> FileChange {
        FileChange {
            filename: self.filename.clone(),
            status: self.status,
            additions: self.additions,
            deletions: self.deletions,
            changes: self.changes,
            raw_url: self.raw_url.clone(),
            patch_lines: self.patch.as_deref().map(parse_patch).unwrap_or_default(),
            diff: Vec::new(),
        }
    }
}

/// Full public profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub id: u64,
    pub login: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(rename = "type", default = "default_account_type")]
    pub account_type: String,
    #[serde(default)]
    pub site_admin: bool,
}

fn default_account_type() -> String {
    "User".to_string()
}

impl RemoteUser {
    pub fn into_profile(self) -> ExternalProfile {
        ExternalProfile {
            github_id: self.id,
            login: self.login,
            html_url: self.html_url,
            avatar_url: self.avatar_url,
            account_type: self.account_type,
            site_admin: self.site_admin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepository {
    pub full_name: String,
}

/// Operations the pipeline needs from the hosting service. Repositories are
/// addressed by `owner/name`.
#[async_trait]
pub trait SourceHost: Send + Sync {
    async fn list_pull_requests(
        &self,
        repository: &str,
        state: PullState,
    ) -> Result<Vec<RemotePullRequest>, SourceError>;

    async fn list_files(&self, repository: &str, number: u64) -> Result<Vec<RemoteFile>, SourceError>;

    async fn get_pull_request(
        &self,
        repository: &str,
        number: u64,
    ) -> Result<RemotePullRequest, SourceError>;

    /// Content behind a file's raw URL, at the pull request's head revision.
    async fn fetch_raw(&self, url: &str) -> Result<Vec<u8>, SourceError>;

    async fn fetch_content_at(
        &self,
        repository: &str,
        path: &str,
        sha: &str,
    ) -> Result<Vec<u8>, SourceError>;

    async fn get_user(&self, login: &str) -> Result<RemoteUser, SourceError>;

    async fn list_user_repositories(&self, login: &str) -> Result<Vec<String>, SourceError>;
}

/// Lines of a unified-diff patch as added/removed segments.
///
/// Added lines carry their position in the new file; hunk headers reset it.
pub fn parse_patch(patch: &str) -> Vec<DiffSegment> {
    let mut out = Vec::new();
    let mut current: u32 = 0;
    for line in patch.lines() {
        if line.starts_with("@@") {
            if let Some(start) = hunk_new_start(line) {
                current = start;
            }
        } else if let Some(content) = line.strip_prefix('+').filter(|_| !line.starts_with("+++")) {
            out.push(DiffSegment::added(current, content));
            current = current.saturating_add(1);
        } else if let Some(content) = line.strip_prefix('-').filter(|_| !line.starts_with("---")) {
            out.push(DiffSegment::removed(content));
        } else if !line.starts_with('\\') {
            current = current.saturating_add(1);
        }
    }
    out
}

/// `N` from a `@@ -a,b +N,M @@` header.
fn hunk_new_start(header: &str) -> Option<u32> {
    let rest = &header[header.find('+')? + 1..];
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}
