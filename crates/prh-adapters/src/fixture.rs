use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{PullState, RemoteFile, RemotePullRequest, RemoteUser, SourceError, SourceHost};

/// File content in a fixture: plain text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FixtureBlob {
    Text(String),
    Bytes(Vec<u8>),
}

impl FixtureBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.as_bytes().to_vec(),
            Self::Bytes(bytes) => bytes.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureRepository {
    #[serde(default)]
    pub pull_requests: Vec<RemotePullRequest>,
    /// Keyed by pull-request number.
    #[serde(default)]
    pub files: BTreeMap<u64, Vec<RemoteFile>>,
    /// Keyed by `<sha>:<path>`.
    #[serde(default)]
    pub contents: BTreeMap<String, FixtureBlob>,
}

/// Canned API responses.
///
/// `failures` lists call keys that fail as if the service were down:
/// `pulls:<repo>`, `files:<repo>#<number>`, `pull:<repo>#<number>`,
/// `raw:<url>`, `content:<repo>:<sha>:<path>`, `user:<login>` and
/// `repos:<login>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    #[serde(default)]
    pub repositories: BTreeMap<String, FixtureRepository>,
    #[serde(default)]
    pub users: BTreeMap<String, RemoteUser>,
    #[serde(default)]
    pub user_repositories: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub raw: BTreeMap<String, FixtureBlob>,
    #[serde(default)]
    pub failures: BTreeSet<String>,
}

impl FixtureBundle {
    pub fn with_pull_request(
        mut self,
        repository: &str,
        pull_request: RemotePullRequest,
        files: Vec<RemoteFile>,
    ) -> Self {
        let repo = self.repositories.entry(repository.to_string()).or_default();
        repo.files.insert(pull_request.number, files);
        repo.pull_requests.push(pull_request);
        self
    }

    pub fn with_content(mut self, repository: &str, sha: &str, path: &str, blob: FixtureBlob) -> Self {
        self.repositories
            .entry(repository.to_string())
            .or_default()
            .contents
            .insert(format!("{sha}:{path}"), blob);
        self
    }

    pub fn with_raw(mut self, url: &str, blob: FixtureBlob) -> Self {
        self.raw.insert(url.to_string(), blob);
        self
    }

    pub fn with_user(mut self, user: RemoteUser) -> Self {
        self.users.insert(user.login.clone(), user);
        self
    }

    pub fn with_user_repositories(mut self, login: &str, repositories: &[&str]) -> Self {
        self.user_repositories.insert(
            login.to_string(),
            repositories.iter().map(ToString::to_string).collect(),
        );
        self
    }

    pub fn failing(mut self, key: impl Into<String>) -> Self {
        self.failures.insert(key.into());
        self
    }
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// [`SourceHost`] answering from a [`FixtureBundle`]. Records every call key.
#[derive(Debug, Default)]
pub struct FixtureSourceHost {
    bundle: FixtureBundle,
    calls: Mutex<Vec<String>>,
}

impl FixtureSourceHost {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self {
            bundle,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    /// Number of calls whose key starts with `prefix`.
    pub fn calls_to(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|key| key.starts_with(prefix))
            .count()
    }

    fn record(&self, key: String) -> Result<(), SourceError> {
        let failing = self.bundle.failures.contains(&key);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.clone());
        if failing {
            return Err(SourceError::Message(format!("simulated failure for {key}")));
        }
        Ok(())
    }

    fn repository(&self, repository: &str) -> Result<&FixtureRepository, SourceError> {
        self.bundle
            .repositories
            .get(repository)
            .ok_or_else(|| SourceError::NotFound(format!("repository {repository}")))
    }
}

#[async_trait]
impl SourceHost for FixtureSourceHost {
    async fn list_pull_requests(
        &self,
        repository: &str,
        state: PullState,
    ) -> Result<Vec<RemotePullRequest>, SourceError> {
        self.record(format!("pulls:{repository}"))?;
        Ok(self
            .repository(repository)?
            .pull_requests
            .iter()
            .filter(|pr| state.matches(&pr.state))
            .cloned()
            .collect())
    }

    async fn list_files(&self, repository: &str, number: u64) -> Result<Vec<RemoteFile>, SourceError> {
        self.record(format!("files:{repository}#{number}"))?;
        Ok(self
            .repository(repository)?
            .files
            .get(&number)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_pull_request(
        &self,
        repository: &str,
        number: u64,
    ) -> Result<RemotePullRequest, SourceError> {
        self.record(format!("pull:{repository}#{number}"))?;
        self.repository(repository)?
            .pull_requests
            .iter()
            .find(|pr| pr.number == number)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("pull request {repository}#{number}")))
    }

    async fn fetch_raw(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        self.record(format!("raw:{url}"))?;
        self.bundle
            .raw
            .get(url)
            .map(FixtureBlob::to_bytes)
            .ok_or_else(|| SourceError::NotFound(url.to_string()))
    }

    async fn fetch_content_at(
        &self,
        repository: &str,
        path: &str,
        sha: &str,
    ) -> Result<Vec<u8>, SourceError> {
        self.record(format!("content:{repository}:{sha}:{path}"))?;
        self.repository(repository)?
            .contents
            .get(&format!("{sha}:{path}"))
            .map(FixtureBlob::to_bytes)
            .ok_or_else(|| SourceError::NotFound(format!("{path}@{sha}")))
    }

    async fn get_user(&self, login: &str) -> Result<RemoteUser, SourceError> {
        self.record(format!("user:{login}"))?;
        self.bundle
            .users
            .get(login)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("user {login}")))
    }

    async fn list_user_repositories(&self, login: &str) -> Result<Vec<String>, SourceError> {
        self.record(format!("repos:{login}"))?;
        Ok(self
            .bundle
            .user_repositories
            .get(login)
            .cloned()
            .unwrap_or_default())
    }
}
