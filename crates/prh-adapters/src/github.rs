use std::sync::Arc;

use async_trait::async_trait;
use prh_storage::HttpFetcher;
use reqwest::Url;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    PullState, RemoteFile, RemotePullRequest, RemoteRepository, RemoteUser, SourceError,
    SourceHost,
};

const JSON_MEDIA_TYPE: &str = "application/vnd.github.v3+json";
const RAW_MEDIA_TYPE: &str = "application/vnd.github.v3.raw";
const PER_PAGE: usize = 100;

#[derive(Debug, Clone)]
pub struct GitHubHostConfig {
    pub api_url: String,
    /// Upper bound on pages followed per listing.
    pub max_pages: u32,
}

impl Default for GitHubHostConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            max_pages: 10,
        }
    }
}

/// REST client for the GitHub API. Authentication, retries and rate limits
/// are handled by the shared [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct GitHubHost {
    http: Arc<HttpFetcher>,
    config: GitHubHostConfig,
}

impl GitHubHost {
    pub fn new(http: Arc<HttpFetcher>, config: GitHubHostConfig) -> Self {
        Self { http, config }
    }

    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, SourceError> {
        let mut url = Url::parse(&self.config.api_url)
            .map_err(|_| SourceError::InvalidEndpoint(self.config.api_url.clone()))?;
        url.path_segments_mut()
            .map_err(|_| SourceError::InvalidEndpoint(self.config.api_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, scope: &str, url: &Url) -> Result<T, SourceError> {
        let response = self.http.fetch_bytes(scope, url.as_str(), JSON_MEDIA_TYPE).await?;
        serde_json::from_slice(&response.body).map_err(|source| SourceError::Decode {
            what: url.path().to_string(),
            source,
        })
    }

    async fn get_paginated<T: DeserializeOwned>(
        &self,
        scope: &str,
        base: Url,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, SourceError> {
        let mut out = Vec::new();
        for page in 1..=self.config.max_pages.max(1) {
            let mut url = base.clone();
            {
                let mut pairs = url.query_pairs_mut();
                for (key, value) in query {
                    pairs.append_pair(key, value);
                }
                pairs
                    .append_pair("per_page", &PER_PAGE.to_string())
                    .append_pair("page", &page.to_string());
            }
            let batch: Vec<T> = self.get_json(scope, &url).await?;
            let done = batch.len() < PER_PAGE;
            out.extend(batch);
            if done {
                break;
            }
            debug!(scope, page, "following next page");
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceHost for GitHubHost {
    async fn list_pull_requests(
        &self,
        repository: &str,
        state: PullState,
    ) -> Result<Vec<RemotePullRequest>, SourceError> {
        let url = self.endpoint(
            ["repos"]
                .into_iter()
                .chain(repository.split('/'))
                .chain(["pulls"]),
        )?;
        self.get_paginated(repository, url, &[("state", state.as_str())])
            .await
    }

    async fn list_files(&self, repository: &str, number: u64) -> Result<Vec<RemoteFile>, SourceError> {
        let number = number.to_string();
        let url = self.endpoint(
            ["repos"]
                .into_iter()
                .chain(repository.split('/'))
                .chain(["pulls", number.as_str(), "files"]),
        )?;
        self.get_paginated(repository, url, &[]).await
    }

    async fn get_pull_request(
        &self,
        repository: &str,
        number: u64,
    ) -> Result<RemotePullRequest, SourceError> {
        let number = number.to_string();
        let url = self.endpoint(
            ["repos"]
                .into_iter()
                .chain(repository.split('/'))
                .chain(["pulls", number.as_str()]),
        )?;
        self.get_json(repository, &url).await
    }

    async fn fetch_raw(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let response = self.http.fetch_bytes("raw", url, RAW_MEDIA_TYPE).await?;
        Ok(response.body)
    }

    async fn fetch_content_at(
        &self,
        repository: &str,
        path: &str,
        sha: &str,
    ) -> Result<Vec<u8>, SourceError> {
        let mut url = self.endpoint(
            ["repos"]
                .into_iter()
                .chain(repository.split('/'))
                .chain(["contents"])
                .chain(path.split('/')),
        )?;
        url.query_pairs_mut().append_pair("ref", sha);
        let response = self
            .http
            .fetch_bytes(repository, url.as_str(), RAW_MEDIA_TYPE)
            .await?;
        Ok(response.body)
    }

    async fn get_user(&self, login: &str) -> Result<RemoteUser, SourceError> {
        let url = self.endpoint(["users", login])?;
        self.get_json("users", &url).await
    }

    async fn list_user_repositories(&self, login: &str) -> Result<Vec<String>, SourceError> {
        let url = self.endpoint(["users", login, "repos"])?;
        let repos: Vec<RemoteRepository> = self.get_paginated("users", url, &[]).await?;
        Ok(repos.into_iter().map(|r| r.full_name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prh_storage::HttpClientConfig;

    fn host(api_url: &str) -> GitHubHost {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        GitHubHost::new(
            Arc::new(http),
            GitHubHostConfig {
                api_url: api_url.to_string(),
                max_pages: 3,
            },
        )
    }

    #[test]
    fn endpoints_escape_path_segments() {
        let host = host("https://api.github.com");
        let url = host
            .endpoint(
                ["repos"]
                    .into_iter()
                    .chain("acme/widgets".split('/'))
                    .chain(["contents"])
                    .chain("docs/read me.md".split('/')),
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.github.com/repos/acme/widgets/contents/docs/read%20me.md"
        );
    }

    #[test]
    fn endpoints_keep_a_base_path() {
        let host = host("https://ghe.example.com/api/v3/");
        let url = host.endpoint(["users", "octo-cat"]).unwrap();
        assert_eq!(url.as_str(), "https://ghe.example.com/api/v3/users/octo-cat");
    }

    #[test]
    fn invalid_base_url_is_reported() {
        let host = host("not a url");
        assert!(matches!(
            host.endpoint(["users"]),
            Err(SourceError::InvalidEndpoint(_))
        ));
    }
}
