//! Listing, diffing and upserting pull requests for one run.

use std::collections::BTreeSet;

use chrono::{FixedOffset, NaiveDate, Utc};
use prh_adapters::{PullState, RemoteFile, RemotePullRequest, SourceError, SourceHost};
use prh_core::{diff_lines, FileChange, FileStatus, PullRequestRecord, Window};
use prh_storage::{sha256_hex, Store, UpsertOutcome};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::identity::{IdentityResolver, Resolution};
use crate::{SourceMode, UpsertPolicy};

#[derive(Debug, Clone, Serialize)]
pub struct IngestionSummary {
    pub run_id: Uuid,
    pub target_date: NaiveDate,
    pub repositories: usize,
    pub repository_failures: usize,
    pub listed: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Left out by [`UpsertPolicy::TargetWindowOnly`].
    pub outside_window: usize,
    pub skipped_prs: usize,
    pub files_diffed: usize,
    pub file_failures: usize,
    pub identity_skips: usize,
    pub analysed_in_window: usize,
}

impl IngestionSummary {
    fn new(target_date: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            target_date,
            repositories: 0,
            repository_failures: 0,
            listed: 0,
            inserted: 0,
            updated: 0,
            outside_window: 0,
            skipped_prs: 0,
            files_diffed: 0,
            file_failures: 0,
            identity_skips: 0,
            analysed_in_window: 0,
        }
    }

    pub fn upserted(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn message(&self) -> String {
        format!(
            "{} pull requests synced from {} repositories ({} new, {} updated, {} in window {}); \
             skipped: {} PRs, {} files, {} authors, {} repositories",
            self.upserted(),
            self.repositories,
            self.inserted,
            self.updated,
            self.analysed_in_window,
            self.target_date,
            self.skipped_prs,
            self.file_failures,
            self.identity_skips,
            self.repository_failures,
        )
    }
}

/// Text to feed the diff engine. Binary or non-UTF-8 content becomes a
/// stable placeholder so the comparison never fails.
pub fn content_as_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.contains('\0') => text.to_string(),
        _ => serde_json::json!({
            "binary": true,
            "bytes": bytes.len(),
            "sha256": sha256_hex(bytes),
        })
        .to_string(),
    }
}

pub struct IngestionPipeline<'a> {
    store: &'a dyn Store,
    host: &'a dyn SourceHost,
    source_mode: &'a SourceMode,
    upsert_policy: UpsertPolicy,
    utc_offset: FixedOffset,
}

impl<'a> IngestionPipeline<'a> {
    pub fn new(
        store: &'a dyn Store,
        host: &'a dyn SourceHost,
        source_mode: &'a SourceMode,
        upsert_policy: UpsertPolicy,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            store,
            host,
            source_mode,
            upsert_policy,
            utc_offset,
        }
    }

    /// Lists every pull request of every source repository and upserts it.
    /// `target_date` selects the window that gets verbose analysis (and, under
    /// [`UpsertPolicy::TargetWindowOnly`], the records that are kept).
    pub async fn run(&self, target_date: NaiveDate) -> anyhow::Result<IngestionSummary> {
        let mut summary = IngestionSummary::new(target_date);
        let span = info_span!("ingestion", run_id = %summary.run_id, %target_date);
        async {
            let window = Window::day(target_date, self.utc_offset);
            let repositories = self.discover_repositories(&mut summary).await?;
            summary.repositories = repositories.len();

            let mut resolver = IdentityResolver::new(self.store, self.host);
            for repository in &repositories {
                self.ingest_repository(repository, &window, &mut resolver, &mut summary)
                    .await;
            }
            summary.identity_skips = resolver.stats().skipped;
            info!(summary = %summary.message(), "ingestion finished");
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    async fn discover_repositories(
        &self,
        summary: &mut IngestionSummary,
    ) -> anyhow::Result<Vec<String>> {
        match self.source_mode {
            SourceMode::Fixed(repository) if repository.is_empty() => {
                warn!("no source repository configured");
                Ok(Vec::new())
            }
            SourceMode::Fixed(repository) => Ok(vec![repository.clone()]),
            SourceMode::PerUserDiscovery => {
                let mut found = BTreeSet::new();
                for identity in self.store.all_identities().await? {
                    let Some(login) = identity.login.as_deref() else {
                        continue;
                    };
                    match self.host.list_user_repositories(login).await {
                        Ok(repos) => found.extend(repos),
                        Err(err) => {
                            summary.repository_failures += 1;
                            warn!(login, error = %err, "repository discovery failed");
                        }
                    }
                }
                Ok(found.into_iter().collect())
            }
        }
    }

    async fn ingest_repository(
        &self,
        repository: &str,
        window: &Window,
        resolver: &mut IdentityResolver<'_>,
        summary: &mut IngestionSummary,
    ) {
        let pull_requests = match self.host.list_pull_requests(repository, PullState::All).await {
            Ok(prs) => prs,
            Err(err) => {
                summary.repository_failures += 1;
                warn!(repository, error = %err, "listing pull requests failed");
                return;
            }
        };

        for pr in pull_requests {
            summary.listed += 1;
            let record = PullRequestRecord {
                github_id: pr.id,
                number: pr.number,
                repository: repository.to_string(),
                title: pr.title.clone(),
                state: pr.state.clone(),
                html_url: pr.html_url.clone(),
                created_at: pr.created_at,
                updated_at: pr.updated_at,
                author: pr.author_ref(),
                files: Vec::new(),
                recorded_at: Utc::now(),
            };
            let in_window = record.touches(window);
            if !in_window && self.upsert_policy == UpsertPolicy::TargetWindowOnly {
                summary.outside_window += 1;
                continue;
            }

            let files = match self.host.list_files(repository, pr.number).await {
                Ok(files) => files,
                Err(err) => {
                    summary.skipped_prs += 1;
                    warn!(repository, number = pr.number, error = %err, "listing files failed");
                    continue;
                }
            };

            let previous = match self.store.get_pull_request(repository, pr.number).await {
                Ok(previous) => previous,
                Err(err) => {
                    debug!(repository, number = pr.number, error = %err, "stored record not loaded");
                    None
                }
            };
            let mut record = record;
            record.files = self
                .analyse_files(repository, &pr, &files, previous.as_ref(), summary)
                .await;
            if let Resolution::Resolved(identity) = resolver.resolve(&record.author).await {
                record.author = identity.author_ref();
            }

            match self.store.upsert_pull_request(&record).await {
                Ok(UpsertOutcome::Inserted) => summary.inserted += 1,
                Ok(UpsertOutcome::Updated) => summary.updated += 1,
                Err(err) => {
                    summary.skipped_prs += 1;
                    warn!(repository, number = pr.number, error = %err, "upsert failed");
                    continue;
                }
            }

            if in_window {
                summary.analysed_in_window += 1;
                let totals = record.totals();
                info!(
                    repository,
                    number = record.number,
                    title = %record.title,
                    additions = totals.additions,
                    deletions = totals.deletions,
                    files = totals.changed_files,
                    "pull request active in target window"
                );
            }
        }
    }

    async fn analyse_files(
        &self,
        repository: &str,
        pr: &RemotePullRequest,
        files: &[RemoteFile],
        previous: Option<&PullRequestRecord>,
        summary: &mut IngestionSummary,
    ) -> Vec<FileChange> {
        let needs_base = files.iter().any(|f| f.status == FileStatus::Modified);
        let base_sha = if needs_base {
            self.base_sha(repository, pr).await
        } else {
            None
        };

        let mut changes = Vec::with_capacity(files.len());
        for file in files {
            let mut change = file.to_file_change();
            if file.status == FileStatus::Modified {
                match self.content_diff(repository, file, base_sha.as_deref()).await {
                    Ok(diff) => {
                        summary.files_diffed += 1;
                        change.diff = diff;
                    }
                    Err(err) => {
                        summary.file_failures += 1;
                        warn!(
                            repository,
                            number = pr.number,
                            file = %file.filename,
                            error = %err,
                            "content diff skipped"
                        );
                        // A failed fetch keeps the diff an earlier run stored.
                        if let Some(stored) = previous
                            .and_then(|p| p.files.iter().find(|f| f.filename == file.filename))
                        {
                            change.diff = stored.diff.clone();
                        }
                    }
                }
            }
            changes.push(change);
        }
        changes
    }

    async fn base_sha(&self, repository: &str, pr: &RemotePullRequest) -> Option<String> {
        if let Some(sha) = pr.base_sha() {
            return Some(sha.to_string());
        }
        match self.host.get_pull_request(repository, pr.number).await {
            Ok(full) => full.base_sha().map(ToString::to_string),
            Err(err) => {
                warn!(repository, number = pr.number, error = %err, "base revision lookup failed");
                None
            }
        }
    }

    async fn content_diff(
        &self,
        repository: &str,
        file: &RemoteFile,
        base_sha: Option<&str>,
    ) -> Result<Vec<prh_core::DiffSegment>, SourceError> {
        let raw_url = file
            .raw_url
            .as_deref()
            .ok_or_else(|| SourceError::Message("file has no raw url".to_string()))?;
        let base_sha =
            base_sha.ok_or_else(|| SourceError::Message("base revision unknown".to_string()))?;

        let new = self.host.fetch_raw(raw_url).await?;
        let old = match self
            .host
            .fetch_content_at(repository, &file.filename, base_sha)
            .await
        {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => {
                debug!(file = %file.filename, "no base content; diffing against empty text");
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        Ok(diff_lines(&content_as_text(&old), &content_as_text(&new)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use prh_adapters::{FixtureBlob, FixtureBundle, FixtureSourceHost, RemoteAccount, RemoteRevision, RemoteUser};
    use prh_core::{DiffSegment, IdentityRecord};
    use prh_storage::MemoryStore;

    const REPO: &str = "acme/widgets";

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
    }

    fn pr(number: u64, day_of_june: u32, login: Option<&str>) -> RemotePullRequest {
        let ts = Utc.with_ymd_and_hms(2024, 6, day_of_june, 12, 0, 0).unwrap();
        RemotePullRequest {
            id: Some(1000 + number),
            number,
            title: format!("PR {number}"),
            state: "open".into(),
            html_url: None,
            created_at: ts,
            updated_at: ts,
            user: login.map(|l| RemoteAccount {
                id: Some(7),
                login: Some(l.to_string()),
                html_url: Some(format!("https://github.com/{l}")),
            }),
            base: Some(RemoteRevision { sha: "base".into() }),
        }
    }

    fn modified(name: &str) -> RemoteFile {
        RemoteFile {
            filename: name.into(),
            status: FileStatus::Modified,
            additions: 1,
            deletions: 1,
            changes: 2,
            raw_url: Some(format!("https://raw/{name}")),
            patch: None,
        }
    }

    fn octo() -> RemoteUser {
        RemoteUser {
            id: 7,
            login: "octo-cat".into(),
            html_url: "https://github.com/octo-cat".into(),
            avatar_url: None,
            account_type: "User".into(),
            site_admin: false,
        }
    }

    fn bundle() -> FixtureBundle {
        FixtureBundle::default()
            .with_pull_request(
                REPO,
                pr(1, 10, Some("octo-cat")),
                vec![
                    modified("a.txt"),
                    modified("b.txt"),
                    RemoteFile {
                        status: FileStatus::Added,
                        ..modified("new.txt")
                    },
                ],
            )
            .with_pull_request(REPO, pr(2, 3, None), vec![])
            .with_raw("https://raw/a.txt", FixtureBlob::Text("one\nTWO\n".into()))
            .with_content(REPO, "base", "a.txt", FixtureBlob::Text("one\ntwo\n".into()))
            .with_raw("https://raw/b.txt", FixtureBlob::Text("b\n".into()))
            .with_user(octo())
            .failing("content:acme/widgets:base:b.txt")
    }

    fn fixed() -> SourceMode {
        SourceMode::Fixed(REPO.to_string())
    }

    #[test]
    fn binary_content_becomes_a_placeholder() {
        assert_eq!(content_as_text(b"plain\n"), "plain\n");
        let placeholder = content_as_text(&[0xff, 0xfe, 0x00]);
        let value: serde_json::Value = serde_json::from_str(&placeholder).unwrap();
        assert_eq!(value["binary"], true);
        assert_eq!(value["bytes"], 3);
        assert_eq!(content_as_text(b"a\0b"), content_as_text(b"a\0b"));
    }

    #[tokio::test]
    async fn file_failures_do_not_abort_the_pull_request() {
        let store = MemoryStore::new();
        let host = FixtureSourceHost::new(bundle());
        let mode = fixed();
        let pipeline = IngestionPipeline::new(&store, &host, &mode, UpsertPolicy::AllListed, utc());

        let summary = pipeline.run(day()).await.unwrap();
        assert_eq!(summary.listed, 2);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.files_diffed, 1);
        assert_eq!(summary.file_failures, 1);
        assert_eq!(summary.analysed_in_window, 1);
        assert_eq!(summary.identity_skips, 1);

        let stored = store.get_pull_request(REPO, 1).await.unwrap().unwrap();
        assert_eq!(stored.files.len(), 3);
        assert_eq!(
            stored.files[0].diff,
            vec![DiffSegment::removed("two\n"), DiffSegment::added(2, "TWO\n")]
        );
        assert!(stored.files[1].diff.is_empty());
        assert!(stored.files[2].diff.is_empty());
        assert_eq!(stored.author.github_id, Some(7));
        assert_eq!(host.calls_to("raw:https://raw/new.txt"), 0);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_the_previously_stored_diff() {
        let store = MemoryStore::new();
        let mode = fixed();
        let healthy = FixtureSourceHost::new(bundle());
        IngestionPipeline::new(&store, &healthy, &mode, UpsertPolicy::AllListed, utc())
            .run(day())
            .await
            .unwrap();
        let before = store.get_pull_request(REPO, 1).await.unwrap().unwrap();
        assert!(!before.files[0].diff.is_empty());

        let flaky = FixtureSourceHost::new(bundle().failing("raw:https://raw/a.txt"));
        let summary = IngestionPipeline::new(&store, &flaky, &mode, UpsertPolicy::AllListed, utc())
            .run(day())
            .await
            .unwrap();
        assert_eq!(summary.updated, 2);
        assert_eq!(summary.file_failures, 2);

        let after = store.get_pull_request(REPO, 1).await.unwrap().unwrap();
        assert_eq!(after.files[0].diff, before.files[0].diff);
        assert!(after.files[1].diff.is_empty());
    }

    #[tokio::test]
    async fn every_record_by_an_unfetchable_author_counts_as_a_skip() {
        let store = MemoryStore::new();
        let host = FixtureSourceHost::new(
            FixtureBundle::default()
                .with_pull_request(REPO, pr(1, 10, Some("ghost")), vec![])
                .with_pull_request(REPO, pr(2, 10, Some("ghost")), vec![])
                .with_pull_request(REPO, pr(3, 9, Some("ghost")), vec![])
                .failing("user:ghost"),
        );
        let mode = fixed();
        let pipeline = IngestionPipeline::new(&store, &host, &mode, UpsertPolicy::AllListed, utc());

        let summary = pipeline.run(day()).await.unwrap();
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.identity_skips, 3);
        assert_eq!(host.calls_to("user:ghost"), 1);
    }

    #[tokio::test]
    async fn repeated_runs_keep_one_record_per_key() {
        let store = MemoryStore::new();
        let host = FixtureSourceHost::new(bundle());
        let mode = fixed();
        let pipeline = IngestionPipeline::new(&store, &host, &mode, UpsertPolicy::AllListed, utc());

        pipeline.run(day()).await.unwrap();
        let second = pipeline.run(day()).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(store.all_pull_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn window_only_policy_skips_records_outside_the_day() {
        let store = MemoryStore::new();
        let host = FixtureSourceHost::new(bundle());
        let mode = fixed();
        let pipeline =
            IngestionPipeline::new(&store, &host, &mode, UpsertPolicy::TargetWindowOnly, utc());

        let summary = pipeline.run(day()).await.unwrap();
        assert_eq!(summary.outside_window, 1);
        assert_eq!(summary.inserted, 1);
        assert!(store.get_pull_request(REPO, 2).await.unwrap().is_none());
        assert_eq!(host.calls_to("files:acme/widgets#2"), 0);
    }

    #[tokio::test]
    async fn per_user_mode_discovers_repositories_from_the_directory() {
        let store = MemoryStore::new();
        store
            .insert_identity(&IdentityRecord::from_profile(octo().into_profile()))
            .await
            .unwrap();
        let host = FixtureSourceHost::new(
            bundle()
                .with_user_repositories("octo-cat", &[REPO, "acme/broken"])
                .failing("pulls:acme/broken"),
        );
        let mode = SourceMode::PerUserDiscovery;
        let pipeline = IngestionPipeline::new(&store, &host, &mode, UpsertPolicy::AllListed, utc());

        let summary = pipeline.run(day()).await.unwrap();
        assert_eq!(summary.repositories, 2);
        assert_eq!(summary.repository_failures, 1);
        assert_eq!(summary.inserted, 2);
    }

    #[tokio::test]
    async fn legacy_key_conflicts_are_counted_not_fatal() {
        let legacy = PullRequestRecord {
            github_id: None,
            number: 1,
            repository: "acme/other".into(),
            title: "old".into(),
            state: "closed".into(),
            html_url: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            author: Default::default(),
            files: vec![],
            recorded_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };
        let store = MemoryStore::with_legacy_records(vec![legacy]);
        let host = FixtureSourceHost::new(bundle());
        let mode = fixed();
        let pipeline = IngestionPipeline::new(&store, &host, &mode, UpsertPolicy::AllListed, utc());

        let summary = pipeline.run(day()).await.unwrap();
        assert_eq!(summary.skipped_prs, 1);
        assert_eq!(summary.inserted, 1);
    }
}
