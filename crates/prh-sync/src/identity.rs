//! Author resolution against the identity directory.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use prh_adapters::SourceHost;
use prh_core::{AuthorRef, IdentityRecord};
use prh_storage::Store;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

static PROFILE_LOGIN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^https?://[^/]+/([^/?#]+)").ok());

/// Login from a profile URL: the first path segment after the host.
pub fn login_from_profile_url(url: &str) -> Option<String> {
    let re = PROFILE_LOGIN.as_ref()?;
    re.captures(url.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Neither a login nor a profile URL.
    MissingReference,
    UnparseableProfileUrl(String),
    FetchFailed(String),
    Store(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(IdentityRecord),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

/// Resolves author references for one batch.
///
/// Each distinct login costs at most one profile fetch, one directory read and
/// one directory write per batch; failures are remembered too.
pub struct IdentityResolver<'a> {
    store: &'a dyn Store,
    host: &'a dyn SourceHost,
    memo: HashMap<String, Resolution>,
    stats: ResolverStats,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(store: &'a dyn Store, host: &'a dyn SourceHost) -> Self {
        Self {
            store,
            host,
            memo: HashMap::new(),
            stats: ResolverStats::default(),
        }
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats
    }

    pub async fn resolve(&mut self, author: &AuthorRef) -> Resolution {
        let login = match author.login.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            Some(login) => login.to_string(),
            None => match author.github_url.as_deref() {
                Some(url) => match login_from_profile_url(url) {
                    Some(login) => login,
                    None => {
                        return self.skip(SkipReason::UnparseableProfileUrl(url.to_string()));
                    }
                },
                None => return self.skip(SkipReason::MissingReference),
            },
        };

        let memo_key = login.to_ascii_lowercase();
        if let Some(known) = self.memo.get(&memo_key).cloned() {
            debug!(login, "identity served from batch memo");
            if matches!(known, Resolution::Skipped(_)) {
                self.stats.skipped += 1;
            }
            return known;
        }

        let resolution = self.fetch_and_store(&login).await;
        if matches!(resolution, Resolution::Skipped(_)) {
            self.stats.skipped += 1;
        }
        self.memo.insert(memo_key, resolution.clone());
        resolution
    }

    fn skip(&mut self, reason: SkipReason) -> Resolution {
        warn!(?reason, "author reference skipped");
        self.stats.skipped += 1;
        Resolution::Skipped(reason)
    }

    async fn fetch_and_store(&mut self, login: &str) -> Resolution {
        let profile = match self.host.get_user(login).await {
            Ok(user) => user.into_profile(),
            Err(err) => {
                warn!(login, error = %err, "profile fetch failed; retried next run");
                return Resolution::Skipped(SkipReason::FetchFailed(err.to_string()));
            }
        };

        let stored = match self.store.find_identity_by_github_id(profile.github_id).await {
            Ok(Some(existing)) if existing.profile().as_ref() == Some(&profile) => {
                self.stats.unchanged += 1;
                Ok(existing)
            }
            Ok(Some(mut existing)) => {
                existing.apply_profile(profile);
                let updated = self.store.update_identity(&existing).await;
                if updated.is_ok() {
                    self.stats.updated += 1;
                    info!(login, "identity profile updated");
                }
                updated
            }
            Ok(None) => {
                let inserted = self
                    .store
                    .insert_identity(&IdentityRecord::from_profile(profile))
                    .await;
                if inserted.is_ok() {
                    self.stats.inserted += 1;
                    info!(login, "identity created");
                }
                inserted
            }
            Err(err) => Err(err),
        };

        match stored {
            Ok(identity) => Resolution::Resolved(identity),
            Err(err) => {
                warn!(login, error = %err, "identity directory write failed");
                Resolution::Skipped(SkipReason::Store(err.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Records whose denormalized author now points at a directory entry.
    pub linked: usize,
    pub skipped: usize,
}

/// Resolves the author of every stored record and rewrites its author
/// reference from the directory.
pub async fn reconcile_identities(
    store: &dyn Store,
    host: &dyn SourceHost,
) -> anyhow::Result<ReconcileSummary> {
    let records = store.all_pull_requests().await?;
    let mut resolver = IdentityResolver::new(store, host);
    let mut linked = 0;

    for record in &records {
        let Resolution::Resolved(identity) = resolver.resolve(&record.author).await else {
            continue;
        };
        let author = identity.author_ref();
        if author == record.author {
            continue;
        }
        match store.set_author(&record.key(), &author).await {
            Ok(true) => linked += 1,
            Ok(false) => warn!(
                repository = %record.repository,
                number = record.number,
                "record vanished during reconciliation"
            ),
            Err(err) => warn!(
                repository = %record.repository,
                number = record.number,
                error = %err,
                "author link failed"
            ),
        }
    }

    let stats = resolver.stats();
    let summary = ReconcileSummary {
        inserted: stats.inserted,
        updated: stats.updated,
        unchanged: stats.unchanged,
        linked,
        skipped: stats.skipped,
    };
    info!(?summary, "identity reconciliation finished");
    Ok(summary)
}
