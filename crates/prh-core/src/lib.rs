//! Core record types for the pull-request harvester.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod diff;
pub mod window;

pub use diff::{diff_lines, DiffSegment, SegmentKind};
pub use window::{previous_week, SnapshotPeriod, Window};

pub const CRATE_NAME: &str = "prh-core";

/// Denormalized author reference attached to a pull request.
///
/// Only the resolved external id, login and profile URL are kept here; the
/// full profile lives in the identity directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AuthorRef {
    #[serde(default)]
    pub github_id: Option<u64>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub github_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Removed,
    Renamed,
    Copied,
    Changed,
    Unchanged,
    #[serde(other)]
    Unknown,
}

/// One file touched by a pull request. Owned by its parent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
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
    /// Lines extracted from the host-provided unified patch.
    #[serde(default)]
    pub patch_lines: Vec<DiffSegment>,
    /// Content diff against the base revision. Only filled for modified files.
    #[serde(default)]
    pub diff: Vec<DiffSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PullRequestKey {
    pub number: u64,
    pub repository: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeTotals {
    pub additions: u64,
    pub deletions: u64,
    pub changed_files: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    #[serde(default)]
    pub github_id: Option<u64>,
    pub number: u64,
    /// `owner/name`. Legacy rows may hold an empty or bare name until migrated.
    #[serde(default)]
    pub repository: String,
    pub title: String,
    pub state: String,
    #[serde(default)]
    pub html_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub author: AuthorRef,
    #[serde(default)]
    pub files: Vec<FileChange>,
    pub recorded_at: DateTime<Utc>,
}

impl PullRequestRecord {
    pub fn key(&self) -> PullRequestKey {
        PullRequestKey {
            number: self.number,
            repository: self.repository.clone(),
        }
    }

    pub fn totals(&self) -> ChangeTotals {
        ChangeTotals {
            additions: self.files.iter().map(|f| f.additions).sum(),
            deletions: self.files.iter().map(|f| f.deletions).sum(),
            changed_files: self.files.len() as u64,
        }
    }

    /// True when either the creation or the last update falls in `window`.
    pub fn touches(&self, window: &Window) -> bool {
        window.contains(self.created_at) || window.contains(self.updated_at)
    }
}

/// Profile fields fetched from the hosting service.
///
/// Also used as the trimmed identity projection in exports: it never carries
/// locally-entered contact fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalProfile {
    pub github_id: u64,
    pub login: String,
    pub html_url: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub account_type: String,
    #[serde(default)]
    pub site_admin: bool,
}

/// Entry of the identity directory.
///
/// External accounts are unique by `github_id`; local-only accounts have no
/// external id and are unique by `email`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IdentityRecord {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub github_id: Option<u64>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub account_type: Option<String>,
    #[serde(default)]
    pub site_admin: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl IdentityRecord {
    pub fn from_profile(profile: ExternalProfile) -> Self {
        Self {
            id: None,
            github_id: Some(profile.github_id),
            login: Some(profile.login),
            html_url: Some(profile.html_url),
            avatar_url: profile.avatar_url,
            account_type: Some(profile.account_type),
            site_admin: profile.site_admin,
            name: None,
            email: None,
            phone: None,
        }
    }

    pub fn local(name: String, email: String, phone: Option<String>) -> Self {
        Self {
            name: Some(name),
            email: Some(email),
            phone,
            ..Self::default()
        }
    }

    pub fn is_local(&self) -> bool {
        self.github_id.is_none()
    }

    /// Copies fetched profile fields over this record, keeping contact fields.
    pub fn apply_profile(&mut self, profile: ExternalProfile) {
        self.github_id = Some(profile.github_id);
        self.login = Some(profile.login);
        self.html_url = Some(profile.html_url);
        self.avatar_url = profile.avatar_url;
        self.account_type = Some(profile.account_type);
        self.site_admin = profile.site_admin;
    }

    pub fn profile(&self) -> Option<ExternalProfile> {
        Some(ExternalProfile {
            github_id: self.github_id?,
            login: self.login.clone()?,
            html_url: self.html_url.clone().unwrap_or_default(),
            avatar_url: self.avatar_url.clone(),
            account_type: self
                .account_type
                .clone()
                .unwrap_or_else(|| "User".to_string()),
            site_admin: self.site_admin,
        })
    }

    pub fn author_ref(&self) -> AuthorRef {
        AuthorRef {
            github_id: self.github_id,
            login: self.login.clone(),
            github_url: self.html_url.clone(),
        }
    }
}

/// A pull request as written into an export snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedPullRequest {
    #[serde(flatten)]
    pub record: PullRequestRecord,
    #[serde(default)]
    pub user: Option<ExternalProfile>,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default)]
    pub changed_files: u64,
}

impl ExportedPullRequest {
    pub fn new(record: PullRequestRecord, user: Option<ExternalProfile>) -> Self {
        let totals = record.totals();
        Self {
            record,
            user,
            additions: totals.additions,
            deletions: totals.deletions,
            changed_files: totals.changed_files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> PullRequestRecord {
        let ts = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        PullRequestRecord {
            github_id: Some(1001),
            number: 42,
            repository: "acme/widgets".into(),
            title: "Add widget".into(),
            state: "open".into(),
            html_url: None,
            created_at: ts,
            updated_at: ts,
            author: AuthorRef::default(),
            files: vec![
                FileChange {
                    filename: "a.rs".into(),
                    status: FileStatus::Modified,
                    additions: 3,
                    deletions: 1,
                    changes: 4,
                    raw_url: None,
                    patch_lines: vec![],
                    diff: vec![],
                },
                FileChange {
                    filename: "b.rs".into(),
                    status: FileStatus::Added,
                    additions: 10,
                    deletions: 0,
                    changes: 10,
                    raw_url: None,
                    patch_lines: vec![],
                    diff: vec![],
                },
            ],
            recorded_at: ts,
        }
    }

    #[test]
    fn totals_sum_file_counts() {
        let totals = record().totals();
        assert_eq!(totals.additions, 13);
        assert_eq!(totals.deletions, 1);
        assert_eq!(totals.changed_files, 2);
    }

    #[test]
    fn unknown_file_status_deserializes() {
        let status: FileStatus = serde_json::from_str("\"something-new\"").unwrap();
        assert_eq!(status, FileStatus::Unknown);
        let status: FileStatus = serde_json::from_str("\"modified\"").unwrap();
        assert_eq!(status, FileStatus::Modified);
    }

    #[test]
    fn exported_pull_request_flattens_record() {
        let exported = ExportedPullRequest::new(record(), None);
        let value = serde_json::to_value(&exported).unwrap();
        assert_eq!(value["number"], 42);
        assert_eq!(value["repository"], "acme/widgets");
        assert_eq!(value["additions"], 13);
        let back: ExportedPullRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, exported);
    }

    #[test]
    fn profile_requires_external_id_and_login() {
        let local = IdentityRecord::local("Ada".into(), "ada@example.com".into(), None);
        assert!(local.is_local());
        assert!(local.profile().is_none());

        let mut record = local.clone();
        record.apply_profile(ExternalProfile {
            github_id: 7,
            login: "ada".into(),
            html_url: "https://github.com/ada".into(),
            avatar_url: None,
            account_type: "User".into(),
            site_admin: false,
        });
        assert_eq!(record.email.as_deref(), Some("ada@example.com"));
        assert_eq!(record.profile().map(|p| p.github_id), Some(7));
    }
}
