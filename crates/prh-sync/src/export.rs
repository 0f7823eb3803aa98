//! Daily and weekly write-once JSON snapshots.

use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use chrono::{FixedOffset, NaiveDate};
use prh_core::{ExportedPullRequest, ExternalProfile, PullRequestKey, PullRequestRecord, SnapshotPeriod};
use prh_storage::{SnapshotStore, Store};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportOutcome {
    pub file_name: String,
    pub records: usize,
    /// False when the snapshot already existed and was left as is.
    pub written: bool,
}

/// Looks up the trimmed identity projection for each record's author.
async fn enrich(
    store: &dyn Store,
    records: Vec<PullRequestRecord>,
) -> anyhow::Result<Vec<ExportedPullRequest>> {
    let mut profiles: HashMap<u64, Option<ExternalProfile>> = HashMap::new();
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let user = match record.author.github_id {
            Some(github_id) => {
                if !profiles.contains_key(&github_id) {
                    let profile = store
                        .find_identity_by_github_id(github_id)
                        .await
                        .with_context(|| format!("looking up identity {github_id}"))?
                        .and_then(|identity| identity.profile());
                    if profile.is_none() {
                        warn!(
                            github_id,
                            number = record.number,
                            "author not found in identity directory"
                        );
                    }
                    profiles.insert(github_id, profile);
                }
                profiles.get(&github_id).cloned().flatten()
            }
            None => None,
        };
        out.push(ExportedPullRequest::new(record, user));
    }
    Ok(out)
}

pub(crate) async fn read_snapshot(
    snapshots: &SnapshotStore,
    file_name: &str,
) -> anyhow::Result<Vec<ExportedPullRequest>> {
    let bytes = snapshots.read(file_name).await?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing snapshot {file_name}"))
}

async fn existing_outcome(snapshots: &SnapshotStore, file_name: String) -> ExportOutcome {
    let records = match read_snapshot(snapshots, &file_name).await {
        Ok(rows) => rows.len(),
        Err(err) => {
            warn!(file = %file_name, error = %err, "existing snapshot unreadable");
            0
        }
    };
    info!(file = %file_name, "snapshot already present; export skipped");
    ExportOutcome {
        file_name,
        records,
        written: false,
    }
}

/// Writes `export_prs_<date>.json` with every record created or updated that
/// day, unless it exists. `force` removes the day's snapshot and report first.
pub async fn export_daily(
    store: &dyn Store,
    snapshots: &SnapshotStore,
    date: NaiveDate,
    utc_offset: FixedOffset,
    force: bool,
) -> anyhow::Result<ExportOutcome> {
    let period = SnapshotPeriod::Day(date);
    let file_name = period.json_file_name();

    if force {
        let report = period.markdown_file_name();
        for name in [file_name.as_str(), report.as_str()] {
            if snapshots.remove(name).await? {
                info!(file = name, "removed for forced regeneration");
            }
        }
    } else if snapshots.exists(&file_name).await? {
        return Ok(existing_outcome(snapshots, file_name).await);
    }

    let records = store
        .pull_requests_in(&period.window(utc_offset))
        .await
        .context("querying records for daily export")?;
    let rows = enrich(store, records).await?;
    let bytes = serde_json::to_vec_pretty(&rows).context("serializing daily export")?;
    let stored = snapshots.write_once(&file_name, &bytes).await?;
    if stored.already_present {
        return Ok(existing_outcome(snapshots, file_name).await);
    }
    info!(file = %file_name, records = rows.len(), hash = %stored.content_hash, "daily export written");
    Ok(ExportOutcome {
        file_name,
        records: rows.len(),
        written: true,
    })
}

/// Merges the daily snapshots dated within `period`, in file-name order.
///
/// A later file's version of a pull request replaces an earlier one, whatever
/// its `updated_at`; rows neither created nor updated within the period are
/// dropped. Rows are keyed by `(number, repository)` rather than the number
/// alone, so the same number from two repositories stays as two rows.
pub(crate) async fn merge_daily_snapshots(
    snapshots: &SnapshotStore,
    period: &SnapshotPeriod,
    utc_offset: FixedOffset,
) -> anyhow::Result<(usize, Vec<PullRequestRecord>)> {
    let SnapshotPeriod::Week { start, end } = *period else {
        return Ok((0, Vec::new()));
    };
    let window = period.window(utc_offset);
    let files: Vec<String> = snapshots
        .list()
        .await?
        .into_iter()
        .filter(|name| {
            SnapshotPeriod::parse_daily_file_name(name).is_some_and(|d| d >= start && d <= end)
        })
        .collect();

    let mut merged: BTreeMap<PullRequestKey, PullRequestRecord> = BTreeMap::new();
    for file in &files {
        let rows = match read_snapshot(snapshots, file).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(file = %file, error = %err, "daily snapshot skipped during merge");
                continue;
            }
        };
        for row in rows {
            merged.insert(row.record.key(), row.record);
        }
    }

    let records = merged
        .into_values()
        .filter(|record| record.touches(&window))
        .collect();
    Ok((files.len(), records))
}

/// Writes the snapshot for the calendar week before `run_date` from the daily
/// snapshots. Returns `None` when there is nothing to merge.
pub async fn export_weekly(
    store: &dyn Store,
    snapshots: &SnapshotStore,
    run_date: NaiveDate,
    utc_offset: FixedOffset,
) -> anyhow::Result<Option<ExportOutcome>> {
    let period = SnapshotPeriod::previous_week_of(run_date);
    let file_name = period.json_file_name();
    if snapshots.exists(&file_name).await? {
        return Ok(Some(existing_outcome(snapshots, file_name).await));
    }

    let (files, records) = merge_daily_snapshots(snapshots, &period, utc_offset).await?;
    if files == 0 || records.is_empty() {
        warn!(file = %file_name, daily_files = files, "no daily exports for the week; weekly export skipped");
        return Ok(None);
    }

    let rows = enrich(store, records).await?;
    let bytes = serde_json::to_vec_pretty(&rows).context("serializing weekly export")?;
    let stored = snapshots.write_once(&file_name, &bytes).await?;
    if stored.already_present {
        return Ok(Some(existing_outcome(snapshots, file_name).await));
    }
    info!(file = %file_name, daily_files = files, records = rows.len(), "weekly export written");
    Ok(Some(ExportOutcome {
        file_name,
        records: rows.len(),
        written: true,
    }))
}
