//! Markdown summaries rendered from export snapshots.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::Context;
use chrono::{FixedOffset, NaiveDate};
use prh_core::{ExportedPullRequest, SnapshotPeriod};
use prh_storage::SnapshotStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::export::{merge_daily_snapshots, read_snapshot};

const UNKNOWN_AUTHOR: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportOutcome {
    pub file_name: String,
    pub records: usize,
    pub written: bool,
}

fn author_label(row: &ExportedPullRequest) -> &str {
    row.user
        .as_ref()
        .map(|u| u.login.as_str())
        .or(row.record.author.login.as_deref())
        .filter(|login| !login.is_empty())
        .unwrap_or(UNKNOWN_AUTHOR)
}

/// Renders global totals followed by one section per author.
pub fn render_markdown(title: &str, rows: &[ExportedPullRequest]) -> String {
    let mut by_author: BTreeMap<&str, Vec<&ExportedPullRequest>> = BTreeMap::new();
    for row in rows {
        by_author.entry(author_label(row)).or_default().push(row);
    }
    let contributors = by_author.keys().filter(|a| **a != UNKNOWN_AUTHOR).count();
    let additions: u64 = rows.iter().map(|r| r.additions).sum();
    let deletions: u64 = rows.iter().map(|r| r.deletions).sum();
    let files: u64 = rows.iter().map(|r| r.changed_files).sum();

    let mut out = String::new();
    let _ = writeln!(out, "# {title}\n");
    let _ = writeln!(out, "## Totals\n");
    let _ = writeln!(out, "- Pull requests: {}", rows.len());
    let _ = writeln!(out, "- Unique contributors: {contributors}");
    let _ = writeln!(out, "- Files changed: {files}");
    let _ = writeln!(out, "- Lines added: {additions}");
    let _ = writeln!(out, "- Lines removed: {deletions}\n");

    if rows.is_empty() {
        let _ = writeln!(out, "_No pull request activity._");
        return out;
    }

    for (author, prs) in &by_author {
        let _ = writeln!(out, "## {author}\n");
        for pr in prs {
            let record = &pr.record;
            let link = record
                .html_url
                .as_deref()
                .map(|url| format!("[#{}]({url})", record.number))
                .unwrap_or_else(|| format!("#{}", record.number));
            let _ = writeln!(
                out,
                "- {link} {} ({}, `{}`): +{} / -{} in {} file(s)",
                record.title, record.state, record.repository, pr.additions, pr.deletions, pr.changed_files
            );
        }
        out.push('\n');
    }
    out
}

async fn write_report(
    snapshots: &SnapshotStore,
    file_name: String,
    title: &str,
    rows: &[ExportedPullRequest],
) -> anyhow::Result<ReportOutcome> {
    let markdown = render_markdown(title, rows);
    let stored = snapshots
        .write_once(&file_name, markdown.as_bytes())
        .await
        .with_context(|| format!("writing {file_name}"))?;
    if stored.already_present {
        info!(file = %file_name, "report already present");
    } else {
        info!(file = %file_name, records = rows.len(), "report written");
    }
    Ok(ReportOutcome {
        file_name,
        records: rows.len(),
        written: !stored.already_present,
    })
}

/// Renders `rapport_<date>.md` from the day's snapshot. Returns `None` when
/// the snapshot has not been exported yet.
pub async fn write_daily_report(
    snapshots: &SnapshotStore,
    date: NaiveDate,
) -> anyhow::Result<Option<ReportOutcome>> {
    let period = SnapshotPeriod::Day(date);
    let file_name = period.markdown_file_name();
    if snapshots.exists(&file_name).await? {
        info!(file = %file_name, "report already present");
        return Ok(Some(ReportOutcome {
            file_name,
            records: 0,
            written: false,
        }));
    }
    let source = period.json_file_name();
    if !snapshots.exists(&source).await? {
        warn!(file = %source, "daily snapshot missing; report skipped");
        return Ok(None);
    }
    let rows = read_snapshot(snapshots, &source).await?;
    let title = format!("Pull request report for {}", date.format("%Y-%m-%d"));
    write_report(snapshots, file_name, &title, &rows).await.map(Some)
}

/// Renders the report for the calendar week before `run_date`, from the
/// weekly snapshot or, failing that, from the merged daily snapshots.
pub async fn write_weekly_report(
    snapshots: &SnapshotStore,
    run_date: NaiveDate,
    utc_offset: FixedOffset,
) -> anyhow::Result<Option<ReportOutcome>> {
    let period = SnapshotPeriod::previous_week_of(run_date);
    let SnapshotPeriod::Week { start, end } = period else {
        return Ok(None);
    };
    let file_name = period.markdown_file_name();
    if snapshots.exists(&file_name).await? {
        info!(file = %file_name, "report already present");
        return Ok(Some(ReportOutcome {
            file_name,
            records: 0,
            written: false,
        }));
    }

    let source = period.json_file_name();
    let mut rows = if snapshots.exists(&source).await? {
        read_snapshot(snapshots, &source).await?
    } else {
        Vec::new()
    };
    if rows.is_empty() {
        let (files, merged) = merge_daily_snapshots(snapshots, &period, utc_offset).await?;
        if merged.is_empty() {
            warn!(file = %file_name, daily_files = files, "no data for the week; report skipped");
            return Ok(None);
        }
        // Daily rows carry no identity projection once merged.
        rows = merged
            .into_iter()
            .map(|record| ExportedPullRequest::new(record, None))
            .collect();
    }

    let title = format!(
        "Weekly pull request report {} to {}",
        start.format("%Y-%m-%d"),
        end.format("%Y-%m-%d")
    );
    write_report(snapshots, file_name, &title, &rows).await.map(Some)
}
