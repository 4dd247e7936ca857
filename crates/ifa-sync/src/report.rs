//! Run report: everything that was skipped, ambiguous, merged or failed.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use ifa_core::{ClassificationAmbiguity, IssueSeverity, MergeDiagnostic, MergedRecord, ParseIssue, StageStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orchestrator::StageSummary;

/// Diagnostics produced by the prepare stage; persisted next to the prepared
/// records so a later `merge` can report them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrepDiagnostics {
    pub input_path: String,
    pub rows_read: usize,
    pub records_prepared: usize,
    pub duplicate_groups: usize,
    pub issues: Vec<ParseIssue>,
    pub ambiguities: Vec<ClassificationAmbiguity>,
    pub merge_diagnostics: Vec<MergeDiagnostic>,
}

impl PrepDiagnostics {
    pub fn skipped_rows(&self) -> impl Iterator<Item = &ParseIssue> {
        self.issues
            .iter()
            .filter(|issue| issue.severity == IssueSeverity::RowSkipped)
    }

    pub fn dropped_fields(&self) -> impl Iterator<Item = &ParseIssue> {
        self.issues
            .iter()
            .filter(|issue| issue.severity == IssueSeverity::FieldDropped)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub succeeded: usize,
    pub failed_permanent: usize,
    pub pending: usize,
    pub not_attempted: usize,
}

impl StatusCounts {
    fn add(&mut self, status: &StageStatus) {
        match status {
            StageStatus::Succeeded => self.succeeded += 1,
            StageStatus::FailedPermanent { .. } => self.failed_permanent += 1,
            StageStatus::Pending => self.pending += 1,
            StageStatus::NotAttempted => self.not_attempted += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub prep: PrepDiagnostics,
    pub content_fetch: Option<StageSummary>,
    pub enrichment: Option<StageSummary>,
    pub merged_records: usize,
    pub content_status: StatusCounts,
    pub enrichment_status: StatusCounts,
    pub records_by_platform: BTreeMap<String, usize>,
}

impl RunReport {
    pub fn build(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        prep: PrepDiagnostics,
        content_fetch: Option<StageSummary>,
        enrichment: Option<StageSummary>,
        merged: &[MergedRecord],
    ) -> Self {
        let mut content_status = StatusCounts::default();
        let mut enrichment_status = StatusCounts::default();
        let mut records_by_platform: BTreeMap<String, usize> = BTreeMap::new();
        for record in merged {
            content_status.add(&record.content_status);
            enrichment_status.add(&record.enrichment_status);
            *records_by_platform
                .entry(record.record.platform.as_str().to_string())
                .or_default() += 1;
        }
        Self {
            run_id,
            started_at,
            finished_at,
            prep,
            content_fetch,
            enrichment,
            merged_records: merged.len(),
            content_status,
            enrichment_status,
            records_by_platform,
        }
    }

    /// True when some item is still pending or the run stopped early.
    pub fn is_incomplete(&self) -> bool {
        [&self.content_fetch, &self.enrichment]
            .into_iter()
            .flatten()
            .any(|summary| summary.interrupted || summary.pending > 0)
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Integration Funnel Run Report\n");
        let _ = writeln!(out, "- Run ID: `{}`", self.run_id);
        let _ = writeln!(out, "- Started: {}", self.started_at);
        let _ = writeln!(out, "- Finished: {}", self.finished_at);
        let _ = writeln!(out, "- Input: `{}`", self.prep.input_path);
        let _ = writeln!(out, "- Rows read: {}", self.prep.rows_read);
        let _ = writeln!(out, "- Prepared records: {}", self.prep.records_prepared);
        let _ = writeln!(out, "- Duplicate groups merged: {}", self.prep.duplicate_groups);
        let _ = writeln!(out, "- Merged records: {}", self.merged_records);
        if self.is_incomplete() {
            let _ = writeln!(out, "- **Incomplete**: some items are still pending; re-run to resume");
        }

        let _ = writeln!(out, "\n## Records by Platform\n");
        for (platform, count) in &self.records_by_platform {
            let _ = writeln!(out, "- {platform}: {count}");
        }

        let _ = writeln!(out, "\n## Stage Outcomes\n");
        let _ = writeln!(out, "| stage | succeeded | failed | pending | not attempted |");
        let _ = writeln!(out, "|---|---|---|---|---|");
        for (stage, counts) in [("content", &self.content_status), ("enrichment", &self.enrichment_status)] {
            let _ = writeln!(
                out,
                "| {stage} | {} | {} | {} | {} |",
                counts.succeeded, counts.failed_permanent, counts.pending, counts.not_attempted
            );
        }

        for summary in [&self.content_fetch, &self.enrichment].into_iter().flatten() {
            write_stage_summary(&mut out, summary);
        }

        let skipped: Vec<_> = self.prep.skipped_rows().collect();
        let _ = writeln!(out, "\n## Skipped Rows ({})\n", skipped.len());
        for issue in skipped {
            let _ = writeln!(out, "- row {}: {}", issue.row, issue.message);
        }

        let dropped: Vec<_> = self.prep.dropped_fields().collect();
        if !dropped.is_empty() {
            let _ = writeln!(out, "\n## Dropped Fields ({})\n", dropped.len());
            for issue in dropped {
                let column = issue.column.as_deref().unwrap_or("-");
                let _ = writeln!(out, "- row {} `{column}`: {}", issue.row, issue.message);
            }
        }

        let _ = writeln!(
            out,
            "\n## Classification Ambiguities ({})\n",
            self.prep.ambiguities.len()
        );
        for ambiguity in &self.prep.ambiguities {
            let _ = writeln!(
                out,
                "- `{}` ({}): {}",
                ambiguity.ad_link,
                ambiguity.platform.as_str(),
                ambiguity.reason
            );
        }

        let _ = writeln!(
            out,
            "\n## Merge Diagnostics ({})\n",
            self.prep.merge_diagnostics.len()
        );
        for diag in &self.prep.merge_diagnostics {
            let _ = writeln!(
                out,
                "- `{}` {} {:?}: kept {} (row {}), other {} (row {})",
                diag.canonical_key,
                diag.field,
                diag.kind,
                diag.kept.as_deref().unwrap_or("-"),
                diag.kept_row,
                diag.discarded.as_deref().unwrap_or("-"),
                diag.other_row
            );
        }
        out
    }
}

fn write_stage_summary(out: &mut String, summary: &StageSummary) {
    let _ = writeln!(out, "\n### {}\n", summary.stage);
    let _ = writeln!(
        out,
        "- items: {}, attempted this run: {}, skipped: {}",
        summary.total_items, summary.attempted, summary.skipped
    );
    let _ = writeln!(
        out,
        "- succeeded: {}, failed: {}, pending: {}{}",
        summary.succeeded,
        summary.failed_permanent,
        summary.pending,
        if summary.interrupted { " (interrupted)" } else { "" }
    );
    for failure in &summary.failures {
        let _ = writeln!(out, "- failed `{}`: {}", failure.key, failure.reason);
    }
    for key in &summary.pending_keys {
        let _ = writeln!(out, "- pending `{key}`");
    }
}
