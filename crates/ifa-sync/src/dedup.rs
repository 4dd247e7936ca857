//! Collapses records sharing a canonical key with a completeness-first merge.

use std::collections::HashMap;

use ifa_core::{CanonicalKey, FunnelPair, MergeDiagnostic, MergeDiagnosticKind, NormalizedRecord};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupOutput {
    pub records: Vec<NormalizedRecord>,
    pub diagnostics: Vec<MergeDiagnostic>,
    /// Canonical keys that had more than one input row.
    pub duplicate_groups: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DedupEngine;

impl DedupEngine {
    pub fn new() -> Self {
        Self
    }

    /// One output record per distinct canonical key, in first-seen order.
    pub fn apply(&self, records: Vec<NormalizedRecord>) -> DedupOutput {
        let mut order: Vec<CanonicalKey> = Vec::new();
        let mut groups: HashMap<CanonicalKey, Vec<NormalizedRecord>> = HashMap::new();
        for record in records {
            let key = record.canonical_key();
            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(record);
        }

        let mut out = DedupOutput::default();
        for key in order {
            let Some(group) = groups.remove(&key) else {
                continue;
            };
            if group.len() > 1 {
                out.duplicate_groups += 1;
                debug!(canonical_key = %key, rows = group.len(), "merging duplicate rows");
            }
            let (merged, diagnostics) = merge_group(&key, group);
            out.records.push(merged);
            out.diagnostics.extend(diagnostics);
        }
        out
    }
}

/// Strictly more populated fields wins; a tie goes to the later integration
/// date, then to the row seen first.
fn pick_winner(group: &[NormalizedRecord]) -> usize {
    let mut best = 0;
    for (idx, candidate) in group.iter().enumerate().skip(1) {
        let current = &group[best];
        let rank = |r: &NormalizedRecord| (r.populated_fields(), r.integration_date);
        if rank(candidate) > rank(current) {
            best = idx;
        }
    }
    best
}

fn merge_group(key: &CanonicalKey, mut group: Vec<NormalizedRecord>) -> (NormalizedRecord, Vec<MergeDiagnostic>) {
    let winner_idx = pick_winner(&group);
    let mut winner = group.swap_remove(winner_idx);
    group.sort_by_key(|r| r.source_row);

    let mut merger = FieldMerger {
        canonical_key: key.to_string(),
        kept_row: winner.source_row,
        diagnostics: Vec::new(),
    };
    for other in &group {
        merger.merge_record(&mut winner, other);
        winner.merged_rows.push(other.source_row);
    }
    winner.merged_rows.sort_unstable();
    (winner, merger.diagnostics)
}

struct FieldMerger {
    canonical_key: String,
    kept_row: usize,
    diagnostics: Vec<MergeDiagnostic>,
}

impl FieldMerger {
    fn merge_record(&mut self, winner: &mut NormalizedRecord, other: &NormalizedRecord) {
        let row = other.source_row;

        let mut hint = (!winner.format_hint.is_empty()).then(|| winner.format_hint.clone());
        let other_hint = (!other.format_hint.is_empty()).then(|| other.format_hint.clone());
        self.field("format_hint", &mut hint, &other_hint, row);
        winner.format_hint = hint.unwrap_or_default();

        self.field("budget", &mut winner.budget, &other.budget, row);
        self.field("integration_date", &mut winner.integration_date, &other.integration_date, row);
        self.field("topic", &mut winner.topic, &other.topic, row);
        self.field("manager", &mut winner.manager, &other.manager, row);
        self.field("utm_campaign", &mut winner.utm_campaign, &other.utm_campaign, row);

        let funnel = &mut winner.funnel;
        let theirs = &other.funnel;
        self.pair("reach", &mut funnel.reach, &theirs.reach, row);
        self.pair("traffic", &mut funnel.traffic, &theirs.traffic, row);
        self.pair("contacts", &mut funnel.contacts, &theirs.contacts, row);
        self.pair("deals", &mut funnel.deals, &theirs.deals, row);
        self.pair("calls", &mut funnel.calls, &theirs.calls, row);
        self.pair("purchases", &mut funnel.purchases, &theirs.purchases, row);
        self.pair(
            "purchases_one_month",
            &mut funnel.purchases_one_month,
            &theirs.purchases_one_month,
            row,
        );
    }

    fn pair(&mut self, stage: &str, kept: &mut FunnelPair, other: &FunnelPair, row: usize) {
        self.field(&format!("{stage}_plan"), &mut kept.plan, &other.plan, row);
        self.field(&format!("{stage}_fact"), &mut kept.fact, &other.fact, row);
    }

    fn field<T>(&mut self, name: &str, kept: &mut Option<T>, other: &Option<T>, other_row: usize)
    where
        T: Clone + PartialEq + ToString,
    {
        let (kind, kept_value, discarded) = match (kept.as_ref(), other.as_ref()) {
            (None, Some(value)) => {
                *kept = Some(value.clone());
                (MergeDiagnosticKind::GapFilled, Some(value.to_string()), None)
            }
            (Some(mine), Some(theirs)) if mine != theirs => {
                warn!(
                    canonical_key = %self.canonical_key,
                    field = name,
                    kept = %mine.to_string(),
                    discarded = %theirs.to_string(),
                    "conflicting duplicate values; keeping the more complete row"
                );
                (
                    MergeDiagnosticKind::Conflict,
                    Some(mine.to_string()),
                    Some(theirs.to_string()),
                )
            }
            _ => return,
        };
        self.diagnostics.push(MergeDiagnostic {
            canonical_key: self.canonical_key.clone(),
            field: name.to_string(),
            kind,
            kept: kept_value,
            discarded,
            kept_row: self.kept_row,
            other_row,
        });
    }
}
