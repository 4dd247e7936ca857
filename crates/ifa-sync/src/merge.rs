//! Outer join of prepared records with fetched content and enrichment, plus
//! per-record ratio metrics.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ifa_core::{
    ContentRecord, ContentSummary, DerivedMetrics, EnrichmentRecord, ItemState, MergedRecord,
    NormalizedRecord, StageStatus,
};
use ifa_storage::{Checkpoint, ItemRecord};
use tracing::debug;
use uuid::Uuid;

/// `numerator / denominator`, or null when either side is missing, the
/// denominator is not strictly positive, or the quotient is not finite.
pub fn safe_divide(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    let numerator = numerator?;
    let denominator = denominator.filter(|d| d.is_finite() && *d > 0.0)?;
    let ratio = numerator / denominator;
    ratio.is_finite().then_some(ratio)
}

fn count(value: Option<u64>) -> Option<f64> {
    value.map(|v| v as f64)
}

pub fn compute_metrics(record: &NormalizedRecord, content: Option<&ContentSummary>) -> DerivedMetrics {
    let funnel = &record.funnel;
    let budget = record.budget;
    let reach = count(funnel.reach.fact);
    let traffic = count(funnel.traffic.fact);
    let contacts = count(funnel.contacts.fact);
    let deals = count(funnel.deals.fact);
    let calls = count(funnel.calls.fact);
    let purchases = count(funnel.purchases.fact);

    let views = content.and_then(|c| count(c.view_count));
    let interactions = content.map(|c| c.like_count.unwrap_or(0).saturating_add(c.comment_count.unwrap_or(0)) as f64);

    DerivedMetrics {
        cost_per_view: safe_divide(budget, reach),
        cost_per_contact: safe_divide(budget, contacts),
        cost_per_deal: safe_divide(budget, deals),
        cost_per_purchase: safe_divide(budget, purchases),
        traffic_to_contact_rate: safe_divide(contacts, traffic),
        contact_to_deal_rate: safe_divide(deals, contacts),
        deal_to_call_rate: safe_divide(calls, deals),
        call_to_purchase_rate: safe_divide(purchases, calls),
        full_funnel_conversion: safe_divide(purchases, reach),
        plan_vs_fact_reach: safe_divide(reach, count(funnel.reach.plan)),
        plan_vs_fact_traffic: safe_divide(traffic, count(funnel.traffic.plan)),
        engagement_rate: safe_divide(interactions, views),
        view_to_reach_ratio: safe_divide(views, reach),
        has_purchases: funnel.purchases.fact.is_some_and(|p| p > 0),
    }
}

pub fn stage_status<T>(record: Option<&ItemRecord<T>>) -> StageStatus {
    match record {
        None => StageStatus::NotAttempted,
        Some(record) => match record.state {
            ItemState::Succeeded => StageStatus::Succeeded,
            ItemState::FailedPermanent => StageStatus::FailedPermanent {
                reason: record.last_error.clone().unwrap_or_default(),
            },
            ItemState::Pending | ItemState::InFlight | ItemState::FailedTransient => StageStatus::Pending,
        },
    }
}

pub struct MergeEngine {
    run_id: Uuid,
    run_at: DateTime<Utc>,
}

impl MergeEngine {
    pub fn new(run_id: Uuid, run_at: DateTime<Utc>) -> Self {
        Self { run_id, run_at }
    }

    /// One merged row per prepared record; missing content never drops a row.
    pub fn merge(
        &self,
        records: &[NormalizedRecord],
        content: &Checkpoint<ContentRecord>,
        enrichment: &Checkpoint<EnrichmentRecord>,
    ) -> Vec<MergedRecord> {
        let mut by_video: HashMap<&str, Vec<&str>> = HashMap::new();
        for key in content.items.keys() {
            if let Some((_, video_id)) = key.split_once(':') {
                by_video.entry(video_id).or_default().push(key.as_str());
            }
        }

        records
            .iter()
            .map(|record| {
                let content_key = record.content_ref().filter(|_| record.is_parseable).and_then(|content_ref| {
                    let key = content_ref.to_string();
                    if content.get(&key).is_some() {
                        return Some(key);
                    }
                    match by_video.get(content_ref.video_id.as_str()).map(Vec::as_slice) {
                        Some([only]) => {
                            debug!(canonical_key = %record.canonical_key(), content = %only, "joined on video_id");
                            Some(only.to_string())
                        }
                        _ => None,
                    }
                });

                let content_item = content_key.as_deref().and_then(|key| content.get(key));
                let content_status = stage_status(content_item);
                let summary = content_item
                    .filter(|item| item.state == ItemState::Succeeded)
                    .and_then(|item| item.result.as_ref())
                    .map(ContentSummary::from);

                let enrichment_item = content_key.as_deref().and_then(|key| enrichment.get(key));
                let enrichment_status = match content_status {
                    StageStatus::Succeeded => stage_status(enrichment_item),
                    _ => StageStatus::NotAttempted,
                };
                let enriched = enrichment_item
                    .filter(|item| item.state == ItemState::Succeeded)
                    .and_then(|item| item.result.clone());

                MergedRecord {
                    run_id: self.run_id,
                    run_at: self.run_at,
                    canonical_key: record.canonical_key().to_string(),
                    metrics: compute_metrics(record, summary.as_ref()),
                    record: record.clone(),
                    content: summary,
                    enrichment: enriched,
                    content_status,
                    enrichment_status,
                }
            })
            .collect()
    }
}
