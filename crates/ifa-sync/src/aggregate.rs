//! Exact aggregate tables over the merged record set.

use std::collections::BTreeMap;

use ifa_core::{MergedRecord, Platform, ScoreDimension};
use serde::{Deserialize, Serialize};

/// Budget tiers as inclusive upper bounds; the last tier is open-ended.
const BUDGET_TIERS: [(&str, Option<f64>); 5] = [
    ("0-1000", Some(1_000.0)),
    ("1001-3000", Some(3_000.0)),
    ("3001-5000", Some(5_000.0)),
    ("5001-8000", Some(8_000.0)),
    ("8001+", None),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformRow {
    pub platform: Platform,
    pub integrations: usize,
    pub total_budget: f64,
    pub with_purchases: usize,
    pub total_purchases: u64,
    pub purchase_rate: Option<f64>,
    /// Budget over purchases, counting only integrations that sold something.
    pub cost_per_purchase: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStageRow {
    pub stage: String,
    pub rows: usize,
    pub median: Option<f64>,
    pub mean: Option<f64>,
    pub non_zero: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetTierRow {
    pub tier: String,
    pub integrations: usize,
    pub with_purchases: usize,
    pub purchase_rate: Option<f64>,
    pub total_budget: f64,
    pub total_purchases: u64,
    pub cost_per_purchase: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreComparisonRow {
    pub dimension: ScoreDimension,
    pub with_purchases: Option<f64>,
    pub without_purchases: Option<f64>,
    pub gap: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRow {
    pub value: String,
    pub with_purchases: usize,
    pub without_purchases: usize,
    pub purchase_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregates {
    pub integrations: usize,
    pub with_purchases: usize,
    pub unbudgeted: usize,
    pub platforms: Vec<PlatformRow>,
    pub funnel_stages: Vec<FunnelStageRow>,
    pub budget_tiers: Vec<BudgetTierRow>,
    pub scored_integrations: usize,
    pub scores: Vec<ScoreComparisonRow>,
    pub offer_types: Vec<CategoryRow>,
    pub tones: Vec<CategoryRow>,
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

fn rate(part: usize, whole: usize) -> Option<f64> {
    (whole > 0).then(|| part as f64 / whole as f64)
}

fn purchases(record: &MergedRecord) -> u64 {
    record.record.funnel.purchases.fact.unwrap_or(0)
}

/// Budget and purchases summed over rows that sold something, then divided.
fn winners_cost_per_purchase<'a>(rows: impl Iterator<Item = &'a MergedRecord>) -> Option<f64> {
    let (budget, bought) = rows
        .filter(|r| r.metrics.has_purchases)
        .fold((0.0, 0u64), |(budget, bought), r| {
            (budget + r.record.budget.unwrap_or(0.0), bought + purchases(r))
        });
    crate::merge::safe_divide(Some(budget), Some(bought as f64))
}

fn platform_rows(records: &[MergedRecord]) -> Vec<PlatformRow> {
    let mut grouped: BTreeMap<Platform, Vec<&MergedRecord>> = BTreeMap::new();
    for record in records {
        grouped.entry(record.record.platform).or_default().push(record);
    }
    grouped
        .into_iter()
        .map(|(platform, rows)| {
            let with_purchases = rows.iter().filter(|r| r.metrics.has_purchases).count();
            PlatformRow {
                platform,
                integrations: rows.len(),
                total_budget: rows.iter().filter_map(|r| r.record.budget).sum(),
                with_purchases,
                total_purchases: rows.iter().map(|r| purchases(r)).sum(),
                purchase_rate: rate(with_purchases, rows.len()),
                cost_per_purchase: winners_cost_per_purchase(rows.iter().copied()),
            }
        })
        .collect()
}

fn funnel_rows(records: &[MergedRecord]) -> Vec<FunnelStageRow> {
    let stages: [(&str, fn(&MergedRecord) -> Option<f64>); 5] = [
        ("traffic_to_contact", |r| r.metrics.traffic_to_contact_rate),
        ("contact_to_deal", |r| r.metrics.contact_to_deal_rate),
        ("deal_to_call", |r| r.metrics.deal_to_call_rate),
        ("call_to_purchase", |r| r.metrics.call_to_purchase_rate),
        ("full_funnel", |r| r.metrics.full_funnel_conversion),
    ];
    stages
        .iter()
        .map(|(stage, metric)| {
            let values = records.iter().filter_map(|r| metric(r)).collect::<Vec<_>>();
            FunnelStageRow {
                stage: stage.to_string(),
                rows: values.len(),
                median: median(&values),
                mean: mean(&values),
                non_zero: values.iter().filter(|v| **v > 0.0).count(),
            }
        })
        .collect()
}

fn tier_of(budget: f64) -> usize {
    BUDGET_TIERS
        .iter()
        .position(|(_, upper)| upper.map_or(true, |upper| budget <= upper))
        .unwrap_or(BUDGET_TIERS.len() - 1)
}

fn budget_rows(records: &[MergedRecord]) -> Vec<BudgetTierRow> {
    let mut tiers: Vec<Vec<&MergedRecord>> = vec![Vec::new(); BUDGET_TIERS.len()];
    for record in records {
        if let Some(budget) = record.record.budget {
            tiers[tier_of(budget)].push(record);
        }
    }
    BUDGET_TIERS
        .iter()
        .zip(tiers)
        .map(|((label, _), rows)| {
            let with_purchases = rows.iter().filter(|r| r.metrics.has_purchases).count();
            BudgetTierRow {
                tier: label.to_string(),
                integrations: rows.len(),
                with_purchases,
                purchase_rate: rate(with_purchases, rows.len()),
                total_budget: rows.iter().filter_map(|r| r.record.budget).sum(),
                total_purchases: rows.iter().map(|r| purchases(r)).sum(),
                cost_per_purchase: winners_cost_per_purchase(rows.iter().copied()),
            }
        })
        .collect()
}

fn score_rows(records: &[MergedRecord]) -> (usize, Vec<ScoreComparisonRow>) {
    let scored = records
        .iter()
        .filter_map(|r| {
            let scores = &r.enrichment.as_ref()?.analysis.as_ref()?.scores;
            (!scores.is_empty()).then_some((r.metrics.has_purchases, scores))
        })
        .collect::<Vec<_>>();

    let rows = ScoreDimension::ALL
        .iter()
        .map(|dimension| {
            let side = |bought: bool| {
                let values = scored
                    .iter()
                    .filter(|(has, _)| *has == bought)
                    .filter_map(|(_, scores)| scores.get(*dimension).map(f64::from))
                    .collect::<Vec<_>>();
                mean(&values)
            };
            let with_purchases = side(true);
            let without_purchases = side(false);
            ScoreComparisonRow {
                dimension: *dimension,
                with_purchases,
                without_purchases,
                gap: with_purchases.zip(without_purchases).map(|(w, wo)| w - wo),
            }
        })
        .collect();
    (scored.len(), rows)
}

fn offer_type(record: &MergedRecord) -> Option<&str> {
    record.enrichment.as_ref()?.analysis.as_ref()?.offer_type.as_deref()
}

fn overall_tone(record: &MergedRecord) -> Option<&str> {
    record.enrichment.as_ref()?.analysis.as_ref()?.overall_tone.as_deref()
}

fn category_rows(records: &[MergedRecord], pick: fn(&MergedRecord) -> Option<&str>) -> Vec<CategoryRow> {
    let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for record in records {
        let Some(value) = pick(record).filter(|v| !v.is_empty()) else {
            continue;
        };
        let entry = counts.entry(value.to_string()).or_default();
        if record.metrics.has_purchases {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }
    counts
        .into_iter()
        .map(|(value, (with, without))| CategoryRow {
            value,
            with_purchases: with,
            without_purchases: without,
            purchase_rate: rate(with, with + without),
        })
        .collect()
}

impl Aggregates {
    pub fn compute(records: &[MergedRecord]) -> Self {
        let (scored_integrations, scores) = score_rows(records);
        Self {
            integrations: records.len(),
            with_purchases: records.iter().filter(|r| r.metrics.has_purchases).count(),
            unbudgeted: records.iter().filter(|r| r.record.budget.is_none()).count(),
            platforms: platform_rows(records),
            funnel_stages: funnel_rows(records),
            budget_tiers: budget_rows(records),
            scored_integrations,
            scores,
            offer_types: category_rows(records, offer_type),
            tones: category_rows(records, overall_tone),
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Aggregates".to_string(),
            String::new(),
            format!("- Integrations: {}", self.integrations),
            format!("- With purchases: {}", self.with_purchases),
            format!("- Without budget: {}", self.unbudgeted),
            String::new(),
            "## Platform Performance".to_string(),
            String::new(),
            "| Platform | Count | Total Budget | With Purchases | Purchases | Purchase Rate | Cost/Purchase |".to_string(),
            "|---|---|---|---|---|---|---|".to_string(),
        ];
        for row in &self.platforms {
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} | {} |",
                row.platform,
                row.integrations,
                money(Some(row.total_budget)),
                row.with_purchases,
                row.total_purchases,
                pct(row.purchase_rate),
                money(row.cost_per_purchase)
            ));
        }

        lines.extend([
            String::new(),
            "## Funnel Conversion".to_string(),
            String::new(),
            "| Stage | Rows | Median | Mean | Non-zero |".to_string(),
            "|---|---|---|---|---|".to_string(),
        ]);
        for row in &self.funnel_stages {
            lines.push(format!(
                "| {} | {} | {} | {} | {} |",
                row.stage,
                row.rows,
                pct(row.median),
                pct(row.mean),
                row.non_zero
            ));
        }

        lines.extend([
            String::new(),
            "## Budget Tiers".to_string(),
            String::new(),
            "| Tier | Count | With Purchases | Purchase Rate | Total Budget | Purchases | Cost/Purchase |".to_string(),
            "|---|---|---|---|---|---|---|".to_string(),
        ]);
        for row in &self.budget_tiers {
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} | {} |",
                row.tier,
                row.integrations,
                row.with_purchases,
                pct(row.purchase_rate),
                money(Some(row.total_budget)),
                row.total_purchases,
                money(row.cost_per_purchase)
            ));
        }

        lines.extend([
            String::new(),
            "## Content Scores".to_string(),
            String::new(),
            format!("- Integrations with scores: {}", self.scored_integrations),
            String::new(),
            "| Score | With Purchases | Without Purchases | Gap |".to_string(),
            "|---|---|---|---|".to_string(),
        ]);
        for row in &self.scores {
            lines.push(format!(
                "| {} | {} | {} | {} |",
                row.dimension.as_str(),
                num(row.with_purchases),
                num(row.without_purchases),
                row.gap.map(|g| format!("{g:+.2}")).unwrap_or_else(|| "N/A".into())
            ));
        }

        for (title, rows) in [("Offer Types", &self.offer_types), ("Overall Tone", &self.tones)] {
            lines.extend([
                String::new(),
                format!("## {title}"),
                String::new(),
                "| Value | With Purchases | Without Purchases | Purchase Rate |".to_string(),
                "|---|---|---|---|".to_string(),
            ]);
            for row in rows {
                lines.push(format!(
                    "| {} | {} | {} | {} |",
                    row.value,
                    row.with_purchases,
                    row.without_purchases,
                    pct(row.purchase_rate)
                ));
            }
        }

        lines.push(String::new());
        lines.join("\n")
    }
}

fn num(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.2}")).unwrap_or_else(|| "N/A".into())
}

fn pct(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.1}%", v * 100.0))
        .unwrap_or_else(|| "N/A".into())
}

fn money(value: Option<f64>) -> String {
    value.map(|v| format!("${v:.0}")).unwrap_or_else(|| "N/A".into())
}
