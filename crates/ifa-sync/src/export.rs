//! Flat-table exports: CSV for spreadsheets, Parquet snapshots, and the run manifest.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use ifa_core::{ContentAnalysis, MergedRecord, NormalizedRecord, ScoreDimension, StageStatus};
use ifa_storage::sha256_hex;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const LIST_SEPARATOR: &str = " | ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn cell<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn joined(values: &[String]) -> String {
    values.join(LIST_SEPARATOR)
}

fn status_state(status: &StageStatus) -> &'static str {
    match status {
        StageStatus::Succeeded => "succeeded",
        StageStatus::FailedPermanent { .. } => "failed_permanent",
        StageStatus::Pending => "pending",
        StageStatus::NotAttempted => "not_attempted",
    }
}

fn status_reason(status: &StageStatus) -> Option<&str> {
    match status {
        StageStatus::FailedPermanent { reason } => Some(reason),
        _ => None,
    }
}

/// Prepared-record columns in output order.
fn prepared_cells(record: &NormalizedRecord) -> Vec<(String, String)> {
    let funnel = &record.funnel;
    let mut cells = vec![
        ("source_row".to_string(), record.source_row.to_string()),
        (
            "merged_rows".to_string(),
            record
                .merged_rows
                .iter()
                .map(usize::to_string)
                .collect::<Vec<_>>()
                .join(LIST_SEPARATOR),
        ),
        ("blogger_id".to_string(), record.blogger_id.clone()),
        ("ad_link".to_string(), record.ad_link.clone()),
        ("format_hint".to_string(), record.format_hint.clone()),
        ("platform".to_string(), record.platform.to_string()),
        ("link_kind".to_string(), record.link_kind.as_str().to_string()),
        ("is_parseable".to_string(), record.is_parseable.to_string()),
        ("video_id".to_string(), cell(record.video_id.as_ref())),
        (
            "start_offset_seconds".to_string(),
            cell(record.integration_start_offset_seconds),
        ),
        ("budget".to_string(), cell(record.budget)),
        ("integration_date".to_string(), cell(record.integration_date)),
        ("topic".to_string(), cell(record.topic.as_ref())),
        ("manager".to_string(), cell(record.manager.as_ref())),
        ("utm_campaign".to_string(), cell(record.utm_campaign.as_ref())),
    ];
    let stages = [
        ("reach", funnel.reach),
        ("traffic", funnel.traffic),
        ("contacts", funnel.contacts),
        ("deals", funnel.deals),
        ("calls", funnel.calls),
        ("purchases", funnel.purchases),
        ("purchases_one_month", funnel.purchases_one_month),
    ];
    for (stage, pair) in stages {
        cells.push((format!("{stage}_plan"), cell(pair.plan)));
        cells.push((format!("{stage}_fact"), cell(pair.fact)));
    }
    cells
}

fn merged_cells(merged: &MergedRecord) -> Vec<(String, String)> {
    let mut cells = vec![
        ("canonical_key".to_string(), merged.canonical_key.clone()),
        ("run_id".to_string(), merged.run_id.to_string()),
        ("run_at".to_string(), merged.run_at.to_rfc3339()),
    ];
    cells.extend(prepared_cells(&merged.record));

    cells.push(("content_status".into(), status_state(&merged.content_status).into()));
    cells.push(("content_error".into(), cell(status_reason(&merged.content_status))));
    cells.push(("enrichment_status".into(), status_state(&merged.enrichment_status).into()));
    cells.push(("enrichment_error".into(), cell(status_reason(&merged.enrichment_status))));

    let content = merged.content.as_ref();
    cells.extend([
        ("title".to_string(), cell(content.and_then(|c| c.title.as_ref()))),
        ("channel_name".to_string(), cell(content.and_then(|c| c.channel_name.as_ref()))),
        ("channel_subscribers".to_string(), cell(content.and_then(|c| c.channel_subscribers))),
        (
            "published_at".to_string(),
            cell(content.and_then(|c| c.published_at).map(|t| t.to_rfc3339())),
        ),
        ("view_count".to_string(), cell(content.and_then(|c| c.view_count))),
        ("like_count".to_string(), cell(content.and_then(|c| c.like_count))),
        ("comment_count".to_string(), cell(content.and_then(|c| c.comment_count))),
        ("duration_seconds".to_string(), cell(content.and_then(|c| c.duration_seconds))),
        ("has_transcript".to_string(), cell(content.map(|c| c.has_transcript))),
    ]);

    let m = &merged.metrics;
    cells.extend([
        ("cost_per_view".to_string(), cell(m.cost_per_view)),
        ("cost_per_contact".to_string(), cell(m.cost_per_contact)),
        ("cost_per_deal".to_string(), cell(m.cost_per_deal)),
        ("cost_per_purchase".to_string(), cell(m.cost_per_purchase)),
        ("traffic_to_contact_rate".to_string(), cell(m.traffic_to_contact_rate)),
        ("contact_to_deal_rate".to_string(), cell(m.contact_to_deal_rate)),
        ("deal_to_call_rate".to_string(), cell(m.deal_to_call_rate)),
        ("call_to_purchase_rate".to_string(), cell(m.call_to_purchase_rate)),
        ("full_funnel_conversion".to_string(), cell(m.full_funnel_conversion)),
        ("plan_vs_fact_reach".to_string(), cell(m.plan_vs_fact_reach)),
        ("plan_vs_fact_traffic".to_string(), cell(m.plan_vs_fact_traffic)),
        ("engagement_rate".to_string(), cell(m.engagement_rate)),
        ("view_to_reach_ratio".to_string(), cell(m.view_to_reach_ratio)),
        ("has_purchases".to_string(), m.has_purchases.to_string()),
    ]);

    let enrichment = merged.enrichment.as_ref();
    let extraction = enrichment.map(|e| &e.extraction);
    let analysis = enrichment.and_then(|e| e.analysis.as_ref());
    cells.extend([
        ("enrichment_model".to_string(), cell(enrichment.map(|e| &e.model))),
        (
            "enrichment_integration_text".to_string(),
            cell(extraction.and_then(|x| x.integration_text.as_ref())),
        ),
        (
            "enrichment_integration_start_sec".to_string(),
            cell(extraction.and_then(|x| x.integration_start_sec)),
        ),
        (
            "enrichment_integration_duration_sec".to_string(),
            cell(extraction.and_then(|x| x.integration_duration_sec)),
        ),
        (
            "enrichment_integration_position".to_string(),
            cell(extraction.and_then(|x| x.integration_position.as_ref())),
        ),
        (
            "enrichment_is_full_video_ad".to_string(),
            cell(extraction.and_then(|x| x.is_full_video_ad)),
        ),
    ]);

    cells.extend([
        ("enrichment_offer_type".to_string(), analysis_text(analysis, |a| a.offer_type.as_ref())),
        ("enrichment_offer_details".to_string(), analysis_text(analysis, |a| a.offer_details.as_ref())),
        ("enrichment_landing_type".to_string(), analysis_text(analysis, |a| a.landing_type.as_ref())),
        ("enrichment_cta_type".to_string(), analysis_text(analysis, |a| a.cta_type.as_ref())),
        ("enrichment_cta_urgency".to_string(), analysis_text(analysis, |a| a.cta_urgency.as_ref())),
        ("enrichment_cta_text".to_string(), analysis_text(analysis, |a| a.cta_text.as_ref())),
        ("enrichment_has_personal_story".to_string(), analysis_flag(analysis, |a| a.has_personal_story)),
        (
            "enrichment_personal_story_type".to_string(),
            analysis_text(analysis, |a| a.personal_story_type.as_ref()),
        ),
        (
            "enrichment_pain_points_addressed".to_string(),
            analysis.map(|a| joined(&a.pain_points_addressed)).unwrap_or_default(),
        ),
        (
            "enrichment_benefits_mentioned".to_string(),
            analysis.map(|a| joined(&a.benefits_mentioned)).unwrap_or_default(),
        ),
        ("enrichment_objection_handling".to_string(), analysis_flag(analysis, |a| a.objection_handling)),
        ("enrichment_social_proof".to_string(), analysis_text(analysis, |a| a.social_proof.as_ref())),
        ("enrichment_overall_tone".to_string(), analysis_text(analysis, |a| a.overall_tone.as_ref())),
        ("enrichment_language".to_string(), analysis_text(analysis, |a| a.language.as_ref())),
        (
            "enrichment_product_positioning".to_string(),
            analysis_text(analysis, |a| a.product_positioning.as_ref()),
        ),
        (
            "enrichment_target_audience_implied".to_string(),
            analysis_text(analysis, |a| a.target_audience_implied.as_ref()),
        ),
        ("enrichment_competitive_mention".to_string(), analysis_flag(analysis, |a| a.competitive_mention)),
        ("enrichment_price_mentioned".to_string(), analysis_flag(analysis, |a| a.price_mentioned)),
    ]);

    for dimension in ScoreDimension::ALL {
        cells.push((
            format!("score_{}", dimension.as_str()),
            cell(analysis.and_then(|a| a.scores.get(dimension))),
        ));
    }
    cells
}

fn analysis_text(analysis: Option<&ContentAnalysis>, pick: fn(&ContentAnalysis) -> Option<&String>) -> String {
    cell(analysis.and_then(pick))
}

fn analysis_flag(analysis: Option<&ContentAnalysis>, pick: fn(&ContentAnalysis) -> Option<bool>) -> String {
    cell(analysis.and_then(pick))
}

fn write_table<T>(rows: &[T], template: Vec<(String, String)>, cells: fn(&T) -> Vec<(String, String)>) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(template.iter().map(|(name, _)| name))
        .context("writing csv header")?;
    for row in rows {
        writer
            .write_record(cells(row).iter().map(|(_, value)| value))
            .context("writing csv row")?;
    }
    writer.into_inner().context("flushing csv buffer")
}

pub fn prepared_csv(records: &[NormalizedRecord]) -> Result<Vec<u8>> {
    write_table(records, prepared_cells(&NormalizedRecord::new(0, "", "")), prepared_cells)
}

pub fn merged_csv(records: &[MergedRecord]) -> Result<Vec<u8>> {
    let template = MergedRecord {
        run_id: Uuid::nil(),
        run_at: chrono::DateTime::<chrono::Utc>::default(),
        canonical_key: String::new(),
        record: NormalizedRecord::new(0, "", ""),
        content: None,
        enrichment: None,
        content_status: StageStatus::NotAttempted,
        enrichment_status: StageStatus::NotAttempted,
        metrics: Default::default(),
    };
    write_table(records, merged_cells(&template), merged_cells)
}

pub fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

pub fn write_merged_parquet(path: &Path, merged: &[MergedRecord]) -> Result<()> {
    let strings = |name: &str, nullable: bool, pick: &dyn Fn(&MergedRecord) -> Option<String>| {
        let array: ArrayRef = Arc::new(StringArray::from(merged.iter().map(pick).collect::<Vec<_>>()));
        (ArrowField::new(name, DataType::Utf8, nullable), array)
    };
    let floats = |name: &str, pick: &dyn Fn(&MergedRecord) -> Option<f64>| {
        let array: ArrayRef = Arc::new(Float64Array::from(merged.iter().map(pick).collect::<Vec<_>>()));
        (ArrowField::new(name, DataType::Float64, true), array)
    };
    let counts = |name: &str, pick: &dyn Fn(&MergedRecord) -> Option<u64>| {
        let array: ArrayRef = Arc::new(UInt64Array::from(merged.iter().map(pick).collect::<Vec<_>>()));
        (ArrowField::new(name, DataType::UInt64, true), array)
    };

    let mut columns = vec![
        strings("canonical_key", false, &|m| Some(m.canonical_key.clone())),
        strings("blogger_id", false, &|m| Some(m.record.blogger_id.clone())),
        strings("ad_link", false, &|m| Some(m.record.ad_link.clone())),
        strings("platform", false, &|m| Some(m.record.platform.to_string())),
        strings("video_id", true, &|m| m.record.video_id.clone()),
        (
            ArrowField::new("is_parseable", DataType::Boolean, false),
            Arc::new(BooleanArray::from(
                merged.iter().map(|m| m.record.is_parseable).collect::<Vec<_>>(),
            )) as ArrayRef,
        ),
        floats("budget", &|m| m.record.budget),
        strings("integration_date", true, &|m| m.record.integration_date.map(|d| d.to_string())),
        counts("reach_plan", &|m| m.record.funnel.reach.plan),
        counts("reach_fact", &|m| m.record.funnel.reach.fact),
        counts("traffic_plan", &|m| m.record.funnel.traffic.plan),
        counts("traffic_fact", &|m| m.record.funnel.traffic.fact),
        counts("contacts_fact", &|m| m.record.funnel.contacts.fact),
        counts("deals_fact", &|m| m.record.funnel.deals.fact),
        counts("calls_fact", &|m| m.record.funnel.calls.fact),
        counts("purchases_fact", &|m| m.record.funnel.purchases.fact),
        strings("content_status", false, &|m| Some(status_state(&m.content_status).to_string())),
        strings("enrichment_status", false, &|m| Some(status_state(&m.enrichment_status).to_string())),
        counts("view_count", &|m| m.content.as_ref().and_then(|c| c.view_count)),
        counts("like_count", &|m| m.content.as_ref().and_then(|c| c.like_count)),
        counts("comment_count", &|m| m.content.as_ref().and_then(|c| c.comment_count)),
        floats("cost_per_view", &|m| m.metrics.cost_per_view),
        floats("cost_per_contact", &|m| m.metrics.cost_per_contact),
        floats("cost_per_deal", &|m| m.metrics.cost_per_deal),
        floats("cost_per_purchase", &|m| m.metrics.cost_per_purchase),
        floats("traffic_to_contact_rate", &|m| m.metrics.traffic_to_contact_rate),
        floats("contact_to_deal_rate", &|m| m.metrics.contact_to_deal_rate),
        floats("deal_to_call_rate", &|m| m.metrics.deal_to_call_rate),
        floats("call_to_purchase_rate", &|m| m.metrics.call_to_purchase_rate),
        floats("full_funnel_conversion", &|m| m.metrics.full_funnel_conversion),
        floats("plan_vs_fact_reach", &|m| m.metrics.plan_vs_fact_reach),
        floats("plan_vs_fact_traffic", &|m| m.metrics.plan_vs_fact_traffic),
        floats("engagement_rate", &|m| m.metrics.engagement_rate),
        floats("view_to_reach_ratio", &|m| m.metrics.view_to_reach_ratio),
        (
            ArrowField::new("has_purchases", DataType::Boolean, false),
            Arc::new(BooleanArray::from(
                merged.iter().map(|m| m.metrics.has_purchases).collect::<Vec<_>>(),
            )) as ArrayRef,
        ),
        strings("offer_type", true, &|m| {
            m.enrichment.as_ref()?.analysis.as_ref()?.offer_type.clone()
        }),
        strings("overall_tone", true, &|m| {
            m.enrichment.as_ref()?.analysis.as_ref()?.overall_tone.clone()
        }),
    ];
    for dimension in ScoreDimension::ALL {
        let scores = UInt32Array::from(
            merged
                .iter()
                .map(|m| {
                    let analysis = m.enrichment.as_ref()?.analysis.as_ref()?;
                    analysis.scores.get(dimension).map(u32::from)
                })
                .collect::<Vec<_>>(),
        );
        columns.push((
            ArrowField::new(format!("score_{}", dimension.as_str()), DataType::UInt32, true),
            Arc::new(scores) as ArrayRef,
        ));
    }

    let (fields, arrays): (Vec<_>, Vec<_>) = columns.into_iter().unzip();
    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .context("building merged record batch")?;
    write_parquet(path, batch)
}

pub fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
