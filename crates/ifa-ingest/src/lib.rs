//! Delimited-input normalization: raw spreadsheet rows into typed records.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};
use csv::StringRecord;
use ifa_core::{FunnelPair, IssueSeverity, NormalizedRecord, ParseIssue, Platform};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

mod classify;

pub use classify::{classify_link, classify_records, parse_offset, Classification};

pub const CRATE_NAME: &str = "ifa-ingest";

/// Header rows occupy line 1; data rows are numbered from here.
const FIRST_DATA_ROW: usize = 2;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("input header is missing required columns {missing:?} (found {found:?})")]
    MissingColumns {
        missing: Vec<String>,
        found: Vec<String>,
    },
    #[error("reading input header: {0}")]
    Header(#[from] csv::Error),
}

/// Logical field -> header token. Values are passed through [`normalize_header`]
/// before lookup, so either the raw label ("Ad link") or the token ("ad_link") works.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMap {
    pub blogger_id: String,
    pub ad_link: String,
    pub format: String,
    pub budget: String,
    pub date: String,
    pub topic: String,
    pub manager: String,
    pub utm_campaign: String,
    pub reach_plan: String,
    pub reach_fact: String,
    pub traffic_plan: String,
    pub traffic_fact: String,
    pub contacts_plan: String,
    pub contacts_fact: String,
    pub deals_plan: String,
    pub deals_fact: String,
    pub calls_plan: String,
    pub calls_fact: String,
    pub purchases_plan: String,
    pub purchases_fact: String,
    pub purchases_one_month_plan: String,
    pub purchases_one_month_fact: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            blogger_id: "name".into(),
            ad_link: "ad_link".into(),
            format: "format".into(),
            budget: "budget".into(),
            date: "date".into(),
            topic: "topic".into(),
            manager: "manager".into(),
            utm_campaign: "utm_campaign".into(),
            reach_plan: "reach_plan".into(),
            reach_fact: "fact_reach".into(),
            traffic_plan: "traffic_plan".into(),
            traffic_fact: "traffic_fact".into(),
            contacts_plan: "contacts_plan".into(),
            contacts_fact: "contacts_fact".into(),
            deals_plan: "deals_plan".into(),
            deals_fact: "deals_fact".into(),
            calls_plan: "calls_plan".into(),
            calls_fact: "calls_fact".into(),
            purchases_plan: "purchase_p_total".into(),
            purchases_fact: "purchase_f_total".into(),
            purchases_one_month_plan: "purchase_p_1_month".into(),
            purchases_one_month_fact: "purchase_f_1_month".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizerOptions {
    pub delimiter: u8,
    pub columns: ColumnMap,
}

impl Default for NormalizerOptions {
    fn default() -> Self {
        Self {
            delimiter: b';',
            columns: ColumnMap::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOutput {
    pub records: Vec<NormalizedRecord>,
    pub issues: Vec<ParseIssue>,
    pub rows_read: usize,
}

impl NormalizeOutput {
    pub fn skipped_rows(&self) -> usize {
        self.issues
            .iter()
            .filter(|issue| issue.severity == IssueSeverity::RowSkipped)
            .count()
    }
}

/// Case-folds a header label and turns every run of non-alphanumerics
/// (spaces, punctuation, embedded line breaks) into a single `_`.
pub fn normalize_header(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_sep = false;
    for ch in label
        .trim_start_matches('\u{feff}')
        .chars()
        .flat_map(char::to_lowercase)
    {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Parses numbers written with a decimal comma and optional `.`/space
/// thousands separators (`"2,6"`, `"1.234,56"`, `"11 000"`). Plain
/// `"1234.5"` is also accepted.
pub fn parse_locale_decimal(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\'')
        .collect();
    if cleaned.is_empty() || cleaned == "-" || cleaned.eq_ignore_ascii_case("nan") {
        return None;
    }

    let commas = cleaned.matches(',').count();
    let dots = cleaned.matches('.').count();
    let canonical = match (commas, dots) {
        (0, 0) | (0, 1) => cleaned,
        (1, 0) => cleaned.replace(',', "."),
        (_, 0) => cleaned.replace(',', ""),
        (0, _) => cleaned.replace('.', ""),
        _ => {
            let last_comma = cleaned.rfind(',')?;
            let last_dot = cleaned.rfind('.')?;
            if last_comma > last_dot {
                cleaned.replace('.', "").replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
    };

    canonical.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn spreadsheet_epoch() -> NaiveDate {
    // Day 0 of the 1900 date system, shifted to absorb the 1900 leap-year bug.
    NaiveDate::from_ymd_opt(1899, 12, 30).unwrap_or(NaiveDate::MIN)
}

/// Converts a spreadsheet day serial to a calendar date. Serials outside the
/// plausible range `1 < n < 100000` are rejected.
pub fn serial_to_date(serial: i64) -> Option<NaiveDate> {
    if serial <= 1 || serial >= 100_000 {
        return None;
    }
    spreadsheet_epoch().checked_add_signed(Duration::days(serial))
}

pub fn date_to_serial(date: NaiveDate) -> i64 {
    (date - spreadsheet_epoch()).num_days()
}

/// Accepts ISO dates, `DD/MM/YYYY`, `DD.MM.YYYY`, and spreadsheet serials
/// (fractional serials are truncated to the day).
pub fn parse_spreadsheet_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    for fmt in ["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Some(date);
        }
    }
    if s.len() > 10 && matches!(s.as_bytes().get(10), Some(b' ') | Some(b'T')) {
        if let Some(date) = s
            .get(..10)
            .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        {
            return Some(date);
        }
    }
    let serial = parse_locale_decimal(s)?;
    serial_to_date(serial.trunc() as i64)
}

struct HeaderIndex {
    positions: HashMap<String, usize>,
}

impl HeaderIndex {
    fn new(headers: &StringRecord) -> Self {
        let mut positions = HashMap::new();
        for (idx, label) in headers.iter().enumerate() {
            positions.entry(normalize_header(label)).or_insert(idx);
        }
        Self { positions }
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.positions.get(&normalize_header(column)).copied()
    }

    fn found(&self) -> Vec<String> {
        let mut found = self.positions.keys().cloned().collect::<Vec<_>>();
        found.sort();
        found
    }
}

/// Collects diagnostics for one row while its cells are coerced.
struct RowContext<'a> {
    row: usize,
    record: &'a StringRecord,
    index: &'a HeaderIndex,
    issues: &'a mut Vec<ParseIssue>,
}

impl RowContext<'_> {
    fn text(&self, column: &str) -> Option<String> {
        let idx = self.index.position(column)?;
        let value = self.record.get(idx)?.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("nan") {
            None
        } else {
            Some(value.to_string())
        }
    }

    fn drop_field(&mut self, column: &str, message: String) {
        warn!(row = self.row, column, %message, "dropping unparseable field");
        self.issues.push(ParseIssue {
            row: self.row,
            column: Some(normalize_header(column)),
            severity: IssueSeverity::FieldDropped,
            message,
        });
    }

    fn non_negative(&mut self, column: &str) -> Option<f64> {
        let raw = self.text(column)?;
        match parse_locale_decimal(&raw) {
            Some(value) if value >= 0.0 => Some(value),
            Some(value) => {
                self.drop_field(column, format!("negative value {value}"));
                None
            }
            None => {
                self.drop_field(column, format!("not a number: {raw:?}"));
                None
            }
        }
    }

    fn count(&mut self, column: &str) -> Option<u64> {
        self.non_negative(column).map(|value| value.round() as u64)
    }

    fn pair(&mut self, plan: &str, fact: &str) -> FunnelPair {
        FunnelPair {
            plan: self.count(plan),
            fact: self.count(fact),
        }
    }

    fn date(&mut self, column: &str) -> Option<NaiveDate> {
        let raw = self.text(column)?;
        let parsed = parse_spreadsheet_date(&raw);
        if parsed.is_none() {
            self.drop_field(column, format!("unrecognized date {raw:?}"));
        }
        parsed
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    options: NormalizerOptions,
}

impl Normalizer {
    pub fn new(options: NormalizerOptions) -> Self {
        Self { options }
    }

    pub fn normalize_path(&self, path: impl AsRef<Path>) -> Result<NormalizeOutput, IngestError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| IngestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "reading integrations");
        self.normalize_reader(file)
    }

    pub fn normalize_reader<R: Read>(&self, reader: R) -> Result<NormalizeOutput, IngestError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(self.options.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let index = HeaderIndex::new(csv_reader.headers()?);
        self.check_required_columns(&index)?;

        let mut output = NormalizeOutput::default();
        for (offset, result) in csv_reader.records().enumerate() {
            let row = FIRST_DATA_ROW + offset;
            output.rows_read += 1;
            match result {
                Ok(record) => {
                    if let Some(normalized) = self.normalize_row(row, &record, &index, &mut output.issues)
                    {
                        output.records.push(normalized);
                    }
                }
                Err(err) => {
                    warn!(row, error = %err, "skipping malformed row");
                    output.issues.push(ParseIssue {
                        row,
                        column: None,
                        severity: IssueSeverity::RowSkipped,
                        message: format!("malformed record: {err}"),
                    });
                }
            }
        }

        info!(
            rows = output.rows_read,
            records = output.records.len(),
            skipped = output.skipped_rows(),
            "normalized input rows"
        );
        Ok(output)
    }

    fn check_required_columns(&self, index: &HeaderIndex) -> Result<(), IngestError> {
        let columns = &self.options.columns;
        let mut missing = [&columns.blogger_id, &columns.ad_link, &columns.format]
            .into_iter()
            .filter(|column| index.position(column).is_none())
            .map(|column| normalize_header(column))
            .collect::<Vec<_>>();
        if index.position(&columns.budget).is_none() && index.position(&columns.date).is_none() {
            missing.push(format!(
                "{} or {}",
                normalize_header(&columns.budget),
                normalize_header(&columns.date)
            ));
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(IngestError::MissingColumns {
                missing,
                found: index.found(),
            })
        }
    }

    fn normalize_row(
        &self,
        row: usize,
        record: &StringRecord,
        index: &HeaderIndex,
        issues: &mut Vec<ParseIssue>,
    ) -> Option<NormalizedRecord> {
        let columns = &self.options.columns;
        let mut ctx = RowContext {
            row,
            record,
            index,
            issues,
        };

        let blogger_id = ctx.text(&columns.blogger_id);
        let ad_link = ctx.text(&columns.ad_link);
        let (Some(blogger_id), Some(ad_link)) = (blogger_id, ad_link) else {
            let message = if record.iter().all(|cell| cell.trim().is_empty()) {
                "empty row".to_string()
            } else {
                "missing blogger identifier or ad link".to_string()
            };
            warn!(row, %message, "skipping row");
            ctx.issues.push(ParseIssue {
                row,
                column: None,
                severity: IssueSeverity::RowSkipped,
                message,
            });
            return None;
        };

        let mut normalized = NormalizedRecord::new(row, blogger_id, ad_link);
        normalized.format_hint = ctx
            .text(&columns.format)
            .map(|hint| hint.to_lowercase())
            .unwrap_or_default();
        normalized.platform = Platform::from_hint(&normalized.format_hint);
        normalized.budget = ctx.non_negative(&columns.budget);
        normalized.integration_date = ctx.date(&columns.date);
        normalized.topic = ctx.text(&columns.topic);
        normalized.manager = ctx.text(&columns.manager);
        normalized.utm_campaign = ctx.text(&columns.utm_campaign);
        normalized.funnel.reach = ctx.pair(&columns.reach_plan, &columns.reach_fact);
        normalized.funnel.traffic = ctx.pair(&columns.traffic_plan, &columns.traffic_fact);
        normalized.funnel.contacts = ctx.pair(&columns.contacts_plan, &columns.contacts_fact);
        normalized.funnel.deals = ctx.pair(&columns.deals_plan, &columns.deals_fact);
        normalized.funnel.calls = ctx.pair(&columns.calls_plan, &columns.calls_fact);
        normalized.funnel.purchases = ctx.pair(&columns.purchases_plan, &columns.purchases_fact);
        normalized.funnel.purchases_one_month = ctx.pair(
            &columns.purchases_one_month_plan,
            &columns.purchases_one_month_fact,
        );
        Some(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Date;Name;Format;Ad link;Budget;Reach (Plan);Fact Reach;Traffic Fact;\"Contacts\nFact\";Deals Fact;Purchase F - TOTAL\n";

    fn normalize(body: &str) -> NormalizeOutput {
        let input = format!("{HEADER}{body}");
        Normalizer::new(NormalizerOptions::default())
            .normalize_reader(input.as_bytes())
            .expect("normalize")
    }

    #[test]
    fn spreadsheet_serial_converts_to_calendar_date() {
        let date = serial_to_date(45748).expect("serial");
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 4, 1).expect("date"));
        assert_eq!(date_to_serial(date), 45748);
        assert_eq!(serial_to_date(date_to_serial(date)), Some(date));
    }

    #[test]
    fn date_cells_accept_iso_day_first_and_serials() {
        let expected = NaiveDate::from_ymd_opt(2025, 10, 27);
        assert_eq!(parse_spreadsheet_date("2025-10-27"), expected);
        assert_eq!(parse_spreadsheet_date("27/10/2025"), expected);
        assert_eq!(parse_spreadsheet_date("27.10.2025"), expected);
        assert_eq!(parse_spreadsheet_date("2025-10-27 00:00:00"), expected);
        assert_eq!(
            parse_spreadsheet_date("45748,0"),
            NaiveDate::from_ymd_opt(2025, 4, 1)
        );
        assert_eq!(parse_spreadsheet_date("October"), None);
        assert_eq!(parse_spreadsheet_date("1"), None);
        assert_eq!(parse_spreadsheet_date(""), None);
    }

    #[test]
    fn locale_decimals_parse() {
        assert_eq!(parse_locale_decimal("2,6"), Some(2.6));
        assert_eq!(parse_locale_decimal("1.234,56"), Some(1234.56));
        assert_eq!(parse_locale_decimal("1 234,56"), Some(1234.56));
        assert_eq!(parse_locale_decimal("11000"), Some(11000.0));
        assert_eq!(parse_locale_decimal("1,234.5"), Some(1234.5));
        assert_eq!(parse_locale_decimal("1.234.567"), Some(1_234_567.0));
        assert_eq!(parse_locale_decimal("-2,5"), Some(-2.5));
        assert_eq!(parse_locale_decimal("nan"), None);
        assert_eq!(parse_locale_decimal(""), None);
        assert_eq!(parse_locale_decimal("abc"), None);
        assert_eq!(parse_locale_decimal("inf"), None);
    }

    #[test]
    fn header_labels_normalize_to_snake_tokens() {
        assert_eq!(normalize_header("Ad link"), "ad_link");
        assert_eq!(normalize_header("  Reach (Plan) "), "reach_plan");
        assert_eq!(normalize_header("Purchase F - TOTAL"), "purchase_f_total");
        assert_eq!(normalize_header("Contacts\r\nFact"), "contacts_fact");
        assert_eq!(normalize_header("\u{feff}Date"), "date");
    }

    #[test]
    fn rows_normalize_into_typed_records() {
        let out = normalize(
            "45748;Tech Blogger;YouTube;https://www.youtube.com/watch?v=abc12345678&t=331;1.500,50;20000;18 500;640;32;4;2\n",
        );
        assert!(out.issues.is_empty(), "{:?}", out.issues);
        let record = &out.records[0];
        assert_eq!(record.source_row, 2);
        assert_eq!(record.blogger_id, "Tech Blogger");
        assert_eq!(record.format_hint, "youtube");
        assert_eq!(record.platform, Platform::Youtube);
        assert_eq!(record.budget, Some(1500.5));
        assert_eq!(record.integration_date, NaiveDate::from_ymd_opt(2025, 4, 1));
        assert_eq!(record.funnel.reach.plan, Some(20_000));
        assert_eq!(record.funnel.reach.fact, Some(18_500));
        assert_eq!(record.funnel.contacts.fact, Some(32));
        assert_eq!(record.funnel.purchases.fact, Some(2));
        assert_eq!(record.funnel.calls, FunnelPair::default());
    }

    #[test]
    fn rows_without_identifier_or_link_are_skipped_not_fatal() {
        let out = normalize(
            ";No Name;youtube;https://youtu.be/abc12345678;100;;;;;;\n45748;;reel;;100;;;;;;\n;;;;;;;;;;\n45748;Ok;story;https://instagram.com/stories/ok/1234;100;;;;;;\n",
        );
        assert_eq!(out.rows_read, 4);
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.skipped_rows(), 2);
        assert!(out.issues.iter().any(|i| i.message == "empty row"));
    }

    #[test]
    fn bad_numbers_are_dropped_with_diagnostics() {
        let out = normalize("45748;A;youtube;https://youtu.be/abc12345678;-50;n/a;10,4;;;;\n");
        let record = &out.records[0];
        assert_eq!(record.budget, None);
        assert_eq!(record.funnel.reach.plan, None);
        assert_eq!(record.funnel.reach.fact, Some(10));
        let dropped = out
            .issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::FieldDropped)
            .count();
        assert_eq!(dropped, 2);
    }

    #[test]
    fn missing_required_columns_is_fatal() {
        let err = Normalizer::new(NormalizerOptions::default())
            .normalize_reader("Name;Budget\nA;1\n".as_bytes())
            .expect_err("missing columns");
        match err {
            IngestError::MissingColumns { missing, .. } => {
                assert_eq!(missing, vec!["ad_link".to_string(), "format".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn custom_delimiter_and_column_names_are_honoured() {
        let options = NormalizerOptions {
            delimiter: b',',
            columns: ColumnMap {
                blogger_id: "Blogger".into(),
                ad_link: "Link".into(),
                ..ColumnMap::default()
            },
        };
        let out = Normalizer::new(options)
            .normalize_reader("Blogger,Link,Format,Date\nA,https://youtu.be/abc12345678,youtube,2025-04-01\n".as_bytes())
            .expect("normalize");
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].ad_link, "https://youtu.be/abc12345678");
    }

    #[test]
    fn normalize_path_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Normalizer::new(NormalizerOptions::default())
            .normalize_path(dir.path().join("absent.csv"))
            .expect_err("missing file");
        assert!(matches!(err, IngestError::Io { .. }));
    }
}
