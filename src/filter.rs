//! Incremental date filtering.
//!
//! Each table has an ordered list of date fields (last-modified first). The
//! first field present with a non-empty value dates the record; records dated
//! before the cutoff are excluded. Records with no usable date are governed
//! by [`DatePolicy`], which defaults to keeping them.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;
use tracing::debug;

use crate::config::DatePolicy;
use crate::models::FieldValue;

/// Naive formats tried after RFC 3339, most specific first.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Integer timestamps above this are taken to be milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Parse a date or timestamp string into a naive (offset-stripped) value.
///
/// Timestamps with an offset keep their local wall-clock time, matching how
/// the exporter's users read them.
pub fn parse_date(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.naive_local());
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Parse a JSON value holding a date string or a Unix timestamp.
pub fn parse_date_value(value: &Value) -> Option<NaiveDateTime> {
    match FieldValue::from(value) {
        FieldValue::String(s) => parse_date(s),
        FieldValue::Int(n) => {
            let dt = if n.unsigned_abs() >= MILLIS_THRESHOLD as u64 {
                DateTime::from_timestamp_millis(n)
            } else {
                DateTime::from_timestamp(n, 0)
            };
            dt.map(|d| d.naive_utc())
        }
        _ => None,
    }
}

/// The date of one record, as far as the filter can tell.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordDate {
    Found(NaiveDateTime),
    Missing,
    Unparsable { field: String, raw: String },
}

/// Result of filtering one table's records.
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub kept: Vec<Value>,
    pub excluded: usize,
    /// Kept or excluded records that had no usable date.
    pub undated: usize,
    pub min_date: Option<NaiveDateTime>,
    pub max_date: Option<NaiveDateTime>,
}

pub struct DateFilter<'a> {
    fields: &'a [String],
    cutoff: Option<NaiveDateTime>,
    policy: DatePolicy,
}

impl<'a> DateFilter<'a> {
    pub fn new(fields: &'a [String], cutoff: Option<NaiveDate>, policy: DatePolicy) -> Self {
        Self {
            fields,
            cutoff: cutoff.and_then(|d| d.and_hms_opt(0, 0, 0)),
            policy,
        }
    }

    pub fn record_date(&self, record: &Value) -> RecordDate {
        for field in self.fields {
            let Some(value) = record.get(field.as_str()) else {
                continue;
            };
            match value {
                Value::Null => continue,
                Value::String(s) if s.trim().is_empty() => continue,
                _ => {}
            }
            return match parse_date_value(value) {
                Some(dt) => RecordDate::Found(dt),
                None => RecordDate::Unparsable {
                    field: field.clone(),
                    raw: value.to_string(),
                },
            };
        }
        RecordDate::Missing
    }

    /// Whether `record` passes the cutoff.
    pub fn keep(&self, record: &Value) -> bool {
        let Some(cutoff) = self.cutoff else {
            return true;
        };
        match self.record_date(record) {
            RecordDate::Found(dt) => dt >= cutoff,
            RecordDate::Missing => self.policy == DatePolicy::Keep,
            RecordDate::Unparsable { field, raw } => {
                debug!(field = %field, value = %raw, policy = ?self.policy, "unparsable date");
                self.policy == DatePolicy::Keep
            }
        }
    }

    pub fn apply(&self, records: Vec<Value>) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        for record in records {
            let date = match self.record_date(&record) {
                RecordDate::Found(dt) => Some(dt),
                _ => {
                    outcome.undated += 1;
                    None
                }
            };
            if !self.keep(&record) {
                outcome.excluded += 1;
                continue;
            }
            if let Some(dt) = date {
                outcome.min_date = Some(outcome.min_date.map_or(dt, |m| m.min(dt)));
                outcome.max_date = Some(outcome.max_date.map_or(dt, |m| m.max(dt)));
            }
            outcome.kept.push(record);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields() -> Vec<String> {
        vec!["last_modified_time".to_string(), "date".to_string()]
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_common_formats() {
        let midnight = ymd(2024, 6, 10).and_hms_opt(0, 0, 0).unwrap();
        assert_eq!(parse_date("2024-06-10"), Some(midnight));
        assert_eq!(
            parse_date("2024-06-10T12:30:00+0530"),
            ymd(2024, 6, 10).and_hms_opt(12, 30, 0)
        );
        assert_eq!(
            parse_date("2024-06-10T12:30:00Z"),
            ymd(2024, 6, 10).and_hms_opt(12, 30, 0)
        );
        assert_eq!(
            parse_date("2024-06-10 08:00:00"),
            ymd(2024, 6, 10).and_hms_opt(8, 0, 0)
        );
        assert_eq!(
            parse_date("2024-06-10T08:00:00.250"),
            ymd(2024, 6, 10).and_hms_milli_opt(8, 0, 0, 250)
        );
        assert_eq!(parse_date("June 10th"), None);
        assert_eq!(parse_date("  "), None);
    }

    #[test]
    fn parses_unix_timestamps() {
        let expected = ymd(2024, 1, 1).and_hms_opt(0, 0, 0);
        assert_eq!(parse_date_value(&json!(1_704_067_200)), expected);
        assert_eq!(parse_date_value(&json!(1_704_067_200_000i64)), expected);
        assert_eq!(parse_date_value(&json!(true)), None);
    }

    #[test]
    fn extreme_integers_are_unparsable_not_fatal() {
        assert_eq!(parse_date_value(&json!(i64::MIN)), None);
        assert_eq!(parse_date_value(&json!(i64::MAX)), None);

        let f = fields();
        let filter = DateFilter::new(&f, Some(ymd(2024, 5, 1)), DatePolicy::Keep);
        assert!(filter.keep(&json!({"date": i64::MIN})));
        assert!(filter.keep(&json!({"date": i64::MAX})));
        let strict = DateFilter::new(&f, Some(ymd(2024, 5, 1)), DatePolicy::Drop);
        assert!(!strict.keep(&json!({"date": i64::MIN})));
    }

    #[test]
    fn cutoff_keeps_on_or_after() {
        let f = fields();
        let filter = DateFilter::new(&f, Some(ymd(2024, 5, 1)), DatePolicy::Keep);
        let records = vec![
            json!({"last_modified_time": "2024-01-01"}),
            json!({"last_modified_time": "2024-06-01"}),
            json!({"last_modified_time": "2025-01-01"}),
            json!({"other": 1}),
        ];
        let outcome = filter.apply(records);
        assert_eq!(outcome.kept.len(), 3);
        assert_eq!(outcome.kept[0]["last_modified_time"], "2024-06-01");
        assert_eq!(outcome.kept[1]["last_modified_time"], "2025-01-01");
        assert_eq!(outcome.kept[2]["other"], 1);
        assert_eq!(outcome.excluded, 1);
        assert_eq!(outcome.undated, 1);
        assert_eq!(outcome.min_date, ymd(2024, 6, 1).and_hms_opt(0, 0, 0));
        assert_eq!(outcome.max_date, ymd(2025, 1, 1).and_hms_opt(0, 0, 0));
    }

    #[test]
    fn cutoff_day_itself_is_included() {
        let f = fields();
        let filter = DateFilter::new(&f, Some(ymd(2024, 5, 1)), DatePolicy::Keep);
        assert!(filter.keep(&json!({"date": "2024-05-01"})));
        assert!(!filter.keep(&json!({"date": "2024-04-30T23:59:59"})));
    }

    #[test]
    fn field_priority_and_empty_values() {
        let f = fields();
        let filter = DateFilter::new(&f, Some(ymd(2024, 5, 1)), DatePolicy::Keep);
        // last_modified_time wins over date
        assert!(filter.keep(&json!({"last_modified_time": "2024-06-01", "date": "2020-01-01"})));
        assert!(!filter.keep(&json!({"last_modified_time": "2020-01-01", "date": "2024-06-01"})));
        // null and blank fall through to the next field
        assert!(!filter.keep(&json!({"last_modified_time": null, "date": "2020-01-01"})));
        assert!(!filter.keep(&json!({"last_modified_time": " ", "date": "2020-01-01"})));
    }

    #[test]
    fn policy_governs_undated_records() {
        let f = fields();
        let keep = DateFilter::new(&f, Some(ymd(2024, 5, 1)), DatePolicy::Keep);
        let drop = DateFilter::new(&f, Some(ymd(2024, 5, 1)), DatePolicy::Drop);
        let garbled = json!({"last_modified_time": "yesterday"});
        let missing = json!({"id": 1});
        assert!(keep.keep(&garbled));
        assert!(keep.keep(&missing));
        assert!(!drop.keep(&garbled));
        assert!(!drop.keep(&missing));
        assert!(matches!(keep.record_date(&garbled), RecordDate::Unparsable { .. }));
    }

    #[test]
    fn no_cutoff_keeps_everything() {
        let f = fields();
        let filter = DateFilter::new(&f, None, DatePolicy::Drop);
        let outcome = filter.apply(vec![json!({"date": "1999-01-01"}), json!({})]);
        assert_eq!(outcome.kept.len(), 2);
        assert_eq!(outcome.excluded, 0);
    }
}
