use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use thiserror::Error;

const ABSOLUTE_FORMAT: &str = "%Y.%m.%d";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized date text `{0}`")]
pub struct NotParseable(pub String);

fn relative_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(\d+)\s*(minutes?|mins?|hours?|hrs?|days?|분|시간|일)\s*(?:ago|전)")
            .expect("relative date pattern compiles")
    })
}

/// Convert displayed date text into a point in time.
///
/// Relative text ("3 hours ago", "3시간 전") is resolved against `now`;
/// absolute text ("2024. 03. 05.") resolves to midnight UTC of that day.
pub fn normalize(text: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, NotParseable> {
    let not_parseable = || NotParseable(text.to_string());

    if let Some(caps) = relative_pattern().captures(text) {
        let amount: i64 = caps[1].parse().map_err(|_| not_parseable())?;
        let unit = caps[2].to_lowercase();
        let delta = if unit.starts_with("min") || unit == "분" {
            Duration::try_minutes(amount)
        } else if unit.starts_with('h') || unit == "시간" {
            Duration::try_hours(amount)
        } else {
            Duration::try_days(amount)
        };
        return delta
            .and_then(|delta| now.checked_sub_signed(delta))
            .ok_or_else(not_parseable);
    }

    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact.trim_end_matches(['.', ',']);
    NaiveDate::parse_from_str(compact, ABSOLUTE_FORMAT)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(not_parseable)
}

/// `YYYY.MM.DD` rendering that `normalize` maps back onto the same day.
pub fn canonical_date(at: DateTime<Utc>) -> String {
    at.format(ABSOLUTE_FORMAT).to_string()
}
