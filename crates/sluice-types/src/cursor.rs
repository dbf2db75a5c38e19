//! Incremental cursor values and lookback windows.
//!
//! A cursor's kind comes from the declared type of its column, or from the
//! stored values when the column is untyped or textual. Values are
//! serialized as plain strings (ISO-8601 for temporal kinds) so the state
//! store stays type-agnostic.

use std::cmp::Ordering;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::schema::ColumnType;

static LOOKBACK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s*([A-Za-z]*)\s*$").expect("valid lookback regex")
});

const DATE_FMT: &str = "%Y-%m-%d";
const NAIVE_TS_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Errors raised while interpreting cursor or lookback values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    #[error("invalid lookback '{0}': expected a count optionally followed by s/m/h/d/w")]
    InvalidLookback(String),
    #[error("lookback '{lookback}' does not apply to a {kind} cursor")]
    LookbackKindMismatch { lookback: String, kind: CursorKind },
    #[error("cursor value '{value}' is not a valid {kind}")]
    InvalidValue { value: String, kind: CursorKind },
}

/// Ordering domain of a cursor column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorKind {
    Integer,
    Real,
    Date,
    Timestamp,
    Text,
}

impl CursorKind {
    /// Kind implied by a declared column type.
    ///
    /// `None` for untyped and character columns: SQLite keeps dates in TEXT,
    /// so their kind is inferred from the stored values instead.
    #[must_use]
    pub fn from_column_type(data_type: &ColumnType) -> Option<Self> {
        match data_type {
            ColumnType::Untyped | ColumnType::Char(_) | ColumnType::Varchar(_) | ColumnType::Text => {
                None
            }
            t if t.is_integer() => Some(Self::Integer),
            ColumnType::Real | ColumnType::Double => Some(Self::Real),
            ColumnType::Date => Some(Self::Date),
            ColumnType::Timestamp => Some(Self::Timestamp),
            _ => Some(Self::Text),
        }
    }

    #[must_use]
    pub fn is_temporal(self) -> bool {
        matches!(self, Self::Date | Self::Timestamp)
    }

    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Real)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
            Self::Text => "text",
        }
    }
}

impl std::fmt::Display for CursorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed cursor position.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorValue {
    Integer(i64),
    Real(f64),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Text(String),
}

fn parse_real(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_TS_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|ndt| ndt.and_utc())
}

impl CursorValue {
    /// Parse a serialized value as the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::InvalidValue`] when `raw` does not parse.
    pub fn parse(kind: CursorKind, raw: &str) -> Result<Self, CursorError> {
        let raw = raw.trim();
        let invalid = || CursorError::InvalidValue {
            value: raw.to_string(),
            kind,
        };
        match kind {
            CursorKind::Integer => raw.parse().map(Self::Integer).map_err(|_| invalid()),
            CursorKind::Real => parse_real(raw).map(Self::Real).ok_or_else(invalid),
            CursorKind::Date => match NaiveDate::parse_from_str(raw, DATE_FMT) {
                Ok(d) => Ok(Self::Date(d)),
                // Date columns sometimes hold midnight timestamps.
                Err(_) => parse_timestamp(raw)
                    .map(|ts| Self::Date(ts.date_naive()))
                    .ok_or_else(invalid),
            },
            CursorKind::Timestamp => match parse_timestamp(raw) {
                Some(ts) => Ok(Self::Timestamp(ts)),
                None => NaiveDate::parse_from_str(raw, DATE_FMT)
                    .map(|d| Self::Timestamp(d.and_time(chrono::NaiveTime::MIN).and_utc()))
                    .map_err(|_| invalid()),
            },
            CursorKind::Text => Ok(Self::Text(raw.to_string())),
        }
    }

    /// Infer a value for an untyped column: integer, then real, then date,
    /// then timestamp, else text.
    #[must_use]
    pub fn infer(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(v) = raw.parse::<i64>() {
            return Self::Integer(v);
        }
        if let Some(v) = parse_real(raw) {
            return Self::Real(v);
        }
        if let Ok(d) = NaiveDate::parse_from_str(raw, DATE_FMT) {
            return Self::Date(d);
        }
        if let Some(ts) = parse_timestamp(raw) {
            return Self::Timestamp(ts);
        }
        Self::Text(raw.to_string())
    }

    #[must_use]
    pub fn kind(&self) -> CursorKind {
        match self {
            Self::Integer(_) => CursorKind::Integer,
            Self::Real(_) => CursorKind::Real,
            Self::Date(_) => CursorKind::Date,
            Self::Timestamp(_) => CursorKind::Timestamp,
            Self::Text(_) => CursorKind::Text,
        }
    }

    /// Serialized form stored in the state store.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Integer(v) => v.to_string(),
            Self::Real(v) => v.to_string(),
            Self::Date(d) => d.format(DATE_FMT).to_string(),
            Self::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Self::Text(s) => s.clone(),
        }
    }

    fn as_real(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Real(v) => Some(*v),
            _ => None,
        }
    }

    fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(d) => Some(d.and_time(chrono::NaiveTime::MIN).and_utc()),
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Move the cursor back by `lookback`.
    ///
    /// Dates stay dates when the span is a whole number of days.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::LookbackKindMismatch`] for spans on
    /// non-temporal cursors and unit counts on non-numeric cursors.
    pub fn rewind(&self, lookback: &Lookback) -> Result<Self, CursorError> {
        lookback.check_kind(self.kind())?;
        Ok(match (self, lookback) {
            (value, Lookback::None) => value.clone(),
            (Self::Integer(v), Lookback::Units { count, .. }) => {
                Self::Integer(v.saturating_sub(*count))
            }
            (Self::Real(v), Lookback::Units { count, .. }) => Self::Real(v - *count as f64),
            (Self::Date(d), Lookback::Span { span, .. }) if span.num_seconds() % 86_400 == 0 => {
                Self::Date(d.checked_sub_signed(*span).unwrap_or(NaiveDate::MIN))
            }
            (value, Lookback::Span { span, .. }) => {
                let ts = value.as_timestamp().unwrap_or(DateTime::<Utc>::MIN_UTC);
                Self::Timestamp(ts.checked_sub_signed(*span).unwrap_or(DateTime::<Utc>::MIN_UTC))
            }
            (value, Lookback::Units { .. }) => value.clone(),
        })
    }
}

impl PartialOrd for CursorValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            (Self::Integer(_) | Self::Real(_), Self::Integer(_) | Self::Real(_)) => {
                self.as_real()?.partial_cmp(&other.as_real()?)
            }
            _ => match (self.as_timestamp(), other.as_timestamp()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => None,
            },
        }
    }
}

impl std::fmt::Display for CursorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Late-arrival tolerance subtracted from the watermark.
///
/// Keeps the text it was parsed from for messages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Lookback {
    #[default]
    None,
    /// Time span for temporal cursors.
    Span { span: Duration, raw: String },
    /// Unit count for numeric cursors.
    Units { count: i64, raw: String },
}

impl Lookback {
    /// Parse `"2 days"`, `"36h"`, `"15m"`, `"90s"`, `"1 week"` or a bare count.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::InvalidLookback`] for anything else.
    pub fn parse(raw: &str) -> Result<Self, CursorError> {
        let invalid = || CursorError::InvalidLookback(raw.to_string());
        let caps = LOOKBACK_RE.captures(raw).ok_or_else(invalid)?;
        let count: i64 = caps[1].parse().map_err(|_| invalid())?;
        let unit = caps[2].to_ascii_lowercase();
        let raw = raw.trim().to_string();
        let span = match unit.as_str() {
            "" => return Ok(Self::Units { count, raw }),
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::try_seconds(count),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::try_minutes(count),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::try_hours(count),
            "d" | "day" | "days" => Duration::try_days(count),
            "w" | "week" | "weeks" => Duration::try_weeks(count),
            _ => return Err(invalid()),
        };
        let span = span.ok_or_else(invalid)?;
        Ok(Self::Span { span, raw })
    }

    /// The span of a time lookback.
    #[must_use]
    pub fn span(&self) -> Option<Duration> {
        match self {
            Self::Span { span, .. } => Some(*span),
            _ => None,
        }
    }

    /// Parse an optional lookback string; absent means no lookback.
    ///
    /// # Errors
    ///
    /// See [`Lookback::parse`].
    pub fn parse_opt(raw: Option<&str>) -> Result<Self, CursorError> {
        raw.map_or(Ok(Self::None), Self::parse)
    }

    /// Reject spans on non-temporal cursors and counts on non-numeric ones.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::LookbackKindMismatch`].
    pub fn check_kind(&self, kind: CursorKind) -> Result<(), CursorError> {
        let ok = match self {
            Self::None => true,
            Self::Span { .. } => kind.is_temporal(),
            Self::Units { .. } => kind.is_numeric(),
        };
        if ok {
            Ok(())
        } else {
            Err(CursorError::LookbackKindMismatch {
                lookback: self.to_string(),
                kind,
            })
        }
    }
}

impl std::fmt::Display for Lookback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Span { raw, .. } | Self::Units { raw, .. } => f.write_str(raw),
        }
    }
}
