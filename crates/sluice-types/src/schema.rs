//! Column and table shape model.
//!
//! [`ColumnType`] is the normalized form of a declared SQL type. Engine
//! spellings and aliases (`INT4`, `CHARACTER VARYING(20)`, `DATETIME`, ...)
//! collapse to one variant so schema comparison is structural.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static SIZED_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z][A-Z0-9 ]*?)\s*(?:\(\s*(\d+)\s*(?:,\s*\d+\s*)?\))?$")
        .expect("sized type regex is valid")
});

/// Normalized SQL column type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ColumnType {
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Char(u32),
    Varchar(u32),
    Text,
    Boolean,
    Date,
    Timestamp,
    Blob,
    /// Expression column with no declared type.
    #[default]
    Untyped,
    /// Anything else, kept verbatim (upper-cased).
    Other(String),
}

impl ColumnType {
    /// Parse and normalize a declared type string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let upper = raw
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();
        if upper.is_empty() {
            return Self::Untyped;
        }
        let Some(caps) = SIZED_TYPE.captures(&upper) else {
            return Self::Other(upper);
        };
        let base = caps.get(1).map_or("", |m| m.as_str().trim());
        let size = caps.get(2).and_then(|m| m.as_str().parse::<u32>().ok());

        match (base, size) {
            ("SMALLINT" | "INT2", _) => Self::SmallInt,
            ("INTEGER" | "INT" | "INT4" | "MEDIUMINT", _) => Self::Integer,
            ("BIGINT" | "INT8", _) => Self::BigInt,
            ("REAL" | "FLOAT4", _) => Self::Real,
            ("DOUBLE" | "DOUBLE PRECISION" | "FLOAT8" | "FLOAT", _) => Self::Double,
            ("CHAR" | "CHARACTER" | "NCHAR", n) => Self::Char(n.unwrap_or(1)),
            ("VARCHAR" | "CHARACTER VARYING" | "NVARCHAR", Some(n)) => Self::Varchar(n),
            ("VARCHAR" | "CHARACTER VARYING" | "NVARCHAR" | "TEXT" | "STRING" | "CLOB", None) => {
                Self::Text
            }
            ("BOOLEAN" | "BOOL", _) => Self::Boolean,
            ("DATE", _) => Self::Date,
            ("TIMESTAMP" | "DATETIME" | "TIMESTAMP WITHOUT TIME ZONE", _) => Self::Timestamp,
            ("BLOB" | "BYTEA", _) => Self::Blob,
            _ => Self::Other(upper),
        }
    }

    /// SQL spelling used in generated DDL. Empty for [`ColumnType::Untyped`].
    #[must_use]
    pub fn sql(&self) -> String {
        match self {
            Self::SmallInt => "SMALLINT".into(),
            Self::Integer => "INTEGER".into(),
            Self::BigInt => "BIGINT".into(),
            Self::Real => "REAL".into(),
            Self::Double => "DOUBLE".into(),
            Self::Char(n) => format!("CHAR({n})"),
            Self::Varchar(n) => format!("VARCHAR({n})"),
            Self::Text => "TEXT".into(),
            Self::Boolean => "BOOLEAN".into(),
            Self::Date => "DATE".into(),
            Self::Timestamp => "TIMESTAMP".into(),
            Self::Blob => "BLOB".into(),
            Self::Untyped => String::new(),
            Self::Other(raw) => raw.clone(),
        }
    }

    #[must_use]
    pub fn is_untyped(&self) -> bool {
        matches!(self, Self::Untyped)
    }

    #[must_use]
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::SmallInt | Self::Integer | Self::BigInt)
    }

    #[must_use]
    pub fn is_temporal(&self) -> bool {
        matches!(self, Self::Date | Self::Timestamp)
    }

    /// Whether values of `self` fit losslessly into `target`.
    ///
    /// Identical types are not a widening.
    #[must_use]
    pub fn widens_to(&self, target: &ColumnType) -> bool {
        use ColumnType::{BigInt, Char, Date, Double, Integer, Real, SmallInt, Text, Timestamp, Varchar};
        match (self, target) {
            (SmallInt, Integer | BigInt | Double)
            | (Integer, BigInt | Double)
            | (Real, Double)
            | (Char(_) | Varchar(_), Text)
            | (Date, Timestamp) => true,
            (Char(n), Char(m)) => m > n,
            (Char(n), Varchar(m)) => m >= n,
            (Varchar(n), Varchar(m)) => m > n,
            _ => false,
        }
    }
}

impl From<String> for ColumnType {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<&str> for ColumnType {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.sql()
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Untyped => f.write_str("untyped"),
            other => f.write_str(&other.sql()),
        }
    }
}

fn default_nullable() -> bool {
    true
}

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type", default)]
    pub data_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Default expression as written in DDL (e.g. `'n/a'`, `0`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ColumnDef {
    /// Nullable column without a default.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: impl Into<ColumnType>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
        }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn with_default(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// Case-insensitive name comparison, matching SQL identifier rules.
    #[must_use]
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Find a column by name, ignoring ASCII case.
#[must_use]
pub fn find_column<'a>(columns: &'a [ColumnDef], name: &str) -> Option<&'a ColumnDef> {
    columns.iter().find(|c| c.is_named(name))
}

/// Observed shape of a table in the store.
///
/// Read fresh for each step; never cached across steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub exists: bool,
}

impl TableInfo {
    /// Info for a table that does not exist yet.
    #[must_use]
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            exists: false,
        }
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        find_column(&self.columns, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_normalize() {
        assert_eq!(ColumnType::parse("int4"), ColumnType::Integer);
        assert_eq!(ColumnType::parse("INT8"), ColumnType::BigInt);
        assert_eq!(ColumnType::parse("float8"), ColumnType::Double);
        assert_eq!(ColumnType::parse("double precision"), ColumnType::Double);
        assert_eq!(ColumnType::parse("DATETIME"), ColumnType::Timestamp);
        assert_eq!(
            ColumnType::parse("character  varying(20)"),
            ColumnType::Varchar(20)
        );
        assert_eq!(ColumnType::parse("varchar"), ColumnType::Text);
        assert_eq!(ColumnType::parse("CHAR"), ColumnType::Char(1));
        assert_eq!(ColumnType::parse(""), ColumnType::Untyped);
        assert_eq!(
            ColumnType::parse("numeric(10, 2)"),
            ColumnType::Other("NUMERIC(10, 2)".into())
        );
    }

    #[test]
    fn widening_rules() {
        use ColumnType::*;
        assert!(SmallInt.widens_to(&Integer));
        assert!(Integer.widens_to(&BigInt));
        assert!(SmallInt.widens_to(&BigInt));
        assert!(Integer.widens_to(&Double));
        assert!(Real.widens_to(&Double));
        assert!(Char(4).widens_to(&Char(8)));
        assert!(Char(4).widens_to(&Varchar(4)));
        assert!(Varchar(10).widens_to(&Varchar(20)));
        assert!(Varchar(10).widens_to(&Text));
        assert!(Date.widens_to(&Timestamp));

        assert!(!BigInt.widens_to(&Integer));
        assert!(!Varchar(20).widens_to(&Varchar(10)));
        assert!(!Varchar(10).widens_to(&Varchar(10)));
        assert!(!Text.widens_to(&Integer));
        assert!(!BigInt.widens_to(&Double));
        assert!(!Timestamp.widens_to(&Date));
    }

    #[test]
    fn column_type_serializes_as_sql() {
        let col = ColumnDef::new("amount", "float8").not_null();
        let json = serde_json::to_value(&col).unwrap();
        assert_eq!(json["type"], "DOUBLE");
        assert_eq!(json["nullable"], false);

        let back: ColumnDef =
            serde_json::from_value(serde_json::json!({"name": "x"})).unwrap();
        assert!(back.nullable);
        assert!(back.data_type.is_untyped());
    }

    #[test]
    fn table_lookup_ignores_case() {
        let info = TableInfo {
            name: "orders".into(),
            columns: vec![ColumnDef::new("Id", "INTEGER")],
            exists: true,
        };
        assert!(info.column("id").is_some());
        assert!(info.column("name").is_none());
        assert!(!TableInfo::absent("t").exists);
    }
}
