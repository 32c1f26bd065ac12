// 📐 Shape Layer - Row normalization
// Raw string rows → typed rows, or the list of reasons the row was skipped.
//
// Rules:
//   text     trimmed, blank = absent
//   money    lenient parse, absent/unparsable = default (zero), 2 dp
//   quantity lenient parse, absent/unparsable = default (zero), 3 dp
//   date     day-first formats + ISO, unparsable = null
// Only a Required field can make a row fail.

use crate::error::RowError;
use crate::reader::{FeedKind, RawRow};
use chrono::NaiveDate;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

pub const MONEY_SCALE: u32 = 2;
pub const QUANTITY_SCALE: u32 = 3;

// ============================================================================
// FIELD SPECS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Money,
    Quantity,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Column must exist and the value must be non-blank
    Required,
    /// Column must exist, value may be blank
    Column,
    /// Column may be missing entirely
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Normalized column name
    pub column: &'static str,
    pub kind: FieldKind,
    pub requirement: Requirement,
    /// Used when the cell is blank or does not parse
    pub default: Option<&'static str>,
}

impl FieldSpec {
    const fn of(column: &'static str, kind: FieldKind) -> Self {
        FieldSpec {
            column,
            kind,
            requirement: Requirement::Column,
            default: None,
        }
    }

    pub const fn text(column: &'static str) -> Self {
        Self::of(column, FieldKind::Text)
    }

    pub const fn money(column: &'static str) -> Self {
        Self::of(column, FieldKind::Money)
    }

    pub const fn quantity(column: &'static str) -> Self {
        Self::of(column, FieldKind::Quantity)
    }

    pub const fn date(column: &'static str) -> Self {
        Self::of(column, FieldKind::Date)
    }

    pub const fn required(mut self) -> Self {
        self.requirement = Requirement::Required;
        self
    }

    pub const fn optional(mut self) -> Self {
        self.requirement = Requirement::Optional;
        self
    }

    pub const fn or(mut self, default: &'static str) -> Self {
        self.default = Some(default);
        self
    }
}

// ============================================================================
// NORMALIZED VALUES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(Option<String>),
    Decimal(Decimal),
    Date(Option<NaiveDate>),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Text(Some(s)) => f.write_str(s),
            FieldValue::Decimal(d) => write!(f, "{}", d),
            FieldValue::Date(Some(d)) => write!(f, "{}", d.format("%Y-%m-%d")),
            FieldValue::Text(None) | FieldValue::Date(None) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub line_number: usize,
    pub key: String,
    values: BTreeMap<&'static str, FieldValue>,
}

impl NormalizedRow {
    pub fn text(&self, column: &str) -> Option<&str> {
        match self.values.get(column) {
            Some(FieldValue::Text(Some(s))) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn text_or(&self, column: &str, default: &str) -> String {
        self.text(column).unwrap_or(default).to_string()
    }

    /// Y / YES / TRUE / 1 (any case) read as set; anything else as unset.
    pub fn flag(&self, column: &str) -> bool {
        self.text(column).is_some_and(|v| {
            matches!(v.to_ascii_uppercase().as_str(), "Y" | "YES" | "TRUE" | "1")
        })
    }

    /// Zero when the column is not part of the schema
    pub fn decimal(&self, column: &str) -> Decimal {
        match self.values.get(column) {
            Some(FieldValue::Decimal(d)) => *d,
            _ => Decimal::ZERO,
        }
    }

    pub fn date(&self, column: &str) -> Option<NaiveDate> {
        match self.values.get(column) {
            Some(FieldValue::Date(d)) => *d,
            _ => None,
        }
    }

    /// True when every listed column is blank/zero/null
    pub fn all_blank(&self, columns: &[&str]) -> bool {
        columns.iter().all(|c| match self.values.get(c) {
            Some(FieldValue::Text(v)) => v.is_none(),
            Some(FieldValue::Date(v)) => v.is_none(),
            Some(FieldValue::Decimal(d)) => d.is_zero(),
            None => true,
        })
    }
}

/// SHA-256 over the normalized batch, in row order.
pub fn batch_digest(rows: &[NormalizedRow]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        for (column, value) in &row.values {
            hasher.update(format!("{}={};", column, value));
        }
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// LENIENT PARSERS
// ============================================================================

/// Thousands separators and spaces are ignored, `(x)` is negative, and
/// scientific notation is accepted. `None` means "not a number".
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let (negative, digits) = match cleaned.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, cleaned.as_str()),
    };

    let value = Decimal::from_str(digits)
        .ok()
        .or_else(|| Decimal::from_scientific(digits).ok())
        .or_else(|| {
            digits
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .and_then(Decimal::from_f64)
        })?;

    Some(if negative { -value } else { value })
}

/// Round half away from zero and pin the scale, so "10" and "10.0"
/// both store as "10.00".
pub fn quantize(value: Decimal, scale: u32) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(scale);
    rounded
}

const ISO_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

// Two-digit-year variants first: "%y" consumes exactly two digits, so a
// four-digit year fails it with trailing input and falls through to "%Y".
const DAY_FIRST_FORMATS: &[&str] = &[
    "%d.%m.%y",
    "%d.%m.%Y",
    "%d/%m/%y",
    "%d/%m/%Y",
    "%d-%m-%y",
    "%d-%m-%Y",
    "%d %b %Y",
    "%d-%b-%Y",
    "%d-%b-%y",
];

/// Day-first date parsing; ISO dates and timestamps (four-digit year first)
/// keep their date part.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    let year_first = s.len() >= 8
        && s.as_bytes()[..4].iter().all(u8::is_ascii_digit)
        && matches!(s.as_bytes()[4], b'-' | b'/');

    if year_first {
        let date_part = s.get(..10).unwrap_or(s);
        return ISO_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok());
    }

    DAY_FIRST_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

// ============================================================================
// FEED SCHEMA
// ============================================================================

#[derive(Debug, Clone)]
pub struct FeedSchema {
    pub feed: FeedKind,
    /// Natural key column
    pub key: &'static str,
    pub fields: Vec<FieldSpec>,
}

impl FeedSchema {
    /// The key column is always Required.
    pub fn new(feed: FeedKind, key: &'static str, fields: Vec<FieldSpec>) -> Self {
        let fields = fields
            .into_iter()
            .map(|f| if f.column == key { f.required() } else { f })
            .collect();
        FeedSchema { feed, key, fields }
    }

    /// Required and Column fields absent from `present`, in schema order.
    pub fn missing_columns(&self, present: &BTreeSet<&str>) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.requirement != Requirement::Optional)
            .filter(|f| !present.contains(f.column))
            .map(|f| f.column.to_string())
            .collect()
    }

    pub fn normalize(&self, raw: &RawRow) -> Result<NormalizedRow, Vec<RowError>> {
        let line = raw.line_number;
        let key = raw
            .get(self.key)
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        let mut errors = Vec::new();
        let mut values = BTreeMap::new();

        for spec in &self.fields {
            let cell = raw.get(spec.column).map(str::trim).filter(|v| !v.is_empty());
            let required = spec.requirement == Requirement::Required;

            if cell.is_none() && required {
                errors.push(RowError::missing_field(line, spec.column));
            }

            let value = match spec.kind {
                FieldKind::Text => FieldValue::Text(
                    cell.or(spec.default).map(str::to_string),
                ),
                FieldKind::Money | FieldKind::Quantity => {
                    let scale = if spec.kind == FieldKind::Money {
                        MONEY_SCALE
                    } else {
                        QUANTITY_SCALE
                    };
                    let parsed = cell
                        .and_then(parse_decimal)
                        .or_else(|| spec.default.and_then(parse_decimal))
                        .unwrap_or(Decimal::ZERO);
                    FieldValue::Decimal(quantize(parsed, scale))
                }
                FieldKind::Date => {
                    let parsed = cell.and_then(parse_date);
                    if let (Some(text), None, true) = (cell, parsed, required) {
                        errors.push(RowError::parse(
                            line,
                            Some(spec.column),
                            format!("{} '{}' is not a date", spec.column, text),
                        ));
                    }
                    FieldValue::Date(parsed)
                }
            };

            values.insert(spec.column, value);
        }

        match key {
            Some(key) if errors.is_empty() => Ok(NormalizedRow {
                line_number: line,
                key,
                values,
            }),
            key => Err(errors
                .into_iter()
                .map(|e| e.with_key(key.clone()))
                .collect()),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
