//! Converts raw custom-field payloads into typed column values.

use std::str::FromStr;

use bigdecimal::{BigDecimal, Signed};
use casesync_core::{
    truncate_to_micros, DeclaredType, FieldCatalogEntry, RawValue, ReferenceValue, SqlValue,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

use crate::config::FieldRules;

const CURRENCY_SCALE: i64 = 2;
/// Exclusive bound on |amount| for a `NUMERIC(18,2)` column.
const MAX_CURRENCY_MAGNITUDE: i64 = 10_000_000_000_000_000;
/// Longer exponents would make rescaling allocate enormous digit strings.
const MAX_EXPONENT: i64 = 32;
const MAX_AMOUNT_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoercionError {
    #[error("not a number: {0:?}")]
    InvalidNumber(String),
    #[error("amount {0} does not fit NUMERIC(18,2)")]
    OutOfRange(String),
    #[error("negative amount {0} for a non-negative field")]
    Negative(BigDecimal),
    #[error("not a date: {0:?}")]
    InvalidDate(String),
    #[error("not a boolean: {0:?}")]
    InvalidBoolean(String),
    #[error("{found} payload cannot be stored as {declared_type}")]
    Unsupported {
        declared_type: DeclaredType,
        found: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Null,
    Text(String),
    Decimal(BigDecimal),
    Timestamp(DateTime<Utc>),
    Boolean(bool),
    Reference {
        id: Option<String>,
        name: Option<String>,
    },
}

impl TypedValue {
    /// Values for every physical column backing `entry`.
    pub fn into_columns(self, entry: &FieldCatalogEntry) -> Vec<(String, SqlValue)> {
        let columns = entry.physical_columns();
        match (entry.declared_type, self) {
            (DeclaredType::Reference, TypedValue::Reference { id, name }) => columns
                .into_iter()
                .zip([SqlValue::text(id.as_deref()), SqlValue::text(name.as_deref())])
                .collect(),
            (_, value) => {
                let value = value.into_sql();
                columns.into_iter().map(|c| (c, value.clone())).collect()
            }
        }
    }

    fn into_sql(self) -> SqlValue {
        match self {
            TypedValue::Null | TypedValue::Reference { .. } => SqlValue::Null,
            TypedValue::Text(s) => SqlValue::Text(s),
            TypedValue::Decimal(d) => SqlValue::Decimal(d),
            TypedValue::Timestamp(ts) => SqlValue::Timestamp(ts),
            TypedValue::Boolean(b) => SqlValue::Boolean(b),
        }
    }
}

fn payload_name(value: &RawValue) -> &'static str {
    match value {
        RawValue::Text(_) => "text",
        RawValue::Number(_) => "number",
        RawValue::Boolean(_) => "boolean",
        RawValue::Timestamp(_) => "timestamp",
        RawValue::Reference(_) => "reference",
    }
}

/// Coerces one payload. Absent and empty payloads become [`TypedValue::Null`].
pub fn coerce(value: Option<&RawValue>, declared_type: DeclaredType) -> Result<TypedValue, CoercionError> {
    let value = match value {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(TypedValue::Null),
    };
    let unsupported = || CoercionError::Unsupported {
        declared_type,
        found: payload_name(value),
    };

    match declared_type {
        DeclaredType::Text => Ok(TypedValue::Text(match value {
            RawValue::Text(s) | RawValue::Timestamp(s) => s.trim().to_string(),
            RawValue::Number(n) => n.to_string(),
            RawValue::Boolean(b) => b.to_string(),
            RawValue::Reference(ReferenceValue { id, name }) => name.clone().unwrap_or_else(|| id.clone()),
        })),
        DeclaredType::Currency => match value {
            RawValue::Number(n) => parse_amount(&n.to_string()).map(TypedValue::Decimal),
            RawValue::Text(s) => parse_amount(s).map(TypedValue::Decimal),
            _ => Err(unsupported()),
        },
        DeclaredType::Date => match value {
            RawValue::Timestamp(s) | RawValue::Text(s) => parse_date(s).map(TypedValue::Timestamp),
            _ => Err(unsupported()),
        },
        DeclaredType::Boolean => match value {
            RawValue::Boolean(b) => Ok(TypedValue::Boolean(*b)),
            RawValue::Text(s) => parse_bool(s).map(TypedValue::Boolean),
            RawValue::Number(n) => parse_bool(&n.to_string()).map(TypedValue::Boolean),
            _ => Err(unsupported()),
        },
        DeclaredType::Reference => match value {
            RawValue::Reference(ReferenceValue { id, name }) => Ok(TypedValue::Reference {
                id: Some(id.clone()),
                name: name.clone(),
            }),
            RawValue::Text(s) => Ok(TypedValue::Reference {
                id: None,
                name: Some(s.trim().to_string()),
            }),
            RawValue::Number(n) => Ok(TypedValue::Reference {
                id: Some(n.to_string()),
                name: None,
            }),
            _ => Err(unsupported()),
        },
    }
}

/// Parses `212000`, `"$212,000.00"`, `"(1,500)"` and the like into a scale-2 decimal.
pub fn parse_amount(raw: &str) -> Result<BigDecimal, CoercionError> {
    let invalid = || CoercionError::InvalidNumber(raw.to_string());
    let trimmed = raw.trim();
    let (negative, body) = match trimmed
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
    {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };
    let cleaned = body
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' ' | '_'))
        .collect::<String>();
    if cleaned.is_empty()
        || !cleaned
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
    {
        return Err(invalid());
    }
    if cleaned.len() > MAX_AMOUNT_LEN {
        return Err(CoercionError::OutOfRange(raw.trim().to_string()));
    }
    if let Some((_, exponent)) = cleaned.split_once(|c: char| matches!(c, 'e' | 'E')) {
        let exponent: i64 = exponent.parse().map_err(|_| invalid())?;
        if exponent.abs() > MAX_EXPONENT {
            return Err(CoercionError::OutOfRange(raw.trim().to_string()));
        }
    }

    let amount = BigDecimal::from_str(&cleaned).map_err(|_| invalid())?;
    let amount = if negative { -amount } else { amount };
    let amount = amount.round(CURRENCY_SCALE).with_scale(CURRENCY_SCALE);
    if amount.abs() >= BigDecimal::from(MAX_CURRENCY_MAGNITUDE) {
        return Err(CoercionError::OutOfRange(amount.to_string()));
    }
    Ok(amount)
}

/// RFC 3339 is converted to UTC; naive date-times are read as UTC; bare dates become midnight UTC.
pub fn parse_date(raw: &str) -> Result<DateTime<Utc>, CoercionError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(truncate_to_micros(ts.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(truncate_to_micros(naive.and_utc()));
        }
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Some(midnight) = NaiveDate::parse_from_str(raw, format)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return Ok(midnight.and_utc());
        }
    }
    Err(CoercionError::InvalidDate(raw.to_string()))
}

pub fn parse_bool(raw: &str) -> Result<bool, CoercionError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "on" => Ok(true),
        "false" | "no" | "n" | "0" | "off" => Ok(false),
        _ => Err(CoercionError::InvalidBoolean(raw.to_string())),
    }
}

/// [`coerce`] plus the per-label constraints from the field rules file.
#[derive(Debug, Clone, Default)]
pub struct CoercionEngine {
    rules: FieldRules,
}

impl CoercionEngine {
    pub fn new(rules: FieldRules) -> Self {
        Self { rules }
    }

    pub fn coerce(
        &self,
        label: &str,
        value: Option<&RawValue>,
        declared_type: DeclaredType,
    ) -> Result<TypedValue, CoercionError> {
        let typed = coerce(value, declared_type)?;
        if let TypedValue::Decimal(amount) = &typed {
            if amount.is_negative() && self.rules.is_nonnegative(label) {
                return Err(CoercionError::Negative(amount.clone()));
            }
        }
        Ok(typed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amount(raw: &str) -> BigDecimal {
        BigDecimal::from_str(raw).unwrap()
    }

    fn number(raw: &str) -> RawValue {
        RawValue::Number(serde_json::Number::from_str(raw).unwrap())
    }

    #[test]
    fn currency_accepts_numbers_and_formatted_text() {
        let typed = coerce(Some(&number("212000")), DeclaredType::Currency).unwrap();
        assert_eq!(typed, TypedValue::Decimal(amount("212000.00")));
        match typed {
            TypedValue::Decimal(d) => assert_eq!(d.to_string(), "212000.00"),
            other => panic!("unexpected {other:?}"),
        }

        let text = RawValue::Text("$212,000.00".into());
        assert_eq!(
            coerce(Some(&text), DeclaredType::Currency).unwrap(),
            TypedValue::Decimal(amount("212000"))
        );
        assert_eq!(parse_amount("(1,500.255)").unwrap(), amount("-1500.26"));
        assert!(matches!(parse_amount("N/A"), Err(CoercionError::InvalidNumber(_))));
        assert!(matches!(parse_amount("NaN"), Err(CoercionError::InvalidNumber(_))));
        assert!(matches!(parse_amount("$"), Err(CoercionError::InvalidNumber(_))));
    }

    #[test]
    fn amounts_beyond_the_column_precision_are_rejected() {
        assert!(matches!(
            coerce(Some(&number("1e20")), DeclaredType::Currency),
            Err(CoercionError::OutOfRange(_))
        ));
        assert!(matches!(parse_amount("-10000000000000000"), Err(CoercionError::OutOfRange(_))));
        assert_eq!(
            parse_amount("9999999999999999.99").unwrap(),
            amount("9999999999999999.99")
        );
        assert_eq!(parse_amount("2.12e5").unwrap(), amount("212000.00"));
    }

    #[test]
    fn huge_exponents_are_rejected_without_expanding_them() {
        let started = std::time::Instant::now();
        assert!(matches!(parse_amount("1e2000000"), Err(CoercionError::OutOfRange(_))));
        assert!(matches!(parse_amount("1e-99999999999"), Err(CoercionError::OutOfRange(_))));
        assert!(matches!(parse_amount("1e+"), Err(CoercionError::InvalidNumber(_))));
        assert!(matches!(parse_amount(&"9".repeat(100_000)), Err(CoercionError::OutOfRange(_))));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn negative_amounts_fail_only_under_nonnegative_rule() {
        let engine = CoercionEngine::new(FieldRules::default().with_nonnegative("Rel Value"));
        let negative = number("-10");
        assert!(matches!(
            engine.coerce("Rel Value", Some(&negative), DeclaredType::Currency),
            Err(CoercionError::Negative(_))
        ));
        assert!(engine
            .coerce("Boot Amount", Some(&negative), DeclaredType::Currency)
            .is_ok());
    }

    #[test]
    fn dates_normalize_to_utc() {
        let midnight = parse_date("2024-04-15").unwrap();
        assert_eq!(midnight.to_rfc3339(), "2024-04-15T00:00:00+00:00");
        let offset = parse_date("2024-04-15T09:30:00-05:00").unwrap();
        assert_eq!(offset.to_rfc3339(), "2024-04-15T14:30:00+00:00");
        let naive = parse_date("2024-04-15 09:30:00").unwrap();
        assert_eq!(naive.to_rfc3339(), "2024-04-15T09:30:00+00:00");
        let us = parse_date("04/15/2024").unwrap();
        assert_eq!(us, midnight);
        let precise = parse_date("2024-04-15T09:30:00.123456789Z").unwrap();
        assert_eq!(precise, truncate_to_micros(precise));
        assert!(matches!(parse_date("next tuesday"), Err(CoercionError::InvalidDate(_))));
    }

    #[test]
    fn booleans_are_tri_state() {
        assert_eq!(coerce(None, DeclaredType::Boolean).unwrap(), TypedValue::Null);
        assert_eq!(
            coerce(Some(&RawValue::Text("Yes".into())), DeclaredType::Boolean).unwrap(),
            TypedValue::Boolean(true)
        );
        assert_eq!(
            coerce(Some(&number("0")), DeclaredType::Boolean).unwrap(),
            TypedValue::Boolean(false)
        );
        assert!(coerce(Some(&RawValue::Text("maybe".into())), DeclaredType::Boolean).is_err());
    }

    #[test]
    fn empty_text_is_null() {
        assert_eq!(
            coerce(Some(&RawValue::Text("   ".into())), DeclaredType::Text).unwrap(),
            TypedValue::Null
        );
        assert_eq!(
            coerce(Some(&RawValue::Boolean(true)), DeclaredType::Text).unwrap(),
            TypedValue::Text("true".into())
        );
    }

    #[test]
    fn references_fill_both_companion_columns() {
        let now = Utc::now();
        let entry = FieldCatalogEntry {
            label: "QI".into(),
            declared_type: DeclaredType::Reference,
            local_column: "qi".into(),
            usage_count: 1,
            first_seen_at: now,
            last_seen_at: now,
        };
        let typed = coerce(Some(&RawValue::Text("Acme QI".into())), DeclaredType::Reference).unwrap();
        assert_eq!(
            typed.into_columns(&entry),
            vec![
                ("qi_ref_id".to_string(), SqlValue::Null),
                ("qi_ref_name".to_string(), SqlValue::Text("Acme QI".into())),
            ]
        );
        assert_eq!(
            TypedValue::Null.into_columns(&entry),
            vec![
                ("qi_ref_id".to_string(), SqlValue::Null),
                ("qi_ref_name".to_string(), SqlValue::Null),
            ]
        );
    }

    #[test]
    fn mismatched_payloads_are_rejected() {
        let reference = RawValue::Reference(ReferenceValue {
            id: "9".into(),
            name: None,
        });
        assert!(matches!(
            coerce(Some(&reference), DeclaredType::Currency),
            Err(CoercionError::Unsupported { .. })
        ));
    }
}
