//! Value decoding.
//!
//! Result cells are decoded into JSON values at fetch time, while the
//! connection is still live. Type conversion uses a two-phase approach:
//!
//! 1. [`TypeCategory`] classifies column types into logical categories
//! 2. category-specific decoders handle the actual value extraction
//!
//! Composite (row-typed) columns are not decoded here; the raw value is
//! handed to the model caster, which uses the field-level helpers at the
//! bottom of this module to take the composite apart in either the text or
//! the binary wire format.

use serde_json::Value as JsonValue;
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::{Decode, Row, Type, TypeInfo, ValueRef as _};
use std::fmt::Write as _;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for Postgres column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Temporal,
    Unknown,
}

/// Classify a Postgres type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric first, as "numeric" overlaps with float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        return TypeCategory::Decimal;
    }

    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.starts_with("timestamp") || lower == "date" || lower.starts_with("time") {
        return TypeCategory::Temporal;
    }

    if lower == "text" || lower == "varchar" || lower == "bpchar" || lower == "char" || lower == "name" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw NUMERIC values as strings. This preserves the exact
/// database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => numeric_to_string(value.as_bytes()?)
                .map(RawDecimal)
                .ok_or_else(|| "malformed numeric value".into()),
        }
    }
}

// =============================================================================
// Binary Encoding
// =============================================================================

/// Decode binary data to a JSON value.
///
/// If `decode_binary` is true, attempts to decode as UTF-8 text first.
/// Falls back to base64 encoding if not valid UTF-8 or if `decode_binary`
/// is false.
pub fn decode_binary_value(bytes: &[u8], decode_binary: bool) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    if decode_binary {
        match std::str::from_utf8(bytes) {
            Ok(s) => JsonValue::String(s.to_string()),
            Err(_) => JsonValue::String(STANDARD.encode(bytes)),
        }
    } else {
        JsonValue::String(STANDARD.encode(bytes))
    }
}

// =============================================================================
// Scalar Column Decoding
// =============================================================================

/// Decode one scalar column from a fetched row.
pub(crate) fn decode_scalar(row: &PgRow, idx: usize, type_name: &str) -> JsonValue {
    match categorize_type(type_name) {
        TypeCategory::Decimal => decode_decimal(row, idx),
        TypeCategory::Integer => decode_integer(row, idx),
        TypeCategory::Boolean => decode_boolean(row, idx),
        TypeCategory::Float => decode_float(row, idx),
        TypeCategory::Binary => decode_binary_col(row, idx),
        TypeCategory::Json => decode_json(row, idx),
        TypeCategory::Uuid => decode_uuid(row, idx),
        TypeCategory::Temporal => decode_temporal(row, idx),
        TypeCategory::Text | TypeCategory::Unknown => decode_text(row, idx),
    }
}

fn decode_decimal(row: &PgRow, idx: usize) -> JsonValue {
    match row.try_get::<Option<RawDecimal>, _>(idx) {
        Ok(Some(v)) => JsonValue::String(v.0),
        Ok(None) => JsonValue::Null,
        Err(e) => {
            tracing::error!("Failed to decode NUMERIC: {:?}", e);
            JsonValue::Null
        }
    }
}

fn decode_integer(row: &PgRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    JsonValue::Null
}

fn decode_boolean(row: &PgRow, idx: usize) -> JsonValue {
    row.try_get::<Option<bool>, _>(idx)
        .ok()
        .flatten()
        .map(JsonValue::Bool)
        .unwrap_or(JsonValue::Null)
}

fn decode_float(row: &PgRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
        return serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(v.to_string()));
    }
    if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
        return serde_json::Number::from_f64(v as f64)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(v.to_string()));
    }
    JsonValue::Null
}

fn decode_binary_col(row: &PgRow, idx: usize) -> JsonValue {
    row.try_get::<Option<Vec<u8>>, _>(idx)
        .ok()
        .flatten()
        .map(|v| decode_binary_value(&v, false))
        .unwrap_or(JsonValue::Null)
}

fn decode_json(row: &PgRow, idx: usize) -> JsonValue {
    row.try_get::<Option<serde_json::Value>, _>(idx)
        .ok()
        .flatten()
        .unwrap_or(JsonValue::Null)
}

fn decode_uuid(row: &PgRow, idx: usize) -> JsonValue {
    let Ok(raw) = row.try_get_raw(idx) else {
        return JsonValue::Null;
    };
    if raw.is_null() {
        return JsonValue::Null;
    }
    match raw.format() {
        PgValueFormat::Text => raw
            .as_str()
            .map(|s| JsonValue::String(s.to_string()))
            .unwrap_or(JsonValue::Null),
        PgValueFormat::Binary => raw
            .as_bytes()
            .ok()
            .and_then(format_uuid)
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
    }
}

fn decode_temporal(row: &PgRow, idx: usize) -> JsonValue {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    if let Ok(Some(v)) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
        return JsonValue::String(v.to_rfc3339());
    }
    if let Ok(Some(v)) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
        return JsonValue::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<Option<NaiveDate>, _>(idx) {
        return JsonValue::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<Option<NaiveTime>, _>(idx) {
        return JsonValue::String(v.to_string());
    }
    JsonValue::Null
}

fn decode_text(row: &PgRow, idx: usize) -> JsonValue {
    row.try_get::<Option<String>, _>(idx)
        .ok()
        .flatten()
        .map(JsonValue::String)
        .unwrap_or(JsonValue::Null)
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Column metadata from a prepared statement's result description.
pub(crate) fn columns_of(pg_columns: &[sqlx::postgres::PgColumn]) -> Vec<crate::rows::Column> {
    use sqlx::Column as _;

    pg_columns
        .iter()
        .map(|col| crate::rows::Column {
            name: col.name().to_string(),
            type_name: col.type_info().name().to_string(),
        })
        .collect()
}

/// Decode fetched rows into cells. Columns whose type has a registered model
/// go through the caster; everything else decodes as a scalar. The connection
/// is required so a caster can re-fetch catalog metadata on a shape mismatch.
pub(crate) async fn decode_rows(
    conn: &mut sqlx::PgConnection,
    registry: &crate::orm::ModelRegistry,
    columns: &[crate::rows::Column],
    pg_rows: &[PgRow],
) -> crate::error::Result<Vec<Vec<crate::rows::Cell>>> {
    use crate::error::Error;
    use crate::rows::Cell;

    let casters: Vec<Option<std::sync::Arc<crate::orm::Caster>>> = columns
        .iter()
        .map(|c| registry.caster(&c.type_name))
        .collect();

    let mut rows = Vec::with_capacity(pg_rows.len());
    for pg_row in pg_rows {
        let mut cells = Vec::with_capacity(columns.len());
        for (idx, column) in columns.iter().enumerate() {
            let cell = match &casters[idx] {
                Some(caster) => {
                    let raw = pg_row.try_get_raw(idx)?;
                    if raw.is_null() {
                        Cell::null()
                    } else {
                        let value = match raw.format() {
                            PgValueFormat::Text => CompositeValue::Text(
                                raw.as_str().map_err(|e| Error::Decode(e.to_string()))?,
                            ),
                            PgValueFormat::Binary => CompositeValue::Binary(
                                raw.as_bytes().map_err(|e| Error::Decode(e.to_string()))?,
                            ),
                        };
                        caster.decode(conn, value).await?
                    }
                }
                None => Cell::Value(decode_scalar(pg_row, idx, &column.type_name)),
            };
            cells.push(cell);
        }
        rows.push(cells);
    }
    Ok(rows)
}

// =============================================================================
// Composite Values
// =============================================================================

/// A raw composite value in either wire format.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CompositeValue<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

/// One field extracted from a composite value. Binary fields carry the type
/// oid the server embedded; text fields are typed from catalog metadata.
pub(crate) enum CompositeField {
    Text(Option<String>),
    Binary { oid: u32, bytes: Option<Vec<u8>> },
}

impl CompositeValue<'_> {
    /// Split the composite into its fields, preserving NULLs.
    pub(crate) fn fields(&self) -> Result<Vec<CompositeField>, String> {
        match self {
            Self::Text(s) => Ok(parse_text_composite(s)?
                .into_iter()
                .map(CompositeField::Text)
                .collect()),
            Self::Binary(b) => Ok(parse_binary_composite(b)?
                .into_iter()
                .map(|(oid, bytes)| CompositeField::Binary { oid, bytes })
                .collect()),
        }
    }
}

impl CompositeField {
    /// Decode this field to a JSON value. `declared_oid` comes from catalog
    /// metadata and is used for text-format fields, which carry no oid of
    /// their own.
    pub(crate) fn decode(&self, declared_oid: u32) -> JsonValue {
        match self {
            Self::Text(None) => JsonValue::Null,
            Self::Text(Some(s)) => text_field_to_value(declared_oid, s),
            Self::Binary { bytes: None, .. } => JsonValue::Null,
            Self::Binary {
                oid,
                bytes: Some(bytes),
            } => binary_field_to_value(*oid, bytes),
        }
    }
}

// Type oids from pg_type.dat that we decode specially.
const OID_BOOL: u32 = 16;
const OID_BYTEA: u32 = 17;
const OID_CHAR: u32 = 18;
const OID_NAME: u32 = 19;
const OID_INT8: u32 = 20;
const OID_INT2: u32 = 21;
const OID_INT4: u32 = 23;
const OID_TEXT: u32 = 25;
const OID_OID: u32 = 26;
const OID_JSON: u32 = 114;
const OID_FLOAT4: u32 = 700;
const OID_FLOAT8: u32 = 701;
const OID_BPCHAR: u32 = 1042;
const OID_VARCHAR: u32 = 1043;
const OID_DATE: u32 = 1082;
const OID_TIMESTAMP: u32 = 1114;
const OID_TIMESTAMPTZ: u32 = 1184;
const OID_NUMERIC: u32 = 1700;
const OID_UUID: u32 = 2950;
const OID_JSONB: u32 = 3802;

/// Parse the text representation of a composite: `(f1,f2,...)` with
/// double-quote quoting. Unquoted empty fields are NULL.
fn parse_text_composite(s: &str) -> Result<Vec<Option<String>>, String> {
    let inner = s
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| format!("malformed composite literal: {s:?}"))?;

    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut was_quoted = false;
    let mut chars = inner.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        current.push('"');
                    } else {
                        quoted = false;
                    }
                }
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                }
                _ => current.push(c),
            }
        } else {
            match c {
                '"' => {
                    quoted = true;
                    was_quoted = true;
                }
                ',' => {
                    fields.push(finish_text_field(&mut current, &mut was_quoted));
                }
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                }
                _ => current.push(c),
            }
        }
    }
    if quoted {
        return Err(format!("unterminated quote in composite literal: {s:?}"));
    }
    fields.push(finish_text_field(&mut current, &mut was_quoted));
    Ok(fields)
}

fn finish_text_field(current: &mut String, was_quoted: &mut bool) -> Option<String> {
    let value = std::mem::take(current);
    let quoted = std::mem::take(was_quoted);
    if value.is_empty() && !quoted {
        None
    } else {
        Some(value)
    }
}

/// Parse the binary representation of a composite: an i32 field count, then
/// per field an oid (u32) and a length-prefixed value (-1 length means NULL).
fn parse_binary_composite(b: &[u8]) -> Result<Vec<(u32, Option<Vec<u8>>)>, String> {
    fn take<'a>(b: &mut &'a [u8], n: usize) -> Result<&'a [u8], String> {
        if b.len() < n {
            return Err("truncated composite value".to_string());
        }
        let (head, tail) = b.split_at(n);
        *b = tail;
        Ok(head)
    }
    fn take_i32(b: &mut &[u8]) -> Result<i32, String> {
        let bytes = take(b, 4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    let mut rest = b;
    let count = take_i32(&mut rest)?;
    if count < 0 {
        return Err(format!("negative composite field count: {count}"));
    }
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let oid = take_i32(&mut rest)? as u32;
        let len = take_i32(&mut rest)?;
        let bytes = if len < 0 {
            None
        } else {
            Some(take(&mut rest, len as usize)?.to_vec())
        };
        fields.push((oid, bytes));
    }
    Ok(fields)
}

/// Decode a text-format composite field by its declared type oid.
fn text_field_to_value(oid: u32, s: &str) -> JsonValue {
    match oid {
        OID_BOOL => JsonValue::Bool(s == "t" || s == "true"),
        OID_INT2 | OID_INT4 | OID_INT8 | OID_OID => s
            .parse::<i64>()
            .map(|v| JsonValue::Number(v.into()))
            .unwrap_or_else(|_| JsonValue::String(s.to_string())),
        OID_FLOAT4 | OID_FLOAT8 => s
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(s.to_string())),
        OID_JSON | OID_JSONB => {
            serde_json::from_str(s).unwrap_or_else(|_| JsonValue::String(s.to_string()))
        }
        OID_BYTEA => match s.strip_prefix("\\x") {
            Some(hex) => decode_hex(hex)
                .map(|bytes| decode_binary_value(&bytes, false))
                .unwrap_or_else(|| JsonValue::String(s.to_string())),
            None => JsonValue::String(s.to_string()),
        },
        _ => JsonValue::String(s.to_string()),
    }
}

/// Decode a binary-format composite field by the oid the server embedded.
fn binary_field_to_value(oid: u32, bytes: &[u8]) -> JsonValue {
    match oid {
        OID_BOOL => match bytes.first() {
            Some(&b) => JsonValue::Bool(b != 0),
            None => JsonValue::Null,
        },
        OID_INT2 => be_int(bytes, 2).map(int_value).unwrap_or(JsonValue::Null),
        OID_INT4 => be_int(bytes, 4).map(int_value).unwrap_or(JsonValue::Null),
        OID_INT8 => be_int(bytes, 8).map(int_value).unwrap_or(JsonValue::Null),
        OID_OID => be_int(bytes, 4).map(int_value).unwrap_or(JsonValue::Null),
        OID_FLOAT4 => bytes
            .try_into()
            .ok()
            .map(|raw: [u8; 4]| f32::from_be_bytes(raw) as f64)
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        OID_FLOAT8 => bytes
            .try_into()
            .ok()
            .map(|raw: [u8; 8]| f64::from_be_bytes(raw))
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        OID_TEXT | OID_VARCHAR | OID_BPCHAR | OID_NAME | OID_CHAR => {
            decode_binary_value(bytes, true)
        }
        OID_JSON => serde_json::from_slice(bytes).unwrap_or(JsonValue::Null),
        OID_JSONB => {
            // jsonb binary format carries a one-byte version prefix
            match bytes.split_first() {
                Some((1, body)) => serde_json::from_slice(body).unwrap_or(JsonValue::Null),
                _ => JsonValue::Null,
            }
        }
        OID_BYTEA => decode_binary_value(bytes, false),
        OID_NUMERIC => numeric_to_string(bytes)
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
        OID_UUID => format_uuid(bytes)
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
        OID_DATE => be_int(bytes, 4)
            .and_then(|days| pg_date_string(days as i32))
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
        OID_TIMESTAMP => be_int(bytes, 8)
            .and_then(pg_timestamp_string)
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
        OID_TIMESTAMPTZ => be_int(bytes, 8)
            .and_then(pg_timestamptz_string)
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
        _ => decode_binary_value(bytes, true),
    }
}

fn int_value(v: i64) -> JsonValue {
    JsonValue::Number(v.into())
}

fn be_int(bytes: &[u8], width: usize) -> Option<i64> {
    if bytes.len() != width {
        return None;
    }
    let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in bytes {
        value = (value << 8) | i64::from(b);
    }
    Some(value)
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

fn format_uuid(bytes: &[u8]) -> Option<String> {
    if bytes.len() != 16 {
        return None;
    }
    let mut hex = String::with_capacity(32);
    for b in bytes {
        let _ = write!(hex, "{b:02x}");
    }
    Some(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}

/// Render the binary NUMERIC format (base-10000 digit groups) as a decimal
/// string, preserving the declared scale.
fn numeric_to_string(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 8 {
        return None;
    }
    let ndigits = i16::from_be_bytes([bytes[0], bytes[1]]) as i32;
    let weight = i16::from_be_bytes([bytes[2], bytes[3]]) as i32;
    let sign = u16::from_be_bytes([bytes[4], bytes[5]]);
    let dscale = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;

    match sign {
        0x0000 | 0x4000 => {}
        0xC000 => return Some("NaN".to_string()),
        _ => return None,
    }
    if bytes.len() < 8 + (ndigits as usize) * 2 {
        return None;
    }
    let digit = |i: i32| -> i32 {
        if i < 0 || i >= ndigits {
            return 0;
        }
        let off = 8 + (i as usize) * 2;
        i16::from_be_bytes([bytes[off], bytes[off + 1]]) as i32
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                let _ = write!(out, "{}", digit(i));
            } else {
                let _ = write!(out, "{:04}", digit(i));
            }
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let groups = dscale.div_ceil(4);
        for g in 0..groups {
            let _ = write!(frac, "{:04}", digit(weight + 1 + g as i32));
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Some(out)
}

fn pg_date_string(days: i32) -> Option<String> {
    let epoch = chrono::NaiveDate::from_ymd_opt(2000, 1, 1)?;
    let date = epoch.checked_add_signed(chrono::Duration::days(days.into()))?;
    Some(date.to_string())
}

fn pg_timestamp_string(micros: i64) -> Option<String> {
    let epoch = chrono::NaiveDate::from_ymd_opt(2000, 1, 1)?.and_hms_opt(0, 0, 0)?;
    let ts = epoch.checked_add_signed(chrono::Duration::microseconds(micros))?;
    Some(ts.to_string())
}

fn pg_timestamptz_string(micros: i64) -> Option<String> {
    use chrono::TimeZone;
    let epoch = chrono::Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single()?;
    let ts = epoch.checked_add_signed(chrono::Duration::microseconds(micros))?;
    Some(ts.to_rfc3339())
}
