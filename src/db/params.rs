//! Query parameter handling.
//!
//! Queries accept either positional or named parameters. Named placeholders
//! use the `:name` form and are rewritten to `$n` placeholders before the
//! statement is prepared; `::` type casts are left alone. The same parameter
//! values can also be rendered as SQL literals, which is how cached fetches
//! derive their cache key.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::Postgres;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use std::fmt::Write as _;
use std::sync::LazyLock;

/// A query parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

/// Serde helper for base64-encoded binary parameters.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<serde_json::Value> for QueryParam {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

/// The parameters for one query: nothing, a positional list, or a named map.
#[derive(Debug, Clone, Default)]
pub enum Params {
    #[default]
    None,
    Positional(Vec<QueryParam>),
    Named(IndexMap<String, QueryParam>),
}

impl Params {
    /// Build positional parameters.
    pub fn positional<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<QueryParam>,
    {
        Self::Positional(values.into_iter().map(Into::into).collect())
    }

    /// Build named parameters.
    pub fn named<I, K, T>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<QueryParam>,
    {
        Self::Named(values.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Positional(v) => v.is_empty(),
            Self::Named(m) => m.is_empty(),
        }
    }

    /// Merge extra named values into these parameters. Later values win over
    /// earlier ones for the same name. Merging into a positional list is
    /// rejected.
    pub fn merge<I, K, T>(&mut self, extra: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<QueryParam>,
    {
        match self {
            Self::Positional(v) if !v.is_empty() => Err(Error::MixedParameters),
            Self::Named(map) => {
                map.extend(extra.into_iter().map(|(k, v)| (k.into(), v.into())));
                Ok(())
            }
            _ => {
                let map: IndexMap<String, QueryParam> = extra
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect();
                if !map.is_empty() {
                    *self = Self::Named(map);
                }
                Ok(())
            }
        }
    }

    /// Resolve these parameters against the query text, producing the SQL to
    /// prepare and the positional values to bind. Named placeholders are
    /// rewritten to `$n`; repeated names share one placeholder index.
    pub(crate) fn prepare(&self, sql: &str) -> Result<(String, Vec<QueryParam>)> {
        match self {
            Self::None => Ok((sql.to_string(), Vec::new())),
            Self::Positional(values) => Ok((sql.to_string(), values.clone())),
            Self::Named(map) => rewrite_named(sql, map),
        }
    }
}

/// Matches `::` casts (left alone) or `:name` placeholders.
static NAMED_PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(::)|:([A-Za-z_][A-Za-z0-9_]*)").unwrap_or_else(|e| {
        unreachable!("named parameter regex is valid: {e}");
    })
});

/// Matches `$n` placeholders for literal rendering.
static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(\d+)").unwrap_or_else(|e| {
        unreachable!("placeholder regex is valid: {e}");
    })
});

fn rewrite_named(
    sql: &str,
    map: &IndexMap<String, QueryParam>,
) -> Result<(String, Vec<QueryParam>)> {
    let mut out = String::with_capacity(sql.len());
    let mut values: Vec<QueryParam> = Vec::new();
    let mut indices: IndexMap<&str, usize> = IndexMap::new();

    // Single-quoted literals pass through untouched; only the text between
    // them is scanned for placeholders.
    let mut rest = sql;
    while let Some(pos) = rest.find('\'') {
        rewrite_segment(&rest[..pos], map, &mut out, &mut values, &mut indices)?;
        let end = literal_end(&rest[pos..]);
        out.push_str(&rest[pos..pos + end]);
        rest = &rest[pos + end..];
    }
    rewrite_segment(rest, map, &mut out, &mut values, &mut indices)?;
    Ok((out, values))
}

/// Length in bytes of the single-quoted literal at the front of `s`,
/// including both quotes. A doubled quote stays inside the literal; an
/// unterminated literal runs to the end of the string.
fn literal_end(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn rewrite_segment<'a>(
    segment: &'a str,
    map: &IndexMap<String, QueryParam>,
    out: &mut String,
    values: &mut Vec<QueryParam>,
    indices: &mut IndexMap<&'a str, usize>,
) -> Result<()> {
    let mut last = 0;
    for caps in NAMED_PARAM_RE.captures_iter(segment) {
        let Some(m) = caps.get(0) else { continue };
        out.push_str(&segment[last..m.start()]);
        last = m.end();

        if caps.get(1).is_some() {
            out.push_str("::");
            continue;
        }
        let name = caps.get(2).map(|g| g.as_str()).unwrap_or_default();
        let index = match indices.get(name) {
            Some(i) => *i,
            None => {
                let value = map.get(name).ok_or_else(|| Error::MissingParameter {
                    name: name.to_string(),
                })?;
                values.push(value.clone());
                indices.insert(name, values.len());
                values.len()
            }
        };
        let _ = write!(out, "${index}");
    }
    out.push_str(&segment[last..]);
    Ok(())
}

/// Render a prepared query with its values inlined as SQL literals. The
/// result is used as a cache key, not sent to the server.
pub(crate) fn render_query(sql: &str, values: &[QueryParam]) -> String {
    PLACEHOLDER_RE
        .replace_all(sql, |caps: &regex::Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| values.get(i))
                .map(render_literal)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Render a single parameter as a SQL literal.
pub(crate) fn render_literal(param: &QueryParam) -> String {
    match param {
        QueryParam::Null => "NULL".to_string(),
        QueryParam::Bool(true) => "TRUE".to_string(),
        QueryParam::Bool(false) => "FALSE".to_string(),
        QueryParam::Int(v) => v.to_string(),
        QueryParam::Float(v) => {
            if v.is_finite() {
                v.to_string()
            } else {
                format!("'{v}'")
            }
        }
        QueryParam::String(v) => quote_literal(v),
        QueryParam::Bytes(v) => {
            let mut hex = String::with_capacity(v.len() * 2);
            for byte in v {
                let _ = write!(hex, "{byte:02x}");
            }
            format!("'\\x{hex}'::bytea")
        }
        QueryParam::Json(v) => format!("{}::jsonb", quote_literal(&v.to_string())),
    }
}

fn quote_literal(s: &str) -> String {
    if s.contains('\\') {
        format!("E'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
    } else {
        format!("'{}'", s.replace('\'', "''"))
    }
}

/// Bind a parameter to a Postgres query.
pub(crate) fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(sqlx::types::Json(v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rewrite_named_placeholders() {
        let params = match Params::named([("name", "alice"), ("city", "lyon")]) {
            Params::Named(m) => m,
            _ => unreachable!(),
        };
        let (sql, values) =
            rewrite_named("SELECT * FROM t WHERE name = :name AND city = :city", &params).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE name = $1 AND city = $2");
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], QueryParam::String("alice".to_string()));
    }

    #[test]
    fn test_rewrite_reuses_index_for_repeated_name() {
        let params = match Params::named([("x", 1i64)]) {
            Params::Named(m) => m,
            _ => unreachable!(),
        };
        let (sql, values) = rewrite_named("SELECT :x + :x", &params).unwrap();
        assert_eq!(sql, "SELECT $1 + $1");
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_rewrite_leaves_casts_alone() {
        let params = match Params::named([("id", 3i64)]) {
            Params::Named(m) => m,
            _ => unreachable!(),
        };
        let (sql, _) =
            rewrite_named("SELECT payload::jsonb FROM t WHERE id = :id", &params).unwrap();
        assert_eq!(sql, "SELECT payload::jsonb FROM t WHERE id = $1");
    }

    #[test]
    fn test_rewrite_skips_quoted_literals() {
        let params = match Params::named([("x", 1i64)]) {
            Params::Named(m) => m,
            _ => unreachable!(),
        };
        let (sql, values) = rewrite_named("SELECT 'wait :here', :x", &params).unwrap();
        assert_eq!(sql, "SELECT 'wait :here', $1");
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_rewrite_skips_literals_with_doubled_quotes() {
        let params = match Params::named([("x", 1i64)]) {
            Params::Named(m) => m,
            _ => unreachable!(),
        };
        let (sql, _) = rewrite_named("SELECT 'it''s :not a param', :x", &params).unwrap();
        assert_eq!(sql, "SELECT 'it''s :not a param', $1");
    }

    #[test]
    fn test_rewrite_missing_parameter() {
        let params = match Params::named([("a", 1i64)]) {
            Params::Named(m) => m,
            _ => unreachable!(),
        };
        let err = rewrite_named("SELECT :b", &params).unwrap_err();
        assert!(matches!(err, Error::MissingParameter { name } if name == "b"));
    }

    #[test]
    fn test_merge_into_positional_is_rejected() {
        let mut params = Params::positional([1i64, 2i64]);
        let err = params.merge([("extra", 3i64)]).unwrap_err();
        assert!(matches!(err, Error::MixedParameters));
    }

    #[test]
    fn test_merge_into_named_overrides() {
        let mut params = Params::named([("a", 1i64)]);
        params.merge([("a", 2i64), ("b", 3i64)]).unwrap();
        let Params::Named(map) = params else {
            unreachable!()
        };
        assert_eq!(map.get("a"), Some(&QueryParam::Int(2)));
        assert_eq!(map.get("b"), Some(&QueryParam::Int(3)));
    }

    #[test]
    fn test_merge_into_empty_promotes_to_named() {
        let mut params = Params::None;
        params.merge([("a", 1i64)]).unwrap();
        assert!(matches!(params, Params::Named(_)));
    }

    #[test]
    fn test_render_literals() {
        assert_eq!(render_literal(&QueryParam::Null), "NULL");
        assert_eq!(render_literal(&QueryParam::Bool(true)), "TRUE");
        assert_eq!(render_literal(&QueryParam::Int(-7)), "-7");
        assert_eq!(
            render_literal(&QueryParam::String("it's".to_string())),
            "'it''s'"
        );
        assert_eq!(
            render_literal(&QueryParam::String("a\\b".to_string())),
            "E'a\\\\b'"
        );
        assert_eq!(
            render_literal(&QueryParam::Bytes(vec![0xde, 0xad])),
            "'\\xdead'::bytea"
        );
        assert_eq!(
            render_literal(&QueryParam::Json(json!({"k": 1}))),
            "'{\"k\":1}'::jsonb"
        );
    }

    #[test]
    fn test_render_query_inlines_values() {
        let values = vec![QueryParam::Int(5), QueryParam::String("x".to_string())];
        let rendered = render_query("SELECT $1, $2, $3", &values);
        assert_eq!(rendered, "SELECT 5, 'x', $3");
    }

    #[test]
    fn test_query_param_from_option() {
        assert_eq!(QueryParam::from(None::<i64>), QueryParam::Null);
        assert_eq!(QueryParam::from(Some(4i64)), QueryParam::Int(4));
    }

    #[test]
    fn test_query_param_serde_untagged() {
        let param: QueryParam = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(param, QueryParam::Int(42));
        let param: QueryParam = serde_json::from_value(json!("hi")).unwrap();
        assert_eq!(param, QueryParam::String("hi".to_string()));
        let param: QueryParam = serde_json::from_value(json!(null)).unwrap();
        assert_eq!(param, QueryParam::Null);
    }
}
