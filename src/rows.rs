//! Row shapes returned by fetches.
//!
//! Every fetch decodes result rows into [`Cell`]s and then shapes them
//! according to a [`BackAs`] choice: a bare tuple, an immutable [`Record`]
//! with a shared header, an ordered mapping, or a mutable [`FlexRow`]. Single
//! column results with no explicit shape are dereferenced to the bare cell.

use crate::error::{Error, Result};
use crate::orm::Model;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// A single decoded result cell.
///
/// Scalars are carried as JSON values; columns whose composite type has a
/// registered model decode to [`Model`] instances instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Value(JsonValue),
    Model(Model),
}

impl Cell {
    pub fn null() -> Self {
        Self::Value(JsonValue::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Value(JsonValue::Null))
    }

    pub fn as_value(&self) -> Option<&JsonValue> {
        match self {
            Self::Value(v) => Some(v),
            Self::Model(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(JsonValue::as_str)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_value().and_then(JsonValue::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_value().and_then(JsonValue::as_f64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_value().and_then(JsonValue::as_bool)
    }

    pub fn as_model(&self) -> Option<&Model> {
        match self {
            Self::Model(m) => Some(m),
            Self::Value(_) => None,
        }
    }

    pub fn into_model(self) -> Option<Model> {
        match self {
            Self::Model(m) => Some(m),
            Self::Value(_) => None,
        }
    }
}

impl From<JsonValue> for Cell {
    fn from(value: JsonValue) -> Self {
        Self::Value(value)
    }
}

/// Metadata for one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Postgres type name as reported by the driver, e.g. "int4" or a
    /// user-defined composite name.
    pub type_name: String,
}

/// The shape rows come back as.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BackAs {
    /// A bare ordered tuple of cells.
    Tuple,
    /// An immutable record with a header shared across the result set.
    #[default]
    Record,
    /// An ordered name-to-cell mapping.
    Mapping,
    /// A mutable row addressable by index or name.
    #[serde(rename = "row")]
    Flex,
}

impl FromStr for BackAs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tuple" => Ok(Self::Tuple),
            "record" | "namedtuple" => Ok(Self::Record),
            "mapping" | "dict" => Ok(Self::Mapping),
            "row" => Ok(Self::Flex),
            other => Err(Error::bad_back_as(other)),
        }
    }
}

/// Column-name header shared by every [`Record`] in a result set.
#[derive(Debug, PartialEq, Eq)]
pub struct RecordHeader {
    names: Vec<String>,
}

impl RecordHeader {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// An immutable row: cells plus a shared header.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    header: Arc<RecordHeader>,
    values: Vec<Cell>,
}

impl Record {
    pub fn header(&self) -> &Arc<RecordHeader> {
        &self.header
    }

    pub fn get(&self, name: &str) -> Option<&Cell> {
        self.header.position(name).and_then(|i| self.values.get(i))
    }

    pub fn get_index(&self, index: usize) -> Option<&Cell> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over (name, cell) pairs in column order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Cell)> {
        self.header
            .names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn into_values(self) -> Vec<Cell> {
        self.values
    }
}

/// A mutable row addressable by index or name. Existing cells may be
/// reassigned by name and new named cells may be appended, but positional
/// assignment is not offered.
#[derive(Debug, Clone, PartialEq)]
pub struct FlexRow {
    names: Vec<String>,
    values: Vec<Cell>,
}

impl FlexRow {
    pub(crate) fn new(columns: &[Column], values: Vec<Cell>) -> Self {
        Self {
            names: columns.iter().map(|c| c.name.clone()).collect(),
            values,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Cell> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i))
    }

    pub fn get_index(&self, index: usize) -> Option<&Cell> {
        self.values.get(index)
    }

    /// Assign a cell by name, appending a new named cell if the name is new.
    pub fn set(&mut self, name: impl Into<String>, cell: Cell) {
        let name = name.into();
        match self.names.iter().position(|n| *n == name) {
            Some(i) => self.values[i] = cell,
            None => {
                self.names.push(name);
                self.values.push(cell);
            }
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One fetched row, shaped per the effective [`BackAs`].
///
/// `Cell` is the dereferenced form: a single-column row fetched with no
/// explicit shape collapses to its one cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Cell(Cell),
    Tuple(Vec<Cell>),
    Record(Record),
    Mapping(IndexMap<String, Cell>),
    Flex(FlexRow),
}

impl Row {
    /// Look up a cell by column name, for any named shape.
    pub fn get(&self, name: &str) -> Option<&Cell> {
        match self {
            Self::Cell(_) | Self::Tuple(_) => None,
            Self::Record(r) => r.get(name),
            Self::Mapping(m) => m.get(name),
            Self::Flex(r) => r.get(name),
        }
    }

    /// Look up a cell by position, for any positional shape.
    pub fn get_index(&self, index: usize) -> Option<&Cell> {
        match self {
            Self::Cell(c) => (index == 0).then_some(c),
            Self::Tuple(t) => t.get(index),
            Self::Record(r) => r.get_index(index),
            Self::Mapping(m) => m.get_index(index).map(|(_, v)| v),
            Self::Flex(r) => r.get_index(index),
        }
    }

    pub fn as_cell(&self) -> Option<&Cell> {
        match self {
            Self::Cell(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_cell(self) -> Option<Cell> {
        match self {
            Self::Cell(c) => Some(c),
            _ => None,
        }
    }
}

impl From<Cell> for Row {
    fn from(cell: Cell) -> Self {
        Self::Cell(cell)
    }
}

/// Cache of record headers, keyed by the column-name tuple. Every result set
/// with the same column names shares one header allocation.
#[derive(Debug, Default)]
pub struct RecordHeaderCache {
    inner: Mutex<HashMap<Vec<String>, Arc<RecordHeader>>>,
}

impl RecordHeaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header_for(&self, columns: &[Column]) -> Arc<RecordHeader> {
        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner
            .entry(names.clone())
            .or_insert_with(|| Arc::new(RecordHeader { names }))
            .clone()
    }
}

/// Shape one decoded row per the effective back_as.
pub(crate) fn shape_row(
    back_as: BackAs,
    columns: &[Column],
    values: Vec<Cell>,
    headers: &RecordHeaderCache,
) -> Row {
    match back_as {
        BackAs::Tuple => Row::Tuple(values),
        BackAs::Record => Row::Record(Record {
            header: headers.header_for(columns),
            values,
        }),
        BackAs::Mapping => Row::Mapping(
            columns
                .iter()
                .map(|c| c.name.clone())
                .zip(values)
                .collect(),
        ),
        BackAs::Flex => Row::Flex(FlexRow::new(columns, values)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns(names: &[&str]) -> Vec<Column> {
        names
            .iter()
            .map(|n| Column {
                name: n.to_string(),
                type_name: "int4".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_back_as_tokens() {
        assert_eq!("tuple".parse::<BackAs>().unwrap(), BackAs::Tuple);
        assert_eq!("record".parse::<BackAs>().unwrap(), BackAs::Record);
        assert_eq!("namedtuple".parse::<BackAs>().unwrap(), BackAs::Record);
        assert_eq!("mapping".parse::<BackAs>().unwrap(), BackAs::Mapping);
        assert_eq!("dict".parse::<BackAs>().unwrap(), BackAs::Mapping);
        assert_eq!("row".parse::<BackAs>().unwrap(), BackAs::Flex);
    }

    #[test]
    fn test_back_as_rejects_unknown_token() {
        let err = "list".parse::<BackAs>().unwrap_err();
        assert!(matches!(err, Error::BadBackAs { value } if value == "list"));
    }

    #[test]
    fn test_shape_tuple() {
        let headers = RecordHeaderCache::new();
        let row = shape_row(
            BackAs::Tuple,
            &columns(&["a", "b"]),
            vec![Cell::from(json!(1)), Cell::from(json!(2))],
            &headers,
        );
        assert_eq!(
            row,
            Row::Tuple(vec![Cell::from(json!(1)), Cell::from(json!(2))])
        );
    }

    #[test]
    fn test_shape_record_lookup() {
        let headers = RecordHeaderCache::new();
        let row = shape_row(
            BackAs::Record,
            &columns(&["a", "b"]),
            vec![Cell::from(json!(1)), Cell::from(json!("x"))],
            &headers,
        );
        assert_eq!(row.get("b"), Some(&Cell::from(json!("x"))));
        assert_eq!(row.get_index(0), Some(&Cell::from(json!(1))));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_record_headers_are_shared() {
        let headers = RecordHeaderCache::new();
        let cols = columns(&["a", "b"]);
        let r1 = shape_row(
            BackAs::Record,
            &cols,
            vec![Cell::from(json!(1)), Cell::from(json!(2))],
            &headers,
        );
        let r2 = shape_row(
            BackAs::Record,
            &cols,
            vec![Cell::from(json!(3)), Cell::from(json!(4))],
            &headers,
        );
        let (Row::Record(r1), Row::Record(r2)) = (r1, r2) else {
            panic!("expected records");
        };
        assert!(Arc::ptr_eq(r1.header(), r2.header()));
    }

    #[test]
    fn test_shape_mapping_preserves_order() {
        let headers = RecordHeaderCache::new();
        let row = shape_row(
            BackAs::Mapping,
            &columns(&["z", "a"]),
            vec![Cell::from(json!(1)), Cell::from(json!(2))],
            &headers,
        );
        let Row::Mapping(m) = row else {
            panic!("expected mapping");
        };
        let keys: Vec<&str> = m.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn test_flex_row_assignment() {
        let headers = RecordHeaderCache::new();
        let row = shape_row(
            BackAs::Flex,
            &columns(&["a"]),
            vec![Cell::from(json!(1))],
            &headers,
        );
        let Row::Flex(mut flex) = row else {
            panic!("expected flex row");
        };
        flex.set("a", Cell::from(json!(10)));
        assert_eq!(flex.get("a"), Some(&Cell::from(json!(10))));
        flex.set("fresh", Cell::from(json!("new")));
        assert_eq!(flex.len(), 2);
        assert_eq!(flex.get_index(1), Some(&Cell::from(json!("new"))));
    }

    #[test]
    fn test_cell_accessors() {
        assert!(Cell::null().is_null());
        assert_eq!(Cell::from(json!(7)).as_i64(), Some(7));
        assert_eq!(Cell::from(json!("s")).as_str(), Some("s"));
        assert_eq!(Cell::from(json!(true)).as_bool(), Some(true));
        assert_eq!(Cell::from(json!(1)).as_model(), None);
    }
}
