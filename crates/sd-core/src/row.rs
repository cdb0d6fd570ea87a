use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::vector::Vec2;

/// One decoded record of a subscribed table: an opaque field → value map.
///
/// Rows are produced by the wire decoder before any typed interpretation.
/// Typed entities are derived from rows by the validator; see the `TryFrom`
/// impls in [`crate::entity`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableRow(pub BTreeMap<String, Value>);

impl TableRow {
    pub fn new() -> Self {
        TableRow(BTreeMap::new())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Best-effort row identifier for error reporting: the first of
    /// `entity_id`, `player_id`, `id` that is present.
    pub fn describe_id(&self) -> String {
        for key in ["entity_id", "player_id", "id"] {
            if let Some(v) = self.0.get(key) {
                return value_to_id_string(v);
            }
        }
        "<unknown>".to_owned()
    }

    pub fn require_str(&self, field: &str) -> Result<&str, RowError> {
        self.get(field)
            .ok_or_else(|| self.missing(field))?
            .as_str()
            .ok_or_else(|| self.mismatch(field, "string"))
    }

    pub fn require_f64(&self, field: &str) -> Result<f64, RowError> {
        self.get(field)
            .ok_or_else(|| self.missing(field))?
            .as_f64()
            .ok_or_else(|| self.mismatch(field, "number"))
    }

    pub fn require_u64(&self, field: &str) -> Result<u64, RowError> {
        self.get(field)
            .ok_or_else(|| self.missing(field))?
            .as_u64()
            .ok_or_else(|| self.mismatch(field, "unsigned integer"))
    }

    pub fn require_i64(&self, field: &str) -> Result<i64, RowError> {
        self.get(field)
            .ok_or_else(|| self.missing(field))?
            .as_i64()
            .ok_or_else(|| self.mismatch(field, "integer"))
    }

    pub fn require_vec2(&self, field: &str) -> Result<Vec2, RowError> {
        let value = self.get(field).ok_or_else(|| self.missing(field))?;
        parse_vec2(value).ok_or_else(|| self.mismatch(field, "{x, y} object"))
    }

    pub fn optional_vec2(&self, field: &str) -> Result<Option<Vec2>, RowError> {
        match self.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => parse_vec2(value)
                .map(Some)
                .ok_or_else(|| self.mismatch(field, "{x, y} object")),
        }
    }

    pub fn optional_str(&self, field: &str) -> Result<Option<&str>, RowError> {
        match self.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_str()
                .map(Some)
                .ok_or_else(|| self.mismatch(field, "string")),
        }
    }

    fn missing(&self, field: &str) -> RowError {
        RowError::MissingField {
            row_id: self.describe_id(),
            field: field.to_owned(),
        }
    }

    fn mismatch(&self, field: &str, expected: &str) -> RowError {
        RowError::TypeMismatch {
            row_id: self.describe_id(),
            field: field.to_owned(),
            expected: expected.to_owned(),
        }
    }
}

impl FromIterator<(String, Value)> for TableRow {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        TableRow(iter.into_iter().collect())
    }
}

fn parse_vec2(value: &Value) -> Option<Vec2> {
    let obj = value.as_object()?;
    Some(Vec2::new(obj.get("x")?.as_f64()?, obj.get("y")?.as_f64()?))
}

pub(crate) fn value_to_id_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Validation failure while deriving a typed value from a [`TableRow`].
///
/// Carries the offending row id and field name so callers can report
/// per-element errors in batch processing without losing context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowError {
    #[error("row {row_id}: missing required field '{field}'")]
    MissingField { row_id: String, field: String },
    #[error("row {row_id}: field '{field}' is not a {expected}")]
    TypeMismatch {
        row_id: String,
        field: String,
        expected: String,
    },
    #[error("row {row_id}: field '{field}' out of range: {message}")]
    OutOfRange {
        row_id: String,
        field: String,
        message: String,
    },
}

impl RowError {
    /// The field the error is anchored to.
    pub fn field(&self) -> &str {
        match self {
            RowError::MissingField { field, .. }
            | RowError::TypeMismatch { field, .. }
            | RowError::OutOfRange { field, .. } => field,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> TableRow {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn accessors_read_typed_values() {
        let r = row(json!({
            "entity_id": 7,
            "name": "P1",
            "mass": 12.5,
            "position": {"x": 1.0, "y": -2.0},
        }));
        assert_eq!(r.require_str("name").unwrap(), "P1");
        assert_eq!(r.require_f64("mass").unwrap(), 12.5);
        assert_eq!(r.require_u64("entity_id").unwrap(), 7);
        assert_eq!(r.require_vec2("position").unwrap(), Vec2::new(1.0, -2.0));
    }

    #[test]
    fn missing_field_error_carries_row_id_and_field() {
        let r = row(json!({"entity_id": "e-9"}));
        let err = r.require_f64("mass").unwrap_err();
        assert_eq!(
            err,
            RowError::MissingField {
                row_id: "e-9".to_owned(),
                field: "mass".to_owned()
            }
        );
    }

    #[test]
    fn type_mismatch_names_the_field() {
        let r = row(json!({"entity_id": 1, "mass": "heavy"}));
        let err = r.require_f64("mass").unwrap_err();
        assert_eq!(err.field(), "mass");
    }

    #[test]
    fn optional_fields_accept_null_and_absence() {
        let r = row(json!({"entity_id": 1, "velocity": null}));
        assert_eq!(r.optional_vec2("velocity").unwrap(), None);
        assert_eq!(r.optional_vec2("acceleration").unwrap(), None);
        assert_eq!(r.optional_str("owner_id").unwrap(), None);
    }

    #[test]
    fn round_trips_through_json() {
        let r = row(json!({"entity_id": 3, "mass": 4.0}));
        let text = serde_json::to_string(&r).unwrap();
        let back: TableRow = serde_json::from_str(&text).unwrap();
        assert_eq!(back, r);
    }
}
