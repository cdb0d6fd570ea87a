//! Declared schemas for the typed tables.
//!
//! The schema registry drives both validation (field presence, numeric
//! ranges, enum membership) and the dialect adapters (which fields are
//! timestamps, which carry enum values, which names are renamed).

use sd_core::{RowError, TableRow, MAX_PLAYER_NAME_LEN};

/// What the validator expects of a field's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// String or unsigned-integer entity identifier.
    Id,
    Str,
    U64,
    I64,
    F64,
    Bool,
    /// `{x, y}` object.
    Vec2,
    /// Numeric timestamp in canonical microseconds.
    Timestamp,
    /// String drawn from a closed set.
    EnumStr,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    /// Inclusive numeric range, applied to numeric kinds.
    pub range: Option<(f64, f64)>,
    /// Accepted values for `EnumStr` fields (canonical lower_snake form).
    pub enum_values: Option<&'static [&'static str]>,
    /// Maximum length for `Str` fields.
    pub max_len: Option<usize>,
}

impl FieldSpec {
    const fn required(name: &'static str, kind: FieldKind) -> Self {
        FieldSpec {
            name,
            kind,
            required: true,
            range: None,
            enum_values: None,
            max_len: None,
        }
    }

    const fn optional(name: &'static str, kind: FieldKind) -> Self {
        FieldSpec {
            name,
            kind,
            required: false,
            range: None,
            enum_values: None,
            max_len: None,
        }
    }

    const fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    const fn with_enum(mut self, values: &'static [&'static str]) -> Self {
        self.enum_values = Some(values);
        self
    }

    const fn with_max_len(mut self, n: usize) -> Self {
        self.max_len = Some(n);
        self
    }
}

/// Declared schema of one table type.
#[derive(Debug, Clone)]
pub struct TypeSchema {
    pub type_name: &'static str,
    pub primary_key: &'static str,
    pub fields: &'static [FieldSpec],
}

const ENTITY_KINDS: &[&str] = &["player", "circle", "food", "obstacle", "other"];
const PLAYER_STATES: &[&str] = &["joining", "active", "splitting", "left"];
const CIRCLE_KINDS: &[&str] = &["food", "powerup", "hazard"];

static ENTITY_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("entity_id", FieldKind::Id),
    FieldSpec::required("position", FieldKind::Vec2),
    FieldSpec::optional("velocity", FieldKind::Vec2),
    FieldSpec::required("mass", FieldKind::F64).with_range(0.0, f64::MAX),
    FieldSpec::required("kind", FieldKind::EnumStr).with_enum(ENTITY_KINDS),
    FieldSpec::optional("owner_id", FieldKind::U64),
];

static PLAYER_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("entity_id", FieldKind::Id),
    FieldSpec::required("player_id", FieldKind::U64),
    FieldSpec::required("name", FieldKind::Str).with_max_len(MAX_PLAYER_NAME_LEN),
    FieldSpec::required("identity_id", FieldKind::Str),
    FieldSpec::required("position", FieldKind::Vec2),
    FieldSpec::optional("velocity", FieldKind::Vec2),
    FieldSpec::required("mass", FieldKind::F64).with_range(0.0, f64::MAX),
    FieldSpec::required("score", FieldKind::U64),
    FieldSpec::required("state", FieldKind::EnumStr).with_enum(PLAYER_STATES),
    FieldSpec::required("created_at", FieldKind::Timestamp),
    FieldSpec::optional("max_speed", FieldKind::F64).with_range(0.0, f64::MAX),
];

static CIRCLE_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("entity_id", FieldKind::Id),
    FieldSpec::required("position", FieldKind::Vec2),
    FieldSpec::required("mass", FieldKind::F64).with_range(0.0, f64::MAX),
    FieldSpec::required("circle_kind", FieldKind::EnumStr).with_enum(CIRCLE_KINDS),
    FieldSpec::required("value", FieldKind::I64),
];

static ENTITY_SCHEMA: TypeSchema = TypeSchema {
    type_name: "entity",
    primary_key: "entity_id",
    fields: ENTITY_FIELDS,
};

static PLAYER_SCHEMA: TypeSchema = TypeSchema {
    type_name: "player",
    primary_key: "player_id",
    fields: PLAYER_FIELDS,
};

static CIRCLE_SCHEMA: TypeSchema = TypeSchema {
    type_name: "circle",
    primary_key: "entity_id",
    fields: CIRCLE_FIELDS,
};

/// Look up the declared schema for a table type, if any.
pub fn schema_for(type_name: &str) -> Option<&'static TypeSchema> {
    match type_name {
        "entity" => Some(&ENTITY_SCHEMA),
        "player" => Some(&PLAYER_SCHEMA),
        "circle" => Some(&CIRCLE_SCHEMA),
        _ => None,
    }
}

/// All declared table types.
pub fn declared_types() -> &'static [&'static str] {
    &["entity", "player", "circle"]
}

impl TypeSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a row against this schema.
    ///
    /// Checks required-field presence, value kinds, numeric ranges and enum
    /// membership. Unknown fields are permitted here; the adapters count
    /// them separately.
    pub fn validate(&self, row: &TableRow) -> Result<(), RowError> {
        for spec in self.fields {
            let value = match row.get(spec.name) {
                Some(serde_json::Value::Null) | None => {
                    if spec.required {
                        return Err(RowError::MissingField {
                            row_id: row.describe_id(),
                            field: spec.name.to_owned(),
                        });
                    }
                    continue;
                }
                Some(v) => v,
            };
            self.validate_field(row, spec, value)?;
        }
        Ok(())
    }

    fn validate_field(
        &self,
        row: &TableRow,
        spec: &FieldSpec,
        value: &serde_json::Value,
    ) -> Result<(), RowError> {
        let mismatch = |expected: &str| RowError::TypeMismatch {
            row_id: row.describe_id(),
            field: spec.name.to_owned(),
            expected: expected.to_owned(),
        };
        match spec.kind {
            FieldKind::Id => {
                if !(value.is_string() || value.as_u64().is_some()) {
                    return Err(mismatch("string or unsigned integer"));
                }
            }
            FieldKind::Str => {
                let s = value.as_str().ok_or_else(|| mismatch("string"))?;
                if s.is_empty() {
                    return Err(RowError::OutOfRange {
                        row_id: row.describe_id(),
                        field: spec.name.to_owned(),
                        message: "must be non-empty".to_owned(),
                    });
                }
                if let Some(max) = spec.max_len {
                    if s.len() > max {
                        return Err(RowError::OutOfRange {
                            row_id: row.describe_id(),
                            field: spec.name.to_owned(),
                            message: format!("length {} exceeds {}", s.len(), max),
                        });
                    }
                }
            }
            FieldKind::U64 => {
                if value.as_u64().is_none() {
                    return Err(mismatch("unsigned integer"));
                }
            }
            FieldKind::I64 | FieldKind::Timestamp => {
                if value.as_i64().is_none() {
                    return Err(mismatch("integer"));
                }
            }
            FieldKind::F64 => {
                let n = value.as_f64().ok_or_else(|| mismatch("number"))?;
                if let Some((min, max)) = spec.range {
                    if n < min || n > max {
                        return Err(RowError::OutOfRange {
                            row_id: row.describe_id(),
                            field: spec.name.to_owned(),
                            message: format!("{} outside [{}, {}]", n, min, max),
                        });
                    }
                }
            }
            FieldKind::Bool => {
                if !value.is_boolean() {
                    return Err(mismatch("boolean"));
                }
            }
            FieldKind::Vec2 => {
                let ok = value
                    .as_object()
                    .map(|o| {
                        o.get("x").and_then(|v| v.as_f64()).is_some()
                            && o.get("y").and_then(|v| v.as_f64()).is_some()
                    })
                    .unwrap_or(false);
                if !ok {
                    return Err(mismatch("{x, y} object"));
                }
            }
            FieldKind::EnumStr => {
                let s = value.as_str().ok_or_else(|| mismatch("string"))?;
                if let Some(values) = spec.enum_values {
                    if !values.contains(&s) {
                        return Err(RowError::OutOfRange {
                            row_id: row.describe_id(),
                            field: spec.name.to_owned(),
                            message: format!("'{}' not in {:?}", s, values),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
