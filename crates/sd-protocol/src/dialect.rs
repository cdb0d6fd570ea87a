//! Per-dialect wire translation.
//!
//! Each supported server dialect has its own field-name casing, timestamp
//! unit, enum-value casing and a handful of explicit renames. Adapters
//! translate between the canonical internal form (lower_snake field names,
//! microsecond timestamps, lower_snake enum values) and the dialect form,
//! in both directions, such that `from_server(to_server(row)) == row` for
//! every declared field.
//!
//! | Dialect | Field case   | Timestamps     | Enum case   |
//! |---------|--------------|----------------|-------------|
//! | A       | lower, short | nanoseconds    | lowercase   |
//! | B       | lower_snake  | float seconds  | lower_snake |
//! | C       | PascalCase   | milliseconds   | PascalCase  |
//! | D       | camelCase    | nanoseconds    | camelCase   |

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::debug;

use sd_core::TableRow;

use crate::schema::{schema_for, FieldKind};

/// A supported server dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    A,
    B,
    C,
    D,
}

impl Dialect {
    /// Parse the `SERVER_LANGUAGE` tag. Case-insensitive.
    pub fn parse(tag: &str) -> Option<Dialect> {
        match tag.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Dialect::A),
            "B" => Some(Dialect::B),
            "C" => Some(Dialect::C),
            "D" => Some(Dialect::D),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::A => "A",
            Dialect::B => "B",
            Dialect::C => "C",
            Dialect::D => "D",
        }
    }

    /// Explicit renames for this dialect; they take priority over the
    /// generic case conversion. Reverse mappings are derived from this
    /// table, so every entry round-trips by construction.
    fn renames(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Dialect::A => &[("entity_id", "id"), ("created_at", "created")],
            Dialect::B => &[],
            Dialect::C => &[("entity_id", "EntityId"), ("max_speed", "MaxSpeed")],
            Dialect::D => &[("player_id", "playerID"), ("entity_id", "entityID")],
        }
    }

    /// Generic field-name conversion, applied when no rename matches.
    pub fn convert_field_name(&self, name: &str) -> String {
        for (from, to) in self.renames() {
            if *from == name {
                return (*to).to_owned();
            }
        }
        match self {
            Dialect::A | Dialect::B => name.to_owned(),
            Dialect::C => snake_to_pascal(name),
            Dialect::D => snake_to_camel(name),
        }
    }

    fn convert_enum_value(&self, value: &str) -> String {
        match self {
            Dialect::A => value.to_ascii_lowercase(),
            Dialect::B => value.to_owned(),
            Dialect::C => snake_to_pascal(value),
            Dialect::D => snake_to_camel(value),
        }
    }

    fn revert_enum_value(&self, value: &str) -> String {
        match self {
            Dialect::A | Dialect::B => value.to_owned(),
            Dialect::C => pascal_to_snake(value),
            Dialect::D => camel_to_snake(value),
        }
    }

    fn timestamp_to_server(&self, micros: i64) -> Value {
        match self {
            // Nanoseconds.
            Dialect::A | Dialect::D => Value::from(micros.saturating_mul(1000)),
            // Float seconds.
            Dialect::B => Value::from(micros as f64 / 1_000_000.0),
            // Milliseconds, fractional to preserve microsecond precision.
            Dialect::C => Value::from(micros as f64 / 1000.0),
        }
    }

    fn timestamp_from_server(&self, value: &Value) -> Option<Value> {
        match self {
            Dialect::A | Dialect::D => value.as_i64().map(|ns| Value::from(ns / 1000)),
            Dialect::B => value
                .as_f64()
                .map(|secs| Value::from((secs * 1_000_000.0).round() as i64)),
            Dialect::C => value
                .as_f64()
                .map(|ms| Value::from((ms * 1000.0).round() as i64)),
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bidirectional row translator for one dialect.
///
/// `to_server` and `from_server` are pure with respect to their inputs;
/// the adapter only accumulates an unknown-field counter for
/// observability. Unknown fields pass through both directions unchanged.
#[derive(Debug)]
pub struct DialectAdapter {
    dialect: Dialect,
    unknown_fields: AtomicU64,
}

impl DialectAdapter {
    pub fn new(dialect: Dialect) -> Self {
        DialectAdapter {
            dialect,
            unknown_fields: AtomicU64::new(0),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Number of undeclared fields that have passed through this adapter.
    pub fn unknown_fields_seen(&self) -> u64 {
        self.unknown_fields.load(Ordering::Relaxed)
    }

    /// Translate a canonical row into the dialect's wire form.
    pub fn to_server(&self, row: &TableRow, type_name: &str) -> TableRow {
        let schema = match schema_for(type_name) {
            Some(s) => s,
            None => return row.clone(),
        };
        let mut out = TableRow::new();
        for (name, value) in row.fields() {
            match schema.field(name) {
                Some(spec) => {
                    let wire_name = self.dialect.convert_field_name(name);
                    let wire_value = match spec.kind {
                        FieldKind::Timestamp => value
                            .as_i64()
                            .map(|micros| self.dialect.timestamp_to_server(micros))
                            .unwrap_or_else(|| value.clone()),
                        FieldKind::EnumStr => value
                            .as_str()
                            .map(|s| Value::from(self.dialect.convert_enum_value(s)))
                            .unwrap_or_else(|| value.clone()),
                        _ => value.clone(),
                    };
                    out.set(wire_name, wire_value);
                }
                None => {
                    self.count_unknown(type_name, name);
                    out.set(name.clone(), value.clone());
                }
            }
        }
        out
    }

    /// Translate a dialect wire row back into canonical form.
    pub fn from_server(&self, row: &TableRow, type_name: &str) -> TableRow {
        let schema = match schema_for(type_name) {
            Some(s) => s,
            None => return row.clone(),
        };
        let mut out = TableRow::new();
        for (wire_name, value) in row.fields() {
            let declared = schema
                .fields
                .iter()
                .find(|spec| self.dialect.convert_field_name(spec.name) == *wire_name);
            match declared {
                Some(spec) => {
                    let canonical = match spec.kind {
                        FieldKind::Timestamp => self
                            .dialect
                            .timestamp_from_server(value)
                            .unwrap_or_else(|| value.clone()),
                        FieldKind::EnumStr => value
                            .as_str()
                            .map(|s| Value::from(self.dialect.revert_enum_value(s)))
                            .unwrap_or_else(|| value.clone()),
                        _ => value.clone(),
                    };
                    out.set(spec.name.to_owned(), canonical);
                }
                None => {
                    self.count_unknown(type_name, wire_name);
                    out.set(wire_name.clone(), value.clone());
                }
            }
        }
        out
    }

    fn count_unknown(&self, type_name: &str, field: &str) {
        self.unknown_fields.fetch_add(1, Ordering::Relaxed);
        debug!(dialect = %self.dialect, type_name, field, "unknown field passed through");
    }
}

// ---------------------------------------------------------------------------
// Case conversion helpers
// ---------------------------------------------------------------------------

pub fn snake_to_pascal(s: &str) -> String {
    s.split('_').map(capitalize).collect()
}

pub fn snake_to_camel(s: &str) -> String {
    let mut parts = s.split('_');
    let mut out = String::with_capacity(s.len());
    if let Some(first) = parts.next() {
        out.push_str(first);
    }
    for part in parts {
        out.push_str(&capitalize(part));
    }
    out
}

pub fn pascal_to_snake(s: &str) -> String {
    camel_to_snake(s)
}

pub fn camel_to_snake(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    let mut prev_lower = false;
    for c in s.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

fn capitalize(part: &str) -> String {
    let mut chars = part.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}
