//! Table schema descriptors, additive schema evolution, and row validation for the
//! durable backend.
//!
//! Field names listed here are a persisted contract: rows already on disk are read back by
//! name, so fields may be added but never renamed or removed.

use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const COL_TIMESTAMP: &str = "Timestamp";
pub const COL_ERROR_MESSAGE: &str = "ErrorMessage";
pub const COL_TUBES: &str = "Tubes";
pub const COL_TUBE_NAME: &str = "TubeName";
pub const COL_TEMPERATURE: &str = "Temperature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Timestamp,
    String,
    Float,
    Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldMode {
    Required,
    Nullable,
    Repeated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
    pub mode: FieldMode,
    /// Sub-fields; only meaningful for `FieldType::Record`.
    pub fields: Vec<SchemaField>,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: FieldType, mode: FieldMode) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode,
            fields: Vec::new(),
        }
    }

    pub fn record(name: impl Into<String>, mode: FieldMode, fields: Vec<SchemaField>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Record,
            mode,
            fields,
        }
    }

    pub fn is_required(&self) -> bool {
        self.mode == FieldMode::Required
    }
}

/// Ordered field list of a table. Evolution is append-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    fields: Vec<SchemaField>,
}

impl TableSchema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Returns this schema with every field of `desired` whose name is absent appended,
    /// plus the names that were added. Existing fields are never removed or reordered.
    pub fn with_missing_fields(&self, desired: &[SchemaField]) -> (TableSchema, Vec<String>) {
        let mut merged = self.fields.clone();
        let mut added = Vec::new();
        for field in desired {
            if merged.iter().any(|f| f.name == field.name) {
                continue;
            }
            added.push(field.name.clone());
            merged.push(field.clone());
        }
        (TableSchema { fields: merged }, added)
    }

    /// Checks a row against the schema: unknown fields, missing or null REQUIRED fields,
    /// and type mismatches are rejected.
    pub fn validate_row(&self, row: &Row) -> Result<(), IngestError> {
        validate_fields(&self.fields, row, "")
    }
}

/// One stored cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    String(String),
    Float(f64),
    /// Microseconds since the Unix epoch, UTC.
    Timestamp(i64),
    Record(Row),
    Repeated(Vec<FieldValue>),
}

/// A wide row keyed by field name.
pub type Row = BTreeMap<String, FieldValue>;

fn validate_fields(fields: &[SchemaField], row: &Row, path: &str) -> Result<(), IngestError> {
    for name in row.keys() {
        if !fields.iter().any(|f| &f.name == name) {
            return Err(IngestError::Rejected(format!(
                "no such field: {}{}",
                path, name
            )));
        }
    }
    for field in fields {
        let value = row.get(&field.name).unwrap_or(&FieldValue::Null);
        validate_value(field, value, path)?;
    }
    Ok(())
}

fn validate_value(field: &SchemaField, value: &FieldValue, path: &str) -> Result<(), IngestError> {
    let full = format!("{}{}", path, field.name);
    match (field.mode, value) {
        (FieldMode::Required, FieldValue::Null) => Err(IngestError::Rejected(format!(
            "missing required field: {}",
            full
        ))),
        (FieldMode::Nullable, FieldValue::Null) | (FieldMode::Repeated, FieldValue::Null) => Ok(()),
        (FieldMode::Repeated, FieldValue::Repeated(items)) => {
            for item in items {
                validate_scalar(field, item, &full)?;
            }
            Ok(())
        }
        (FieldMode::Repeated, _) => Err(IngestError::Rejected(format!(
            "field {} is REPEATED but value is not a list",
            full
        ))),
        (_, v) => validate_scalar(field, v, &full),
    }
}

fn validate_scalar(field: &SchemaField, value: &FieldValue, full: &str) -> Result<(), IngestError> {
    let ok = match (field.field_type, value) {
        (FieldType::Timestamp, FieldValue::Timestamp(_)) => true,
        (FieldType::String, FieldValue::String(_)) => true,
        (FieldType::Float, FieldValue::Float(_)) => true,
        (FieldType::Record, FieldValue::Record(inner)) => {
            return validate_fields(&field.fields, inner, &format!("{}.", full));
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(IngestError::Rejected(format!(
            "field {} expects {:?}, got {}",
            full,
            field.field_type,
            value_kind(value)
        )))
    }
}

fn value_kind(value: &FieldValue) -> &'static str {
    match value {
        FieldValue::Null => "NULL",
        FieldValue::String(_) => "STRING",
        FieldValue::Float(_) => "FLOAT",
        FieldValue::Timestamp(_) => "TIMESTAMP",
        FieldValue::Record(_) => "RECORD",
        FieldValue::Repeated(_) => "REPEATED",
    }
}

/// Schema a freshly created readings table starts with.
pub fn base_fields() -> Vec<SchemaField> {
    vec![SchemaField::new(
        COL_TIMESTAMP,
        FieldType::Timestamp,
        FieldMode::Required,
    )]
}

/// Fields the readings table must carry for writes and reads to work.
pub fn reading_fields() -> Vec<SchemaField> {
    vec![
        SchemaField::new(COL_ERROR_MESSAGE, FieldType::String, FieldMode::Nullable),
        SchemaField::record(
            COL_TUBES,
            FieldMode::Repeated,
            vec![
                SchemaField::new(COL_TUBE_NAME, FieldType::String, FieldMode::Required),
                SchemaField::new(COL_TEMPERATURE, FieldType::Float, FieldMode::Required),
            ],
        ),
    ]
}
