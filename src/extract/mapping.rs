//! Declarative JSON-to-row flattening.
//!
//! Each source lists `FieldSpec`s mapping a JSON pointer to an output column.
//! Adding a column is an edit to that list.

use serde_json::Value;

use crate::tabular::Row;

#[derive(Debug, Clone, Copy)]
pub enum Shape {
    Scalar,
    /// Compact JSON text, for nested lists decomposed downstream.
    Json,
    /// List items projected through `item` (a JSON pointer, "" for the item itself)
    /// and joined with `separator`.
    Join {
        item: &'static str,
        separator: &'static str,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub column: &'static str,
    pub path: &'static str,
    pub shape: Shape,
}

pub const fn scalar(column: &'static str, path: &'static str) -> FieldSpec {
    FieldSpec {
        column,
        path,
        shape: Shape::Scalar,
    }
}

pub const fn json(column: &'static str, path: &'static str) -> FieldSpec {
    FieldSpec {
        column,
        path,
        shape: Shape::Json,
    }
}

pub const fn join(
    column: &'static str,
    path: &'static str,
    item: &'static str,
    separator: &'static str,
) -> FieldSpec {
    FieldSpec {
        column,
        path,
        shape: Shape::Join { item, separator },
    }
}

/// Text form of a JSON value as stored in a cell. Null becomes the empty string.
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn joined(value: &Value, item: &str, separator: &str) -> String {
    let project = |v: &Value| -> String {
        let target = if item.is_empty() { Some(v) } else { v.pointer(item) };
        target.map(scalar_text).unwrap_or_default()
    };

    match value {
        Value::Array(items) => items
            .iter()
            .map(project)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(separator),
        Value::Object(_) => project(value),
        other => scalar_text(other),
    }
}

pub fn flatten(record: &Value, fields: &[FieldSpec]) -> Row {
    fields
        .iter()
        .map(|field| {
            let text = match record.pointer(field.path) {
                None | Some(Value::Null) => String::new(),
                Some(value) => match field.shape {
                    Shape::Scalar => scalar_text(value),
                    Shape::Json => value.to_string(),
                    Shape::Join { item, separator } => joined(value, item, separator),
                },
            };
            (field.column.to_string(), text)
        })
        .collect()
}
