use serde_json::{Map, Value};
use tracing::debug;

use crate::extract::mapping::scalar_text;

pub type Object = Map<String, Value>;

/// Object items of a JSON list stored in a cell.
///
/// Text that does not parse, or is not a list, yields nothing; non-object items
/// are dropped. A list wrapped in one extra layer of quotes is unwrapped first.
pub fn parse_nested(raw: &str) -> Vec<Object> {
    let text = raw.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let unquoted;
    let text = if text.len() > 2 && text.starts_with("\"[") && text.ends_with("]\"") {
        unquoted = text[1..text.len() - 1].replace("\\\"", "\"");
        unquoted.as_str()
    } else {
        text
    };

    let value = match serde_json::from_str::<Value>(text) {
        // A list serialized twice decodes to a string holding the list.
        Ok(Value::String(inner)) => serde_json::from_str(&inner).unwrap_or(Value::Null),
        Ok(value) => value,
        Err(e) => {
            debug!("Unparseable nested value: {}", e);
            return Vec::new();
        }
    };

    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Text of `key` in `object`, empty when missing or null.
pub fn text(object: &Object, key: &str) -> String {
    object.get(key).map(scalar_text).unwrap_or_default()
}

/// The object at `key`, if it is one.
pub fn child<'a>(object: &'a Object, key: &str) -> Option<&'a Object> {
    object.get(key).and_then(Value::as_object)
}

/// Non-empty string items of the list at `key`.
pub fn strings(object: &Object, key: &str) -> Vec<String> {
    match object.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_list_of_objects() {
        let items = parse_nested(r#"[{"year": 2024, "cited_by_count": 3}, 7, "x"]"#);
        assert_eq!(items.len(), 1);
        assert_eq!(text(&items[0], "year"), "2024");
    }

    #[test]
    fn unwraps_extra_quotes() {
        let items = parse_nested(r#""[{\"funder\": \"F1\"}]""#);
        assert_eq!(items.len(), 1);
        assert_eq!(text(&items[0], "funder"), "F1");
    }

    #[test]
    fn garbage_and_non_lists_yield_nothing() {
        assert!(parse_nested("not json").is_empty());
        assert!(parse_nested(r#"{"a": 1}"#).is_empty());
        assert!(parse_nested("").is_empty());
    }
}
