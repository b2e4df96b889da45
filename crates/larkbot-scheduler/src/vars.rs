//! `${var}` substitution into action and step configs.
//!
//! - `"${fetch.body}"` (the whole string) is replaced by the referenced value
//!   with its JSON type intact.
//! - `"Hello ${user.name}!"` interpolates; strings are inserted raw, other
//!   values as compact JSON.
//! - Unresolved references are left as written.

use serde_json::{Map, Value};

use crate::expression::lookup;

/// Substitute every `${path}` in `value` against `context`, recursing into
/// arrays and objects. Object keys are not substituted.
pub fn substitute(value: &Value, context: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => substitute_str(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str(s: &str, context: &Map<String, Value>) -> Value {
    if let Some(path) = whole_placeholder(s)
        && let Some(found) = lookup(context, path)
    {
        return found.clone();
    }
    Value::String(interpolate(s, context))
}

/// `Some(path)` when `s` is exactly one `${path}` reference.
fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    (!inner.contains('}') && !inner.contains("${")).then(|| inner.trim())
}

/// Interpolate all `${path}` references in `s` as text.
pub fn interpolate(s: &str, context: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let path = after[..end].trim();
        match lookup(context, path) {
            Some(Value::String(v)) => out.push_str(v),
            Some(v) => out.push_str(&v.to_string()),
            None => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Names of the `${...}` references in `s`, in order.
pub fn references(s: &str) -> Vec<String> {
    let mut refs = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else { break };
        refs.push(after[..end].trim().to_string());
        rest = &after[end + 1..];
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Map<String, Value> {
        match json!({
            "user": {"name": "Lan", "id": 42},
            "items": [1, 2, 3],
            "ok": true
        }) {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let c = ctx();
        assert_eq!(substitute(&json!("${user.id}"), &c), json!(42));
        assert_eq!(substitute(&json!("${items}"), &c), json!([1, 2, 3]));
        assert_eq!(substitute(&json!("${ ok }"), &c), json!(true));
    }

    #[test]
    fn test_interpolation_in_text() {
        let c = ctx();
        assert_eq!(
            substitute(&json!("Hi ${user.name} (#${user.id})"), &c),
            json!("Hi Lan (#42)")
        );
        assert_eq!(interpolate("items=${items}", &c), "items=[1,2,3]");
    }

    #[test]
    fn test_unresolved_left_as_written() {
        let c = ctx();
        assert_eq!(substitute(&json!("${missing}"), &c), json!("${missing}"));
        assert_eq!(interpolate("a ${missing.x} b", &c), "a ${missing.x} b");
        assert_eq!(interpolate("broken ${user.name", &c), "broken ${user.name");
    }

    #[test]
    fn test_nested_structures() {
        let c = ctx();
        let config = json!({
            "url": "https://api.example.com/users/${user.id}",
            "body": {"names": ["${user.name}", "static"]},
            "retries": 3
        });
        let out = substitute(&config, &c);
        assert_eq!(out["url"], "https://api.example.com/users/42");
        assert_eq!(out["body"]["names"][0], "Lan");
        assert_eq!(out["retries"], 3);
    }

    #[test]
    fn test_references() {
        assert_eq!(references("${a} and ${b.c}"), vec!["a", "b.c"]);
        assert!(references("plain").is_empty());
    }
}
