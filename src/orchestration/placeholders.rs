//! Placeholder resolution for step config.
//!
//! A string of the exact form `{name}` is replaced by the referenced value, keeping its
//! JSON type. Placeholders embedded in a longer string are substituted textually.
//!
//! - `{step_name.key}` reads `key` from the outputs recorded by an earlier step
//! - `{key}` reads the job definition's `variables`
//!
//! Unknown references, and references to empty strings, are left untouched.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// Values placeholders may refer to
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderScope<'a> {
    pub variables: Option<&'a Map<String, Value>>,
    pub outputs: Option<&'a HashMap<String, Map<String, Value>>>,
}

impl<'a> PlaceholderScope<'a> {
    pub fn new(
        variables: &'a Map<String, Value>,
        outputs: &'a HashMap<String, Map<String, Value>>,
    ) -> Self {
        Self {
            variables: Some(variables),
            outputs: Some(outputs),
        }
    }

    fn lookup(&self, reference: &str) -> Option<&'a Value> {
        let value = match reference.split_once('.') {
            Some((step, key)) => self
                .outputs
                .and_then(|outputs| outputs.get(step))
                .and_then(|values| values.get(key))
                .or_else(|| self.variables.and_then(|vars| vars.get(reference))),
            None => self.variables.and_then(|vars| vars.get(reference)),
        }?;
        match value {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            other => Some(other),
        }
    }
}

/// Resolve every placeholder in `value`, recursing into arrays and objects
pub fn resolve(value: &Value, scope: &PlaceholderScope<'_>) -> Value {
    match value {
        Value::String(s) => resolve_string(s, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, scope: &PlaceholderScope<'_>) -> Value {
    if let Some(reference) = whole_reference(s) {
        return scope
            .lookup(reference)
            .cloned()
            .unwrap_or_else(|| Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_reference(&after[..close]) => {
                let reference = &after[..close];
                match scope.lookup(reference) {
                    Some(Value::String(text)) => out.push_str(text),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {
                        out.push('{');
                        out.push_str(reference);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

fn whole_reference(s: &str) -> Option<&str> {
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    is_reference(inner).then_some(inner)
}

fn is_reference(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixtures() -> (Map<String, Value>, HashMap<String, Map<String, Value>>) {
        let mut variables = Map::new();
        variables.insert("api-key".to_string(), json!("secret"));
        variables.insert("empty".to_string(), json!(""));

        let mut crawl = Map::new();
        crawl.insert("count".to_string(), json!(12));
        crawl.insert("host".to_string(), json!("example.com"));
        let mut outputs = HashMap::new();
        outputs.insert("crawl".to_string(), crawl);
        (variables, outputs)
    }

    #[test]
    fn test_whole_value_keeps_json_type() {
        let (variables, outputs) = fixtures();
        let scope = PlaceholderScope::new(&variables, &outputs);
        let resolved = resolve(
            &json!({"n": "{crawl.count}", "key": "{api-key}", "list": ["{crawl.host}"]}),
            &scope,
        );
        assert_eq!(resolved, json!({"n": 12, "key": "secret", "list": ["example.com"]}));
    }

    #[test]
    fn test_embedded_placeholders_are_substituted() {
        let (variables, outputs) = fixtures();
        let scope = PlaceholderScope::new(&variables, &outputs);
        assert_eq!(
            resolve(&json!("https://{crawl.host}/page?n={crawl.count}"), &scope),
            json!("https://example.com/page?n=12")
        );
    }

    #[test]
    fn test_unresolved_placeholders_are_left_as_is() {
        let (variables, outputs) = fixtures();
        let scope = PlaceholderScope::new(&variables, &outputs);
        for raw in ["{missing}", "{empty}", "{crawl.nope}", "{not a ref}", "a {b", "{}"] {
            assert_eq!(resolve(&json!(raw), &scope), json!(raw), "{raw}");
        }
        assert_eq!(resolve(&json!(42), &scope), json!(42));
    }
}
