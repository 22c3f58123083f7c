//! `{placeholder}` template interpolation
//!
//! Response templates and step prompts reference slots and builtin variables
//! with single-brace placeholders: `"Book {origin} to {destination}?"`.
//! Unknown placeholders are left as written so a typo is visible in the
//! rendered output instead of silently vanishing.

use serde_json::Value;
use std::collections::HashMap;

/// Render a template against a variable map
pub fn interpolate(template: &str, vars: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        let mut closed = false;
        for inner in chars.by_ref() {
            if inner == '}' {
                closed = true;
                break;
            }
            name.push(inner);
        }
        match (closed, vars.get(name.as_str())) {
            (true, Some(value)) => out.push_str(&display(value)),
            (true, None) => {
                out.push('{');
                out.push_str(&name);
                out.push('}');
            }
            (false, _) => {
                // Unterminated brace: emit as written.
                out.push('{');
                out.push_str(&name);
            }
        }
    }

    out
}

/// User-facing rendering of a slot value
fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_interpolates_slots() {
        let rendered = interpolate(
            "Fly {origin} to {destination}?",
            &vars(&[("origin", json!("Madrid")), ("destination", json!("Barcelona"))]),
        );
        assert_eq!(rendered, "Fly Madrid to Barcelona?");
    }

    #[test]
    fn test_unknown_placeholder_left_visible() {
        assert_eq!(interpolate("Hello {who}", &vars(&[])), "Hello {who}");
    }

    #[test]
    fn test_numbers_and_nulls() {
        let rendered = interpolate(
            "{n} guests, notes: {none}",
            &vars(&[("n", json!(4)), ("none", Value::Null)]),
        );
        assert_eq!(rendered, "4 guests, notes: ");
    }

    #[test]
    fn test_unterminated_brace_passes_through() {
        assert_eq!(interpolate("odd {brace", &vars(&[])), "odd {brace");
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(interpolate("no placeholders", &vars(&[])), "no placeholders");
    }
}
