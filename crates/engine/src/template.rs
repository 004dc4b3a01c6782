//! `{{key}}` placeholder substitution for human-step text.

use serde_json::{Map, Value};

/// Replace every `{{ key }}` whose key is present in `inputs`.
///
/// String values are inserted bare, anything else as compact JSON.
/// Unknown keys and unterminated braces are left verbatim.
pub fn render(template: &str, inputs: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        match inputs.get(key) {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Map<String, Value> {
        json!({"supplier": "供应商A", "amount": 1200})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn substitutes_known_keys() {
        assert_eq!(
            render("请审核 {{supplier}} 的采购单，金额 {{ amount }} 元", &ctx()),
            "请审核 供应商A 的采购单，金额 1200 元"
        );
    }

    #[test]
    fn unknown_keys_and_open_braces_stay() {
        assert_eq!(render("{{missing}} / {{amount", &ctx()), "{{missing}} / {{amount");
    }

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(render("无占位符", &ctx()), "无占位符");
    }
}
