//! provider 输出归一化：转为文本、去首尾空白、脱敏密钥

use serde_json::Value;

/// 密钥替换文本
pub const REDACTED: &str = "[REDACTED]";

/// 把 provider 原始输出转成可进入 trace 的文本
///
/// 字符串原样使用；对象 / 数组优先取 `text` 字段，否则序列化为 JSON。
pub fn normalize_ai_text(output: &Value, secrets: &[String]) -> String {
    let raw = match output {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Object(map) => match map.get("text") {
            Some(Value::String(s)) => s.clone(),
            _ => output.to_string(),
        },
        other => other.to_string(),
    };
    redact_secrets(raw.trim(), secrets)
}

/// 替换所有密钥出现处；较长的密钥先替换，避免前缀残留
pub fn redact_secrets(text: &str, secrets: &[String]) -> String {
    let mut ordered: Vec<&String> = secrets.iter().filter(|s| !s.is_empty()).collect();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.len()));
    let mut out = text.to_string();
    for secret in ordered {
        if out.contains(secret.as_str()) {
            out = out.replace(secret.as_str(), REDACTED);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_string_and_object() {
        assert_eq!(normalize_ai_text(&json!("  hi  "), &[]), "hi");
        assert_eq!(normalize_ai_text(&json!({"text": "done"}), &[]), "done");
        assert_eq!(normalize_ai_text(&json!({"a": 1}), &[]), r#"{"a":1}"#);
        assert_eq!(normalize_ai_text(&Value::Null, &[]), "");
    }

    #[test]
    fn test_redacts_longest_secret_first() {
        let secrets = vec!["sk-1".to_string(), "sk-123".to_string()];
        assert_eq!(
            normalize_ai_text(&json!("key sk-123 and sk-1"), &secrets),
            "key [REDACTED] and [REDACTED]"
        );
    }
}
