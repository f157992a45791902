use serde_json::Value;

/// Text used when an event carries nothing readable.
pub const DEFAULT_CONTENT: &str = "系统事件";

/// One way of pulling display text out of an event body.
pub type ExtractionRule = fn(&Value) -> Option<String>;

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn top_level_message(event: &Value) -> Option<String> {
    non_empty_str(event.get("message"))
}

fn nested_data_text(event: &Value) -> Option<String> {
    non_empty_str(event.get("data").and_then(|d| d.get("text")))
}

fn top_level_text(event: &Value) -> Option<String> {
    non_empty_str(event.get("text"))
}

fn top_level_content(event: &Value) -> Option<String> {
    non_empty_str(event.get("content"))
}

fn top_level_description(event: &Value) -> Option<String> {
    non_empty_str(event.get("description"))
}

/// Rules tried in order; the first match wins.
pub const EXTRACTION_RULES: &[ExtractionRule] = &[
    top_level_message,
    nested_data_text,
    top_level_text,
    top_level_content,
    top_level_description,
];

/// Human-readable text for a NAS event.
pub fn extract_content(event: &Value) -> String {
    extract_with(EXTRACTION_RULES, event)
}

pub fn extract_with(rules: &[ExtractionRule], event: &Value) -> String {
    rules
        .iter()
        .find_map(|rule| rule(event))
        .unwrap_or_else(|| DEFAULT_CONTENT.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_first() {
        let event = json!({"message": "disk full", "text": "ignored", "data": {"text": "ignored"}});
        assert_eq!(extract_content(&event), "disk full");
    }

    #[test]
    fn test_nested_data_text() {
        let event = json!({"data": {"text": "Backup task finished"}, "text": "ignored"});
        assert_eq!(extract_content(&event), "Backup task finished");
    }

    #[test]
    fn test_falls_through_when_data_has_no_text() {
        let event = json!({"data": {"level": "warn"}, "text": "Volume 1 degraded"});
        assert_eq!(extract_content(&event), "Volume 1 degraded");
    }

    #[test]
    fn test_later_deployment_keys() {
        assert_eq!(extract_content(&json!({"content": "c"})), "c");
        assert_eq!(extract_content(&json!({"description": "d"})), "d");
    }

    #[test]
    fn test_non_string_and_blank_values_skipped() {
        let event = json!({"message": 42, "text": "   ", "data": "flat"});
        assert_eq!(extract_content(&event), DEFAULT_CONTENT);
    }

    #[test]
    fn test_text_forwarded_verbatim() {
        let event = json!({"message": "  Volume 1:\n  degraded  \n"});
        assert_eq!(extract_content(&event), "  Volume 1:\n  degraded  \n");
    }

    #[test]
    fn test_default_for_empty_object() {
        assert_eq!(extract_content(&json!({})), DEFAULT_CONTENT);
    }

    #[test]
    fn test_custom_rule_chain() {
        fn title(v: &Value) -> Option<String> {
            v.get("title").and_then(Value::as_str).map(str::to_string)
        }
        let rules: [ExtractionRule; 2] = [title, top_level_message];
        let event = json!({"title": "t", "message": "m"});
        assert_eq!(extract_with(&rules, &event), "t");
        assert_eq!(extract_with(&[], &event), DEFAULT_CONTENT);
    }
}
