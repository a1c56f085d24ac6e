use crate::models::Card;

const QUESTION_KEYS: &[&str] = &["Front", "front", "Text", "text"];
const ANSWER_KEYS: &[&str] = &["Back", "back", "Extra", "extra"];

fn first_present<'a>(fields: &'a serde_json::Map<String, serde_json::Value>, keys: &[&'a str]) -> Option<&'a str> {
    keys.iter()
        .copied()
        .find(|key| fields.get(*key).and_then(|v| v.as_str()).is_some_and(|v| !v.is_empty()))
}

fn capitalize(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn value_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Builds the text embedded for a card from its fields and tags
///
/// The question comes first, then the answer, then any other field as
/// `Key: value`, then the tags.
pub fn fields_text(fields: &serde_json::Value, tags: &[String]) -> String {
    let mut parts = Vec::new();
    let empty = serde_json::Map::new();
    let map = fields.as_object().unwrap_or(&empty);

    let question_key = first_present(map, QUESTION_KEYS);
    let answer_key = first_present(map, ANSWER_KEYS);

    if let Some(value) = question_key.and_then(|k| map.get(k)).and_then(value_text) {
        parts.push(format!("Question: {value}"));
    }
    if let Some(value) = answer_key.and_then(|k| map.get(k)).and_then(value_text) {
        parts.push(format!("Answer: {value}"));
    }

    for (key, value) in map {
        if Some(key.as_str()) == question_key || Some(key.as_str()) == answer_key {
            continue;
        }
        if let Some(value) = value_text(value) {
            parts.push(format!("{}: {}", capitalize(key), value));
        }
    }

    if !tags.is_empty() {
        parts.push(format!("Tags: {}", tags.join(", ")));
    }

    parts.join("\n")
}

pub fn card_text(card: &Card) -> String {
    fields_text(card.get_fields(), card.get_tags())
}

/// Lowercased alphanumeric words, used by keyword search
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_card_text() {
        let text = fields_text(
            &json!({"Front": "What is Rust?", "Back": "A language", "source": "book"}),
            &["lang".to_string(), "sys".to_string()],
        );
        assert_eq!(
            text,
            "Question: What is Rust?\nAnswer: A language\nSource: book\nTags: lang, sys"
        );
    }

    #[test]
    fn test_cloze_card_text() {
        let text = fields_text(&json!({"Text": "{{c1::Ownership}} moves values", "Extra": ""}), &[]);
        assert_eq!(text, "Question: {{c1::Ownership}} moves values");
    }

    #[test]
    fn test_empty_fields() {
        assert_eq!(fields_text(&json!({}), &[]), "");
        assert_eq!(fields_text(&json!("not an object"), &["t".into()]), "Tags: t");
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Borrow-checker, RUST!"), vec!["borrow", "checker", "rust"]);
        assert_eq!(tokenize("Привет мир"), vec!["привет", "мир"]);
    }
}
