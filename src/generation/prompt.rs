use serde_json::Value;

use super::{CardType, Difficulty, GeneratedCard, GenerationRequest};

fn card_type_instruction(card_type: CardType) -> &'static str {
    match card_type {
        CardType::Basic => "Create basic flashcards with a question on the front and answer on the back.",
        CardType::Cloze => "Create cloze deletion cards where key terms are wrapped in {{c1::term}}.",
        CardType::BasicReversed => "Create cards that can be studied in both directions.",
    }
}

fn difficulty_guideline(difficulty: Difficulty) -> &'static str {
    match difficulty {
        Difficulty::Easy => "Focus on fundamental concepts. Use simple language and short answers.",
        Difficulty::Medium => "Cover moderate complexity. Include some details but stay concise.",
        Difficulty::Hard => "Cover advanced topics. Include nuanced details and connections.",
    }
}

pub fn system_prompt(request: &GenerationRequest) -> String {
    format!(
        "You are an expert flashcard creator for Anki. Your task is to create high-quality \
         flashcards that help with learning and retention.\n\n\
         CARD TYPE: {instruction}\n\n\
         DIFFICULTY: {guideline}\n\n\
         LANGUAGE: Create all content in {language}.\n\n\
         GUIDELINES:\n\
         1. Each card should test one concept\n\
         2. Questions should be clear and unambiguous\n\
         3. Answers should be concise but complete\n\
         4. Avoid yes/no questions\n\
         5. Use active recall principles\n\
         6. Include context when necessary\n\n\
         OUTPUT FORMAT:\n\
         Return a JSON array of cards:\n\
         ```json\n\
         [\n  {{\"front\": \"question\", \"back\": \"answer\", \"tags\": [\"tag1\"]}}\n]\n\
         ```",
        instruction = card_type_instruction(request.card_type),
        guideline = difficulty_guideline(request.difficulty),
        language = request.language,
    )
}

/// `contexts` are the retrieved snippets, most relevant first
pub fn user_prompt(request: &GenerationRequest, contexts: &[String]) -> String {
    let mut prompt = format!("Create {} flashcards about: {}", request.num_cards, request.topic);
    if !contexts.is_empty() {
        prompt.push_str("\n\nUSE THIS CONTEXT:\n");
        prompt.push_str(&contexts.join("\n\n"));
    }
    if !request.tags.is_empty() {
        prompt.push_str("\n\nInclude these tags: ");
        prompt.push_str(&request.tags.join(", "));
    }
    prompt
}

/// Body of the first fenced block, with an optional `json` language tag
fn fenced_block(content: &str) -> Option<&str> {
    let start = content.find("```")? + 3;
    let rest = &content[start..];
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

/// From the first `[` to the last `]`
fn bracketed_array(content: &str) -> Option<&str> {
    let start = content.find('[')?;
    let end = content.rfind(']')?;
    (end > start).then(|| &content[start..=end])
}

fn string_field(item: &Value, key: &str) -> Option<String> {
    let text = item.get(key)?.as_str()?.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Extracts cards from a completion
///
/// Looks for a fenced JSON block first, then for a bare array. A single
/// object is treated as a one-element list. Items without both `front` and
/// `back` are dropped; missing tags default to the request tags.
pub fn parse_cards(content: &str, card_type: CardType, default_tags: &[String]) -> Vec<GeneratedCard> {
    let parsed = [fenced_block(content), bracketed_array(content)]
        .into_iter()
        .flatten()
        .find_map(|candidate| serde_json::from_str::<Value>(candidate).ok());

    let items = match parsed {
        Some(Value::Array(items)) => items,
        Some(other @ Value::Object(_)) => vec![other],
        _ => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| {
            let front = string_field(item, "front")?;
            let back = string_field(item, "back")?;
            let tags = match item.get("tags").and_then(Value::as_array) {
                Some(tags) => tags
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                None => default_tags.to_vec(),
            };
            Some(GeneratedCard::new(front, back, card_type, tags))
        })
        .collect()
}
