use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::JsonValue;

sql_text_enum! {
    /// What a prompt is used for
    pub enum PromptCategory {
        Generation => "generation",
        FactCheck => "fact_check",
        Chat => "chat",
        Improvement => "improvement",
    }
}

/// A versioned prompt template
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::prompts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Prompt {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: PromptCategory,
    pub system_prompt: String,
    /// User message with `{{variable}}` placeholders
    pub user_prompt_template: String,
    /// `{"required": [...], "properties": {...}}`
    pub variables_schema: JsonValue,
    pub preferred_model_id: Option<String>,
    pub temperature: f64,
    pub max_tokens: i32,
    /// Only the latest version of a prompt is active
    pub is_active: bool,
    pub version: i32,
    /// Previous version, `None` for the first one
    pub parent_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Prompt {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        description: Option<String>,
        category: PromptCategory,
        system_prompt: String,
        user_prompt_template: String,
        variables_schema: serde_json::Value,
        temperature: f64,
        max_tokens: i32,
    ) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            description,
            category,
            system_prompt,
            user_prompt_template,
            variables_schema: JsonValue(variables_schema),
            preferred_model_id: None,
            temperature,
            max_tokens,
            is_active: true,
            version: 1,
            parent_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builds the next version of this prompt, linked back through `parent_id`
    pub fn next_version(&self) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4().to_string(),
            version: self.version + 1,
            parent_id: Some(self.id.clone()),
            is_active: true,
            created_at: now,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Variable names the schema marks as required
    pub fn required_variables(&self) -> Vec<String> {
        self.variables_schema
            .0
            .get("required")
            .and_then(|v| v.as_array())
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A record of one prompt render and, when available, its completion
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::prompt_executions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PromptExecution {
    pub id: String,
    pub prompt_id: Option<String>,
    pub user_id: Option<String>,
    pub rendered_system_prompt: String,
    pub rendered_user_prompt: String,
    pub variables: JsonValue,
    pub response_text: Option<String>,
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub latency_ms: Option<i32>,
    pub created_at: NaiveDateTime,
}

impl PromptExecution {
    pub fn new(
        prompt_id: Option<String>,
        user_id: Option<String>,
        rendered_system_prompt: String,
        rendered_user_prompt: String,
        variables: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt_id,
            user_id,
            rendered_system_prompt,
            rendered_user_prompt,
            variables: JsonValue(variables),
            response_text: None,
            input_tokens: None,
            output_tokens: None,
            latency_ms: None,
            created_at: Utc::now().naive_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_version_links_parent() {
        let prompt = Prompt::new(
            "gen".into(),
            None,
            PromptCategory::Generation,
            "sys".into(),
            "Topic: {{topic}}".into(),
            serde_json::json!({"required": ["topic"]}),
            0.7,
            2000,
        );
        let next = prompt.next_version();
        assert_eq!(next.version, 2);
        assert_eq!(next.parent_id.as_deref(), Some(prompt.id.as_str()));
        assert_ne!(next.id, prompt.id);
        assert_eq!(next.name, prompt.name);
    }

    #[test]
    fn test_required_variables() {
        let prompt = Prompt::new(
            "gen".into(),
            None,
            PromptCategory::Chat,
            "sys".into(),
            "{{a}} {{b}}".into(),
            serde_json::json!({"required": ["a", "b"]}),
            0.7,
            100,
        );
        assert_eq!(prompt.required_variables(), vec!["a".to_string(), "b".to_string()]);
    }
}
