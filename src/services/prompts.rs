use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::db::DbPool;
use crate::errors::ApiError;
use crate::models::{Prompt, PromptCategory, PromptExecution};
use crate::repo;

#[derive(Debug, Clone, Deserialize)]
pub struct NewPrompt {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: PromptCategory,
    pub system_prompt: String,
    pub user_prompt_template: String,
    #[serde(default = "empty_schema")]
    pub variables_schema: Value,
    #[serde(default)]
    pub preferred_model_id: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i32,
}

fn empty_schema() -> Value {
    serde_json::json!({})
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> i32 {
    2000
}

/// Changes stored as a new version of the prompt
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptUpdate {
    #[serde(default, deserialize_with = "super::nullable")]
    pub description: Option<Option<String>>,
    pub system_prompt: Option<String>,
    pub user_prompt_template: Option<String>,
    pub variables_schema: Option<Value>,
    #[serde(default, deserialize_with = "super::nullable")]
    pub preferred_model_id: Option<Option<String>>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderedPrompt {
    pub prompt_id: String,
    pub execution_id: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f64,
    pub max_tokens: i32,
    pub preferred_model_id: Option<String>,
}

fn check_settings(temperature: f64, max_tokens: i32) -> Result<(), ApiError> {
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ApiError::Validation("temperature must be between 0 and 2".into()));
    }
    if !(1..=32_000).contains(&max_tokens) {
        return Err(ApiError::Validation("max_tokens must be between 1 and 32000".into()));
    }
    Ok(())
}

fn check_model(pool: &DbPool, model_id: Option<&str>) -> Result<(), ApiError> {
    if let Some(model_id) = model_id {
        if repo::get_llm_model(pool, model_id)?.is_none() {
            return Err(ApiError::Validation(format!("unknown model {model_id}")));
        }
    }
    Ok(())
}

/// Replaces `{{name}}` placeholders with the matching variable
///
/// Whitespace inside the braces is ignored. Placeholders without a value
/// are left as they are.
pub fn substitute(template: &str, variables: &serde_json::Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = after[..end].trim();
        match variables.get(name) {
            Some(Value::String(text)) => out.push_str(text),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

#[instrument(skip(pool, new), fields(name = %new.name))]
pub fn create(pool: &DbPool, new: NewPrompt) -> Result<Prompt, ApiError> {
    let name = new.name.trim().to_string();
    if !(1..=100).contains(&name.chars().count()) {
        return Err(ApiError::Validation("prompt name must be 1-100 characters".into()));
    }
    check_settings(new.temperature, new.max_tokens)?;
    check_model(pool, new.preferred_model_id.as_deref())?;
    if repo::get_active_prompt_by_name(pool, &name)?.is_some() {
        return Err(ApiError::Conflict(format!("prompt {name} already exists")));
    }

    let mut prompt = Prompt::new(
        name,
        new.description,
        new.category,
        new.system_prompt,
        new.user_prompt_template,
        new.variables_schema,
        new.temperature,
        new.max_tokens,
    );
    prompt.preferred_model_id = new.preferred_model_id;
    Ok(repo::insert_prompt(pool, prompt)?)
}

pub fn get(pool: &DbPool, prompt_id: &str) -> Result<Prompt, ApiError> {
    repo::get_prompt(pool, prompt_id)?.ok_or(ApiError::NotFound("Prompt"))
}

pub fn list(pool: &DbPool, category: Option<PromptCategory>, active_only: bool) -> Result<Vec<Prompt>, ApiError> {
    Ok(repo::list_prompts(pool, category, active_only)?)
}

/// Stores the changes as a new active version
///
/// Only the active version of a prompt can be updated.
#[instrument(skip(pool, update))]
pub fn update(pool: &DbPool, prompt_id: &str, update: PromptUpdate) -> Result<Prompt, ApiError> {
    let current = get(pool, prompt_id)?;
    if !current.is_active {
        return Err(ApiError::Validation("only the active version of a prompt can be updated".into()));
    }

    let mut next = current.next_version();
    if let Some(description) = update.description {
        next.description = description;
    }
    if let Some(system_prompt) = update.system_prompt {
        next.system_prompt = system_prompt;
    }
    if let Some(template) = update.user_prompt_template {
        next.user_prompt_template = template;
    }
    if let Some(schema) = update.variables_schema {
        next.variables_schema = crate::models::JsonValue(schema);
    }
    if let Some(model_id) = update.preferred_model_id {
        check_model(pool, model_id.as_deref())?;
        next.preferred_model_id = model_id;
    }
    next.temperature = update.temperature.unwrap_or(next.temperature);
    next.max_tokens = update.max_tokens.unwrap_or(next.max_tokens);
    check_settings(next.temperature, next.max_tokens)?;

    Ok(repo::insert_prompt_version(pool, prompt_id, next)?)
}

pub fn delete(pool: &DbPool, prompt_id: &str) -> Result<(), ApiError> {
    if !repo::delete_prompt(pool, prompt_id)? {
        return Err(ApiError::NotFound("Prompt"));
    }
    Ok(())
}

/// The version chain ending at `prompt_id`, newest first
pub fn versions(pool: &DbPool, prompt_id: &str) -> Result<Vec<Prompt>, ApiError> {
    let chain = repo::prompt_versions(pool, prompt_id)?;
    if chain.is_empty() {
        return Err(ApiError::NotFound("Prompt"));
    }
    Ok(chain)
}

/// Renders both templates with `variables` and records the execution
#[instrument(skip(pool, variables))]
pub fn render(pool: &DbPool, user_id: &str, prompt_id: &str, variables: Value) -> Result<RenderedPrompt, ApiError> {
    let prompt = get(pool, prompt_id)?;
    let Value::Object(map) = &variables else {
        return Err(ApiError::Validation("variables must be an object".into()));
    };

    let missing: Vec<String> = prompt
        .required_variables()
        .into_iter()
        .filter(|name| map.get(name).is_none_or(Value::is_null))
        .collect();
    if !missing.is_empty() {
        return Err(ApiError::Validation(format!("missing required variables: {}", missing.join(", "))));
    }

    let system_prompt = substitute(&prompt.system_prompt, map);
    let user_prompt = substitute(&prompt.user_prompt_template, map);

    let execution = PromptExecution::new(
        Some(prompt.id.clone()),
        Some(user_id.to_string()),
        system_prompt.clone(),
        user_prompt.clone(),
        variables.clone(),
    );
    repo::insert_prompt_execution(pool, &execution)?;
    debug!("Rendered prompt {} v{}", prompt.name, prompt.version);

    Ok(RenderedPrompt {
        prompt_id: prompt.id,
        execution_id: execution.id,
        system_prompt,
        user_prompt,
        temperature: prompt.temperature,
        max_tokens: prompt.max_tokens,
        preferred_model_id: prompt.preferred_model_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{seed_user, setup_test_db};
    use serde_json::json;

    fn summary_prompt() -> NewPrompt {
        serde_json::from_value(json!({
            "name": "summary",
            "category": "generation",
            "system_prompt": "You write {{ style }} flashcards.",
            "user_prompt_template": "Topic: {{topic}}. Count: {{count}}.",
            "variables_schema": { "required": ["topic"] }
        }))
        .unwrap()
    }

    #[test]
    fn test_substitute() {
        let vars = json!({ "a": "x", "n": 3 });
        let vars = vars.as_object().unwrap();
        assert_eq!(substitute("{{a}}-{{ n }}-{{missing}}", vars), "x-3-{{missing}}");
        assert_eq!(substitute("open {{a", vars), "open {{a");
        assert_eq!(substitute("no placeholders", vars), "no placeholders");
    }

    #[test]
    fn test_create_rejects_duplicate_active_name() {
        let pool = setup_test_db();
        let prompt = create(&pool, summary_prompt()).unwrap();
        assert_eq!(prompt.version, 1);
        assert_eq!(prompt.max_tokens, 2000);

        assert!(matches!(create(&pool, summary_prompt()), Err(ApiError::Conflict(_))));

        let mut hot = summary_prompt();
        hot.name = "hot".into();
        hot.temperature = 3.0;
        assert!(matches!(create(&pool, hot), Err(ApiError::Validation(_))));
    }

    #[test]
    fn test_update_creates_linked_version() {
        let pool = setup_test_db();
        let first = create(&pool, summary_prompt()).unwrap();

        let update_req = PromptUpdate { system_prompt: Some("Be brief.".into()), ..Default::default() };
        let second = update(&pool, &first.id, update_req).unwrap();

        assert_eq!(second.version, 2);
        assert_eq!(second.parent_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(second.user_prompt_template, first.user_prompt_template);
        assert!(!get(&pool, &first.id).unwrap().is_active);

        let chain: Vec<i32> = versions(&pool, &second.id).unwrap().iter().map(|p| p.version).collect();
        assert_eq!(chain, vec![2, 1]);

        assert!(matches!(
            update(&pool, &first.id, PromptUpdate::default()),
            Err(ApiError::Validation(_))
        ));
        assert_eq!(list(&pool, Some(PromptCategory::Generation), true).unwrap().len(), 1);
        assert_eq!(list(&pool, None, false).unwrap().len(), 2);
    }

    #[test]
    fn test_render_checks_required_and_records_execution() {
        let pool = setup_test_db();
        let user = seed_user(&pool, "render@example.com");
        let prompt = create(&pool, summary_prompt()).unwrap();

        let err = render(&pool, &user.get_id(), &prompt.id, json!({ "count": 3 })).unwrap_err();
        assert!(err.to_string().contains("topic"));

        let rendered = render(
            &pool,
            &user.get_id(),
            &prompt.id,
            json!({ "topic": "Borrowing", "count": 3, "style": "short" }),
        )
        .unwrap();
        assert_eq!(rendered.system_prompt, "You write short flashcards.");
        assert_eq!(rendered.user_prompt, "Topic: Borrowing. Count: 3.");

        let executions = repo::list_prompt_executions(&pool, &prompt.id).unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].id, rendered.execution_id);
    }

    #[test]
    fn test_delete() {
        let pool = setup_test_db();
        let prompt = create(&pool, summary_prompt()).unwrap();
        delete(&pool, &prompt.id).unwrap();
        assert!(matches!(delete(&pool, &prompt.id), Err(ApiError::NotFound(_))));
        assert!(matches!(versions(&pool, &prompt.id), Err(ApiError::NotFound(_))));
    }
}
