use std::collections::HashSet;

use serde::Deserialize;
use tracing::{info, instrument};

use crate::db::DbPool;
use crate::errors::ApiError;
use crate::models::{CardTemplate, TemplateField, TemplateFields};
use crate::repo::{self, TemplateChanges};

#[derive(Debug, Clone, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    pub display_name: String,
    pub fields: Vec<TemplateField>,
    pub front_template: String,
    pub back_template: String,
    #[serde(default)]
    pub css: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateUpdate {
    pub display_name: Option<String>,
    pub fields: Option<Vec<TemplateField>>,
    pub front_template: Option<String>,
    pub back_template: Option<String>,
    #[serde(default, deserialize_with = "super::nullable")]
    pub css: Option<Option<String>>,
}

fn check_fields(fields: &[TemplateField]) -> Result<(), ApiError> {
    if fields.is_empty() {
        return Err(ApiError::Validation("a template needs at least one field".into()));
    }
    let mut seen = HashSet::new();
    for field in fields {
        if field.name.trim().is_empty() {
            return Err(ApiError::Validation("field names must not be empty".into()));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(ApiError::Validation(format!("duplicate field {}", field.name)));
        }
    }
    Ok(())
}

/// Loads a template the user may modify
fn editable(pool: &DbPool, user_id: &str, template_id: &str) -> Result<CardTemplate, ApiError> {
    let template = get(pool, user_id, template_id)?;
    if template.is_system {
        return Err(ApiError::PermissionDenied("System templates cannot be modified".into()));
    }
    Ok(template)
}

#[instrument(skip(pool, new), fields(name = %new.name))]
pub fn create(pool: &DbPool, user_id: &str, new: NewTemplate) -> Result<CardTemplate, ApiError> {
    let name = new.name.trim().to_string();
    if !(1..=100).contains(&name.chars().count()) {
        return Err(ApiError::Validation("template name must be 1-100 characters".into()));
    }
    check_fields(&new.fields)?;

    let taken = repo::list_templates(pool, user_id, false)?.iter().any(|t| t.name == name);
    if taken {
        return Err(ApiError::Conflict(format!("template {name} already exists")));
    }

    let template = CardTemplate::new(
        user_id.to_string(),
        name,
        new.display_name,
        new.fields,
        new.front_template,
        new.back_template,
        new.css,
    );
    Ok(repo::insert_template(pool, template)?)
}

/// A system template or one of the user's own
pub fn get(pool: &DbPool, user_id: &str, template_id: &str) -> Result<CardTemplate, ApiError> {
    repo::get_template(pool, template_id)?
        .filter(|template| template.is_visible_to(user_id))
        .ok_or(ApiError::NotFound("Template"))
}

pub fn list(pool: &DbPool, user_id: &str, include_system: bool) -> Result<Vec<CardTemplate>, ApiError> {
    Ok(repo::list_templates(pool, user_id, include_system)?)
}

pub fn update(pool: &DbPool, user_id: &str, template_id: &str, update: TemplateUpdate) -> Result<CardTemplate, ApiError> {
    editable(pool, user_id, template_id)?;

    let fields_schema = match update.fields {
        Some(mut fields) => {
            check_fields(&fields)?;
            fields.sort_by_key(|f| f.order);
            Some(TemplateFields(fields))
        }
        None => None,
    };
    let changes = TemplateChanges {
        display_name: update.display_name,
        fields_schema,
        front_template: update.front_template,
        back_template: update.back_template,
        css: update.css,
        updated_at: None,
    };

    repo::update_template(pool, template_id, changes)?.ok_or(ApiError::NotFound("Template"))
}

/// Deletes an unused user template
#[instrument(skip(pool))]
pub fn delete(pool: &DbPool, user_id: &str, template_id: &str) -> Result<(), ApiError> {
    editable(pool, user_id, template_id)?;
    let in_use = repo::count_cards_with_template(pool, template_id)?;
    if in_use > 0 {
        return Err(ApiError::Conflict(format!("template is used by {in_use} cards")));
    }
    repo::delete_template(pool, template_id)?;
    info!("Deleted template {}", template_id);
    Ok(())
}
