use crate::db::DbPool;
use crate::models::{Prompt, PromptCategory, PromptExecution};
use crate::schema::{prompt_executions, prompts};
use anyhow::Result;
use chrono::Utc;
use diesel::prelude::*;
use tracing::{info, instrument};

/// Inserts a new prompt
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `prompt` - The prompt to insert
///
/// ### Returns
///
/// The inserted prompt
///
/// ### Errors
///
/// Returns an error if an active prompt with the same name already exists
pub fn insert_prompt(pool: &DbPool, prompt: Prompt) -> Result<Prompt> {
    let conn = &mut pool.get()?;

    diesel::insert_into(prompts::table)
        .values(&prompt)
        .execute(conn)?;

    Ok(prompt)
}

pub fn get_prompt(pool: &DbPool, prompt_id: &str) -> Result<Option<Prompt>> {
    let conn = &mut pool.get()?;

    let prompt = prompts::table.find(prompt_id).first::<Prompt>(conn).optional()?;

    Ok(prompt)
}

/// The active version of a prompt by name
pub fn get_active_prompt_by_name(pool: &DbPool, name: &str) -> Result<Option<Prompt>> {
    let conn = &mut pool.get()?;

    let prompt = prompts::table
        .filter(prompts::name.eq(name))
        .filter(prompts::is_active.eq(true))
        .first::<Prompt>(conn)
        .optional()?;

    Ok(prompt)
}

/// Lists prompts ordered by name, then version
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `category` - Only prompts of this category when given
/// * `active_only` - Skip superseded versions
pub fn list_prompts(
    pool: &DbPool,
    category: Option<PromptCategory>,
    active_only: bool,
) -> Result<Vec<Prompt>> {
    let conn = &mut pool.get()?;

    let mut query = prompts::table.into_boxed();
    if let Some(category) = category {
        query = query.filter(prompts::category.eq(category));
    }
    if active_only {
        query = query.filter(prompts::is_active.eq(true));
    }

    let found = query
        .order((prompts::name.asc(), prompts::version.desc()))
        .load::<Prompt>(conn)?;

    Ok(found)
}

/// Stores `next` as the new active version and deactivates `previous`
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `previous_id` - The version being replaced
/// * `next` - The new version, linked to `previous_id` through `parent_id`
///
/// ### Returns
///
/// The stored new version
///
/// ### Errors
///
/// Returns an error if unable to get a connection or either write fails;
/// both writes run in one transaction
#[instrument(skip(pool, next), fields(prompt = %next.name, version = next.version))]
pub fn insert_prompt_version(pool: &DbPool, previous_id: &str, next: Prompt) -> Result<Prompt> {
    let conn = &mut pool.get()?;

    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        diesel::update(prompts::table.find(previous_id))
            .set((
                prompts::is_active.eq(false),
                prompts::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;

        diesel::insert_into(prompts::table)
            .values(&next)
            .execute(conn)?;

        Ok(())
    })?;

    info!("Stored new prompt version");
    Ok(next)
}

/// Walks `parent_id` links from `prompt_id` back to the first version
///
/// ### Returns
///
/// The chain ordered newest first, starting with `prompt_id` itself
pub fn prompt_versions(pool: &DbPool, prompt_id: &str) -> Result<Vec<Prompt>> {
    let conn = &mut pool.get()?;

    let mut chain = Vec::new();
    let mut next_id = Some(prompt_id.to_string());
    while let Some(id) = next_id.take() {
        let Some(prompt) = prompts::table.find(&id).first::<Prompt>(conn).optional()? else {
            break;
        };
        if chain.iter().any(|p: &Prompt| p.id == prompt.id) {
            break;
        }
        next_id = prompt.parent_id.clone();
        chain.push(prompt);
    }

    Ok(chain)
}

pub fn delete_prompt(pool: &DbPool, prompt_id: &str) -> Result<bool> {
    let conn = &mut pool.get()?;

    let deleted = diesel::delete(prompts::table.find(prompt_id)).execute(conn)?;

    Ok(deleted > 0)
}

pub fn insert_prompt_execution(pool: &DbPool, execution: &PromptExecution) -> Result<()> {
    let conn = &mut pool.get()?;

    diesel::insert_into(prompt_executions::table)
        .values(execution)
        .execute(conn)?;

    Ok(())
}

pub fn list_prompt_executions(pool: &DbPool, prompt_id: &str) -> Result<Vec<PromptExecution>> {
    let conn = &mut pool.get()?;

    let found = prompt_executions::table
        .filter(prompt_executions::prompt_id.eq(prompt_id))
        .order(prompt_executions::created_at.desc())
        .load::<PromptExecution>(conn)?;

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::tests::setup_test_db;

    fn prompt(name: &str, category: PromptCategory) -> Prompt {
        Prompt::new(
            name.into(),
            None,
            category,
            "You are helpful".into(),
            "Topic: {{topic}}".into(),
            serde_json::json!({"required": ["topic"]}),
            0.7,
            2000,
        )
    }

    #[test]
    fn test_versions_chain_and_single_active() {
        let pool = setup_test_db();
        let v1 = insert_prompt(&pool, prompt("gen", PromptCategory::Generation)).unwrap();
        let v2 = insert_prompt_version(&pool, &v1.id, v1.next_version()).unwrap();
        let v3 = insert_prompt_version(&pool, &v2.id, v2.next_version()).unwrap();

        let chain = prompt_versions(&pool, &v3.id).unwrap();
        let versions: Vec<_> = chain.iter().map(|p| p.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);

        let active = get_active_prompt_by_name(&pool, "gen").unwrap().unwrap();
        assert_eq!(active.id, v3.id);
        assert_eq!(list_prompts(&pool, None, true).unwrap().len(), 1);
        assert_eq!(list_prompts(&pool, None, false).unwrap().len(), 3);
    }

    #[test]
    fn test_two_active_prompts_with_same_name_conflict() {
        let pool = setup_test_db();
        insert_prompt(&pool, prompt("chat", PromptCategory::Chat)).unwrap();
        assert!(insert_prompt(&pool, prompt("chat", PromptCategory::Chat)).is_err());
    }

    #[test]
    fn test_list_by_category() {
        let pool = setup_test_db();
        insert_prompt(&pool, prompt("a", PromptCategory::Chat)).unwrap();
        insert_prompt(&pool, prompt("b", PromptCategory::FactCheck)).unwrap();

        let found = list_prompts(&pool, Some(PromptCategory::FactCheck), false).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "b");
    }

    #[test]
    fn test_executions_recorded() {
        let pool = setup_test_db();
        let p = insert_prompt(&pool, prompt("gen", PromptCategory::Generation)).unwrap();
        let execution = PromptExecution::new(
            Some(p.id.clone()),
            None,
            "sys".into(),
            "Topic: rust".into(),
            serde_json::json!({"topic": "rust"}),
        );
        insert_prompt_execution(&pool, &execution).unwrap();

        let found = list_prompt_executions(&pool, &p.id).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rendered_user_prompt, "Topic: rust");
    }
}
