use crate::db::DbPool;
use crate::models::{EmbeddingModel, LlmModel};
use crate::schema::{embedding_models, llm_models};
use anyhow::Result;
use diesel::prelude::*;

/// Lists registered LLM models, optionally only the active ones
pub fn list_llm_models(pool: &DbPool, active_only: bool) -> Result<Vec<LlmModel>> {
    let conn = &mut pool.get()?;

    let mut query = llm_models::table.into_boxed();
    if active_only {
        query = query.filter(llm_models::is_active.eq(true));
    }

    Ok(query.order(llm_models::name.asc()).load::<LlmModel>(conn)?)
}

/// Looks up a registered LLM model by its registry id
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `model_id` - The registry id
///
/// ### Returns
///
/// The model, or None if it is not registered
pub fn get_llm_model(pool: &DbPool, model_id: &str) -> Result<Option<LlmModel>> {
    let conn = &mut pool.get()?;

    let model = llm_models::table
        .find(model_id)
        .first::<LlmModel>(conn)
        .optional()?;

    Ok(model)
}

pub fn list_embedding_models(pool: &DbPool, active_only: bool) -> Result<Vec<EmbeddingModel>> {
    let conn = &mut pool.get()?;

    let mut query = embedding_models::table.into_boxed();
    if active_only {
        query = query.filter(embedding_models::is_active.eq(true));
    }

    Ok(query
        .order(embedding_models::name.asc())
        .load::<EmbeddingModel>(conn)?)
}

pub fn get_embedding_model(pool: &DbPool, model_id: &str) -> Result<Option<EmbeddingModel>> {
    let conn = &mut pool.get()?;

    let model = embedding_models::table
        .find(model_id)
        .first::<EmbeddingModel>(conn)
        .optional()?;

    Ok(model)
}
