use crate::db::DbPool;
use crate::models::{CardTemplate, TemplateFields};
use crate::schema::card_templates;
use anyhow::Result;
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;

/// Editable columns of a user template
#[derive(AsChangeset, Debug, Clone, Default)]
#[diesel(table_name = card_templates)]
pub struct TemplateChanges {
    pub display_name: Option<String>,
    pub fields_schema: Option<TemplateFields>,
    pub front_template: Option<String>,
    pub back_template: Option<String>,
    pub css: Option<Option<String>>,
    pub updated_at: Option<NaiveDateTime>,
}

pub fn insert_template(pool: &DbPool, template: CardTemplate) -> Result<CardTemplate> {
    let conn = &mut pool.get()?;

    diesel::insert_into(card_templates::table)
        .values(&template)
        .execute(conn)?;

    Ok(template)
}

pub fn get_template(pool: &DbPool, template_id: &str) -> Result<Option<CardTemplate>> {
    let conn = &mut pool.get()?;

    let template = card_templates::table
        .find(template_id)
        .first::<CardTemplate>(conn)
        .optional()?;

    Ok(template)
}

/// Finds a template visible to `owner_id` by name, preferring the user's own
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `owner_id` - The user looking for the template
/// * `name` - The exact template name
///
/// ### Returns
///
/// The user's template with that name, else the system one, else None
pub fn find_template_by_name(
    pool: &DbPool,
    owner_id: &str,
    name: &str,
) -> Result<Option<CardTemplate>> {
    let conn = &mut pool.get()?;

    let template = card_templates::table
        .filter(card_templates::name.eq(name))
        .filter(
            card_templates::owner_id
                .eq(owner_id)
                .or(card_templates::is_system.eq(true)),
        )
        .order(card_templates::is_system.asc())
        .first::<CardTemplate>(conn)
        .optional()?;

    Ok(template)
}

/// Lists the user's templates, and the system ones when requested
pub fn list_templates(
    pool: &DbPool,
    owner_id: &str,
    include_system: bool,
) -> Result<Vec<CardTemplate>> {
    let conn = &mut pool.get()?;

    let mut query = card_templates::table
        .filter(card_templates::owner_id.eq(owner_id.to_string()))
        .into_boxed();
    if include_system {
        query = query.or_filter(card_templates::is_system.eq(true));
    }

    let templates = query
        .order((card_templates::is_system.desc(), card_templates::name.asc()))
        .load::<CardTemplate>(conn)?;

    Ok(templates)
}

/// Applies `changes` to a template
///
/// ### Returns
///
/// The updated template, or None if no template has that id
pub fn update_template(
    pool: &DbPool,
    template_id: &str,
    mut changes: TemplateChanges,
) -> Result<Option<CardTemplate>> {
    let conn = &mut pool.get()?;
    changes.updated_at = Some(Utc::now().naive_utc());

    let template = diesel::update(card_templates::table.find(template_id))
        .set(&changes)
        .get_result::<CardTemplate>(conn)
        .optional()?;

    Ok(template)
}

pub fn delete_template(pool: &DbPool, template_id: &str) -> Result<bool> {
    let conn = &mut pool.get()?;

    let deleted = diesel::delete(card_templates::table.find(template_id)).execute(conn)?;

    Ok(deleted > 0)
}
