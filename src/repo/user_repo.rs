use crate::db::DbPool;
use crate::models::{JsonValue, User, UserPreferences};
use crate::schema::users;
use anyhow::Result;
use chrono::Utc;
use diesel::prelude::*;
use tracing::{debug, instrument};

/// Inserts a new user
///
/// ### Errors
///
/// Returns an error if the email is already taken (unique constraint) or
/// the database is unavailable.
#[instrument(skip(pool, user), fields(email = %user.get_email()))]
pub fn create_user(pool: &DbPool, user: User) -> Result<User> {
    let conn = &mut pool.get()?;

    diesel::insert_into(users::table)
        .values(&user)
        .execute(conn)?;

    debug!("Inserted user {}", user.get_id());
    Ok(user)
}

/// Retrieves a non-deleted user by id
pub fn get_user(pool: &DbPool, user_id: &str) -> Result<Option<User>> {
    let conn = &mut pool.get()?;

    let user = users::table
        .find(user_id)
        .filter(users::deleted_at.is_null())
        .first::<User>(conn)
        .optional()?;

    Ok(user)
}

/// Retrieves a non-deleted user by (lowercase) email
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `email` - The email, already lowercased by the caller
///
/// ### Returns
///
/// The user, or None if no live account uses that email
pub fn get_user_by_email(pool: &DbPool, email: &str) -> Result<Option<User>> {
    let conn = &mut pool.get()?;

    let user = users::table
        .filter(users::email.eq(email))
        .filter(users::deleted_at.is_null())
        .first::<User>(conn)
        .optional()?;

    Ok(user)
}

/// Lists live users ordered by creation time
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `offset` - Number of users to skip
/// * `limit` - Maximum number of users to return
///
/// ### Returns
///
/// The requested page and the total number of live users
pub fn list_users(pool: &DbPool, offset: i64, limit: i64) -> Result<(Vec<User>, i64)> {
    let conn = &mut pool.get()?;

    let total = users::table
        .filter(users::deleted_at.is_null())
        .count()
        .get_result::<i64>(conn)?;

    let page = users::table
        .filter(users::deleted_at.is_null())
        .order(users::created_at.asc())
        .offset(offset)
        .limit(limit)
        .load::<User>(conn)?;

    Ok((page, total))
}

/// Updates profile fields that are `Some`
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `user_id` - The user to change
/// * `display_name` - New display name, if changing
/// * `email` - New email, if changing
///
/// ### Returns
///
/// The updated user, or None if no live user has that id
///
/// ### Errors
///
/// Returns an error if the new email is already taken (unique constraint)
/// or the database update fails
pub fn update_user_profile(
    pool: &DbPool,
    user_id: &str,
    display_name: Option<String>,
    email: Option<String>,
) -> Result<Option<User>> {
    let conn = &mut pool.get()?;
    let now = Utc::now().naive_utc();

    conn.transaction(|conn| {
        if let Some(display_name) = display_name {
            diesel::update(users::table.find(user_id))
                .set(users::display_name.eq(display_name))
                .execute(conn)?;
        }
        if let Some(email) = email {
            diesel::update(users::table.find(user_id))
                .set(users::email.eq(email))
                .execute(conn)?;
        }
        diesel::update(users::table.find(user_id))
            .set(users::updated_at.eq(now))
            .get_result::<User>(conn)
            .optional()
    })
    .map_err(Into::into)
}

/// Replaces the stored preferences
pub fn update_user_preferences(
    pool: &DbPool,
    user_id: &str,
    preferences: &UserPreferences,
) -> Result<Option<User>> {
    let conn = &mut pool.get()?;
    let value = JsonValue(serde_json::to_value(preferences)?);

    let user = diesel::update(users::table.find(user_id))
        .set((
            users::preferences.eq(value),
            users::updated_at.eq(Utc::now().naive_utc()),
        ))
        .get_result::<User>(conn)
        .optional()?;

    Ok(user)
}

/// Activates or deactivates an account
///
/// ### Returns
///
/// The updated user, or None if no live user has that id
pub fn set_user_active(pool: &DbPool, user_id: &str, active: bool) -> Result<Option<User>> {
    let conn = &mut pool.get()?;

    let user = diesel::update(users::table.find(user_id).filter(users::deleted_at.is_null()))
        .set((
            users::is_active.eq(active),
            users::updated_at.eq(Utc::now().naive_utc()),
        ))
        .get_result::<User>(conn)
        .optional()?;

    Ok(user)
}

/// Soft deletes a user and deactivates the account
///
/// ### Returns
///
/// `true` if a live user was deleted
pub fn soft_delete_user(pool: &DbPool, user_id: &str) -> Result<bool> {
    let conn = &mut pool.get()?;
    let now = Utc::now().naive_utc();

    let affected = diesel::update(users::table.find(user_id).filter(users::deleted_at.is_null()))
        .set((
            users::deleted_at.eq(Some(now)),
            users::is_active.eq(false),
            users::updated_at.eq(now),
        ))
        .execute(conn)?;

    Ok(affected > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::tests::setup_test_db;

    fn user(email: &str) -> User {
        User::new(email.to_string(), "hash".into(), "Tester".into())
    }

    #[test]
    fn test_create_and_get_user() {
        let pool = setup_test_db();
        let created = create_user(&pool, user("a@example.com")).unwrap();

        let by_id = get_user(&pool, &created.get_id()).unwrap().unwrap();
        let by_email = get_user_by_email(&pool, "a@example.com").unwrap().unwrap();

        assert_eq!(by_id.get_id(), created.get_id());
        assert_eq!(by_email.get_id(), created.get_id());
    }

    #[test]
    fn test_duplicate_email_fails() {
        let pool = setup_test_db();
        create_user(&pool, user("a@example.com")).unwrap();
        assert!(create_user(&pool, user("a@example.com")).is_err());
    }

    #[test]
    fn test_update_profile_and_preferences() {
        let pool = setup_test_db();
        let created = create_user(&pool, user("a@example.com")).unwrap();

        let updated = update_user_profile(&pool, &created.get_id(), Some("New".into()), None)
            .unwrap()
            .unwrap();
        assert_eq!(updated.get_display_name(), "New");
        assert_eq!(updated.get_email(), "a@example.com");

        let prefs = UserPreferences {
            preferred_language: "en".into(),
            ..UserPreferences::default()
        };
        let updated = update_user_preferences(&pool, &created.get_id(), &prefs).unwrap().unwrap();
        assert_eq!(updated.get_preferences().preferred_language, "en");
    }

    #[test]
    fn test_soft_delete_hides_user() {
        let pool = setup_test_db();
        let created = create_user(&pool, user("a@example.com")).unwrap();

        assert!(soft_delete_user(&pool, &created.get_id()).unwrap());
        assert!(!soft_delete_user(&pool, &created.get_id()).unwrap());
        assert!(get_user(&pool, &created.get_id()).unwrap().is_none());

        let (page, total) = list_users(&pool, 0, 10).unwrap();
        assert!(page.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn test_set_user_active() {
        let pool = setup_test_db();
        let created = create_user(&pool, user("a@example.com")).unwrap();

        let deactivated = set_user_active(&pool, &created.get_id(), false).unwrap().unwrap();
        assert!(!deactivated.is_active());
        assert!(set_user_active(&pool, "missing", true).unwrap().is_none());
    }
}
