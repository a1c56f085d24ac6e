use crate::db::DbPool;
use crate::models::RefreshToken;
use crate::schema::refresh_tokens;
use anyhow::Result;
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;

/// Stores an issued refresh token
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `token` - The token row, including its expiry
pub fn store_refresh_token(pool: &DbPool, token: &RefreshToken) -> Result<()> {
    let conn = &mut pool.get()?;

    diesel::insert_into(refresh_tokens::table)
        .values(token)
        .execute(conn)?;

    Ok(())
}

/// Looks up a refresh token by its value
///
/// Revoked and expired tokens are returned too; the caller decides.
///
/// ### Returns
///
/// The token row, or None if the value was never issued
pub fn find_refresh_token(pool: &DbPool, token: &str) -> Result<Option<RefreshToken>> {
    let conn = &mut pool.get()?;

    let found = refresh_tokens::table
        .filter(refresh_tokens::token.eq(token))
        .first::<RefreshToken>(conn)
        .optional()?;

    Ok(found)
}

/// Revokes a single token
///
/// ### Returns
///
/// `true` if the token existed and was not already revoked
pub fn revoke_refresh_token(pool: &DbPool, token: &str) -> Result<bool> {
    let conn = &mut pool.get()?;

    let affected = diesel::update(
        refresh_tokens::table
            .filter(refresh_tokens::token.eq(token))
            .filter(refresh_tokens::revoked_at.is_null()),
    )
    .set(refresh_tokens::revoked_at.eq(Some(Utc::now().naive_utc())))
    .execute(conn)?;

    Ok(affected > 0)
}

/// Revokes every live token of a user
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `user_id` - The user logging out everywhere
///
/// ### Returns
///
/// The number of tokens revoked
pub fn revoke_all_for_user(pool: &DbPool, user_id: &str) -> Result<usize> {
    let conn = &mut pool.get()?;

    let affected = diesel::update(
        refresh_tokens::table
            .filter(refresh_tokens::user_id.eq(user_id))
            .filter(refresh_tokens::revoked_at.is_null()),
    )
    .set(refresh_tokens::revoked_at.eq(Some(Utc::now().naive_utc())))
    .execute(conn)?;

    Ok(affected)
}

/// Deletes tokens that expired before `now`
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `now` - The cut-off time
///
/// ### Returns
///
/// The number of tokens deleted
pub fn purge_expired_tokens(pool: &DbPool, now: NaiveDateTime) -> Result<usize> {
    let conn = &mut pool.get()?;

    let deleted = diesel::delete(refresh_tokens::table.filter(refresh_tokens::expires_at.lt(now)))
        .execute(conn)?;

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::repo::create_user;
    use crate::repo::tests::setup_test_db;
    use chrono::Duration;

    #[test]
    fn test_revoke_and_lookup() {
        let pool = setup_test_db();
        let user = create_user(&pool, User::new("t@example.com".into(), "h".into(), "T".into())).unwrap();
        let expires = Utc::now().naive_utc() + Duration::days(1);

        store_refresh_token(&pool, &RefreshToken::new(user.get_id(), "tok-1".into(), expires)).unwrap();
        store_refresh_token(&pool, &RefreshToken::new(user.get_id(), "tok-2".into(), expires)).unwrap();

        assert!(revoke_refresh_token(&pool, "tok-1").unwrap());
        assert!(!revoke_refresh_token(&pool, "tok-1").unwrap());

        let stored = find_refresh_token(&pool, "tok-1").unwrap().unwrap();
        assert!(!stored.is_usable(Utc::now().naive_utc()));

        assert_eq!(revoke_all_for_user(&pool, &user.get_id()).unwrap(), 1);
        assert!(find_refresh_token(&pool, "missing").unwrap().is_none());
    }

    #[test]
    fn test_purge_expired() {
        let pool = setup_test_db();
        let user = create_user(&pool, User::new("t@example.com".into(), "h".into(), "T".into())).unwrap();
        let past = Utc::now().naive_utc() - Duration::hours(1);
        let future = Utc::now().naive_utc() + Duration::hours(1);

        store_refresh_token(&pool, &RefreshToken::new(user.get_id(), "old".into(), past)).unwrap();
        store_refresh_token(&pool, &RefreshToken::new(user.get_id(), "new".into(), future)).unwrap();

        assert_eq!(purge_expired_tokens(&pool, Utc::now().naive_utc()).unwrap(), 1);
        assert!(find_refresh_token(&pool, "new").unwrap().is_some());
    }
}
