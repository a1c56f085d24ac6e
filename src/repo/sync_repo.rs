use crate::db::DbPool;
use crate::models::{SyncRun, SyncState};
use crate::schema::sync_runs;
use anyhow::Result;
use chrono::NaiveDateTime;
use diesel::prelude::*;

/// Inserts a new sync run
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `run` - The run with its per-card states
///
/// ### Returns
///
/// The inserted run
pub fn insert_sync_run(pool: &DbPool, run: SyncRun) -> Result<SyncRun> {
    let conn = &mut pool.get()?;

    diesel::insert_into(sync_runs::table)
        .values(&run)
        .execute(conn)?;

    Ok(run)
}

pub fn get_sync_run(pool: &DbPool, sync_id: &str) -> Result<Option<SyncRun>> {
    let conn = &mut pool.get()?;

    let run = sync_runs::table
        .find(sync_id)
        .first::<SyncRun>(conn)
        .optional()?;

    Ok(run)
}

/// Moves a `pending` run to `in_progress`
///
/// ### Arguments
///
/// * `started_at` - Recorded as the run's start time
///
/// ### Returns
///
/// `false` if the run was not pending, e.g. another request claimed it first
pub fn claim_sync_run(pool: &DbPool, sync_id: &str, started_at: NaiveDateTime) -> Result<bool> {
    let conn = &mut pool.get()?;

    let affected = diesel::update(
        sync_runs::table
            .find(sync_id)
            .filter(sync_runs::state.eq(SyncState::Pending)),
    )
    .set((
        sync_runs::state.eq(SyncState::InProgress),
        sync_runs::started_at.eq(Some(started_at)),
    ))
    .execute(conn)?;

    Ok(affected > 0)
}

/// Writes back every mutable column of a run
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `run` - The run as modified in memory
///
/// ### Errors
///
/// Returns an error if unable to get a connection or the update fails
pub fn save_sync_run(pool: &DbPool, run: &SyncRun) -> Result<()> {
    let conn = &mut pool.get()?;

    diesel::update(sync_runs::table.find(&run.id))
        .set((
            sync_runs::state.eq(run.state),
            sync_runs::synced_cards.eq(run.synced_cards),
            sync_runs::failed_cards.eq(run.failed_cards),
            sync_runs::skipped_cards.eq(run.skipped_cards),
            sync_runs::card_states.eq(&run.card_states),
            sync_runs::errors.eq(&run.errors),
            sync_runs::started_at.eq(run.started_at),
            sync_runs::completed_at.eq(run.completed_at),
        ))
        .execute(conn)?;

    Ok(())
}

/// A user's runs, newest first
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `user_id` - The owner of the runs
/// * `limit` - Maximum number of runs to return
pub fn list_sync_runs(pool: &DbPool, user_id: &str, limit: i64) -> Result<Vec<SyncRun>> {
    let conn = &mut pool.get()?;

    let runs = sync_runs::table
        .filter(sync_runs::user_id.eq(user_id))
        .order(sync_runs::created_at.desc())
        .limit(limit)
        .load::<SyncRun>(conn)?;

    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SyncSource, SyncState, User};
    use crate::repo::create_user;
    use crate::repo::tests::setup_test_db;
    use chrono::Utc;

    #[test]
    fn test_save_and_list_runs() {
        let pool = setup_test_db();
        let user = create_user(&pool, User::new("s@example.com".into(), "h".into(), "S".into())).unwrap();

        let mut run = insert_sync_run(
            &pool,
            SyncRun::new(user.get_id(), SyncSource::Server, serde_json::json!([]), 2),
        )
        .unwrap();
        run.state = SyncState::Completed;
        run.synced_cards = 2;
        run.completed_at = Some(Utc::now().naive_utc());
        save_sync_run(&pool, &run).unwrap();

        let stored = get_sync_run(&pool, &run.id).unwrap().unwrap();
        assert_eq!(stored.state, SyncState::Completed);
        assert_eq!(stored.synced_cards, 2);
        assert_eq!(stored.pending_cards(), 0);

        assert_eq!(list_sync_runs(&pool, &user.get_id(), 10).unwrap().len(), 1);
    }

    #[test]
    fn test_claim_only_once() {
        let pool = setup_test_db();
        let user = create_user(&pool, User::new("c@example.com".into(), "h".into(), "C".into())).unwrap();
        let run = insert_sync_run(
            &pool,
            SyncRun::new(user.get_id(), SyncSource::Server, serde_json::json!([]), 1),
        )
        .unwrap();

        let now = Utc::now().naive_utc();
        assert!(claim_sync_run(&pool, &run.id, now).unwrap());
        assert!(!claim_sync_run(&pool, &run.id, now).unwrap());

        let stored = get_sync_run(&pool, &run.id).unwrap().unwrap();
        assert_eq!(stored.state, SyncState::InProgress);
        assert!(stored.started_at.is_some());
    }
}
