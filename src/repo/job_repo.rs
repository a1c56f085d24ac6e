use crate::db::DbPool;
use crate::models::{GenerationJob, JobStatus, JsonValue};
use crate::schema::generation_jobs;
use anyhow::Result;
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use tracing::{debug, instrument};

/// Progress fields written while a job runs
#[derive(AsChangeset, Debug, Clone, Default)]
#[diesel(table_name = generation_jobs)]
pub struct JobChanges {
    pub status: Option<JobStatus>,
    pub progress: Option<i32>,
    pub current_step: Option<Option<String>>,
    pub cards_generated: Option<i32>,
    pub result: Option<Option<JsonValue>>,
    pub error: Option<Option<String>>,
    pub completed_at: Option<Option<NaiveDateTime>>,
    pub updated_at: Option<NaiveDateTime>,
}

/// Inserts a new generation job
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `job` - The job to insert, normally `pending`
///
/// ### Returns
///
/// The inserted job
#[instrument(skip(pool, job), fields(job_id = %job.get_id()))]
pub fn insert_job(pool: &DbPool, job: GenerationJob) -> Result<GenerationJob> {
    let conn = &mut pool.get()?;

    diesel::insert_into(generation_jobs::table)
        .values(&job)
        .execute(conn)?;

    debug!("Stored generation job");
    Ok(job)
}

pub fn get_job(pool: &DbPool, job_id: &str) -> Result<Option<GenerationJob>> {
    let conn = &mut pool.get()?;

    let job = generation_jobs::table
        .find(job_id)
        .first::<GenerationJob>(conn)
        .optional()?;

    Ok(job)
}

/// Finds a job of `user_id` created with `key` at or after `since`
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `user_id` - The user who started the job
/// * `key` - The client-supplied idempotency key
/// * `since` - Oldest creation time still considered a repeat
///
/// ### Returns
///
/// The most recent matching job, or None
pub fn find_job_by_idempotency_key(
    pool: &DbPool,
    user_id: &str,
    key: &str,
    since: NaiveDateTime,
) -> Result<Option<GenerationJob>> {
    let conn = &mut pool.get()?;

    let job = generation_jobs::table
        .filter(generation_jobs::user_id.eq(user_id))
        .filter(generation_jobs::idempotency_key.eq(key))
        .filter(generation_jobs::created_at.ge(since))
        .order(generation_jobs::created_at.desc())
        .first::<GenerationJob>(conn)
        .optional()?;

    Ok(job)
}

/// A user's jobs, newest first
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `user_id` - The owner of the jobs
/// * `limit` - Maximum number of jobs to return
pub fn list_jobs(pool: &DbPool, user_id: &str, limit: i64) -> Result<Vec<GenerationJob>> {
    let conn = &mut pool.get()?;

    let jobs = generation_jobs::table
        .filter(generation_jobs::user_id.eq(user_id))
        .order(generation_jobs::created_at.desc())
        .limit(limit)
        .load::<GenerationJob>(conn)?;

    Ok(jobs)
}

/// Applies `changes` to a job whatever its status
///
/// ### Returns
///
/// The updated job, or None if no job has that id
pub fn update_job(pool: &DbPool, job_id: &str, mut changes: JobChanges) -> Result<Option<GenerationJob>> {
    let conn = &mut pool.get()?;
    changes.updated_at = Some(Utc::now().naive_utc());

    let job = diesel::update(generation_jobs::table.find(job_id))
        .set(&changes)
        .get_result::<GenerationJob>(conn)
        .optional()?;

    Ok(job)
}

/// Moves a `pending` job to `running`
///
/// ### Returns
///
/// `false` if the job was cancelled (or started) in the meantime
pub fn start_job(pool: &DbPool, job_id: &str) -> Result<bool> {
    let conn = &mut pool.get()?;

    let affected = diesel::update(
        generation_jobs::table
            .find(job_id)
            .filter(generation_jobs::status.eq(JobStatus::Pending)),
    )
    .set((
        generation_jobs::status.eq(JobStatus::Running),
        generation_jobs::updated_at.eq(Utc::now().naive_utc()),
    ))
    .execute(conn)?;

    Ok(affected > 0)
}

/// Applies `changes` only while the job is `running`
///
/// A cancelled job is left alone, so a pipeline racing a cancel cannot
/// overwrite the cancellation.
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `job_id` - The ID of the job
/// * `changes` - Progress, step or result columns to write
///
/// ### Returns
///
/// `true` if the job was running and got updated, `false` otherwise
pub fn update_running_job(pool: &DbPool, job_id: &str, mut changes: JobChanges) -> Result<bool> {
    let conn = &mut pool.get()?;
    changes.updated_at = Some(Utc::now().naive_utc());

    let affected = diesel::update(
        generation_jobs::table
            .find(job_id)
            .filter(generation_jobs::status.eq(JobStatus::Running)),
    )
    .set(&changes)
    .execute(conn)?;

    Ok(affected > 0)
}

/// Moves a job to `cancelled` unless it already reached a terminal state
///
/// ### Returns
///
/// `true` if this call cancelled the job
pub fn cancel_job(pool: &DbPool, job_id: &str) -> Result<bool> {
    let conn = &mut pool.get()?;
    let now = Utc::now().naive_utc();

    let affected = diesel::update(
        generation_jobs::table
            .find(job_id)
            .filter(generation_jobs::status.eq_any([JobStatus::Pending, JobStatus::Running])),
    )
    .set((
        generation_jobs::status.eq(JobStatus::Cancelled),
        generation_jobs::completed_at.eq(Some(now)),
        generation_jobs::updated_at.eq(now),
    ))
    .execute(conn)?;

    Ok(affected > 0)
}

/// Deletes finished jobs created before `before`
///
/// ### Arguments
///
/// * `pool` - A reference to the database connection pool
/// * `before` - Jobs created earlier than this are removed
///
/// ### Returns
///
/// The number of jobs deleted; pending and running jobs are never removed
pub fn prune_jobs(pool: &DbPool, before: NaiveDateTime) -> Result<usize> {
    let conn = &mut pool.get()?;

    let deleted = diesel::delete(
        generation_jobs::table
            .filter(generation_jobs::created_at.lt(before))
            .filter(generation_jobs::status.eq_any([
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ])),
    )
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

    fn user_id(pool: &DbPool) -> String {
        create_user(pool, User::new("j@example.com".into(), "h".into(), "J".into()))
            .unwrap()
            .get_id()
    }

    #[test]
    fn test_idempotency_lookup_respects_window() {
        let pool = setup_test_db();
        let user = user_id(&pool);
        let job = insert_job(
            &pool,
            GenerationJob::new(user.clone(), serde_json::json!({}), Some("key-1".into())),
        )
        .unwrap();

        let day_ago = Utc::now().naive_utc() - Duration::hours(24);
        let found = find_job_by_idempotency_key(&pool, &user, "key-1", day_ago).unwrap();
        assert_eq!(found.map(|j| j.get_id()), Some(job.get_id()));

        let future = Utc::now().naive_utc() + Duration::hours(1);
        assert!(find_job_by_idempotency_key(&pool, &user, "key-1", future).unwrap().is_none());
        assert!(find_job_by_idempotency_key(&pool, &user, "other", day_ago).unwrap().is_none());
    }

    #[test]
    fn test_cancel_only_live_jobs() {
        let pool = setup_test_db();
        let user = user_id(&pool);
        let job = insert_job(&pool, GenerationJob::new(user, serde_json::json!({}), None)).unwrap();

        assert!(cancel_job(&pool, &job.get_id()).unwrap());
        assert!(!cancel_job(&pool, &job.get_id()).unwrap());
        let stored = get_job(&pool, &job.get_id()).unwrap().unwrap();
        assert_eq!(stored.get_status(), JobStatus::Cancelled);
    }

    #[test]
    fn test_update_progress() {
        let pool = setup_test_db();
        let user = user_id(&pool);
        let job = insert_job(&pool, GenerationJob::new(user, serde_json::json!({}), None)).unwrap();

        let changes = JobChanges {
            status: Some(JobStatus::Running),
            progress: Some(50),
            current_step: Some(Some("generate".into())),
            ..Default::default()
        };
        let updated = update_job(&pool, &job.get_id(), changes).unwrap().unwrap();
        assert_eq!(updated.get_progress(), 50);
        assert_eq!(updated.get_current_step().as_deref(), Some("generate"));
    }

    #[test]
    fn test_running_updates_stop_after_cancel() {
        let pool = setup_test_db();
        let user = user_id(&pool);
        let job = insert_job(&pool, GenerationJob::new(user, serde_json::json!({}), None)).unwrap();

        let progress = || JobChanges { progress: Some(20), ..Default::default() };
        assert!(!update_running_job(&pool, &job.get_id(), progress()).unwrap());
        assert!(start_job(&pool, &job.get_id()).unwrap());
        assert!(!start_job(&pool, &job.get_id()).unwrap());
        assert!(update_running_job(&pool, &job.get_id(), progress()).unwrap());

        assert!(cancel_job(&pool, &job.get_id()).unwrap());
        assert!(!update_running_job(&pool, &job.get_id(), progress()).unwrap());
        let stored = get_job(&pool, &job.get_id()).unwrap().unwrap();
        assert_eq!(stored.get_status(), JobStatus::Cancelled);
        assert_eq!(stored.get_progress(), 20);
    }

    #[test]
    fn test_prune_keeps_running_jobs() {
        let pool = setup_test_db();
        let user = user_id(&pool);
        let done = insert_job(&pool, GenerationJob::new(user.clone(), serde_json::json!({}), None)).unwrap();
        insert_job(&pool, GenerationJob::new(user.clone(), serde_json::json!({}), None)).unwrap();
        cancel_job(&pool, &done.get_id()).unwrap();

        let later = Utc::now().naive_utc() + Duration::hours(1);
        assert_eq!(prune_jobs(&pool, later).unwrap(), 1);
        assert_eq!(list_jobs(&pool, &user, 10).unwrap().len(), 1);
    }
}
