/// Repository module
///
/// This module provides the data access layer for the application.
/// Every function takes the connection pool, checks out one connection for
/// the duration of the call and returns `anyhow::Result`. Lookups return
/// `Option` instead of failing when a row is missing.
///
/// Functions are synchronous and never hold a connection across an `.await`.

mod user_repo;
mod token_repo;
mod deck_repo;
mod card_repo;
mod template_repo;
mod prompt_repo;
mod chat_repo;
mod model_repo;
mod job_repo;
mod embedding_repo;
mod sync_repo;

// Re-export all repository functions
pub use user_repo::*;
pub use token_repo::*;
pub use deck_repo::*;
pub use card_repo::*;
pub use template_repo::*;
pub use prompt_repo::*;
pub use chat_repo::*;
pub use model_repo::*;
pub use job_repo::*;
pub use embedding_repo::*;
pub use sync_repo::*;

#[cfg(test)]
pub mod tests {
    use std::sync::Arc;

    use crate::db::{self, DbPool};

    /// Sets up a test database with migrations applied
    ///
    /// Each call gets its own shared in-memory database: plain `:memory:`
    /// would give every pooled connection a separate database, so the
    /// migrated schema would not be visible to the others.
    pub fn setup_test_db() -> Arc<DbPool> {
        let unique_id = uuid::Uuid::new_v4();
        let database_url = format!("file:test_{}?mode=memory&cache=shared", unique_id);
        let pool = db::init_pool(&database_url).expect("Failed to create pool");

        let mut conn = pool.get().expect("Failed to get connection");
        crate::run_migrations(&mut conn).expect("Failed to run migrations");

        Arc::new(pool)
    }
}
