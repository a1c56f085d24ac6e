//! Service layer.
//!
//! Handlers call into these functions after extracting the current user.
//! Services enforce ownership and business rules on top of the repository
//! layer and report failures as `ApiError`.

pub mod cards;
pub mod chat;
pub mod decks;
pub mod prompts;
pub mod sync;
pub mod templates;
pub mod users;

use serde::{Deserialize, Deserializer};

use crate::errors::ApiError;

/// Largest page any list operation returns
pub const MAX_PAGE_SIZE: i64 = 100;

/// Checks an offset/limit pair
pub fn check_page(offset: i64, limit: i64) -> Result<(), ApiError> {
    if offset < 0 {
        return Err(ApiError::Validation("offset must not be negative".into()));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(ApiError::Validation(format!("limit must be between 1 and {MAX_PAGE_SIZE}")));
    }
    Ok(())
}

/// A page of results with the total number of matches
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

/// Outcome of a bulk operation where items succeed or fail independently
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct BulkOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<BulkFailure>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BulkFailure {
    pub id: String,
    pub error: String,
}

/// Deserializes a present field into `Some`, keeping JSON `null` apart
/// from a missing field (`#[serde(default)]` yields `None`)
pub fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
