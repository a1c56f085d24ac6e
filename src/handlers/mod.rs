/// Web API Handlers
///
/// This module contains the handlers for the RESTful API endpoints.
/// Each handler extracts the request data and the authenticated user,
/// calls the matching service, and turns the outcome into a JSON response
/// or an `ApiError`.

mod auth_handlers;
mod user_handlers;
mod deck_handlers;
mod card_handlers;
mod template_handlers;
mod prompt_handlers;
mod model_handlers;
mod rag_handlers;
mod generation_handlers;
mod chat_handlers;
mod sync_handlers;
mod system_handlers;

// Re-export all handlers
pub use auth_handlers::*;
pub use user_handlers::*;
pub use deck_handlers::*;
pub use card_handlers::*;
pub use template_handlers::*;
pub use prompt_handlers::*;
pub use model_handlers::*;
pub use rag_handlers::*;
pub use generation_handlers::*;
pub use chat_handlers::*;
pub use sync_handlers::*;
pub use system_handlers::*;
