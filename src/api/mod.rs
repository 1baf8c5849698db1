pub mod branch_handlers;
pub mod data_handlers;
pub mod diff_handlers;
pub mod handlers;
pub mod merge_handlers;
pub mod routes;
pub mod user_extractor;

pub use handlers::{AppContext, AppState, ErrorResponse, SessionRegistry};
pub use routes::create_router;
pub use user_extractor::SessionId;
