//! HTTP and WebSocket surface

pub mod handlers;
pub mod models;
pub mod routes;
pub mod ws;

pub use handlers::{api_error, AppState};
pub use models::{error_codes, ApiError};
pub use routes::build_router;
