// HTTP API for token custody

pub mod tokens;

pub use tokens::{create_token_router, AppError, TokenAppState};
