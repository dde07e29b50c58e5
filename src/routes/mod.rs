pub mod api_routes;

pub use api_routes::{chat_completions_handler, health_handler, list_models_handler};
