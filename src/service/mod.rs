pub mod chat_service;
pub mod request_builder;
pub mod response_transformer;
pub mod stream_transformer;
pub mod tool_results;

pub use chat_service::{ChatReply, ChatService};
