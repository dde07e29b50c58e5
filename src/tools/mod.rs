//! Translation between structured function calling and the XML tag convention
//! the backend model is prompted to follow.

pub mod parser;
pub mod prompt;

pub use parser::{detect, parse_tool_call, Detection, ParseOutcome, ToolMatch};
pub use prompt::{inject_tool_prompt, render_tool_prompt};
