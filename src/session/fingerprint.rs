use sha2::{Digest, Sha256};

/// Number of significant characters of the assistant text that feed the
/// fingerprint.
pub const ASSISTANT_PREFIX_CHARS: usize = 64;

/// The stable features of a first assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssistantFeatures {
    pub tool_names: Vec<String>,
    pub text_prefix: String,
}

impl AssistantFeatures {
    /// Keeps tool names in order plus the first [`ASSISTANT_PREFIX_CHARS`]
    /// lowercase alphanumeric characters of the text, so whitespace,
    /// punctuation, markup and anything past the prefix cannot change the
    /// result.
    pub fn new(text: &str, tool_names: Vec<String>) -> Self {
        let text_prefix = text
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .take(ASSISTANT_PREFIX_CHARS)
            .collect();
        Self { tool_names, text_prefix }
    }
}

fn normalize_user_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Conversation fingerprint over the first user message and the first
/// assistant turn. Pure; hex-encoded SHA-256.
pub fn fingerprint(first_user_text: &str, assistant: &AssistantFeatures) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"user\0");
    hasher.update(normalize_user_text(first_user_text).as_bytes());
    hasher.update(b"\0tools\0");
    for name in &assistant.tool_names {
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(b"text\0");
    hasher.update(assistant.text_prefix.as_bytes());
    format!("{:x}", hasher.finalize())
}
