use serde_json::{Map, Number, Value};
use tracing::warn;
use uuid::Uuid;

use crate::models::{ParsedToolCall, ToolDefinition};

/// Result of scanning model output for a tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// No opening tag of a known tool.
    None,
    /// A known opening tag starts at this byte offset, but the call is not
    /// complete: the closing tag is missing or the body is malformed.
    Candidate { start: usize },
    Complete(ToolMatch),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolMatch {
    pub call: ParsedToolCall,
    /// Byte range of `call.raw_span` within the scanned text.
    pub start: usize,
    pub end: usize,
}

/// Text split around the first complete tool call.
///
/// Without a call, `text_before` holds the whole input untouched and
/// `text_after` is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome {
    pub text_before: String,
    pub call: Option<ParsedToolCall>,
    pub text_after: String,
}

pub fn generate_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

/// Finds the first opening tag of a known tool and tries to complete it.
///
/// Only the first known opening tag is considered: if it never closes, later
/// tags do not turn the text into a call.
pub fn detect(text: &str, tools: &[ToolDefinition]) -> Detection {
    let Some((start, tool)) = find_opening_tag(text, tools) else {
        return Detection::None;
    };

    let body_start = start + tool.name.len() + 2;
    let closing = format!("</{}>", tool.name);
    let Some(close_rel) = text[body_start..].find(&closing) else {
        return Detection::Candidate { start };
    };
    let body_end = body_start + close_rel;
    let end = body_end + closing.len();

    let Some(arguments) = parse_parameters(&text[body_start..body_end], tool) else {
        return Detection::Candidate { start };
    };

    Detection::Complete(ToolMatch {
        call: ParsedToolCall {
            id: generate_call_id(),
            name: tool.name.clone(),
            arguments,
            raw_span: text[start..end].to_string(),
        },
        start,
        end,
    })
}

/// Parses a complete response. Never fails: anything that is not a well-formed
/// invocation of a known tool comes back as plain text.
pub fn parse_tool_call(text: &str, tools: &[ToolDefinition]) -> ParseOutcome {
    match detect(text, tools) {
        Detection::Complete(found) => {
            let after = &text[found.end..];
            if has_tool_invocation(after, tools) {
                warn!(
                    tool = %found.call.name,
                    "Ignoring additional tool invocation after the first"
                );
            }
            ParseOutcome {
                text_before: text[..found.start].trim().to_string(),
                text_after: after.trim().to_string(),
                call: Some(found.call),
            }
        }
        Detection::None | Detection::Candidate { .. } => ParseOutcome {
            text_before: text.to_string(),
            call: None,
            text_after: String::new(),
        },
    }
}

/// Whether `text` opens a tag of any known tool.
pub fn has_tool_invocation(text: &str, tools: &[ToolDefinition]) -> bool {
    find_opening_tag(text, tools).is_some()
}

/// Offset of a trailing fragment that could still grow into a known opening
/// tag, e.g. `"<re"` when a `read` tool exists. Text from this offset on must
/// not be released to the client yet.
pub fn pending_tag_start(text: &str, tools: &[ToolDefinition]) -> Option<usize> {
    let longest = tools.iter().map(|t| t.name.len() + 2).max()?;
    let window_start = text.len().saturating_sub(longest);
    text.match_indices('<')
        .map(|(i, _)| i)
        .filter(|&i| i >= window_start)
        .find(|&i| {
            let fragment = &text[i..];
            tools.iter().any(|t| {
                let tag = format!("<{}>", t.name);
                fragment.len() < tag.len() && tag.starts_with(fragment)
            })
        })
}

fn find_opening_tag<'a>(
    text: &str,
    tools: &'a [ToolDefinition],
) -> Option<(usize, &'a ToolDefinition)> {
    text.match_indices('<').find_map(|(i, _)| {
        let rest = &text[i + 1..];
        tools.iter().find(|t| {
            !t.name.is_empty()
                && rest.starts_with(t.name.as_str())
                && rest[t.name.len()..].starts_with('>')
        })
        .map(|t| (i, t))
    })
}

/// Extracts `<param>value</param>` pairs in order. `None` on mismatched tags.
fn parse_parameters(body: &str, tool: &ToolDefinition) -> Option<Map<String, Value>> {
    let mut arguments = Map::new();
    let mut rest = body;

    while let Some(open) = rest.find('<') {
        let after_lt = &rest[open + 1..];
        if after_lt.starts_with('/') {
            return None;
        }
        let name_len = after_lt.find('>')?;
        let name = &after_lt[..name_len];
        if !is_tag_name(name) {
            return None;
        }

        let value_start = &after_lt[name_len + 1..];
        let closing = format!("</{name}>");
        let value_len = value_start.find(&closing)?;
        let raw_value = &value_start[..value_len];

        let declared = tool.parameter(name).map(|p| p.param_type.as_str());
        arguments.insert(name.to_string(), coerce_value(raw_value, declared));
        rest = &value_start[value_len + closing.len()..];
    }

    Some(arguments)
}

fn is_tag_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

/// Converts a raw tag value according to the declared parameter type.
///
/// Numeric strings against `number`/`integer` become numbers, `true`/`false`
/// against `boolean` become booleans; everything else stays a string.
pub fn coerce_value(raw: &str, declared_type: Option<&str>) -> Value {
    let text = unescape_xml(raw.trim_matches(|c| c == '\n' || c == '\r'));
    let trimmed = text.trim();

    match declared_type {
        Some("integer") | Some("number") => {
            if let Ok(n) = trimmed.parse::<i64>() {
                return Value::Number(n.into());
            }
            if let Some(n) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
                return Value::Number(n);
            }
        }
        Some("boolean") => match trimmed {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        },
        _ => {}
    }

    Value::String(text)
}

fn unescape_xml(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &tail[1..semi];
            let ch = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity.strip_prefix('#').and_then(|num| {
                    let code = match num.strip_prefix(['x', 'X']) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => num.parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }),
            };
            ch.map(|c| (c, semi))
        });

        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
