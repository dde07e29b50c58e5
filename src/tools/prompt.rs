use std::fmt::Write;

use crate::models::{ParameterSpec, ToolDefinition};

const PREAMBLE: &str = "\
## Tool use

You can call the tools documented below. To call one, reply with an XML block whose \
outer tag is the tool's name and whose child tags are its parameters, one tag per \
parameter:

<tool_name>
<parameter_name>value</parameter_name>
</tool_name>

Rules:
- Use at most one tool call per reply.
- Write any explanation before the tool call; stop writing once the closing tag is done.
- Do not wrap the call in code fences.
- The result of the call is sent back to you in the next message.

## Available tools";

/// Renders the documentation block for `tools`, or an empty string when there
/// are none. Output depends only on the definitions, so the same list always
/// yields the same block.
pub fn render_tool_prompt(tools: &[ToolDefinition]) -> String {
    if tools.is_empty() {
        return String::new();
    }

    let mut out = String::from(PREAMBLE);
    for tool in tools {
        out.push_str("\n\n");
        render_tool(&mut out, tool);
    }
    out
}

fn render_tool(out: &mut String, tool: &ToolDefinition) {
    let _ = writeln!(out, "### {}", tool.name);
    if !tool.description.trim().is_empty() {
        let _ = writeln!(out, "Description: {}", tool.description.trim());
    }

    if tool.parameters.is_empty() {
        out.push_str("Parameters: none\n");
    } else {
        out.push_str("Parameters:\n");
        for param in &tool.parameters {
            render_parameter(out, param);
        }
    }

    out.push_str("Usage:\n");
    let _ = writeln!(out, "<{}>", tool.name);
    for param in &tool.parameters {
        let _ = writeln!(out, "<{0}>{1}</{0}>", param.name, example_value(&param.param_type));
    }
    let _ = write!(out, "</{}>", tool.name);
}

fn render_parameter(out: &mut String, param: &ParameterSpec) {
    let requirement = if param.required { "required" } else { "optional" };
    let _ = write!(out, "- {} ({requirement}, {})", param.name, param.param_type);
    if !param.description.trim().is_empty() {
        let _ = write!(out, ": {}", param.description.trim());
    }
    out.push('\n');
}

fn example_value(param_type: &str) -> &'static str {
    match param_type {
        "integer" | "number" => "42",
        "boolean" => "true",
        "array" => "[\"item\"]",
        "object" => "{\"key\": \"value\"}",
        _ => "value",
    }
}

/// Appends the tool block to `content` unless it is already present.
///
/// Running this on its own output returns the output unchanged, so a retried
/// request never accumulates duplicate blocks.
pub fn inject_tool_prompt(content: &str, tools: &[ToolDefinition]) -> String {
    let block = render_tool_prompt(tools);
    if block.is_empty() || content.contains(&block) {
        return content.to_string();
    }
    if content.trim().is_empty() {
        return block;
    }
    format!("{}\n\n{block}", content.trim_end())
}
