//! Text Tool-Call Protocol
//!
//! Models without native function calling are taught to request utilities
//! with fenced JSON blocks:
//!
//! ````text
//! ```tool
//! {"tool": "calc", "arguments": {"expr": "2+2"}}
//! ```
//! ````
//!
//! This module renders the available utilities into the system prompt,
//! renders prior calls and results back into plain chat text, and parses
//! the blocks out of a model reply.

use std::fmt::Write as _;

use agent_core::message::{Message, ToolCall};
use agent_core::tool::UtilityDescriptor;
use serde::Deserialize;
use uuid::Uuid;

const FENCE_OPEN: &str = "```tool";
const FENCE_CLOSE: &str = "```";

/// A model reply split into prose and tool calls
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Deserialize)]
struct TextCall {
    #[serde(alias = "name")]
    tool: String,
    #[serde(default)]
    arguments: serde_json::Value,
    #[serde(default)]
    id: Option<String>,
}

impl TextCall {
    fn into_call(self) -> ToolCall {
        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
        let arguments = if self.arguments.is_null() {
            serde_json::json!({})
        } else {
            self.arguments
        };
        ToolCall::new(id, self.tool, arguments)
    }
}

fn parse_block(json: &str) -> Option<Vec<ToolCall>> {
    if let Ok(call) = serde_json::from_str::<TextCall>(json) {
        return Some(vec![call.into_call()]);
    }
    serde_json::from_str::<Vec<TextCall>>(json)
        .ok()
        .map(|calls| calls.into_iter().map(TextCall::into_call).collect())
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Split a reply into prose and tool calls.
///
/// Every fenced `tool` block is parsed; blocks that are not valid calls stay
/// in the prose. Without any fenced block, a bare JSON object carrying a
/// `"tool"` key is accepted as a single call.
pub fn parse_turn(reply: &str) -> ParsedTurn {
    let mut prose = String::new();
    let mut tool_calls = Vec::new();
    let mut rest = reply;
    let mut fenced = false;

    while let Some(start) = rest.find(FENCE_OPEN) {
        let after_marker = &rest[start + FENCE_OPEN.len()..];
        let Some(end) = after_marker.find(FENCE_CLOSE) else {
            break;
        };
        fenced = true;
        let block_end = start + FENCE_OPEN.len() + end + FENCE_CLOSE.len();

        prose.push_str(&rest[..start]);
        match parse_block(after_marker[..end].trim()) {
            Some(calls) => tool_calls.extend(calls),
            None => {
                tracing::debug!("Ignoring malformed tool block");
                prose.push_str(&rest[start..block_end]);
            }
        }
        rest = &rest[block_end..];
    }
    prose.push_str(rest);

    if !fenced {
        if let Some(turn) = parse_inline(reply) {
            return turn;
        }
    }

    ParsedTurn {
        content: non_empty(&prose),
        tool_calls,
    }
}

fn parse_inline(reply: &str) -> Option<ParsedTurn> {
    if !reply.contains(r#""tool""#) {
        return None;
    }
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }
    let call = serde_json::from_str::<TextCall>(&reply[start..=end]).ok()?;
    let prose = format!("{}{}", &reply[..start], &reply[end + 1..]);
    Some(ParsedTurn {
        content: non_empty(&prose),
        tool_calls: vec![call.into_call()],
    })
}

/// Render a call the way the model is asked to write it
pub fn render_call(call: &ToolCall) -> String {
    let body = serde_json::json!({
        "tool": call.name,
        "arguments": call.arguments,
        "id": call.id,
    });
    format!("{FENCE_OPEN}\n{body}\n{FENCE_CLOSE}")
}

/// Assistant turn as chat text, calls included
pub fn render_assistant(message: &Message) -> String {
    let mut text = message.text().to_string();
    for call in &message.tool_calls {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&render_call(call));
    }
    text
}

/// Tool-role message as chat text
pub fn render_tool_result(message: &Message) -> String {
    let name = message.name.as_deref().unwrap_or("unknown");
    let call_id = message.tool_call_id.as_deref().unwrap_or("?");
    format!("[Tool '{name}' returned (call {call_id})]\n{}", message.text())
}

/// System prompt section describing the available utilities
pub fn render_tools_section(tools: &[UtilityDescriptor], single_call: bool) -> String {
    let mut prompt = String::from("## Available Tools\n\n");
    prompt.push_str("You can use the following tools by responding with a JSON block:\n\n");
    prompt.push_str(FENCE_OPEN);
    prompt.push_str("\n{\"tool\": \"tool_name\", \"arguments\": {\"arg\": \"value\"}}\n");
    prompt.push_str(FENCE_CLOSE);
    prompt.push_str("\n\n");
    if single_call {
        prompt.push_str("Call at most one tool per response.\n\n");
    } else {
        prompt.push_str("You may emit several tool blocks in one response.\n\n");
    }

    for tool in tools {
        let _ = writeln!(prompt, "### {}", tool.id);
        let _ = writeln!(prompt, "{}", tool.description);

        let required: Vec<&str> = tool
            .parameters
            .get("required")
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        if let Some(properties) = tool
            .parameters
            .get("properties")
            .and_then(|p| p.as_object())
            .filter(|p| !p.is_empty())
        {
            prompt.push_str("**Parameters:**\n");
            for (name, property) in properties {
                let param_type = property
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("any");
                let description = property
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default();
                let marker = if required.contains(&name.as_str()) {
                    " (required)"
                } else {
                    ""
                };
                let _ = writeln!(prompt, "- `{name}` ({param_type}){marker}: {description}");
            }
        }
        prompt.push('\n');
    }

    prompt
}

/// Withholds streamed text from the first fence or brace onward so raw
/// call JSON never reaches the consumer as prose
#[derive(Debug, Default)]
pub struct ToolBlockFilter {
    buffer: String,
    emitted: usize,
    holding: bool,
}

impl ToolBlockFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a delta and get back the part that is safe to show
    pub fn push(&mut self, delta: &str) -> String {
        self.buffer.push_str(delta);
        if self.holding {
            return String::new();
        }
        let pending = &self.buffer[self.emitted..];
        let visible = match pending.find(['`', '{']) {
            Some(pos) => {
                self.holding = true;
                pending[..pos].to_string()
            }
            None => pending.to_string(),
        };
        self.emitted += visible.len();
        visible
    }

    /// Parse the full reply; returns the prose not yet shown and the calls
    pub fn finish(self) -> (String, Vec<ToolCall>) {
        // the shown head holds no fence or brace, so every call is in the tail
        let held = &self.buffer[self.emitted..];
        let tail = parse_turn(held);
        if tail.tool_calls.is_empty() {
            return (held.to_string(), Vec::new());
        }
        (tail.content.unwrap_or_default(), tail.tool_calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_fenced_block_and_keeps_prose() {
        let reply = "Let me compute that.\n```tool\n{\"tool\": \"calc\", \"arguments\": {\"expr\": \"2+2\"}}\n```";
        let turn = parse_turn(reply);
        assert_eq!(turn.content.as_deref(), Some("Let me compute that."));
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].name, "calc");
        assert_eq!(turn.tool_calls[0].arguments, json!({"expr": "2+2"}));
        assert!(turn.tool_calls[0].id.starts_with("call_"));
    }

    #[test]
    fn parses_multiple_blocks_in_order() {
        let reply = "```tool\n{\"tool\": \"a\", \"arguments\": {}}\n```\n```tool\n[{\"tool\": \"b\"}, {\"name\": \"c\", \"id\": \"given\"}]\n```";
        let turn = parse_turn(reply);
        let names: Vec<_> = turn.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(turn.tool_calls[1].arguments, json!({}));
        assert_eq!(turn.tool_calls[2].id, "given");
        assert!(turn.content.is_none());
    }

    #[test]
    fn malformed_block_stays_in_prose() {
        let reply = "Here:\n```tool\nnot json\n```";
        let turn = parse_turn(reply);
        assert!(turn.tool_calls.is_empty());
        assert!(turn.content.unwrap().contains("not json"));
    }

    #[test]
    fn inline_json_fallback() {
        let turn = parse_turn(r#"{"tool": "datetime", "arguments": {"format": "iso"}}"#);
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].name, "datetime");
        assert!(turn.content.is_none());
    }

    #[test]
    fn plain_answer_has_no_calls() {
        let turn = parse_turn("The answer is {not a call}.");
        assert!(turn.tool_calls.is_empty());
        assert_eq!(turn.content.as_deref(), Some("The answer is {not a call}."));
    }

    #[test]
    fn renders_tools_with_required_markers() {
        let tools = vec![UtilityDescriptor::new(
            "calc",
            "Evaluate arithmetic",
            json!({
                "type": "object",
                "properties": {
                    "expr": {"type": "string", "description": "Expression"}
                },
                "required": ["expr"]
            }),
        )];
        let section = render_tools_section(&tools, true);
        assert!(section.contains("### calc"));
        assert!(section.contains("- `expr` (string) (required): Expression"));
        assert!(section.contains("at most one tool"));
    }

    #[test]
    fn assistant_calls_render_back_as_blocks() {
        let call = ToolCall::new("c1", "calc", json!({"expr": "1+1"}));
        let message = Message::assistant_with_tool_calls(Some("Checking.".into()), vec![call]);
        let text = render_assistant(&message);
        assert!(text.starts_with("Checking.\n```tool\n"));
        let reparsed = parse_turn(&text);
        assert_eq!(reparsed.tool_calls[0].id, "c1");
    }

    #[test]
    fn tool_results_render_with_call_id() {
        let message = Message::tool_result("c1", "calc", "2");
        assert_eq!(render_tool_result(&message), "[Tool 'calc' returned (call c1)]\n2");
    }

    #[test]
    fn filter_holds_back_tool_json() {
        let mut filter = ToolBlockFilter::new();
        let mut shown = String::new();
        for delta in ["Sure, ", "let me check.", "\n``", "`tool\n{\"tool\": \"calc\", ", "\"arguments\": {}}\n```"] {
            shown.push_str(&filter.push(delta));
        }
        assert_eq!(shown, "Sure, let me check.\n");
        let (rest, calls) = filter.finish();
        assert!(rest.is_empty());
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn filter_releases_held_prose_without_calls() {
        let mut filter = ToolBlockFilter::new();
        let shown = filter.push("Use `ls` to list files.");
        assert_eq!(shown, "Use ");
        let (rest, calls) = filter.finish();
        assert_eq!(rest, "`ls` to list files.");
        assert!(calls.is_empty());
    }
}
