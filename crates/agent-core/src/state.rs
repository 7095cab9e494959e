//! Message State
//!
//! Pure functions that combine and repair message histories before they are
//! handed to the model.

use std::collections::HashSet;

use crate::message::{Message, Role};

/// Merge `incoming` into `base`.
///
/// `base` keeps its order. Messages from `incoming` are appended in their own
/// order unless `base` already holds a message with the same role and text;
/// repeats within `incoming` itself are kept. Tool-call payloads are not part
/// of the key, so two tool-call messages with identical visible text collapse
/// into one.
pub fn merge(base: &[Message], incoming: &[Message]) -> Vec<Message> {
    let present: HashSet<(Role, Option<&str>)> = base
        .iter()
        .map(|m| (m.role, m.content.as_deref()))
        .collect();

    let mut merged = base.to_vec();
    merged.extend(
        incoming
            .iter()
            .filter(|m| !present.contains(&(m.role, m.content.as_deref())))
            .cloned(),
    );
    merged
}

/// Drop malformed tool calls from a trailing assistant message.
///
/// Only the last message is inspected. When at least one of its tool calls
/// lacks an id or a name, it is replaced by a copy carrying just the
/// well-formed calls; otherwise the input is returned as is.
pub fn sanitize(mut messages: Vec<Message>) -> Vec<Message> {
    let Some(last) = messages.last_mut() else {
        return messages;
    };
    if last.role != Role::Assistant || last.tool_calls.is_empty() {
        return messages;
    }

    let before = last.tool_calls.len();
    let kept: Vec<_> = last
        .tool_calls
        .iter()
        .filter(|call| call.is_well_formed())
        .cloned()
        .collect();

    if kept.len() < before {
        tracing::debug!(dropped = before - kept.len(), "Pruned malformed tool calls");
        let replacement = Message {
            tool_calls: kept,
            ..last.clone()
        };
        *last = replacement;
    }
    messages
}

/// Tool-call ids on assistant messages that have no matching tool result
pub fn dangling_tool_call_ids(messages: &[Message]) -> Vec<String> {
    let answered: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();

    messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter())
        .filter(|call| !answered.contains(call.id.as_str()))
        .map(|call| call.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;
    use serde_json::json;

    fn texts(messages: &[Message]) -> Vec<(Role, &str)> {
        messages.iter().map(|m| (m.role, m.text())).collect()
    }

    #[test]
    fn identical_user_messages_collapse() {
        let merged = merge(&[Message::user("hi")], &[Message::user("hi")]);
        assert_eq!(texts(&merged), vec![(Role::User, "hi")]);
    }

    #[test]
    fn merge_keeps_base_order_and_appends_new_in_order() {
        let base = vec![Message::user("a"), Message::assistant("b")];
        let incoming = vec![
            Message::user("c"),
            Message::assistant("b"),
            Message::user("d"),
        ];

        let merged = merge(&base, &incoming);

        assert_eq!(
            texts(&merged),
            vec![
                (Role::User, "a"),
                (Role::Assistant, "b"),
                (Role::User, "c"),
                (Role::User, "d"),
            ]
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let base = vec![
            Message::system("sys"),
            Message::user("q"),
            Message::assistant("a"),
        ];
        let merged = merge(&base, &base);
        assert_eq!(texts(&merged), texts(&base));
    }

    #[test]
    fn repeats_within_incoming_are_kept() {
        let merged = merge(
            &[Message::user("start")],
            &[Message::user("yes"), Message::assistant("sure?"), Message::user("yes")],
        );
        assert_eq!(
            texts(&merged),
            vec![
                (Role::User, "start"),
                (Role::User, "yes"),
                (Role::Assistant, "sure?"),
                (Role::User, "yes"),
            ]
        );
    }

    #[test]
    fn same_text_different_role_is_kept() {
        let merged = merge(&[Message::user("ok")], &[Message::assistant("ok")]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn tool_calls_are_not_part_of_the_key() {
        let a = Message::assistant_with_tool_calls(
            None,
            vec![ToolCall::new("1", "calc", json!({"expr": "1+1"}))],
        );
        let b = Message::assistant_with_tool_calls(
            None,
            vec![ToolCall::new("2", "calc", json!({"expr": "2+2"}))],
        );
        assert_eq!(merge(&[a], &[b]).len(), 1);
    }

    #[test]
    fn sanitize_drops_calls_missing_id_or_name() {
        let messages = vec![
            Message::user("go"),
            Message::assistant_with_tool_calls(
                Some("working".into()),
                vec![
                    ToolCall::new("1", "calc", json!({})),
                    ToolCall::new("", "calc", json!({})),
                    ToolCall::new("3", "", json!({})),
                ],
            ),
        ];

        let sanitized = sanitize(messages);
        let last = sanitized.last().unwrap();

        assert_eq!(sanitized.len(), 2);
        assert_eq!(last.tool_calls.len(), 1);
        assert_eq!(last.tool_calls[0].id, "1");
        assert_eq!(last.text(), "working");
    }

    #[test]
    fn sanitize_is_noop_without_bad_calls() {
        let call = ToolCall::new("1", "calc", json!({}));
        let messages = vec![Message::assistant_with_tool_calls(None, vec![call.clone()])];
        let sanitized = sanitize(messages);
        assert_eq!(sanitized[0].tool_calls, vec![call]);
    }

    #[test]
    fn sanitize_only_looks_at_the_tail() {
        let bad = Message::assistant_with_tool_calls(None, vec![ToolCall::new("", "", json!({}))]);
        let messages = vec![bad, Message::user("next")];
        let sanitized = sanitize(messages);
        assert_eq!(sanitized[0].tool_calls.len(), 1);
        assert!(sanitize(Vec::new()).is_empty());
    }

    #[test]
    fn dangling_ids_are_reported() {
        let messages = vec![
            Message::assistant_with_tool_calls(
                None,
                vec![
                    ToolCall::new("a", "calc", json!({})),
                    ToolCall::new("b", "calc", json!({})),
                ],
            ),
            Message::tool_result("a", "calc", "2"),
        ];
        assert_eq!(dangling_tool_call_ids(&messages), vec!["b".to_string()]);
    }
}
