// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

// Request transformer
//
// Rewrites a structured chat request into one that carries tool semantics
// only as message text:
// - tool schemas become system-prompt instructions
// - assistant tool calls become marker-delimited call blocks
// - tool results become user turns wrapped in result markers
// - a one-shot demonstration primes models new to the format
// - adjacent same-role turns are merged

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::message::{append_text, merge_content, ChatMessage, Content, Role};
use crate::parser::ToolProtocol;
use crate::prompt::{demonstration_exchange, demonstration_tool, render_instructions, ToolSchema};

/// Top-level request fields that describe tools structurally.
const TOOL_FIELDS: &[&str] = &[
    "tools",
    "tool_choice",
    "parallel_tool_calls",
    "functions",
    "function_call",
];

const UNKNOWN_TOOL: &str = "unknown";

/// Whether a request asks for tool calling: a non-empty `tools` array and a
/// `tool_choice` other than `"none"`.
pub fn has_tools(body: &Value) -> bool {
    let declared = body
        .get("tools")
        .and_then(Value::as_array)
        .is_some_and(|tools| !tools.is_empty());
    let disabled = body.get("tool_choice").and_then(Value::as_str) == Some("none");
    declared && !disabled
}

pub struct RequestTransformer {
    protocol: Arc<ToolProtocol>,
}

impl RequestTransformer {
    pub fn new(protocol: Arc<ToolProtocol>) -> Self {
        Self { protocol }
    }

    /// Produce the outgoing request body for `body`.
    ///
    /// Non-object bodies are returned unchanged.
    pub fn transform(&self, body: &Value, has_tools: bool) -> Value {
        let Some(obj) = body.as_object() else {
            return body.clone();
        };
        let markers = self.protocol.markers();

        let messages: Vec<ChatMessage> = obj
            .get("messages")
            .and_then(Value::as_array)
            .map(|raw| raw.iter().cloned().map(ChatMessage::from_value).collect())
            .unwrap_or_default();

        let inject_demo = has_tools && needs_demonstration(&messages, |text| markers.appears_in(text));

        let instructions = has_tools.then(|| {
            let mut tools: Vec<ToolSchema> = obj
                .get("tools")
                .and_then(Value::as_array)
                .map(|raw| raw.iter().filter_map(ToolSchema::from_value).collect())
                .unwrap_or_default();
            if inject_demo {
                tools.push(demonstration_tool());
            }
            render_instructions(markers, &tools)
        });

        // Names of earlier assistant calls, for results that carry only an id.
        let mut call_names: HashMap<String, String> = HashMap::new();
        let mut seen_system = false;
        let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len() + 3);

        for mut msg in messages {
            match msg.role {
                Role::System => {
                    if let (false, Some(text)) = (seen_system, instructions.as_deref()) {
                        msg.content = Some(append_text(msg.content.take(), text, "\n\n"));
                    }
                    seen_system = true;
                    out.push(msg);
                }
                Role::Assistant if !msg.tool_calls.is_empty() => {
                    let calls = std::mem::take(&mut msg.tool_calls);
                    for call in &calls {
                        if let Some(id) = &call.id {
                            call_names.insert(id.clone(), call.function.name.clone());
                        }
                    }
                    let note = if has_tools {
                        calls
                            .iter()
                            .map(|c| markers.render_call(&c.function.name, &c.function.arguments_text()))
                            .collect::<Vec<_>>()
                            .join("\n")
                    } else {
                        let names: Vec<&str> = calls.iter().map(|c| c.function.name.as_str()).collect();
                        format!("[Called tools: {}]", names.join(", "))
                    };
                    msg.content = Some(append_text(msg.content.take(), &note, "\n"));
                    msg.extra.remove("function_call");
                    out.push(msg);
                }
                Role::Tool => {
                    let tool = msg
                        .name
                        .clone()
                        .filter(|n| !n.is_empty())
                        .or_else(|| {
                            msg.tool_call_id
                                .as_ref()
                                .and_then(|id| call_names.get(id))
                                .filter(|n| !n.is_empty())
                                .cloned()
                        })
                        .or_else(|| msg.tool_call_id.clone().filter(|id| !id.is_empty()))
                        .unwrap_or_else(|| UNKNOWN_TOOL.to_string());
                    let result = msg.text();
                    let text = if has_tools {
                        markers.render_result(&tool, &result)
                    } else {
                        format!("[Tool result from {tool}]: {result}")
                    };
                    let mut user = ChatMessage::new(Role::User, text);
                    user.extra = msg.extra;
                    out.push(user);
                }
                _ => out.push(msg),
            }
        }

        if let (false, Some(text)) = (seen_system, instructions) {
            out.insert(0, ChatMessage::new(Role::System, text));
        }

        if inject_demo {
            let (assistant, user) = demonstration_exchange(markers);
            let at = out.len().saturating_sub(1);
            out.insert(at, ChatMessage::new(Role::User, user));
            out.insert(at, ChatMessage::new(Role::Assistant, assistant));
        }

        let merged = merge_adjacent(out);

        let mut result = obj.clone();
        for field in TOOL_FIELDS {
            result.remove(*field);
        }
        result.insert(
            "messages".to_string(),
            Value::Array(merged.iter().map(ChatMessage::to_value).collect()),
        );
        Value::Object(result)
    }
}

/// A demonstration helps only on a fresh tool conversation that ends with a
/// user turn.
fn needs_demonstration(messages: &[ChatMessage], has_markers: impl Fn(&str) -> bool) -> bool {
    let ends_with_user = messages.last().is_some_and(|m| m.role == Role::User);
    let tool_history = messages.iter().any(|m| {
        m.role == Role::Tool || !m.tool_calls.is_empty() || has_markers(&m.text())
    });
    ends_with_user && !tool_history
}

fn mergeable(a: &ChatMessage, b: &ChatMessage) -> bool {
    let plain = |m: &ChatMessage| m.tool_calls.is_empty() && m.tool_call_id.is_none();
    a.role == b.role && a.role != Role::Other(String::new()) && plain(a) && plain(b)
}

/// Merge runs of same-role messages, joining content with a blank line.
fn merge_adjacent(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        match out.last_mut() {
            Some(prev) if mergeable(prev, &msg) => {
                prev.content = merge_content(prev.content.take(), msg.content)
                    .or(Some(Content::Text(String::new())));
                for (key, value) in msg.extra {
                    prev.extra.entry(key).or_insert(value);
                }
            }
            _ => out.push(msg),
        }
    }
    out
}
