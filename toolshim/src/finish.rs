// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

// Non-stream response finisher
//
// Applies the text protocol parser to a complete chat-completion body and
// moves recovered calls into `message.tool_calls`.

use std::sync::Arc;

use serde_json::Value;

use crate::message::ToolCall;
use crate::parser::ToolProtocol;

pub struct ResponseFinisher {
    protocol: Arc<ToolProtocol>,
}

impl ResponseFinisher {
    pub fn new(protocol: Arc<ToolProtocol>) -> Self {
        Self { protocol }
    }

    /// Rewrite `body` in place of the upstream response. Returns the new
    /// body and the number of tool calls recovered.
    ///
    /// Bodies without a text message at `choices[0].message` pass through.
    pub fn finish(&self, mut body: Value, has_tools: bool) -> (Value, usize) {
        if !has_tools {
            return (body, 0);
        }

        let Some(message) = body
            .pointer_mut("/choices/0/message")
            .and_then(Value::as_object_mut)
        else {
            return (body, 0);
        };

        let text = match message.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => return (body, 0),
        };
        if text.trim().is_empty() {
            return (body, 0);
        }

        let parsed = self.protocol.parse(&text);
        if parsed.tool_calls.is_empty() && parsed.content.as_deref() == Some(text.trim()) {
            return (body, 0);
        }

        // Regions were cut even when none held a valid call; marker text
        // never reaches the client.
        message.insert(
            "content".to_string(),
            parsed.content.map_or(Value::Null, Value::String),
        );

        let count = parsed.tool_calls.len();
        if count == 0 {
            return (body, 0);
        }

        let calls: Vec<Value> = parsed.tool_calls.iter().map(ToolCall::to_message_json).collect();
        match message.get_mut("tool_calls").and_then(Value::as_array_mut) {
            Some(existing) => existing.extend(calls),
            None => {
                message.insert("tool_calls".to_string(), Value::Array(calls));
            }
        }

        if let Some(choice) = body.pointer_mut("/choices/0").and_then(Value::as_object_mut) {
            choice.insert(
                "finish_reason".to_string(),
                Value::String("tool_calls".to_string()),
            );
        }
        (body, count)
    }
}
