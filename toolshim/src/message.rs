// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

// Chat message representation
//
// Typed view over the OpenAI-compatible `messages[]` array. Unknown fields
// are carried in `extra` so a message round-trips without loss.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

/// The role of a message participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    /// Any other role (e.g. "developer"), passed through as-is.
    Other(String),
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match value.as_str() {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            _ => Role::Other(value),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::System => "system".to_string(),
            Role::User => "user".to_string(),
            Role::Assistant => "assistant".to_string(),
            Role::Tool => "tool".to_string(),
            Role::Other(other) => other,
        }
    }
}

/// Message content: plain text, or an array of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<Value>),
    Other(Value),
}

impl Content {
    /// Flatten to text. Non-text parts are skipped.
    pub fn to_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            Content::Other(v) => v.to_string(),
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            Content::Text(s) => s.is_empty(),
            Content::Parts(parts) => parts.is_empty(),
            Content::Other(v) => v.is_null(),
        }
    }

    fn into_parts(self) -> Vec<Value> {
        match self {
            Content::Parts(parts) => parts,
            Content::Text(s) if s.is_empty() => Vec::new(),
            Content::Text(s) => vec![text_part(&s)],
            Content::Other(v) => vec![text_part(&v.to_string())],
        }
    }
}

fn text_part(text: &str) -> Value {
    json!({"type": "text", "text": text})
}

/// Append `text` to optional content. Absent content counts as empty.
///
/// Text content is joined with `separator`; array content gains a text part.
pub fn append_text(content: Option<Content>, text: &str, separator: &str) -> Content {
    match content {
        None => Content::Text(text.to_string()),
        Some(c) if c.is_blank() => Content::Text(text.to_string()),
        Some(Content::Text(s)) if text.is_empty() => Content::Text(s),
        Some(Content::Text(s)) => Content::Text(format!("{s}{separator}{text}")),
        Some(Content::Parts(mut parts)) => {
            if !text.is_empty() {
                parts.push(text_part(text));
            }
            Content::Parts(parts)
        }
        Some(Content::Other(v)) => Content::Text(format!("{v}{separator}{text}")),
    }
}

/// Merge two contents with a blank-line separator. Empty sides are dropped.
pub fn merge_content(first: Option<Content>, second: Option<Content>) -> Option<Content> {
    match (first, second) {
        (None, other) | (other, None) => other,
        (Some(a), Some(b)) if b.is_blank() => Some(a),
        (Some(a), Some(b)) if a.is_blank() => Some(b),
        (Some(Content::Text(a)), Some(Content::Text(b))) => {
            Some(Content::Text(format!("{a}\n\n{b}")))
        }
        (Some(a), Some(b)) => {
            let mut parts = a.into_parts();
            parts.extend(b.into_parts());
            Some(Content::Parts(parts))
        }
    }
}

// ---------------------------------------------------------------------------
// Tool calls carried in requests
// ---------------------------------------------------------------------------

/// An assistant tool call as it appears in request history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub function: WireFunction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireFunction {
    #[serde(default)]
    pub name: String,
    /// Usually a JSON string; some clients send an object.
    #[serde(default)]
    pub arguments: Value,
}

impl WireFunction {
    /// Arguments as JSON text. Null or missing arguments render as `{}`.
    pub fn arguments_text(&self) -> String {
        match &self.arguments {
            Value::Null => "{}".to_string(),
            Value::String(s) if s.trim().is_empty() => "{}".to_string(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// ChatMessage
// ---------------------------------------------------------------------------

/// A single message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    /// Assistant-only. `null` and absent both mean no calls.
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tool_calls: Vec<WireToolCall>,
    /// Tool-only: the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(Content::Text(content.into())),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            extra: Map::new(),
        }
    }

    /// Decode one entry of `messages[]`.
    ///
    /// Entries that do not fit the typed shape are kept verbatim in `extra`
    /// under their original role, so malformed history still reaches the
    /// upstream unchanged.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<ChatMessage>(value.clone()) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(error = %e, "message kept verbatim: unexpected shape");
                let mut extra = match value {
                    Value::Object(map) => map,
                    other => {
                        let mut map = Map::new();
                        map.insert("content".to_string(), other);
                        map
                    }
                };
                let role = match extra.remove("role") {
                    Some(Value::String(r)) => Role::from(r),
                    Some(other) => {
                        extra.insert("role".to_string(), other);
                        Role::Other(String::new())
                    }
                    None => Role::Other(String::new()),
                };
                Self {
                    role,
                    content: None,
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                    name: None,
                    extra,
                }
            }
        }
    }

    /// Content flattened to text; absent content is empty.
    pub fn text(&self) -> String {
        self.content.as_ref().map(Content::to_text).unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        // Fallback messages built without a typed role keep their raw one.
        if let (Role::Other(r), Some(obj)) = (&self.role, value.as_object_mut()) {
            if r.is_empty() {
                obj.remove("role");
                if let Some(raw) = self.extra.get("role") {
                    obj.insert("role".to_string(), raw.clone());
                }
            }
        }
        value
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<WireToolCall>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<WireToolCall>>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Tool calls extracted from model output
// ---------------------------------------------------------------------------

/// A tool call recovered from marker-delimited model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Freshly generated identifier, e.g. "call_3f2a...".
    pub id: String,
    /// Position among the accepted calls of one response.
    pub index: usize,
    pub name: String,
    /// Raw JSON text, syntax-checked only.
    pub arguments: String,
}

impl ToolCall {
    /// Shape used in a non-streaming `message.tool_calls` array.
    pub fn to_message_json(&self) -> Value {
        json!({
            "id": self.id,
            "type": "function",
            "function": {
                "name": self.name,
                "arguments": self.arguments,
            }
        })
    }

    /// Shape used in a streaming `delta.tool_calls` array.
    pub fn to_delta_json(&self) -> Value {
        json!({
            "index": self.index,
            "id": self.id,
            "type": "function",
            "function": {
                "name": self.name,
                "arguments": self.arguments,
            }
        })
    }
}
