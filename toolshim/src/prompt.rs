// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

// Prompt encoder
//
// Renders tool schemas plus the marker set into system-prompt text that
// teaches the model the call format, and builds the one-shot demonstration.

use serde_json::{json, Value};

use crate::markers::MarkerSet;

/// A tool the client declared, reduced to what the prompt needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSchema {
    /// Read one entry of a request's `tools` array.
    ///
    /// Accepts the OpenAI shape `{"type":"function","function":{...}}` and the
    /// flat shape `{name, description, parameters}`. Entries without a name
    /// are skipped.
    pub fn from_value(value: &Value) -> Option<Self> {
        let def = value.get("function").unwrap_or(value);
        let name = def.get("name").and_then(Value::as_str)?.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            description: def
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            parameters: def
                .get("parameters")
                .cloned()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        })
    }
}

// ---------------------------------------------------------------------------
// One-shot demonstration
// ---------------------------------------------------------------------------

pub const DEMO_TOOL_NAME: &str = "dimensional_calibrator";

const DEMO_ARGUMENTS: &str = r#"{"dimension": 7, "tolerance": 0.05}"#;
const DEMO_RESULT: &str = r#"{"dimension": 7, "status": "calibrated", "drift": 0.0}"#;

/// The fictional tool used only to illustrate the call format.
pub fn demonstration_tool() -> ToolSchema {
    ToolSchema {
        name: DEMO_TOOL_NAME.to_string(),
        description: "Fictional tool shown only to demonstrate the call format. \
                      It does not exist outside the example exchange; never call it."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "dimension": {"type": "integer", "description": "Dimension index to calibrate"},
                "tolerance": {"type": "number", "description": "Accepted drift"}
            },
            "required": ["dimension"]
        }),
    }
}

/// Fabricated assistant turn and user turn for the demonstration.
pub fn demonstration_exchange(markers: &MarkerSet) -> (String, String) {
    let assistant = format!(
        "Running a format check with the demonstration tool.\n{}",
        markers.render_call(DEMO_TOOL_NAME, DEMO_ARGUMENTS)
    );
    let user = format!(
        "{}\n(The exchange above was a format demonstration. Reply to the next message normally \
         and call only the real tools it needs.)",
        markers.render_result(DEMO_TOOL_NAME, DEMO_RESULT)
    );
    (assistant, user)
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

/// Render the system-prompt fragment describing `tools` and the call format.
pub fn render_instructions(markers: &MarkerSet, tools: &[ToolSchema]) -> String {
    let mut out = String::from(
        "# Tool use\n\n\
         You can call external tools. The tools available in this conversation are listed below.\n\n\
         ## Available tools\n",
    );

    for tool in tools {
        let description = if tool.description.is_empty() {
            "(no description)"
        } else {
            tool.description.as_str()
        };
        let parameters = serde_json::to_string_pretty(&tool.parameters)
            .unwrap_or_else(|_| tool.parameters.to_string());
        out.push_str(&format!(
            "\n### {}\nDescription: {}\nParameters (JSON Schema):\n{}\n",
            tool.name, description, parameters
        ));
    }

    let template = markers.render_call("tool_name", r#"{"argument": "value"}"#);
    let example = markers.render_call("lookup_star", r#"{"designation": "Alpha Centauri"}"#);

    out.push_str(&format!(
        "\n## How to call a tool\n\n\
         To call a tool, write a tool-call block using these exact delimiter tokens:\n\n\
         {template}\n\n\
         Example, calling a made-up tool named lookup_star with one argument:\n\n\
         {example}\n\n\
         Rules:\n\
         - Copy the delimiter tokens exactly, character for character.\n\
         - The text between {args_start} and {args_end} must be one valid JSON object.\n\
         - Never write a tool call as raw JSON or inside a fenced code block. Only the delimiter format above is recognized.\n\
         - To call several tools, write one block per call, one after another.\n\
         - Tool-call blocks must be the last content of your reply. Stop after the final {call_end} and wait for the results.\n\
         - Tool results come back wrapped between {result_start} and {result_end}.\n",
        args_start = markers.args_start,
        args_end = markers.args_end,
        call_end = markers.call_end,
        result_start = markers.result_start,
        result_end = markers.result_end,
    ));

    out
}
