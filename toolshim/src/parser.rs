// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

// Text protocol parser
//
// Extracts marker-delimited tool calls from model text and returns the text
// that remains once every call region is cut out.

use std::borrow::Cow;

use regex::{escape, Regex};
use serde::de::IgnoredAny;

use crate::markers::{MarkerError, MarkerSet};
use crate::message::ToolCall;

/// Outcome of parsing one block of model text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedText {
    /// Accepted calls in source order.
    pub tool_calls: Vec<ToolCall>,
    /// Text left after removing every call region, trimmed.
    /// `None` when nothing but whitespace remains.
    pub content: Option<String>,
}

/// A validated marker set together with the compiled call grammar.
///
/// Built once at startup and shared (behind `Arc`) by the request
/// transformer, the streaming transcoder and the non-stream finisher.
#[derive(Debug, Clone)]
pub struct ToolProtocol {
    markers: MarkerSet,
    call_pattern: Regex,
}

impl ToolProtocol {
    pub fn new(markers: MarkerSet) -> Result<Self, MarkerError> {
        markers.validate()?;
        let pattern = format!(
            r"(?s){}\s*{}(.*?){}\s*{}(.*?){}\s*{}",
            escape(&markers.call_start),
            escape(&markers.name_start),
            escape(&markers.name_end),
            escape(&markers.args_start),
            escape(&markers.args_end),
            escape(&markers.call_end),
        );
        let call_pattern = Regex::new(&pattern).map_err(|e| MarkerError::Pattern(e.to_string()))?;
        Ok(Self {
            markers,
            call_pattern,
        })
    }

    pub fn markers(&self) -> &MarkerSet {
        &self.markers
    }

    /// Extract tool calls from `text`.
    ///
    /// Regions whose name is blank or whose arguments are not valid JSON are
    /// still removed from the residual text but yield no call.
    pub fn parse(&self, text: &str) -> ParsedText {
        let (tool_calls, residual) = self.extract(text);
        let residual = residual.trim();
        ParsedText {
            tool_calls,
            content: (!residual.is_empty()).then(|| residual.to_string()),
        }
    }

    /// Like [`parse`](Self::parse), but the residual keeps its surrounding
    /// whitespace. The residual is borrowed when no call region matched.
    pub fn extract<'t>(&self, text: &'t str) -> (Vec<ToolCall>, Cow<'t, str>) {
        let mut tool_calls = Vec::new();

        for caps in self.call_pattern.captures_iter(text) {
            let name = caps.get(1).map_or("", |m| m.as_str()).trim();
            let arguments = caps.get(2).map_or("", |m| m.as_str()).trim();

            if name.is_empty() {
                tracing::debug!("discarding tool call region with empty name");
                continue;
            }
            if let Err(e) = serde_json::from_str::<IgnoredAny>(arguments) {
                tracing::debug!(tool = name, error = %e, "discarding tool call with invalid JSON arguments");
                continue;
            }

            tool_calls.push(ToolCall {
                id: new_call_id(),
                index: tool_calls.len(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            });
        }

        (tool_calls, self.call_pattern.replace_all(text, ""))
    }
}

/// Fresh tool call identifier in the `call_<hex>` form clients expect.
pub fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn protocol() -> ToolProtocol {
        ToolProtocol::new(MarkerSet::from_parts(("⟦", "⊘", "⟧"), "ꕤ", "ꗃ")).unwrap()
    }

    #[test]
    fn plain_text_has_no_calls() {
        let p = protocol();
        let parsed = p.parse("  The answer is 42.\n");
        assert!(parsed.tool_calls.is_empty());
        assert_eq!(parsed.content.as_deref(), Some("The answer is 42."));
    }

    #[test]
    fn single_call_with_preamble() {
        let p = protocol();
        let m = p.markers();
        let text = format!(
            "Let me check.\n{}",
            m.render_call("get_weather", r#"{"city": "Oslo"}"#)
        );
        let parsed = p.parse(&text);
        assert_eq!(parsed.tool_calls.len(), 1);
        let call = &parsed.tool_calls[0];
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments, r#"{"city": "Oslo"}"#);
        assert_eq!(call.index, 0);
        assert!(call.id.starts_with("call_"));
        assert_eq!(parsed.content.as_deref(), Some("Let me check."));
    }

    #[test]
    fn multiple_calls_keep_order_and_unique_ids() {
        let p = protocol();
        let m = p.markers();
        let text = format!(
            "{}\n{}\n{}",
            m.render_call("a", "{}"),
            m.render_call("b", r#"{"x":1}"#),
            m.render_call("c", "[1,2]")
        );
        let parsed = p.parse(&text);
        let names: Vec<_> = parsed.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        let indices: Vec<_> = parsed.tool_calls.iter().map(|c| c.index).collect();
        assert_eq!(indices, [0, 1, 2]);
        let ids: HashSet<_> = parsed.tool_calls.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(parsed.content, None);
    }

    #[test]
    fn invalid_json_region_removed_without_call() {
        let p = protocol();
        let m = p.markers();
        let text = format!("before {} after", m.render_call("broken", "{not json"));
        let parsed = p.parse(&text);
        assert!(parsed.tool_calls.is_empty());
        assert_eq!(parsed.content.as_deref(), Some("before  after"));
        assert!(!m.appears_in(parsed.content.as_deref().unwrap()));
    }

    #[test]
    fn invalid_call_does_not_shift_indices() {
        let p = protocol();
        let m = p.markers();
        let text = format!(
            "{}{}",
            m.render_call("bad", "{"),
            m.render_call("good", "{}")
        );
        let parsed = p.parse(&text);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "good");
        assert_eq!(parsed.tool_calls[0].index, 0);
    }

    #[test]
    fn whitespace_between_tokens_ignored_and_fields_trimmed() {
        let p = protocol();
        let m = p.markers();
        let text = format!(
            "{}  \n\t{}  search \n{}\n\n{}\n  {{\"q\": \"rust\"}}  \n{}  {}",
            m.call_start, m.name_start, m.name_end, m.args_start, m.args_end, m.call_end
        );
        let parsed = p.parse(&text);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "search");
        assert_eq!(parsed.tool_calls[0].arguments, r#"{"q": "rust"}"#);
    }

    #[test]
    fn empty_name_discarded() {
        let p = protocol();
        let m = p.markers();
        let parsed = p.parse(&m.render_call("  ", "{}"));
        assert!(parsed.tool_calls.is_empty());
        assert_eq!(parsed.content, None);
    }

    #[test]
    fn incomplete_region_left_in_text() {
        let p = protocol();
        let m = p.markers();
        let text = format!("{}\n{}x{}", m.call_start, m.name_start, m.name_end);
        let parsed = p.parse(&text);
        assert!(parsed.tool_calls.is_empty());
        assert_eq!(parsed.content.as_deref(), Some(text.as_str()));
    }

    #[test]
    fn parse_is_idempotent_on_residual() {
        let p = protocol();
        let m = p.markers();
        let text = format!("intro {} outro", m.render_call("t", r#"{"k":"v"}"#));
        let first = p.parse(&text);
        let second = p.parse(first.content.as_deref().unwrap_or_default());
        assert!(second.tool_calls.is_empty());
        assert_eq!(second.content, first.content);
    }

    #[test]
    fn extract_keeps_residual_whitespace() {
        let p = protocol();
        let m = p.markers();
        let text = format!("\n{}\n  Done. ", m.render_call("ping", "{}"));
        let (calls, residual) = p.extract(&text);
        assert_eq!(calls.len(), 1);
        assert_eq!(residual, "\n\n  Done. ");
        assert!(matches!(residual, Cow::Owned(_)));

        let (calls, residual) = p.extract("  no calls here ");
        assert!(calls.is_empty());
        assert!(matches!(residual, Cow::Borrowed("  no calls here ")));
    }

    #[test]
    fn invalid_markers_rejected() {
        let mut markers = MarkerSet::from_parts(("⟦", "⊘", "⟧"), "ꕤ", "ꗃ");
        markers.call_end = markers.call_start.clone();
        assert!(ToolProtocol::new(markers).is_err());
    }
}
