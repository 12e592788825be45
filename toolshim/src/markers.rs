// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

// Marker set
//
// Responsibilities:
// - Pick one random set of eight delimiter tokens per process
// - Build tokens from pools of rarely-generated characters
// - Check the invariants the parser and transcoder rely on

use rand::Rng;

// ---------------------------------------------------------------------------
// Pools
// ---------------------------------------------------------------------------

/// Delimiter triples: `(open, end_mark, close)`.
///
/// Each pool entry uses characters that appear in no other position of the
/// generated tokens, which keeps every token free of self-overlap.
const TRIPLES: &[(&str, &str, &str)] = &[
    ("⟦", "⊘", "⟧"),
    ("⦃", "⌿", "⦄"),
    ("⟪", "⧸", "⟫"),
    ("⦗", "∅", "⦘"),
    ("⧼", "⨳", "⧽"),
    ("⟬", "⊗", "⟭"),
];

/// Decorative suffixes. Two distinct entries are drawn per marker set.
const SUFFIXES: &[&str] = &["ꕤ", "ꗃ", "ᗢ", "⌬", "⍟", "⎔", "⏣", "ᚼ"];

const KW_CALL: &str = "TOOL_CALL";
const KW_NAME: &str = "TOOL_NAME";
const KW_ARGS: &str = "TOOL_ARGS";
const KW_RESULT: &str = "TOOL_RESULT";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Violations of the marker set invariants.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MarkerError {
    #[error("marker {0} is empty")]
    Empty(&'static str),

    #[error("markers {first} and {second} are identical")]
    Duplicate {
        first: &'static str,
        second: &'static str,
    },

    #[error("marker {inner} is contained in marker {outer}")]
    Nested {
        inner: &'static str,
        outer: &'static str,
    },

    #[error("marker {0} overlaps itself (a proper prefix equals a proper suffix)")]
    SelfOverlapping(&'static str),

    #[error("failed to compile tool-call pattern: {0}")]
    Pattern(String),
}

// ---------------------------------------------------------------------------
// MarkerSet
// ---------------------------------------------------------------------------

/// The eight delimiter tokens that bound tool-call and tool-result regions.
///
/// Generated once at startup and shared read-only by every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerSet {
    pub call_start: String,
    pub call_end: String,
    pub name_start: String,
    pub name_end: String,
    pub args_start: String,
    pub args_end: String,
    pub result_start: String,
    pub result_end: String,
}

impl MarkerSet {
    /// Pick a marker set using the thread-local RNG.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::rng())
    }

    /// Pick a marker set from the given RNG. Seeded RNGs give reproducible sets.
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let triple = TRIPLES[rng.random_range(0..TRIPLES.len())];

        let first = rng.random_range(0..SUFFIXES.len());
        let mut second = rng.random_range(0..SUFFIXES.len() - 1);
        if second >= first {
            second += 1;
        }

        let set = Self::from_parts(triple, SUFFIXES[first], SUFFIXES[second]);
        debug_assert!(set.validate().is_ok(), "marker pools produced an invalid set");
        set
    }

    /// Build a marker set from one delimiter triple and two suffixes.
    ///
    /// Call, name and argument tokens share `call_suffix`; result tokens use
    /// `result_suffix`.
    pub fn from_parts(
        (open, end_mark, close): (&str, &str, &str),
        call_suffix: &str,
        result_suffix: &str,
    ) -> Self {
        let start = |suffix: &str, kw: &str| format!("{open}{suffix}{kw}{close}");
        let end = |suffix: &str, kw: &str| format!("{open}{end_mark}{suffix}{kw}{close}");

        Self {
            call_start: start(call_suffix, KW_CALL),
            call_end: end(call_suffix, KW_CALL),
            name_start: start(call_suffix, KW_NAME),
            name_end: end(call_suffix, KW_NAME),
            args_start: start(call_suffix, KW_ARGS),
            args_end: end(call_suffix, KW_ARGS),
            result_start: start(result_suffix, KW_RESULT),
            result_end: end(result_suffix, KW_RESULT),
        }
    }

    /// Build a marker set from explicit tokens, in the order of [`labeled`].
    ///
    /// [`labeled`]: MarkerSet::labeled
    pub fn from_tokens(tokens: [&str; 8]) -> Result<Self, MarkerError> {
        let [call_start, call_end, name_start, name_end, args_start, args_end, result_start, result_end] =
            tokens.map(str::to_string);
        let set = Self {
            call_start,
            call_end,
            name_start,
            name_end,
            args_start,
            args_end,
            result_start,
            result_end,
        };
        set.validate()?;
        Ok(set)
    }

    /// All tokens with their labels, in declaration order.
    pub fn labeled(&self) -> [(&'static str, &str); 8] {
        [
            ("call_start", &self.call_start),
            ("call_end", &self.call_end),
            ("name_start", &self.name_start),
            ("name_end", &self.name_end),
            ("args_start", &self.args_start),
            ("args_end", &self.args_end),
            ("result_start", &self.result_start),
            ("result_end", &self.result_end),
        ]
    }

    /// Check the invariants parsing depends on:
    /// - every token is non-empty
    /// - tokens are pairwise distinct and none contains another
    /// - no token overlaps itself, so the streaming holdback of
    ///   `call_start.len() - 1` bytes can never hide a real match
    pub fn validate(&self) -> Result<(), MarkerError> {
        let tokens = self.labeled();

        for (label, token) in &tokens {
            if token.is_empty() {
                return Err(MarkerError::Empty(label));
            }
            if is_self_overlapping(token) {
                return Err(MarkerError::SelfOverlapping(label));
            }
        }

        for (i, (label_a, a)) in tokens.iter().enumerate() {
            for (label_b, b) in tokens.iter().skip(i + 1) {
                if a == b {
                    return Err(MarkerError::Duplicate {
                        first: label_a,
                        second: label_b,
                    });
                }
                if b.contains(*a) {
                    return Err(MarkerError::Nested {
                        inner: label_a,
                        outer: label_b,
                    });
                }
                if a.contains(*b) {
                    return Err(MarkerError::Nested {
                        inner: label_b,
                        outer: label_a,
                    });
                }
            }
        }

        Ok(())
    }

    /// Render one tool call as a marker-delimited block.
    pub fn render_call(&self, name: &str, arguments: &str) -> String {
        format!(
            "{}\n{}{}{}\n{}{}{}\n{}",
            self.call_start,
            self.name_start,
            name,
            self.name_end,
            self.args_start,
            arguments,
            self.args_end,
            self.call_end,
        )
    }

    /// Render a tool result, prefixed with the tool that produced it.
    pub fn render_result(&self, tool_name: &str, content: &str) -> String {
        format!(
            "Result of {tool_name}:\n{}\n{content}\n{}",
            self.result_start, self.result_end
        )
    }

    /// Whether `text` contains any of the eight tokens.
    pub fn appears_in(&self, text: &str) -> bool {
        self.labeled().iter().any(|(_, token)| text.contains(*token))
    }
}

/// True when some proper prefix of `token` equals a proper suffix of it.
fn is_self_overlapping(token: &str) -> bool {
    let bytes = token.as_bytes();
    let n = bytes.len();
    (1..n).any(|k| bytes[..k] == bytes[n - k..])
}
