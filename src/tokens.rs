//! API tokens forwarded from the host into sandboxes.
//!
//! Tokens are read from the host environment and exported in front of
//! remote commands. Values never reach logs; diagnostic text is passed
//! through [`TokenSet::redact`] before it is surfaced.

use std::borrow::Cow;
use std::collections::BTreeMap;

/// Environment variables forwarded into sandboxes when set on the host.
pub const FORWARDABLE_TOKENS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "GEMINI_API_KEY",
    "OPENAI_API_KEY",
    "CLAUDE_API_KEY",
];

/// Forwardable tokens present on the host.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TokenSet {
    tokens: BTreeMap<String, String>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.tokens.iter().map(|(k, v)| (k, masked(v))))
            .finish()
    }
}

impl TokenSet {
    /// Collects every forwardable token set (and non-empty) in the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Collects forwardable tokens through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let tokens = FORWARDABLE_TOKENS
            .iter()
            .filter_map(|name| {
                lookup(name)
                    .filter(|value| !value.is_empty())
                    .map(|value| (name.to_string(), value))
            })
            .collect();
        Self { tokens }
    }

    /// Adds a token directly.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.tokens.insert(name.into(), value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Names of the tokens present.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tokens.keys().map(|k| k.as_str())
    }

    /// `(name, masked value)` pairs for display.
    pub fn masked_entries(&self) -> Vec<(String, String)> {
        self.tokens
            .iter()
            .map(|(name, value)| (name.clone(), masked(value)))
            .collect()
    }

    /// Replaces every token value in `text` with `[REDACTED:<NAME>]`.
    pub fn redact(&self, text: &str) -> String {
        // Longest first so a value containing another is not half-replaced.
        let mut entries: Vec<(&String, &String)> = self.tokens.iter().collect();
        entries.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        let mut result = text.to_string();
        for (name, value) in entries {
            result = result.replace(value.as_str(), &format!("[REDACTED:{}]", name));
        }
        result
    }

    /// Shell prefix exporting every token, e.g. `export A='x'; `.
    ///
    /// Empty when no tokens are present.
    pub fn export_prefix(&self) -> String {
        self.tokens
            .iter()
            .map(|(name, value)| {
                format!(
                    "export {}={}; ",
                    name,
                    shell_escape::unix::escape(Cow::Borrowed(value.as_str()))
                )
            })
            .collect()
    }
}

/// Masks a token for display: first and last four characters of values
/// longer than eight characters, `***` otherwise.
pub fn masked(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "***".to_string()
    }
}
