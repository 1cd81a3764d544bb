//! Structured Nix expressions.
//!
//! Values that come from users (names, keys, identities) only ever enter a
//! generated file as [`NixExpr::Str`], which is escaped on rendering.
//! [`NixExpr::Ref`] is reserved for references the generator itself spells
//! out, such as `microvm.nixosModules.microvm`.

use std::fmt::{self, Write};

/// A Nix expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum NixExpr {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<NixExpr>),
    /// Attribute set; keys are attribute paths such as `host.port`.
    Attrs(Vec<(String, NixExpr)>),
    /// Verbatim reference to a variable or attribute path.
    Ref(String),
    /// `{ a, b, ... }: body`
    Function {
        params: Vec<String>,
        ellipsis: bool,
        body: Box<NixExpr>,
    },
    /// `f arg`
    Apply(Box<NixExpr>, Box<NixExpr>),
}

impl NixExpr {
    pub fn str(value: impl Into<String>) -> Self {
        NixExpr::Str(value.into())
    }

    pub fn reference(path: impl Into<String>) -> Self {
        NixExpr::Ref(path.into())
    }

    pub fn list(items: impl IntoIterator<Item = NixExpr>) -> Self {
        NixExpr::List(items.into_iter().collect())
    }

    /// List of strings.
    pub fn strs<S: Into<String>>(items: impl IntoIterator<Item = S>) -> Self {
        NixExpr::List(items.into_iter().map(NixExpr::str).collect())
    }

    pub fn attrs() -> AttrsBuilder {
        AttrsBuilder::default()
    }

    pub fn function(params: &[&str], body: NixExpr) -> Self {
        NixExpr::Function {
            params: params.iter().map(|p| p.to_string()).collect(),
            ellipsis: true,
            body: Box::new(body),
        }
    }

    pub fn apply(function: NixExpr, argument: NixExpr) -> Self {
        NixExpr::Apply(Box::new(function), Box::new(argument))
    }

    /// Renders the expression as Nix source.
    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_to(&mut out, 0);
        out
    }

    fn write_to(&self, out: &mut String, indent: usize) -> fmt::Result {
        match self {
            NixExpr::Str(value) => write!(out, "\"{}\"", escape_string(value)),
            NixExpr::Int(value) => write!(out, "{}", value),
            NixExpr::Bool(value) => write!(out, "{}", value),
            NixExpr::Ref(path) => out.write_str(path),
            NixExpr::List(items) if items.is_empty() => out.write_str("[ ]"),
            NixExpr::List(items) if items.iter().all(NixExpr::is_atom) => {
                out.write_str("[")?;
                for item in items {
                    out.write_char(' ')?;
                    item.write_to(out, indent)?;
                }
                out.write_str(" ]")
            }
            NixExpr::List(items) => {
                out.write_str("[\n")?;
                for item in items {
                    pad(out, indent + 1)?;
                    if matches!(item, NixExpr::Function { .. } | NixExpr::Apply(..)) {
                        out.write_char('(')?;
                        item.write_to(out, indent + 1)?;
                        out.write_char(')')?;
                    } else {
                        item.write_to(out, indent + 1)?;
                    }
                    out.write_char('\n')?;
                }
                pad(out, indent)?;
                out.write_char(']')
            }
            NixExpr::Attrs(entries) if entries.is_empty() => out.write_str("{ }"),
            NixExpr::Attrs(entries) => {
                out.write_str("{\n")?;
                for (key, value) in entries {
                    pad(out, indent + 1)?;
                    write!(out, "{} = ", render_attr_path(key))?;
                    value.write_to(out, indent + 1)?;
                    out.write_str(";\n")?;
                }
                pad(out, indent)?;
                out.write_char('}')
            }
            NixExpr::Function {
                params,
                ellipsis,
                body,
            } => {
                let mut all: Vec<&str> = params.iter().map(String::as_str).collect();
                if *ellipsis {
                    all.push("...");
                }
                write!(out, "{{ {} }}: ", all.join(", "))?;
                body.write_to(out, indent)
            }
            NixExpr::Apply(function, argument) => {
                function.write_to(out, indent)?;
                out.write_char(' ')?;
                if argument.is_atom() || matches!(**argument, NixExpr::Attrs(_) | NixExpr::List(_)) {
                    argument.write_to(out, indent)
                } else {
                    out.write_char('(')?;
                    argument.write_to(out, indent)?;
                    out.write_char(')')
                }
            }
        }
    }

    fn is_atom(&self) -> bool {
        matches!(
            self,
            NixExpr::Str(_) | NixExpr::Int(_) | NixExpr::Bool(_) | NixExpr::Ref(_)
        )
    }
}

impl fmt::Display for NixExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for NixExpr {
    fn from(value: &str) -> Self {
        NixExpr::str(value)
    }
}

impl From<String> for NixExpr {
    fn from(value: String) -> Self {
        NixExpr::Str(value)
    }
}

impl From<bool> for NixExpr {
    fn from(value: bool) -> Self {
        NixExpr::Bool(value)
    }
}

impl From<u32> for NixExpr {
    fn from(value: u32) -> Self {
        NixExpr::Int(i64::from(value))
    }
}

impl From<u16> for NixExpr {
    fn from(value: u16) -> Self {
        NixExpr::Int(i64::from(value))
    }
}

/// Incremental construction of an attribute set, preserving insertion order.
#[derive(Debug, Default)]
pub struct AttrsBuilder {
    entries: Vec<(String, NixExpr)>,
}

impl AttrsBuilder {
    pub fn set(mut self, key: impl Into<String>, value: impl Into<NixExpr>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    pub fn build(self) -> NixExpr {
        NixExpr::Attrs(self.entries)
    }
}

impl From<AttrsBuilder> for NixExpr {
    fn from(builder: AttrsBuilder) -> Self {
        builder.build()
    }
}

fn pad(out: &mut String, indent: usize) -> fmt::Result {
    for _ in 0..indent {
        out.write_str("  ")?;
    }
    Ok(())
}

/// Escapes text for a double-quoted Nix string.
///
/// Control characters other than newline, carriage return and tab have no
/// escape in Nix and are dropped.
pub fn escape_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '$' if chars.peek() == Some(&'{') => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

/// Returns true if `segment` can appear unquoted in an attribute path.
fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '\''))
}

/// Renders a dotted attribute path, quoting segments that need it.
fn render_attr_path(path: &str) -> String {
    path.split('.')
        .map(|segment| {
            if is_identifier(segment) {
                segment.to_string()
            } else {
                format!("\"{}\"", escape_string(segment))
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}
