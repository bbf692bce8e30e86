//! Purpose: Provide the internal JSON decode entrypoints and error categories.
//! Exports: `from_slice`, `ParseFailureCategory`, `categorize_error`, `snippet`, `value_kind`.
//! Role: Parser boundary that centralizes serde_json usage details.
//! Invariants: Category labels are stable; diagnostics never echo more than `SNIPPET_BYTES`.
//! Notes: Error mapping to crate errors is done by callsites so domain context stays explicit.

use bstr::ByteSlice;
use serde::de::DeserializeOwned;

pub(crate) const SNIPPET_BYTES: usize = 48;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ParseFailureCategory {
    Syntax,
    Eof,
    Data,
    Io,
}

impl ParseFailureCategory {
    pub(crate) fn label(self) -> &'static str {
        match self {
            ParseFailureCategory::Syntax => "syntax",
            ParseFailureCategory::Eof => "truncated",
            ParseFailureCategory::Data => "data",
            ParseFailureCategory::Io => "io",
        }
    }
}

pub(crate) fn from_slice<T: DeserializeOwned>(input: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(input)
}

pub(crate) fn categorize_error(err: &serde_json::Error) -> ParseFailureCategory {
    match err.classify() {
        serde_json::error::Category::Syntax => ParseFailureCategory::Syntax,
        serde_json::error::Category::Eof => ParseFailureCategory::Eof,
        serde_json::error::Category::Data => ParseFailureCategory::Data,
        serde_json::error::Category::Io => ParseFailureCategory::Io,
    }
}

/// Lossy, bounded rendering of raw input for diagnostics.
pub(crate) fn snippet(input: &[u8]) -> String {
    let text = input.to_str_lossy();
    if text.len() <= SNIPPET_BYTES {
        return text.into_owned();
    }
    let mut end = SNIPPET_BYTES - 3;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

pub(crate) fn value_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
