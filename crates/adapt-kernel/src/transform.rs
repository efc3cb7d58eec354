//! Transform Executor
//!
//! Host-side computations over signal values that may be large or streamed.
//! Bodies are consumed chunk by chunk and only a primitive result is handed
//! back to the script. Reading the target signal goes through the tracked
//! store, so a transform registers the same dependency as a plain read.

use crate::error::TransformFailure;
use crate::script::ScriptValue;
use adapt_signal::{SignalId, SignalStore, SignalValue};
use bytes::Bytes;
use lol_html::{element, HtmlRewriter, Settings};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cell::Cell;

/// Requested computation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformRequest {
    /// Whitespace-separated words
    WordCount,
    /// Length in bytes
    ByteLength,
    /// Non-overlapping regex matches; see [`REGEX_WINDOW`] for the span limit
    RegexCount {
        /// Pattern
        pattern: String,
    },
    /// Elements matching a CSS selector
    SelectorCount {
        /// Selector; sibling combinators are not supported
        selector: String,
    },
    /// Lowercase hex SHA-256
    Checksum,
    /// Whether a JSON pointer resolves
    JsonPointerExists {
        /// RFC 6901 pointer
        pointer: String,
    },
    /// Whether a map signal has a key
    HasKey {
        /// Key to look for
        key: String,
    },
}

impl TransformRequest {
    /// Stable op name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::WordCount => "word_count",
            Self::ByteLength => "byte_length",
            Self::RegexCount { .. } => "regex_count",
            Self::SelectorCount { .. } => "selector_count",
            Self::Checksum => "checksum",
            Self::JsonPointerExists { .. } => "json_pointer_exists",
            Self::HasKey { .. } => "has_key",
        }
    }

    /// Decode from a script value: either a bare name or a map with `op`
    pub fn from_script(value: &ScriptValue) -> Result<Self, TransformFailure> {
        let json = match value {
            ScriptValue::Str(name) => serde_json::json!({ "op": name }),
            other => other.to_json(),
        };
        let op = json.get("op").and_then(serde_json::Value::as_str).unwrap_or_default().to_string();
        serde_json::from_value(json).map_err(|e| {
            if matches!(
                op.as_str(),
                "word_count" | "byte_length" | "regex_count" | "selector_count" | "checksum" | "json_pointer_exists" | "has_key"
            ) {
                TransformFailure::MalformedDescriptor(e.to_string())
            } else {
                TransformFailure::UnknownTransform(op)
            }
        })
    }
}

/// Longest single-line span a regex pass holds back, in bytes
///
/// Regex work is line-buffered: a chunk is only settled once a newline
/// arrives. A body without newlines would otherwise be buffered whole, so
/// once more than this many unsettled bytes pile up everything but the last
/// `REGEX_WINDOW` bytes is settled. A match is only guaranteed to be found
/// when it does not span a newline and is shorter than this window.
pub const REGEX_WINDOW: usize = 4 * 1024;

/// Bounded carry between chunks for regex passes
#[derive(Debug)]
pub(crate) struct RegexWindow {
    carry: Vec<u8>,
    window: usize,
}

impl RegexWindow {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            carry: Vec::new(),
            window,
        }
    }

    /// Add a chunk and take the settled prefix, possibly empty
    ///
    /// Without a newline the cut lands `window` bytes before the end, moved
    /// forward past any match of `regexes` that straddles it.
    pub(crate) fn push(&mut self, chunk: &[u8], regexes: &[&regex::bytes::Regex]) -> Vec<u8> {
        self.carry.extend_from_slice(chunk);
        let cut = match self.carry.iter().rposition(|b| *b == b'\n') {
            Some(newline) => newline + 1,
            None if self.carry.len() > self.window => {
                let mut cut = self.carry.len() - self.window;
                for regex in regexes {
                    if let Some(m) = regex.find_iter(&self.carry).find(|m| m.end() > cut) {
                        if m.start() < cut {
                            cut = m.end();
                        }
                    }
                }
                cut
            }
            None => 0,
        };
        let rest = self.carry.split_off(cut);
        std::mem::replace(&mut self.carry, rest)
    }

    /// Whatever is still held back
    pub(crate) fn finish(self) -> Vec<u8> {
        self.carry
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.carry.len()
    }
}

/// Parse a CSS selector the markup rewriter can match
pub fn parse_selector(text: &str) -> Result<lol_html::Selector, TransformFailure> {
    text.parse::<lol_html::Selector>()
        .map_err(|e| TransformFailure::UnsupportedSelector(format!("{text}: {e}")))
}

/// Chunk-by-chunk fold over a signal's content
fn fold_chunks<S>(
    value: &SignalValue,
    init: S,
    mut step: impl FnMut(&mut S, &[u8]),
) -> Result<S, TransformFailure> {
    let mut state = init;
    match value {
        SignalValue::Body(body) => {
            for chunk in body.chunks() {
                let chunk: Bytes = chunk.map_err(|e| TransformFailure::Read(e.to_string()))?;
                step(&mut state, &chunk);
            }
        }
        SignalValue::Str(text) => step(&mut state, text.as_bytes()),
        other => {
            return Err(TransformFailure::NotApplicable(format!(
                "expected text or body, found {}",
                other.type_name()
            )));
        }
    }
    Ok(state)
}

fn count_words(value: &SignalValue) -> Result<i64, TransformFailure> {
    let (count, _) = fold_chunks(value, (0i64, false), |(count, in_word), chunk| {
        for byte in chunk {
            let space = byte.is_ascii_whitespace();
            if !space && !*in_word {
                *count += 1;
            }
            *in_word = !space;
        }
    })?;
    Ok(count)
}

fn count_regex(value: &SignalValue, pattern: &str) -> Result<i64, TransformFailure> {
    let regex = regex::bytes::Regex::new(pattern).map_err(|e| TransformFailure::InvalidPattern(e.to_string()))?;
    let (mut count, window) = fold_chunks(
        value,
        (0i64, RegexWindow::new(REGEX_WINDOW)),
        |(count, window), chunk| {
            let settled = window.push(chunk, &[&regex]);
            *count += regex.find_iter(&settled).count() as i64;
        },
    )?;
    count += regex.find_iter(&window.finish()).count() as i64;
    Ok(count)
}

fn count_selector(value: &SignalValue, selector: &str) -> Result<i64, TransformFailure> {
    parse_selector(selector)?;
    let count = Cell::new(0i64);
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![element!(selector, |_el| {
                count.set(count.get() + 1);
                Ok(())
            })],
            ..Settings::default()
        },
        |_: &[u8]| {},
    );
    let failure = fold_chunks(value, None, |failure: &mut Option<String>, chunk| {
        if failure.is_none() {
            *failure = rewriter.write(chunk).err().map(|e| e.to_string());
        }
    })?;
    if let Some(error) = failure {
        return Err(TransformFailure::Read(error));
    }
    rewriter.end().map_err(|e| TransformFailure::Read(e.to_string()))?;
    Ok(count.get())
}

fn checksum(value: &SignalValue) -> Result<String, TransformFailure> {
    let hasher = fold_chunks(value, Sha256::new(), |hasher, chunk| hasher.update(chunk))?;
    Ok(hex::encode(hasher.finalize()))
}

fn byte_length(value: &SignalValue) -> Result<i64, TransformFailure> {
    fold_chunks(value, 0i64, |len, chunk| *len += chunk.len() as i64)
}

fn pointer_exists(value: &SignalValue, pointer: &str) -> Result<bool, TransformFailure> {
    if !(pointer.is_empty() || pointer.starts_with('/')) {
        return Err(TransformFailure::MalformedDescriptor(format!("invalid JSON pointer `{pointer}`")));
    }
    match value {
        SignalValue::Body(_) => Err(TransformFailure::NotApplicable("JSON pointers need a structured value".into())),
        SignalValue::Str(text) => {
            let parsed: serde_json::Value =
                serde_json::from_str(text).map_err(|e| TransformFailure::NotApplicable(e.to_string()))?;
            Ok(parsed.pointer(pointer).is_some())
        }
        other => Ok(other.to_json().pointer(pointer).is_some()),
    }
}

fn has_key(value: &SignalValue, key: &str) -> Result<bool, TransformFailure> {
    match value {
        SignalValue::Map(map) => Ok(map.contains_key(key)),
        other => Err(TransformFailure::NotApplicable(format!(
            "has_key needs a map, found {}",
            other.type_name()
        ))),
    }
}

/// Run `request` over the signal `id`
pub fn execute(store: &SignalStore, id: SignalId, request: &TransformRequest) -> Result<ScriptValue, TransformFailure> {
    let value = store
        .get(id)
        .map_err(|e| TransformFailure::NotApplicable(e.to_string()))?;
    let result = match request {
        TransformRequest::WordCount => ScriptValue::Int(count_words(&value)?),
        TransformRequest::ByteLength => ScriptValue::Int(byte_length(&value)?),
        TransformRequest::RegexCount { pattern } => ScriptValue::Int(count_regex(&value, pattern)?),
        TransformRequest::SelectorCount { selector } => ScriptValue::Int(count_selector(&value, selector)?),
        TransformRequest::Checksum => ScriptValue::Str(checksum(&value)?),
        TransformRequest::JsonPointerExists { pointer } => ScriptValue::Bool(pointer_exists(&value, pointer)?),
        TransformRequest::HasKey { key } => ScriptValue::Bool(has_key(&value, key)?),
    };
    tracing::trace!(signal = id.0, ?request, "transform computed");
    Ok(result)
}

/// Like [`execute`], but failures become an error sentinel
#[must_use]
pub fn execute_or_sentinel(store: &SignalStore, id: SignalId, request: &TransformRequest) -> ScriptValue {
    execute(store, id, request).unwrap_or_else(|failure| {
        tracing::debug!(%failure, "transform failed");
        ScriptValue::Error(failure.code().to_string())
    })
}
