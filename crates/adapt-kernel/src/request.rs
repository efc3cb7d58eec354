//! Inbound descriptors and the finished response
//!
//! Ingress hands the engine a parsed [`RequestDescriptor`], storage a
//! [`ContentDescriptor`]; the engine hands back a [`Response`].

use crate::error::RenderError;
use crate::render::collect_body;
use adapt_signal::{BodyHandle, SignalValue};
use std::collections::BTreeMap;

/// Parsed request from ingress
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// Method, upper-case
    pub method: String,
    /// Path without the query string
    pub path: String,
    /// Protocol version
    pub version: String,
    /// Headers keyed by lower-case name
    pub headers: BTreeMap<String, String>,
    /// Decoded query parameters; the last occurrence wins
    pub query: BTreeMap<String, String>,
    /// Request body
    pub body: BodyHandle,
    /// Authenticated identity, if any
    pub identity: Option<String>,
}

impl RequestDescriptor {
    /// Request for `target`, which may carry a query string
    #[must_use]
    pub fn new(method: impl Into<String>, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (target, BTreeMap::new()),
        };
        Self {
            method: method.into().to_ascii_uppercase(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            version: "HTTP/1.1".to_string(),
            headers: BTreeMap::new(),
            query,
            body: BodyHandle::empty(),
            identity: None,
        }
    }

    /// `GET target`
    #[must_use]
    pub fn get(target: &str) -> Self {
        Self::new("GET", target)
    }

    /// With a header; names are folded to lower case
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// With a body
    #[must_use]
    pub fn with_body(mut self, body: BodyHandle) -> Self {
        self.body = body;
        self
    }

    /// With an authenticated identity
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// With a protocol version
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub(crate) fn headers_signal(&self) -> SignalValue {
        string_map(&self.headers)
    }

    pub(crate) fn query_signal(&self) -> SignalValue {
        string_map(&self.query)
    }
}

/// Content resolved by storage for the request
#[derive(Debug, Clone)]
pub struct ContentDescriptor {
    /// Front matter and other metadata
    pub metadata: serde_json::Value,
    /// Content body
    pub body: BodyHandle,
    /// Media type of the body
    pub content_type: Option<String>,
}

impl Default for ContentDescriptor {
    fn default() -> Self {
        Self {
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            body: BodyHandle::empty(),
            content_type: None,
        }
    }
}

impl ContentDescriptor {
    /// Empty content
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// With a body
    #[must_use]
    pub fn with_body(mut self, body: BodyHandle) -> Self {
        self.body = body;
        self
    }

    /// With a media type
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Finished response
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code
    pub status: u16,
    /// Headers in output order
    pub headers: Vec<(String, String)>,
    /// Streamed body
    pub body: BodyHandle,
}

impl Response {
    /// Generic error response; never carries extension details
    #[must_use]
    pub fn internal_error() -> Self {
        Self {
            status: 500,
            headers: vec![("content-type".to_string(), "text/plain; charset=utf-8".to_string())],
            body: BodyHandle::from_static("Internal Server Error"),
        }
    }

    /// First value of a header, case-insensitive
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a header, case-insensitive
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Drain the body into a string
    pub fn body_string(&self) -> Result<String, RenderError> {
        collect_body(&self.body)
    }
}

fn string_map(map: &BTreeMap<String, String>) -> SignalValue {
    SignalValue::Map(
        map.iter()
            .map(|(k, v)| (k.clone(), SignalValue::Str(v.clone())))
            .collect(),
    )
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect()
}

fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
