//! Render collaborators
//!
//! The Theme reaches three black-box engines during Apply: a markup
//! rewriter applying resolved transforms to a body, a structured-data query,
//! and a template engine. Markup goes through `lol_html`, templates through
//! `handlebars`.

use crate::error::RenderError;
use crate::proposal::{InsertPosition, TransformDescriptor, TransformOp};
use crate::transform::{parse_selector, RegexWindow, REGEX_WINDOW};
use adapt_signal::BodyHandle;
use bytes::Bytes;
use handlebars::Handlebars;
use lol_html::html_content::ContentType;
use lol_html::{element, HtmlRewriter, Settings};
use regex::bytes::Regex;
use std::fmt;
use std::sync::Arc;

/// Applies transforms to a body
pub trait MarkupRewriter: Send + Sync {
    /// Produce the rewritten body
    fn rewrite(&self, body: &BodyHandle, transforms: &[TransformDescriptor]) -> Result<BodyHandle, RenderError>;
}

/// Evaluates a query over structured data
pub trait DataQuery: Send + Sync {
    /// Run `query` against `data`
    fn query(&self, data: &serde_json::Value, query: &str) -> Result<serde_json::Value, RenderError>;
}

/// Renders a template with a model
pub trait TemplateEngine: Send + Sync {
    /// Render `template`
    fn render(&self, template: &str, model: &serde_json::Value) -> Result<String, RenderError>;
}

/// The three render collaborators
#[derive(Clone)]
pub struct RenderEngines {
    /// Markup rewriting
    pub markup: Arc<dyn MarkupRewriter>,
    /// Data queries
    pub query: Arc<dyn DataQuery>,
    /// Templating
    pub template: Arc<dyn TemplateEngine>,
}

impl fmt::Debug for RenderEngines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderEngines").finish_non_exhaustive()
    }
}

impl Default for RenderEngines {
    fn default() -> Self {
        Self {
            markup: Arc::new(StreamingRewriter),
            query: Arc::new(JsonPointerQuery),
            template: Arc::new(HandlebarsTemplate::new()),
        }
    }
}

const OUTPUT_CHUNK: usize = 8 * 1024;

/// Chunk-streaming rewriter
///
/// Regex replacements run first over a bounded line window (see
/// [`REGEX_WINDOW`]). Element transforms then run through a streaming
/// `lol_html` rewriter, so the body is never parsed as a whole.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamingRewriter;

struct ElementRule {
    selector: String,
    op: TransformOp,
    position: Option<InsertPosition>,
}

#[derive(Default)]
struct Output {
    chunks: Vec<Bytes>,
    buffer: Vec<u8>,
}

impl Output {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() >= OUTPUT_CHUNK {
            self.chunks.push(Bytes::from(std::mem::take(&mut self.buffer)));
        }
    }

    fn finish(mut self) -> Vec<Bytes> {
        if !self.buffer.is_empty() {
            self.chunks.push(Bytes::from(self.buffer));
        }
        self.chunks
    }
}

/// Stream `body` through the regex replacements, emitting settled text
fn regex_pass(
    body: &BodyHandle,
    regexes: &[(Regex, Vec<u8>)],
    mut emit: impl FnMut(&[u8]) -> Result<(), RenderError>,
) -> Result<(), RenderError> {
    let patterns: Vec<&Regex> = regexes.iter().map(|(regex, _)| regex).collect();
    let replace = |mut text: Vec<u8>| {
        for (regex, replacement) in regexes {
            text = regex.replace_all(&text, replacement.as_slice()).into_owned();
        }
        text
    };
    let mut window = RegexWindow::new(REGEX_WINDOW);
    for chunk in body.chunks() {
        let chunk = chunk?;
        if regexes.is_empty() {
            emit(&chunk)?;
            continue;
        }
        let settled = window.push(&chunk, &patterns);
        if !settled.is_empty() {
            emit(&replace(settled))?;
        }
    }
    let rest = window.finish();
    if !rest.is_empty() {
        emit(&replace(rest))?;
    }
    Ok(())
}

fn rewrite_error(error: impl fmt::Display) -> RenderError {
    RenderError::Rewrite(error.to_string())
}

impl MarkupRewriter for StreamingRewriter {
    fn rewrite(&self, body: &BodyHandle, transforms: &[TransformDescriptor]) -> Result<BodyHandle, RenderError> {
        let mut regexes = Vec::new();
        let mut rules = Vec::new();
        for descriptor in transforms {
            match &descriptor.op {
                TransformOp::RegexReplace { pattern, replacement } => {
                    let regex = Regex::new(pattern).map_err(|e| RenderError::InvalidRegex {
                        pattern: pattern.clone(),
                        error: e.to_string(),
                    })?;
                    regexes.push((regex, replacement.clone().into_bytes()));
                }
                op => {
                    let selector = descriptor.selector.clone().unwrap_or_default();
                    parse_selector(&selector).map_err(|e| RenderError::Unsupported(e.to_string()))?;
                    rules.push(ElementRule {
                        selector,
                        op: op.clone(),
                        position: descriptor.position,
                    });
                }
            }
        }
        if regexes.is_empty() && rules.is_empty() {
            return Ok(body.clone());
        }

        let mut out = Output::default();
        if rules.is_empty() {
            regex_pass(body, &regexes, |bytes| {
                out.push(bytes);
                Ok(())
            })?;
            return Ok(BodyHandle::from_chunks(out.finish()));
        }

        let mut handlers = Vec::with_capacity(rules.len());
        for ElementRule { selector, op, position } in rules {
            handlers.push(element!(selector.as_str(), move |el| {
                match &op {
                    TransformOp::InsertHtml { html } => match position {
                        Some(InsertPosition::Before) => el.before(html, ContentType::Html),
                        Some(InsertPosition::Prepend) => el.prepend(html, ContentType::Html),
                        Some(InsertPosition::Append) => el.append(html, ContentType::Html),
                        Some(InsertPosition::After) | None => el.after(html, ContentType::Html),
                    },
                    TransformOp::ReplaceInner { html } => el.set_inner_content(html, ContentType::Html),
                    TransformOp::SetAttribute { name, value } => el.set_attribute(name, value)?,
                    TransformOp::RemoveElement => el.remove(),
                    TransformOp::RegexReplace { .. } => {}
                }
                Ok(())
            }));
        }
        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: handlers,
                ..Settings::default()
            },
            |chunk: &[u8]| out.push(chunk),
        );
        regex_pass(body, &regexes, |bytes| rewriter.write(bytes).map_err(rewrite_error))?;
        rewriter.end().map_err(rewrite_error)?;
        Ok(BodyHandle::from_chunks(out.finish()))
    }
}

/// JSON-pointer data query
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPointerQuery;

impl DataQuery for JsonPointerQuery {
    fn query(&self, data: &serde_json::Value, query: &str) -> Result<serde_json::Value, RenderError> {
        if !(query.is_empty() || query.starts_with('/')) {
            return Err(RenderError::Query(format!("`{query}` is not a JSON pointer")));
        }
        Ok(data.pointer(query).cloned().unwrap_or(serde_json::Value::Null))
    }
}

/// Handlebars templates
///
/// `{{title}}` inserts the HTML-escaped value, `{{{html}}}` inserts it raw.
/// Missing values render empty.
pub struct HandlebarsTemplate {
    registry: Handlebars<'static>,
}

impl fmt::Debug for HandlebarsTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlebarsTemplate").finish_non_exhaustive()
    }
}

impl HandlebarsTemplate {
    /// Non-strict registry with the default HTML escaping
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Handlebars::new(),
        }
    }
}

impl Default for HandlebarsTemplate {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine for HandlebarsTemplate {
    fn render(&self, template: &str, model: &serde_json::Value) -> Result<String, RenderError> {
        self.registry
            .render_template(template, model)
            .map_err(|e| RenderError::Template(e.to_string()))
    }
}

/// Collect a body into a string; only used on engine-side bodies
pub fn collect_body(body: &BodyHandle) -> Result<String, RenderError> {
    let mut bytes = Vec::new();
    for chunk in body.chunks() {
        bytes.extend_from_slice(&chunk?);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::TransformConditions;

    fn descriptor(op: TransformOp, selector: Option<&str>, position: Option<InsertPosition>) -> TransformDescriptor {
        TransformDescriptor {
            op,
            selector: selector.map(str::to_string),
            position,
            conditions: TransformConditions::default(),
        }
    }

    fn rewrite(chunks: &[&'static str], transforms: &[TransformDescriptor]) -> String {
        let body = BodyHandle::from_chunks(chunks.iter().map(|c| Bytes::from_static(c.as_bytes())));
        collect_body(&StreamingRewriter.rewrite(&body, transforms).unwrap()).unwrap()
    }

    #[test]
    fn inserts_at_every_position() {
        let html = |p| {
            descriptor(
                TransformOp::InsertHtml {
                    html: format!("[{p:?}]"),
                },
                Some("main"),
                Some(p),
            )
        };
        let out = rewrite(
            &["<body><main><p>x</p></main></body>"],
            &[
                html(InsertPosition::Before),
                html(InsertPosition::Prepend),
                html(InsertPosition::Append),
                html(InsertPosition::After),
            ],
        );
        assert_eq!(out, "<body>[Before]<main>[Prepend]<p>x</p>[Append]</main>[After]</body>");
    }

    #[test]
    fn replace_and_remove_respect_nesting() {
        let out = rewrite(
            &["<div class=\"a\"><div>in", "ner</div></div><div>keep</div>"],
            &[descriptor(
                TransformOp::ReplaceInner { html: "new".into() },
                Some("div.a"),
                None,
            )],
        );
        assert_eq!(out, "<div class=\"a\">new</div><div>keep</div>");

        let out = rewrite(
            &["<p>a</p><aside id=\"ad\"><p>b</p></aside><p>c</p>"],
            &[descriptor(TransformOp::RemoveElement, Some("#ad"), None)],
        );
        assert_eq!(out, "<p>a</p><p>c</p>");
    }

    #[test]
    fn set_attribute_rewrites_tag() {
        let set = |name: &str, value: &str, selector: &str| {
            descriptor(
                TransformOp::SetAttribute {
                    name: name.into(),
                    value: value.into(),
                },
                Some(selector),
                None,
            )
        };
        let out = rewrite(
            &["<img src=\"a.png\"><a href=\"/x\">x</a><a name=\"top\">y</a>"],
            &[set("loading", "lazy", "img"), set("rel", "nofollow", "a[href]")],
        );
        assert_eq!(
            out,
            "<img src=\"a.png\" loading=\"lazy\"><a href=\"/x\" rel=\"nofollow\">x</a><a name=\"top\">y</a>"
        );

        let out = rewrite(&["<img src=\"a.png\">"], &[set("src", "b.png", "img")]);
        assert_eq!(out, "<img src=\"b.png\">");
    }

    #[test]
    fn combinators_select_nested_elements() {
        let out = rewrite(
            &["<main><p>a</p><div><p>b</p></div></main><p>c</p>"],
            &[descriptor(
                TransformOp::ReplaceInner { html: "x".into() },
                Some("main > p"),
                None,
            )],
        );
        assert_eq!(out, "<main><p>x</p><div><p>b</p></div></main><p>c</p>");
    }

    #[test]
    fn sibling_selectors_are_refused() {
        let body = BodyHandle::from_static("<p>a</p>");
        let err = StreamingRewriter
            .rewrite(&body, &[descriptor(TransformOp::RemoveElement, Some("p + p"), None)])
            .unwrap_err();
        assert!(matches!(err, RenderError::Unsupported(_)));
    }

    #[test]
    fn single_line_regex_bodies_stream() {
        let line = "<span>old</span>".repeat(REGEX_WINDOW / 4);
        let chunks: Vec<Bytes> = line.as_bytes().chunks(1000).map(Bytes::copy_from_slice).collect();
        let body = BodyHandle::from_chunks(chunks);
        let out = StreamingRewriter
            .rewrite(
                &body,
                &[descriptor(
                    TransformOp::RegexReplace {
                        pattern: "old".into(),
                        replacement: "new".into(),
                    },
                    None,
                    None,
                )],
            )
            .unwrap();
        assert!(out.chunks().count() > 1);
        assert_eq!(collect_body(&out).unwrap(), line.replace("old", "new"));
    }

    #[test]
    fn regex_runs_before_elements() {
        let out = rewrite(
            &["<h1>Old ti", "tle</h1>\n<p>Old</p>"],
            &[
                descriptor(TransformOp::InsertHtml { html: "!".into() }, Some("h1"), Some(InsertPosition::Append)),
                descriptor(
                    TransformOp::RegexReplace {
                        pattern: "Old".into(),
                        replacement: "New".into(),
                    },
                    None,
                    None,
                ),
            ],
        );
        assert_eq!(out, "<h1>New title!</h1>\n<p>New</p>");
    }

    #[test]
    fn templates_escape_by_default() {
        let model = serde_json::json!({"title": "<b>Hi</b>", "tags": ["a", "b"], "n": 3});
        let out = HandlebarsTemplate::new()
            .render("{{ title }}|{{{title}}}|{{tags.[1]}}|{{ n }}|{{ missing }}", &model)
            .unwrap();
        assert_eq!(out, "&lt;b&gt;Hi&lt;/b&gt;|<b>Hi</b>|b|3|");
        assert!(HandlebarsTemplate::new().render("{{#if title}}open", &model).is_err());
    }

    #[test]
    fn pointer_queries() {
        let data = serde_json::json!({"a": {"b": 1}});
        assert_eq!(JsonPointerQuery.query(&data, "/a/b").unwrap(), 1);
        assert_eq!(JsonPointerQuery.query(&data, "/z").unwrap(), serde_json::Value::Null);
        assert!(JsonPointerQuery.query(&data, "a").is_err());
    }
}
