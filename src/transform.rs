use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use anyhow::{Context as AnyhowContext, Result};
use futures_util::future::{join_all, LocalBoxFuture};
use futures_util::FutureExt;
use kuchiki::traits::*;
use kuchiki::{parse_html, NodeRef};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::css::{parse_stylesheet, remove_import_clause, rewrite_css_urls, CssRule, ScannedRule};
use crate::env::Environment;
use crate::path::resolve_path;
use crate::source::{SourceHandle, SourceOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributePair {
    pub name: String,
    pub value: String,
}

/// One stylesheet of a parsed source: either an introspectable rule tree, or
/// preserved markup when rule access was not possible (cross-origin links).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StyleRecord {
    Rules {
        attributes: Vec<AttributePair>,
        rules: Vec<CssRule>,
        /// Stylesheet text with inlined import clauses removed and URLs
        /// rewritten; what a mount target emits verbatim.
        text: String,
    },
    Raw {
        outer_markup: String,
        locator: String,
        attributes: Vec<AttributePair>,
    },
}

/// One script of a parsed source. `text_content` is populated for inline
/// scripts and for external scripts whose source was fetched and embedded;
/// an external script left as a reference carries only `source_locator`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub content_type: String,
    pub attributes: Vec<AttributePair>,
    pub text_content: Option<String>,
    pub source_locator: Option<String>,
}

impl ScriptRecord {
    /// Classic JavaScript, eligible for sandboxed execution.
    pub fn is_classic(&self) -> bool {
        matches!(
            self.content_type.as_str(),
            "text/javascript" | "application/javascript" | "text/ecmascript" | ""
        )
    }
}

/// Any other element, preserved as serialized markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementRecord {
    pub tag: String,
    pub outer_markup: String,
    pub attributes: Vec<AttributePair>,
}

/// The three typed resource lists a mount target consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedSource {
    pub styles: Vec<StyleRecord>,
    pub scripts: Vec<ScriptRecord>,
    pub elements: Vec<ElementRecord>,
}

/// Parse a fetched source into typed resource lists. Idempotent: the result
/// is cached on the resource after the first computation, and repeated calls
/// return the identical object.
pub async fn parse_source(
    env: &Rc<Environment>,
    source: &SourceHandle,
    inject_style: Option<&str>,
    inject_script: Option<&str>,
) -> Result<Rc<ParsedSource>> {
    source
        .ready()
        .await
        .with_context(|| format!("source {} failed to load", source.locator()))?;

    if let Some(cached) = source.cached_parse() {
        return Ok(cached);
    }

    let abs_root = source.abs_root().or_else(|| env.abs_root());
    let base = source.locator().to_string();
    let nodes = collect_nodes(&source.text(), inject_style, inject_script);

    // Sibling nodes overlap; each node's own import chain stays sequential.
    let outputs = join_all(
        nodes
            .iter()
            .map(|node| process_node(env, node, &base, abs_root.as_deref())),
    )
    .await;

    let mut parsed = ParsedSource::default();
    for output in outputs {
        parsed.styles.extend(output.styles);
        parsed.scripts.extend(output.scripts);
        parsed.elements.extend(output.elements);
    }

    let parsed = Rc::new(parsed);
    source.store_parse(Rc::clone(&parsed));
    Ok(parsed)
}

struct RawNode {
    tag: String,
    attributes: Vec<AttributePair>,
    text: String,
    outer: String,
}

impl RawNode {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| attr.value.as_str())
    }

    fn synthetic(tag: &str, text: &str) -> Self {
        Self {
            tag: tag.to_string(),
            attributes: Vec::new(),
            text: text.to_string(),
            outer: String::new(),
        }
    }
}

#[derive(Default)]
struct NodeOutput {
    styles: Vec<StyleRecord>,
    scripts: Vec<ScriptRecord>,
    elements: Vec<ElementRecord>,
}

/// Extract head nodes then body nodes, in document order, dropping text and
/// comment nodes. Injected style/script land at the end of their section.
fn collect_nodes(html: &str, inject_style: Option<&str>, inject_script: Option<&str>) -> Vec<RawNode> {
    let document = parse_html().one(html);
    let mut nodes = Vec::new();

    let mut extend_from = |selector: &str, nodes: &mut Vec<RawNode>| {
        if let Ok(section) = document.select_first(selector) {
            for child in section.as_node().children() {
                if let Some(raw) = raw_node(&child) {
                    nodes.push(raw);
                }
            }
        }
    };

    extend_from("head", &mut nodes);
    if let Some(text) = inject_style {
        nodes.push(RawNode::synthetic("style", text));
    }
    extend_from("body", &mut nodes);
    if let Some(text) = inject_script {
        nodes.push(RawNode::synthetic("script", text));
    }

    nodes
}

fn raw_node(node: &NodeRef) -> Option<RawNode> {
    let element = node.as_element()?;
    let attributes = element
        .attributes
        .borrow()
        .map
        .iter()
        .map(|(name, attr)| AttributePair {
            name: name.local.to_string(),
            value: attr.value.clone(),
        })
        .collect();

    Some(RawNode {
        tag: element.name.local.to_string().to_ascii_lowercase(),
        attributes,
        text: node.text_contents(),
        outer: outer_markup(node),
    })
}

fn outer_markup(node: &NodeRef) -> String {
    let mut buf = Vec::new();
    match node.serialize(&mut buf) {
        Ok(()) => String::from_utf8_lossy(&buf).into_owned(),
        Err(_) => String::new(),
    }
}

async fn process_node(
    env: &Rc<Environment>,
    node: &RawNode,
    base: &str,
    abs_root: Option<&str>,
) -> NodeOutput {
    let mut output = NodeOutput::default();

    match node.tag.as_str() {
        "style" => {
            let record = style_record_from_text(
                env,
                node.text.clone(),
                base.to_string(),
                abs_root.map(str::to_string),
                node.attributes.clone(),
                Rc::new(RefCell::new(HashSet::new())),
            )
            .await;
            output.styles.push(record);
        }
        "link" if is_stylesheet_link(node) => {
            let href = node.attr("href").unwrap_or("");
            let link = resolve_path(base, href, abs_root);
            let sheet = env.import_source(
                &link,
                SourceOptions {
                    base_url: Some(base.to_string()),
                    abs_root: abs_root.map(str::to_string),
                    loaders: None,
                },
            );
            let introspectable = matches!(sheet.ready().await, Ok(())) && sheet.fetched();
            if introspectable {
                let record = style_record_from_text(
                    env,
                    sheet.text(),
                    link.clone(),
                    abs_root.map(str::to_string),
                    node.attributes.clone(),
                    Rc::new(RefCell::new(HashSet::new())),
                )
                .await;
                output.styles.push(record);
            } else {
                error!(target: "transform", locator = %link, "stylesheet link not introspectable, preserving markup");
                output.styles.push(StyleRecord::Raw {
                    outer_markup: link_fallback_markup(&node.attributes, &link),
                    locator: link,
                    attributes: node.attributes.clone(),
                });
            }
        }
        "script" => {
            if let Some(record) = script_record(env, node, base, abs_root).await {
                output.scripts.push(record);
            }
        }
        "base" if abs_root.is_some() => {
            let root = abs_root.expect("guarded by match arm");
            output.elements.push(ElementRecord {
                tag: "base".to_string(),
                outer_markup: format!("<base href=\"{root}\" />"),
                attributes: vec![AttributePair {
                    name: "href".to_string(),
                    value: root.to_string(),
                }],
            });
        }
        _ => {
            output.elements.push(ElementRecord {
                tag: node.tag.clone(),
                outer_markup: node.outer.clone(),
                attributes: node.attributes.clone(),
            });
        }
    }

    output
}

fn is_stylesheet_link(node: &RawNode) -> bool {
    node.attr("rel")
        .is_some_and(|rel| rel.eq_ignore_ascii_case("stylesheet"))
}

async fn script_record(
    env: &Rc<Environment>,
    node: &RawNode,
    base: &str,
    abs_root: Option<&str>,
) -> Option<ScriptRecord> {
    let content_type = match node.attr("type").map(str::trim) {
        Some("") | None => "text/javascript".to_string(),
        Some(explicit) => explicit.to_ascii_lowercase(),
    };

    if let Some(src) = node.attr("src").map(str::trim).filter(|s| !s.is_empty()) {
        let resolved = resolve_path(base, src, abs_root);
        let fetched_source = env.import_source(
            &resolved,
            SourceOptions {
                base_url: Some(base.to_string()),
                abs_root: abs_root.map(str::to_string),
                loaders: None,
            },
        );
        let text_content = match fetched_source.ready().await {
            Ok(()) if fetched_source.fetched() => Some(fetched_source.text()),
            Ok(()) => None,
            Err(err) => {
                error!(target: "transform", locator = %resolved, %err, "script source not fetched, keeping reference");
                None
            }
        };
        return Some(ScriptRecord {
            content_type,
            attributes: node.attributes.clone(),
            text_content,
            source_locator: Some(resolved),
        });
    }

    if node.text.trim().is_empty() {
        return None;
    }

    Some(ScriptRecord {
        content_type,
        attributes: node.attributes.clone(),
        text_content: Some(node.text.clone()),
        source_locator: None,
    })
}

/// Build the rule tree for one stylesheet, inlining every reachable
/// `@import` and rewriting relative URLs. `seen` breaks import cycles: a
/// locator already on the current chain keeps its `@import` rule instead of
/// recursing forever.
fn style_record_from_text<'a>(
    env: &'a Rc<Environment>,
    text: String,
    base: String,
    abs_root: Option<String>,
    attributes: Vec<AttributePair>,
    seen: Rc<RefCell<HashSet<String>>>,
) -> LocalBoxFuture<'a, StyleRecord> {
    async move {
        let scanned = parse_stylesheet(&text);
        let mut css_text = text;
        let mut rules = Vec::new();

        for rule in scanned {
            match rule {
                ScannedRule::Selector { selector, content } => {
                    rules.push(CssRule::Selector {
                        selector,
                        content: rewrite_css_urls(&content, &base, abs_root.as_deref()),
                    });
                }
                ScannedRule::Conditional {
                    condition,
                    rules: nested,
                } => {
                    rules.push(CssRule::Conditional {
                        condition,
                        rules: convert_nested(nested, &base, abs_root.as_deref()),
                    });
                }
                ScannedRule::Raw { css_text } => {
                    rules.push(CssRule::Raw { css_text });
                }
                ScannedRule::Import { href, clause } => {
                    let resolved = resolve_path(&base, &href, abs_root.as_deref());
                    if seen.borrow().contains(&resolved) {
                        rules.push(CssRule::Import { href: resolved });
                        continue;
                    }
                    let imported = env.import_source(
                        &resolved,
                        SourceOptions {
                            base_url: Some(base.clone()),
                            abs_root: abs_root.clone(),
                            loaders: None,
                        },
                    );
                    let inlinable =
                        matches!(imported.ready().await, Ok(())) && imported.fetched();
                    if inlinable {
                        seen.borrow_mut().insert(resolved.clone());
                        let record = style_record_from_text(
                            env,
                            imported.text(),
                            resolved,
                            abs_root.clone(),
                            Vec::new(),
                            Rc::clone(&seen),
                        )
                        .await;
                        if let StyleRecord::Rules { rules: inner, .. } = record {
                            rules.extend(inner);
                        }
                        css_text = remove_import_clause(&css_text, &clause);
                    } else {
                        // Unreachable (often cross-origin) imports keep their
                        // clause so downstream rendering still works.
                        error!(target: "transform", locator = %resolved, "import not inlinable, keeping @import rule");
                        rules.push(CssRule::Import { href: resolved });
                    }
                }
            }
        }

        let css_text = rewrite_css_urls(&css_text, &base, abs_root.as_deref());
        StyleRecord::Rules {
            attributes,
            rules,
            text: css_text,
        }
    }
    .boxed_local()
}

fn convert_nested(nested: Vec<ScannedRule>, base: &str, abs_root: Option<&str>) -> Vec<CssRule> {
    nested
        .into_iter()
        .map(|rule| match rule {
            ScannedRule::Selector { selector, content } => CssRule::Selector {
                selector,
                content: rewrite_css_urls(&content, base, abs_root),
            },
            ScannedRule::Conditional { condition, rules } => CssRule::Conditional {
                condition,
                rules: convert_nested(rules, base, abs_root),
            },
            ScannedRule::Import { href, .. } => CssRule::Import {
                href: resolve_path(base, &href, abs_root),
            },
            ScannedRule::Raw { css_text } => CssRule::Raw { css_text },
        })
        .collect()
}

pub(crate) fn link_fallback_markup(attributes: &[AttributePair], resolved: &str) -> String {
    let mut markup = String::from("<link");
    for attr in attributes {
        let value = if attr.name == "href" {
            resolved
        } else {
            attr.value.as_str()
        };
        markup.push_str(&format!(
            " {}=\"{}\"",
            attr.name,
            html_escape::encode_double_quoted_attribute(value)
        ));
    }
    markup.push_str(" />");
    markup
}
