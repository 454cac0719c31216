use serde::{Deserialize, Serialize};

use crate::path::{has_scheme, resolve_path};

/// One rule of a parsed stylesheet, after URL rewriting and import
/// resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CssRule {
    /// Plain selector rule; `content` has already been through the
    /// `url(...)` rewrite pass.
    Selector { selector: String, content: String },
    /// An `@import` that could not be inlined; `href` is the resolved
    /// absolute locator.
    Import { href: String },
    /// `@media` / `@supports` block. `condition` keeps the at-keyword
    /// (e.g. `media screen and (max-width: 600px)`).
    Conditional {
        condition: String,
        rules: Vec<CssRule>,
    },
    /// Any other at-rule (`@font-face`, `@keyframes`, ...), carried through
    /// verbatim.
    Raw { css_text: String },
}

impl CssRule {
    /// Serialize the rule back to stylesheet text.
    pub fn css_text(&self) -> String {
        match self {
            CssRule::Selector { selector, content } => format!("{selector} {{ {content} }}"),
            CssRule::Import { href } => format!("@import url(\"{href}\");"),
            CssRule::Conditional { condition, rules } => {
                let body = rules
                    .iter()
                    .map(CssRule::css_text)
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("@{condition} {{\n{body}\n}}")
            }
            CssRule::Raw { css_text } => css_text.clone(),
        }
    }
}

/// Raw scanner output, before imports are resolved against the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannedRule {
    Selector {
        selector: String,
        content: String,
    },
    Import {
        /// The reference exactly as written in the sheet.
        href: String,
        /// The full `@import ...;` clause, for later textual removal.
        clause: String,
    },
    Conditional {
        condition: String,
        rules: Vec<ScannedRule>,
    },
    Raw {
        css_text: String,
    },
}

/// Split a stylesheet into rules. The scanner is quote- and comment-aware but
/// deliberately forgiving: unparseable trailing input is kept as a raw rule
/// rather than dropped.
pub fn parse_stylesheet(text: &str) -> Vec<ScannedRule> {
    let bytes = text.as_bytes();
    let mut rules = Vec::new();
    let mut i = 0usize;

    while i < bytes.len() {
        i = skip_trivia(text, i);
        if i >= bytes.len() {
            break;
        }

        if bytes[i] == b'@' {
            let keyword_end = scan_ident(text, i + 1);
            let keyword = &text[i + 1..keyword_end];
            match keyword {
                "import" => {
                    let end = find_unquoted(text, keyword_end, b';');
                    let clause_end = end.map(|e| e + 1).unwrap_or(bytes.len());
                    let clause = text[i..clause_end].to_string();
                    if let Some(href) = parse_import_target(&text[keyword_end..clause_end]) {
                        rules.push(ScannedRule::Import { href, clause });
                    } else {
                        rules.push(ScannedRule::Raw { css_text: clause });
                    }
                    i = clause_end;
                }
                "media" | "supports" => {
                    match find_unquoted(text, keyword_end, b'{') {
                        Some(open) => {
                            let close = match_brace(text, open);
                            let condition =
                                format!("{} {}", keyword, text[keyword_end..open].trim());
                            let inner = &text[open + 1..close];
                            rules.push(ScannedRule::Conditional {
                                condition: condition.trim().to_string(),
                                rules: parse_stylesheet(inner),
                            });
                            i = (close + 1).min(bytes.len());
                        }
                        None => {
                            rules.push(ScannedRule::Raw {
                                css_text: text[i..].trim().to_string(),
                            });
                            break;
                        }
                    }
                }
                _ => {
                    // @charset-style statements end at `;`; block at-rules
                    // (@font-face, @keyframes, ...) swallow their block.
                    let semi = find_unquoted(text, keyword_end, b';');
                    let open = find_unquoted(text, keyword_end, b'{');
                    match (semi, open) {
                        (Some(s), o) if o.map_or(true, |o| s < o) => {
                            rules.push(ScannedRule::Raw {
                                css_text: text[i..=s].trim().to_string(),
                            });
                            i = s + 1;
                        }
                        (_, Some(o)) => {
                            let close = match_brace(text, o);
                            rules.push(ScannedRule::Raw {
                                css_text: text[i..=close.min(bytes.len() - 1)].trim().to_string(),
                            });
                            i = (close + 1).min(bytes.len());
                        }
                        (None, None) => {
                            rules.push(ScannedRule::Raw {
                                css_text: text[i..].trim().to_string(),
                            });
                            break;
                        }
                        // Unreachable: when `open` is None the first arm's guard
                        // (`o.map_or(true, ...)`) is always true, so any
                        // `(Some(_), None)` is consumed above.
                        (Some(_), None) => unreachable!(),
                    }
                }
            }
        } else {
            match find_unquoted(text, i, b'{') {
                Some(open) => {
                    let close = match_brace(text, open);
                    let selector = text[i..open].trim().to_string();
                    let content = text[open + 1..close].trim().to_string();
                    rules.push(ScannedRule::Selector { selector, content });
                    i = (close + 1).min(bytes.len());
                }
                None => {
                    let tail = text[i..].trim();
                    if !tail.is_empty() {
                        rules.push(ScannedRule::Raw {
                            css_text: tail.to_string(),
                        });
                    }
                    break;
                }
            }
        }
    }

    rules
}

/// Rewrite every relative `url(...)` reference in `content` to an absolute
/// locator. References with an explicit scheme pass through untouched.
pub fn rewrite_css_urls(content: &str, base: &str, abs_root: Option<&str>) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(pos) = rest.find("url(") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 4..];
        let Some(close) = after.find(')') else {
            out.push_str(&rest[pos..]);
            return out;
        };
        let inner = after[..close].trim();
        let target = inner.trim_matches(|c| c == '"' || c == '\'');
        if has_scheme(target) || target.starts_with("data:") {
            out.push_str(&rest[pos..pos + 4 + close + 1]);
        } else {
            out.push_str(&format!("url(\"{}\")", resolve_path(base, target, abs_root)));
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}

/// Remove an inlined `@import` clause from stylesheet text. Serialization may
/// have normalized quoting, so both quote styles of the clause are attempted.
pub fn remove_import_clause(text: &str, clause: &str) -> String {
    let single = clause.replace('"', "'");
    let double = clause.replace('\'', "\"");
    text.replacen(&single, "", 1).replacen(&double, "", 1)
}

fn parse_import_target(clause: &str) -> Option<String> {
    let clause = clause.trim().trim_end_matches(';').trim();
    let inner = if let Some(rest) = clause.strip_prefix("url(") {
        rest.split(')').next()?
    } else {
        clause.split_whitespace().next()?
    };
    let target = inner.trim().trim_matches(|c| c == '"' || c == '\'');
    if target.is_empty() {
        None
    } else {
        Some(target.to_string())
    }
}

fn scan_ident(text: &str, from: usize) -> usize {
    let bytes = text.as_bytes();
    let mut i = from;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'-') {
        i += 1;
    }
    i
}

/// Skip whitespace and `/* ... */` comments.
fn skip_trivia(text: &str, mut i: usize) -> usize {
    let bytes = text.as_bytes();
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i + 1 < bytes.len() && bytes[i] == b'/' && bytes[i + 1] == b'*' {
            match text[i + 2..].find("*/") {
                Some(end) => i = i + 2 + end + 2,
                None => return bytes.len(),
            }
        } else {
            return i;
        }
    }
}

/// Find the next unquoted, uncommented occurrence of `needle`.
fn find_unquoted(text: &str, from: usize, needle: u8) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b if b == needle => return Some(i),
            b'"' | b'\'' => i = skip_string(bytes, i),
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                i = skip_trivia(text, i);
                continue;
            }
            _ => i += 1,
        }
    }
    None
}

/// Given the index of an opening brace, return the index of its matching
/// closing brace (or the end of input for an unterminated block).
fn match_brace(text: &str, open: usize) -> usize {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return i;
                }
            }
            b'"' | b'\'' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                i = skip_trivia(text, i);
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    bytes.len().saturating_sub(1).max(open)
}

fn skip_string(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_selector_rules() {
        let rules = parse_stylesheet(".a { color: red; }\n#b { margin: 0 }");
        assert_eq!(
            rules,
            vec![
                ScannedRule::Selector {
                    selector: ".a".into(),
                    content: "color: red;".into(),
                },
                ScannedRule::Selector {
                    selector: "#b".into(),
                    content: "margin: 0".into(),
                },
            ]
        );
    }

    #[test]
    fn scans_import_clauses() {
        let rules = parse_stylesheet("@import url(\"x.css\");\n@import 'y.css';");
        assert_eq!(
            rules,
            vec![
                ScannedRule::Import {
                    href: "x.css".into(),
                    clause: "@import url(\"x.css\");".into(),
                },
                ScannedRule::Import {
                    href: "y.css".into(),
                    clause: "@import 'y.css';".into(),
                },
            ]
        );
    }

    #[test]
    fn scans_media_blocks_recursively() {
        let rules =
            parse_stylesheet("@media screen and (max-width: 600px) { .a { color: red } }");
        match &rules[0] {
            ScannedRule::Conditional { condition, rules } => {
                assert_eq!(condition, "media screen and (max-width: 600px)");
                assert_eq!(rules.len(), 1);
            }
            other => panic!("expected conditional rule, got {other:?}"),
        }
    }

    #[test]
    fn keeps_unknown_at_rules_verbatim() {
        let rules = parse_stylesheet("@font-face { font-family: X; src: url(a.woff2); }");
        match &rules[0] {
            ScannedRule::Raw { css_text } => assert!(css_text.starts_with("@font-face")),
            other => panic!("expected raw rule, got {other:?}"),
        }
    }

    #[test]
    fn skips_comments_between_rules() {
        let rules = parse_stylesheet("/* lead */ .a { x: 1 } /* tail */");
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn braces_inside_strings_do_not_close_blocks() {
        let rules = parse_stylesheet(".a { content: \"}\"; color: red }");
        match &rules[0] {
            ScannedRule::Selector { content, .. } => {
                assert!(content.contains("color: red"));
            }
            other => panic!("expected selector rule, got {other:?}"),
        }
    }

    #[test]
    fn rewrites_relative_urls_only() {
        let out = rewrite_css_urls(
            "background: url('img/a.png'); cursor: url(https://cdn.x/c.cur);",
            "/app/site/main.css",
            None,
        );
        assert_eq!(
            out,
            "background: url(\"/app/site/img/a.png\"); cursor: url(https://cdn.x/c.cur);"
        );
    }

    #[test]
    fn rewrite_honors_deployment_root() {
        let out = rewrite_css_urls("url(/shared/a.png)", "/app/main.css", Some("/deploy"));
        assert_eq!(out, "url(\"/deploy/shared/a.png\")");
    }

    #[test]
    fn import_removal_tries_both_quote_styles() {
        let sheet = "@import url('x.css');\n.a { color: red }";
        let clause = "@import url(\"x.css\");";
        let out = remove_import_clause(sheet, clause);
        assert_eq!(out.trim_start(), ".a { color: red }");
    }
}
