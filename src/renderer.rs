//! Renderer (component B): Markdown -> HTML with per-document caching,
//! frontmatter extraction, and AST-level link rewriting.

use crate::diagrams;
use dashmap::DashMap;
use gray_matter::{engine::YAML, Matter};
use pulldown_cmark::{CodeBlockKind, CowStr, Event, HeadingLevel, Options, Parser, Tag};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use syntect::html::{ClassStyle, ClassedHTMLGenerator};
use syntect::parsing::SyntaxSet;
use syntect::util::LinesWithEndings;

/// Frontmatter as parsed from the YAML block, before key extraction.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawFrontmatter {
    title: Option<String>,
    #[serde(alias = "summary")]
    description: Option<String>,
    #[serde(alias = "keywords")]
    tags: Option<serde_json::Value>,
    #[serde(flatten)]
    raw: serde_json::Map<String, serde_json::Value>,
}

/// The metadata extracted from a document's frontmatter (spec §3).
#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub raw: serde_json::Map<String, serde_json::Value>,
}

/// An immutable rendered document: the output of one (possibly cached)
/// render pass over a document's bytes.
#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub html: String,
    pub raw_markdown: String,
    pub metadata: DocumentMetadata,
    pub modified: SystemTime,
}

struct CacheEntry {
    modified: SystemTime,
    doc: Arc<RenderedDocument>,
}

/// The Markdown -> HTML pipeline with a concurrent, path-keyed cache.
/// No locking guards `render`: duplicate concurrent renders of the same
/// path are permitted and benign, the cache converges last-writer-wins.
pub struct Renderer {
    cache: DashMap<String, CacheEntry>,
    syntax_set: SyntaxSet,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
            syntax_set: SyntaxSet::load_defaults_newlines(),
        }
    }

    /// Renders `content` (the raw bytes of the document at `path`,
    /// last modified at `modified`), serving from cache on an exact
    /// modification-time match.
    pub fn render(&self, path: &str, modified: SystemTime, content: &str) -> Arc<RenderedDocument> {
        if let Some(entry) = self.cache.get(path) {
            if entry.modified == modified {
                return entry.doc.clone();
            }
        }

        let doc = Arc::new(self.render_uncached(path, modified, content));
        self.cache.insert(
            path.to_string(),
            CacheEntry {
                modified,
                doc: doc.clone(),
            },
        );
        doc
    }

    /// Unconditional cache delete, called by the content service after
    /// any mutation touching `path`.
    pub fn invalidate(&self, path: &str) {
        self.cache.remove(path);
    }

    fn render_uncached(&self, path: &str, modified: SystemTime, content: &str) -> RenderedDocument {
        let matter = Matter::<YAML>::new();
        let (body, frontmatter) = match matter.parse_with_struct::<RawFrontmatter>(content) {
            Some(parsed) => (parsed.content, parsed.data),
            None => (content.to_string(), RawFrontmatter::default()),
        };

        let metadata = extract_metadata(frontmatter);
        let html = render_markdown(&body, path, &self.syntax_set);

        RenderedDocument {
            html,
            raw_markdown: content.to_string(),
            metadata,
            modified,
        }
    }
}

fn extract_metadata(fm: RawFrontmatter) -> DocumentMetadata {
    let tags = match fm.tags {
        Some(serde_json::Value::Array(items)) => items.iter().map(value_to_tag).collect(),
        Some(other) => vec![value_to_tag(&other)],
        None => Vec::new(),
    };

    DocumentMetadata {
        title: fm.title,
        description: fm.description,
        tags,
        raw: fm.raw,
    }
}

fn value_to_tag(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Runs the GFM-flavored parse + AST-level transform pass: heading
/// anchors, link/image rewriting, mermaid/d2 fenced blocks, and
/// class-based syntax highlighting for everything else.
fn render_markdown(body: &str, doc_path: &str, syntax_set: &SyntaxSet) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_SMART_PUNCTUATION);

    let parser = Parser::new_ext(body, options);

    let mut events: Vec<Event> = Vec::new();
    let mut code_lang: Option<String> = None;
    let mut code_buf = String::new();
    let mut in_heading = false;
    let mut heading_anchor = String::new();

    for event in parser {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(lang))) => {
                code_lang = Some(lang.split_whitespace().next().unwrap_or("").to_string());
                code_buf.clear();
            }
            Event::Text(text) if code_lang.is_some() => {
                code_buf.push_str(&text);
            }
            Event::End(Tag::CodeBlock(_)) => {
                let lang = code_lang.take().unwrap_or_default();
                let rendered = render_code_block(&lang, &code_buf, syntax_set);
                events.push(Event::Html(CowStr::from(rendered)));
            }

            Event::Start(Tag::Heading(level, id, classes)) => {
                in_heading = true;
                heading_anchor.clear();
                events.push(Event::Start(Tag::Heading(level, id, classes)));
            }
            Event::Text(text) if in_heading => {
                if !heading_anchor.is_empty() {
                    heading_anchor.push('-');
                }
                heading_anchor.push_str(&slug::slugify(text.trim()));
                events.push(Event::Text(text));
            }
            Event::End(Tag::Heading(level, _, _)) => {
                patch_heading_open(&mut events, level, &heading_anchor);
                events.push(Event::Html(CowStr::from(format!(
                    " <a class=\"heading-anchor\" href=\"#{}\">#</a>",
                    heading_anchor
                ))));
                in_heading = false;
                events.push(Event::End(Tag::Heading(level, None, Vec::new())));
            }

            Event::Start(Tag::Link(link_type, dest, title)) => {
                let rewritten = rewrite_destination(doc_path, &dest, false);
                events.push(Event::Start(Tag::Link(link_type, rewritten.into(), title)));
            }
            Event::Start(Tag::Image(link_type, dest, title)) => {
                let rewritten = rewrite_destination(doc_path, &dest, true);
                events.push(Event::Start(Tag::Image(link_type, rewritten.into(), title)));
            }

            other => events.push(other),
        }
    }

    let mut html_out = String::new();
    pulldown_cmark::html::push_html(&mut html_out, events.into_iter());
    html_out
}

fn patch_heading_open(events: &mut [Event], level: HeadingLevel, anchor: &str) {
    if let Some(slot) = events
        .iter_mut()
        .rev()
        .find(|e| matches!(e, Event::Start(Tag::Heading(..))))
    {
        *slot = Event::Html(CowStr::from(format!(
            "<{tag} id=\"{anchor}\">",
            tag = heading_tag(level),
        )));
    }
}

fn heading_tag(level: HeadingLevel) -> &'static str {
    match level {
        HeadingLevel::H1 => "h1",
        HeadingLevel::H2 => "h2",
        HeadingLevel::H3 => "h3",
        HeadingLevel::H4 => "h4",
        HeadingLevel::H5 => "h5",
        HeadingLevel::H6 => "h6",
    }
}

fn render_code_block(lang: &str, code: &str, syntax_set: &SyntaxSet) -> String {
    match lang {
        "mermaid" => format!("<div class=\"mermaid\">{}</div>", html_escape(code)),
        "d2" => diagrams::render_d2_block(code),
        _ => highlight_code(lang, code, syntax_set),
    }
}

fn highlight_code(lang: &str, code: &str, syntax_set: &SyntaxSet) -> String {
    let syntax = syntax_set
        .find_syntax_by_token(lang)
        .unwrap_or_else(|| syntax_set.find_syntax_plain_text());

    let mut generator =
        ClassedHTMLGenerator::new_with_class_style(syntax, syntax_set, ClassStyle::Spaced);
    for line in LinesWithEndings::from(code) {
        let _ = generator.parse_html_for_line_which_includes_newline(line);
    }
    let highlighted = generator.finalize();

    format!(
        "<pre class=\"highlight\"><code class=\"language-{}\">{}</code></pre>",
        html_escape(lang),
        highlighted
    )
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Link/image destination rewriting per spec §4.2. Returns `dest`
/// unchanged when any skip condition applies.
fn rewrite_destination(doc_path: &str, dest: &str, is_image: bool) -> String {
    if dest.is_empty() || dest.starts_with('#') || is_protocol_prefixed(dest) {
        return dest.to_string();
    }

    if is_image {
        if dest.starts_with("/media/") || dest.starts_with("/static/") {
            return dest.to_string();
        }
    } else {
        if dest.starts_with("/page/") {
            return dest.to_string();
        }
        if !dest.ends_with(".md") && !dest.ends_with(".markdown") {
            return dest.to_string();
        }
    }

    let joined = join_relative(doc_path, dest);
    let joined = joined.trim_start_matches('/');

    if is_image {
        format!("/media/{joined}")
    } else {
        format!("/page/{joined}")
    }
}

fn is_protocol_prefixed(dest: &str) -> bool {
    match dest.find(':') {
        Some(idx) if !dest[..idx].contains('/') => {
            let scheme = &dest[..idx];
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        }
        _ => false,
    }
}

fn join_relative(doc_path: &str, dest: &str) -> String {
    let raw = if dest.starts_with('/') {
        dest.to_string()
    } else {
        let dir = Path::new(doc_path)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        if dir.is_empty() {
            dest.to_string()
        } else {
            format!("{dir}/{dest}")
        }
    };
    clean_relative(&raw)
}

/// Collapses `.`/`..` segments lexically; used for link targets, which
/// are never filesystem-checked here (the Path Validator does that when
/// the link is actually followed).
fn clean_relative(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for segment in input.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cache_hit_returns_first_content_until_mtime_changes() {
        let renderer = Renderer::new();
        let t1 = SystemTime::UNIX_EPOCH;
        let t2 = t1 + Duration::from_secs(1);

        let first = renderer.render("a.md", t1, "# One");
        let second = renderer.render("a.md", t1, "# Two");
        assert!(first.html.contains('1'));
        assert!(second.html.contains('1'));
        assert_eq!(first.html, second.html);

        let third = renderer.render("a.md", t2, "# Two");
        assert!(third.html.contains('2'));
    }

    #[test]
    fn invalidate_forces_rerender() {
        let renderer = Renderer::new();
        let t1 = SystemTime::UNIX_EPOCH;
        let first = renderer.render("a.md", t1, "# One");
        assert!(first.html.contains('1'));
        renderer.invalidate("a.md");
        let second = renderer.render("a.md", t1, "# Two");
        assert!(second.html.contains('2'));
    }

    #[test]
    fn link_to_markdown_is_rewritten() {
        let r = Renderer::new();
        let doc = r.render(
            "a/b.md",
            SystemTime::UNIX_EPOCH,
            "[x](foo.md)",
        );
        assert!(doc.html.contains("href=\"/page/a/foo.md\""));
    }

    #[test]
    fn external_link_is_unchanged() {
        let r = Renderer::new();
        let doc = r.render(
            "a/b.md",
            SystemTime::UNIX_EPOCH,
            "[x](https://example.com/y.md)",
        );
        assert!(doc.html.contains("href=\"https://example.com/y.md\""));
    }

    #[test]
    fn fragment_only_link_is_unchanged() {
        let r = Renderer::new();
        let doc = r.render("a/b.md", SystemTime::UNIX_EPOCH, "[x](#section)");
        assert!(doc.html.contains("href=\"#section\""));
    }

    #[test]
    fn frontmatter_title_and_tags_are_extracted() {
        let r = Renderer::new();
        let content = "---\ntitle: Hello\ntags: [a, b]\n---\n# Body\n";
        let doc = r.render("a.md", SystemTime::UNIX_EPOCH, content);
        assert_eq!(doc.metadata.title.as_deref(), Some("Hello"));
        assert_eq!(doc.metadata.tags, vec!["a".to_string(), "b".to_string()]);
        assert!(doc.html.contains("Body"));
        assert!(!doc.html.contains("title: Hello"));
    }

    #[test]
    fn heading_gets_id_and_anchor() {
        let r = Renderer::new();
        let doc = r.render("a.md", SystemTime::UNIX_EPOCH, "# Getting Started");
        assert!(doc.html.contains("id=\"getting-started\""));
        assert!(doc.html.contains("heading-anchor"));
    }

    #[test]
    fn mermaid_block_is_wrapped() {
        let r = Renderer::new();
        let doc = r.render("a.md", SystemTime::UNIX_EPOCH, "```mermaid\ngraph TD;\n```");
        assert!(doc.html.contains("class=\"mermaid\""));
        assert!(doc.html.contains("graph TD;"));
    }
}
