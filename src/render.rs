//! Text rendering and content-type sniffing helpers
//!
//! `html_to_text` is a best-effort approximation built from a handful of
//! regular expressions, not an HTML parser. It is used only when a caller asks
//! for plain text and the message has nothing but HTML.

use std::sync::OnceLock;

use regex::Regex;

/// Structured text types that are inline-eligible outside `text/*`
const STRUCTURED_TEXT_TYPES: [&str; 5] = [
    "application/json",
    "application/xml",
    "text/xml",
    "application/yaml",
    "application/x-yaml",
];

/// Markdown spellings seen in the wild
const MARKDOWN_TYPES: [&str; 3] = ["text/markdown", "text/x-markdown", "text/md"];

/// Whether content of this type may be returned inline when small enough
pub fn is_inline_eligible(content_type: &str) -> bool {
    let ctype = content_type.trim().to_ascii_lowercase();
    ctype.starts_with("text/")
        || MARKDOWN_TYPES.contains(&ctype.as_str())
        || STRUCTURED_TEXT_TYPES.contains(&ctype.as_str())
}

/// Derive plain text from HTML
///
/// Drops script/style blocks, turns `</p>` and `<br>` into newlines, strips
/// the remaining tags, decodes the common entities, and trims.
pub fn html_to_text(html: &str) -> String {
    let text = script_regex().replace_all(html, "");
    let text = style_regex().replace_all(&text, "");
    let text = line_break_regex().replace_all(&text, "\n");
    let text = tag_regex().replace_all(&text, "");

    // `&amp;` last so `&amp;lt;` stays `&lt;`
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_owned()
}

/// Render plain text as minimal HTML
///
/// Blank-line separated blocks become paragraphs and single newlines become
/// `<br>`.
pub fn text_to_html(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    normalized
        .split("\n\n")
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .map(|block| format!("<p>{}</p>", escape_html(block).replace('\n', "<br>")))
        .collect::<Vec<_>>()
        .join("")
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn script_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid script regex")
    })
}

fn style_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").expect("valid style regex")
    })
}

fn line_break_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?i)</p\s*>|<br\s*/?>").expect("valid line break regex"))
}

fn tag_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("valid HTML tag regex"))
}
