//! Post body rendering (Markdown subset → Telegram HTML) and content hashing.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::errors::ContentError;

/// Telegram's hard limit for a text message.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render an authored post body to Telegram-compatible HTML.
///
/// Supported: fenced code blocks, inline code, `**bold**`, `__bold__`,
/// `_italic_`, `[text](url)` links, `#` headers (rendered bold) and `- `
/// bullets. Everything else is escaped verbatim.
pub fn render_post_html(markdown: &str) -> String {
    let mut stash = Vec::new();
    let text = stash_code(markdown, &mut stash);
    let text = escape_html(&text);

    let mut out = text
        .split('\n')
        .map(render_line)
        .collect::<Vec<_>>()
        .join("\n");

    for (i, fragment) in stash.iter().enumerate() {
        out = out.replace(&placeholder(i), fragment);
    }
    out
}

/// Reject bodies that Telegram would refuse.
pub fn check_length(text: &str) -> Result<(), ContentError> {
    let len = text.chars().count();
    if text.trim().is_empty() {
        return Err(ContentError::Empty);
    }
    if len > MAX_MESSAGE_CHARS {
        return Err(ContentError::TooLong {
            len,
            max: MAX_MESSAGE_CHARS,
        });
    }
    Ok(())
}

/// Short stable digest of the exact payload sent to the gateway.
pub fn content_hash(html: &str) -> String {
    let digest = Sha256::digest(html.as_bytes());
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(len);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
        if out.len() >= len {
            out.truncate(len);
            break;
        }
    }
    out
}

fn placeholder(i: usize) -> String {
    format!("\u{0}CODE{i}\u{0}")
}

/// Pull code spans out before escaping so their contents stay literal.
fn stash_code(input: &str, stash: &mut Vec<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find('`') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];

        if let Some(body) = tail.strip_prefix("```") {
            // Optional language tag up to the first newline.
            let body_start = match body.find('\n') {
                Some(nl) if body[..nl].chars().all(|c| c.is_ascii_alphanumeric() || c == '_') => {
                    nl + 1
                }
                _ => 0,
            };
            if let Some(end) = body[body_start..].find("```") {
                let code = &body[body_start..body_start + end];
                out.push_str(&placeholder(stash.len()));
                stash.push(format!("<pre>{}</pre>", escape_html(code)));
                rest = &body[body_start + end + 3..];
                continue;
            }
        } else if let Some(end) = tail[1..].find('`') {
            let code = &tail[1..1 + end];
            out.push_str(&placeholder(stash.len()));
            stash.push(format!("<code>{}</code>", escape_html(code)));
            rest = &tail[end + 2..];
            continue;
        }

        // Unclosed fence or tick: keep the remainder as text.
        out.push_str(tail);
        return out;
    }

    out.push_str(rest);
    out
}

fn render_line(line: &str) -> String {
    static BOLD: OnceLock<Regex> = OnceLock::new();
    static ITALIC: OnceLock<Regex> = OnceLock::new();
    static LINK: OnceLock<Regex> = OnceLock::new();

    let bold = BOLD.get_or_init(|| Regex::new(r"\*\*(.+?)\*\*|__(.+?)__").expect("valid regex"));
    let italic = ITALIC.get_or_init(|| Regex::new(r"\b_([^_]+?)_\b").expect("valid regex"));
    let link =
        LINK.get_or_init(|| Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").expect("valid regex"));

    let trimmed = line.trim_start_matches('#');
    let hashes = line.len() - trimmed.len();
    let (mut l, header) = match trimmed.strip_prefix(' ') {
        Some(rest) if (1..=6).contains(&hashes) => (rest.to_string(), true),
        _ => (line.to_string(), false),
    };

    if let Some(rest) = l.strip_prefix("- ") {
        l = format!("• {rest}");
    }

    l = bold
        .replace_all(&l, |c: &regex::Captures<'_>| {
            let inner = c.get(1).or_else(|| c.get(2)).map_or("", |m| m.as_str());
            format!("<b>{inner}</b>")
        })
        .into_owned();
    l = italic.replace_all(&l, "<i>$1</i>").into_owned();
    l = link.replace_all(&l, r#"<a href="$2">$1</a>"#).into_owned();

    if header {
        format!("<b>{l}</b>")
    } else {
        l
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html() {
        let s = r#"<a href="x&y">"#;
        assert_eq!(escape_html(s), "&lt;a href=&quot;x&amp;y&quot;&gt;");
    }

    #[test]
    fn code_blocks_stay_literal() {
        let html = render_post_html("hi\n```rust\nlet x = \"<b>\";\n```\nbye");
        assert!(html.contains("<pre>let x = &quot;&lt;b&gt;&quot;;\n</pre>"));
        assert!(html.starts_with("hi\n"));
        assert!(html.ends_with("\nbye"));
    }

    #[test]
    fn inline_markup() {
        assert_eq!(
            render_post_html("**Breaking**: see [site](https://example.com) and `a<b`"),
            r#"<b>Breaking</b>: see <a href="https://example.com">site</a> and <code>a&lt;b</code>"#
        );
        assert_eq!(render_post_html("_calm_ news"), "<i>calm</i> news");
    }

    #[test]
    fn headers_and_bullets() {
        assert_eq!(render_post_html("## Title\n- one"), "<b>Title</b>\n• one");
        assert_eq!(render_post_html("#hashtag"), "#hashtag");
    }

    #[test]
    fn length_limits() {
        assert_eq!(check_length("  "), Err(ContentError::Empty));
        let long = "x".repeat(MAX_MESSAGE_CHARS + 1);
        assert_eq!(
            check_length(&long),
            Err(ContentError::TooLong {
                len: MAX_MESSAGE_CHARS + 1,
                max: MAX_MESSAGE_CHARS
            })
        );
        assert!(check_length("ok").is_ok());
    }

    #[test]
    fn content_hash_is_stable_and_short() {
        let a = content_hash("<b>hi</b>");
        assert_eq!(a.len(), 16);
        assert_eq!(a, content_hash("<b>hi</b>"));
        assert_ne!(a, content_hash("<b>hi!</b>"));
    }
}
