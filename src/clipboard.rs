//! Clipboard operations for copy sections
//!
//! Copying a section puts its plain text on the clipboard. The rich variant
//! also offers an HTML rendering of the spans so that mail clients and word
//! processors keep bold, underline, color and size.

use crate::error::Result;
use crate::richtext::RichText;
use arboard::Clipboard;

// ─────────────────────────────────────────────────────────────────────────────
// Clipboard Target
// ─────────────────────────────────────────────────────────────────────────────

/// Destination of copy operations.
pub trait ClipboardTarget: Send {
    fn set_text(&mut self, text: &str) -> Result<()>;

    /// Set HTML with a plain text fallback. Targets without HTML support
    /// receive the plain text only.
    fn set_html(&mut self, html: &str, plain_text: &str) -> Result<()> {
        let _ = html;
        self.set_text(plain_text)
    }
}

/// The system clipboard, through arboard.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl ClipboardTarget for SystemClipboard {
    fn set_text(&mut self, text: &str) -> Result<()> {
        let mut clipboard = Clipboard::new()?;
        clipboard.set_text(text)?;
        Ok(())
    }

    fn set_html(&mut self, html: &str, plain_text: &str) -> Result<()> {
        let mut clipboard = Clipboard::new()?;
        clipboard.set_html(html, Some(plain_text))?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTML Rendering
// ─────────────────────────────────────────────────────────────────────────────

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("<br>"),
            _ => out.push(ch),
        }
    }
    out
}

/// Render rich text as an HTML fragment.
pub fn rich_text_to_html(text: &RichText) -> String {
    let mut html = String::new();
    for span in text.spans() {
        let attrs = &span.attrs;
        let mut body = escape_html(&span.text);
        if attrs.bold {
            body = format!("<b>{}</b>", body);
        }
        if attrs.underline {
            body = format!("<u>{}</u>", body);
        }
        let mut style = Vec::new();
        if let Some(color) = attrs.color {
            style.push(format!("color:{}", color.to_hex()));
        }
        if let Some(size) = attrs.font_size {
            style.push(format!("font-size:{}pt", size));
        }
        if style.is_empty() {
            html.push_str(&body);
        } else {
            html.push_str(&format!("<span style=\"{}\">{}</span>", style.join(";"), body));
        }
    }
    html
}

/// Copy rich text, as HTML with plain text fallback when `rich` is set.
pub fn copy_rich_text(target: &mut dyn ClipboardTarget, text: &RichText, rich: bool) -> Result<()> {
    let plain = text.plain_text();
    if rich {
        target.set_html(&rich_text_to_html(text), &plain)
    } else {
        target.set_text(&plain)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test Support
// ─────────────────────────────────────────────────────────────────────────────


// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
