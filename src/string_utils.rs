//! Character-Indexed String Utilities
//!
//! Rich text positions are counted in Unicode scalar values (`char`s), but Rust
//! strings are sliced by byte. These helpers translate between the two so that
//! callers never slice inside a multi-byte character.
//!
//! # Problem
//! Characters like `ø`, `æ`, `å`, `中`, `🎉` are multi-byte in UTF-8.
//! A char position of 5 is not byte 5 once any of them appear earlier.
//!
//! # Example
//! ```ignore
//! use crate::string_utils::char_slice;
//!
//! let text = "Hei på deg";
//! assert_eq!(char_slice(text, 4, 6), "på");
//! ```

// ─────────────────────────────────────────────────────────────────────────────
// Index Conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Number of chars in `s`.
#[inline]
pub fn char_count(s: &str) -> usize {
    s.chars().count()
}

/// Convert a character index to a byte index.
///
/// Returns the string length if `char_index` is beyond the string.
pub fn char_index_to_byte_index(s: &str, char_index: usize) -> usize {
    s.char_indices()
        .nth(char_index)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

/// Slice `s` between two char positions. Positions past the end clamp to it.
pub fn char_slice(s: &str, start: usize, end: usize) -> &str {
    if start >= end {
        return "";
    }
    let start = char_index_to_byte_index(s, start);
    let end = char_index_to_byte_index(s, end);
    &s[start..end]
}

/// Split a `String` in place at a char position, returning the tail.
pub fn split_off_chars(s: &mut String, char_index: usize) -> String {
    let byte = char_index_to_byte_index(s, char_index);
    s.split_off(byte)
}

/// Insert `text` into `s` at a char position.
pub fn insert_at_char(s: &mut String, char_index: usize, text: &str) {
    let byte = char_index_to_byte_index(s, char_index);
    s.insert_str(byte, text);
}

// ─────────────────────────────────────────────────────────────────────────────
// Line/Column Positions
// ─────────────────────────────────────────────────────────────────────────────

/// Convert a 0-indexed line and column into a char index.
///
/// A column beyond the end of its line resolves to the end of that line, and a
/// line beyond the text resolves to the end of the text.
pub fn line_col_to_char_index(text: &str, target_line: usize, target_col: usize) -> usize {
    let mut current_line = 0;
    let mut current_col = 0;
    let mut char_index = 0;

    for ch in text.chars() {
        if current_line == target_line && current_col == target_col {
            return char_index;
        }
        if ch == '\n' {
            if current_line == target_line {
                return char_index;
            }
            current_line += 1;
            current_col = 0;
        } else {
            current_col += 1;
        }
        char_index += 1;
    }

    char_index
}

/// Parse a text widget index of the form `"line.col"` (1-based line, 0-based
/// column) or `"end"` into a char index within `text`.
///
/// Returns `None` for anything else, including modifiers such as `"1.0+5c"`.
pub fn parse_line_col_index(text: &str, index: &str) -> Option<usize> {
    let index = index.trim();
    if index == "end" {
        return Some(char_count(text));
    }
    let (line, col) = index.split_once('.')?;
    let line: usize = line.parse().ok()?;
    let col: usize = col.parse().ok()?;
    if line == 0 {
        return None;
    }
    Some(line_col_to_char_index(text, line - 1, col))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
