//! The span-partitioned rich text model.

use super::span::{AttributePatch, Attributes, Span, MAX_FONT_SIZE, MIN_FONT_SIZE};
use crate::error::{Error, Result};
use crate::string_utils::{insert_at_char, split_off_chars};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// The first structural problem found in a span sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A span with no text.
    EmptySpan { index: usize },
    /// Two consecutive spans carry identical attributes.
    UnmergedSpans { index: usize },
    /// A font size outside the accepted range.
    FontSizeOutOfRange { index: usize, size: u16 },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::EmptySpan { index } => write!(f, "span {} is empty", index),
            Violation::UnmergedSpans { index } => write!(
                f,
                "spans {} and {} have identical attributes",
                index,
                index + 1
            ),
            Violation::FontSizeOutOfRange { index, size } => write!(
                f,
                "span {} has font size {} outside {}..={}",
                index, size, MIN_FONT_SIZE, MAX_FONT_SIZE
            ),
        }
    }
}

/// Formatted text stored as an ordered list of spans.
///
/// The spans always partition the text: no span is empty and no two
/// neighbours share attributes. Positions are char offsets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Span>", into = "Vec<Span>")]
pub struct RichText {
    spans: Vec<Span>,
}

impl RichText {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unformatted text as a single span.
    pub fn plain(text: impl Into<String>) -> Self {
        Self::from_runs(vec![Span::plain(text)])
    }

    /// Build from arbitrary runs, dropping empty ones and merging neighbours.
    pub fn from_runs(runs: Vec<Span>) -> Self {
        let mut text = Self { spans: runs };
        text.normalize();
        text
    }

    /// Build from spans that must already satisfy every invariant.
    pub fn from_spans(spans: Vec<Span>) -> std::result::Result<Self, Violation> {
        let text = Self { spans };
        text.validate()?;
        Ok(text)
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn into_spans(self) -> Vec<Span> {
        self.spans
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.spans.iter().map(Span::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// The concatenated text of every span.
    pub fn plain_text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }

    /// Attributes of the character at `position`, if any.
    pub fn attributes_at(&self, position: usize) -> Option<Attributes> {
        let mut offset = 0;
        for span in &self.spans {
            let len = span.len();
            if position < offset + len {
                return Some(span.attrs);
            }
            offset += len;
        }
        None
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply `patch` to every character in `range`.
    pub fn apply_formatting(&mut self, range: Range<usize>, patch: &AttributePatch) -> Result<()> {
        self.check_range(&range)?;
        if range.is_empty() || patch.is_empty() {
            return Ok(());
        }
        let first = self.split_at(range.start);
        let last = self.split_at(range.end);
        for span in &mut self.spans[first..last] {
            span.attrs = span.attrs.patched(patch);
        }
        self.normalize();
        Ok(())
    }

    /// Insert plain `text` at `position`, inheriting surrounding attributes.
    pub fn insert_text(&mut self, position: usize, text: &str) -> Result<()> {
        let len = self.len();
        if position > len {
            return Err(Error::InvalidRange {
                start: position,
                end: position,
                len,
            });
        }
        if text.is_empty() {
            return Ok(());
        }
        if self.spans.is_empty() {
            self.spans.push(Span::plain(text));
            return Ok(());
        }

        // On a boundary the preceding span wins; position 0 falls into the first span.
        let mut offset = 0;
        for span in &mut self.spans {
            let span_len = span.len();
            if position <= offset + span_len {
                insert_at_char(&mut span.text, position - offset, text);
                return Ok(());
            }
            offset += span_len;
        }
        Ok(())
    }

    /// Remove the characters in `range`.
    pub fn delete_range(&mut self, range: Range<usize>) -> Result<()> {
        self.check_range(&range)?;
        if range.is_empty() {
            return Ok(());
        }
        let first = self.split_at(range.start);
        let last = self.split_at(range.end);
        self.spans.drain(first..last);
        self.normalize();
        Ok(())
    }

    /// Reset `range` to plain text.
    pub fn clear_formatting(&mut self, range: Range<usize>) -> Result<()> {
        self.apply_formatting(range, &AttributePatch::clear_all())
    }

    /// Remove bold if the whole range is bold, otherwise make it all bold.
    pub fn toggle_bold(&mut self, range: Range<usize>) -> Result<()> {
        self.check_range(&range)?;
        let all = self.all_in_range(&range, |a| a.bold);
        self.apply_formatting(range, &AttributePatch::bold(!all))
    }

    /// Remove underline if the whole range is underlined, otherwise add it.
    pub fn toggle_underline(&mut self, range: Range<usize>) -> Result<()> {
        self.check_range(&range)?;
        let all = self.all_in_range(&range, |a| a.underline);
        self.apply_formatting(range, &AttributePatch::underline(!all))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invariants
    // ─────────────────────────────────────────────────────────────────────────

    /// Report the first violated invariant, if any.
    pub fn validate(&self) -> std::result::Result<(), Violation> {
        for (index, span) in self.spans.iter().enumerate() {
            if span.is_empty() {
                return Err(Violation::EmptySpan { index });
            }
            if let Some(size) = span.attrs.font_size {
                if !(MIN_FONT_SIZE..=MAX_FONT_SIZE).contains(&size) {
                    return Err(Violation::FontSizeOutOfRange { index, size });
                }
            }
            if index > 0 && self.spans[index - 1].attrs == span.attrs {
                return Err(Violation::UnmergedSpans { index: index - 1 });
            }
        }
        Ok(())
    }

    /// A copy with empty spans dropped, neighbours merged and font sizes clamped.
    pub fn normalized(&self) -> Self {
        let mut text = self.clone();
        for span in &mut text.spans {
            span.attrs.font_size = span
                .attrs
                .font_size
                .map(|size| size.clamp(MIN_FONT_SIZE, MAX_FONT_SIZE));
        }
        text.normalize();
        text
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Serialization
    // ─────────────────────────────────────────────────────────────────────────

    /// Serialize as a JSON span list.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a JSON span list, rejecting sequences that break an invariant.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn check_range(&self, range: &Range<usize>) -> Result<()> {
        let len = self.len();
        if range.start > range.end || range.end > len {
            return Err(Error::InvalidRange {
                start: range.start,
                end: range.end,
                len,
            });
        }
        Ok(())
    }

    fn all_in_range(&self, range: &Range<usize>, has: impl Fn(&Attributes) -> bool) -> bool {
        let mut offset = 0;
        let mut any = false;
        for span in &self.spans {
            let len = span.len();
            if offset < range.end && offset + len > range.start {
                any = true;
                if !has(&span.attrs) {
                    return false;
                }
            }
            offset += len;
        }
        any
    }

    /// Make `position` a span boundary and return the index of the span that
    /// starts there (or `spans.len()` at the end of the text).
    fn split_at(&mut self, position: usize) -> usize {
        let mut offset = 0;
        for index in 0..self.spans.len() {
            if position == offset {
                return index;
            }
            let len = self.spans[index].len();
            if position < offset + len {
                let tail = split_off_chars(&mut self.spans[index].text, position - offset);
                let attrs = self.spans[index].attrs;
                self.spans.insert(index + 1, Span::new(tail, attrs));
                return index + 1;
            }
            offset += len;
        }
        self.spans.len()
    }

    fn normalize(&mut self) {
        let mut merged: Vec<Span> = Vec::with_capacity(self.spans.len());
        for span in self.spans.drain(..) {
            if span.is_empty() {
                continue;
            }
            match merged.last_mut() {
                Some(prev) if prev.attrs == span.attrs => prev.text.push_str(&span.text),
                _ => merged.push(span),
            }
        }
        self.spans = merged;
    }
}

impl TryFrom<Vec<Span>> for RichText {
    type Error = Violation;

    fn try_from(spans: Vec<Span>) -> std::result::Result<Self, Self::Error> {
        RichText::from_spans(spans)
    }
}

impl From<RichText> for Vec<Span> {
    fn from(text: RichText) -> Self {
        text.spans
    }
}

impl fmt::Display for RichText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for span in &self.spans {
            f.write_str(&span.text)?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::richtext::Color;
    use crate::string_utils::char_count;

    fn red() -> Color {
        Color::rgb(255, 0, 0)
    }

    fn assert_invariants(text: &RichText) {
        assert_eq!(text.validate(), Ok(()), "spans: {:?}", text.spans());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Formatting
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_bold_whole_word_round_trips_as_one_span() {
        let mut text = RichText::plain("Hello");
        text.apply_formatting(0..5, &AttributePatch::bold(true)).unwrap();

        let json = text.to_json().unwrap();
        let back = RichText::from_json(&json).unwrap();
        assert_eq!(back, text);
        assert_eq!(back.spans().len(), 1);
        assert_eq!(back.spans()[0].text, "Hello");
        assert!(back.spans()[0].attrs.bold);
    }

    #[test]
    fn test_formatting_middle_splits_into_three() {
        let mut text = RichText::plain("Hello world");
        text.apply_formatting(2..7, &AttributePatch::color(Some(red())))
            .unwrap();
        let texts: Vec<&str> = text.spans().iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["He", "llo w", "orld"]);
        assert_eq!(text.spans()[1].attrs.color, Some(red()));
        assert_invariants(&text);
    }

    #[test]
    fn test_formatting_merges_with_matching_neighbours() {
        let mut text = RichText::plain("abcdef");
        text.apply_formatting(0..2, &AttributePatch::bold(true)).unwrap();
        text.apply_formatting(4..6, &AttributePatch::bold(true)).unwrap();
        assert_eq!(text.spans().len(), 3);
        text.apply_formatting(2..4, &AttributePatch::bold(true)).unwrap();
        assert_eq!(text.spans().len(), 1);
        assert_invariants(&text);
    }

    #[test]
    fn test_formatting_leaves_outside_spans_alone() {
        let mut text = RichText::from_runs(vec![
            Span::new("aa", Attributes::bold()),
            Span::plain("bbbb"),
            Span::new(
                "cc",
                Attributes {
                    underline: true,
                    ..Attributes::default()
                },
            ),
        ]);
        text.apply_formatting(3..4, &AttributePatch::color(Some(red())))
            .unwrap();
        assert_eq!(text.spans()[0], Span::new("aa", Attributes::bold()));
        assert_eq!(text.spans().last().unwrap().text, "cc");
        assert_eq!(text.plain_text(), "aabbbbcc");
        assert_invariants(&text);
    }

    #[test]
    fn test_out_of_range_is_rejected_without_change() {
        let mut text = RichText::plain("abc");
        let before = text.clone();
        let err = text
            .apply_formatting(1..9, &AttributePatch::bold(true))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRange { end: 9, len: 3, .. }));
        #[allow(clippy::reversed_empty_ranges)]
        let reversed = text.delete_range(2..1);
        assert!(reversed.is_err());
        assert_eq!(text, before);
    }

    #[test]
    fn test_multibyte_positions_are_chars() {
        let mut text = RichText::plain("Hei på deg");
        text.apply_formatting(4..6, &AttributePatch::bold(true)).unwrap();
        assert_eq!(text.spans()[1].text, "på");
        assert_eq!(text.len(), 10);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Toggles
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_toggle_bold_adds_when_partially_bold() {
        let mut text = RichText::plain("abcd");
        text.apply_formatting(0..2, &AttributePatch::bold(true)).unwrap();
        text.toggle_bold(0..4).unwrap();
        assert_eq!(text.spans().len(), 1);
        assert!(text.spans()[0].attrs.bold);

        text.toggle_bold(0..4).unwrap();
        assert!(text.spans()[0].attrs.is_plain());
    }

    #[test]
    fn test_toggle_underline_on_empty_range_is_noop() {
        let mut text = RichText::plain("abcd");
        text.toggle_underline(2..2).unwrap();
        assert_eq!(text, RichText::plain("abcd"));
    }

    #[test]
    fn test_clear_formatting() {
        let mut text = RichText::plain("abcd");
        text.apply_formatting(
            0..4,
            &AttributePatch {
                bold: Some(true),
                underline: Some(true),
                color: Some(Some(red())),
                font_size: Some(Some(20)),
            },
        )
        .unwrap();
        text.clear_formatting(1..3).unwrap();
        assert_eq!(text.spans().len(), 3);
        assert!(text.spans()[1].attrs.is_plain());
        assert_invariants(&text);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Insert / Delete
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_insert_inherits_preceding_span_on_boundary() {
        let mut text = RichText::plain("abcd");
        text.apply_formatting(0..2, &AttributePatch::bold(true)).unwrap();
        text.insert_text(2, "XY").unwrap();
        assert_eq!(text.spans()[0].text, "abXY");
        assert!(text.spans()[0].attrs.bold);
        assert_eq!(text.spans()[1].text, "cd");
    }

    #[test]
    fn test_insert_at_start_and_end() {
        let mut text = RichText::plain("mid");
        text.apply_formatting(0..3, &AttributePatch::underline(true))
            .unwrap();
        text.insert_text(0, ">").unwrap();
        text.insert_text(4, "<").unwrap();
        assert_eq!(text.plain_text(), ">mid<");
        assert_eq!(text.spans().len(), 1);
        assert!(text.spans()[0].attrs.underline);

        assert!(text.insert_text(6, "x").is_err());
    }

    #[test]
    fn test_insert_into_empty_model() {
        let mut text = RichText::new();
        text.insert_text(0, "").unwrap();
        assert!(text.is_empty());
        text.insert_text(0, "first").unwrap();
        assert_eq!(text, RichText::plain("first"));
    }

    #[test]
    fn test_delete_merges_neighbours() {
        let mut text = RichText::plain("aaXbb");
        text.apply_formatting(2..3, &AttributePatch::bold(true)).unwrap();
        assert_eq!(text.spans().len(), 3);
        text.delete_range(2..3).unwrap();
        assert_eq!(text.spans().len(), 1);
        assert_eq!(text.plain_text(), "aabb");
    }

    #[test]
    fn test_delete_everything_leaves_zero_spans() {
        let mut text = RichText::plain("gone");
        text.delete_range(0..4).unwrap();
        assert!(text.is_empty());
        assert_eq!(text.spans().len(), 0);
    }

    #[test]
    fn test_attributes_at() {
        let mut text = RichText::plain("abc");
        text.apply_formatting(1..2, &AttributePatch::bold(true)).unwrap();
        assert_eq!(text.attributes_at(1), Some(Attributes::bold()));
        assert_eq!(text.attributes_at(2), Some(Attributes::default()));
        assert_eq!(text.attributes_at(3), None);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_deserialize_rejects_unmerged_spans() {
        let json = r#"[{"text":"a","bold":true},{"text":"b","bold":true}]"#;
        assert!(RichText::from_json(json).is_err());
    }

    #[test]
    fn test_deserialize_rejects_empty_span_and_bad_size() {
        assert!(RichText::from_json(r#"[{"text":""}]"#).is_err());
        assert!(RichText::from_json(r#"[{"text":"a","font_size":400}]"#).is_err());
        assert!(RichText::from_json(r#"[{"text":"a","color":"blue"}]"#).is_err());
    }

    #[test]
    fn test_normalized_repairs() {
        let broken = RichText {
            spans: vec![
                Span::plain("a"),
                Span::plain(""),
                Span::plain("b"),
                Span::new(
                    "c",
                    Attributes {
                        font_size: Some(200),
                        ..Attributes::default()
                    },
                ),
            ],
        };
        assert!(broken.validate().is_err());
        let fixed = broken.normalized();
        assert_invariants(&fixed);
        assert_eq!(fixed.plain_text(), "abc");
        assert_eq!(fixed.spans()[1].attrs.font_size, Some(MAX_FONT_SIZE));
    }

    #[test]
    fn test_invariants_hold_after_mutation_sequence() {
        let mut text = RichText::plain("The quick brown fox jumps");
        let steps: Vec<Box<dyn Fn(&mut RichText) -> Result<()>>> = vec![
            Box::new(|t: &mut RichText| t.apply_formatting(4..9, &AttributePatch::bold(true))),
            Box::new(|t: &mut RichText| t.toggle_underline(0..15)),
            Box::new(|t: &mut RichText| t.insert_text(9, " and slow")),
            Box::new(|t: &mut RichText| t.apply_formatting(2..20, &AttributePatch::color(Some(red())))),
            Box::new(|t: &mut RichText| t.delete_range(3..12)),
            Box::new(|t: &mut RichText| t.clear_formatting(0..5)),
            Box::new(|t: &mut RichText| t.toggle_bold(0..t.len())),
            Box::new(|t: &mut RichText| t.apply_formatting(1..3, &AttributePatch::font_size(Some(18)))),
        ];
        for step in steps {
            step(&mut text).unwrap();
            assert_invariants(&text);
            let covered: usize = text.spans().iter().map(Span::len).sum();
            assert_eq!(covered, char_count(&text.plain_text()));
        }
    }
}
