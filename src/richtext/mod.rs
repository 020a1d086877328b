//! Rich text model
//!
//! Formatted content is kept as an ordered list of [`Span`]s rather than
//! toolkit-specific tag ranges. Every mutation preserves two invariants:
//!
//! - the spans partition the text (each character belongs to exactly one span,
//!   and no span is empty)
//! - adjacent spans never carry identical [`Attributes`]
//!
//! All positions and ranges are measured in chars.

mod model;
mod span;

pub use model::{RichText, Violation};
pub use span::{AttributePatch, Attributes, Color, Span, MAX_FONT_SIZE, MIN_FONT_SIZE};
