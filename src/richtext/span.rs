//! Span and attribute types for rich text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Smallest font size accepted for a span, in points.
pub const MIN_FONT_SIZE: u16 = 6;
/// Largest font size accepted for a span, in points.
pub const MAX_FONT_SIZE: u16 = 96;

// ─────────────────────────────────────────────────────────────────────────────
// Color
// ─────────────────────────────────────────────────────────────────────────────

/// An RGB text color, written as `#rrggbb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `#rrggbb` or the `#rgb` shorthand (case-insensitive).
    pub fn from_hex(s: &str) -> Option<Self> {
        let hex = s.trim().strip_prefix('#')?;
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        match hex.len() {
            6 => Some(Self {
                r: u8::from_str_radix(&hex[0..2], 16).ok()?,
                g: u8::from_str_radix(&hex[2..4], 16).ok()?,
                b: u8::from_str_radix(&hex[4..6], 16).ok()?,
            }),
            3 => {
                let digit = |i: usize| u8::from_str_radix(&hex[i..i + 1], 16).ok();
                Some(Self {
                    r: digit(0)? * 17,
                    g: digit(1)? * 17,
                    b: digit(2)? * 17,
                })
            }
            _ => None,
        }
    }

    /// Lowercase `#rrggbb`.
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Color::from_hex(s).ok_or_else(|| format!("invalid color '{}'", s))
    }
}

impl TryFrom<String> for Color {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_hex()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Attributes
// ─────────────────────────────────────────────────────────────────────────────

/// Formatting carried by a span. The default is plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Attributes {
    pub bold: bool,
    pub underline: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<Color>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<u16>,
}

impl Attributes {
    pub fn bold() -> Self {
        Self {
            bold: true,
            ..Self::default()
        }
    }

    pub fn is_plain(&self) -> bool {
        *self == Self::default()
    }

    /// Attributes after applying `patch`. Font sizes are clamped into range.
    pub fn patched(&self, patch: &AttributePatch) -> Self {
        Self {
            bold: patch.bold.unwrap_or(self.bold),
            underline: patch.underline.unwrap_or(self.underline),
            color: patch.color.unwrap_or(self.color),
            font_size: patch
                .font_size
                .unwrap_or(self.font_size)
                .map(|size| size.clamp(MIN_FONT_SIZE, MAX_FONT_SIZE)),
        }
    }
}

/// A partial attribute update. `None` leaves the attribute untouched.
///
/// `color` and `font_size` are doubly optional: `Some(None)` clears them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributePatch {
    pub bold: Option<bool>,
    pub underline: Option<bool>,
    pub color: Option<Option<Color>>,
    pub font_size: Option<Option<u16>>,
}

impl AttributePatch {
    /// Patch that resets every attribute to its default.
    pub fn clear_all() -> Self {
        Self {
            bold: Some(false),
            underline: Some(false),
            color: Some(None),
            font_size: Some(None),
        }
    }

    pub fn bold(on: bool) -> Self {
        Self {
            bold: Some(on),
            ..Self::default()
        }
    }

    pub fn underline(on: bool) -> Self {
        Self {
            underline: Some(on),
            ..Self::default()
        }
    }

    pub fn color(color: Option<Color>) -> Self {
        Self {
            color: Some(color),
            ..Self::default()
        }
    }

    pub fn font_size(size: Option<u16>) -> Self {
        Self {
            font_size: Some(size),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Span
// ─────────────────────────────────────────────────────────────────────────────

/// A contiguous run of text sharing one set of attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub text: String,
    #[serde(flatten)]
    pub attrs: Attributes,
}

impl Span {
    pub fn new(text: impl Into<String>, attrs: Attributes) -> Self {
        Self {
            text: text.into(),
            attrs,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, Attributes::default())
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}
