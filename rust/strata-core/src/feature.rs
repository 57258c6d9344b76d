//! Compact field-label encoding.
//!
//! A `Feature` packs a label into 32 bits: the low three bits carry the
//! label type, the upper 29 bits an index into the interned string table
//! (or, for integer labels, the integer itself). Definitions and hidden
//! labels are *allowed in closed structs*: they never participate in
//! closedness checks.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::Display;
use thiserror::Error;

use crate::strings::StringTable;

/// Largest representable integer label (and string-table index).
pub const MAX_INDEX: u32 = (1 << 28) - 1;

const TYPE_BITS: u32 = 3;
const TYPE_MASK: u32 = (1 << TYPE_BITS) - 1;

/// The type tag of a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[repr(u8)]
pub enum FeatureType {
    /// Regular string-keyed field.
    #[strum(serialize = "string")]
    StringLabel = 0b000,
    /// Integer-keyed field (list element).
    #[strum(serialize = "int")]
    IntLabel = 0b001,
    /// Let binding; invisible to output and closedness.
    #[strum(serialize = "let")]
    LetLabel = 0b010,
    /// Definition (`#foo`).
    #[strum(serialize = "definition")]
    Definition = 0b011,
    /// Hidden field (`_foo`).
    #[strum(serialize = "hidden")]
    Hidden = 0b110,
    /// Hidden definition (`_#foo`).
    #[strum(serialize = "hidden definition")]
    HiddenDefinition = 0b111,
}

impl FeatureType {
    fn from_bits(bits: u32) -> Option<FeatureType> {
        match bits {
            0b000 => Some(FeatureType::StringLabel),
            0b001 => Some(FeatureType::IntLabel),
            0b010 => Some(FeatureType::LetLabel),
            0b011 => Some(FeatureType::Definition),
            0b110 => Some(FeatureType::Hidden),
            0b111 => Some(FeatureType::HiddenDefinition),
            _ => None,
        }
    }
}

/// Error constructing a label.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("integer label {0} out of range [0, 2^28-1]")]
    IntOutOfRange(i64),
    #[error("string index {0} out of range (0, 2^28)")]
    IndexOutOfRange(u32),
}

/// An interned field identifier with a type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Feature(u32);

impl Feature {
    /// Build a label from an index and a type tag.
    pub fn make(index: u32, typ: FeatureType) -> Result<Feature, LabelError> {
        if index > MAX_INDEX {
            return Err(LabelError::IndexOutOfRange(index));
        }
        Ok(Feature(index << TYPE_BITS | typ as u32))
    }

    /// Integer label, e.g. a list element index.
    pub fn int(i: i64) -> Result<Feature, LabelError> {
        if !(0..=MAX_INDEX as i64).contains(&i) {
            return Err(LabelError::IntOutOfRange(i));
        }
        Feature::make(i as u32, FeatureType::IntLabel)
    }

    /// The string-table index (or integer value) of this label.
    pub fn index(self) -> u32 {
        self.0 >> TYPE_BITS
    }

    /// The type tag of this label.
    pub fn typ(self) -> FeatureType {
        // Only constructed through make(), so the tag bits are valid.
        FeatureType::from_bits(self.0 & TYPE_MASK).unwrap()
    }

    pub fn is_string(self) -> bool {
        self.typ() == FeatureType::StringLabel
    }

    pub fn is_int(self) -> bool {
        self.typ() == FeatureType::IntLabel
    }

    /// Regular fields participate in output and closedness.
    pub fn is_regular(self) -> bool {
        matches!(self.typ(), FeatureType::StringLabel | FeatureType::IntLabel)
    }

    pub fn is_def(self) -> bool {
        matches!(
            self.typ(),
            FeatureType::Definition | FeatureType::HiddenDefinition
        )
    }

    pub fn is_hidden(self) -> bool {
        matches!(self.typ(), FeatureType::Hidden | FeatureType::HiddenDefinition)
    }

    pub fn is_let(self) -> bool {
        self.typ() == FeatureType::LetLabel
    }

    /// Definitions, hidden fields and lets never fail a closedness check.
    pub fn allowed_in_closed(self) -> bool {
        self.is_def() || self.is_hidden() || self.is_let()
    }

    /// Render the label for error messages, resolving string indices
    /// through the given table.
    pub fn display<'a>(self, table: &'a StringTable) -> FeatureDisplay<'a> {
        FeatureDisplay { f: self, table }
    }
}

/// Borrowed display adaptor; resolves interned names.
pub struct FeatureDisplay<'a> {
    f: Feature,
    table: &'a StringTable,
}

impl fmt::Display for FeatureDisplay<'_> {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        let idx = self.f.index();
        match self.f.typ() {
            FeatureType::IntLabel => write!(out, "{}", idx),
            _ => match self.table.resolve(idx) {
                Some(s) => write!(out, "{}", s),
                None => write!(out, "<label:{}>", idx),
            },
        }
    }
}
