use std::fmt;

use serde::{Deserialize, Serialize};

/// Shortest valid tree depth. Two-digit codes are the roots of the hierarchy.
pub const MIN_DEPTH: usize = 2;
/// Deepest tree level carried by any catalog.
pub const MAX_DEPTH: usize = 6;
/// Nominal depth assigned to override tokens so they sort with the finest level.
pub const OVERRIDE_DEPTH: usize = 6;

/// Canonical household override code.
pub const HOUSEHOLD: &str = "F010";
/// Raw household spellings folded into [`HOUSEHOLD`] on normalization.
pub const HOUSEHOLD_VARIANTS: [&str; 2] = ["F0", "F01"];
/// Government enterprise override code.
pub const GOVERNMENT: &str = "S00201";

/// A sector classification code.
///
/// Numeric codes form a prefix tree: the parent of a length-n code is its
/// first n-1 digits. Non-numeric override tokens (households, government
/// enterprises) sit outside the tree as atomic leaves. Range tokens such as
/// `31-33` are never valid tree nodes; callers detect them with
/// [`SectorCode::is_range`] and reject them before reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectorCode(String);

impl SectorCode {
    pub fn new(code: impl Into<String>) -> Self {
        SectorCode(code.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// True for codes made entirely of ASCII digits.
    pub fn is_numeric(&self) -> bool {
        !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit())
    }

    /// True for sector-range tokens like `31-33`: digits, a dash, digits.
    pub fn is_range(&self) -> bool {
        match self.0.split_once('-') {
            Some((lo, hi)) => {
                !lo.is_empty()
                    && !hi.is_empty()
                    && lo.bytes().all(|b| b.is_ascii_digit())
                    && hi.bytes().all(|b| b.is_ascii_digit())
            }
            None => false,
        }
    }

    /// True for non-numeric, non-range tokens (households, government).
    pub fn is_override(&self) -> bool {
        !self.is_numeric() && !self.is_range()
    }

    /// Tree depth: digit count for numeric codes, [`OVERRIDE_DEPTH`] for
    /// override tokens. Range tokens are rejected before depth matters.
    pub fn depth(&self) -> usize {
        if self.is_numeric() {
            self.0.len()
        } else {
            OVERRIDE_DEPTH
        }
    }

    /// The one-level-coarser code, None at the roots and for overrides.
    pub fn parent(&self) -> Option<SectorCode> {
        if self.is_numeric() && self.0.len() > MIN_DEPTH {
            Some(SectorCode(self.0[..self.0.len() - 1].to_string()))
        } else {
            None
        }
    }

    /// Prefix of this code at `depth` digits. None for overrides, for codes
    /// shorter than `depth`, and below [`MIN_DEPTH`].
    pub fn truncate(&self, depth: usize) -> Option<SectorCode> {
        if !self.is_numeric() || depth < MIN_DEPTH || self.0.len() < depth {
            return None;
        }
        Some(SectorCode(self.0[..depth].to_string()))
    }

    /// True when `other` is a strictly finer code under this one.
    pub fn is_ancestor_of(&self, other: &SectorCode) -> bool {
        self.is_numeric()
            && other.is_numeric()
            && other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
    }

    /// Fold raw household spellings into the canonical [`HOUSEHOLD`] token.
    /// All other codes pass through unchanged.
    pub fn normalized(&self) -> SectorCode {
        if HOUSEHOLD_VARIANTS.contains(&self.0.as_str()) {
            SectorCode(HOUSEHOLD.to_string())
        } else {
            self.clone()
        }
    }
}

impl fmt::Display for SectorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SectorCode {
    fn from(s: &str) -> Self {
        SectorCode::new(s)
    }
}

impl From<String> for SectorCode {
    fn from(s: String) -> Self {
        SectorCode::new(s)
    }
}
