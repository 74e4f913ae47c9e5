use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::code::SectorCode;

/// A parent-child edge of the sector tree, always one level apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrosswalkEdge {
    pub parent: SectorCode,
    pub child: SectorCode,
    /// Tree depth of the child code.
    pub level: usize,
}

/// The official sector tree for a single classification year.
///
/// Built from a flat code list: edges are derived from string prefixes, so a
/// code's parent is the entry one digit shorter. Override tokens are kept as
/// atomic leaves with no parent and no children. Immutable once constructed;
/// share via [`crate::store::CatalogStore`] when the same year is needed in
/// several places.
#[derive(Debug, Clone)]
pub struct SectorCatalog {
    year: u16,
    codes: BTreeSet<SectorCode>,
    children: BTreeMap<SectorCode, Vec<SectorCode>>,
}

impl SectorCatalog {
    /// Build a catalog from raw codes. Household spellings are folded to
    /// their canonical token and range tokens are dropped with a warning.
    pub fn from_codes(year: u16, codes: impl IntoIterator<Item = SectorCode>) -> Self {
        let mut set: BTreeSet<SectorCode> = BTreeSet::new();
        for code in codes {
            let code = code.normalized();
            if code.is_range() {
                log::warn!("dropping range token '{code}' from {year} code list");
                continue;
            }
            if code.as_str().is_empty() {
                continue;
            }
            set.insert(code);
        }

        let mut children: BTreeMap<SectorCode, Vec<SectorCode>> = BTreeMap::new();
        for code in &set {
            if let Some(parent) = code.parent() {
                if set.contains(&parent) {
                    children.entry(parent).or_default().push(code.clone());
                }
            }
        }

        SectorCatalog { year, codes: set, children }
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn contains(&self, code: &SectorCode) -> bool {
        self.codes.contains(code)
    }

    pub fn codes(&self) -> impl Iterator<Item = &SectorCode> {
        self.codes.iter()
    }

    /// Codes at one tree depth, in lexical order.
    pub fn codes_at(&self, depth: usize) -> impl Iterator<Item = &SectorCode> {
        self.codes.iter().filter(move |c| c.depth() == depth)
    }

    /// Direct children of `code`, one level finer. Empty for leaves,
    /// overrides, and codes not in this catalog.
    pub fn children(&self, code: &SectorCode) -> &[SectorCode] {
        self.children.get(code).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of direct children of `code`.
    pub fn fan_out(&self, code: &SectorCode) -> usize {
        self.children(code).len()
    }

    /// The single child of `code` when its fan-out is exactly one.
    pub fn sole_child(&self, code: &SectorCode) -> Option<&SectorCode> {
        match self.children(code) {
            [only] => Some(only),
            _ => None,
        }
    }

    /// All catalog codes at `depth` that sit under `code` in the tree.
    /// Empty when `depth` is not strictly finer than the code's own depth.
    pub fn descendants_at(&self, code: &SectorCode, depth: usize) -> Vec<SectorCode> {
        if !code.is_numeric() || depth <= code.depth() {
            return Vec::new();
        }
        self.codes
            .iter()
            .filter(|c| c.depth() == depth && code.is_ancestor_of(c))
            .cloned()
            .collect()
    }

    /// Deepest level present in the catalog.
    pub fn max_depth(&self) -> usize {
        self.codes.iter().map(SectorCode::depth).max().unwrap_or(0)
    }

    /// Every parent-child edge, in lexical parent order.
    pub fn edges(&self) -> Vec<CrosswalkEdge> {
        self.children
            .iter()
            .flat_map(|(parent, kids)| {
                kids.iter().map(|child| CrosswalkEdge {
                    parent: parent.clone(),
                    child: child.clone(),
                    level: child.depth(),
                })
            })
            .collect()
    }
}
