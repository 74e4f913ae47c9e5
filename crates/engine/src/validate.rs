use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use sectorflow_core::{SectorCatalog, SectorCode};

use crate::model::{FlowRecord, GroupKey, GroupKeySpec, ATTR_SECTOR_COUNT};

/// Relative tolerance for parent-versus-children comparisons.
pub const CONSERVATION_REL_TOL: f64 = 1e-6;

#[derive(Debug, Clone, Serialize)]
pub struct ConservationViolation {
    pub group: GroupKey,
    pub parent: SectorCode,
    pub parent_amount: f64,
    pub child_sum: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NegativeAmount {
    pub group: GroupKey,
    pub sector: Option<SectorCode>,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TotalsDrift {
    pub group: GroupKey,
    pub before: f64,
    pub after: f64,
}

/// Check that every parent with all catalog children present equals the sum
/// of those children, within `rel_tol` of the parent magnitude (floored at
/// the tolerance itself for zero parents). Families touched by suppression
/// estimation are skipped: their children are defined as the residual.
pub fn check_conservation(
    records: &[FlowRecord],
    group: &GroupKeySpec,
    catalog: &SectorCatalog,
    rel_tol: f64,
) -> Vec<ConservationViolation> {
    let mut by_code: BTreeMap<(GroupKey, SectorCode), (f64, bool)> = BTreeMap::new();
    for record in records {
        if let Some((_, code)) = record.sole_sector() {
            if code.is_numeric() {
                let entry = by_code
                    .entry((group.key_of(record), code.clone()))
                    .or_insert((0.0, false));
                entry.0 += record.amount;
                entry.1 |=
                    record.is_suppressed() || record.attrs.contains_key(ATTR_SECTOR_COUNT);
            }
        }
    }

    let mut violations = Vec::new();
    for ((key, parent), &(parent_amount, parent_tainted)) in &by_code {
        if parent_tainted {
            continue;
        }
        let kids = catalog.children(parent);
        if kids.is_empty() {
            continue;
        }

        let mut child_sum = 0.0;
        let mut all_present = true;
        let mut tainted = false;
        for child in kids {
            match by_code.get(&(key.clone(), child.clone())) {
                Some(&(amount, t)) => {
                    child_sum += amount;
                    tainted |= t;
                }
                None => {
                    all_present = false;
                    break;
                }
            }
        }
        if !all_present || tainted {
            continue;
        }

        let tol = rel_tol * parent_amount.abs().max(1.0);
        if (child_sum - parent_amount).abs() > tol {
            log::warn!(
                "conservation: parent '{parent}' carries {parent_amount} but children sum to {child_sum} ({key})"
            );
            violations.push(ConservationViolation {
                group: key.clone(),
                parent: parent.clone(),
                parent_amount,
                child_sum,
            });
        }
    }
    violations
}

/// Surface every negative amount with its context. Negative values are
/// upstream inconsistencies; they are reported, never clamped.
pub fn check_negative_amounts(
    records: &[FlowRecord],
    group: &GroupKeySpec,
    context: &str,
) -> Vec<NegativeAmount> {
    let mut hits = Vec::new();
    for record in records {
        if record.amount < 0.0 {
            let sector = record.sector().cloned();
            let key = group.key_of(record);
            log::error!(
                "{context}: negative amount {} for sector '{}' ({key})",
                record.amount,
                sector.as_ref().map(SectorCode::as_str).unwrap_or("-")
            );
            hits.push(NegativeAmount { group: key, sector, amount: record.amount });
        }
    }
    hits
}

/// Compare per-group totals across two same-granularity record sets.
/// Callers pick snapshots where totals must be preserved; any drift beyond
/// `rel_tol` is returned and logged.
pub fn compare_group_totals(
    before: &[FlowRecord],
    after: &[FlowRecord],
    group: &GroupKeySpec,
    rel_tol: f64,
) -> Vec<TotalsDrift> {
    fn totals(records: &[FlowRecord], group: &GroupKeySpec) -> BTreeMap<GroupKey, f64> {
        let mut map = BTreeMap::new();
        for record in records {
            *map.entry(group.key_of(record)).or_insert(0.0) += record.amount;
        }
        map
    }

    let before_totals = totals(before, group);
    let after_totals = totals(after, group);
    let keys: BTreeSet<&GroupKey> = before_totals.keys().chain(after_totals.keys()).collect();

    let mut drifts = Vec::new();
    for key in keys {
        let b = before_totals.get(key).copied().unwrap_or(0.0);
        let a = after_totals.get(key).copied().unwrap_or(0.0);
        let tol = rel_tol * b.abs().max(1.0);
        if (a - b).abs() > tol {
            log::warn!("group totals drift for {key}: {b} -> {a}");
            drifts.push(TotalsDrift { group: key.clone(), before: b, after: a });
        }
    }
    drifts
}
