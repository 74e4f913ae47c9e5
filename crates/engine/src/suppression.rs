use std::collections::{BTreeMap, BTreeSet};

use sectorflow_core::SectorCode;

use crate::error::ReconcileError;
use crate::model::{
    ensure_no_ranges, FlowRecord, GroupKey, GroupKeySpec, ATTR_SECTOR_COUNT, ATTR_SUPPRESSED,
};

/// Records after suppression estimation, with how many rows received an
/// estimate and how many parent residuals came out negative.
#[derive(Debug)]
pub struct SuppressionOutcome {
    pub records: Vec<FlowRecord>,
    pub estimated: usize,
    pub negative_residuals: usize,
}

/// A row is estimable when the source withheld it: flagged suppressed and
/// carrying the placeholder zero. Flagged rows with a real amount count as
/// known siblings.
fn estimable(record: &FlowRecord) -> bool {
    record.is_suppressed() && record.amount == 0.0
}

struct Family {
    known: f64,
    suppressed: Vec<usize>,
}

/// Estimate withheld child amounts from parent residuals.
///
/// For each (group, parent) family with suppressed children, the residual
/// is the parent amount minus the sum of known children, divided equally
/// among the suppressed siblings. The walk pairs adjacent depths actually
/// present in the data, coarse to fine, so a source publishing lengths 4
/// and 6 with nothing at 5 still forms its families across the gap, and
/// estimates made at one boundary serve as parents at the next. Estimated
/// rows lose their suppressed marker and record the sibling count instead.
/// Negative residuals are split as-is and counted; the validation pass
/// surfaces them.
pub fn estimate_suppressed(
    records: Vec<FlowRecord>,
    group: &GroupKeySpec,
) -> Result<SuppressionOutcome, ReconcileError> {
    ensure_no_ranges(&records, "estimate_suppressed")?;
    let mut records = records;
    let mut estimated = 0usize;
    let mut negative_residuals = 0usize;

    let depths: Vec<usize> = records
        .iter()
        .filter_map(|r| r.sole_sector())
        .filter(|(_, code)| code.is_numeric())
        .map(|(_, code)| code.depth())
        .collect::<BTreeSet<usize>>()
        .into_iter()
        .collect();

    for pair in depths.windows(2) {
        let (parent_len, child_len) = (pair[0], pair[1]);

        let mut parents: BTreeMap<(GroupKey, SectorCode), f64> = BTreeMap::new();
        for record in &records {
            if record.is_suppressed() {
                continue;
            }
            if let Some((_, code)) = record.sole_sector() {
                if code.is_numeric() && code.depth() == parent_len {
                    *parents.entry((group.key_of(record), code.clone())).or_insert(0.0) +=
                        record.amount;
                }
            }
        }

        let mut families: BTreeMap<(GroupKey, SectorCode), Family> = BTreeMap::new();
        for (i, record) in records.iter().enumerate() {
            let Some((_, code)) = record.sole_sector() else {
                continue;
            };
            if !code.is_numeric() || code.depth() != child_len {
                continue;
            }
            let Some(parent) = code.truncate(parent_len) else {
                continue;
            };
            let family = families
                .entry((group.key_of(record), parent))
                .or_insert(Family { known: 0.0, suppressed: Vec::new() });
            if estimable(record) {
                family.suppressed.push(i);
            } else {
                family.known += record.amount;
            }
        }

        let mut replacements: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
        for ((key, parent), family) in &families {
            if family.suppressed.is_empty() {
                continue;
            }
            let Some(parent_amount) = parents.get(&(key.clone(), parent.clone())) else {
                continue;
            };
            let residual = parent_amount - family.known;
            if residual < 0.0 {
                negative_residuals += 1;
                log::warn!(
                    "negative residual {residual} under parent '{parent}' ({key}); estimates kept as-is"
                );
            }
            let share = residual / family.suppressed.len() as f64;
            for &i in &family.suppressed {
                replacements.insert(i, (share, family.suppressed.len()));
            }
        }
        if replacements.is_empty() {
            continue;
        }

        records = records
            .into_iter()
            .enumerate()
            .map(|(i, mut record)| {
                if let Some(&(share, siblings)) = replacements.get(&i) {
                    record.amount = share;
                    record.attrs.remove(ATTR_SUPPRESSED);
                    record.attrs.insert(ATTR_SECTOR_COUNT.into(), siblings.to_string());
                    estimated += 1;
                }
                record
            })
            .collect();
    }

    Ok(SuppressionOutcome { records, estimated, negative_residuals })
}
