use std::collections::{BTreeMap, BTreeSet};

use sectorflow_core::code::MIN_DEPTH;
use sectorflow_core::{SectorCatalog, SectorCode};

use crate::error::ReconcileError;
use crate::model::{
    ensure_no_ranges, normalize_overrides, FlowRecord, GroupKey, GroupKeySpec, SectorField,
};

/// Records after lost-row redistribution, with the number of rows created
/// by splitting and the number of coarse orphans kept as-is.
#[derive(Debug)]
pub struct SplitOutcome {
    pub records: Vec<FlowRecord>,
    pub split: usize,
    pub orphans: usize,
}

/// Divide each group's row amounts by the group's row count.
///
/// Undoes the inflation left by an activity-to-sector mapping that copied
/// one activity amount onto several sector rows: afterwards the group
/// total equals the original activity amount again.
pub fn equal_allocation(
    records: Vec<FlowRecord>,
    group: &GroupKeySpec,
) -> Result<Vec<FlowRecord>, ReconcileError> {
    ensure_no_ranges(&records, "equal_allocation")?;

    let mut counts: BTreeMap<GroupKey, usize> = BTreeMap::new();
    for record in &records {
        *counts.entry(group.key_of(record)).or_insert(0) += 1;
    }

    Ok(records
        .into_iter()
        .map(|mut record| {
            if let Some(&n) = counts.get(&group.key_of(&record)) {
                record.amount /= n as f64;
            }
            record
        })
        .collect())
}

/// Redistribute rows that would vanish from a naive subset at `target_depth`.
///
/// A single-sector row at length i is lost when no row in its group carries
/// a direct child of its code at length i+1 on the same position. Each lost
/// row is replaced by one row per catalog descendant at the target depth,
/// splitting the amount equally. Rows whose code has no descendants are
/// kept coarse and logged; rows with children present pass through, as do
/// override tokens and dual-sector rows.
pub fn equally_allocate_parent_to_child(
    records: Vec<FlowRecord>,
    target_depth: usize,
    group: &GroupKeySpec,
    catalog: &SectorCatalog,
) -> Result<SplitOutcome, ReconcileError> {
    ensure_no_ranges(&records, "equally_allocate_parent_to_child")?;
    let mut work = normalize_overrides(records);
    let mut split = 0usize;
    let mut orphans = 0usize;

    for parent_len in MIN_DEPTH..target_depth {
        let child_len = parent_len + 1;

        // Parents already represented one level down, per group and position.
        let mut covered: BTreeSet<(GroupKey, &'static str, SectorCode)> = BTreeSet::new();
        for record in &work {
            for field in SectorField::BOTH {
                if let Some(code) = field.of(record) {
                    if code.is_numeric() && code.depth() == child_len {
                        if let Some(parent) = code.truncate(parent_len) {
                            covered.insert((group.key_of(record), field.name(), parent));
                        }
                    }
                }
            }
        }

        let mut next: Vec<FlowRecord> = Vec::with_capacity(work.len());
        for record in work {
            let lost = match record.sole_sector() {
                Some((field, code)) if code.is_numeric() && code.depth() == parent_len => {
                    let key = (group.key_of(&record), field.name(), code.clone());
                    if covered.contains(&key) {
                        None
                    } else {
                        Some((field, code.clone()))
                    }
                }
                _ => None,
            };

            let Some((field, code)) = lost else {
                next.push(record);
                continue;
            };

            let descendants = catalog.descendants_at(&code, target_depth);
            if descendants.is_empty() {
                log::warn!(
                    "no length-{target_depth} descendants for '{code}' in the {} catalog; keeping coarse row ({})",
                    catalog.year(),
                    group.key_of(&record)
                );
                orphans += 1;
                next.push(record);
                continue;
            }

            let share = record.amount / descendants.len() as f64;
            for child in descendants {
                let mut piece = record.clone();
                field.set(&mut piece, Some(child));
                piece.amount = share;
                split += 1;
                next.push(piece);
            }
        }
        work = next;
    }

    Ok(SplitOutcome { records: work, split, orphans })
}
