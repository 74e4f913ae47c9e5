use std::collections::BTreeSet;

use sectorflow_core::code::{MAX_DEPTH, MIN_DEPTH};
use sectorflow_core::{SectorCatalog, SectorCode};

use crate::aggregate::{row_key, RowKey};
use crate::error::ReconcileError;
use crate::model::{ensure_no_ranges, FlowRecord, GroupKeySpec, SectorField};

/// Copy rows down through fan-out-1 boundaries, one level at a time.
///
/// A row whose sector has exactly one child in the catalog gets a copy with
/// the child code and the same amount, unless that exact row already exists
/// for the group. Parents with several children are left for allocation;
/// codes absent from the catalog pass through with a debug note. Copies made
/// at one boundary cascade through the next, and a second application adds
/// nothing.
pub fn sector_disaggregation(
    records: Vec<FlowRecord>,
    group: &GroupKeySpec,
    catalog: &SectorCatalog,
) -> Result<Vec<FlowRecord>, ReconcileError> {
    ensure_no_ranges(&records, "sector_disaggregation")?;
    let mut records = records;

    for parent_len in MIN_DEPTH..MAX_DEPTH {
        let mut existing: BTreeSet<RowKey> = records.iter().map(|r| row_key(group, r)).collect();
        let mut absent: BTreeSet<SectorCode> = BTreeSet::new();
        let mut added: Vec<FlowRecord> = Vec::new();

        for record in &records {
            for field in SectorField::BOTH {
                let Some(code) = field.of(record) else {
                    continue;
                };
                if !code.is_numeric() || code.depth() != parent_len {
                    continue;
                }
                if !catalog.contains(code) {
                    absent.insert(code.clone());
                    continue;
                }
                let Some(child) = catalog.sole_child(code) else {
                    continue;
                };
                let mut copy = record.clone();
                field.set(&mut copy, Some(child.clone()));
                let key = row_key(group, &copy);
                if existing.contains(&key) {
                    continue;
                }
                existing.insert(key);
                added.push(copy);
            }
        }

        if !absent.is_empty() {
            log::debug!(
                "sector_disaggregation: {} length-{parent_len} codes not in the {} catalog",
                absent.len(),
                catalog.year()
            );
        }
        records.extend(added);
    }

    Ok(records)
}
