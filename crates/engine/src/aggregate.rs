use std::collections::{BTreeMap, BTreeSet};

use sectorflow_core::code::MIN_DEPTH;
use sectorflow_core::SectorCode;

use crate::error::ReconcileError;
use crate::model::{
    ensure_no_ranges, normalize_overrides, FlowRecord, GroupKey, GroupKeySpec, SectorField,
    ATTR_DISAGGREGATE_FLAG, ATTR_SECTOR_COUNT, ATTR_SUPPRESSED,
};

/// Row identity for consolidation: group key plus both sector positions.
pub(crate) type RowKey = (GroupKey, Option<SectorCode>, Option<SectorCode>);

pub(crate) fn row_key(group: &GroupKeySpec, record: &FlowRecord) -> RowKey {
    (
        group.key_of(record),
        record.sector_produced_by.clone(),
        record.sector_consumed_by.clone(),
    )
}

/// Merge rows sharing a group key and sector pair, summing their amounts.
/// The first row of each duplicate set keeps its attrs. Output comes back
/// in key order, so consolidation doubles as the deterministic sort.
pub fn consolidate(records: Vec<FlowRecord>, group: &GroupKeySpec) -> Vec<FlowRecord> {
    let mut merged: BTreeMap<RowKey, FlowRecord> = BTreeMap::new();
    for record in records {
        let key = row_key(group, &record);
        match merged.get_mut(&key) {
            Some(existing) => existing.amount += record.amount,
            None => {
                merged.insert(key, record);
            }
        }
    }
    merged.into_values().collect()
}

/// Depth a row participates at: the shared depth of its populated numeric
/// sector fields. None when any field is non-numeric or the two disagree;
/// such rows ride through aggregation untouched.
pub(crate) fn row_depth(record: &FlowRecord) -> Option<usize> {
    let mut depth = None;
    for field in SectorField::BOTH {
        if let Some(code) = field.of(record) {
            if !code.is_numeric() {
                return None;
            }
            match depth {
                None => depth = Some(code.depth()),
                Some(d) if d == code.depth() => {}
                Some(_) => return None,
            }
        }
    }
    depth
}

fn truncate_pair(
    record: &FlowRecord,
    depth: usize,
) -> Option<(Option<SectorCode>, Option<SectorCode>)> {
    let spb = match &record.sector_produced_by {
        Some(code) => Some(code.truncate(depth)?),
        None => None,
    };
    let scb = match &record.sector_consumed_by {
        Some(code) => Some(code.truncate(depth)?),
        None => None,
    };
    Some((spb, scb))
}

/// Row-level markers never survive onto synthesized parents.
fn strip_row_markers(record: &mut FlowRecord) {
    record.attrs.remove(ATTR_SUPPRESSED);
    record.attrs.remove(ATTR_SECTOR_COUNT);
    record.attrs.remove(ATTR_DISAGGREGATE_FLAG);
}

/// Synthesize missing coarse rows bottom-up so every ancestor level carries
/// the sum of its children.
///
/// Works one boundary at a time from the deepest level toward length 2;
/// rows synthesized at one boundary are the children of the next. A parent
/// already present for the same group key is left alone, whatever its
/// amount says; the conservation check surfaces any mismatch.
pub fn sector_aggregation(
    records: Vec<FlowRecord>,
    group: &GroupKeySpec,
) -> Result<Vec<FlowRecord>, ReconcileError> {
    ensure_no_ranges(&records, "sector_aggregation")?;
    let mut records = consolidate(normalize_overrides(records), group);

    let Some(max_depth) = records.iter().filter_map(row_depth).max() else {
        return Ok(records);
    };

    for parent_len in (MIN_DEPTH..max_depth).rev() {
        let child_len = parent_len + 1;

        let existing: BTreeSet<RowKey> = records
            .iter()
            .filter(|r| row_depth(r) == Some(parent_len))
            .map(|r| row_key(group, r))
            .collect();

        let mut synthesized: BTreeMap<RowKey, FlowRecord> = BTreeMap::new();
        for record in records.iter().filter(|r| row_depth(r) == Some(child_len)) {
            let Some((spb, scb)) = truncate_pair(record, parent_len) else {
                continue;
            };
            let key = (group.key_of(record), spb.clone(), scb.clone());
            if existing.contains(&key) {
                continue;
            }
            match synthesized.get_mut(&key) {
                Some(parent) => parent.amount += record.amount,
                None => {
                    let mut parent = record.clone();
                    SectorField::ProducedBy.set(&mut parent, spb);
                    SectorField::ConsumedBy.set(&mut parent, scb);
                    strip_row_markers(&mut parent);
                    synthesized.insert(key, parent);
                }
            }
        }
        records.extend(synthesized.into_values());
    }

    Ok(records)
}
