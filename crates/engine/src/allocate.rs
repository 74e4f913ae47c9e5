use std::collections::BTreeMap;

use sectorflow_core::SectorCode;

use crate::error::ReconcileError;
use crate::model::{
    ensure_no_ranges, flag_set, FlowRecord, GroupKey, GroupKeySpec, RatioEntry, RatioTable,
    SectorField, ATTR_DISAGGREGATE_FLAG,
};

/// Records after ratio application, with how many were scaled and how many
/// passed through unmatched.
#[derive(Debug)]
pub struct AllocationOutcome {
    pub records: Vec<FlowRecord>,
    pub allocated: usize,
    pub passthrough: usize,
}

/// Derive ratios from donor shares of base-level totals.
///
/// The base is the coarsest sector depth anywhere in the donor set, and
/// every donor row's ratio is its amount over its group's base-level sum.
/// Groups with a zero or missing base sum get ratio None so their rows
/// later pass through unscaled; a donor with no sectored rows at all is an
/// error.
pub fn proportional(donor: &[FlowRecord], group: &GroupKeySpec) -> Result<RatioTable, ReconcileError> {
    ensure_no_ranges(donor, "proportional")?;

    let base = donor
        .iter()
        .filter_map(|r| r.sector().map(SectorCode::depth))
        .min()
        .ok_or_else(|| ReconcileError::NoBaseSectors {
            context: "proportional: donor has no sectored rows".into(),
        })?;

    let mut denom: BTreeMap<GroupKey, f64> = BTreeMap::new();
    for record in donor {
        if record.sector().map(SectorCode::depth) == Some(base) {
            *denom.entry(group.key_of(record)).or_insert(0.0) += record.amount;
        }
    }

    let mut missing = 0usize;
    let entries: Vec<RatioEntry> = donor
        .iter()
        .filter_map(|record| {
            let sector = record.sector()?.clone();
            let ratio = match denom.get(&group.key_of(record)) {
                Some(d) if *d != 0.0 => Some(record.amount / d),
                _ => {
                    missing += 1;
                    None
                }
            };
            Some(RatioEntry { location: record.location.clone(), sector, ratio, helper_amount: None })
        })
        .collect();

    if missing > 0 {
        log::debug!("proportional: {missing} donor rows lack a base-level denominator");
    }
    Ok(RatioTable::new(entries))
}

/// Flag-gated variant of [`proportional`]: only donor rows carrying the
/// disaggregate flag share a denominator; unflagged rows keep ratio 1.
/// A donor where no row even has the flag column is rejected outright.
pub fn proportional_flagged(
    donor: &[FlowRecord],
    group: &GroupKeySpec,
) -> Result<RatioTable, ReconcileError> {
    ensure_no_ranges(donor, "proportional_flagged")?;

    if !donor.iter().any(|r| r.attrs.contains_key(ATTR_DISAGGREGATE_FLAG)) {
        log::error!("proportional_flagged: donor carries no '{ATTR_DISAGGREGATE_FLAG}' attr");
        return Err(ReconcileError::MissingFlag { field: ATTR_DISAGGREGATE_FLAG.into() });
    }

    let (flagged, unflagged): (Vec<FlowRecord>, Vec<FlowRecord>) = donor
        .iter()
        .cloned()
        .partition(|r| r.attrs.get(ATTR_DISAGGREGATE_FLAG).is_some_and(|v| flag_set(v)));

    let mut entries: Vec<RatioEntry> = Vec::new();
    if !flagged.is_empty() {
        entries.extend(proportional(&flagged, group)?.entries().iter().cloned());
    }
    for record in &unflagged {
        let Some(sector) = record.sector() else {
            continue;
        };
        entries.push(RatioEntry {
            location: record.location.clone(),
            sector: sector.clone(),
            ratio: Some(1.0),
            helper_amount: None,
        });
    }
    Ok(RatioTable::new(entries))
}

/// Ratios for helper flows, computed within each group against the group's
/// own coarsest depth on the chosen sector position. Groups with a zero
/// base sum default to ratio 1 so their rows pass through whole; donor
/// amounts ride along for diagnostics.
pub fn by_location_and_activity(
    donor: &[FlowRecord],
    field: SectorField,
    group: &GroupKeySpec,
) -> Result<RatioTable, ReconcileError> {
    ensure_no_ranges(donor, "by_location_and_activity")?;

    let mut base: BTreeMap<GroupKey, usize> = BTreeMap::new();
    for record in donor {
        if let Some(code) = field.of(record) {
            let depth = code.depth();
            base.entry(group.key_of(record))
                .and_modify(|b| *b = (*b).min(depth))
                .or_insert(depth);
        }
    }
    if base.is_empty() {
        return Err(ReconcileError::NoBaseSectors {
            context: "by_location_and_activity: donor has no sectored rows".into(),
        });
    }

    let mut denom: BTreeMap<GroupKey, f64> = BTreeMap::new();
    for record in donor {
        if let Some(code) = field.of(record) {
            let key = group.key_of(record);
            if base.get(&key).copied() == Some(code.depth()) {
                *denom.entry(key).or_insert(0.0) += record.amount;
            }
        }
    }

    let mut defaulted = 0usize;
    let entries: Vec<RatioEntry> = donor
        .iter()
        .filter_map(|record| {
            let sector = field.of(record)?.clone();
            let ratio = match denom.get(&group.key_of(record)) {
                Some(d) if *d != 0.0 => record.amount / d,
                _ => {
                    defaulted += 1;
                    1.0
                }
            };
            Some(RatioEntry {
                location: record.location.clone(),
                sector,
                ratio: Some(ratio),
                helper_amount: Some(record.amount),
            })
        })
        .collect();

    if defaulted > 0 {
        log::debug!("by_location_and_activity: {defaulted} rows defaulted to ratio 1");
    }
    Ok(RatioTable::new(entries))
}

/// Scale each record by its (location, sector) ratio. Records with no
/// matching entry, or whose entry has no usable ratio, pass through
/// unchanged and are counted; reference gaps are routine, not fatal.
pub fn apply_ratios(
    records: Vec<FlowRecord>,
    ratios: &RatioTable,
) -> Result<AllocationOutcome, ReconcileError> {
    ensure_no_ranges(&records, "apply_ratios")?;

    let mut allocated = 0usize;
    let mut passthrough = 0usize;
    let records: Vec<FlowRecord> = records
        .into_iter()
        .map(|mut record| {
            let ratio = record
                .sector()
                .and_then(|s| ratios.lookup(&record.location, s))
                .and_then(|entry| entry.ratio);
            match ratio {
                Some(r) => {
                    record.amount *= r;
                    allocated += 1;
                }
                None => passthrough += 1,
            }
            record
        })
        .collect();

    if passthrough > 0 {
        log::info!("apply_ratios: {passthrough} rows had no ratio and passed through unscaled");
    }
    Ok(AllocationOutcome { records, allocated, passthrough })
}
