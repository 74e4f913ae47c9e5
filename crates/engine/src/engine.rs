use std::collections::BTreeMap;

use sectorflow_core::{SectorCatalog, SectorCode};

use crate::aggregate::{consolidate, row_depth, sector_aggregation};
use crate::allocate::{apply_ratios, by_location_and_activity, proportional, proportional_flagged};
use crate::config::{AllocationMethod, ColumnMapping, ReconcileConfig};
use crate::disaggregate::sector_disaggregation;
use crate::equal_split::{equal_allocation, equally_allocate_parent_to_child};
use crate::error::ReconcileError;
use crate::model::{
    ensure_no_ranges, normalize_overrides, FlowRecord, GroupKey, GroupKeySpec, ReconcileResult,
    ReconcileSummary, RunMeta, SectorField,
};
use crate::suppression::estimate_suppressed;
use crate::validate::{
    check_conservation, check_negative_amounts, compare_group_totals, CONSERVATION_REL_TOL,
};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// In-memory inputs to a reconciliation run: the primary flow records and,
/// when the configured method needs one, the donor set.
#[derive(Debug)]
pub struct ReconcileInput {
    pub records: Vec<FlowRecord>,
    pub donor: Option<Vec<FlowRecord>>,
}

fn require_donor<'a>(
    donor: Option<&'a [FlowRecord]>,
    method: &AllocationMethod,
) -> Result<&'a [FlowRecord], ReconcileError> {
    donor.ok_or_else(|| {
        ReconcileError::ConfigValidation(format!(
            "{} allocation requires donor records",
            method.name()
        ))
    })
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Run the full reconciliation pipeline for one config.
///
/// Stages, in order: range gate, override normalization and consolidation,
/// equal-split repair of mapping duplication (method `equal_split`),
/// suppression estimation (if configured), bottom-up aggregation,
/// fan-out-1 disaggregation, ratio allocation (proportional methods),
/// equal splitting of lost parents down to the target length, and the
/// target-length subset. Validation checks run where their invariants are
/// supposed to hold and feed counts into the summary; none of them stop
/// the run.
pub fn run(
    config: &ReconcileConfig,
    input: ReconcileInput,
    catalog: &SectorCatalog,
) -> Result<ReconcileResult, ReconcileError> {
    config.validate()?;
    if catalog.year() != config.year {
        return Err(ReconcileError::ConfigValidation(format!(
            "catalog year {} does not match config year {}",
            catalog.year(),
            config.year
        )));
    }
    let group = GroupKeySpec::new(config.group_by.clone())?;
    let ReconcileInput { records: input_records, donor } = input;

    let mut summary = ReconcileSummary { input_records: input_records.len(), ..Default::default() };

    ensure_no_ranges(&input_records, "reconcile")?;
    if let Some(donor) = &donor {
        ensure_no_ranges(donor, "reconcile donor")?;
    }

    let (sectored, unsectored): (Vec<FlowRecord>, Vec<FlowRecord>) =
        input_records.into_iter().partition(|r| r.sector().is_some());
    if !unsectored.is_empty() {
        log::warn!("{} records without a sector dropped before reconciliation", unsectored.len());
    }

    let before = sectored.len();
    let mut records = consolidate(normalize_overrides(sectored), &group);
    summary.consolidated = before - records.len();

    // Mapping-duplication repair runs on native rows, before any level is
    // synthesized, so the group row count still means "copies per activity".
    if matches!(config.allocation, AllocationMethod::EqualSplit) {
        records = equal_allocation(records, &group)?;
    }

    if config.estimate_suppressed {
        let outcome = estimate_suppressed(records, &group)?;
        records = outcome.records;
        summary.estimated_suppressed = outcome.estimated;
        summary.negative_residuals = outcome.negative_residuals;
    }

    let before = records.len();
    records = sector_aggregation(records, &group)?;
    summary.aggregated = records.len() - before;

    let before = records.len();
    records = sector_disaggregation(records, &group, catalog)?;
    summary.disaggregated = records.len() - before;

    summary.conservation_violations =
        check_conservation(&records, &group, catalog, CONSERVATION_REL_TOL).len();

    let records = match &config.allocation {
        AllocationMethod::Direct | AllocationMethod::EqualSplit => records,
        AllocationMethod::Proportional { per_activity, .. } => {
            let donor = require_donor(donor.as_deref(), &config.allocation)?;
            let ratios = if *per_activity {
                by_location_and_activity(donor, SectorField::ProducedBy, &group)?
            } else {
                proportional(donor, &group)?
            };
            let outcome = apply_ratios(records, &ratios)?;
            summary.allocated = outcome.allocated;
            summary.passthrough = outcome.passthrough;
            outcome.records
        }
        AllocationMethod::ProportionalFlagged { .. } => {
            let donor = require_donor(donor.as_deref(), &config.allocation)?;
            let ratios = proportional_flagged(donor, &group)?;
            let outcome = apply_ratios(records, &ratios)?;
            summary.allocated = outcome.allocated;
            summary.passthrough = outcome.passthrough;
            outcome.records
        }
    };

    // Each group's coarsest level carries its authoritative total from here
    // on; the final output must still match it.
    let expected = coarsest_view(&records, &group);

    let outcome =
        equally_allocate_parent_to_child(records, config.target_sector_length, &group, catalog)?;
    summary.split_rows = outcome.split;
    summary.orphans_retained = outcome.orphans;

    let records = subset_to_length(outcome.records, config.target_sector_length, catalog);
    let records = consolidate(records, &group);

    summary.totals_drift =
        compare_group_totals(&expected, &records, &group, CONSERVATION_REL_TOL).len();
    summary.negative_amounts =
        check_negative_amounts(&records, &group, "reconcile output").len();
    summary.output_records = records.len();

    Ok(ReconcileResult {
        meta: RunMeta {
            config_name: config.name.clone(),
            year: config.year,
            target_sector_length: config.target_sector_length,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            run_at: chrono::Utc::now().to_rfc3339(),
        },
        summary,
        records,
    })
}

/// Reduce a reconciled set to the rows a target-length export keeps: rows
/// whose populated sectors sit at the target length, override-token rows,
/// coarse orphans with no catalog path to the target, and pairs the depth
/// rules cannot classify. Interior rows are absorbed by the finer levels
/// built from them.
pub fn subset_to_length(
    records: Vec<FlowRecord>,
    target_depth: usize,
    catalog: &SectorCatalog,
) -> Vec<FlowRecord> {
    let mut dropped = 0usize;
    let kept: Vec<FlowRecord> = records
        .into_iter()
        .filter(|record| {
            let keep = keeps_at(record, target_depth, catalog);
            if !keep {
                dropped += 1;
            }
            keep
        })
        .collect();
    if dropped > 0 {
        log::debug!("subset to length {target_depth}: {dropped} interior rows absorbed");
    }
    kept
}

fn keeps_at(record: &FlowRecord, target_depth: usize, catalog: &SectorCatalog) -> bool {
    let at_target = SectorField::BOTH
        .iter()
        .filter_map(|f| f.of(record))
        .all(|code| !code.is_numeric() || code.depth() == target_depth);
    if at_target {
        return true;
    }
    match record.sole_sector() {
        // Coarse orphans were already warn-logged by the split stage.
        Some((_, code)) if code.is_numeric() && code.depth() < target_depth => {
            catalog.descendants_at(code, target_depth).is_empty()
        }
        Some(_) => false,
        None => match row_depth(record) {
            // Coarse sector pairs have no split path and ride through;
            // deep pairs were aggregated up to the target already.
            Some(depth) => depth < target_depth,
            None => true,
        },
    }
}

// Per group, the rows at the coarsest numeric depth present, plus every row
// outside the numeric depth rules. After aggregation this is the group's
// authoritative total.
fn coarsest_view(records: &[FlowRecord], group: &GroupKeySpec) -> Vec<FlowRecord> {
    let mut coarsest: BTreeMap<GroupKey, usize> = BTreeMap::new();
    for record in records {
        if let Some(depth) = row_depth(record) {
            coarsest
                .entry(group.key_of(record))
                .and_modify(|c| *c = (*c).min(depth))
                .or_insert(depth);
        }
    }
    records
        .iter()
        .filter(|record| match row_depth(record) {
            Some(depth) => coarsest.get(&group.key_of(record)) == Some(&depth),
            None => true,
        })
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// CSV ingestion
// ---------------------------------------------------------------------------

/// Load flow records from CSV text using a config column mapping.
///
/// Headers are matched by exact name; a missing mapped column is an error.
/// Amount and year cells must parse, with the failing row number carried in
/// the error. Rows with an empty sector in every mapped sector column are
/// skipped and counted; attr cells come along only when non-empty.
pub fn load_flow_rows(
    data: &str,
    mapping: &ColumnMapping,
    file_label: &str,
) -> Result<Vec<FlowRecord>, ReconcileError> {
    let mut reader =
        csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(data.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| ReconcileError::Io(format!("{file_label}: {e}")))?
        .clone();

    let idx = |name: &str| -> Result<usize, ReconcileError> {
        headers.iter().position(|h| h == name).ok_or_else(|| ReconcileError::MissingColumn {
            file: file_label.to_string(),
            column: name.to_string(),
        })
    };

    let location = idx(&mapping.location)?;
    let flow_name = idx(&mapping.flow_name)?;
    let unit = idx(&mapping.unit)?;
    let year = idx(&mapping.year)?;
    let amount = idx(&mapping.amount)?;
    let produced = mapping.sector_produced_by.as_deref().map(|c| idx(c)).transpose()?;
    let consumed = mapping.sector_consumed_by.as_deref().map(|c| idx(c)).transpose()?;

    let attr_cols: BTreeMap<&String, usize> = mapping
        .attrs
        .iter()
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .map(|(attr, column)| Ok((attr, idx(column)?)))
        .collect::<Result<_, ReconcileError>>()?;

    let mut records = Vec::new();
    let mut unsectored = 0usize;
    for (i, row) in reader.records().enumerate() {
        let row = row.map_err(|e| ReconcileError::Io(format!("{file_label}: {e}")))?;
        let row_no = i + 2; // header is line 1

        let cell = |col: usize| row.get(col).unwrap_or("").to_string();

        let raw_amount = cell(amount);
        let amount_value: f64 = raw_amount.parse().map_err(|_| ReconcileError::AmountParse {
            file: file_label.to_string(),
            row: row_no,
            value: raw_amount.clone(),
        })?;
        let raw_year = cell(year);
        let year_value: u16 = raw_year.parse().map_err(|_| ReconcileError::YearParse {
            file: file_label.to_string(),
            row: row_no,
            value: raw_year.clone(),
        })?;

        let sector_at = |col: Option<usize>| -> Option<SectorCode> {
            col.and_then(|c| row.get(c))
                .filter(|s| !s.is_empty())
                .map(SectorCode::new)
        };
        let sector_produced_by = sector_at(produced);
        let sector_consumed_by = sector_at(consumed);
        if sector_produced_by.is_none() && sector_consumed_by.is_none() {
            unsectored += 1;
            continue;
        }

        let mut attrs = BTreeMap::new();
        for (attr, &col) in &attr_cols {
            let value = row.get(col).unwrap_or("");
            if !value.is_empty() {
                attrs.insert((*attr).clone(), value.to_string());
            }
        }

        records.push(FlowRecord {
            location: cell(location),
            flow_name: cell(flow_name),
            unit: cell(unit),
            year: year_value,
            sector_produced_by,
            sector_consumed_by,
            amount: amount_value,
            attrs,
        });
    }
    if unsectored > 0 {
        log::warn!("{file_label}: {unsectored} rows without a sector skipped");
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CatalogConfig, OutputConfig, SourceConfig};
    use crate::model::{ATTR_SECTOR_COUNT, ATTR_SUPPRESSED};
    use std::collections::HashMap;

    fn catalog(codes: &[&str]) -> SectorCatalog {
        SectorCatalog::from_codes(2017, codes.iter().map(|c| SectorCode::new(*c)))
    }

    fn mapping() -> ColumnMapping {
        ColumnMapping {
            location: "Location".into(),
            flow_name: "FlowName".into(),
            unit: "Unit".into(),
            year: "Year".into(),
            sector_produced_by: Some("Sector".into()),
            sector_consumed_by: None,
            amount: "FlowAmount".into(),
            attrs: HashMap::new(),
        }
    }

    fn config(target: usize, allocation: AllocationMethod) -> ReconcileConfig {
        ReconcileConfig {
            name: "test run".into(),
            year: 2017,
            target_sector_length: target,
            group_by: GroupKeySpec::DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
            estimate_suppressed: false,
            catalog: CatalogConfig { codes: "naics_2017.csv".into() },
            input: SourceConfig { file: "input.csv".into(), columns: mapping() },
            allocation,
            output: OutputConfig::default(),
        }
    }

    fn row(location: &str, sector: &str, amount: f64) -> FlowRecord {
        FlowRecord {
            location: location.into(),
            flow_name: "water".into(),
            unit: "Mgal".into(),
            year: 2017,
            sector_produced_by: Some(SectorCode::new(sector)),
            sector_consumed_by: None,
            amount,
            attrs: BTreeMap::new(),
        }
    }

    fn amounts(records: &[FlowRecord]) -> Vec<(&str, f64)> {
        records
            .iter()
            .map(|r| (r.sector_produced_by.as_ref().map(SectorCode::as_str).unwrap_or(""), r.amount))
            .collect()
    }

    #[test]
    fn coarse_parent_lands_as_equal_shares() {
        let cat = catalog(&["31", "311", "3111", "3112", "3113"]);
        let input = ReconcileInput { records: vec![row("06000", "311", 300.0)], donor: None };
        let result = run(&config(4, AllocationMethod::Direct), input, &cat).unwrap();
        assert_eq!(
            amounts(&result.records),
            vec![("3111", 100.0), ("3112", 100.0), ("3113", 100.0)]
        );
        assert_eq!(result.summary.split_rows, 3);
        assert_eq!(result.summary.aggregated, 1, "only the length-2 roll-up is synthesized");
        assert_eq!(result.summary.totals_drift, 0);
        assert_eq!(result.summary.output_records, 3);
    }

    #[test]
    fn childless_code_rides_through_untouched() {
        let cat = catalog(&["21", "22"]);
        let input = ReconcileInput { records: vec![row("06000", "21", 75.0)], donor: None };
        let result = run(&config(4, AllocationMethod::Direct), input, &cat).unwrap();
        assert_eq!(amounts(&result.records), vec![("21", 75.0)]);
        assert_eq!(result.summary.orphans_retained, 1);
        assert_eq!(result.summary.split_rows, 0);
        assert_eq!(result.summary.totals_drift, 0);
    }

    #[test]
    fn range_token_fails_the_run() {
        let cat = catalog(&["31"]);
        let input = ReconcileInput { records: vec![row("06000", "31-33", 10.0)], donor: None };
        let err = run(&config(4, AllocationMethod::Direct), input, &cat).unwrap_err();
        assert!(matches!(err, ReconcileError::RangeCode { .. }));
    }

    #[test]
    fn suppressed_cell_estimated_then_reconciled() {
        let cat = catalog(&["31", "311", "3112", "31122", "311221", "311224"]);
        let mut withheld = row("06000", "311224", 0.0);
        withheld.attrs.insert(ATTR_SUPPRESSED.into(), "1".into());
        let input = ReconcileInput {
            records: vec![row("06000", "3112", 50.0), row("06000", "311221", 20.0), withheld],
            donor: None,
        };
        let mut cfg = config(6, AllocationMethod::Direct);
        cfg.estimate_suppressed = true;

        let result = run(&cfg, input, &cat).unwrap();
        assert_eq!(result.summary.estimated_suppressed, 1);
        assert_eq!(result.summary.conservation_violations, 0);
        assert_eq!(result.summary.totals_drift, 0);
        assert_eq!(amounts(&result.records), vec![("311221", 20.0), ("311224", 30.0)]);
        let estimate = &result.records[1];
        assert!(!estimate.attrs.contains_key(ATTR_SUPPRESSED));
        assert_eq!(estimate.attrs.get(ATTR_SECTOR_COUNT).map(String::as_str), Some("1"));
    }

    #[test]
    fn equal_split_repairs_duplicated_mapping() {
        let cat = catalog(&["31", "311", "312"]);
        let input = ReconcileInput {
            records: vec![row("06000", "311", 90.0), row("06000", "312", 90.0)],
            donor: None,
        };
        let result = run(&config(3, AllocationMethod::EqualSplit), input, &cat).unwrap();
        assert_eq!(amounts(&result.records), vec![("311", 45.0), ("312", 45.0)]);
        assert_eq!(result.summary.totals_drift, 0);
    }

    #[test]
    fn proportional_scales_by_donor_shares() {
        let cat = catalog(&["31", "311", "3111", "3112"]);
        let input = ReconcileInput {
            records: vec![row("06000", "3111", 50.0), row("06000", "3112", 50.0)],
            donor: Some(vec![row("06000", "3111", 20.0), row("06000", "3112", 80.0)]),
        };
        let method = AllocationMethod::Proportional {
            donor: SourceConfig { file: "donor.csv".into(), columns: mapping() },
            per_activity: false,
        };
        let result = run(&config(4, method), input, &cat).unwrap();
        assert_eq!(result.summary.allocated, 2);
        assert_eq!(amounts(&result.records), vec![("3111", 10.0), ("3112", 40.0)]);
        // Donor reweighting moved the group total from 100 to 50; the drift
        // check reports that rather than hiding it.
        assert_eq!(result.summary.totals_drift, 1);
    }

    #[test]
    fn proportional_without_donor_is_rejected() {
        let cat = catalog(&["31"]);
        let method = AllocationMethod::Proportional {
            donor: SourceConfig { file: "donor.csv".into(), columns: mapping() },
            per_activity: false,
        };
        let input = ReconcileInput { records: vec![row("06000", "31", 1.0)], donor: None };
        let err = run(&config(4, method), input, &cat).unwrap_err();
        assert!(err.to_string().contains("donor"));
    }

    #[test]
    fn catalog_year_must_match() {
        let cat = SectorCatalog::from_codes(2012, [SectorCode::new("31")]);
        let input = ReconcileInput { records: vec![row("06000", "31", 1.0)], donor: None };
        let err = run(&config(4, AllocationMethod::Direct), input, &cat).unwrap_err();
        assert!(err.to_string().contains("2012"));
    }

    #[test]
    fn override_rows_survive_to_output() {
        let cat = catalog(&["31", "311", "3111"]);
        let input = ReconcileInput {
            records: vec![row("06000", "F0", 5.0), row("06000", "311", 10.0)],
            donor: None,
        };
        let result = run(&config(4, AllocationMethod::Direct), input, &cat).unwrap();
        assert_eq!(amounts(&result.records), vec![("3111", 10.0), ("F010", 5.0)]);
        assert_eq!(result.summary.totals_drift, 0);
    }

    #[test]
    fn unsectored_rows_dropped_with_note() {
        let cat = catalog(&["31", "311", "3111"]);
        let mut naked = row("06000", "311", 7.0);
        naked.sector_produced_by = None;
        let input = ReconcileInput { records: vec![naked, row("06000", "311", 10.0)], donor: None };
        let result = run(&config(3, AllocationMethod::Direct), input, &cat).unwrap();
        assert_eq!(result.summary.input_records, 2);
        assert_eq!(amounts(&result.records), vec![("311", 10.0)]);
    }

    #[test]
    fn load_rows_maps_columns_and_attrs() {
        let mut map = mapping();
        map.attrs.insert(ATTR_SUPPRESSED.into(), "Suppressed".into());
        let data = "\
Location,FlowName,Unit,Year,Sector,FlowAmount,Suppressed
06000,water,Mgal,2017,3112,50.0,
06000,water,Mgal,2017,311224,0,1
06000,water,Mgal,2017,,3.5,
";
        let rows = load_flow_rows(data, &map, "water.csv").unwrap();
        assert_eq!(rows.len(), 2, "the unsectored row is skipped");
        assert_eq!(rows[0].sector_produced_by, Some(SectorCode::new("3112")));
        assert_eq!(rows[0].amount, 50.0);
        assert!(rows[0].attrs.is_empty(), "empty attr cells are not carried");
        assert!(rows[1].is_suppressed());
        assert_eq!(rows[1].year, 2017);
    }

    #[test]
    fn load_rows_reports_missing_column() {
        let data = "Location,FlowName,Unit,Year,FlowAmount\n06000,water,Mgal,2017,1.0\n";
        let err = load_flow_rows(data, &mapping(), "water.csv").unwrap_err();
        match err {
            ReconcileError::MissingColumn { file, column } => {
                assert_eq!(file, "water.csv");
                assert_eq!(column, "Sector");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn load_rows_reports_bad_amount_with_row() {
        let data = "\
Location,FlowName,Unit,Year,Sector,FlowAmount
06000,water,Mgal,2017,311,1.0
06000,water,Mgal,2017,312,n/a
";
        let err = load_flow_rows(data, &mapping(), "water.csv").unwrap_err();
        match err {
            ReconcileError::AmountParse { row, value, .. } => {
                assert_eq!(row, 3);
                assert_eq!(value, "n/a");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn subset_keeps_targets_orphans_and_overrides() {
        let cat = catalog(&["21", "31", "311", "3111"]);
        let records = vec![
            row("06000", "3111", 10.0),
            row("06000", "311", 10.0),
            row("06000", "21", 4.0),
            row("06000", "F010", 2.0),
        ];
        let kept = subset_to_length(records, 4, &cat);
        assert_eq!(
            amounts(&kept),
            vec![("3111", 10.0), ("21", 4.0), ("F010", 2.0)],
            "the interior 311 row is absorbed"
        );
    }
}
