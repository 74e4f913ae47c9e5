// Property-based tests for the reconciliation pipeline.
// CI: 256 cases (default). Soak: PROPTEST_CASES=10000 cargo test --release

use std::collections::BTreeMap;

use proptest::prelude::*;
use sectorflow_core::{SectorCatalog, SectorCode};
use sectorflow_engine::aggregate::sector_aggregation;
use sectorflow_engine::allocate::proportional;
use sectorflow_engine::config::{CatalogConfig, ColumnMapping, OutputConfig, SourceConfig};
use sectorflow_engine::disaggregate::sector_disaggregation;
use sectorflow_engine::equal_split::{equal_allocation, equally_allocate_parent_to_child};
use sectorflow_engine::model::{FlowRecord, GroupKeySpec, ATTR_SUPPRESSED};
use sectorflow_engine::suppression::estimate_suppressed;
use sectorflow_engine::{run, AllocationMethod, ReconcileConfig, ReconcileError, ReconcileInput};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn config_256() -> ProptestConfig {
    ProptestConfig {
        cases: std::env::var("PROPTEST_CASES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256),
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

fn config_128() -> ProptestConfig {
    ProptestConfig {
        cases: std::env::var("PROPTEST_CASES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(128),
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn test_catalog() -> SectorCatalog {
    SectorCatalog::from_codes(
        2017,
        ["21", "22", "31", "311", "312", "3111", "3112", "3113", "3121"].map(SectorCode::new),
    )
}

fn record(location: &str, sector: &str, amount: f64) -> FlowRecord {
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

fn mapping() -> ColumnMapping {
    ColumnMapping {
        location: "Location".into(),
        flow_name: "FlowName".into(),
        unit: "Unit".into(),
        year: "Year".into(),
        sector_produced_by: Some("Sector".into()),
        sector_consumed_by: None,
        amount: "FlowAmount".into(),
        attrs: std::collections::HashMap::new(),
    }
}

fn direct_config(target: usize) -> ReconcileConfig {
    ReconcileConfig {
        name: "property run".into(),
        year: 2017,
        target_sector_length: target,
        group_by: GroupKeySpec::DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
        estimate_suppressed: false,
        catalog: CatalogConfig { codes: "naics_2017.csv".into() },
        input: SourceConfig { file: "input.csv".into(), columns: mapping() },
        allocation: AllocationMethod::Direct,
        output: OutputConfig::default(),
    }
}

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

fn arb_amount() -> impl Strategy<Value = f64> {
    0.01..1_000_000.0f64
}

/// Rows for one group, all at a single depth picked per case, so families
/// can only be consistent.
fn group_rows(location: &'static str) -> impl Strategy<Value = Vec<FlowRecord>> {
    (0usize..3).prop_flat_map(move |depth_idx| {
        let pool: Vec<&'static str> = match depth_idx {
            0 => vec!["21", "31"],
            1 => vec!["311", "312"],
            _ => vec!["3111", "3112", "3113", "3121"],
        };
        let n = pool.len();
        proptest::sample::subsequence(pool, 1..=n)
            .prop_flat_map(move |codes| {
                let len = codes.len();
                (Just(codes), proptest::collection::vec(arb_amount(), len))
            })
            .prop_map(move |(codes, amounts)| {
                codes
                    .iter()
                    .zip(&amounts)
                    .map(|(code, amount)| record(location, code, *amount))
                    .collect::<Vec<FlowRecord>>()
            })
    })
}

// ===========================================================================
// Stage properties (256 cases)
// ===========================================================================

// Conservation: every synthesized ancestor level carries the family sum.
proptest! {
    #![proptest_config(config_256())]
    #[test]
    fn aggregation_conserves_family_sums(
        picks in proptest::sample::subsequence(vec!["3111", "3112", "3113", "3121"], 1..=4),
        amounts in proptest::collection::vec(arb_amount(), 4),
    ) {
        let records: Vec<FlowRecord> = picks
            .iter()
            .zip(&amounts)
            .map(|(code, amount)| record("06000", code, *amount))
            .collect();
        let total: f64 = records.iter().map(|r| r.amount).sum();

        let out = sector_aggregation(records, &GroupKeySpec::default()).unwrap();

        for depth in [3usize, 2] {
            let level: f64 = out
                .iter()
                .filter(|r| r.sector().map(|c| c.depth()) == Some(depth))
                .map(|r| r.amount)
                .sum();
            prop_assert!(
                (level - total).abs() <= 1e-6 * total.max(1.0),
                "length-{} total {} vs child total {}", depth, level, total
            );
        }
    }
}

// Equal split is exact: shares are equal and sum back to the parent.
proptest! {
    #![proptest_config(config_256())]
    #[test]
    fn split_shares_sum_to_parent(
        parent_idx in 0usize..3,
        amount in arb_amount(),
    ) {
        let parent = ["31", "311", "312"][parent_idx];
        let cat = test_catalog();

        let outcome = equally_allocate_parent_to_child(
            vec![record("06000", parent, amount)],
            4,
            &GroupKeySpec::default(),
            &cat,
        )
        .unwrap();

        let fan_out = cat.descendants_at(&SectorCode::new(parent), 4).len();
        prop_assert_eq!(outcome.split, fan_out);

        let total: f64 = outcome.records.iter().map(|r| r.amount).sum();
        prop_assert!(
            (total - amount).abs() <= 1e-9 * amount.max(1.0),
            "split total {} vs parent {}", total, amount
        );
        let first = outcome.records[0].amount;
        for r in &outcome.records {
            prop_assert!((r.amount - first).abs() <= 1e-9, "unequal shares {} vs {}", r.amount, first);
        }
    }
}

// Donor ratios over a positive base close to one per group.
proptest! {
    #![proptest_config(config_256())]
    #[test]
    fn proportional_ratios_close_over_base(
        picks in proptest::sample::subsequence(vec!["3111", "3112", "3113", "3121"], 1..=4),
        amounts in proptest::collection::vec(1.0..1_000_000.0f64, 4),
    ) {
        let donor: Vec<FlowRecord> = picks
            .iter()
            .zip(&amounts)
            .map(|(code, amount)| record("06000", code, *amount))
            .collect();

        let table = proportional(&donor, &GroupKeySpec::default()).unwrap();
        let sum: f64 = table.entries().iter().filter_map(|e| e.ratio).sum();
        prop_assert!((sum - 1.0).abs() <= 0.01, "ratios sum to {}", sum);
    }
}

// Equal allocation undoes mapping duplication: the group total lands back
// on the single activity amount.
proptest! {
    #![proptest_config(config_256())]
    #[test]
    fn equal_allocation_restores_activity_totals(
        picks in proptest::sample::subsequence(vec!["3111", "3112", "3113", "3121"], 1..=4),
        activity_total in arb_amount(),
    ) {
        let records: Vec<FlowRecord> = picks
            .iter()
            .map(|code| record("06000", code, activity_total))
            .collect();
        let n = records.len();

        let out = equal_allocation(records, &GroupKeySpec::default()).unwrap();

        let total: f64 = out.iter().map(|r| r.amount).sum();
        prop_assert!(
            (total - activity_total).abs() <= 1e-9 * activity_total.max(1.0),
            "group total {} vs activity {}", total, activity_total
        );
        let share = activity_total / n as f64;
        for r in &out {
            prop_assert!((r.amount - share).abs() <= 1e-9);
        }
    }
}

// Suppression estimates close their family against the parent, whatever
// the residual's sign.
proptest! {
    #![proptest_config(config_256())]
    #[test]
    fn suppression_estimates_close_the_family(
        parent_amount in arb_amount(),
        known in proptest::collection::vec(0.0..100_000.0f64, 0..4),
        suppressed_n in 1usize..4,
    ) {
        let children = ["31121", "31122", "31123", "31124", "31125", "31126"];
        let mut records = vec![record("06000", "3112", parent_amount)];
        for (i, amount) in known.iter().enumerate() {
            records.push(record("06000", children[i], *amount));
        }
        for i in 0..suppressed_n {
            let mut r = record("06000", children[known.len() + i], 0.0);
            r.attrs.insert(ATTR_SUPPRESSED.to_string(), "1".to_string());
            records.push(r);
        }

        let outcome = estimate_suppressed(records, &GroupKeySpec::default()).unwrap();
        prop_assert_eq!(outcome.estimated, suppressed_n);

        let child_sum: f64 = outcome
            .records
            .iter()
            .filter(|r| r.sector().map(|c| c.depth()) == Some(5))
            .map(|r| r.amount)
            .sum();
        prop_assert!(
            (child_sum - parent_amount).abs() <= 1e-9 * parent_amount.abs().max(1.0),
            "children sum {} vs parent {}", child_sum, parent_amount
        );
    }
}

// A range token at any position fails the run, whatever else is present.
proptest! {
    #![proptest_config(config_256())]
    #[test]
    fn range_token_always_rejected(
        rows in proptest::collection::vec(
            (proptest::sample::select(vec!["21", "31", "311", "3111"]), arb_amount()),
            0..6,
        ),
        range_code in proptest::sample::select(vec!["31-33", "44-45", "48-49"]),
        insert_at in 0usize..7,
    ) {
        let mut records: Vec<FlowRecord> =
            rows.iter().map(|(code, amount)| record("06000", code, *amount)).collect();
        let at = insert_at.min(records.len());
        records.insert(at, record("06000", range_code, 1.0));

        let cat = test_catalog();
        let err = run(&direct_config(4), ReconcileInput { records, donor: None }, &cat)
            .unwrap_err();
        prop_assert!(
            matches!(err, ReconcileError::RangeCode { .. }),
            "expected RangeCode error, got {:?}", err
        );
    }
}

// ===========================================================================
// Whole-pipeline properties (128 cases)
// ===========================================================================

// Disaggregation is idempotent: a second application adds nothing.
proptest! {
    #![proptest_config(config_128())]
    #[test]
    fn disaggregation_is_idempotent(
        rows in proptest::collection::vec(
            (
                proptest::sample::select(vec![
                    "21", "31", "311", "312", "3111", "3112", "3113", "3121", "F010",
                ]),
                proptest::sample::select(vec!["06000", "48000"]),
                arb_amount(),
            ),
            0..10,
        ),
    ) {
        let records: Vec<FlowRecord> =
            rows.iter().map(|(code, location, amount)| record(location, code, *amount)).collect();
        let cat = test_catalog();
        let group = GroupKeySpec::default();

        let once = sector_disaggregation(records, &group, &cat).unwrap();
        let twice = sector_disaggregation(once.clone(), &group, &cat).unwrap();

        prop_assert_eq!(once.len(), twice.len());
        let mut a: Vec<String> = once.iter().map(|r| serde_json::to_string(r).unwrap()).collect();
        let mut b: Vec<String> = twice.iter().map(|r| serde_json::to_string(r).unwrap()).collect();
        a.sort();
        b.sort();
        prop_assert_eq!(a, b);
    }
}

// The same input always produces the same output, row for row.
proptest! {
    #![proptest_config(config_128())]
    #[test]
    fn direct_run_is_deterministic(
        rows in proptest::collection::vec(
            (
                proptest::sample::select(vec![
                    "21", "31", "311", "312", "3111", "3112", "3113", "3121", "F0", "F010",
                ]),
                proptest::sample::select(vec!["06000", "48000"]),
                arb_amount(),
            ),
            1..10,
        ),
    ) {
        let records: Vec<FlowRecord> =
            rows.iter().map(|(code, location, amount)| record(location, code, *amount)).collect();
        let cat = test_catalog();
        let config = direct_config(4);

        let r1 = run(&config, ReconcileInput { records: records.clone(), donor: None }, &cat)
            .unwrap();
        let r2 = run(&config, ReconcileInput { records, donor: None }, &cat).unwrap();

        prop_assert_eq!(&r1.summary, &r2.summary);
        prop_assert_eq!(
            serde_json::to_string(&r1.records).unwrap(),
            serde_json::to_string(&r2.records).unwrap()
        );
    }
}

// Direct runs on single-depth groups never lose or invent amounts.
proptest! {
    #![proptest_config(config_128())]
    #[test]
    fn direct_run_conserves_group_totals(
        first in group_rows("06000"),
        second in proptest::option::of(group_rows("48000")),
    ) {
        let mut records = first;
        records.extend(second.unwrap_or_default());

        let mut input_totals: BTreeMap<String, f64> = BTreeMap::new();
        for r in &records {
            *input_totals.entry(r.location.clone()).or_insert(0.0) += r.amount;
        }

        let cat = test_catalog();
        let result = run(&direct_config(4), ReconcileInput { records, donor: None }, &cat)
            .unwrap();
        prop_assert_eq!(result.summary.totals_drift, 0);
        prop_assert_eq!(result.summary.conservation_violations, 0);

        let mut output_totals: BTreeMap<String, f64> = BTreeMap::new();
        for r in &result.records {
            *output_totals.entry(r.location.clone()).or_insert(0.0) += r.amount;
        }
        prop_assert_eq!(input_totals.len(), output_totals.len());
        for (location, expected) in &input_totals {
            let got = output_totals.get(location).copied().unwrap_or(0.0);
            prop_assert!(
                (got - expected).abs() <= 1e-6 * expected.abs().max(1.0),
                "location {} total {} became {}", location, expected, got
            );
        }
    }
}
