use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use sectorflow_core::SectorCode;

use crate::error::ReconcileError;

/// Attr key marking a row whose amount was withheld at the source.
pub const ATTR_SUPPRESSED: &str = "suppressed";
/// Attr key recording how many suppressed siblings shared an estimate.
pub const ATTR_SECTOR_COUNT: &str = "sector_count";
/// Attr key marking rows eligible for flagged proportional allocation.
pub const ATTR_DISAGGREGATE_FLAG: &str = "disaggregate_flag";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A single normalized flow observation.
///
/// At least one of the two sector fields is populated. Extra source columns
/// ride along in `attrs` as strings so the engine stays schema-agnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub location: String,
    pub flow_name: String,
    pub unit: String,
    pub year: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_produced_by: Option<SectorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_consumed_by: Option<SectorCode>,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

impl FlowRecord {
    /// The governing sector of this row: produced-by when present,
    /// consumed-by otherwise.
    pub fn sector(&self) -> Option<&SectorCode> {
        self.sector_produced_by.as_ref().or(self.sector_consumed_by.as_ref())
    }

    /// The single populated sector position. None for rows with both or
    /// neither position filled.
    pub fn sole_sector(&self) -> Option<(SectorField, &SectorCode)> {
        match (&self.sector_produced_by, &self.sector_consumed_by) {
            (Some(code), None) => Some((SectorField::ProducedBy, code)),
            (None, Some(code)) => Some((SectorField::ConsumedBy, code)),
            _ => None,
        }
    }

    /// Named field as a string: the four fixed columns or an attr.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "location" => Some(self.location.clone()),
            "flow_name" => Some(self.flow_name.clone()),
            "unit" => Some(self.unit.clone()),
            "year" => Some(self.year.to_string()),
            _ => self.attrs.get(name).cloned(),
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.attrs.get(ATTR_SUPPRESSED).is_some_and(|v| flag_set(v))
    }
}

/// True for the usual truthy spellings found in source flag columns.
pub fn flag_set(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "t" | "true" | "y" | "yes"
    )
}

/// One of the two sector positions on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectorField {
    ProducedBy,
    ConsumedBy,
}

impl SectorField {
    pub const BOTH: [SectorField; 2] = [SectorField::ProducedBy, SectorField::ConsumedBy];

    pub fn of<'r>(&self, record: &'r FlowRecord) -> Option<&'r SectorCode> {
        match self {
            Self::ProducedBy => record.sector_produced_by.as_ref(),
            Self::ConsumedBy => record.sector_consumed_by.as_ref(),
        }
    }

    pub fn set(&self, record: &mut FlowRecord, code: Option<SectorCode>) {
        match self {
            Self::ProducedBy => record.sector_produced_by = code,
            Self::ConsumedBy => record.sector_consumed_by = code,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ProducedBy => "sector_produced_by",
            Self::ConsumedBy => "sector_consumed_by",
        }
    }
}

impl fmt::Display for SectorField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Reject any record carrying a sector-range token like `31-33`. Ranges are
/// expanded or dropped upstream; one reaching an engine operation is a bug
/// in the caller's staging.
pub fn ensure_no_ranges(records: &[FlowRecord], context: &'static str) -> Result<(), ReconcileError> {
    for record in records {
        for field in SectorField::BOTH {
            if let Some(code) = field.of(record) {
                if code.is_range() {
                    return Err(ReconcileError::RangeCode {
                        code: code.as_str().to_string(),
                        context,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Fold raw household spellings to the canonical token on both sector fields.
pub fn normalize_overrides(records: Vec<FlowRecord>) -> Vec<FlowRecord> {
    records
        .into_iter()
        .map(|mut record| {
            for field in SectorField::BOTH {
                let normalized = field.of(&record).map(SectorCode::normalized);
                if let Some(code) = normalized {
                    field.set(&mut record, Some(code));
                }
            }
            record
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

/// The non-sector fields a reconciliation groups by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupKeySpec {
    fields: Vec<String>,
}

impl GroupKeySpec {
    pub const DEFAULT_FIELDS: [&'static str; 4] = ["location", "flow_name", "unit", "year"];

    /// Validated construction: fields must be non-empty, unique, and must
    /// not name either sector column.
    pub fn new(fields: Vec<String>) -> Result<Self, ReconcileError> {
        if fields.is_empty() {
            return Err(ReconcileError::ConfigValidation("group_by must not be empty".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for field in &fields {
            if field == "sector_produced_by" || field == "sector_consumed_by" {
                return Err(ReconcileError::ConfigValidation(format!(
                    "group_by must not include sector field '{field}'"
                )));
            }
            if !seen.insert(field.as_str()) {
                return Err(ReconcileError::ConfigValidation(format!(
                    "duplicate group_by field '{field}'"
                )));
            }
        }
        Ok(GroupKeySpec { fields })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn key_of(&self, record: &FlowRecord) -> GroupKey {
        GroupKey(
            self.fields
                .iter()
                .map(|f| record.field(f).unwrap_or_default())
                .collect(),
        )
    }
}

impl Default for GroupKeySpec {
    fn default() -> Self {
        GroupKeySpec {
            fields: Self::DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Rendered group-key values, in declared field order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct GroupKey(Vec<String>);

impl GroupKey {
    pub fn values(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

// ---------------------------------------------------------------------------
// Ratio tables
// ---------------------------------------------------------------------------

/// One allocation ratio, keyed by location and sector.
#[derive(Debug, Clone, Serialize)]
pub struct RatioEntry {
    pub location: String,
    pub sector: SectorCode,
    /// None when the donor group had no usable denominator; rows matching
    /// such an entry pass through unscaled.
    pub ratio: Option<f64>,
    /// Donor amount behind the ratio, kept for helper-flow diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub helper_amount: Option<f64>,
}

/// Lookup table of allocation ratios. On duplicate (location, sector) keys
/// the first entry wins; donors should be consolidated before ratios are
/// derived.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RatioTable {
    entries: Vec<RatioEntry>,
    #[serde(skip)]
    index: BTreeMap<(String, String), usize>,
}

impl RatioTable {
    pub fn new(entries: Vec<RatioEntry>) -> Self {
        let mut index = BTreeMap::new();
        let mut duplicates = 0usize;
        for (i, entry) in entries.iter().enumerate() {
            let key = (entry.location.clone(), entry.sector.as_str().to_string());
            if index.contains_key(&key) {
                duplicates += 1;
            } else {
                index.insert(key, i);
            }
        }
        if duplicates > 0 {
            log::debug!("ratio table: {duplicates} duplicate (location, sector) keys ignored");
        }
        RatioTable { entries, index }
    }

    pub fn lookup(&self, location: &str, sector: &SectorCode) -> Option<&RatioEntry> {
        let key = (location.to_string(), sector.as_str().to_string());
        self.index.get(&key).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[RatioEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Summary + Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub config_name: String,
    pub year: u16,
    pub target_sector_length: usize,
    pub engine_version: String,
    pub run_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileSummary {
    pub input_records: usize,
    pub output_records: usize,
    /// Duplicate rows merged during consolidation.
    pub consolidated: usize,
    pub estimated_suppressed: usize,
    pub negative_residuals: usize,
    /// Coarse rows synthesized bottom-up.
    pub aggregated: usize,
    /// Fine rows copied down through fan-out-1 parents.
    pub disaggregated: usize,
    /// Rows scaled by an allocation ratio.
    pub allocated: usize,
    /// Rows with no ratio match, passed through unscaled.
    pub passthrough: usize,
    /// Rows created by equal splitting of coarse parents.
    pub split_rows: usize,
    /// Coarse rows kept as-is because the catalog offers no descendants.
    pub orphans_retained: usize,
    pub conservation_violations: usize,
    pub totals_drift: usize,
    pub negative_amounts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResult {
    pub meta: RunMeta,
    pub summary: ReconcileSummary,
    pub records: Vec<FlowRecord>,
}
