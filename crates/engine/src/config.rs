use std::collections::HashMap;

use serde::Deserialize;

use crate::error::ReconcileError;
use crate::model::GroupKeySpec;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ReconcileConfig {
    pub name: String,
    /// Classification year; must match the catalog the run is given.
    pub year: u16,
    /// Sector depth the run reconciles toward, 2 through 6.
    pub target_sector_length: usize,
    #[serde(default = "default_group_by")]
    pub group_by: Vec<String>,
    /// Estimate withheld amounts from parent residuals before reconciling.
    #[serde(default)]
    pub estimate_suppressed: bool,
    pub catalog: CatalogConfig,
    pub input: SourceConfig,
    pub allocation: AllocationMethod,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Code-list CSV path, relative to the config file.
    pub codes: String,
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub file: String,
    pub columns: ColumnMapping,
}

/// Maps engine field names to CSV header names for one source file.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnMapping {
    pub location: String,
    pub flow_name: String,
    pub unit: String,
    pub year: String,
    #[serde(default)]
    pub sector_produced_by: Option<String>,
    #[serde(default)]
    pub sector_consumed_by: Option<String>,
    pub amount: String,
    /// Extra columns carried into record attrs: attr name -> CSV header.
    #[serde(default)]
    pub attrs: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AllocationMethod {
    /// Amounts are already in the flow's own terms; no scaling.
    Direct,
    /// Scale by donor shares of base-level totals.
    Proportional {
        donor: SourceConfig,
        /// Compute shares per (location, activity) group instead of against
        /// the donor's dataset-wide base depth.
        #[serde(default)]
        per_activity: bool,
    },
    /// Like proportional, but only donor rows carrying the disaggregate
    /// flag share the denominator; unflagged rows keep their full amount.
    ProportionalFlagged { donor: SourceConfig },
    /// Divide each group's amount equally across its rows.
    EqualSplit,
}

impl AllocationMethod {
    pub fn donor(&self) -> Option<&SourceConfig> {
        match self {
            Self::Proportional { donor, .. } | Self::ProportionalFlagged { donor } => Some(donor),
            Self::Direct | Self::EqualSplit => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Proportional { .. } => "proportional",
            Self::ProportionalFlagged { .. } => "proportional_flagged",
            Self::EqualSplit => "equal_split",
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub json: Option<String>,
}

fn default_group_by() -> Vec<String> {
    GroupKeySpec::DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl ReconcileConfig {
    pub fn from_toml(input: &str) -> Result<Self, ReconcileError> {
        let config: ReconcileConfig =
            toml::from_str(input).map_err(|e| ReconcileError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ReconcileError> {
        if !(2..=6).contains(&self.target_sector_length) {
            return Err(ReconcileError::ConfigValidation(format!(
                "target_sector_length must be 2..=6, got {}",
                self.target_sector_length
            )));
        }

        if self.year < 1997 {
            return Err(ReconcileError::ConfigValidation(format!(
                "year {} predates sector classification",
                self.year
            )));
        }

        // Same rules run() applies; fail at parse time instead.
        GroupKeySpec::new(self.group_by.clone())?;

        if let Some(donor) = self.allocation.donor() {
            if donor.file.is_empty() {
                return Err(ReconcileError::ConfigValidation(format!(
                    "{} allocation requires a donor file",
                    self.allocation.name()
                )));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
