//! `sflow ratios` — emit a config's donor ratio table as CSV.

use std::path::PathBuf;

use sectorflow_engine::allocate::{by_location_and_activity, proportional, proportional_flagged};
use sectorflow_engine::model::{GroupKeySpec, SectorField};
use sectorflow_engine::{AllocationMethod, RatioTable};

use crate::exit_codes::{EXIT_INVALID_CONFIG, EXIT_RUNTIME};
use crate::reconcile::{load_run, LoadedRun};
use crate::CliError;

pub fn cmd_ratios(config_path: PathBuf, output_file: Option<PathBuf>) -> Result<(), CliError> {
    let LoadedRun { config, donor, .. } = load_run(&config_path)?;

    let Some(donor) = donor else {
        return Err(CliError::new(
            EXIT_INVALID_CONFIG,
            format!("method '{}' has no donor ratios", config.allocation.name()),
        )
        .with_hint("ratios needs a proportional or proportional_flagged config"));
    };

    let group = GroupKeySpec::new(config.group_by.clone())
        .map_err(|e| CliError::new(EXIT_INVALID_CONFIG, e.to_string()))?;

    let table = match &config.allocation {
        AllocationMethod::Proportional { per_activity: true, .. } => {
            by_location_and_activity(&donor, SectorField::ProducedBy, &group)
        }
        AllocationMethod::Proportional { .. } => proportional(&donor, &group),
        AllocationMethod::ProportionalFlagged { .. } => proportional_flagged(&donor, &group),
        // donor() returned Some, so the method carries a donor
        AllocationMethod::Direct | AllocationMethod::EqualSplit => unreachable!(),
    }
    .map_err(|e| CliError::new(EXIT_RUNTIME, e.to_string()))?;

    write_table(&table, output_file)?;
    eprintln!("{} ratio entries ({})", table.entries().len(), config.allocation.name());
    Ok(())
}

fn write_table(table: &RatioTable, output_file: Option<PathBuf>) -> Result<(), CliError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(["location", "sector", "ratio", "donor_amount"])
        .map_err(|e| CliError::new(EXIT_RUNTIME, e.to_string()))?;
    for entry in table.entries() {
        let ratio = entry.ratio.map(|r| r.to_string()).unwrap_or_default();
        let donor_amount = entry.helper_amount.map(|a| a.to_string()).unwrap_or_default();
        writer
            .write_record([entry.location.as_str(), entry.sector.as_str(), &ratio, &donor_amount])
            .map_err(|e| CliError::new(EXIT_RUNTIME, e.to_string()))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| CliError::new(EXIT_RUNTIME, e.to_string()))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| CliError::new(EXIT_RUNTIME, e.to_string()))?;

    match output_file {
        Some(path) => {
            std::fs::write(&path, &text)
                .map_err(|e| CliError::new(EXIT_RUNTIME, format!("cannot write output: {e}")))?;
            eprintln!("wrote {}", path.display());
        }
        None => print!("{text}"),
    }
    Ok(())
}
