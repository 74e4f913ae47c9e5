//! `sflow reconcile` and `sflow validate` — config-driven pipeline runs.

use std::path::{Path, PathBuf};
use std::time::Instant;

use sectorflow_core::store::load_codes_csv;
use sectorflow_core::SectorCatalog;
use sectorflow_engine::{
    load_flow_rows, FlowRecord, ReconcileConfig, ReconcileError, ReconcileInput, ReconcileResult,
};

use crate::exit_codes::{EXIT_CHECK_FAILED, EXIT_INVALID_CONFIG, EXIT_RUNTIME};
use crate::CliError;

/// A config plus every file it names, loaded and parsed.
pub struct LoadedRun {
    pub config: ReconcileConfig,
    pub catalog: SectorCatalog,
    pub records: Vec<FlowRecord>,
    pub donor: Option<Vec<FlowRecord>>,
    pub base_dir: PathBuf,
}

/// Read a config and its data files, resolving every path relative to the
/// config file's own directory.
pub fn load_run(config_path: &Path) -> Result<LoadedRun, CliError> {
    let config_str = std::fs::read_to_string(config_path)
        .map_err(|e| CliError::new(EXIT_RUNTIME, format!("cannot read config: {e}")))?;
    let config = ReconcileConfig::from_toml(&config_str)
        .map_err(|e| CliError::new(EXIT_INVALID_CONFIG, e.to_string()))?;

    let base_dir = config_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

    let catalog_data = read_named(&base_dir.join(&config.catalog.codes))?;
    let catalog = load_codes_csv(config.year, &catalog_data, &config.catalog.codes)
        .map_err(|e| CliError::new(EXIT_RUNTIME, e.to_string()))?;
    tracing::debug!(file = %config.catalog.codes, codes = catalog.len(), "loaded catalog");

    let input_data = read_named(&base_dir.join(&config.input.file))?;
    let records = load_flow_rows(&input_data, &config.input.columns, &config.input.file)
        .map_err(|e| {
            let err = CliError::new(EXIT_RUNTIME, e.to_string());
            match e {
                ReconcileError::MissingColumn { .. } => {
                    err.with_hint("column names come from [input.columns] in the config")
                }
                _ => err,
            }
        })?;
    tracing::debug!(file = %config.input.file, rows = records.len(), "loaded input");

    let donor = match config.allocation.donor() {
        Some(source) => {
            let data = read_named(&base_dir.join(&source.file))?;
            let rows = load_flow_rows(&data, &source.columns, &source.file)
                .map_err(|e| CliError::new(EXIT_RUNTIME, e.to_string()))?;
            tracing::debug!(file = %source.file, rows = rows.len(), "loaded donor");
            Some(rows)
        }
        None => None,
    };

    Ok(LoadedRun { config, catalog, records, donor, base_dir })
}

fn read_named(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path)
        .map_err(|e| CliError::new(EXIT_RUNTIME, format!("cannot read {}: {e}", path.display())))
}

pub fn cmd_reconcile(
    config_path: PathBuf,
    json_output: bool,
    output_file: Option<PathBuf>,
) -> Result<(), CliError> {
    let LoadedRun { config, catalog, records, donor, base_dir } = load_run(&config_path)?;

    let started = Instant::now();
    let result = sectorflow_engine::run(&config, ReconcileInput { records, donor }, &catalog)
        .map_err(|e| CliError::new(EXIT_RUNTIME, e.to_string()))?;
    tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "pipeline finished");

    let json_str = serde_json::to_string_pretty(&result)
        .map_err(|e| CliError::new(EXIT_RUNTIME, format!("JSON serialization error: {e}")))?;

    // --output wins over [output] json in the config
    let output_file =
        output_file.or_else(|| config.output.json.as_ref().map(|p| base_dir.join(p)));
    if let Some(ref path) = output_file {
        std::fs::write(path, &json_str)
            .map_err(|e| CliError::new(EXIT_RUNTIME, format!("cannot write output: {e}")))?;
        eprintln!("wrote {}", path.display());
    }

    if json_output {
        println!("{json_str}");
    }

    print_summary(&result);

    let s = &result.summary;
    if s.conservation_violations > 0 || s.negative_amounts > 0 {
        return Err(CliError::new(
            EXIT_CHECK_FAILED,
            format!(
                "checks flagged {} inconsistent families, {} negative amounts",
                s.conservation_violations, s.negative_amounts,
            ),
        ));
    }

    Ok(())
}

/// Human summary to stderr; stdout stays reserved for --json.
fn print_summary(result: &ReconcileResult) {
    let s = &result.summary;
    eprintln!(
        "reconcile '{}': {} records in, {} out at length {} — {} aggregated, {} disaggregated, {} allocated, {} split",
        result.meta.config_name,
        s.input_records,
        s.output_records,
        result.meta.target_sector_length,
        s.aggregated,
        s.disaggregated,
        s.allocated,
        s.split_rows,
    );
    if s.estimated_suppressed > 0 {
        eprintln!(
            "suppression: {} cells estimated, {} negative residuals",
            s.estimated_suppressed, s.negative_residuals,
        );
    }
    if s.orphans_retained > 0 {
        eprintln!("kept {} rows coarser than the target (no catalog descendants)", s.orphans_retained);
    }
    if s.conservation_violations > 0 || s.totals_drift > 0 || s.negative_amounts > 0 {
        eprintln!(
            "checks: {} inconsistent families, {} groups drifted, {} negative amounts",
            s.conservation_violations, s.totals_drift, s.negative_amounts,
        );
    }
}

pub fn cmd_validate(config_path: PathBuf) -> Result<(), CliError> {
    let config_str = std::fs::read_to_string(&config_path)
        .map_err(|e| CliError::new(EXIT_RUNTIME, format!("cannot read config: {e}")))?;

    match ReconcileConfig::from_toml(&config_str) {
        Ok(config) => {
            eprintln!(
                "valid: '{}' reconciles {} to length {} ({})",
                config.name,
                config.input.file,
                config.target_sector_length,
                config.allocation.name(),
            );
            Ok(())
        }
        Err(e) => Err(CliError::new(EXIT_INVALID_CONFIG, e.to_string())),
    }
}
