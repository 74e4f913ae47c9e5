//! `sflow catalog` — inspect a sector code list.

use std::path::PathBuf;

use sectorflow_core::code::{MAX_DEPTH, MIN_DEPTH};
use sectorflow_core::store::{load_codes_csv, CatalogStore};
use sectorflow_core::{SectorCatalog, SectorCode};

use crate::exit_codes::{EXIT_RUNTIME, EXIT_USAGE};
use crate::CliError;

pub fn cmd_catalog(path: PathBuf, year: u16, code: Option<String>) -> Result<(), CliError> {
    let stored;
    let loaded;
    let catalog: &SectorCatalog = if path.is_dir() {
        stored = CatalogStore::new(&path)
            .get(year)
            .map_err(|e| CliError::new(EXIT_RUNTIME, e.to_string()))?;
        &stored
    } else {
        let data = std::fs::read_to_string(&path).map_err(|e| {
            CliError::new(EXIT_RUNTIME, format!("cannot read {}: {e}", path.display()))
        })?;
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        loaded = load_codes_csv(year, &data, &label)
            .map_err(|e| CliError::new(EXIT_RUNTIME, e.to_string()))?;
        &loaded
    };

    match code {
        Some(code) => inspect_code(catalog, &code),
        None => {
            print_overview(catalog);
            Ok(())
        }
    }
}

fn print_overview(catalog: &SectorCatalog) {
    println!(
        "catalog {}: {} codes, {} parent-child edges",
        catalog.year(),
        catalog.len(),
        catalog.edges().len(),
    );
    for depth in MIN_DEPTH..=MAX_DEPTH {
        let n = catalog.codes_at(depth).filter(|c| c.is_numeric()).count();
        if n > 0 {
            println!("  length {depth}: {n}");
        }
    }
    let overrides: Vec<&SectorCode> = catalog.codes().filter(|c| !c.is_numeric()).collect();
    if !overrides.is_empty() {
        let names: Vec<&str> = overrides.iter().map(|c| c.as_str()).collect();
        println!("  override tokens: {}", names.join(", "));
    }
}

fn inspect_code(catalog: &SectorCatalog, raw: &str) -> Result<(), CliError> {
    let code = SectorCode::new(raw).normalized();
    if code.is_range() {
        return Err(CliError::new(
            EXIT_USAGE,
            format!("'{raw}' is a range token, not a catalog code"),
        )
        .with_hint("expand ranges like 31-33 into their member codes"));
    }
    if !catalog.contains(&code) {
        return Err(CliError::new(
            EXIT_RUNTIME,
            format!("'{}' is not in the {} catalog", code.as_str(), catalog.year()),
        ));
    }

    println!("{} (length {}, fan-out {})", code.as_str(), code.depth(), catalog.fan_out(&code));
    for depth in code.depth() + 1..=MAX_DEPTH {
        let descendants = catalog.descendants_at(&code, depth);
        if descendants.is_empty() {
            continue;
        }
        let names: Vec<&str> = descendants.iter().map(|c| c.as_str()).collect();
        println!("  length {}: {} ({})", depth, descendants.len(), names.join(", "));
    }
    Ok(())
}
