use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::catalog::SectorCatalog;
use crate::code::SectorCode;
use crate::error::CatalogError;

/// Parse a code-list CSV into a catalog. Expects a `code` header column;
/// blank cells are skipped.
pub fn load_codes_csv(year: u16, data: &str, file_label: &str) -> Result<SectorCatalog, CatalogError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(data.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| CatalogError::Csv { file: file_label.to_string(), msg: e.to_string() })?
        .clone();
    let code_idx = headers
        .iter()
        .position(|h| h == "code")
        .ok_or_else(|| CatalogError::MissingColumn {
            file: file_label.to_string(),
            column: "code".to_string(),
        })?;

    let mut codes = Vec::new();
    for record in reader.records() {
        let record = record
            .map_err(|e| CatalogError::Csv { file: file_label.to_string(), msg: e.to_string() })?;
        let raw = record.get(code_idx).unwrap_or("").trim();
        if raw.is_empty() {
            continue;
        }
        codes.push(SectorCode::new(raw));
    }

    Ok(SectorCatalog::from_codes(year, codes))
}

/// Loads catalogs from `<dir>/naics_<year>.csv` and memoizes them per year,
/// so one run touching several years parses each code list once.
pub struct CatalogStore {
    dir: PathBuf,
    cache: Mutex<BTreeMap<u16, Arc<SectorCatalog>>>,
}

impl CatalogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CatalogStore { dir: dir.into(), cache: Mutex::new(BTreeMap::new()) }
    }

    /// Catalog for `year`, loading from disk on first use.
    pub fn get(&self, year: u16) -> Result<Arc<SectorCatalog>, CatalogError> {
        if let Some(hit) = self.lock_cache().get(&year) {
            log::debug!("catalog cache hit for {year}");
            return Ok(Arc::clone(hit));
        }

        let path = self.dir.join(format!("naics_{year}.csv"));
        let data = fs::read_to_string(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => CatalogError::UnknownYear(year),
            _ => CatalogError::Io(format!("{}: {e}", path.display())),
        })?;
        let catalog = Arc::new(load_codes_csv(year, &data, &path.display().to_string())?);
        log::debug!("loaded {} codes for {year} from {}", catalog.len(), path.display());

        self.lock_cache().insert(year, Arc::clone(&catalog));
        Ok(catalog)
    }

    /// Register a prebuilt catalog under its own year.
    pub fn put(&self, catalog: SectorCatalog) -> Arc<SectorCatalog> {
        let year = catalog.year();
        let catalog = Arc::new(catalog);
        self.lock_cache().insert(year, Arc::clone(&catalog));
        catalog
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, BTreeMap<u16, Arc<SectorCatalog>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_code_column() {
        let csv = "code,description\n31,Manufacturing\n311,Food\n,blank\n";
        let cat = load_codes_csv(2017, csv, "test.csv").unwrap();
        assert_eq!(cat.len(), 2);
        assert!(cat.contains(&SectorCode::new("311")));
    }

    #[test]
    fn missing_code_column_is_an_error() {
        let csv = "sector,description\n31,Manufacturing\n";
        let err = load_codes_csv(2017, csv, "test.csv").unwrap_err();
        match err {
            CatalogError::MissingColumn { column, .. } => assert_eq!(column, "code"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn store_memoizes_prebuilt_catalogs() {
        let store = CatalogStore::new("/nonexistent");
        store.put(SectorCatalog::from_codes(2012, [SectorCode::new("31")]));
        let cat = store.get(2012).unwrap();
        assert_eq!(cat.year(), 2012);
        assert_eq!(cat.len(), 1);
    }

    #[test]
    fn unknown_year_reported() {
        let store = CatalogStore::new("/nonexistent");
        match store.get(1999) {
            Err(CatalogError::UnknownYear(1999)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
