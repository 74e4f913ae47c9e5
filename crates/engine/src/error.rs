use std::fmt;

use sectorflow_core::CatalogError;

#[derive(Debug)]
pub enum ReconcileError {
    /// TOML parse / deserialization error.
    ConfigParse(String),
    /// Config validation error (bad target length, missing donor, etc.).
    ConfigValidation(String),
    /// A sector-range token reached an engine operation.
    RangeCode { code: String, context: &'static str },
    /// Flag-dependent allocation, but no donor row carries the flag column.
    MissingFlag { field: String },
    /// No base-level donor rows to build allocation denominators from.
    NoBaseSectors { context: String },
    /// Missing required column in input data.
    MissingColumn { file: String, column: String },
    /// Amount parse error.
    AmountParse { file: String, row: usize, value: String },
    /// Year parse error.
    YearParse { file: String, row: usize, value: String },
    /// Sector code list could not be loaded.
    Catalog(CatalogError),
    /// IO error (file read, etc.).
    Io(String),
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigParse(msg) => write!(f, "config parse error: {msg}"),
            Self::ConfigValidation(msg) => write!(f, "config validation error: {msg}"),
            Self::RangeCode { code, context } => {
                write!(f, "{context}: sector range '{code}' is not a valid tree node")
            }
            Self::MissingFlag { field } => {
                write!(f, "flagged allocation requires a '{field}' column on the donor")
            }
            Self::NoBaseSectors { context } => {
                write!(f, "{context}: no base-level sectors to allocate against")
            }
            Self::MissingColumn { file, column } => {
                write!(f, "file '{file}': missing column '{column}'")
            }
            Self::AmountParse { file, row, value } => {
                write!(f, "file '{file}', row {row}: cannot parse amount '{value}'")
            }
            Self::YearParse { file, row, value } => {
                write!(f, "file '{file}', row {row}: cannot parse year '{value}'")
            }
            Self::Catalog(err) => write!(f, "{err}"),
            Self::Io(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for ReconcileError {}

impl From<CatalogError> for ReconcileError {
    fn from(err: CatalogError) -> Self {
        ReconcileError::Catalog(err)
    }
}
