use std::fmt;

#[derive(Debug)]
pub enum CatalogError {
    /// Code-list CSV is missing a required column.
    MissingColumn { file: String, column: String },
    /// A code-list row could not be read.
    Csv { file: String, msg: String },
    /// No code list registered or on disk for the requested year.
    UnknownYear(u16),
    /// IO error (file read, etc.).
    Io(String),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingColumn { file, column } => {
                write!(f, "catalog '{file}': missing column '{column}'")
            }
            Self::Csv { file, msg } => write!(f, "catalog '{file}': {msg}"),
            Self::UnknownYear(year) => write!(f, "no sector code list for year {year}"),
            Self::Io(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for CatalogError {}
