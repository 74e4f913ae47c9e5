//! CLI exit code registry.
//!
//! Single source of truth for `sflow` exit codes. Exit codes are part of
//! the shell contract; scripts rely on them.
//!
//! | Code | Meaning                                              |
//! |------|------------------------------------------------------|
//! | 0    | Success                                              |
//! | 1    | General error (reserved, unspecified failures)       |
//! | 2    | Usage error (bad args; clap uses this on its own)    |
//! | 3    | Config invalid (TOML parse or validation failure)    |
//! | 4    | Runtime failure (unreadable file, bad data, engine)  |
//! | 5    | Run finished but the output checks flagged rows      |

/// Success.
pub const EXIT_SUCCESS: u8 = 0;

/// Usage error. clap exits with this itself on bad arguments; manual
/// argument checks use it too.
pub const EXIT_USAGE: u8 = 2;

/// Config rejected before any data was touched.
pub const EXIT_INVALID_CONFIG: u8 = 3;

/// Failure while loading data or running the pipeline.
pub const EXIT_RUNTIME: u8 = 4;

/// The pipeline completed and wrote its output, but the validation pass
/// found inconsistent families or negative amounts. Totals drift alone
/// does not trip this: donor reweighting moves group totals on purpose.
pub const EXIT_CHECK_FAILED: u8 = 5;
