//! `sectorflow-engine` — Sector hierarchy reconciliation engine.
//!
//! Pure engine crate: receives pre-loaded flow records and a sector catalog,
//! returns reconciled records at the target sector length. No CLI or network
//! dependencies.

pub mod aggregate;
pub mod allocate;
pub mod config;
pub mod disaggregate;
pub mod engine;
pub mod equal_split;
pub mod error;
pub mod model;
pub mod suppression;
pub mod validate;

pub use config::{AllocationMethod, ReconcileConfig};
pub use engine::{load_flow_rows, run, subset_to_length, ReconcileInput};
pub use error::ReconcileError;
pub use model::{FlowRecord, GroupKeySpec, RatioTable, ReconcileResult, ReconcileSummary};
