//! `sectorflow-core` - Sector code primitives and catalog loading.
//!
//! Pure types crate: sector codes, per-year sector catalogs, code-list CSV
//! loading. No engine or CLI dependencies.

pub mod catalog;
pub mod code;
pub mod error;
pub mod store;

pub use catalog::{CrosswalkEdge, SectorCatalog};
pub use code::SectorCode;
pub use error::CatalogError;
pub use store::CatalogStore;
