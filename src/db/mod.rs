//! Database module for squadstats.
//!
//! Provides SQLite storage with embedded migrations.

pub mod identity;
mod models;
pub mod sorties;
mod store;
mod urls;

pub use models::*;
pub use store::*;
