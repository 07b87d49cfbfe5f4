//! Reconciliation of scraped records into the store.
//!
//! Each entry point runs as one transaction, so the read-check-write steps
//! (overlap check, current-name flip) are atomic with respect to other callers
//! sharing the same [`Store`](crate::db::Store).

mod identity;
mod sortie;

pub use identity::*;
pub use sortie::*;
