//! Persistence gateway: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed rows and view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Callers import from `subst_notifier::db`; the repository API and the
//! commonly used models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{Account, AccountSummary, Enrollment};
