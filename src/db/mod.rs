//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by repositories that don't map onto a domain type.
//! - `repo`: SQL-only functions that map rows into domain types and view models.
//!
//! External modules should import from `agenda_conductor::db`; the repository
//! API and the view models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{AuditRow, BundleRow, MeetingRow};
