//! Schema update module
//!
//! Creates schema update scripts and applies or reverts them against the
//! database, keeping track of which updates are applied.

#[allow(dead_code)]
mod database;
mod updates;

pub use database::*;
pub use updates::*;
