//! Runtime data model definitions.
//!
//! Models are declared once, statically, and passed by reference into the
//! compiler, the planner and transactions. Nothing here is discovered at
//! runtime.
//!
//! In general:
//! - `model` defines *what exists*
//! - `db` defines *what runs*

pub mod entity;
pub mod field;
pub mod validate;
