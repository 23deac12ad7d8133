//! Row models and DTOs.
//!
//! Each submodule contains:
//! - A `FromRow` + `Serialize` entity struct matching the database row
//! - A `Deserialize` create DTO for inserts where the core creates rows
//!
//! State columns are kept as raw `StateId`s on the row; typed accessors map
//! them through the enums in `spool_core::states`.

pub mod depend;
pub mod directory;
pub mod frame;
pub mod host;
pub mod local;
pub mod proc;
