//! Domain logic for the render-farm dispatch core.
//!
//! Everything in this crate is pure: state enums, resource arithmetic,
//! frame lifecycle rules, dependency expansion, job ordering and booking
//! plans. Persistence lives in `spool-db`; the services that tie the two
//! together live in `spool-dispatch`.

pub mod booking;
pub mod depend;
pub mod error;
pub mod frame;
pub mod resources;
pub mod scheduling;
pub mod states;
pub mod types;
