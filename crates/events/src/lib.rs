//! Events published by the dispatch core after each committed transition.

pub mod bus;

pub use bus::{DispatchEvent, EventBus, Subject};
