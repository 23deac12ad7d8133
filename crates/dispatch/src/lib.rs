//! Dispatch services for the render-farm core.
//!
//! - [`ledger::ResourceLedger`]: atomic reserve/release against host and pin pools.
//! - [`depend::DependManager`]: dependency edges, composite expansion and
//!   satisfaction propagation.
//! - [`frame::FrameStateMachine`]: versioned frame transitions.
//! - [`matcher::DispatchMatcher`]: which frames a host should run next.
//! - [`proc::ProcTracker`]: the all-or-nothing booking commit and proc lifecycle.
//! - [`report::HostReportHandler`]: one host heartbeat in, booked procs out.
//! - [`orphan`]: the maintenance sweep that recovers frames whose host vanished.

pub mod config;
pub mod depend;
pub mod error;
pub mod frame;
pub mod ledger;
pub mod matcher;
pub mod orphan;
pub mod proc;
pub mod report;

pub use config::DispatchConfig;
pub use depend::DependManager;
pub use error::{DispatchError, DispatchResult};
pub use frame::FrameStateMachine;
pub use ledger::ResourceLedger;
pub use matcher::DispatchMatcher;
pub use proc::ProcTracker;
pub use report::HostReportHandler;
