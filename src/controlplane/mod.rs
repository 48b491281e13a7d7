//! Control Plane Module
//!
//! The lifecycle manager that drives discovery, publication, binding and
//! recreation for one node, plus its metrics and REST API.

pub mod api;
pub mod manager;
pub mod metrics;

pub use api::*;
pub use manager::*;
pub use metrics::*;
