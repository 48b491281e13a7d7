//! Domain layer - Core types and port definitions
//!
//! This module defines the lifecycle types and the traits (ports) that
//! adapters implement, following hexagonal architecture principles.

pub mod ports;
pub mod types;

pub use ports::*;
pub use types::*;
