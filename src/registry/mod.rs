//! Volume Registry Module
//!
//! Sharded registry of volume and claim records. All phase changes go
//! through atomic compare-and-swap operations on this registry.

pub mod events;
pub mod volume_registry;

pub use events::*;
pub use volume_registry::*;
