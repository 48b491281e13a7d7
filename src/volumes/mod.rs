//! Volume Publication Module
//!
//! Turns registry records into node-pinned cluster volume objects.

pub mod affinity;
pub mod object_manager;
pub mod quantity;

pub use affinity::*;
pub use object_manager::*;
pub use quantity::*;
