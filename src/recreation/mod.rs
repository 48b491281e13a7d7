//! Volume Recreation Module

pub mod coordinator;

pub use coordinator::*;
