//! API Module
//!
//! REST inspection API for the lifecycle manager.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
