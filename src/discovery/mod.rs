//! Volume Discovery Module
//!
//! Finds candidate local volumes under configured host directories.

pub mod config;
pub mod exec;
pub mod hostfs;
pub mod scanner;

pub use config::*;
pub use exec::*;
pub use hostfs::*;
pub use scanner::*;
