//! Claim Binding Module
//!
//! Exclusive one-to-one binding of claims to discovered volumes.

pub mod binder;

pub use binder::*;
