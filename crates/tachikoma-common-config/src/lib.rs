//! Configuration types for Tachikoma.
//!
//! This crate provides the configuration types used by Tachikoma
//! for `.tachikoma/config.yaml` files.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;
