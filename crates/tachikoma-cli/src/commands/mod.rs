//! Command implementations.

mod plugins;

pub use plugins::{PluginsAction, PluginsCommand};
