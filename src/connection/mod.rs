//! Connection management module
//!
//! Tracks open streaming connections and drives their lifecycle from open
//! to close.

mod handle;
mod manager;
mod registry;

pub use handle::*;
pub use manager::*;
pub use registry::*;
