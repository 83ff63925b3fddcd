//! Broadcast module
//!
//! Serializes concurrent publishes into one delivery order and fans each
//! message out to every open connection.

mod pipeline;

pub use pipeline::*;
