//! Application layer - the router core.

pub mod gateway;

pub use gateway::{Gateway, Snapshot};
