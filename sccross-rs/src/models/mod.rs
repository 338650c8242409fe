//! Model implementations.

pub mod linear;

pub use linear::{EpochRecord, LinearCrossModel};
