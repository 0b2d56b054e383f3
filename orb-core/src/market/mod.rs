//! Market data primitives consumed by the engine

pub mod types;

pub use types::{Direction, Symbol, Tick};
