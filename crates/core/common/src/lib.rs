//! Core types for the Peregrine connectivity engine

pub mod time_wire;
pub mod types;

pub use types::*;
