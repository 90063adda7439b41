//! Storage layer backing the in-process emulator.

mod extent;
mod metadata;

pub use extent::*;
pub use metadata::*;
