//! Data models for blobs, blocks and access conditions.

mod blob;
mod block;
mod conditions;
mod container;
mod page;

pub use blob::*;
pub use block::*;
pub use conditions::*;
pub use container::*;
pub use page::*;
