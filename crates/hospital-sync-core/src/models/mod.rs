//! Domain models for the replication core.

mod checkpoint;
mod collection;
mod context;
mod document;
mod entities;
mod role;

pub use checkpoint::*;
pub use collection::*;
pub use context::*;
pub use document::*;
pub use entities::*;
pub use role::*;
