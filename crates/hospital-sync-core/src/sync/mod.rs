//! Replication: wire protocol, transport, channels, manager and session.

mod channel;
mod manager;
mod memory;
mod protocol;
mod remote;
mod retry;
mod session;

pub use channel::*;
pub use manager::*;
pub use memory::InMemoryRemote;
pub use protocol::*;
pub use remote::*;
pub use retry::*;
pub use session::*;

use thiserror::Error;

use crate::models::{Role, SchemaError, SyncContext};
use crate::store::StoreError;

/// Manager and session errors.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Context {context} is not available to role {role}")]
    UnsupportedContext { role: Role, context: SyncContext },

    #[error("No identity is bound to the session")]
    NotBound,
}
