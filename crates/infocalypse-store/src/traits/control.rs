//! Connection introspection for the scheduler.

use crate::types::ConnectionState;

pub trait RequestControl: Send + Sync {
    /// Current socket state. The scheduler starts nothing while `Uploading`.
    fn connection_state(&self) -> ConnectionState;
}
