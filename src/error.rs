//! Crate-level error roll-up
//!
//! Component modules define their own error enums; this type exists for
//! callers (the server binary, embedding applications) that need a single
//! error surface.

use crate::broker::traits::{BrokerError, DispatchError};
use crate::broker::monitor::MonitorError;
use crate::database::DatabaseError;
use crate::store::StoreError;
use thiserror::Error;

/// Any error the handoff system can surface
#[derive(Debug, Error)]
pub enum HandoffError {
    /// Database initialization or migration failure
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Store operation failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Broker publish/consume failure
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Strategy selection or execution failure
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Metrics collection failure
    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

/// Result alias over [`HandoffError`]
pub type Result<T> = std::result::Result<T, HandoffError>;
