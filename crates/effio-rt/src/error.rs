// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error taxonomy shared by cells, handles and the effect evaluator.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Eventual result of a computation.
pub type Outcome<T> = Result<T, Error>;

/// Every way a computation can fail.
///
/// `Clone` because one outcome is broadcast to every observer of a cell.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Stopped by a cooperative cancel or an interrupt.
    #[error("computation was cancelled")]
    Cancelled,

    /// A deadline elapsed first.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// `complete` was called on a cell that already holds an outcome.
    #[error("completion cell was already completed")]
    AlreadyCompleted,

    /// A `filter` predicate rejected the value.
    #[error("no such element: {0}")]
    NoSuchElement(String),

    /// A user closure panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Work was submitted after the pool shut down.
    #[error("worker pool is shut down")]
    Rejected,

    /// Application failure, carried opaquely.
    #[error(transparent)]
    Failed(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an application error.
    pub fn failed<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Failed(Arc::new(err))
    }

    /// Application failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Failed(Arc::new(Message(message.into())))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Borrow the application error if it has type `E`.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Error::Failed(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Convert a `catch_unwind` payload into `Panicked`.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Error::Panicked(msg)
    }
}

/// Message-only failure behind [`Error::msg`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Message(pub String);
