// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! effio runtime library.
//!
//! Thread-backed execution core that the `effio` effect layer runs on.
//!
//! Components:
//! - pool — worker pool with delayed scheduling and cancellable jobs
//! - cancel — cancellation tokens and thread interruption
//! - sleep/timer — interruptible sleep, deadline heap
//! - cell — write-once completion cell with waits and observers
//! - handle — async handle: transform, combine, cancel, wait
//! - error — failure taxonomy shared by every layer

pub mod cancel;
pub mod cell;
pub mod error;
pub mod handle;
pub mod pool;
pub mod timeout;

pub use cancel::CancelToken;
pub use cell::CompletionCell;
pub use error::{Error, Outcome};
pub use handle::{AsyncHandle, Completer};
pub use pool::{JobHandle, JobState, PoolConfig, WorkerPool};
pub use timeout::sleep;
