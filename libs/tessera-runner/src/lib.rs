//! Test-run orchestration kernel.
//!
//! A [`queue::JobQueue`] accepts specs and hands them to a bounded pool of
//! workers. Each worker builds a fresh [`manager::Manager`] run: discovery
//! against the [`host::RemoteTestHost`], then an [`executor::Executor`]
//! feeding a per-run [`context::RunContext`]. Every host call goes through
//! a [`guard::TimeoutGuard`].

pub mod catalog;
pub mod context;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod guard;
pub mod host;
pub mod manager;
pub mod queue;

#[cfg(test)]
mod executor_tests;

pub use error::{CallError, HostFault, RunnerError};
pub use host::{AssertionEvent, InstanceHandle, Invocation, RemoteTestHost};
pub use queue::JobQueue;
