//! Bounded host calls.
//!
//! A slow call is never killed: it is moved to a blocking thread and raced
//! against the deadline. When the deadline wins the caller gets
//! [`CallError::Timeout`] straight away and the call finishes in the
//! background. Its result is discarded, or handed to a reclaim closure when
//! the value owns something on the host side (an instance).

use crate::error::{CallError, HostFault};
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutGuard {
    deadline: Duration,
}

impl TimeoutGuard {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    /// Run `f` under this guard's deadline. `label` only feeds the logs.
    pub async fn call<T, F>(&self, label: &str, f: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Result<T, HostFault> + Send + 'static,
        T: Send + 'static,
    {
        let start = Instant::now();
        let result = call(self.deadline, f).await;
        log_outcome(label, start, &result);
        result
    }

    /// Like [`TimeoutGuard::call`], but a value that arrives after the
    /// caller stopped waiting (deadline hit, or the calling future dropped)
    /// is passed to `reclaim` instead of being dropped.
    pub async fn call_reclaiming<T, F, R>(&self, label: &str, f: F, reclaim: R) -> Result<T, CallError>
    where
        F: FnOnce() -> Result<T, HostFault> + Send + 'static,
        R: FnOnce(T) + Send + 'static,
        T: Send + 'static,
    {
        let start = Instant::now();
        let result = call_reclaiming(self.deadline, f, reclaim).await;
        log_outcome(label, start, &result);
        result
    }
}

fn log_outcome<T>(label: &str, start: Instant, result: &Result<T, CallError>) {
    let elapsed_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(_) => debug!(call = label, elapsed_ms, "Host call completed"),
        Err(CallError::Timeout { deadline }) => warn!(
            call = label,
            deadline_ms = deadline.as_millis() as u64,
            "Host call timed out; abandoning it"
        ),
        Err(e) => debug!(call = label, elapsed_ms, error = %e, "Host call failed"),
    }
}

/// Run `f` on a blocking thread with a hard `deadline`.
pub async fn call<T, F>(deadline: Duration, f: F) -> Result<T, CallError>
where
    F: FnOnce() -> Result<T, HostFault> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::task::spawn_blocking(f);

    match tokio::time::timeout(deadline, handle).await {
        Ok(joined) => settle(joined),
        // Dropping the JoinHandle detaches the blocking task.
        Err(_elapsed) => Err(CallError::Timeout { deadline }),
    }
}

/// Run `f` on a blocking thread with a hard `deadline`; a late success is
/// handed to `reclaim` on a blocking thread.
pub async fn call_reclaiming<T, F, R>(deadline: Duration, f: F, reclaim: R) -> Result<T, CallError>
where
    F: FnOnce() -> Result<T, HostFault> + Send + 'static,
    R: FnOnce(T) + Send + 'static,
    T: Send + 'static,
{
    let mut pending = Pending {
        handle: Some(tokio::task::spawn_blocking(f)),
        reclaim: Some(reclaim),
    };

    let joined = match pending.handle.as_mut() {
        Some(handle) => tokio::time::timeout(deadline, handle).await,
        None => return Err(CallError::Aborted("call already settled".to_string())),
    };

    match joined {
        Ok(joined) => {
            pending.handle = None;
            settle(joined)
        }
        // `pending` still owns the handle; its drop hands it to `reclaim`.
        Err(_elapsed) => Err(CallError::Timeout { deadline }),
    }
}

/// Blocking call the caller no longer waits for.
struct Pending<T, R>
where
    T: Send + 'static,
    R: FnOnce(T) + Send + 'static,
{
    handle: Option<JoinHandle<Result<T, HostFault>>>,
    reclaim: Option<R>,
}

impl<T, R> Drop for Pending<T, R>
where
    T: Send + 'static,
    R: FnOnce(T) + Send + 'static,
{
    fn drop(&mut self) {
        let (Some(handle), Some(reclaim)) = (self.handle.take(), self.reclaim.take()) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Ok(Ok(value)) = handle.await {
                        debug!("Reclaiming result of abandoned host call");
                        let _ = tokio::task::spawn_blocking(move || reclaim(value)).await;
                    }
                });
            }
            Err(_) => warn!("No runtime to reclaim abandoned host call"),
        }
    }
}

fn settle<T>(joined: Result<Result<T, HostFault>, JoinError>) -> Result<T, CallError> {
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(fault)) => Err(CallError::Fault(fault)),
        Err(join_error) => {
            let reason = if join_error.is_panic() {
                let payload = join_error.into_panic();
                if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "panic".to_string()
                }
            } else {
                join_error.to_string()
            };
            Err(CallError::Aborted(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_returns_value() {
        let guard = TimeoutGuard::new(Duration::from_secs(1));
        let value = guard.call("answer", || Ok(42)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_call_times_out_without_waiting() {
        let start = Instant::now();
        let result = call(Duration::from_millis(1), || {
            std::thread::sleep(Duration::from_secs(1));
            Ok(())
        })
        .await;
        let elapsed = start.elapsed();

        assert_eq!(
            result,
            Err(CallError::Timeout {
                deadline: Duration::from_millis(1)
            })
        );
        assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_call_passes_fault_through() {
        let guard = TimeoutGuard::new(Duration::from_secs(1));
        let result: Result<(), _> = guard
            .call("broken", || Err(HostFault::new("class does not exist")))
            .await;
        assert_eq!(
            result,
            Err(CallError::Fault(HostFault::new("class does not exist")))
        );
    }

    #[tokio::test]
    async fn test_call_reports_panicking_adapter() {
        let result: Result<(), _> = call(Duration::from_secs(1), || panic!("adapter bug")).await;
        assert_eq!(result, Err(CallError::Aborted("adapter bug".to_string())));
    }

    #[tokio::test]
    async fn test_timed_out_call_keeps_running() {
        let (tx, rx) = std::sync::mpsc::channel();
        let result = call(Duration::from_millis(5), move || {
            std::thread::sleep(Duration::from_millis(50));
            tx.send("finished").ok();
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(CallError::Timeout { .. })));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok("finished"));
    }

    #[tokio::test]
    async fn test_late_value_is_reclaimed() {
        let (tx, rx) = std::sync::mpsc::channel();
        let result = call_reclaiming(
            Duration::from_millis(5),
            || {
                std::thread::sleep(Duration::from_millis(50));
                Ok("instance")
            },
            move |value| {
                tx.send(value).ok();
            },
        )
        .await;
        assert!(matches!(result, Err(CallError::Timeout { .. })));

        let deadline = Instant::now() + Duration::from_secs(2);
        let reclaimed = loop {
            if let Ok(value) = rx.try_recv() {
                break Some(value);
            }
            if Instant::now() > deadline {
                break None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(reclaimed, Some("instance"));
    }

    #[tokio::test]
    async fn test_prompt_value_is_not_reclaimed() {
        let (tx, rx) = std::sync::mpsc::channel::<u32>();
        let value = call_reclaiming(Duration::from_secs(1), || Ok(7), move |v| {
            tx.send(v).ok();
        })
        .await
        .unwrap();
        assert_eq!(value, 7);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
