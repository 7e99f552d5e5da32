//! `try_within` (§4.9): the scoped error-sink split used at every async
//! boundary in this crate.
//!
//! A handler's own return value is reported to its immediate caller as an
//! ordinary `Result`. Anything a handler spawns in the background that
//! outlives the call — and later panics or errors — has nowhere natural to
//! go once the call has already returned `Ok`. `try_within` gives it one:
//! a caller-specified [`LateFailureSink`] rather than a silently dropped
//! `JoinHandle` or a process crash.

use std::future::Future;

use parallel_core::ParallelError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

/// A single post-result failure from a task a handler spawned in the
/// background, delivered to whatever [`LateFailureSink`] the caller
/// configured.
#[derive(Debug, Clone)]
pub struct LateTaskFailure {
    pub context: String,
    pub message: String,
}

/// Receiving half of the late-failure channel; callers poll this (in tests,
/// via `recv().await`) to assert on background failures that happened
/// after a call already returned its result.
pub type LateFailureReceiver = mpsc::UnboundedReceiver<LateTaskFailure>;

/// Sending half, cloned into every scope created by [`try_within`].
#[derive(Debug, Clone)]
pub struct LateFailureSink {
    sender: mpsc::UnboundedSender<LateTaskFailure>,
}

impl LateFailureSink {
    /// Creates a fresh sink/receiver pair. The receiver is normally held by
    /// a long-lived monitoring task or, in tests, polled directly.
    pub fn new() -> (Self, LateFailureReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sender: tx }, rx)
    }

    /// Reports a late failure. Never fails even if nobody is listening
    /// anymore — a dropped receiver means the operator chose not to
    /// monitor, not that the failure should crash the process.
    pub fn report(&self, context: impl Into<String>, message: impl Into<String>) {
        let failure = LateTaskFailure {
            context: context.into(),
            message: message.into(),
        };
        if self.sender.send(failure.clone()).is_err() {
            error!(context = %failure.context, message = %failure.message, "late task failure (no listener attached)");
        }
    }
}

/// Spawns `background` as an independent task supervised by `sink`: if it
/// panics or returns `Err`, that failure is reported to `sink` instead of
/// propagating anywhere the caller of `try_within` can observe directly.
/// This is what "late failures redirect to a caller-specified supervisor"
/// (§4.9) looks like once a result has already been determined.
pub fn spawn_supervised<F, T, E>(context: impl Into<String> + Send + 'static, sink: LateFailureSink, background: F)
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let context = context.into();
    let handle = tokio::spawn(background);
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => sink.report(context, err.to_string()),
            Err(join_err) if join_err.is_panic() => sink.report(context, panic_message(join_err)),
            Err(join_err) => sink.report(context, join_err.to_string()),
        }
    });
}

/// Runs `computation` to completion, catching a panic raised before the
/// result is determined and returning it to the **current** caller as an
/// `Err` — the "before-determined" half of the split in §4.9. Panics are
/// the Rust analogue of the spec's "exceptions raised before the
/// computation's first suspension or result".
pub async fn try_within<F, T>(computation: F) -> Result<T, ParallelError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(computation).await {
        Ok(value) => Ok(value),
        Err(join_err) if join_err.is_panic() => {
            let message = panic_message(join_err);
            error!(error = %message, "computation panicked inside try_within");
            Err(ParallelError::LateTaskFailure(message))
        }
        Err(join_err) => Err(ParallelError::LateTaskFailure(join_err.to_string())),
    }
}

fn panic_message(join_err: tokio::task::JoinError) -> String {
    let payload = join_err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Joins a handle purely to surface a panic through [`try_within`]'s
/// before/after split from call sites that already hold a `JoinHandle`
/// (e.g. a connection's request-dispatch task) rather than constructing
/// the future fresh.
pub async fn join_supervised<T>(handle: JoinHandle<T>) -> Result<T, ParallelError>
where
    T: Send + 'static,
{
    match handle.await {
        Ok(value) => Ok(value),
        Err(join_err) if join_err.is_panic() => Err(ParallelError::LateTaskFailure(panic_message(join_err))),
        Err(join_err) => Err(ParallelError::LateTaskFailure(join_err.to_string())),
    }
}
