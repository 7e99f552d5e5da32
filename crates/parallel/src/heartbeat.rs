use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use parallel_proto::HeartbeatFrame;
use parallel_rpc::RpcClient;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

/// Liveness policy a worker is configured with at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatPolicy {
    /// Tear the worker down the moment the parent heartbeat goes dead.
    ConnectAndShutdownOnDisconnect { interval: Duration, timeout: Duration },
    /// The process was launched outside the framework; no parent to watch.
    Optional,
}

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("no parent configured for this process")]
    NoParent,
}

/// Spawns the background heartbeat loop for a worker whose policy is
/// `ConnectAndShutdownOnDisconnect`. A worker spawned with `Optional` has no
/// parent stream to watch, so this returns `Err(HeartbeatError::NoParent)`
/// instead of starting a loop — the caller logs that rather than treating
/// the stream as silently disposable.
pub fn spawn_if_configured<S>(
    policy: HeartbeatPolicy,
    stream: S,
    liveness: Arc<LivenessFlag>,
) -> Result<(), HeartbeatError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match policy {
        HeartbeatPolicy::ConnectAndShutdownOnDisconnect { interval, timeout: timeout_dur } => {
            tokio::spawn(async move {
                run(stream, interval, timeout_dur, liveness, None).await;
            });
            Ok(())
        }
        HeartbeatPolicy::Optional => {
            drop(stream);
            Err(HeartbeatError::NoParent)
        }
    }
}

/// Why a heartbeat link was marked dead — distinguishes a graceful
/// shutdown request from an actual liveness failure, since they lead to
/// different worker exit codes (§6: 0 vs 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathReason {
    /// The other side sent an explicit `Shutdown` frame.
    ShutdownRequested,
    /// No frame arrived within the configured timeout.
    Timeout,
    /// The transport errored or the connection dropped.
    TransportLost,
}

/// Tracks whether a heartbeat link is still alive, shared between the
/// background tick task and whatever is waiting on disconnection.
#[derive(Debug, Default)]
pub struct LivenessFlag {
    dead: AtomicBool,
    last_seq: AtomicU64,
    reason: OnceLock<DeathReason>,
    notify: Notify,
}

impl LivenessFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Why the link died, if it has. `None` while still alive.
    pub fn death_reason(&self) -> Option<DeathReason> {
        self.reason.get().copied()
    }

    fn mark_dead(&self, reason: DeathReason) {
        let _ = self.reason.set(reason);
        self.dead.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolves once the link is marked dead.
    pub async fn wait_dead(&self) {
        if self.is_dead() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Runs the bidirectional heartbeat loop over an already-connected stream.
///
/// Both the child and the parent run this same loop — the protocol is
/// symmetric, each side ticking on its own timer and declaring the link
/// dead if it hasn't heard from the other end within `timeout`. The parent
/// side additionally accepts a `shutdown_requested` channel: when signaled,
/// it sends one `Shutdown` frame and returns instead of waiting out the
/// rest of the interval, letting a graceful master-initiated teardown beat
/// the next scheduled tick. The child side always passes `None` — a worker
/// never asks its own parent to shut down.
pub async fn run<S>(
    stream: S,
    interval: Duration,
    timeout_dur: Duration,
    liveness: Arc<LivenessFlag>,
    mut shutdown_requested: Option<mpsc::UnboundedReceiver<()>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut client = RpcClient::new(stream);
    let mut seq: u64 = 0;
    let mut last_seen = Instant::now();

    loop {
        if let Some(rx) = shutdown_requested.as_mut() {
            if rx.try_recv().is_ok() {
                let _ = client.send(&HeartbeatFrame::Shutdown { seq }).await;
                liveness.mark_dead(DeathReason::ShutdownRequested);
                return;
            }
        }

        seq += 1;
        if let Err(err) = client.send(&HeartbeatFrame::Tick { seq }).await {
            debug!(error = %err, "heartbeat tick failed to send");
            liveness.mark_dead(DeathReason::TransportLost);
            return;
        }

        let remaining = timeout_dur.saturating_sub(last_seen.elapsed());
        match timeout(remaining.max(Duration::from_millis(1)), client.recv::<HeartbeatFrame>()).await {
            Ok(Ok(frame)) => {
                last_seen = Instant::now();
                liveness.last_seq.store(frame.seq(), Ordering::Relaxed);
                if matches!(frame, HeartbeatFrame::Shutdown { .. }) {
                    liveness.mark_dead(DeathReason::ShutdownRequested);
                    return;
                }
            }
            Ok(Err(err)) => {
                warn!(error = %err, "heartbeat receive failed");
                liveness.mark_dead(DeathReason::TransportLost);
                return;
            }
            Err(_) => {
                warn!(?timeout_dur, "heartbeat channel timed out");
                liveness.mark_dead(DeathReason::Timeout);
                return;
            }
        }

        if last_seen.elapsed() >= timeout_dur {
            warn!(?timeout_dur, "heartbeat channel went quiet");
            liveness.mark_dead(DeathReason::Timeout);
            return;
        }

        match shutdown_requested.as_mut() {
            Some(rx) => {
                tokio::select! {
                    _ = rx.recv() => {
                        let _ = client.send(&HeartbeatFrame::Shutdown { seq }).await;
                        liveness.mark_dead(DeathReason::ShutdownRequested);
                        return;
                    }
                    _ = sleep(interval) => {}
                }
            }
            None => sleep(interval).await,
        }
    }
}
