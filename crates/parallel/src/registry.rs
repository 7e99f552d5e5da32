use std::collections::HashMap;
use std::sync::Arc;

use parallel_core::{WorkerAddress, WorkerId};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};

use crate::heartbeat::LivenessFlag;

/// Master-side record of a live worker process.
pub struct WorkerHandle {
    pub id: WorkerId,
    pub address: WorkerAddress,
    process: WorkerProcess,
    pub liveness: Arc<LivenessFlag>,
    on_failure: Option<Box<dyn Fn(WorkerId, parallel_core::ParallelError) + Send + Sync>>,
    /// Set only under `ConnectAndShutdownOnDisconnect`: lets the master ask
    /// the parent-side heartbeat task to send one `Shutdown` frame instead
    /// of the worker having to be killed outright.
    shutdown_tx: Option<mpsc::UnboundedSender<()>>,
    /// UNIX time in milliseconds at which this worker was spawned.
    pub spawned_at_ms: u64,
}

/// How the master holds onto the child's OS process.
enum WorkerProcess {
    /// A real child process this master launched directly.
    Local(Child),
    /// A process launched via a remote-shell command; the master has no
    /// local handle to kill it with and relies on the heartbeat/RPC
    /// channel (or an operator) to reap it.
    Remote,
}

impl WorkerHandle {
    pub fn new_local(
        id: WorkerId,
        address: WorkerAddress,
        process: Child,
        liveness: Arc<LivenessFlag>,
        on_failure: Option<Box<dyn Fn(WorkerId, parallel_core::ParallelError) + Send + Sync>>,
        shutdown_tx: Option<mpsc::UnboundedSender<()>>,
    ) -> Self {
        Self {
            id,
            address,
            process: WorkerProcess::Local(process),
            liveness,
            on_failure,
            shutdown_tx,
            spawned_at_ms: parallel_core::now_ms(),
        }
    }

    pub fn new_remote(
        id: WorkerId,
        address: WorkerAddress,
        liveness: Arc<LivenessFlag>,
        on_failure: Option<Box<dyn Fn(WorkerId, parallel_core::ParallelError) + Send + Sync>>,
        shutdown_tx: Option<mpsc::UnboundedSender<()>>,
    ) -> Self {
        Self {
            id,
            address,
            process: WorkerProcess::Remote,
            liveness,
            on_failure,
            shutdown_tx,
            spawned_at_ms: parallel_core::now_ms(),
        }
    }

    /// Invokes the registered failure callback exactly once for this handle.
    pub fn notify_failure(&self, err: parallel_core::ParallelError) {
        if let Some(cb) = &self.on_failure {
            cb(self.id.clone(), err);
        }
    }

    /// Best-effort process kill; remote workers cannot be killed directly.
    pub async fn kill(&mut self) {
        if let WorkerProcess::Local(child) = &mut self.process {
            let _ = child.kill().await;
        }
    }

    /// Asks the heartbeat task to send a graceful `Shutdown` frame. Returns
    /// `false` (nothing sent) when this worker has no heartbeat link to ask
    /// — callers fall back to [`WorkerHandle::kill`] in that case.
    pub fn request_shutdown(&self) -> bool {
        match &self.shutdown_tx {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Mapping from worker id to worker record, owned and mutated only by the
/// master event loop.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<HashMap<WorkerId, WorkerHandle>>,
}

impl WorkerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, handle: WorkerHandle) {
        self.workers.lock().await.insert(handle.id.clone(), handle);
    }

    pub async fn remove(&self, id: &WorkerId) -> Option<WorkerHandle> {
        self.workers.lock().await.remove(id)
    }

    pub async fn address_of(&self, id: &WorkerId) -> Option<WorkerAddress> {
        self.workers.lock().await.get(id).map(|h| h.address.clone())
    }

    pub async fn ids(&self) -> Vec<WorkerId> {
        self.workers.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Kills and removes every registered worker — used when cascading a
    /// shutdown down the worker tree.
    pub async fn kill_all(&self) {
        let mut workers = self.workers.lock().await;
        for (_, mut handle) in workers.drain() {
            handle.kill().await;
        }
    }

    /// Sends SIGKILL directly to one worker's process (via
    /// [`tokio::process::Child::kill`]) without going through the graceful
    /// `shutdown_worker` handshake, and removes it from the registry
    /// immediately. Used to drive the literal "kill the process" scenario
    /// (§8 S3), where the intent is to observe the process die outright
    /// rather than wind down through its own heartbeat task.
    pub async fn kill(&self, id: &WorkerId) {
        if let Some(mut handle) = self.workers.lock().await.remove(id) {
            handle.kill().await;
        }
    }

    /// Marks a worker failed and fires its `on_failure` callback exactly
    /// once, removing it from the registry. Used by the parent-side
    /// heartbeat loop when a child's liveness link goes dead.
    pub async fn fail(&self, id: &WorkerId, err: parallel_core::ParallelError) {
        if let Some(handle) = self.workers.lock().await.remove(id) {
            handle.notify_failure(err);
        }
    }

    /// Master-initiated shutdown of one worker (§4.8 step 5, master side):
    /// asks its heartbeat task to send a graceful `Shutdown` frame if one
    /// exists, otherwise kills the process outright.
    ///
    /// A graceful request leaves the handle in place — the heartbeat task
    /// notices `DeathReason::ShutdownRequested` once the frame is sent and
    /// removes it itself, keeping removal on a single code path. A hard
    /// kill (no heartbeat link to ask) removes the handle immediately since
    /// nothing else will.
    pub async fn shutdown_worker(&self, id: &WorkerId) {
        let mut workers = self.workers.lock().await;
        let Some(handle) = workers.get_mut(id) else {
            return;
        };
        if handle.request_shutdown() {
            return;
        }
        if let Some(mut handle) = workers.remove(id) {
            handle.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parallel_core::ParallelError;
    use tokio::process::Command;

    use super::*;

    static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

    fn fresh_id() -> WorkerId {
        WorkerId(format!("worker-test-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed)))
    }

    /// A long-lived placeholder child so `WorkerHandle::kill` has a real
    /// process to act on, mirroring what a spawned worker looks like from
    /// the registry's point of view.
    async fn sleeper() -> Child {
        Command::new("sh")
            .arg("-c")
            .arg("sleep 30")
            .kill_on_drop(true)
            .spawn()
            .expect("sh should be spawnable")
    }

    fn address(port: u16) -> WorkerAddress {
        WorkerAddress::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn new_local_records_a_spawn_timestamp() {
        let handle = WorkerHandle::new_local(fresh_id(), address(9000), sleeper().await, LivenessFlag::new(), None, None);
        assert!(handle.spawned_at_ms > 0);
    }

    #[tokio::test]
    async fn insert_and_look_up_by_id() {
        let registry = WorkerRegistry::new();
        let id = fresh_id();
        let handle = WorkerHandle::new_local(id.clone(), address(9001), sleeper().await, LivenessFlag::new(), None, None);

        registry.insert(handle).await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.address_of(&id).await, Some(address(9001)));
        assert_eq!(registry.ids().await, vec![id]);
    }

    #[tokio::test]
    async fn remove_drops_the_handle() {
        let registry = WorkerRegistry::new();
        let id = fresh_id();
        let handle = WorkerHandle::new_local(id.clone(), address(9002), sleeper().await, LivenessFlag::new(), None, None);
        registry.insert(handle).await;

        let removed = registry.remove(&id).await;
        assert!(removed.is_some());
        assert_eq!(registry.len().await, 0);
        assert_eq!(registry.address_of(&id).await, None);
    }

    #[tokio::test]
    async fn kill_all_empties_the_registry() {
        let registry = WorkerRegistry::new();
        for port in [9003, 9004, 9005] {
            let id = fresh_id();
            let handle = WorkerHandle::new_local(id, address(port), sleeper().await, LivenessFlag::new(), None, None);
            registry.insert(handle).await;
        }
        assert_eq!(registry.len().await, 3);

        registry.kill_all().await;

        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn fail_invokes_the_callback_exactly_once_and_removes_the_handle() {
        let registry = WorkerRegistry::new();
        let id = fresh_id();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_cb = Arc::clone(&calls);
        let handle = WorkerHandle::new_local(
            id.clone(),
            address(9006),
            sleeper().await,
            LivenessFlag::new(),
            Some(Box::new(move |_id, _err| {
                calls_for_cb.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        );
        registry.insert(handle).await;

        registry.fail(&id, ParallelError::LateTaskFailure("boom".to_string())).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len().await, 0);

        // Failing an id that is no longer registered is a no-op, not a panic.
        registry.fail(&id, ParallelError::LateTaskFailure("boom again".to_string())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_worker_without_heartbeat_link_kills_and_removes() {
        let registry = WorkerRegistry::new();
        let id = fresh_id();
        let handle = WorkerHandle::new_local(id.clone(), address(9007), sleeper().await, LivenessFlag::new(), None, None);
        registry.insert(handle).await;

        registry.shutdown_worker(&id).await;

        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn shutdown_worker_with_heartbeat_link_sends_request_and_leaves_handle_in_place() {
        let registry = WorkerRegistry::new();
        let id = fresh_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle::new_local(id.clone(), address(9008), sleeper().await, LivenessFlag::new(), None, Some(tx));
        registry.insert(handle).await;

        registry.shutdown_worker(&id).await;

        assert!(rx.try_recv().is_ok(), "shutdown request should have been sent");
        assert_eq!(
            registry.len().await,
            1,
            "the heartbeat task, not shutdown_worker, removes the handle once the frame is sent"
        );
    }

    #[tokio::test]
    async fn request_shutdown_reports_whether_anything_was_listening() {
        let (tx, rx) = mpsc::unbounded_channel::<()>();
        drop(rx);

        let handle = WorkerHandle::new_local(fresh_id(), address(9009), sleeper().await, LivenessFlag::new(), None, Some(tx));
        assert!(!handle.request_shutdown(), "a dropped receiver means nothing was listening");
    }
}
