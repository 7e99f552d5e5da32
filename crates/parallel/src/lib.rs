//! Parallel distributed computation across OS processes.
//!
//! A master process spawns worker processes — locally via re-exec, or on a
//! remote host via a shell command — each hosting a typed set of RPC
//! functions against per-worker and per-connection state. Workers may spawn
//! further workers, forming an arbitrary tree whose liveness is tied to
//! parents through a heartbeat protocol.
//!
//! The same binary plays both roles: [`start_app`] inspects the process
//! environment once, at startup, and either hands control back to the
//! caller as a [`Runtime`] (master) or bootstraps the worker-side protocol
//! and never returns (worker).

pub mod binary_identity;
pub mod config;
pub mod connection;
pub mod env_builder;
pub mod function;
pub mod heartbeat;
pub mod registry;
pub mod role;
pub mod spawn;
pub mod supervise;
pub mod worker_server;

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

pub use config::RuntimeConfig;
pub use connection::{Connection, SharedConnection};
pub use function::{function, TypedFunction};
pub use heartbeat::{DeathReason, HeartbeatPolicy};
pub use parallel_core::{MethodId, ParallelError, WorkerAddress, WorkerId};
pub use registry::{WorkerHandle, WorkerRegistry};
pub use role::Role;
pub use spawn::{exit_code, SpawnEngine, SpawnOptions, SpawnTarget, StdioRedirect};
pub use supervise::{join_supervised, spawn_supervised, try_within, LateFailureSink, LateFailureReceiver, LateTaskFailure};
pub use worker_server::{InternalConnectionState, WorkerServer, WorkerServerBuilder};

/// Registers everything a worker process needs before it can bootstrap:
/// the typed-function table plus the per-connection lifecycle callbacks.
/// Built once, the same way on every process regardless of role, since a
/// master may itself be spawned as a worker further up the tree.
pub type AppBuilder<WS, CS> = WorkerServerBuilder<WS, CS>;

/// What a process is handed back after [`start_app`] classifies its role.
/// Only the master branch ever produces one of these — the worker branch
/// bootstraps and diverges inside `start_app` itself.
pub struct Runtime<WS, CS> {
    spawn_engine: SpawnEngine,
    config: RuntimeConfig,
    _server_shape: PhantomData<fn() -> (WS, CS)>,
}

impl<WS, CS> Runtime<WS, CS>
where
    WS: Send + Sync + 'static,
    CS: Send + Sync + 'static,
{
    /// Spawns a worker and waits for its reverse handshake to complete.
    pub async fn spawn(&self, options: SpawnOptions) -> Result<WorkerId, ParallelError> {
        self.spawn_engine.spawn(options).await
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        self.spawn_engine.registry()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

/// Classifies the current process and either returns a master [`Runtime`]
/// or bootstraps the worker-side protocol and never returns.
///
/// `server` registers the RPC surface and connection-lifecycle callbacks a
/// *worker* incarnation of this binary serves; `init_worker_state` builds
/// that worker's `WorkerState` once, after the handshake and heartbeat are
/// already underway. A master never calls either — they are only consulted
/// on the branch where the Role Detector classifies this process as a
/// worker — but both are required up front since a single binary plays
/// either role depending on how it was launched.
///
/// `init_worker_state` is handed a [`SpawnEngine`] of its own: a worker is
/// a valid spawner just like a master is, so it can grow its own subtree
/// of children (§2) by storing the engine in its `WorkerState` and calling
/// `spawn` from inside an RPC handler.
pub async fn start_app<WS, CS, FInit, FutInit>(
    server: AppBuilder<WS, CS>,
    init_worker_state: FInit,
) -> Result<Runtime<WS, CS>, ParallelError>
where
    WS: Send + Sync + 'static,
    CS: Send + Sync + 'static,
    FInit: FnOnce(SpawnEngine) -> FutInit + Send + 'static,
    FutInit: Future<Output = Result<WS, String>> + Send + 'static,
{
    let _ = tracing_subscriber::fmt().with_target(false).try_init();

    let config = RuntimeConfig::from_env();

    match Role::detect()? {
        Role::Master => Ok(Runtime {
            spawn_engine: SpawnEngine::new(WorkerRegistry::new(), config.clone()),
            config,
            _server_shape: PhantomData,
        }),
        Role::Worker(id) => spawn::run_worker(id, config, server, init_worker_state).await,
    }
}
