//! Spawn Engine (§4.4): launches workers (master side) and runs the
//! reverse-handshake/heartbeat bootstrap a freshly-exec'd worker performs
//! before entering its server loop (worker side).

use std::path::PathBuf;
use std::process::Stdio as StdStdio;
use std::sync::Arc;
use std::time::Duration;

use parallel_core::{ParallelError, SpawnFailureReason, WorkerAddress, WorkerId};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::binary_identity;
use crate::config::RuntimeConfig;
use crate::env_builder::{ChildEnvSpec, build_child_env};
use crate::heartbeat::{self, DeathReason, HeartbeatPolicy, LivenessFlag};
use crate::registry::{WorkerHandle, WorkerRegistry};
use crate::worker_server::WorkerServerBuilder;

/// Machine-matchable rejection reasons sent on the handshake Ack, so the
/// worker side can pick the right exit code (§6) without guessing from
/// free text.
const REJECT_COOKIE_MISMATCH: &str = "cookie_mismatch";
const REJECT_BINARY_MISMATCH: &str = "binary_mismatch";

/// Test-only extra-env key a spawn can set to make the worker report a
/// deliberately wrong binary hash at handshake time (§8 S4). Not a
/// reserved key — it travels through `extra_env` like any caller-chosen
/// variable and is otherwise inert.
const TEST_CORRUPT_BINARY_HASH_VAR: &str = "PARALLEL_TEST_CORRUPT_BINARY_HASH";

/// Test-only extra-env key naming a file a worker writes its exit code to
/// just before it calls `std::process::exit` (§8 S3). A worker whose OS
/// parent was killed directly is reparented before it ever exits, so
/// nothing in the test process can `wait()` on it; this gives integration
/// tests an observable, polled alternative. Never read outside tests.
const TEST_EXIT_REPORT_PATH_VAR: &str = "PARALLEL_TEST_EXIT_REPORT_PATH";

/// Exit codes a worker process terminates with (§6).
pub mod exit_code {
    pub const CLEAN: i32 = 0;
    pub const HANDSHAKE_FAILURE: i32 = 1;
    pub const HEARTBEAT_LOST: i32 = 2;
    pub const BINARY_MISMATCH: i32 = 3;
    pub const UNCAUGHT_EXCEPTION: i32 = 125;
}

/// Where a worker process runs.
#[derive(Debug, Clone)]
pub enum SpawnTarget {
    /// Re-exec the current binary locally (fork/exec semantics).
    Local,
    /// Run a shell command on a remote host, typically `ssh host -- ...`.
    /// Environment is passed inline as `KEY=VALUE` assignments prefixed to
    /// the command, since a remote shell does not forward a local
    /// process's env-setting API.
    RemoteShell { command: String },
}

/// Fd redirection a spawned child's stdout/stderr is mapped to (§6).
#[derive(Debug, Clone)]
pub enum StdioRedirect {
    DevNull,
    FileAppend(PathBuf),
    FileTruncate(PathBuf),
}

impl StdioRedirect {
    fn to_std_stdio(&self) -> Result<StdStdio, ParallelError> {
        match self {
            StdioRedirect::DevNull => Ok(StdStdio::null()),
            StdioRedirect::FileAppend(path) => std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map(StdStdio::from)
                .map_err(|err| ParallelError::SpawnFailed(SpawnFailureReason::Io(err.to_string()))),
            StdioRedirect::FileTruncate(path) => std::fs::File::create(path)
                .map(StdStdio::from)
                .map_err(|err| ParallelError::SpawnFailed(SpawnFailureReason::Io(err.to_string()))),
        }
    }

    /// Renders the remote-shell equivalent of this redirection, e.g.
    /// `1> /dev/null`, `1>> out.log`, or `1> out.log`. `fd` is the bare fd
    /// digit (`"1"`/`"2"`) — the operator (`>`/`>>`) is part of each
    /// variant's own rendering rather than the caller's, so the two never
    /// get composed into the invalid `1> >> path`.
    fn to_shell_suffix(&self, fd: &str) -> String {
        match self {
            StdioRedirect::DevNull => format!("{fd}> /dev/null"),
            StdioRedirect::FileAppend(path) => format!("{fd}>> {}", path.display()),
            StdioRedirect::FileTruncate(path) => format!("{fd}> {}", path.display()),
        }
    }
}

/// Inputs to one spawn call.
pub struct SpawnOptions {
    pub target: SpawnTarget,
    pub stdout: StdioRedirect,
    pub stderr: StdioRedirect,
    pub extra_env: Vec<(String, String)>,
    /// `None` resolves to `ConnectAndShutdownOnDisconnect` using the
    /// spawning runtime's `RuntimeConfig::heartbeat_interval`/
    /// `heartbeat_timeout`, so a caller that wants the configured default
    /// doesn't have to read those fields back out of `RuntimeConfig` itself.
    pub heartbeat_policy: Option<HeartbeatPolicy>,
    pub on_failure: Option<Box<dyn Fn(WorkerId, ParallelError) + Send + Sync>>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            target: SpawnTarget::Local,
            stdout: StdioRedirect::DevNull,
            stderr: StdioRedirect::DevNull,
            extra_env: Vec::new(),
            heartbeat_policy: None,
            on_failure: None,
        }
    }
}

/// Master-side launcher: allocates ids, builds child environments, starts
/// the child process, and waits for its reverse handshake.
pub struct SpawnEngine {
    registry: Arc<WorkerRegistry>,
    id_alloc: parallel_core::WorkerIdAllocator,
    config: RuntimeConfig,
}

impl SpawnEngine {
    pub fn new(registry: Arc<WorkerRegistry>, config: RuntimeConfig) -> Self {
        Self {
            registry,
            id_alloc: parallel_core::WorkerIdAllocator::new(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Runs the full master-side protocol (§4.4).
    pub async fn spawn(&self, options: SpawnOptions) -> Result<WorkerId, ParallelError> {
        let id = self.id_alloc.allocate();

        let heartbeat_policy = options.heartbeat_policy.unwrap_or(HeartbeatPolicy::ConnectAndShutdownOnDisconnect {
            interval: self.config.heartbeat_interval,
            timeout: self.config.heartbeat_timeout,
        });

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|err| ParallelError::SpawnFailed(SpawnFailureReason::Io(err.to_string())))?;
        let parent_addr = WorkerAddress::from(
            listener
                .local_addr()
                .map_err(|err| ParallelError::SpawnFailed(SpawnFailureReason::Io(err.to_string())))?,
        );

        let cookie = generate_cookie();
        let expected_hash_hex = binary_identity::hash_hex()?;

        let env_spec = ChildEnvSpec {
            worker_id: &id,
            parent_addr: &parent_addr,
            cookie: &cookie,
            binary_md5_hex: &expected_hash_hex,
            heartbeat_policy: &heartbeat_policy,
            extra: &options.extra_env,
        };
        let env_pairs = build_child_env(&env_spec)?;

        let mut child = self.launch(&options, &env_pairs)?;

        let accept_result = tokio::select! {
            biased;
            status = child.wait() => {
                let status = status.map_err(|err| ParallelError::SpawnFailed(SpawnFailureReason::Io(err.to_string())))?;
                return Err(ParallelError::SpawnFailed(SpawnFailureReason::ChildExited { status: status.code() }));
            }
            accepted = timeout(self.config.spawn_timeout, listener.accept()) => accepted,
        };

        let (stream, _) = match accept_result {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(err)) => {
                let _ = child.start_kill();
                return Err(ParallelError::SpawnFailed(SpawnFailureReason::Io(err.to_string())));
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(ParallelError::SpawnFailed(SpawnFailureReason::HandshakeTimeout));
            }
        };

        let mut handshake_client = parallel_rpc::RpcClient::new(stream);
        let frame: parallel_proto::HandshakeFrame = match handshake_client.recv().await {
            Ok(frame) => frame,
            Err(err) => {
                let _ = child.start_kill();
                return Err(ParallelError::SpawnFailed(SpawnFailureReason::Io(err.to_string())));
            }
        };

        if frame.cookie != cookie {
            let ack = parallel_proto::HandshakeAck::Rejected {
                reason: REJECT_COOKIE_MISMATCH.to_string(),
            };
            let _ = handshake_client.send(&ack).await;
            let _ = child.start_kill();
            return Err(ParallelError::SpawnFailed(SpawnFailureReason::CookieMismatch));
        }

        if !self.config.skip_binary_check {
            let actual_hash_hex = hex::encode(frame.binary_md5);
            if actual_hash_hex != expected_hash_hex {
                let ack = parallel_proto::HandshakeAck::Rejected {
                    reason: REJECT_BINARY_MISMATCH.to_string(),
                };
                let _ = handshake_client.send(&ack).await;
                let _ = child.start_kill();
                return Err(ParallelError::SpawnFailed(SpawnFailureReason::BinaryMismatch {
                    expected: expected_hash_hex,
                    actual: actual_hash_hex,
                }));
            }
        }

        handshake_client
            .send(&parallel_proto::HandshakeAck::Accepted)
            .await
            .map_err(|err| ParallelError::SpawnFailed(SpawnFailureReason::Io(err.to_string())))?;

        let address = WorkerAddress::new(frame.host.clone(), frame.port);
        let liveness = LivenessFlag::new();

        let shutdown_tx = if let HeartbeatPolicy::ConnectAndShutdownOnDisconnect { interval, timeout: timeout_dur } =
            heartbeat_policy
        {
            let (tx, rx) = mpsc::unbounded_channel();
            self.spawn_parent_heartbeat(
                id.clone(),
                handshake_client.into_inner(),
                interval,
                timeout_dur,
                Arc::clone(&liveness),
                rx,
            );
            Some(tx)
        } else {
            None
        };

        let on_failure = options.on_failure;
        let handle = WorkerHandle::new_local(id.clone(), address, child, liveness, on_failure, shutdown_tx);
        let spawned_at_ms = handle.spawned_at_ms;
        self.registry.insert(handle).await;

        info!(worker_id = %id, host = %frame.host, port = frame.port, spawned_at_ms, "worker spawned");
        Ok(id)
    }

    fn launch(&self, options: &SpawnOptions, env_pairs: &[(String, String)]) -> Result<tokio::process::Child, ParallelError> {
        match &options.target {
            SpawnTarget::Local => {
                let exe = binary_identity::locate()?;
                let mut command = Command::new(exe);
                command.envs(env_pairs.iter().map(|(k, v)| (k.clone(), v.clone())));
                command.stdout(options.stdout.to_std_stdio()?);
                command.stderr(options.stderr.to_std_stdio()?);
                command
                    .spawn()
                    .map_err(|err| ParallelError::SpawnFailed(SpawnFailureReason::Io(err.to_string())))
            }
            SpawnTarget::RemoteShell { command: remote_command } => {
                let env_prefix: String = env_pairs
                    .iter()
                    .map(|(k, v)| format!("{k}={}", shell_quote(v)))
                    .collect::<Vec<_>>()
                    .join(" ");
                let stdout_suffix = options.stdout.to_shell_suffix("1");
                let stderr_suffix = options.stderr.to_shell_suffix("2");
                let full_command = format!("{env_prefix} {remote_command} {stdout_suffix} {stderr_suffix}");

                let mut command = Command::new("sh");
                command.arg("-c").arg(full_command);
                command
                    .spawn()
                    .map_err(|err| ParallelError::SpawnFailed(SpawnFailureReason::Io(err.to_string())))
            }
        }
    }

    /// Runs the parent-side heartbeat loop against a spawned child. A
    /// `ShutdownRequested` death (this process asked the worker to stop via
    /// `WorkerRegistry::shutdown_worker`) is a clean removal; any other
    /// death marks the registry entry failed with `HeartbeatLost` (§4.7
    /// "Policy modes (parent side)").
    fn spawn_parent_heartbeat(
        &self,
        id: WorkerId,
        stream: TcpStream,
        interval: Duration,
        timeout_dur: Duration,
        liveness: Arc<LivenessFlag>,
        shutdown_rx: mpsc::UnboundedReceiver<()>,
    ) {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            heartbeat::run(stream, interval, timeout_dur, Arc::clone(&liveness), Some(shutdown_rx)).await;
            match liveness.death_reason() {
                Some(DeathReason::ShutdownRequested) => {
                    info!(worker_id = %id, "worker shut down gracefully");
                    registry.remove(&id).await;
                }
                reason => {
                    warn!(worker_id = %id, ?reason, "parent lost heartbeat with worker");
                    registry.fail(&id, ParallelError::HeartbeatLost).await;
                }
            }
        });
    }
}

fn generate_cookie() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..20).map(|_| rng.sample(Alphanumeric) as char).collect();
    format!("cookie-{}-{suffix}", std::process::id())
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn heartbeat_policy_from_env(pairs: &std::collections::HashMap<String, String>) -> HeartbeatPolicy {
    use parallel_core::env::{PARALLEL_HEARTBEAT_INTERVAL_MS_VAR, PARALLEL_HEARTBEAT_TIMEOUT_MS_VAR};

    let interval_ms = pairs.get(PARALLEL_HEARTBEAT_INTERVAL_MS_VAR).and_then(|v| v.parse::<u64>().ok());
    let timeout_ms = pairs.get(PARALLEL_HEARTBEAT_TIMEOUT_MS_VAR).and_then(|v| v.parse::<u64>().ok());

    match (interval_ms, timeout_ms) {
        (Some(interval), Some(timeout_ms)) => HeartbeatPolicy::ConnectAndShutdownOnDisconnect {
            interval: Duration::from_millis(interval),
            timeout: Duration::from_millis(timeout_ms),
        },
        _ => HeartbeatPolicy::Optional,
    }
}

/// Worker-side bootstrap (§4.4 "Protocol (worker side)"). Never returns —
/// the calling process always ends via `std::process::exit` with one of
/// the codes in [`exit_code`], matching the Role Detector's contract that
/// workers do not return from the library entrypoint.
pub async fn run_worker<WS, CS, FInit, FutInit>(
    id: WorkerId,
    config: RuntimeConfig,
    builder: WorkerServerBuilder<WS, CS>,
    init_worker_state: FInit,
) -> !
where
    WS: Send + Sync + 'static,
    CS: Send + Sync + 'static,
    FInit: FnOnce(SpawnEngine) -> FutInit + Send + 'static,
    FutInit: std::future::Future<Output = Result<WS, String>> + Send + 'static,
{
    use parallel_core::env::{PARALLEL_PARENT_ADDR_VAR, PARALLEL_PARENT_COOKIE_VAR};
    use parallel_proto::{HandshakeAck, HandshakeFrame};

    let pairs: std::collections::HashMap<String, String> = std::env::vars().collect();
    let report_path: Option<PathBuf> = pairs.get(TEST_EXIT_REPORT_PATH_VAR).map(PathBuf::from);

    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, "worker failed to bind its RPC listener");
            exit_worker(exit_code::HANDSHAKE_FAILURE, report_path.as_deref());
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(error = %err, "worker failed to read its own listener address");
            exit_worker(exit_code::HANDSHAKE_FAILURE, report_path.as_deref());
        }
    };

    let parent_addr: WorkerAddress = match pairs
        .get(PARALLEL_PARENT_ADDR_VAR)
        .and_then(|s| s.parse().ok())
    {
        Some(addr) => addr,
        None => {
            tracing::error!("missing or invalid {PARALLEL_PARENT_ADDR_VAR}");
            exit_worker(exit_code::HANDSHAKE_FAILURE, report_path.as_deref());
        }
    };
    let parent_cookie = match pairs.get(PARALLEL_PARENT_COOKIE_VAR) {
        Some(cookie) => cookie.clone(),
        None => {
            tracing::error!("missing {PARALLEL_PARENT_COOKIE_VAR}");
            exit_worker(exit_code::HANDSHAKE_FAILURE, report_path.as_deref());
        }
    };

    let stream = match TcpStream::connect(parent_addr.to_string()).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(error = %err, %parent_addr, "worker failed to dial its parent");
            exit_worker(exit_code::HANDSHAKE_FAILURE, report_path.as_deref());
        }
    };

    let own_hash = match binary_identity::hash() {
        Ok(hash) => hash,
        Err(err) => {
            tracing::error!(error = %err, "worker failed to hash its own binary");
            exit_worker(exit_code::HANDSHAKE_FAILURE, report_path.as_deref());
        }
    };

    if !config.skip_binary_check {
        if let Some(parent_hash_hex) = pairs.get(parallel_core::env::PARALLEL_BINARY_MD5_VAR) {
            match binary_identity::parse_hash_hex(parent_hash_hex) {
                Ok(parent_hash) if parent_hash != own_hash => {
                    tracing::error!("own binary hash differs from the parent's, refusing to dial back");
                    exit_worker(exit_code::BINARY_MISMATCH, report_path.as_deref());
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "could not parse parent's binary hash");
                    exit_worker(exit_code::HANDSHAKE_FAILURE, report_path.as_deref());
                }
            }
        }
    }

    // Test-only knob (§8 S4): lets integration tests stage a handshake
    // where the reported hash differs from the master's without needing
    // two actually-different binaries on disk. Never read outside tests.
    let reported_hash = if pairs.contains_key(TEST_CORRUPT_BINARY_HASH_VAR) {
        let mut corrupted = own_hash;
        corrupted[0] ^= 0xff;
        corrupted
    } else {
        own_hash
    };

    let mut handshake_client = parallel_rpc::RpcClient::new(stream);
    let frame = HandshakeFrame {
        worker_id: id.clone(),
        host: local_addr.ip().to_string(),
        port: local_addr.port(),
        binary_md5: reported_hash,
        cookie: parent_cookie,
    };
    if handshake_client.send(&frame).await.is_err() {
        tracing::error!("worker failed to send its reverse-handshake frame");
        exit_worker(exit_code::HANDSHAKE_FAILURE, report_path.as_deref());
    }

    let ack: HandshakeAck = match handshake_client.recv().await {
        Ok(ack) => ack,
        Err(err) => {
            tracing::error!(error = %err, "worker failed to read handshake ack");
            exit_worker(exit_code::HANDSHAKE_FAILURE, report_path.as_deref());
        }
    };

    match ack {
        HandshakeAck::Accepted => {}
        HandshakeAck::Rejected { reason } if reason == REJECT_BINARY_MISMATCH => {
            tracing::error!("parent rejected handshake: binary mismatch");
            exit_worker(exit_code::BINARY_MISMATCH, report_path.as_deref());
        }
        HandshakeAck::Rejected { reason } => {
            tracing::error!(%reason, "parent rejected handshake");
            exit_worker(exit_code::HANDSHAKE_FAILURE, report_path.as_deref());
        }
    }

    let heartbeat_policy = heartbeat_policy_from_env(&pairs);
    let liveness = LivenessFlag::new();
    let heartbeat_stream = handshake_client.into_inner();

    if let Err(heartbeat::HeartbeatError::NoParent) =
        heartbeat::spawn_if_configured(heartbeat_policy, heartbeat_stream, Arc::clone(&liveness))
    {
        tracing::debug!("worker has no heartbeat-monitored parent, liveness is unmonitored");
    }

    // A worker is itself a valid spawner: it gets its own registry and
    // `SpawnEngine` so `init_worker_state` can grow its own subtree of
    // children (§2 "workers may themselves spawn further workers"). This
    // mirrors exactly what `start_app`'s master branch hands back as
    // `Runtime::spawn` — the only difference is who holds the handle.
    let own_children = WorkerRegistry::new();
    let child_spawn_engine = SpawnEngine::new(Arc::clone(&own_children), config.clone());

    let worker_state = match init_worker_state(child_spawn_engine).await {
        Ok(state) => Arc::new(state),
        Err(message) => {
            tracing::error!(%message, "init_worker_state failed");
            own_children.kill_all().await;
            exit_worker(exit_code::UNCAUGHT_EXCEPTION, report_path.as_deref());
        }
    };

    let server = Arc::new(builder.finish(listener, worker_state));
    let serve_handle = Arc::clone(&server).spawn_serve();

    if matches!(heartbeat_policy, HeartbeatPolicy::ConnectAndShutdownOnDisconnect { .. }) {
        liveness.wait_dead().await;
        let reason = liveness.death_reason();
        tracing::warn!(?reason, "worker lost heartbeat with parent, shutting down");
        Arc::clone(&server).close_server(config.close_grace_period).await;
        serve_handle.abort();
        own_children.kill_all().await;
        let code = match reason {
            Some(DeathReason::ShutdownRequested) => exit_code::CLEAN,
            _ => exit_code::HEARTBEAT_LOST,
        };
        exit_worker(code, report_path.as_deref());
    }

    let _ = serve_handle.await;
    own_children.kill_all().await;
    exit_worker(exit_code::CLEAN, report_path.as_deref());
}

/// Exits the worker process, first writing its exit code to
/// `report_path` if the test harness asked for one (§8 S3). Every
/// worker-side exit in `run_worker` funnels through here so the reporting
/// is never accidentally skipped on one branch.
fn exit_worker(code: i32, report_path: Option<&std::path::Path>) -> ! {
    if let Some(path) = report_path {
        let _ = std::fs::write(path, code.to_string());
    }
    std::process::exit(code);
}
