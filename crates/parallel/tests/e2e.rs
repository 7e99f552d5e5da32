//! Real-subprocess end-to-end scenarios: a single ping, a two-level worker
//! tree, a rejected binary-hash mismatch, and a connection-close drain.
//! Runs with `harness = false`: this file's `main` plays both roles of the
//! dual-role binary, the same way any application built on this crate
//! would — the worker branch is reached when this very test binary
//! re-execs itself with `PARALLEL_ROLE` set, exercising the real
//! worker-process bootstrap rather than an in-process stand-in.

use std::sync::Arc;
use std::time::Duration;

use parallel::{
    function, spawn_supervised, start_app, AppBuilder, Connection, HeartbeatPolicy, LateFailureSink, ParallelError,
    Runtime, SpawnEngine, SpawnOptions, SpawnTarget, WorkerServerBuilder,
};

/// Extra-env key this binary uses (outside the library) to tell a freshly
/// spawned worker which role it plays in the worker tree: a leaf ("ping" only)
/// or a primary that spawns its own secondaries in `init_worker_state`.
/// Not a library concept — just how this test's `main` branches on its
/// own config, the same way any consumer app would.
const TREE_ROLE_VAR: &str = "E2E_TREE_ROLE";
/// Test-only knob understood directly by the library: see
/// `parallel::spawn`'s handling of this same key name.
const CORRUPT_HASH_VAR: &str = "PARALLEL_TEST_CORRUPT_BINARY_HASH";
/// Test-only knob understood directly by the library: see
/// `parallel::spawn`'s handling of this same key name. A "submaster"
/// worker forwards whatever value it receives for this key into its own
/// leaf's `extra_env`, so the leaf — several re-execs removed from this
/// test's own process — still has somewhere to report its exit code.
const EXIT_REPORT_VAR: &str = "PARALLEL_TEST_EXIT_REPORT_PATH";

enum WorkerState {
    Leaf,
    Primary { secondaries: Vec<Connection> },
    /// Spawns exactly one leaf child and holds the connection open so the
    /// leaf isn't reaped when this worker's own `init_worker_state` returns.
    Submaster { _leaf: Connection },
}

struct ConnState;

fn server() -> AppBuilder<WorkerState, ConnState> {
    AppBuilder::new()
        .init_connection_state(|_conn_id: u64, _worker_state: Arc<WorkerState>| async move {
            Ok::<_, String>(ConnState)
        })
        .register(
            "ping",
            function(|_ws: Arc<WorkerState>, _cs: Arc<ConnState>, _late: LateFailureSink, _arg: ()| async move {
                Ok::<_, String>("pong".to_string())
            }),
        )
        .register(
            "ping_tree",
            function(|ws: Arc<WorkerState>, _cs: Arc<ConnState>, _late: LateFailureSink, _arg: ()| async move {
                let n = match ws.as_ref() {
                    WorkerState::Primary { secondaries } => secondaries.len(),
                    WorkerState::Leaf | WorkerState::Submaster { .. } => {
                        return Err("not a primary worker".to_string())
                    }
                };

                let mut tasks = tokio::task::JoinSet::new();
                for i in 0..n {
                    let ws = Arc::clone(&ws);
                    tasks.spawn(async move {
                        let secondaries = match ws.as_ref() {
                            WorkerState::Primary { secondaries } => secondaries,
                            WorkerState::Leaf | WorkerState::Submaster { .. } => unreachable!("checked above"),
                        };
                        let reply: String = secondaries[i].run("ping", &()).await?;
                        Ok::<(usize, String), ParallelError>((i, format!("Secondary worker #{i}: {reply}")))
                    });
                }

                let mut results = vec![String::new(); n];
                while let Some(joined) = tasks.join_next().await {
                    let (i, line) = joined.map_err(|e| e.to_string())?.map_err(|e| e.to_string())?;
                    results[i] = line;
                }
                Ok::<_, String>(results)
            }),
        )
}

async fn init_worker_state(engine: SpawnEngine) -> Result<WorkerState, String> {
    match std::env::var(TREE_ROLE_VAR).ok().as_deref() {
        Some("primary") => {
            let mut secondaries = Vec::with_capacity(3);
            for _ in 0..3 {
                let id = engine
                    .spawn(SpawnOptions {
                        target: SpawnTarget::Local,
                        extra_env: vec![(TREE_ROLE_VAR.to_string(), "secondary".to_string())],
                        heartbeat_policy: Some(HeartbeatPolicy::ConnectAndShutdownOnDisconnect {
                            interval: Duration::from_millis(100),
                            timeout: Duration::from_millis(500),
                        }),
                        ..Default::default()
                    })
                    .await
                    .map_err(|err| err.to_string())?;
                let address = engine
                    .registry()
                    .address_of(&id)
                    .await
                    .ok_or_else(|| "secondary missing from registry".to_string())?;
                let conn = Connection::open(&address, Duration::from_secs(5))
                    .await
                    .map_err(|err| err.to_string())?;
                secondaries.push(conn);
            }
            Ok(WorkerState::Primary { secondaries })
        }
        Some("submaster") => {
            let mut extra_env = vec![(TREE_ROLE_VAR.to_string(), "leaf".to_string())];
            if let Ok(report_path) = std::env::var(EXIT_REPORT_VAR) {
                extra_env.push((EXIT_REPORT_VAR.to_string(), report_path));
            }

            let id = engine
                .spawn(SpawnOptions {
                    target: SpawnTarget::Local,
                    extra_env,
                    heartbeat_policy: Some(HeartbeatPolicy::ConnectAndShutdownOnDisconnect {
                        interval: Duration::from_millis(50),
                        timeout: Duration::from_millis(200),
                    }),
                    ..Default::default()
                })
                .await
                .map_err(|err| err.to_string())?;
            let address = engine
                .registry()
                .address_of(&id)
                .await
                .ok_or_else(|| "leaf missing from registry".to_string())?;
            let leaf = Connection::open(&address, Duration::from_secs(5))
                .await
                .map_err(|err| err.to_string())?;
            Ok(WorkerState::Submaster { _leaf: leaf })
        }
        _ => Ok(WorkerState::Leaf),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let runtime = start_app(server(), init_worker_state)
        .await
        .expect("role detection / bootstrap failed");

    ping_roundtrip(&runtime).await;
    two_level_worker_tree(&runtime).await;
    binary_hash_mismatch_is_rejected(&runtime).await;
    connection_close_drains_state().await;
    killed_parent_causes_child_exit_within_one_second(&runtime).await;
    late_handler_failure_reaches_configured_sink().await;

    println!("e2e: all scenarios passed");
}

/// Master spawns one worker, calls `ping`, expects `"pong"`, then asks
/// the worker to shut down and expects it to leave the registry cleanly
/// (the worker side exits 0 from its own `run_worker` bootstrap).
async fn ping_roundtrip(runtime: &Runtime<WorkerState, ConnState>) {
    let call_timeout = Duration::from_secs(5);

    let worker_id = runtime
        .spawn(SpawnOptions {
            target: SpawnTarget::Local,
            heartbeat_policy: Some(HeartbeatPolicy::ConnectAndShutdownOnDisconnect {
                interval: Duration::from_millis(100),
                timeout: Duration::from_millis(500),
            }),
            ..Default::default()
        })
        .await
        .expect("spawn should succeed");

    let address = runtime
        .registry()
        .address_of(&worker_id)
        .await
        .expect("just-spawned worker is registered");

    let connection = Connection::open(&address, call_timeout).await.expect("connect should succeed");
    let reply: String = connection.run("ping", &()).await.expect("ping should succeed");
    assert_eq!(reply, "pong");
    connection.close(runtime.config().close_call_timeout).await;

    runtime.registry().shutdown_worker(&worker_id).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        runtime.registry().len().await,
        0,
        "a gracefully shut down worker should be removed from the registry"
    );
}

/// Master spawns 2 primary workers, each of which spawns 3 secondary
/// workers of its own from inside `init_worker_state` (exercising the
/// worker-side `SpawnEngine` handed to it by `start_app`). Calling
/// `ping_tree` on a primary fans out `ping` to all 3 secondaries in
/// parallel and returns one line per secondary.
async fn two_level_worker_tree(runtime: &Runtime<WorkerState, ConnState>) {
    let call_timeout = Duration::from_secs(5);
    let mut primary_ids = Vec::with_capacity(2);
    let mut primary_conns = Vec::with_capacity(2);

    for _ in 0..2 {
        let id = runtime
            .spawn(SpawnOptions {
                target: SpawnTarget::Local,
                extra_env: vec![(TREE_ROLE_VAR.to_string(), "primary".to_string())],
                heartbeat_policy: Some(HeartbeatPolicy::ConnectAndShutdownOnDisconnect {
                    interval: Duration::from_millis(100),
                    timeout: Duration::from_millis(500),
                }),
                ..Default::default()
            })
            .await
            .expect("primary spawn should succeed");
        let address = runtime
            .registry()
            .address_of(&id)
            .await
            .expect("primary is registered");
        let conn = Connection::open(&address, call_timeout).await.expect("connect to primary");
        primary_ids.push(id);
        primary_conns.push(conn);
    }

    assert_eq!(runtime.registry().len().await, 2, "both primaries should be live");

    for conn in &primary_conns {
        let lines: Vec<String> = conn.run("ping_tree", &()).await.expect("ping_tree should succeed");
        assert_eq!(
            lines,
            vec![
                "Secondary worker #0: pong".to_string(),
                "Secondary worker #1: pong".to_string(),
                "Secondary worker #2: pong".to_string(),
            ]
        );
    }

    for conn in primary_conns {
        conn.close(runtime.config().close_call_timeout).await;
    }
    for id in &primary_ids {
        runtime.registry().shutdown_worker(id).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        runtime.registry().len().await,
        0,
        "both primaries (and transitively their secondaries) should wind down"
    );
}

/// A worker that reports a binary hash differing from the master's is
/// rejected before it is ever installed in the registry, and the child
/// process is killed rather than left running.
async fn binary_hash_mismatch_is_rejected(runtime: &Runtime<WorkerState, ConnState>) {
    let err = runtime
        .spawn(SpawnOptions {
            target: SpawnTarget::Local,
            extra_env: vec![(CORRUPT_HASH_VAR.to_string(), "1".to_string())],
            ..Default::default()
        })
        .await
        .expect_err("a corrupted binary hash should fail the spawn");

    let message = err.to_string();
    assert!(
        message.contains("binary hash mismatch") || message.contains("BinaryMismatch"),
        "expected a binary-mismatch spawn failure, got: {message}"
    );
    assert_eq!(
        runtime.registry().len().await,
        0,
        "a handshake that fails verification must never reach the registry"
    );
}

/// Opening N connections concurrently runs `init_connection_state` N
/// times; `close_server` must drain every one of them (teardown hook
/// invoked exactly N times) before returning.
async fn connection_close_drains_state() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Ws;
    struct Cs;

    const N: usize = 100;
    let live = Arc::new(AtomicUsize::new(0));
    let teardown_calls = Arc::new(AtomicUsize::new(0));

    let live_for_open = Arc::clone(&live);
    let live_for_close = Arc::clone(&live);
    let teardown_for_close = Arc::clone(&teardown_calls);

    let builder = WorkerServerBuilder::<Ws, Cs>::new()
        .init_connection_state(move |_conn_id, _ws| {
            let live = Arc::clone(&live_for_open);
            async move {
                live.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(Cs)
            }
        })
        .on_connection_close(move |_ws, _cs| {
            let live = Arc::clone(&live_for_close);
            let teardown_calls = Arc::clone(&teardown_for_close);
            async move {
                live.fetch_sub(1, Ordering::SeqCst);
                teardown_calls.fetch_add(1, Ordering::SeqCst);
            }
        });

    let server = Arc::new(builder.bind(Arc::new(Ws)).await.expect("bind should succeed"));
    let address = server.local_addr();
    let _serve_handle = Arc::clone(&server).spawn_serve();

    let open_handles: Vec<_> = (0..N)
        .map(|_| {
            let address = address.clone();
            tokio::spawn(async move { Connection::open(&address, Duration::from_secs(5)).await.expect("connect") })
        })
        .collect();

    let mut connections = Vec::with_capacity(N);
    for handle in open_handles {
        connections.push(handle.await.expect("open task should not panic"));
    }

    assert_eq!(live.load(Ordering::SeqCst), N);

    Arc::clone(&server).close_server(Duration::from_secs(5)).await;

    assert_eq!(live.load(Ordering::SeqCst), 0);
    assert_eq!(teardown_calls.load(Ordering::SeqCst), N);

    drop(connections);
}

/// §8 S3: the master spawns a "submaster" worker, which spawns one leaf
/// worker of its own on a tight heartbeat. SIGKILLing the submaster
/// directly (bypassing its own graceful shutdown entirely) must cause the
/// leaf to lose its parent heartbeat and exit with `HEARTBEAT_LOST` inside
/// one second. The leaf is reparented once its real OS parent dies, so
/// nothing in this process can `wait()` on it directly — it self-reports
/// its exit code to a file instead, the same way `PARALLEL_TEST_CORRUPT_BINARY_HASH`
/// lets a test stage a handshake failure without needing a real divergent
/// binary on disk.
async fn killed_parent_causes_child_exit_within_one_second(runtime: &Runtime<WorkerState, ConnState>) {
    let report_path = std::env::temp_dir().join(format!("parallel-e2e-s3-{}-{}.exit", std::process::id(), line!()));
    let _ = std::fs::remove_file(&report_path);

    let submaster_id = runtime
        .spawn(SpawnOptions {
            target: SpawnTarget::Local,
            extra_env: vec![
                (TREE_ROLE_VAR.to_string(), "submaster".to_string()),
                (EXIT_REPORT_VAR.to_string(), report_path.display().to_string()),
            ],
            heartbeat_policy: Some(HeartbeatPolicy::ConnectAndShutdownOnDisconnect {
                interval: Duration::from_millis(100),
                timeout: Duration::from_millis(500),
            }),
            ..Default::default()
        })
        .await
        .expect("submaster spawn should succeed");

    // Give the submaster time to spawn its own leaf and complete the
    // leaf's reverse handshake before we kill it out from under the leaf.
    tokio::time::sleep(Duration::from_millis(500)).await;

    runtime.registry().kill(&submaster_id).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    let reported = loop {
        if let Ok(contents) = std::fs::read_to_string(&report_path) {
            break Some(contents);
        }
        if tokio::time::Instant::now() >= deadline {
            break None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let _ = std::fs::remove_file(&report_path);

    let contents = reported.expect("leaf should report its exit code within one second of the submaster dying");
    assert_eq!(
        contents.trim(),
        parallel::exit_code::HEARTBEAT_LOST.to_string(),
        "leaf should exit with HEARTBEAT_LOST once its parent's heartbeat link dies"
    );
}

/// §8 S5: a handler's own result is unaffected by a background task it
/// spawned, but that task's later panic is reported to the worker's
/// configured `LateFailureSink` instead of vanishing silently. Driven
/// through a real registered RPC handler and `Connection::run`, not a
/// hand-fabricated `Ok`/`Err` pair.
async fn late_handler_failure_reaches_configured_sink() {
    struct Ws;
    struct Cs;

    let (sink, mut receiver) = LateFailureSink::new();

    let builder = WorkerServerBuilder::<Ws, Cs>::new()
        .init_connection_state(|_conn_id, _ws| async move { Ok::<_, String>(Cs) })
        .late_failure_sink(sink)
        .register(
            "trigger_late_failure",
            function(|_ws: Arc<Ws>, _cs: Arc<Cs>, late: LateFailureSink, _arg: ()| async move {
                spawn_supervised("e2e-late-failure", late, async move {
                    panic!("late boom");
                    #[allow(unreachable_code)]
                    Ok::<(), String>(())
                });
                Ok::<_, String>(())
            }),
        );

    let server = Arc::new(builder.bind(Arc::new(Ws)).await.expect("bind should succeed"));
    let address = server.local_addr();
    let _serve_handle = Arc::clone(&server).spawn_serve();

    let connection = Connection::open(&address, Duration::from_secs(5)).await.expect("connect should succeed");
    let (): () = connection
        .run("trigger_late_failure", &())
        .await
        .expect("handler result is unaffected by its own background work");

    let failure = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
        .await
        .expect("sink should receive the failure promptly")
        .expect("sink should receive exactly one failure");
    assert_eq!(failure.context, "e2e-late-failure");
    assert!(failure.message.contains("late boom"));

    connection.close(Duration::from_secs(5)).await;
    Arc::clone(&server).close_server(Duration::from_secs(5)).await;
}
