//! Minimal end-to-end demo of the parallel runtime: a master spawns one
//! worker, calls its `ping` RPC, then shuts it down gracefully.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parallel::{
    function, start_app, AppBuilder, Connection, HeartbeatPolicy, LateFailureSink, SpawnOptions, SpawnTarget,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(about = "Spawns one worker and calls its ping RPC")]
struct Args {
    /// How long to wait for the reverse handshake and the ping response.
    #[arg(long, default_value = "5")]
    timeout_secs: u64,
}

struct WorkerState;
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
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    let runtime = start_app(server(), |_spawn_engine| async { Ok(WorkerState) })
        .await
        .expect("role detection / bootstrap failed");

    let timeout = Duration::from_secs(args.timeout_secs);

    let worker_id = runtime
        .spawn(SpawnOptions {
            target: SpawnTarget::Local,
            heartbeat_policy: Some(HeartbeatPolicy::ConnectAndShutdownOnDisconnect {
                interval: Duration::from_millis(200),
                timeout: Duration::from_secs(2),
            }),
            on_failure: Some(Box::new(|id, err| {
                tracing::error!(worker_id = %id, %err, "worker failed");
            })),
            ..Default::default()
        })
        .await
        .expect("spawn failed");

    let address = runtime
        .registry()
        .address_of(&worker_id)
        .await
        .expect("just-spawned worker is in the registry");

    let connection = Connection::open(&address, timeout).await.expect("connect failed");
    let reply: String = connection.run("ping", &()).await.expect("ping failed");
    info!(%reply, "worker replied");
    assert_eq!(reply, "pong");

    connection.close(runtime.config().close_call_timeout).await;
    runtime.registry().shutdown_worker(&worker_id).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
}
