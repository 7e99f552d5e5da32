//! Worker Server (§4.6) and Shutdown Cascade (§4.8).
//!
//! Accepts connections, runs `init_connection_state` before any caller
//! sees a connection, dispatches requests to the registered
//! [`TypedFunction`] table, and — on `close_server` — drains every live
//! connection's state before releasing the worker's own state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parallel_core::{MethodId, OnceSlot, RpcErrorKind, RpcErrorPayload, WorkerAddress};
use parallel_proto::{ConnectionOpen, ConnectionOpenAck, PROTOCOL_VERSION, RpcRequest, RpcResponse, RpcResponseBody};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::function::{BoxFuture, TypedFunction};
use crate::supervise::{join_supervised, try_within, LateFailureSink};

pub type InitConnectionState<WS, CS> =
    Arc<dyn Fn(u64, Arc<WS>) -> BoxFuture<'static, Result<CS, String>> + Send + Sync>;
pub type OnConnectionClose<WS, CS> = Arc<dyn Fn(Arc<WS>, Arc<CS>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runtime bookkeeping attached to one live connection.
///
/// `state` is the write-once slot holding the connection's
/// [`crate::function`]-visible `CS` value: set exactly once, right after
/// `init_connection_state` returns and before the `Ready` ack is sent, so
/// by construction no handler ever observes it unset.
pub struct InternalConnectionState<CS> {
    pub conn_id: u64,
    pub state: OnceSlot<Arc<CS>>,
    pub server_port: u16,
}

/// Accumulates the pieces a worker registers during bootstrap, before the
/// server starts accepting (§4.6 "Registration API").
pub struct WorkerServerBuilder<WS, CS> {
    functions: HashMap<MethodId, Arc<dyn TypedFunction<WS, CS>>>,
    init_connection_state: Option<InitConnectionState<WS, CS>>,
    on_connection_close: Option<OnConnectionClose<WS, CS>>,
    late_failure_sink: Option<LateFailureSink>,
}

impl<WS, CS> Default for WorkerServerBuilder<WS, CS> {
    fn default() -> Self {
        Self {
            functions: HashMap::new(),
            init_connection_state: None,
            on_connection_close: None,
            late_failure_sink: None,
        }
    }
}

impl<WS, CS> WorkerServerBuilder<WS, CS>
where
    WS: Send + Sync + 'static,
    CS: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed RPC under `id`. Re-registering the same id
    /// replaces the previous handler (last registration wins), matching
    /// how a `HashMap::insert` behaves — there is no ordering dependency
    /// between registrations at bootstrap time.
    pub fn register(mut self, id: impl Into<MethodId>, handler: Arc<dyn TypedFunction<WS, CS>>) -> Self {
        self.functions.insert(id.into(), handler);
        self
    }

    pub fn init_connection_state<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u64, Arc<WS>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<CS, String>> + Send + 'static,
    {
        self.init_connection_state = Some(Arc::new(move |id, ws| Box::pin(f(id, ws))));
        self
    }

    pub fn on_connection_close<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<WS>, Arc<CS>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_connection_close = Some(Arc::new(move |ws, cs| Box::pin(f(ws, cs))));
        self
    }

    /// Supplies the [`LateFailureSink`] (§4.9) handed to every RPC handler
    /// this worker dispatches to. The matching [`crate::supervise::LateFailureReceiver`]
    /// stays with the caller, who decides how to monitor it. If never set,
    /// `finish`/`bind` build a sink of their own and log every failure that
    /// arrives on it instead of leaving background-task panics unobserved.
    pub fn late_failure_sink(mut self, sink: LateFailureSink) -> Self {
        self.late_failure_sink = Some(sink);
        self
    }

    /// Binds an ephemeral TCP listener and returns a not-yet-accepting
    /// server, ready to have its address published in the reverse
    /// handshake before `serve` is called.
    ///
    /// # Panics
    ///
    /// Panics if `init_connection_state` was never set — every worker has
    /// per-connection state of some shape, even if it is `()`, and a
    /// missing callback is a bootstrap programming error rather than a
    /// recoverable runtime condition (§7's "invariant violations... raised
    /// to the supervising monitor").
    pub async fn bind(self, worker_state: Arc<WS>) -> std::io::Result<WorkerServer<WS, CS>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(self.finish(listener, worker_state))
    }

    /// Attaches an already-bound listener and `worker_state` to produce the
    /// finished server. Split out from `bind` so a worker can publish its
    /// listener's address in the reverse handshake *before* `worker_state`
    /// exists — `init_worker_state` only runs after the handshake and
    /// heartbeat are already underway (§4.4 worker-side steps 2-7).
    ///
    /// # Panics
    ///
    /// Same as `bind`: `init_connection_state` must already be registered.
    pub fn finish(self, listener: TcpListener, worker_state: Arc<WS>) -> WorkerServer<WS, CS> {
        let init_connection_state = self
            .init_connection_state
            .expect("WorkerServerBuilder::init_connection_state must be set before bind()/finish()");
        let local_addr = listener
            .local_addr()
            .expect("a successfully bound listener always has a local address");

        let late_failure_sink = self.late_failure_sink.unwrap_or_else(|| {
            let (sink, mut receiver) = LateFailureSink::new();
            tokio::spawn(async move {
                while let Some(failure) = receiver.recv().await {
                    warn!(
                        context = %failure.context,
                        message = %failure.message,
                        "unsupervised late task failure"
                    );
                }
            });
            sink
        });

        WorkerServer {
            listener,
            local_addr,
            worker_state: Mutex::new(Some(worker_state)),
            functions: Arc::new(self.functions),
            init_connection_state,
            on_connection_close: self.on_connection_close,
            late_failure_sink,
            live_connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
            closed: Arc::new(AtomicBool::new(false)),
            accepting: Arc::new(AtomicBool::new(true)),
            quiesce: Arc::new(Notify::new()),
        }
    }
}

/// A bound-but-not-yet-accepting, or actively serving, worker RPC server.
pub struct WorkerServer<WS, CS> {
    listener: TcpListener,
    local_addr: SocketAddr,
    worker_state: Mutex<Option<Arc<WS>>>,
    functions: Arc<HashMap<MethodId, Arc<dyn TypedFunction<WS, CS>>>>,
    init_connection_state: InitConnectionState<WS, CS>,
    on_connection_close: Option<OnConnectionClose<WS, CS>>,
    late_failure_sink: LateFailureSink,
    live_connections: Mutex<HashMap<u64, Arc<InternalConnectionState<CS>>>>,
    next_conn_id: AtomicU64,
    closed: Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
    quiesce: Arc<Notify>,
}

impl<WS, CS> WorkerServer<WS, CS>
where
    WS: Send + Sync + 'static,
    CS: Send + Sync + 'static,
{
    pub fn local_addr(&self) -> WorkerAddress {
        WorkerAddress::from(self.local_addr)
    }

    /// The [`LateFailureSink`] this server hands to every dispatched
    /// handler (§4.9). Lets a caller that never supplied its own sink via
    /// [`WorkerServerBuilder::late_failure_sink`] still obtain a clone to
    /// monitor, e.g. for a test driving a handler's background failure.
    pub fn late_failures(&self) -> LateFailureSink {
        self.late_failure_sink.clone()
    }

    /// Accepts connections until `close_server` stops the listener.
    /// Does not return until shutdown completes — this is the worker's
    /// event loop (§4.6).
    pub async fn serve(self: Arc<Self>) {
        loop {
            if !self.accepting.load(Ordering::SeqCst) {
                return;
            }

            let (stream, _) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "worker server accept failed");
                    continue;
                }
            };

            let server = Arc::clone(&self);
            let late_failures = self.late_failure_sink.clone();
            let handle = tokio::spawn(async move {
                server.handle_connection(stream).await;
            });
            // The connection task's own panics are already rare — handler
            // panics are caught inside `dispatch` before they ever reach
            // here — but `join_supervised` is what surfaces one to the
            // late-failure sink instead of letting it vanish with a
            // detached `JoinHandle` nobody awaits.
            tokio::spawn(async move {
                if let Err(err) = join_supervised(handle).await {
                    warn!(error = %err, "connection task ended abnormally");
                    late_failures.report("connection task", err.to_string());
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        let open: ConnectionOpen = match parallel_rpc::read_message(&mut stream).await {
            Ok(open) => open,
            Err(err) => {
                debug!(error = %err, conn_id, "connection failed before open handshake");
                return;
            }
        };

        if open.protocol != PROTOCOL_VERSION {
            let ack = ConnectionOpenAck::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                actual: open.protocol,
            };
            let _ = parallel_rpc::write_message(&mut stream, &ack).await;
            return;
        }

        let worker_state = {
            let guard = self.worker_state.lock().await;
            match guard.as_ref() {
                Some(ws) => Arc::clone(ws),
                None => return,
            }
        };

        let conn_state = match (self.init_connection_state)(conn_id, Arc::clone(&worker_state)).await {
            Ok(state) => Arc::new(state),
            Err(message) => {
                let ack = ConnectionOpenAck::InitFailed { message };
                let _ = parallel_rpc::write_message(&mut stream, &ack).await;
                return;
            }
        };

        let internal = Arc::new(InternalConnectionState {
            conn_id,
            state: OnceSlot::new(),
            server_port: self.local_addr.port(),
        });
        internal
            .state
            .set(Arc::clone(&conn_state))
            .expect("freshly-created connection slot is never pre-set");

        self.live_connections.lock().await.insert(conn_id, Arc::clone(&internal));

        if parallel_rpc::write_message(&mut stream, &ConnectionOpenAck::Ready)
            .await
            .is_err()
        {
            self.live_connections.lock().await.remove(&conn_id);
            return;
        }

        self.request_loop(stream, conn_id, worker_state, conn_state).await;
    }

    async fn request_loop(&self, mut stream: TcpStream, conn_id: u64, worker_state: Arc<WS>, conn_state: Arc<CS>) {
        loop {
            // `Notify::notify_waiters` wakes only tasks already parked on
            // `notified()` at the moment it fires and stores no permit for
            // later callers, so a connection that is between loop
            // iterations when `close_server` signals could otherwise miss
            // it and hang on `read_message` until its client disconnects.
            // The periodic recheck below bounds that gap.
            if self.closed.load(Ordering::SeqCst) {
                break;
            }

            let request: RpcRequest = tokio::select! {
                _ = self.quiesce.notified() => break,
                _ = tokio::time::sleep(Duration::from_millis(25)) => continue,
                result = parallel_rpc::read_message(&mut stream) => match result {
                    Ok(request) => request,
                    Err(_) => break,
                },
            };

            let response_body = self.dispatch(Arc::clone(&worker_state), Arc::clone(&conn_state), &request).await;
            let response = RpcResponse {
                req_id: request.req_id,
                body: response_body,
            };
            if parallel_rpc::write_message(&mut stream, &response).await.is_err() {
                break;
            }
        }

        if let Some(on_close) = &self.on_connection_close {
            on_close(worker_state, conn_state).await;
        }
        self.live_connections.lock().await.remove(&conn_id);
    }

    /// Dispatches one request to its registered handler under `try_within`
    /// (§4.9's "before-determined" half): a handler panic is caught on its
    /// own supervised task instead of unwinding through this connection's
    /// request loop, which would otherwise skip `on_connection_close` and
    /// leave the connection's entry in `live_connections` forever —
    /// `close_server` would then wait out the full grace period and drop
    /// `WorkerState` without that connection's teardown ever having run.
    async fn dispatch(&self, worker_state: Arc<WS>, conn_state: Arc<CS>, request: &RpcRequest) -> RpcResponseBody {
        match self.functions.get(&request.method) {
            Some(handler) => {
                let handler = Arc::clone(handler);
                let late_failures = self.late_failure_sink.clone();
                let payload = request.payload.clone();
                match try_within(async move { handler.call(worker_state, conn_state, late_failures, payload).await }).await {
                    Ok(Ok(bytes)) => RpcResponseBody::Ok(bytes),
                    Ok(Err(payload)) => RpcResponseBody::Err(payload),
                    Err(err) => RpcResponseBody::Err(RpcErrorPayload {
                        kind: RpcErrorKind::HandlerPanicked,
                        message: err.to_string(),
                    }),
                }
            }
            None => RpcResponseBody::Err(RpcErrorPayload {
                kind: RpcErrorKind::UnknownMethod,
                message: format!("no handler registered for method {}", request.method),
            }),
        }
    }

    /// Shutdown Cascade (§4.8). Idempotent: a second call is a no-op
    /// returning `Ok(())` (testable property #6).
    pub async fn close_server(self: Arc<Self>, grace_period: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.accepting.store(false, Ordering::SeqCst);
        self.quiesce.notify_waiters();

        let deadline = tokio::time::Instant::now() + grace_period;
        loop {
            if self.live_connections.lock().await.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.live_connections.lock().await.len(),
                    "close_server grace period elapsed with connections still live"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        self.worker_state.lock().await.take();
        info!("worker server closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawns `serve` as a background task, returning its handle so
    /// callers (typically `start_app`'s worker bootstrap) can hold onto it
    /// without blocking the caller that constructed the server.
    pub fn spawn_serve(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.serve().await })
    }
}
