//! Registry keyed by method id to a type-erased `(decode, handler, encode)`
//! triple: dynamic dispatch over a typed function table.
//!
//! Callers register directly with [`function`]; the macro/derive layer
//! that would generate [`MethodId`]s from a trait stays out of scope.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parallel_core::RpcErrorPayload;
use parallel_core::RpcErrorKind;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::supervise::LateFailureSink;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered RPC, erased to raw bytes in and out so a [`MethodId`]-keyed
/// registry can hold handlers with different `Req`/`Resp` types side by
/// side. Built by [`function`]; not implemented directly by callers.
#[async_trait]
pub trait TypedFunction<WS, CS>: Send + Sync
where
    WS: Send + Sync + 'static,
    CS: Send + Sync + 'static,
{
    async fn call(
        &self,
        worker_state: Arc<WS>,
        conn_state: Arc<CS>,
        late_failures: LateFailureSink,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcErrorPayload>;
}

struct Handler<WS, CS, Req, Resp, F> {
    inner: F,
    _marker: std::marker::PhantomData<fn(WS, CS, Req) -> Resp>,
}

#[async_trait]
impl<WS, CS, Req, Resp, F, Fut> TypedFunction<WS, CS> for Handler<WS, CS, Req, Resp, F>
where
    WS: Send + Sync + 'static,
    CS: Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Arc<WS>, Arc<CS>, LateFailureSink, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, String>> + Send + 'static,
{
    async fn call(
        &self,
        worker_state: Arc<WS>,
        conn_state: Arc<CS>,
        late_failures: LateFailureSink,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcErrorPayload> {
        let arg: Req = serde_cbor::from_slice(&payload).map_err(|err| RpcErrorPayload {
            kind: RpcErrorKind::Decode,
            message: err.to_string(),
        })?;

        let result = (self.inner)(worker_state, conn_state, late_failures, arg).await;
        match result {
            Ok(resp) => serde_cbor::to_vec(&resp).map_err(|err| RpcErrorPayload {
                kind: RpcErrorKind::Decode,
                message: format!("failed to encode response: {err}"),
            }),
            Err(message) => Err(RpcErrorPayload {
                kind: RpcErrorKind::RemoteException,
                message,
            }),
        }
    }
}

/// Wraps a typed async handler
/// `Fn(worker_state, conn_state, late_failures, arg) -> Result<Resp, String>`
/// into a registrable [`TypedFunction`]. This is the registration API a
/// worker uses during bootstrap (§4.6): no code generation, no trait the
/// handler must implement, just a closure and a chosen id.
///
/// `late_failures` is the [`LateFailureSink`] configured for this worker
/// (§4.9): a handler that launches background work past its own return
/// should hand that work to [`crate::supervise::spawn_supervised`] along
/// with this sink, rather than detaching a bare `tokio::spawn` whose panics
/// would otherwise vanish silently.
pub fn function<WS, CS, Req, Resp, F, Fut>(f: F) -> Arc<dyn TypedFunction<WS, CS>>
where
    WS: Send + Sync + 'static,
    CS: Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Arc<WS>, Arc<CS>, LateFailureSink, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, String>> + Send + 'static,
{
    Arc::new(Handler {
        inner: f,
        _marker: std::marker::PhantomData,
    })
}
