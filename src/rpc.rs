//! RPC core: handler registry, outbound-call table, type coercion.
//!
//! Dynamic dispatch over handler
//! signatures becomes a small `Handler` trait with generated-by-hand thin
//! adapters, and reflective type descriptors become an explicit [`TypeDesc`]
//! enum rather than runtime introspection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use crate::codec::{RpcDataCapsule, TypeDesc};
use crate::connection::Request;
use crate::error::{Error, Result};

/// One registered RPC target.
///
/// Implementors decode `params` against their own declared parameter types,
/// run, and encode their non-error returns. A panic inside `call` is caught
/// at the task boundary by the Dispatcher (see `dispatcher.rs`), not here.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Declared parameter types, in order (excluding the leading `Request`).
    fn param_types(&self) -> &[TypeDesc];

    /// Declared return types, in order (excluding the trailing error slot).
    fn return_types(&self) -> &[TypeDesc];

    /// Invokes the handler with the already-validated capsule arguments.
    async fn call(&self, req: Request, params: Vec<RpcDataCapsule>) -> HandlerOutcome;
}

/// What a handler invocation produced: either an error message (sent back
/// as `rpcres.error`) or a list of return capsules (sent as `rpcres.return`).
pub type HandlerOutcome = std::result::Result<Vec<RpcDataCapsule>, String>;

/// Outcome of a completed outbound call, as decoded from the peer's `rpcres`.
#[derive(Debug)]
pub enum RpcOutcome {
    Success(Vec<RpcDataCapsule>),
    Error(String),
}

/// The handler registry and outbound-call correlation table, owned by the
/// Connection arena (a registry, not a back-reference).
#[derive(Default)]
pub struct RpcCore {
    handlers: Mutex<HashMap<String, Arc<dyn Handler>>>,
    outbound: Mutex<HashMap<String, oneshot::Sender<RpcOutcome>>>,
}

impl std::fmt::Debug for RpcCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcCore").finish_non_exhaustive()
    }
}

impl RpcCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`. Fails if `name` is already taken.
    pub async fn register(&self, name: &str, handler: Arc<dyn Handler>) -> Result<()> {
        let mut handlers = self.handlers.lock().await;
        if handlers.contains_key(name) {
            return Err(Error::AlreadyRegistered(name.to_string()));
        }
        handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.lock().await.get(name).cloned()
    }

    /// Registers a fresh outbound call id and returns the receiver half.
    pub async fn begin_call(&self, id: String) -> oneshot::Receiver<RpcOutcome> {
        let (tx, rx) = oneshot::channel();
        self.outbound.lock().await.insert(id, tx);
        rx
    }

    /// Completes the outbound call identified by `id`. Returns an error if
    /// `id` is unknown (a fatal protocol fault).
    pub async fn complete_call(&self, id: &str, outcome: RpcOutcome) -> Result<()> {
        let sender = self.outbound.lock().await.remove(id);
        match sender {
            Some(tx) => {
                let _ = tx.send(outcome);
                Ok(())
            }
            None => Err(Error::ProtocolFault(format!("unknown rpc response id {id}"))),
        }
    }

    /// Drains all outstanding outbound calls, waking each waiter with
    /// end-of-stream. Called from Connection teardown (graceful or fault).
    pub async fn drain(&self) {
        let mut outbound = self.outbound.lock().await;
        for (_, tx) in outbound.drain() {
            let _ = tx.send(RpcOutcome::Error("connection closed".to_string()));
        }
    }
}

/// Validates each argument against the transportable type set and converts
/// it to a tagged capsule. Non-transportable values are rejected up front
/// by construction: callers build [`RpcDataCapsule`]s directly via its
/// `int`/`uint`/`float`/... constructors, so this function only checks arity.
pub fn check_return_arity(returns: &[RpcDataCapsule], expected: usize) -> Result<()> {
    if returns.len() != expected {
        return Err(Error::ProtocolFault(format!(
            "rpc response arity mismatch: expected {expected}, got {}",
            returns.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait::async_trait]
    impl Handler for Noop {
        fn param_types(&self) -> &[TypeDesc] {
            &[]
        }

        fn return_types(&self) -> &[TypeDesc] {
            &[]
        }

        async fn call(&self, _req: Request, _params: Vec<RpcDataCapsule>) -> HandlerOutcome {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn registering_the_same_name_twice_fails() {
        let core = RpcCore::new();
        core.register("echo", Arc::new(Noop)).await.expect("first register");
        let err = core.register("echo", Arc::new(Noop)).await.expect_err("second register");
        assert!(matches!(err, Error::AlreadyRegistered(name) if name == "echo"));
    }

    #[tokio::test]
    async fn completing_an_unknown_call_id_is_a_protocol_fault() {
        let core = RpcCore::new();
        let err = core
            .complete_call("missing", RpcOutcome::Success(vec![]))
            .await
            .expect_err("unknown id must fault");
        assert!(matches!(err, Error::ProtocolFault(_)));
    }

    #[tokio::test]
    async fn check_return_arity_rejects_mismatch() {
        assert!(check_return_arity(&[RpcDataCapsule::int(1)], 1).is_ok());
        assert!(check_return_arity(&[RpcDataCapsule::int(1)], 2).is_err());
    }
}
