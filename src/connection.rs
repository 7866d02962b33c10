//! Connection Supervisor and public facade.
//!
//! [`Connection`] is the arena: it exclusively owns the transport (via the
//! Framer's [`WriterHandle`] and the reader half), the ACK gate, the
//! call-serializing `send_lock`, and the RPC/Channel registries.
//! Public handles ([`ChannelListener`], [`Channel`], [`Request`]) hold an
//! `Arc` back into this arena plus an id, never a direct reference into a
//! registry entry.

use std::pin::Pin;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ack_gate::AckGate;
use crate::channel::{ChannelCore, ChannelState, SessionState};
use crate::codec::{self, CHSIG_CLOSE, CHSIG_JOIN_ACK, CHTSR_STATE_ACK, Envelope, RpcDataCapsule, TypeDesc};
use crate::dispatcher;
use crate::error::{Error, Result};
use crate::framer::{self, WriterHandle};
use crate::rpc::{check_return_arity, Handler, RpcCore, RpcOutcome};
use crate::transport::Transport;

pub(crate) type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Monotone connection lifecycle word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifecycleState {
    Open,
    Closing,
    Closed,
}

/// Shared connection state, the arena every registry and handle refers to.
pub(crate) struct ConnectionInner {
    pub(crate) id: Uuid,
    local_addr: Option<String>,
    peer_addr: Option<String>,
    pub(crate) writer: WriterHandle,
    /// Serializes whole-payload sends so concurrent callers' payloads never
    /// interleave on the wire. Deliberately separate from `writer`: holding
    /// this across `ack_gate.wait()` never blocks the reader's own ACK
    /// writes, which go straight through `writer`'s queue (see framer.rs).
    send_lock: Mutex<()>,
    pub(crate) ack_gate: AckGate,
    pub(crate) rpc: RpcCore,
    pub(crate) channels: ChannelCore,
    state: Mutex<LifecycleState>,
    fault: Mutex<Option<Error>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInner").field("id", &self.id).finish_non_exhaustive()
    }
}

impl ConnectionInner {
    pub(crate) async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed().await {
            return Err(Error::ConnectionClosedEof);
        }
        let bytes = codec::encode(&envelope)?;
        let _guard = self.send_lock.lock().await;
        framer::write_payload(&bytes, &self.ack_gate, &self.writer).await
    }

    pub(crate) async fn is_closed(&self) -> bool {
        !matches!(*self.state.lock().await, LifecycleState::Open)
    }

    /// Fault-driven shutdown. No-op if a fault is
    /// already recorded.
    pub(crate) async fn terminate(&self, reason: Error) {
        let mut fault = self.fault.lock().await;
        if fault.is_some() {
            return;
        }
        *fault = Some(reason);
        drop(fault);
        *self.state.lock().await = LifecycleState::Closed;
        self.rpc.drain().await;
        self.channels.drain().await;
        self.cancel.cancel();
    }

    /// Graceful close (`Connection::close`).
    pub(crate) async fn graceful_close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if !matches!(*state, LifecycleState::Open) {
                return Err(Error::AlreadyClosed);
            }
            *state = LifecycleState::Closing;
        }
        let _ = self.writer.shutdown().await;
        self.rpc.drain().await;
        self.channels.drain().await;
        *self.state.lock().await = LifecycleState::Closed;
        self.cancel.cancel();
        Ok(())
    }

    pub(crate) async fn monitor(&self) -> Error {
        self.cancel.cancelled().await;
        self.fault.lock().await.as_ref().map_or(Error::ConnectionClosedEof, |e| match e {
            Error::ProtocolFault(m) => Error::ProtocolFault(m.clone()),
            other => Error::ProtocolFault(other.to_string()),
        })
    }
}

/// An upgraded, multiplexed connection over any [`Transport`].
///
/// Cloning is cheap (an `Arc` clone) and shares the same underlying state;
/// every clone sees the same handlers, in-flight calls, and open channels.
#[derive(Debug, Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

/// Upgrades a raw byte-stream transport into a multiplexed [`Connection`].
pub fn upgrade<T: Transport>(transport: T) -> Connection {
    // Fully qualified: concrete transports like `TcpStream`/`UnixStream` have
    // their own inherent `local_addr`/`peer_addr` (different return types)
    // which dot-call resolution would otherwise prefer over this trait's.
    let local_addr = Transport::local_addr(&transport);
    let peer_addr = Transport::peer_addr(&transport);
    let (read_half, write_half) = tokio::io::split(transport);
    let (writer, writer_rx) = WriterHandle::new();
    tokio::spawn(framer::run_writer(write_half, writer_rx));

    let inner = Arc::new(ConnectionInner {
        id: Uuid::new_v4(),
        local_addr,
        peer_addr,
        writer,
        send_lock: Mutex::new(()),
        ack_gate: AckGate::new(),
        rpc: RpcCore::new(),
        channels: ChannelCore::new(),
        state: Mutex::new(LifecycleState::Open),
        fault: Mutex::new(None),
        cancel: CancellationToken::new(),
    });

    let dispatcher_inner = Arc::clone(&inner);
    tokio::spawn(async move {
        dispatcher::run(dispatcher_inner, Box::pin(read_half)).await;
    });

    Connection { inner }
}

impl Connection {
    /// Registers `handler` under `name`. Fails if `name` is already registered.
    pub async fn register(&self, name: &str, handler: Arc<dyn Handler>) -> Result<()> {
        self.inner.rpc.register(name, handler).await
    }

    /// Invokes the peer's `name` handler with `params`, decoding the reply
    /// against `return_types` (arity must match exactly).
    pub async fn call(
        &self,
        name: &str,
        params: Vec<RpcDataCapsule>,
        return_types: &[TypeDesc],
    ) -> Result<Vec<RpcDataCapsule>> {
        if self.inner.is_closed().await {
            return Err(Error::ConnectionClosedEof);
        }
        let id = Uuid::new_v4().to_string();
        let rx = self.inner.rpc.begin_call(id.clone()).await;
        let return_dtypes = return_types.iter().map(type_desc_wire_name).collect();
        self.inner
            .send_envelope(Envelope::RpcRequest {
                id,
                name: name.to_string(),
                parameters: params,
                return_dtypes,
            })
            .await?;
        match rx.await.map_err(|_| Error::ConnectionClosedEof)? {
            RpcOutcome::Success(returns) => {
                check_return_arity(&returns, return_types.len())?;
                Ok(returns)
            }
            RpcOutcome::Error(message) => Err(Error::from_wire_message(&message)),
        }
    }

    /// Registers a named listener that [`Channel`]s can be joined to.
    pub async fn open_listener(&self, name: &str) -> Result<ChannelListener> {
        let rx = self.inner.channels.register_listener(name).await?;
        Ok(ChannelListener {
            name: name.to_string(),
            conn: Arc::clone(&self.inner),
            rx: Mutex::new(rx),
        })
    }

    /// Joins a listener by name on the peer side.
    pub async fn join(&self, name: &str) -> Result<Channel> {
        let req_id = Uuid::new_v4().to_string();
        let rx = self.inner.channels.begin_join(req_id.clone()).await;
        self.inner
            .send_envelope(Envelope::ChannelRequest { id: req_id, cid: name.to_string() })
            .await?;
        let outcome = rx.await.map_err(|_| Error::ConnectionClosedEof)?;
        if let Some(reason) = outcome.not_accepted_reason {
            return Err(Error::NotAccepted(reason));
        }
        let session = SessionState::new(outcome.channel_id.clone());
        self.inner.channels.insert_session(Arc::clone(&session)).await;
        self.inner
            .send_envelope(Envelope::ChannelSessionSignal {
                csid: outcome.channel_id.clone(),
                pid: CHSIG_JOIN_ACK,
            })
            .await?;
        Ok(Channel { session_id: outcome.channel_id, conn: Arc::clone(&self.inner) })
    }

    /// Closes the connection gracefully: drains every outstanding RPC call,
    /// channel, and listener with end-of-stream.
    pub async fn close(&self) -> Result<()> {
        self.inner.graceful_close().await
    }

    /// Blocks until the connection transitions to closed or fault, returning
    /// the terminating error.
    pub async fn monitor(&self) -> Error {
        self.inner.monitor().await
    }

    /// A `Request` handle for use by handlers registered on this Connection
    /// that need to call back into the same Connection.
    #[must_use]
    pub fn request_handle(&self) -> Request {
        Request { conn: Arc::clone(&self.inner) }
    }

    /// This side's transport address, if the underlying [`Transport`] has one.
    #[must_use]
    pub fn local_addr(&self) -> Option<&str> {
        self.inner.local_addr.as_deref()
    }

    /// The peer's transport address, if the underlying [`Transport`] has one.
    #[must_use]
    pub fn remote_addr(&self) -> Option<&str> {
        self.inner.peer_addr.as_deref()
    }

    /// Sets the read deadline. No-op at this layer.
    pub fn set_read_deadline(&self, _deadline: Option<std::time::Duration>) {}

    /// Sets the write deadline. No-op at this layer.
    pub fn set_write_deadline(&self, _deadline: Option<std::time::Duration>) {}

    /// Sets both read and write deadlines. No-op at this layer.
    pub fn set_deadline(&self, _deadline: Option<std::time::Duration>) {}
}

fn type_desc_wire_name(desc: &TypeDesc) -> String {
    match desc {
        TypeDesc::Int => "int".to_string(),
        TypeDesc::Uint => "uint".to_string(),
        TypeDesc::Float => "float".to_string(),
        TypeDesc::Bool => "bool".to_string(),
        TypeDesc::Str => "string".to_string(),
        TypeDesc::Bytes => "bytes".to_string(),
        TypeDesc::Slice(_) => "slice".to_string(),
        TypeDesc::Map => "map".to_string(),
        TypeDesc::Struct(name) => format!("struct:{name}"),
    }
}

/// Opaque handle passed as the first parameter to every registered handler.
/// Carries a reference back to the owning Connection so handlers may invoke
/// `call`/`join` themselves.
#[derive(Debug, Clone)]
pub struct Request {
    conn: Arc<ConnectionInner>,
}

impl Request {
    /// Returns a [`Connection`] handle for calling back into the same Connection.
    #[must_use]
    pub fn connection(&self) -> Connection {
        Connection { inner: Arc::clone(&self.conn) }
    }
}

/// A named acceptor yielding a [`Channel`] each time the peer joins by name.
#[derive(Debug)]
pub struct ChannelListener {
    name: String,
    conn: Arc<ConnectionInner>,
    rx: Mutex<tokio::sync::mpsc::UnboundedReceiver<crate::channel::AcceptRequest>>,
}

impl ChannelListener {
    /// Blocks until the peer joins this listener's name, or end-of-stream on
    /// Connection teardown.
    pub async fn accept(&self) -> Result<Channel> {
        let request = self.rx.lock().await.recv().await.ok_or(Error::ConnectionClosedEof)?;

        let session_id = Uuid::new_v4().to_string();
        let session = SessionState::new(session_id.clone());
        self.conn.channels.insert_session(Arc::clone(&session)).await;

        self.conn
            .send_envelope(Envelope::ChannelRequestResponse {
                rqid: request.req_id,
                cid: session_id.clone(),
                nabr: None,
            })
            .await?;

        session.set_state(ChannelState::WaitingAck).await;
        let ack_rx = session.begin_write_ack().await;
        ack_rx.await.map_err(|_| Error::ConnectionClosedEof)?;
        session.set_state(ChannelState::Open).await;

        Ok(Channel { session_id, conn: Arc::clone(&self.conn) })
    }

    /// Unregisters this listener. Idempotent.
    pub async fn close(&self) {
        self.conn.channels.unregister_listener(&self.name).await;
    }
}

/// One open, in-order byte-stream subchannel.
#[derive(Debug)]
pub struct Channel {
    session_id: String,
    conn: Arc<ConnectionInner>,
}

impl Channel {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Reads up to `buf.len()` bytes. Returns `Ok(0)` at end-of-stream.
    ///
    /// Fails with [`Error::ConcurrentReadingNotAllowed`] if another `read()`
    /// on the same channel is already in flight.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let session = self
            .conn
            .channels
            .get_session(&self.session_id)
            .await
            .ok_or(Error::ConnectionClosedEof)?;
        let _guard = session.acquire_reader()?;
        let (n, package_id) = session.read_into(buf).await?;
        if n == 0 {
            return Ok(0);
        }
        if let Some(pid) = package_id {
            self.conn
                .send_envelope(Envelope::ChannelTransportStateResponse {
                    csid: self.session_id.clone(),
                    pid,
                    state: CHTSR_STATE_ACK,
                })
                .await?;
        }
        Ok(n)
    }

    /// Writes `bytes` as one channel data packet and blocks for its ACK.
    ///
    /// Fails with [`Error::ConcurrentWritingNotAllowed`] if another `write()`
    /// on the same channel is already in flight.
    pub async fn write(&self, bytes: &[u8]) -> Result<usize> {
        let session = self
            .conn
            .channels
            .get_session(&self.session_id)
            .await
            .ok_or(Error::ConnectionClosedEof)?;
        let _guard = session.acquire_writer()?;
        if session.state().await != ChannelState::Open {
            return Err(Error::ConnectionClosedEof);
        }

        const PACKAGE_ID: u64 = 0; // always 0, echoed back by the peer's ACK.
        let ack_rx = session.begin_write_ack().await;
        self.conn
            .send_envelope(Envelope::ChannelSessionTransport {
                csid: self.session_id.clone(),
                pid: PACKAGE_ID,
                body: serde_bytes::ByteBuf::from(bytes.to_vec()),
            })
            .await?;
        session.set_state(ChannelState::WaitingAck).await;

        let ack = ack_rx.await.map_err(|_| Error::ConnectionClosedEof)?;
        if ack.package_id != PACKAGE_ID {
            self.conn
                .terminate(Error::ProtocolFault("chtsr package_id mismatch".to_string()))
                .await;
            session.shutdown().await;
            return Err(Error::ProtocolFault("chtsr package_id mismatch".to_string()));
        }
        session.set_state(ChannelState::Open).await;
        Ok(bytes.len())
    }

    /// Closes the session. Idempotent; the second call returns
    /// [`Error::AlreadyClosed`].
    pub async fn close(&self) -> Result<()> {
        let session = self
            .conn
            .channels
            .remove_session(&self.session_id)
            .await
            .ok_or(Error::AlreadyClosed)?;
        session.shutdown().await;
        self.conn
            .send_envelope(Envelope::ChannelSessionSignal {
                csid: self.session_id.clone(),
                pid: CHSIG_CLOSE,
            })
            .await
    }
}
