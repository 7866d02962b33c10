//! Channel core: named listeners, per-session state machine, FIFO buffering.
//!
//! One [`SessionState`] exists per open subchannel; it is looked up by
//! session id from the Connection's registry (an arena pattern —
//! public [`crate::Channel`] handles hold an id, never a direct reference).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{Error, Result};

/// Lifecycle state of one channel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    WaitingAck,
    Closed,
}

/// A pending inbound ACK for a `chst` packet this side sent.
#[derive(Debug)]
pub struct PendingAck {
    pub package_id: u64,
}

/// One inbound data packet, queued for the session's `read()`.
pub type IncomingItem = (Bytes, u64);

/// Per-session mutable state, guarded by its own mutex so one session's
/// activity never blocks another's.
pub struct SessionState {
    pub session_id: String,
    state: Mutex<ChannelState>,
    pub incoming_tx: mpsc::UnboundedSender<IncomingItem>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<IncomingItem>>,
    pub ack_tx: Mutex<Option<oneshot::Sender<PendingAck>>>,
    residue: Mutex<Vec<u8>>,
    reader_active: AtomicBool,
    writer_active: AtomicBool,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl SessionState {
    pub fn new(session_id: String) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            session_id,
            state: Mutex::new(ChannelState::Open),
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            ack_tx: Mutex::new(None),
            residue: Mutex::new(Vec::new()),
            reader_active: AtomicBool::new(false),
            writer_active: AtomicBool::new(false),
        })
    }

    pub async fn state(&self) -> ChannelState {
        *self.state.lock().await
    }

    pub async fn set_state(&self, new: ChannelState) {
        *self.state.lock().await = new;
    }

    /// Acquires the writer-slot; fails fast if already occupied (compare-
    /// exchange on the guard flag, released again on drop).
    pub fn acquire_writer(&self) -> Result<WriterGuard<'_>> {
        if self
            .writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ConcurrentWritingNotAllowed);
        }
        Ok(WriterGuard { flag: &self.writer_active })
    }

    pub fn acquire_reader(&self) -> Result<ReaderGuard<'_>> {
        if self
            .reader_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ConcurrentReadingNotAllowed);
        }
        Ok(ReaderGuard { flag: &self.reader_active })
    }

    /// Reads the next chunk into `buf`, preferring leftover residue.
    /// Returns `Ok(0)` on end-of-stream (FIFO closed).
    pub async fn read_into(&self, buf: &mut [u8]) -> Result<(usize, Option<u64>)> {
        let mut residue = self.residue.lock().await;
        if !residue.is_empty() {
            let take = residue.len().min(buf.len());
            buf[..take].copy_from_slice(&residue[..take]);
            residue.drain(..take);
            return Ok((take, None));
        }
        drop(residue);

        let mut rx = self.incoming_rx.lock().await;
        match rx.recv().await {
            Some((payload, package_id)) => {
                let take = payload.len().min(buf.len());
                buf[..take].copy_from_slice(&payload[..take]);
                if take < payload.len() {
                    self.residue.lock().await.extend_from_slice(&payload[take..]);
                }
                Ok((take, Some(package_id)))
            }
            None => Ok((0, None)),
        }
    }

    /// Registers a fresh waiter for the ACK of the packet we are about to send.
    pub async fn begin_write_ack(&self) -> oneshot::Receiver<PendingAck> {
        let (tx, rx) = oneshot::channel();
        *self.ack_tx.lock().await = Some(tx);
        rx
    }

    /// Delivers an inbound `chtsr` to whichever `write()` is waiting.
    pub async fn deliver_ack(&self, package_id: u64) {
        if let Some(tx) = self.ack_tx.lock().await.take() {
            let _ = tx.send(PendingAck { package_id });
        }
    }

    /// Closes the session: unblocks the incoming FIFO and any waiting ACK.
    pub async fn shutdown(&self) {
        self.set_state(ChannelState::Closed).await;
        self.incoming_rx.lock().await.close();
        self.ack_tx.lock().await.take();
    }
}

/// RAII guard releasing the writer-slot on drop.
pub struct WriterGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// RAII guard releasing the reader-slot on drop.
pub struct ReaderGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// One pending `chreq` delivered to a listener's mailbox.
#[derive(Debug)]
pub struct AcceptRequest {
    pub req_id: String,
}

/// Registry of listeners, open sessions, and pending joins, owned by the
/// Connection arena.
#[derive(Default)]
pub struct ChannelCore {
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<AcceptRequest>>>,
    pub sessions: Mutex<HashMap<String, Arc<SessionState>>>,
    pending_joins: Mutex<HashMap<String, oneshot::Sender<PendingJoinOutcome>>>,
}

impl std::fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCore").finish_non_exhaustive()
    }
}

/// Outcome of a `join()`'s `chreqresp` wait.
#[derive(Debug)]
pub struct PendingJoinOutcome {
    pub channel_id: String,
    pub not_accepted_reason: Option<String>,
}

impl ChannelCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_listener(
        &self,
        name: &str,
    ) -> Result<mpsc::UnboundedReceiver<AcceptRequest>> {
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(name) {
            return Err(Error::AlreadyRegistered(name.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(name.to_string(), tx);
        Ok(rx)
    }

    pub async fn unregister_listener(&self, name: &str) {
        self.listeners.lock().await.remove(name);
    }

    pub async fn deliver_join_request(&self, name: &str, req_id: String) -> bool {
        let listeners = self.listeners.lock().await;
        match listeners.get(name) {
            Some(tx) => tx.send(AcceptRequest { req_id }).is_ok(),
            None => false,
        }
    }

    pub async fn insert_session(&self, session: Arc<SessionState>) {
        self.sessions.lock().await.insert(session.session_id.clone(), session);
    }

    pub async fn get_session(&self, id: &str) -> Option<Arc<SessionState>> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn remove_session(&self, id: &str) -> Option<Arc<SessionState>> {
        self.sessions.lock().await.remove(id)
    }

    pub async fn begin_join(&self, req_id: String) -> oneshot::Receiver<PendingJoinOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending_joins.lock().await.insert(req_id, tx);
        rx
    }

    pub async fn complete_join(&self, req_id: &str, outcome: PendingJoinOutcome) -> Result<()> {
        match self.pending_joins.lock().await.remove(req_id) {
            Some(tx) => {
                let _ = tx.send(outcome);
                Ok(())
            }
            None => Err(Error::ProtocolFault(format!("unknown join request id {req_id}"))),
        }
    }

    /// Drains every listener, session, and pending join, waking waiters with
    /// end-of-stream. Called from Connection teardown.
    pub async fn drain(&self) {
        self.listeners.lock().await.clear();
        for (_, tx) in self.pending_joins.lock().await.drain() {
            let _ = tx.send(PendingJoinOutcome {
                channel_id: String::new(),
                not_accepted_reason: Some("connection closed".to_string()),
            });
        }
        let sessions: Vec<_> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.shutdown().await;
        }
    }
}
