//! Chunked-frame wire engine: MSG/END/ACK with lock-step acknowledgement.
//!
//! Outbound wire layout for one payload: zero or more `'M'` chunks (each a
//! big-endian `u32` length followed by that many bytes, 1..=1024 per chunk),
//! then one `'E'` terminator. The sender blocks on an [`AckGate`] after every
//! chunk and after the terminator; an empty payload is just a bare `'E'`.
//! Inbound `'A'` must be followed by `'C'`, `'K'`.
//!
//! Outbound bytes (payload chunks, the END terminator, and ACKs the reader
//! owes the peer for frames it just read) all funnel through one
//! [`WriterHandle`] onto a single dedicated writer task (see [`run_writer`]).
//! This is deliberate: a payload sender blocks on [`AckGate::wait`] for
//! potentially the whole round trip, and if that wait were held under the
//! same lock an ACK write needs, a simultaneous in-flight payload in both
//! directions would deadlock each side waiting on the other's unsent ACK.
//! Queuing decouples "the reader owes an ACK" from "a payload is still
//! waiting for one", so the writer task can always drain the ACK the moment
//! the reader enqueues it.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::ack_gate::AckGate;
use crate::error::{Error, Result};

/// Maximum bytes carried by a single MSG chunk.
pub const MAX_CHUNK_LEN: u32 = 1024;

const MSG_TYPE: u8 = b'M';
const END_TYPE: u8 = b'E';
const ACK_TYPE: u8 = b'A';
const ACK_SUFFIX: [u8; 2] = [b'C', b'K'];

/// Result of reading frames up to and including the next payload boundary.
#[derive(Debug)]
pub enum FrameEvent {
    /// A complete application payload (one or more MSG chunks + END).
    Payload(Vec<u8>),
    /// Transport end-of-stream with no payload mid-assembly: graceful close.
    Eof,
}

/// One unit of work for the dedicated writer task.
enum WriteJob {
    /// Raw bytes to write to the transport, as-is.
    Bytes(Vec<u8>),
    /// Shut down the transport and report back once done; the task exits
    /// after processing this job.
    Shutdown(oneshot::Sender<()>),
}

/// A cheaply-cloned handle that enqueues bytes onto the writer task owning
/// the transport's write half. Enqueueing never blocks on the transport
/// itself, only on the (unbounded) queue.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl WriterHandle {
    /// Creates a handle paired with the receiver [`run_writer`] drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WriteJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueues `bytes` for the writer task. Non-blocking; fails only once
    /// the writer task has already exited (transport gone).
    fn send_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        self.tx.send(WriteJob::Bytes(bytes)).map_err(|_| Error::ConnectionClosedEof)
    }

    /// Requests the writer task shut down the transport, then waits for it
    /// to finish doing so. A no-op if the writer task has already exited.
    pub async fn shutdown(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriteJob::Shutdown(ack_tx)).is_err() {
            return Ok(());
        }
        let _ = ack_rx.await;
        Ok(())
    }
}

/// The dedicated writer task: drains `rx` and writes each job to `write_half`
/// in order. Exits on a `Shutdown` job or once the transport errors.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    mut write_half: W,
    mut rx: mpsc::UnboundedReceiver<WriteJob>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            WriteJob::Bytes(bytes) => {
                if let Err(e) = write_half.write_all(&bytes).await {
                    log::warn!("writer task: write failed: {e}");
                    break;
                }
                if let Err(e) = write_half.flush().await {
                    log::warn!("writer task: flush failed: {e}");
                    break;
                }
            }
            WriteJob::Shutdown(ack) => {
                let _ = write_half.shutdown().await;
                let _ = ack.send(());
                break;
            }
        }
    }
}

fn encode_msg_frame(chunk: &[u8]) -> Vec<u8> {
    debug_assert!(!chunk.is_empty() && chunk.len() <= MAX_CHUNK_LEN as usize);
    let mut buf = Vec::with_capacity(5 + chunk.len());
    buf.push(MSG_TYPE);
    buf.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
    buf.extend_from_slice(chunk);
    buf
}

fn encode_end_frame() -> Vec<u8> {
    vec![END_TYPE]
}

fn encode_ack_frame() -> Vec<u8> {
    let mut buf = Vec::with_capacity(3);
    buf.push(ACK_TYPE);
    buf.extend_from_slice(&ACK_SUFFIX);
    buf
}

/// Writes one application payload, chunked per [`MAX_CHUNK_LEN`], blocking on
/// `ack_gate` after every chunk and after the END terminator.
///
/// Callers must hold the Connection's send-lock across this call so that
/// payloads from different call sites never interleave on the wire; the
/// actual transport write goes through `writer` and is never blocked by this
/// wait (see the module docs).
pub async fn write_payload(payload: &[u8], ack_gate: &AckGate, writer: &WriterHandle) -> Result<()> {
    if payload.is_empty() {
        writer.send_bytes(encode_end_frame())?;
        ack_gate.wait().await;
        return Ok(());
    }

    for chunk in payload.chunks(MAX_CHUNK_LEN as usize) {
        writer.send_bytes(encode_msg_frame(chunk))?;
        ack_gate.wait().await;
    }
    writer.send_bytes(encode_end_frame())?;
    ack_gate.wait().await;
    Ok(())
}

/// Reads frames from `reader` until a complete payload or transport EOF.
///
/// Every MSG/END frame observed enqueues an outbound ACK via `writer` —
/// independent of whether a payload send on this Connection is currently
/// blocked waiting for its own ACK, so the two directions never contend for
/// the same lock. Every inbound ACK signals `ack_gate`, waking whichever
/// call site is blocked in [`write_payload`].
pub async fn read_payload<R>(
    reader: &mut R,
    writer: &WriterHandle,
    ack_gate: &AckGate,
) -> Result<FrameEvent>
where
    R: AsyncRead + Unpin,
{
    let mut assembly = Vec::new();
    loop {
        let type_byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && assembly.is_empty() => {
                return Ok(FrameEvent::Eof);
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::ProtocolFault(
                    "transport closed mid-payload".to_string(),
                ));
            }
            Err(e) => return Err(Error::Io(e)),
        };

        match type_byte {
            MSG_TYPE => {
                let len = reader.read_u32().await.map_err(Error::Io)?;
                if len < 1 || len > MAX_CHUNK_LEN {
                    return Err(Error::ProtocolFault(format!(
                        "chunk length {len} outside 1..={MAX_CHUNK_LEN}"
                    )));
                }
                let mut chunk = vec![0_u8; len as usize];
                reader.read_exact(&mut chunk).await.map_err(Error::Io)?;
                assembly.extend_from_slice(&chunk);
                writer.send_bytes(encode_ack_frame())?;
            }
            END_TYPE => {
                writer.send_bytes(encode_ack_frame())?;
                return Ok(FrameEvent::Payload(assembly));
            }
            ACK_TYPE => {
                let mut suffix = [0_u8; 2];
                reader.read_exact(&mut suffix).await.map_err(Error::Io)?;
                if suffix != ACK_SUFFIX {
                    return Err(Error::ProtocolFault("malformed ACK suffix".to_string()));
                }
                ack_gate.signal();
            }
            other => {
                return Err(Error::ProtocolFault(format!(
                    "unknown frame type byte {other}"
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn spawn_writer<W: AsyncWrite + Unpin + Send + 'static>(write_half: W) -> WriterHandle {
        let (handle, rx) = WriterHandle::new();
        tokio::spawn(run_writer(write_half, rx));
        handle
    }

    #[tokio::test]
    async fn round_trips_small_payload() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_read, client_write) = tokio::io::split(client);
        let (mut server_read, server_write) = tokio::io::split(server);
        let client_writer = spawn_writer(client_write);
        let server_writer = spawn_writer(server_write);
        let client_ack = Arc::new(AckGate::new());
        let server_ack = Arc::new(AckGate::new());

        let sender_ack = Arc::clone(&client_ack);
        let sender = tokio::spawn(async move {
            write_payload(b"hello world", &sender_ack, &client_writer).await.expect("send failed");
        });

        // The peer's reply stream only ever carries ACKs for this payload;
        // drain them so the sender's ack_gate keeps unblocking.
        let ack_drain = tokio::spawn(async move {
            let mut ack_buf = [0_u8; 3];
            for _ in 0..2 {
                client_read.read_exact(&mut ack_buf).await.expect("expected ACK");
                assert_eq!(&ack_buf, b"ACK");
                client_ack.signal();
            }
        });

        let received = tokio::spawn(async move {
            read_payload(&mut server_read, &server_writer, &server_ack).await
        });

        sender.await.expect("sender task panicked");
        ack_drain.await.expect("ack drain task panicked");
        match received.await.expect("receiver task panicked").unwrap() {
            FrameEvent::Payload(bytes) => assert_eq!(bytes, b"hello world"),
            FrameEvent::Eof => panic!("expected payload, got eof"),
        }
    }

    #[tokio::test]
    async fn empty_payload_is_bare_end() {
        let (client, server) = tokio::io::duplex(64);
        let (client_read, client_write) = tokio::io::split(client);
        let (mut server_read, server_write) = tokio::io::split(server);
        let _ = client_read;
        let client_writer = spawn_writer(client_write);
        let server_writer = spawn_writer(server_write);
        let ack = Arc::new(AckGate::new());

        client_writer.send_bytes(encode_end_frame()).unwrap();

        match read_payload(&mut server_read, &server_writer, &ack).await.unwrap() {
            FrameEvent::Payload(bytes) => assert!(bytes.is_empty()),
            FrameEvent::Eof => panic!("expected empty payload"),
        }
    }

    #[tokio::test]
    async fn chunk_length_1024_is_accepted() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (mut server_read, server_write) = tokio::io::split(server);
        let _ = client_read;
        let client_writer = spawn_writer(client_write);
        let server_writer = spawn_writer(server_write);
        let ack = Arc::new(AckGate::new());

        client_writer.send_bytes(encode_msg_frame(&vec![7_u8; MAX_CHUNK_LEN as usize])).unwrap();
        client_writer.send_bytes(encode_end_frame()).unwrap();

        match read_payload(&mut server_read, &server_writer, &ack).await.unwrap() {
            FrameEvent::Payload(bytes) => assert_eq!(bytes.len(), MAX_CHUNK_LEN as usize),
            FrameEvent::Eof => panic!("expected payload"),
        }
    }

    #[tokio::test]
    async fn chunk_length_1025_is_a_fault() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, server_write) = tokio::io::split(server);
        let _ = client_read;
        let server_writer = spawn_writer(server_write);
        let ack = Arc::new(AckGate::new());

        client_write.write_u8(MSG_TYPE).await.unwrap();
        client_write.write_u32(MAX_CHUNK_LEN + 1).await.unwrap();
        client_write.flush().await.unwrap();

        let err = read_payload(&mut server_read, &server_writer, &ack).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolFault(_)));
    }

    #[tokio::test]
    async fn unknown_type_byte_is_a_fault() {
        let (client, server) = tokio::io::duplex(64);
        let (client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, server_write) = tokio::io::split(server);
        let _ = client_read;
        let server_writer = spawn_writer(server_write);
        let ack = Arc::new(AckGate::new());

        client_write.write_u8(b'Z').await.unwrap();
        client_write.flush().await.unwrap();

        let err = read_payload(&mut server_read, &server_writer, &ack).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolFault(_)));
    }

    #[tokio::test]
    async fn simultaneous_bidirectional_payloads_do_not_deadlock() {
        // Regression test: both sides send a payload at the same instant.
        // Each side's reader must be able to ACK the peer's frames while its
        // own writer is still blocked waiting for its own ACK.
        let (a, b) = tokio::io::duplex(4096);
        let (mut a_read, a_write) = tokio::io::split(a);
        let (mut b_read, b_write) = tokio::io::split(b);
        let a_writer = spawn_writer(a_write);
        let b_writer = spawn_writer(b_write);
        let a_ack = Arc::new(AckGate::new());
        let b_ack = Arc::new(AckGate::new());

        let send_a = {
            let writer = a_writer.clone();
            let ack = Arc::clone(&a_ack);
            tokio::spawn(async move { write_payload(b"from a", &ack, &writer).await })
        };
        let send_b = {
            let writer = b_writer.clone();
            let ack = Arc::clone(&b_ack);
            tokio::spawn(async move { write_payload(b"from b", &ack, &writer).await })
        };
        let recv_a = tokio::spawn(async move { read_payload(&mut a_read, &a_writer, &a_ack).await });
        let recv_b = tokio::spawn(async move { read_payload(&mut b_read, &b_writer, &b_ack).await });

        let (send_a, send_b, recv_a, recv_b) = tokio::join!(send_a, send_b, recv_a, recv_b);
        send_a.unwrap().expect("a's send failed");
        send_b.unwrap().expect("b's send failed");
        match recv_a.unwrap().unwrap() {
            FrameEvent::Payload(bytes) => assert_eq!(bytes, b"from b"),
            FrameEvent::Eof => panic!("expected payload"),
        }
        match recv_b.unwrap().unwrap() {
            FrameEvent::Payload(bytes) => assert_eq!(bytes, b"from a"),
            FrameEvent::Eof => panic!("expected payload"),
        }
    }
}
