//! Transport abstraction and concrete adapters.
//!
//! [`crate::upgrade`] accepts anything satisfying [`Transport`]; this module
//! supplies constructors and `Transport` impls for the transports this crate
//! ships adapters for. TLS is deliberately not wrapped here — encryption
//! is delegated to the transport, and `tokio-rustls` composes
//! transparently with any `AsyncRead + AsyncWrite` stream a caller already
//! has in hand; a caller wrapping one need only add a one-line
//! `impl Transport for MyTlsStream {}` (the default `local_addr`/`peer_addr`
//! are `None`), the same shape `TcpStream`/`UnixStream` use below.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::error::Result;

/// Anything the Framer can read and write. Implemented for any
/// `AsyncRead + AsyncWrite + Unpin + Send + 'static` stream.
///
/// `local_addr`/`peer_addr` back a generic network-connection contract
/// (`Connection::local_addr`/`remote_addr`). They default to `None`
/// since an arbitrary duplex stream has no notion of an address; concrete
/// socket transports below report their real endpoint.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// This side's address, if the transport has one.
    fn local_addr(&self) -> Option<String> {
        None
    }

    /// The peer's address, if the transport has one.
    fn peer_addr(&self) -> Option<String> {
        None
    }
}

impl Transport for TcpStream {
    fn local_addr(&self) -> Option<String> {
        TcpStream::local_addr(self).ok().map(|a| a.to_string())
    }

    fn peer_addr(&self) -> Option<String> {
        TcpStream::peer_addr(self).ok().map(|a| a.to_string())
    }
}

impl Transport for UnixStream {
    fn local_addr(&self) -> Option<String> {
        UnixStream::local_addr(self)
            .ok()
            .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
    }

    fn peer_addr(&self) -> Option<String> {
        UnixStream::peer_addr(self)
            .ok()
            .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
    }
}

impl Transport for tokio::io::DuplexStream {}

/// Connects a Unix domain socket and returns it ready for [`crate::upgrade`].
pub async fn connect_unix(path: impl AsRef<std::path::Path>) -> Result<UnixStream> {
    Ok(UnixStream::connect(path).await?)
}

/// Connects a TCP stream and returns it ready for [`crate::upgrade`].
pub async fn connect_tcp(addr: impl tokio::net::ToSocketAddrs) -> Result<TcpStream> {
    Ok(TcpStream::connect(addr).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn unix_transport_reports_peer_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wiremux-test.sock");
        let listener = UnixListener::bind(&path).expect("bind");

        let accept = tokio::spawn(async move { listener.accept().await.expect("accept").0 });
        let client = connect_unix(&path).await.expect("connect");
        let server = accept.await.expect("accept task panicked");

        assert_eq!(Transport::peer_addr(&client), Transport::local_addr(&server));
        assert!(Transport::local_addr(&server).is_some());
    }

    #[tokio::test]
    async fn duplex_transport_has_no_addresses() {
        let (a, _b) = tokio::io::duplex(64);
        assert_eq!(Transport::local_addr(&a), None);
        assert_eq!(Transport::peer_addr(&a), None);
    }
}

/// Wraps a WebSocket connection as a byte-stream [`Transport`].
///
/// wiremux's framing is a byte-stream protocol; WebSocket is message-framed,
/// so this adapter carries the byte stream inside Binary frames (one Binary
/// frame per `poll_write` call is not required — bytes are buffered and
/// flushed as Binary frames on `flush`/`shutdown`).
pub mod websocket {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    use crate::error::{Error, Result};

    type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    /// A WebSocket connection presented as a plain byte stream.
    #[derive(Debug)]
    pub struct WebSocketTransport {
        inner: WsStream,
        read_residue: Vec<u8>,
    }

    impl WebSocketTransport {
        /// Performs the WebSocket handshake against `url` and wraps the result.
        pub async fn connect(url: &str) -> Result<Self> {
            let (inner, _response) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| Error::ProtocolFault(format!("websocket connect failed: {e}")))?;
            Ok(Self { inner, read_residue: Vec::new() })
        }
    }

    impl AsyncRead for WebSocketTransport {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if !self.read_residue.is_empty() {
                let take = self.read_residue.len().min(buf.remaining());
                let drained: Vec<u8> = self.read_residue.drain(..take).collect();
                buf.put_slice(&drained);
                return Poll::Ready(Ok(()));
            }
            loop {
                match self.inner.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                        let take = data.len().min(buf.remaining());
                        buf.put_slice(&data[..take]);
                        if take < data.len() {
                            self.read_residue.extend_from_slice(&data[take..]);
                        }
                        return Poll::Ready(Ok(()));
                    }
                    Poll::Ready(Some(Ok(_))) => continue,
                    Poll::Ready(Some(Err(e))) => {
                        return Poll::Ready(Err(std::io::Error::other(e)));
                    }
                    Poll::Ready(None) => return Poll::Ready(Ok(())),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }

    impl crate::transport::Transport for WebSocketTransport {}

    impl AsyncWrite for WebSocketTransport {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            match self.inner.poll_ready_unpin(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(std::io::Error::other(e))),
                Poll::Pending => return Poll::Pending,
            }
            match self.inner.start_send_unpin(Message::Binary(buf.to_vec().into())) {
                Ok(()) => Poll::Ready(Ok(buf.len())),
                Err(e) => Poll::Ready(Err(std::io::Error::other(e))),
            }
        }

        fn poll_flush(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            self.inner.poll_flush_unpin(cx).map_err(std::io::Error::other)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            self.inner.poll_close_unpin(cx).map_err(std::io::Error::other)
        }
    }
}
