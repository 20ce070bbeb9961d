//! Dialers: plain TCP, and a wrapper that traces connection lifecycles.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rex_core::error::{RexError, RexResult};
use rex_core::transport::{BoxConn, Dialer};

/// Connects over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial<'a>(
        &'a self,
        address: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, RexResult<BoxConn>> {
        Box::pin(async move {
            let stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RexError::cancelled("dial")),
                result = TcpStream::connect(address) => result.map_err(|source| RexError::Dial {
                    address: address.to_string(),
                    source,
                })?,
            };
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxConn)
        })
    }
}

/// Wraps another dialer so every connection logs when it is dialed and torn
/// down.
///
/// Shutting a traced connection down more than once succeeds silently: the
/// transport and its owner may both close the same connection.
pub struct TracedDialer {
    inner: Arc<dyn Dialer>,
}

impl TracedDialer {
    pub fn new(inner: Arc<dyn Dialer>) -> Self {
        Self { inner }
    }
}

impl Dialer for TracedDialer {
    fn dial<'a>(
        &'a self,
        address: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, RexResult<BoxConn>> {
        Box::pin(async move {
            debug!(%address, "dialing");
            match self.inner.dial(address, cancel).await {
                Ok(conn) => Ok(Box::new(TracedConn {
                    inner: conn,
                    address: address.to_string(),
                    shut_down: false,
                }) as BoxConn),
                Err(e) => {
                    debug!(%address, "dial failed: {}", e);
                    Err(e)
                }
            }
        })
    }
}

struct TracedConn {
    inner: BoxConn,
    address: String,
    shut_down: bool,
}

impl AsyncRead for TracedConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TracedConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.shut_down {
            return Poll::Ready(Ok(()));
        }
        let poll = Pin::new(&mut self.inner).poll_shutdown(cx);
        match &poll {
            Poll::Ready(Ok(())) => {
                self.shut_down = true;
                debug!(address = %self.address, "connection shut down");
            }
            Poll::Ready(Err(e)) => warn!(address = %self.address, "error shutting down connection: {}", e),
            Poll::Pending => {}
        }
        poll
    }
}

impl Drop for TracedConn {
    fn drop(&mut self) {
        debug!(address = %self.address, "connection dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_dial_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hi").await.unwrap();
        });

        let dialer = TracedDialer::new(Arc::new(TcpDialer));
        let mut conn = dialer
            .dial(&address, &CancellationToken::new())
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        conn.shutdown().await.unwrap();
        // A second shutdown is not an error.
        conn.shutdown().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        match TcpDialer.dial(&address, &CancellationToken::new()).await {
            Err(RexError::Dial { address: a, .. }) => assert_eq!(a, address),
            Err(other) => panic!("expected dial error, got {other:?}"),
            Ok(_) => panic!("dial unexpectedly succeeded"),
        }
    }

    #[tokio::test]
    async fn dial_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Non-routable address; only cancellation can end this promptly.
        let result = TcpDialer.dial("10.255.255.1:9", &cancel).await;
        match result {
            Err(e) => assert!(e.is_cancelled(), "unexpected error: {e}"),
            Ok(_) => panic!("dial unexpectedly succeeded"),
        }
    }
}
