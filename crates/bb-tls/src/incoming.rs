//! Turning raw transport streams into authenticated gRPC server connections

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bb_crypto::NodeAddress;
use ed25519_dalek::VerifyingKey;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::server::Connected;
use tracing::debug;

use crate::pin::ed25519_key_of;
use crate::{BoxedIo, TlsError, TlsResult};

/// The verified key of the client on the other end of a connection.
///
/// Available to RPC handlers through the request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    public_key: VerifyingKey,
}

impl PeerIdentity {
    pub fn public_key(&self) -> VerifyingKey {
        self.public_key
    }

    /// The onion address the client's key corresponds to.
    pub fn address(&self) -> NodeAddress {
        NodeAddress::from_public_key(&self.public_key)
    }
}

/// Client key of the connection a request arrived on.
pub fn client_public_key<T>(request: &tonic::Request<T>) -> Option<VerifyingKey> {
    request
        .extensions()
        .get::<PeerIdentity>()
        .map(PeerIdentity::public_key)
}

/// A server-side TLS stream whose client key has been checked.
pub struct PeerStream {
    inner: TlsStream<BoxedIo>,
    identity: PeerIdentity,
}

impl PeerStream {
    pub fn identity(&self) -> PeerIdentity {
        self.identity
    }
}

impl Connected for PeerStream {
    type ConnectInfo = PeerIdentity;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.identity
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Complete the server half of a handshake on `raw`.
pub async fn accept_peer(acceptor: &TlsAcceptor, raw: BoxedIo) -> TlsResult<PeerStream> {
    let inner = acceptor.accept(raw).await.map_err(|e| {
        debug!(error = %e, "TLS accept failed");
        TlsError::Handshake
    })?;

    let public_key = inner
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(ed25519_key_of)
        .ok_or(TlsError::Handshake)?;

    Ok(PeerStream {
        inner,
        identity: PeerIdentity { public_key },
    })
}

/// Wrap a channel of raw connections into a stream of authenticated ones,
/// suitable for `tonic::transport::Server::serve_with_incoming`.
///
/// Handshakes run concurrently, each bounded by `handshake_timeout`. Failed
/// handshakes are logged and dropped; they never end the stream. The stream
/// ends once every sender of `raw` is gone.
pub fn secure_incoming(
    mut raw: mpsc::Receiver<BoxedIo>,
    config: Arc<ServerConfig>,
    handshake_timeout: Duration,
) -> ReceiverStream<Result<PeerStream, io::Error>> {
    let (tx, rx) = mpsc::channel(16);
    let acceptor = TlsAcceptor::from(config);

    tokio::spawn(async move {
        loop {
            let io = tokio::select! {
                _ = tx.closed() => break,
                io = raw.recv() => match io {
                    Some(io) => io,
                    None => break,
                },
            };

            let tx = tx.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(handshake_timeout, accept_peer(&acceptor, io)).await {
                    Ok(Ok(stream)) => {
                        let _ = tx.send(Ok(stream)).await;
                    }
                    Ok(Err(e)) => debug!(error = %e, "dropping unauthenticated connection"),
                    Err(_) => debug!(?handshake_timeout, "TLS handshake timed out"),
                }
            });
        }
        debug!("incoming connection channel closed");
    });

    ReceiverStream::new(rx)
}
