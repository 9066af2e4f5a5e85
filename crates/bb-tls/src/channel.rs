//! Pinned gRPC client channels over an arbitrary dialer

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use crate::{BoxedIo, TlsResult};

/// Opens one raw byte stream to the counterpart. Called again by the channel
/// whenever it needs to reconnect.
pub type DialFn = Arc<dyn Fn() -> BoxFuture<'static, io::Result<BoxedIo>> + Send + Sync>;

/// Certificates carry these SANs; the name itself is never validated.
const TLS_SERVER_NAME: &str = "localhost";

/// Establish a gRPC channel: dial, run the pinned handshake from `config`,
/// then speak HTTP/2. Dial and handshake together are bounded by `timeout`.
pub async fn connect_channel(
    config: Arc<ClientConfig>,
    dial: DialFn,
    timeout: Duration,
) -> TlsResult<Channel> {
    let connector = TlsConnector::from(config);

    let channel = Endpoint::from_static("http://[::]:0")
        .connect_timeout(timeout)
        .connect_with_connector(service_fn(move |_: Uri| {
            let dial = dial.clone();
            let connector = connector.clone();
            async move {
                let raw = dial().await?;
                let name = ServerName::try_from(TLS_SERVER_NAME).map_err(io::Error::other)?;
                let tls = tokio::time::timeout(timeout, connector.connect(name, raw))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))?
                    .inspect_err(|e| debug!(error = %e, "TLS connect failed"))?;
                Ok::<_, io::Error>(TokioIo::new(tls))
            }
        }))
        .await?;

    Ok(channel)
}
