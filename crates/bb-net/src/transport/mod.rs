//! Transport abstraction: publish a node address, dial other nodes

pub mod memory;
pub mod tor;

use std::future::Future;

use async_trait::async_trait;
use bb_crypto::{Identity, NodeAddress};
use bb_tls::BoxedIo;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::NetResult;

/// A network a node can be reached on.
///
/// Implementations move raw byte streams only; authentication happens in
/// the pinned TLS layer on top.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Make `address` reachable and push every inbound connection into
    /// `incoming` until the returned [`Registration`] is unregistered.
    async fn serve(
        &self,
        address: &NodeAddress,
        identity: &Identity,
        incoming: mpsc::Sender<BoxedIo>,
    ) -> NetResult<Registration>;

    /// Open a raw connection to `address` (`host` or `host:port`).
    async fn dial(&self, address: &str) -> NetResult<BoxedIo>;
}

/// Handle to a published address. Tearing it down stops accepting, closes
/// the listener and releases backend resources.
#[must_use = "an unregistered address keeps accepting connections"]
pub struct Registration {
    teardown: Option<BoxFuture<'static, NetResult<()>>>,
}

impl Registration {
    pub fn new(teardown: impl Future<Output = NetResult<()>> + Send + 'static) -> Self {
        Self {
            teardown: Some(teardown.boxed()),
        }
    }

    /// Run the teardown. Later calls are no-ops.
    pub async fn unregister(&mut self) -> NetResult<()> {
        match self.teardown.take() {
            Some(teardown) => teardown.await,
            None => Ok(()),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.teardown.is_some()
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("registered", &self.is_registered())
            .finish()
    }
}
