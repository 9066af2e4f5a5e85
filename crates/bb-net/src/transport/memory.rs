//! In-memory transport for network-free tests
//!
//! Every [`MemoryTransport`] clone shares one registry of virtual listeners.
//! A dial creates an in-process duplex pipe and hands the far end to the
//! listener registered under the address.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bb_crypto::{Identity, NodeAddress};
use bb_tls::BoxedIo;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Registration, Transport};
use crate::{NetError, NetResult};

const PIPE_CAPACITY: usize = 256 * 1024;

type Registry = Arc<Mutex<HashMap<String, mpsc::Sender<BoxedIo>>>>;

#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    listeners: Registry,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, address: &str) -> bool {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.contains_key(host_of(address))
    }
}

/// Registry key: the host without any `:port` suffix.
fn host_of(address: &str) -> &str {
    address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address)
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn serve(
        &self,
        address: &NodeAddress,
        _identity: &Identity,
        incoming: mpsc::Sender<BoxedIo>,
    ) -> NetResult<Registration> {
        let key = address.to_string();
        {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            if listeners.contains_key(&key) {
                return Err(NetError::AddressInUse(key));
            }
            listeners.insert(key.clone(), incoming.clone());
        }
        debug!(addr = %key, "memory listener registered");

        let listeners = self.listeners.clone();
        Ok(Registration::new(async move {
            let mut listeners = listeners.lock().unwrap_or_else(PoisonError::into_inner);
            if listeners
                .get(&key)
                .is_some_and(|current| current.same_channel(&incoming))
            {
                listeners.remove(&key);
                debug!(addr = %key, "memory listener unregistered");
            }
            Ok(())
        }))
    }

    async fn dial(&self, address: &str) -> NetResult<BoxedIo> {
        let key = host_of(address);
        let listener = {
            let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners.get(key).cloned()
        }
        .ok_or_else(|| NetError::UnknownAddress(key.to_string()))?;

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        listener
            .send(Box::new(far))
            .await
            .map_err(|_| NetError::UnknownAddress(key.to_string()))?;
        Ok(Box::new(near))
    }
}
