//! Clients for sending replication requests to other brokers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::handler::ReplicationHandler;
use super::{ReplicationRequest, ReplicationResponse};
use crate::cluster::error::{BrokerError, BrokerResult};
use crate::cluster::rpc::{ChannelOptions, RpcChannel};
use crate::cluster::metrics::record_replication;
use crate::types::BrokerId;

/// Sends replication requests to a broker by ID.
#[async_trait]
pub trait ReplicaClient: Send + Sync + 'static {
    async fn call(
        &self,
        target: BrokerId,
        request: ReplicationRequest,
    ) -> BrokerResult<ReplicationResponse>;
}

/// TCP client with one cached channel per broker.
///
/// Addresses come from committed broker registrations and are refreshed by
/// the broker on every metadata change.
pub struct TcpReplicaClient {
    addresses: RwLock<HashMap<BrokerId, String>>,
    channels: RwLock<HashMap<BrokerId, Arc<RpcChannel>>>,
    options: ChannelOptions,
}

impl TcpReplicaClient {
    pub fn new(options: ChannelOptions) -> Self {
        Self {
            addresses: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            options,
        }
    }

    /// Replace the known replication addresses.
    pub fn set_addresses(&self, addresses: HashMap<BrokerId, String>) {
        self.channels.write().retain(|id, channel| {
            addresses
                .get(id)
                .is_some_and(|addr| addr == channel.target_addr())
        });
        *self.addresses.write() = addresses;
    }

    pub fn address_of(&self, broker_id: BrokerId) -> Option<String> {
        self.addresses.read().get(&broker_id).cloned()
    }

    fn channel(&self, broker_id: BrokerId) -> BrokerResult<Arc<RpcChannel>> {
        let addr = self.address_of(broker_id).ok_or_else(|| {
            BrokerError::Rpc(format!("no replication address for broker {}", broker_id))
        })?;

        if let Some(channel) = self.channels.read().get(&broker_id)
            && channel.target_addr() == addr
        {
            return Ok(Arc::clone(channel));
        }

        let channel = Arc::new(RpcChannel::new("replication", addr, self.options.clone()));
        self.channels
            .write()
            .insert(broker_id, Arc::clone(&channel));
        Ok(channel)
    }
}

impl Default for TcpReplicaClient {
    fn default() -> Self {
        Self::new(ChannelOptions::default())
    }
}

#[async_trait]
impl ReplicaClient for TcpReplicaClient {
    async fn call(
        &self,
        target: BrokerId,
        request: ReplicationRequest,
    ) -> BrokerResult<ReplicationResponse> {
        let channel = self.channel(target)?;
        let kind = request.kind();
        channel.call(&request).await.map_err(|e| {
            record_replication(kind, "rpc_error");
            BrokerError::Rpc(format!("replication {} to broker {}: {}", kind, target, e))
        })
    }
}

/// In-process replication network. Routes requests straight to each broker's
/// [`ReplicationHandler`], with the ability to cut brokers off.
#[derive(Default)]
pub struct LocalReplicaNetwork {
    handlers: DashMap<BrokerId, Arc<ReplicationHandler>>,
    isolated: Mutex<HashSet<BrokerId>>,
}

impl LocalReplicaNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, broker_id: BrokerId, handler: Arc<ReplicationHandler>) {
        self.handlers.insert(broker_id, handler);
    }

    /// Drop all traffic to and from `broker_id`.
    pub fn isolate(&self, broker_id: BrokerId) {
        self.isolated.lock().insert(broker_id);
    }

    pub fn heal(&self, broker_id: BrokerId) {
        self.isolated.lock().remove(&broker_id);
    }

    /// A client that sends as `source`.
    pub fn client_for(self: &Arc<Self>, source: BrokerId) -> Arc<LocalReplicaClient> {
        Arc::new(LocalReplicaClient {
            source,
            network: Arc::clone(self),
        })
    }
}

pub struct LocalReplicaClient {
    source: BrokerId,
    network: Arc<LocalReplicaNetwork>,
}

#[async_trait]
impl ReplicaClient for LocalReplicaClient {
    async fn call(
        &self,
        target: BrokerId,
        request: ReplicationRequest,
    ) -> BrokerResult<ReplicationResponse> {
        let unreachable = {
            let isolated = self.network.isolated.lock();
            isolated.contains(&self.source) || isolated.contains(&target)
        };
        if unreachable {
            return Err(BrokerError::Rpc(format!(
                "broker {} unreachable from {}",
                target, self.source
            )));
        }
        let handler = self
            .network
            .handlers
            .get(&target)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| BrokerError::Rpc(format!("no route to broker {}", target)))?;
        Ok(handler.dispatch(request).await)
    }
}
