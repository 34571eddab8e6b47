//! Server side of the replication protocol.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{ReplicationError, ReplicationRequest, ReplicationResponse};
use crate::cluster::metrics::record_replication;
use crate::cluster::partition_log::PartitionMap;
use crate::cluster::rpc::RpcService;

/// Routes replication requests to the partitions hosted on this broker.
pub struct ReplicationHandler {
    partitions: Arc<PartitionMap>,
}

impl ReplicationHandler {
    pub fn new(partitions: Arc<PartitionMap>) -> Self {
        Self { partitions }
    }

    pub async fn dispatch(&self, request: ReplicationRequest) -> ReplicationResponse {
        let kind = request.kind();
        let log = self
            .partitions
            .get(request.partition())
            .map(|entry| Arc::clone(entry.value()));
        let Some(log) = log else {
            record_replication(kind, "unknown_partition");
            return ReplicationResponse::Error(ReplicationError::UnknownPartition);
        };

        let result = match request {
            ReplicationRequest::Append {
                leader_id,
                epoch,
                offset,
                value,
                ..
            } => log
                .append_replicated(leader_id, epoch, offset, value)
                .await
                .map(|newest| ReplicationResponse::Appended { newest }),
            ReplicationRequest::Fetch {
                follower_id,
                epoch,
                offset,
                max_bytes,
                ..
            } => log
                .serve_fetch(follower_id, epoch, offset, max_bytes)
                .await
                .map(ReplicationResponse::Records),
            ReplicationRequest::EpochEnd { epoch, .. } => log
                .epoch_end(epoch)
                .map(|(epoch, end_offset)| ReplicationResponse::EpochEnd { epoch, end_offset }),
        };

        match result {
            Ok(response) => {
                record_replication(kind, "ok");
                response
            }
            Err(e) => {
                let wire = ReplicationError::from(&e);
                debug!(
                    partition = %log.partition(),
                    kind,
                    error = %e,
                    "Replication request rejected"
                );
                record_replication(kind, wire.as_metric_label());
                ReplicationResponse::Error(wire)
            }
        }
    }
}

#[async_trait]
impl RpcService for ReplicationHandler {
    type Request = ReplicationRequest;
    type Response = ReplicationResponse;

    async fn handle(&self, request: Self::Request) -> Self::Response {
        self.dispatch(request).await
    }
}
