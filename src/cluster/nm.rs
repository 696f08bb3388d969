//! Asynchronous client for the per-node container managers.
//!
//! Each operation is dispatched on its own task and its outcome comes back
//! as an [`NmEvent`] on a single ordered channel, so callers never block on
//! a node manager round trip.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::types::{ContainerDescriptor, ContainerId, ContainerStatus, NodeId};
use crate::error::Result;
use crate::launch::LaunchContext;

/// Raw protocol to a node manager. The hosting application binds this to its
/// cluster SDK; tests bind it to a mock.
#[async_trait]
pub trait NmProtocol: Send + Sync {
    async fn start_container(
        &self,
        container: &ContainerDescriptor,
        context: LaunchContext,
    ) -> Result<()>;

    async fn stop_container(&self, container_id: &ContainerId, node: &NodeId) -> Result<()>;

    async fn container_status(
        &self,
        container_id: &ContainerId,
        node: &NodeId,
    ) -> Result<ContainerStatus>;
}

/// Per-container callbacks, in completion order of the underlying calls.
#[derive(Debug, Clone)]
pub enum NmEvent {
    ContainerStarted(ContainerId),
    StatusReceived(ContainerStatus),
    ContainerStopped(ContainerId),
    StartError {
        container_id: ContainerId,
        error: String,
    },
    StatusError {
        container_id: ContainerId,
        error: String,
    },
    StopError {
        container_id: ContainerId,
        error: String,
    },
}

pub struct NodeManagerClient {
    protocol: Arc<dyn NmProtocol>,
    events: mpsc::UnboundedSender<NmEvent>,
    cancel: CancellationToken,
}

impl NodeManagerClient {
    pub fn new(protocol: Arc<dyn NmProtocol>) -> (Self, mpsc::UnboundedReceiver<NmEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let client = Self {
            protocol,
            events,
            cancel: CancellationToken::new(),
        };
        (client, events_rx)
    }

    /// Ask the node manager to launch the container. The outcome arrives as
    /// a `ContainerStarted` or `StartError` event.
    pub async fn start_container(&self, container: &ContainerDescriptor, context: LaunchContext) {
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return,
            outcome = self.protocol.start_container(container, context) => outcome,
        };
        let event = match outcome {
            Ok(()) => NmEvent::ContainerStarted(container.id.clone()),
            Err(error) => NmEvent::StartError {
                container_id: container.id.clone(),
                error: error.to_string(),
            },
        };
        let _ = self.events.send(event);
    }

    /// Ask the node manager to stop the container. Fire and forget; the
    /// outcome arrives as a `ContainerStopped` or `StopError` event.
    pub fn stop_container(&self, container_id: ContainerId, node: NodeId) {
        let protocol = Arc::clone(&self.protocol);
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = protocol.stop_container(&container_id, &node) => outcome,
            };
            let event = match outcome {
                Ok(()) => NmEvent::ContainerStopped(container_id),
                Err(error) => NmEvent::StopError {
                    container_id,
                    error: error.to_string(),
                },
            };
            let _ = events.send(event);
        });
    }

    /// Query the container's state. The report arrives as a `StatusReceived`
    /// or `StatusError` event.
    pub fn container_status(&self, container_id: ContainerId, node: NodeId) {
        let protocol = Arc::clone(&self.protocol);
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = protocol.container_status(&container_id, &node) => outcome,
            };
            let event = match outcome {
                Ok(status) => NmEvent::StatusReceived(status),
                Err(error) => NmEvent::StatusError {
                    container_id,
                    error: error.to_string(),
                },
            };
            let _ = events.send(event);
        });
    }

    /// Cancel any in-flight node manager calls.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
