//! Asynchronous client for the resource-manager side of the application
//! master protocol.
//!
//! The raw protocol is synchronous request/response; this client wraps it
//! with a heartbeat task that carries accumulated container requests up on
//! every beat and translates the responses into [`RmEvent`]s on a single
//! ordered channel. Handlers on the receiving side must not block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cluster::types::{
    ContainerDescriptor, ContainerRequest, ContainerStatus, FinalStatus, NodeReport, Registration,
};
use crate::error::Result;

/// Raw application-master protocol to the resource manager. The hosting
/// application binds this to its cluster SDK; tests bind it to a mock.
#[async_trait]
pub trait AmRmProtocol: Send + Sync {
    async fn register_application_master(
        &self,
        host: &str,
        rpc_port: i32,
        tracking_url: &str,
    ) -> Result<Registration>;

    /// One heartbeat: submit any new container requests and report progress,
    /// receiving whatever the resource manager has accumulated since the
    /// last beat.
    async fn allocate(
        &self,
        requests: Vec<ContainerRequest>,
        progress: f32,
    ) -> Result<AllocateResponse>;

    async fn unregister_application_master(
        &self,
        status: FinalStatus,
        diagnostics: &str,
        tracking_url: &str,
    ) -> Result<()>;
}

/// Everything a single heartbeat can bring back.
#[derive(Debug, Clone, Default)]
pub struct AllocateResponse {
    pub allocated: Vec<ContainerDescriptor>,
    pub completed: Vec<ContainerStatus>,
    pub updated_nodes: Vec<NodeReport>,
    pub shutdown_requested: bool,
}

/// Callbacks surfaced by the heartbeat task, in arrival order.
#[derive(Debug, Clone)]
pub enum RmEvent {
    ContainersAllocated(Vec<ContainerDescriptor>),
    ContainersCompleted(Vec<ContainerStatus>),
    NodesUpdated(Vec<NodeReport>),
    ShutdownRequested,
    TransportError(String),
}

pub struct AmRmClient {
    protocol: Arc<dyn AmRmProtocol>,
    pending: Arc<Mutex<Vec<ContainerRequest>>>,
    events: mpsc::UnboundedSender<RmEvent>,
    heartbeat_interval: Duration,
    registered: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl AmRmClient {
    pub fn new(
        protocol: Arc<dyn AmRmProtocol>,
        heartbeat_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<RmEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let client = Self {
            protocol,
            pending: Arc::new(Mutex::new(Vec::new())),
            events,
            heartbeat_interval,
            registered: Arc::new(AtomicBool::new(false)),
            done: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        };
        (client, events_rx)
    }

    /// Spawn the heartbeat task. All callbacks are delivered from this one
    /// task, so arrival order is preserved. Beats are skipped until
    /// registration has completed.
    pub fn start(&self) {
        let protocol = Arc::clone(&self.protocol);
        let pending = Arc::clone(&self.pending);
        let events = self.events.clone();
        let registered = Arc::clone(&self.registered);
        let done = Arc::clone(&self.done);
        let cancel = self.cancel.clone();
        let interval = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if !registered.load(Ordering::Acquire) {
                    continue;
                }

                let requests: Vec<ContainerRequest> = {
                    let mut pending = pending.lock().await;
                    pending.drain(..).collect()
                };
                let progress = if done.load(Ordering::Acquire) { 1.0 } else { 0.0 };

                match protocol.allocate(requests, progress).await {
                    Ok(response) => {
                        if !response.allocated.is_empty() {
                            let _ = events.send(RmEvent::ContainersAllocated(response.allocated));
                        }
                        if !response.completed.is_empty() {
                            let _ = events.send(RmEvent::ContainersCompleted(response.completed));
                        }
                        if !response.updated_nodes.is_empty() {
                            let _ = events.send(RmEvent::NodesUpdated(response.updated_nodes));
                        }
                        if response.shutdown_requested {
                            done.store(true, Ordering::Release);
                            let _ = events.send(RmEvent::ShutdownRequested);
                        }
                    }
                    Err(error) => {
                        tracing::error!(error = %error, "Resource manager heartbeat failed");
                        done.store(true, Ordering::Release);
                        let _ = events.send(RmEvent::TransportError(error.to_string()));
                        break;
                    }
                }
            }
        });
    }

    /// Register the application master. Synchronous from the caller's point
    /// of view; heartbeats begin once this returns.
    pub async fn register(
        &self,
        host: &str,
        rpc_port: i32,
        tracking_url: &str,
    ) -> Result<Registration> {
        let registration = self
            .protocol
            .register_application_master(host, rpc_port, tracking_url)
            .await?;
        self.registered.store(true, Ordering::Release);
        Ok(registration)
    }

    /// Queue a container request for the next heartbeat.
    pub async fn request_container(&self, request: ContainerRequest) {
        self.pending.lock().await.push(request);
    }

    pub async fn unregister(
        &self,
        status: FinalStatus,
        diagnostics: &str,
        tracking_url: &str,
    ) -> Result<()> {
        self.protocol
            .unregister_application_master(status, diagnostics, tracking_url)
            .await
    }

    /// Stop the heartbeat task.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
