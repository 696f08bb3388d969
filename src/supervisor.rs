//! The container supervisor: registers the application master, fills the
//! fleet, replaces failed containers, and drains everything on shutdown.
//!
//! The supervisor is an actor. [`FleetSupervisor::start`] performs the
//! synchronous phase (registration and the initial fill) and
//! [`FleetSupervisor::run`] services resource-manager callbacks,
//! node-manager callbacks, and control events from the event bus in a single
//! event loop, which makes it the only writer of [`FleetState`].

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify, RwLock, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cluster::fs::ClusterFs;
use crate::cluster::nm::{NmEvent, NmProtocol, NodeManagerClient};
use crate::cluster::rm::{AmRmClient, AmRmProtocol, RmEvent};
use crate::cluster::types::{
    Capability, ContainerDescriptor, ContainerId, ContainerRequest, ContainerState,
    ContainerStatus, ExitStatus, FinalStatus,
};
use crate::config::SupervisorConfig;
use crate::credentials::{pack_credentials, Credentials};
use crate::error::Result;
use crate::event::{ControlEvent, EventBus};
use crate::identity::InstanceRegistry;
use crate::launch::ContextBuilder;

/// Containers whose launch contexts are built concurrently.
const LAUNCH_POOL_SIZE: usize = 10;

/// Lifecycle phase of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// A tracked container, bound to the worker instance it runs.
#[derive(Debug, Clone)]
pub struct ContainerSlot {
    pub descriptor: ContainerDescriptor,
    pub instance: String,
}

/// Supervisor state. The event loop is the single writer; other tasks may
/// read for observation.
#[derive(Debug)]
pub struct FleetState {
    pub phase: Phase,
    pub containers: HashMap<ContainerId, ContainerSlot>,
    pub instances: InstanceRegistry,
    pub max_capability: Option<Capability>,
}

pub struct FleetSupervisor {
    config: SupervisorConfig,
    state: Arc<RwLock<FleetState>>,
    bus: Arc<EventBus>,
    rm: Arc<AmRmClient>,
    nm: Arc<NodeManagerClient>,
    launcher: Arc<ContextBuilder>,
    launch_permits: Arc<Semaphore>,
    drained: Arc<Notify>,
    rm_events: mpsc::UnboundedReceiver<RmEvent>,
    nm_events: mpsc::UnboundedReceiver<NmEvent>,
    control_events: mpsc::UnboundedReceiver<ControlEvent>,
}

impl FleetSupervisor {
    /// Wire the supervisor to its collaborators. Credentials, when given,
    /// are packed once here and a duplicate is attached to every launch
    /// context.
    pub fn new(
        config: SupervisorConfig,
        rm_protocol: Arc<dyn AmRmProtocol>,
        nm_protocol: Arc<dyn NmProtocol>,
        fs: Arc<dyn ClusterFs>,
        credentials: Option<Credentials>,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let tokens = match credentials {
            Some(credentials) => Some(pack_credentials(&credentials)?),
            None => None,
        };

        let (rm, rm_events) = AmRmClient::new(rm_protocol, config.heartbeat_interval);
        let (nm, nm_events) = NodeManagerClient::new(nm_protocol);
        let control_events = bus.subscribe();

        let state = FleetState {
            phase: Phase::Starting,
            containers: HashMap::new(),
            instances: InstanceRegistry::new(config.process_kind(), config.max_instance_retries),
            max_capability: None,
        };
        let launcher = ContextBuilder::new(config.clone(), fs, tokens);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(state)),
            bus,
            rm: Arc::new(rm),
            nm: Arc::new(nm),
            launcher: Arc::new(launcher),
            launch_permits: Arc::new(Semaphore::new(LAUNCH_POOL_SIZE)),
            drained: Arc::new(Notify::new()),
            rm_events,
            nm_events,
            control_events,
        })
    }

    /// Shared view of the supervisor state, for observation only.
    pub fn state(&self) -> Arc<RwLock<FleetState>> {
        Arc::clone(&self.state)
    }

    /// Node manager client handle, for status queries by the host.
    pub fn node_manager(&self) -> Arc<NodeManagerClient> {
        Arc::clone(&self.nm)
    }

    /// Notified when the container record becomes empty.
    pub fn drained_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.drained)
    }

    /// Register with the resource manager, record the cluster capability,
    /// and request the initial fleet. Errors here propagate to the caller;
    /// everything handled by [`run`](Self::run) is logged and absorbed.
    pub async fn start(&self) -> Result<()> {
        tracing::info!(
            application = %self.config.application_name,
            "Starting the fleet supervisor"
        );

        self.rm.start();

        let registration = self.rm.register(&self.config.am_hostname, -1, "").await?;
        tracing::info!(
            max_memory_mbs = registration.maximum_capability.memory_mbs,
            max_vcores = registration.maximum_capability.vcores,
            "Application master registered"
        );
        {
            let mut state = self.state.write().await;
            state.max_capability = Some(registration.maximum_capability);
            state.phase = Phase::Running;
        }

        tracing::info!(
            count = self.config.initial_containers,
            "Requesting initial containers"
        );
        for _ in 0..self.config.initial_containers {
            self.issue_container_request(None).await;
        }
        Ok(())
    }

    /// Drive the supervisor until shutdown, then drain the fleet and
    /// unregister. Shutdown comes from the caller's token, from the resource
    /// manager, or from an `ApplicationMasterShutdownRequest` on the bus.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested by the caller");
                    break;
                }
                Some(event) = self.rm_events.recv() => {
                    if self.handle_rm_event(event).await.is_break() {
                        break;
                    }
                }
                Some(event) = self.nm_events.recv() => {
                    self.handle_nm_event(event).await;
                }
                Some(event) = self.control_events.recv() => {
                    if self.handle_control_event(event).await.is_break() {
                        break;
                    }
                }
            }
        }
        self.shut_down().await;
    }

    async fn handle_rm_event(&mut self, event: RmEvent) -> ControlFlow<()> {
        match event {
            RmEvent::ContainersAllocated(containers) => {
                for container in containers {
                    self.handle_container_allocation(container).await;
                }
            }
            RmEvent::ContainersCompleted(statuses) => {
                for status in statuses {
                    self.handle_container_completion(status).await;
                }
            }
            RmEvent::NodesUpdated(reports) => {
                for report in reports {
                    tracing::info!(node = %report.node, state = %report.state, "Received node update report");
                }
            }
            RmEvent::ShutdownRequested => {
                tracing::info!("Received shutdown request from the resource manager");
                self.bus.publish(ControlEvent::ApplicationMasterShutdownRequest);
                return ControlFlow::Break(());
            }
            RmEvent::TransportError(error) => {
                tracing::error!(error = %error, "Resource manager channel failed");
                self.bus.publish(ControlEvent::ApplicationMasterShutdownRequest);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_nm_event(&mut self, event: NmEvent) {
        match event {
            NmEvent::ContainerStarted(container_id) => {
                tracing::info!(container_id = %container_id, "Container started");
            }
            NmEvent::StatusReceived(status) => {
                tracing::info!(
                    container_id = %status.container_id,
                    state = ?status.state,
                    "Received container status"
                );
                if status.state == ContainerState::Complete {
                    self.handle_container_completion(status).await;
                }
            }
            NmEvent::ContainerStopped(container_id) => {
                tracing::info!(container_id = %container_id, "Container stopped");
                let mut state = self.state.write().await;
                state.containers.remove(&container_id);
                if state.containers.is_empty() {
                    self.drained.notify_waiters();
                }
            }
            NmEvent::StartError {
                container_id,
                error,
            } => {
                tracing::error!(container_id = %container_id, error = %error, "Failed to start container");
                self.state.write().await.containers.remove(&container_id);
            }
            NmEvent::StatusError {
                container_id,
                error,
            } => {
                tracing::error!(container_id = %container_id, error = %error, "Failed to get container status");
            }
            NmEvent::StopError {
                container_id,
                error,
            } => {
                tracing::error!(container_id = %container_id, error = %error, "Failed to stop container");
            }
        }
    }

    async fn handle_control_event(&mut self, event: ControlEvent) -> ControlFlow<()> {
        match event {
            ControlEvent::NewContainerRequest { replaced_container } => {
                self.issue_container_request(replaced_container.map(|c| c.node.host))
                    .await;
            }
            ControlEvent::ContainerShutdownRequest { containers } => {
                for container in containers {
                    tracing::info!(
                        container_id = %container.id,
                        node = %container.node,
                        "Stopping container"
                    );
                    self.nm.stop_container(container.id, container.node);
                }
            }
            ControlEvent::ApplicationMasterShutdownRequest => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// Bind the allocated container to a worker instance and hand the launch
    /// off to the pool. The binding happens before the asynchronous start so
    /// node manager callbacks always find the record.
    async fn handle_container_allocation(&mut self, container: ContainerDescriptor) {
        tracing::info!(container_id = %container.id, node = %container.node, "Container allocated");

        let instance = {
            let mut state = self.state.write().await;
            let instance = state.instances.acquire();
            state.containers.insert(
                container.id.clone(),
                ContainerSlot {
                    descriptor: container.clone(),
                    instance: instance.clone(),
                },
            );
            instance
        };

        let permits = Arc::clone(&self.launch_permits);
        let launcher = Arc::clone(&self.launcher);
        let nm = Arc::clone(&self.nm);
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            tracing::info!(container_id = %container.id, instance = %instance, "Starting container");
            match launcher.build(&container, &instance).await {
                Ok(context) => nm.start_container(&container, context).await,
                Err(error) => {
                    // The record stays; the resource manager will report the
                    // never-started container as completed and the normal
                    // completion path cleans up.
                    tracing::error!(
                        container_id = %container.id,
                        error = %error,
                        "Failed to build the launch context"
                    );
                }
            }
        });
    }

    /// Take the single replacement decision for a completed container:
    /// either request a replacement (with or without node affinity) or
    /// retire the instance. Record removal makes the second delivery of the
    /// same completion a no-op.
    async fn handle_container_completion(&mut self, status: ContainerStatus) {
        let (slot, retry_count, exhausted) = {
            let mut state = self.state.write().await;
            let slot = match state.containers.remove(&status.container_id) {
                Some(slot) => slot,
                None => return,
            };
            let retry_count = state.instances.record_completion(&slot.instance);
            let exhausted = state.instances.is_exhausted(retry_count);
            if !exhausted {
                state.instances.release(slot.instance.clone());
            }
            (slot, retry_count, exhausted)
        };

        tracing::info!(
            container_id = %status.container_id,
            instance = %slot.instance,
            exit_code = status.exit_status.code(),
            "Container completed"
        );
        if !status.diagnostics.is_empty() {
            tracing::info!(
                container_id = %status.container_id,
                diagnostics = %status.diagnostics,
                "Received diagnostics for completed container"
            );
        }

        if exhausted {
            tracing::warn!(
                instance = %slot.instance,
                retries = retry_count,
                "Maximum number of retries reached, retiring instance"
            );
            return;
        }

        tracing::info!(
            container_id = %status.container_id,
            instance = %slot.instance,
            "Requesting a replacement container"
        );
        let replaced_container = if self.should_stick_to_same_node(status.exit_status) {
            Some(slot.descriptor)
        } else {
            None
        };
        self.bus
            .publish(ControlEvent::NewContainerRequest { replaced_container });
    }

    /// Disk and abort exits usually mean the node itself failed, so a
    /// replacement must not be pinned to it.
    fn should_stick_to_same_node(&self, exit_status: ExitStatus) -> bool {
        match exit_status {
            ExitStatus::DisksFailed | ExitStatus::Aborted => false,
            _ => self.config.container_host_affinity_enabled,
        }
    }

    /// Queue one container request, clamped to the cluster maximum. Dropped
    /// with an error log when the maximum is not yet known, and refused once
    /// the supervisor is stopping.
    async fn issue_container_request(&self, preferred_node: Option<String>) {
        let capability = {
            let state = self.state.read().await;
            if state.phase == Phase::Stopping || state.phase == Phase::Stopped {
                return;
            }
            match &state.max_capability {
                Some(max) => {
                    Capability::new(self.config.container_memory_mbs, self.config.container_cores)
                        .clamp_to(max)
                }
                None => {
                    tracing::error!(
                        memory_mbs = self.config.container_memory_mbs,
                        vcores = self.config.container_cores,
                        "Unable to request a container before the maximum resource capability is known"
                    );
                    return;
                }
            }
        };

        self.rm
            .request_container(ContainerRequest {
                capability,
                preferred_nodes: preferred_node.into_iter().collect(),
                priority: 0,
            })
            .await;
    }

    /// Stop every tracked container, wait for the record to drain (bounded
    /// by the stop timeout), then unregister. Unregister failures are logged
    /// and suppressed so resource release always happens.
    async fn shut_down(&mut self) {
        tracing::info!("Stopping the fleet supervisor");

        let slots: Vec<ContainerSlot> = {
            let mut state = self.state.write().await;
            state.phase = Phase::Stopping;
            state.containers.values().cloned().collect()
        };

        for slot in &slots {
            tracing::info!(
                container_id = %slot.descriptor.id,
                instance = %slot.instance,
                "Stopping container"
            );
            self.nm
                .stop_container(slot.descriptor.id.clone(), slot.descriptor.node.clone());
        }

        if !slots.is_empty() {
            self.wait_for_drain().await;
        }

        if let Err(error) = self.rm.unregister(FinalStatus::Succeeded, "", "").await {
            tracing::error!(error = %error, "Failed to unregister the application master");
        }

        self.rm.stop();
        self.nm.stop();

        let mut state = self.state.write().await;
        state.phase = Phase::Stopped;
        tracing::info!("Fleet supervisor stopped");
    }

    /// Service node manager callbacks until the container record drains or
    /// the stop timeout elapses.
    async fn wait_for_drain(&mut self) {
        let deadline = Instant::now() + self.config.stop_timeout;
        loop {
            if self.state.read().await.containers.is_empty() {
                tracing::info!("All of the containers have been stopped");
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let remaining = self.state.read().await.containers.len();
                    tracing::warn!(remaining, "Timed out waiting for containers to stop");
                    return;
                }
                Some(event) = self.nm_events.recv() => {
                    self.handle_nm_event(event).await;
                }
            }
        }
    }
}
