use std::fmt;

/// Opaque container identifier assigned by the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of the node manager owning a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub host: String,
    pub port: u16,
}

impl NodeId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A (memory, virtual cores) pair advertised and enforced by the resource
/// manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub memory_mbs: u32,
    pub vcores: u32,
}

impl Capability {
    pub fn new(memory_mbs: u32, vcores: u32) -> Self {
        Self { memory_mbs, vcores }
    }

    /// Clamp each dimension to the given maximum.
    pub fn clamp_to(&self, max: &Capability) -> Capability {
        Capability {
            memory_mbs: self.memory_mbs.min(max.memory_mbs),
            vcores: self.vcores.min(max.vcores),
        }
    }
}

/// A granted execution slot: where it runs and what it may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub id: ContainerId,
    pub node: NodeId,
    pub capability: Capability,
    pub priority: i32,
}

/// Exit status of a completed container as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    /// Released or lost through a resource-manager decision, usually node
    /// failure.
    Aborted,
    /// The node's local disks went bad.
    DisksFailed,
    /// Process exit with the given code.
    Failed(i32),
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Aborted => -100,
            ExitStatus::DisksFailed => -101,
            ExitStatus::Failed(code) => *code,
        }
    }
}

/// Observed state of a container on its node manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    New,
    Running,
    Complete,
}

/// Status report for a container, delivered both by the resource manager's
/// completion callback and by node-manager status queries.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub container_id: ContainerId,
    pub state: ContainerState,
    pub exit_status: ExitStatus,
    pub diagnostics: String,
}

/// Terminal status reported when unregistering the application master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    Succeeded,
    Failed,
    Killed,
}

/// Registration response from the resource manager.
#[derive(Debug, Clone)]
pub struct Registration {
    pub maximum_capability: Capability,
}

/// A request for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRequest {
    pub capability: Capability,
    /// Hostnames the scheduler should prefer; empty means anywhere.
    pub preferred_nodes: Vec<String>,
    pub priority: i32,
}

/// Health report for a cluster node, delivered with allocate responses.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub node: NodeId,
    pub state: String,
}
