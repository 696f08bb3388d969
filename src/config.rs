use std::time::Duration;

/// Configuration of the container supervisor. The hosting application master
/// loads these values from its own configuration surface and hands them over
/// as a plain struct.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Name of the application as known to the cluster.
    pub application_name: String,
    /// Resource-manager-assigned application id.
    pub application_id: String,
    /// Hostname published to the resource manager at registration.
    pub am_hostname: String,
    /// Number of containers requested right after registration.
    pub initial_containers: u32,
    /// Requested per-container memory, clamped to the cluster maximum.
    pub container_memory_mbs: u32,
    /// Requested per-container virtual cores, clamped to the cluster maximum.
    pub container_cores: u32,
    /// Whether replacement containers prefer the node of the container they
    /// replace.
    pub container_host_affinity_enabled: bool,
    /// Completions tolerated per worker instance before it is retired.
    /// 0 disables the cap.
    pub max_instance_retries: u32,
    /// Extra JVM arguments appended verbatim to the worker command line.
    pub container_jvm_args: Option<String>,
    /// Comma-separated remote file URIs to localize into every container.
    pub container_files_remote: Option<String>,
    /// Fully-qualified main class of the worker process.
    pub worker_class: String,
    /// Cluster-filesystem root under which the application work directory lives.
    pub app_work_root: String,
    /// Cadence of the resource-manager heartbeat.
    pub heartbeat_interval: Duration,
    /// How long the stop sequence waits for the fleet to drain.
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            application_name: "application".to_string(),
            application_id: "application_0000".to_string(),
            am_hostname: "localhost".to_string(),
            initial_containers: 1,
            container_memory_mbs: 1024,
            container_cores: 1,
            container_host_affinity_enabled: true,
            max_instance_retries: 0,
            container_jvm_args: None,
            container_files_remote: None,
            worker_class: "com.example.FleetWorker".to_string(),
            app_work_root: "/apps".to_string(),
            heartbeat_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl SupervisorConfig {
    pub fn new(application_name: impl Into<String>, application_id: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            application_id: application_id.into(),
            ..Default::default()
        }
    }

    pub fn with_initial_containers(mut self, count: u32) -> Self {
        self.initial_containers = count;
        self
    }

    pub fn with_capability(mut self, memory_mbs: u32, cores: u32) -> Self {
        self.container_memory_mbs = memory_mbs;
        self.container_cores = cores;
        self
    }

    pub fn with_host_affinity(mut self, enabled: bool) -> Self {
        self.container_host_affinity_enabled = enabled;
        self
    }

    pub fn with_max_instance_retries(mut self, retries: u32) -> Self {
        self.max_instance_retries = retries;
        self
    }

    /// Short name of the worker process, used for instance names and log
    /// file names. The final segment of the worker class path.
    pub fn process_kind(&self) -> &str {
        self.worker_class
            .rsplit('.')
            .next()
            .unwrap_or(&self.worker_class)
    }
}
