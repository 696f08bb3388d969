//! Builds the per-container launch descriptor: files to localize,
//! environment, the worker command line, and security tokens.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cluster::fs::{ClusterFs, FileStat};
use crate::cluster::types::ContainerDescriptor;
use crate::config::SupervisorConfig;
use crate::credentials::TokenBlob;
use crate::error::Result;

/// Expansion variable the node manager substitutes with the container log
/// directory at launch time.
pub const LOG_DIR_EXPANSION: &str = "<LOG_DIR>";

/// Shared library jars, directly under the application work directory.
const APP_LIB_DIR: &str = "_applib";
/// Container payload directory under the application work directory.
const CONTAINER_WORK_DIR: &str = "container";
/// Application jars under the container work directory.
const APP_JARS_DIR: &str = "jars";
/// Application files under the container work directory.
const APP_FILES_DIR: &str = "files";

/// A file to localize into the container working directory before launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalResource {
    pub url: String,
    pub size: u64,
    pub timestamp_ms: i64,
}

/// Everything the node manager needs to launch a worker process.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub local_resources: HashMap<String, LocalResource>,
    pub environment: HashMap<String, String>,
    pub command: String,
    pub tokens: Option<TokenBlob>,
}

/// Builds launch contexts for allocated containers.
pub struct ContextBuilder {
    config: SupervisorConfig,
    fs: Arc<dyn ClusterFs>,
    tokens: Option<TokenBlob>,
}

impl ContextBuilder {
    pub fn new(
        config: SupervisorConfig,
        fs: Arc<dyn ClusterFs>,
        tokens: Option<TokenBlob>,
    ) -> Self {
        Self { config, fs, tokens }
    }

    pub async fn build(
        &self,
        container: &ContainerDescriptor,
        instance_name: &str,
    ) -> Result<LaunchContext> {
        let app_work_dir = format!(
            "{}/{}/{}",
            self.config.app_work_root, self.config.application_name, self.config.application_id
        );
        let container_work_dir = format!("{}/{}", app_work_dir, CONTAINER_WORK_DIR);

        let mut resources = HashMap::new();
        self.add_directory_resources(&format!("{}/{}", app_work_dir, APP_LIB_DIR), &mut resources)
            .await?;
        self.add_directory_resources(
            &format!("{}/{}", container_work_dir, APP_JARS_DIR),
            &mut resources,
        )
        .await?;
        self.add_directory_resources(
            &format!("{}/{}", container_work_dir, APP_FILES_DIR),
            &mut resources,
        )
        .await?;
        if let Some(file_list) = &self.config.container_files_remote {
            self.add_remote_files(file_list, &mut resources).await?;
        }

        Ok(LaunchContext {
            local_resources: resources,
            environment: self.environment(),
            command: self.build_command(container, instance_name),
            tokens: self.tokens.as_ref().map(TokenBlob::duplicate),
        })
    }

    async fn add_directory_resources(
        &self,
        dir: &str,
        resources: &mut HashMap<String, LocalResource>,
    ) -> Result<()> {
        if !self.fs.exists(dir).await? {
            tracing::warn!(path = dir, "Path does not exist, no container resources to add");
            return Ok(());
        }
        for status in self.fs.list_status(dir).await? {
            Self::add_resource(status, resources);
        }
        Ok(())
    }

    async fn add_remote_files(
        &self,
        file_list: &str,
        resources: &mut HashMap<String, LocalResource>,
    ) -> Result<()> {
        for path in file_list
            .split(',')
            .map(str::trim)
            .filter(|path| !path.is_empty())
        {
            let status = self.fs.file_status(path).await?;
            Self::add_resource(status, resources);
        }
        Ok(())
    }

    fn add_resource(status: FileStat, resources: &mut HashMap<String, LocalResource>) {
        let name = status
            .path
            .rsplit('/')
            .next()
            .unwrap_or(status.path.as_str())
            .to_string();
        resources.insert(
            name,
            LocalResource {
                url: status.path,
                size: status.len,
                timestamp_ms: status.modified_ms,
            },
        );
    }

    /// Cluster-standard classpath and path additions for the worker process.
    fn environment(&self) -> HashMap<String, String> {
        let mut environment = HashMap::new();
        environment.insert(
            "CLASSPATH".to_string(),
            format!("./*:./{}/*:./{}:$CLASSPATH", APP_JARS_DIR, APP_FILES_DIR),
        );
        environment.insert("PATH".to_string(), "$JAVA_HOME/bin:$PATH".to_string());
        environment
    }

    /// The worker command line. Max heap follows the granted memory, not the
    /// requested memory.
    fn build_command(&self, container: &ContainerDescriptor, instance_name: &str) -> String {
        let process = self.config.process_kind();
        let mut command = format!(
            "$JAVA_HOME/bin/java -Xmx{}M",
            container.capability.memory_mbs
        );
        if let Some(jvm_args) = &self.config.container_jvm_args {
            command.push(' ');
            command.push_str(jvm_args);
        }
        command.push(' ');
        command.push_str(&self.config.worker_class);
        command.push_str(&format!(
            " --application-name {}",
            self.config.application_name
        ));
        command.push_str(&format!(" --helix-instance-name {}", instance_name));
        command.push_str(&format!(
            " 1>{log_dir}/{process}.stdout 2>{log_dir}/{process}.stderr",
            log_dir = LOG_DIR_EXPANSION,
            process = process
        ));
        command
    }
}
